mod store;

pub use store::{FileConfig, FileStore};
