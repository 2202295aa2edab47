mod store;

pub use store::{MemoryConfig, MemoryStore};
