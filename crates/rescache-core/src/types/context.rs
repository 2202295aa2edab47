//! Request context: the input to key generation and TTL selection

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation verb for a request against the remote API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiVerb {
    Read,
    Create,
    Update,
    Delete,
}

impl ApiVerb {
    /// Get verb as string label (used as a key segment)
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVerb::Read => "read",
            ApiVerb::Create => "create",
            ApiVerb::Update => "update",
            ApiVerb::Delete => "delete",
        }
    }

    /// Whether this verb mutates the origin
    pub fn is_write(&self) -> bool {
        !matches!(self, ApiVerb::Read)
    }
}

/// Kind of entity-change event that triggers invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    /// Get change type as string label (compared by `__changeType` conditions)
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

/// Context describing one request against the remote API.
///
/// Parameters are kept in an ordered map so key derivation is deterministic
/// regardless of insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub verb: ApiVerb,
    pub endpoint: String,
    pub entity_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    pub body: Option<Value>,
    /// Opaque user/tenant scope; when present it partitions keys.
    pub scope: Option<String>,
    pub timestamp: SystemTime,
}

impl RequestContext {
    /// Create a context for the given verb
    pub fn new(
        verb: ApiVerb,
        entity_type: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            verb,
            endpoint: endpoint.into(),
            entity_type: entity_type.into(),
            params: BTreeMap::new(),
            body: None,
            scope: None,
            timestamp: SystemTime::now(),
        }
    }

    /// Create a READ context
    pub fn read(entity_type: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(ApiVerb::Read, entity_type, endpoint)
    }

    /// Create a WRITE_CREATE context
    pub fn create(entity_type: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(ApiVerb::Create, entity_type, endpoint)
    }

    /// Create a WRITE_UPDATE context
    pub fn update(entity_type: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(ApiVerb::Update, entity_type, endpoint)
    }

    /// Create a WRITE_DELETE context
    pub fn delete(entity_type: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(ApiVerb::Delete, entity_type, endpoint)
    }

    /// Add a single parameter
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Add multiple parameters
    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the request payload (write verbs)
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the user/tenant scope
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Whether the context carries an `id` parameter (single-entity read)
    pub fn has_id_param(&self) -> bool {
        self.params.contains_key("id")
    }

    /// Whether the context looks like a filtered or search read
    pub fn is_filtered(&self) -> bool {
        self.params.contains_key("search")
            || self.params.contains_key("filter")
            || self.params.contains_key("query")
    }
}
