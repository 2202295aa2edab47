//! Cache key derivation
//!
//! Turns a request context into a collision-resistant, hierarchical key
//! string. Four strategies share the same sanitization and length-cap
//! rules; only `[A-Za-z0-9:_\-.]` survive into a key.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use sha2::{Digest, Sha256};

use rescache_core::{ApiVerb, KeyStrategy, RequestContext};

/// Configuration for the key generator
#[derive(Debug, Clone)]
pub struct KeyGeneratorConfig {
    /// Prepended to every key
    pub prefix: String,
    pub strategy: KeyStrategy,
    /// Keys longer than this get a digest tail
    pub max_length: usize,
    /// Partition keys by the context's user/tenant scope
    pub include_scope: bool,
    /// When set, keys carry a time-window token of this width
    pub time_window: Option<Duration>,
    /// Parameter names excluded from signatures
    pub ignored_params: HashSet<String>,
}

impl Default for KeyGeneratorConfig {
    fn default() -> Self {
        Self {
            prefix: "rescache".to_string(),
            strategy: KeyStrategy::Hierarchical,
            max_length: 250,
            include_scope: true,
            time_window: None,
            ignored_params: HashSet::new(),
        }
    }
}

/// Deterministic key generator
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    config: KeyGeneratorConfig,
}

impl KeyGenerator {
    pub fn new(config: KeyGeneratorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(KeyGeneratorConfig::default())
    }

    /// Generate a key for the context under the configured strategy
    pub fn generate(&self, ctx: &RequestContext) -> String {
        self.generate_with_prefix(ctx, &self.config.prefix)
    }

    /// Generate a key using an explicit prefix (per-entity override)
    pub fn generate_with_prefix(&self, ctx: &RequestContext, prefix: &str) -> String {
        let raw = match self.config.strategy {
            KeyStrategy::Simple => self.simple_key(ctx, prefix),
            KeyStrategy::Hash => self.hash_key(ctx, prefix),
            KeyStrategy::Hierarchical => self.hierarchical_key(ctx, prefix),
            KeyStrategy::Semantic => self.semantic_key(ctx, prefix),
        };
        self.cap_length(sanitize(&raw))
    }

    /// Glob pattern matching every key of an entity type
    pub fn entity_pattern(&self, entity_type: &str) -> String {
        format!("{}:{}:*", self.config.prefix, sanitize(entity_type))
    }

    /// Key of the tag index set for `tag`
    pub fn tag_key(&self, tag: &str) -> String {
        format!("{}:tags:{}", self.config.prefix, sanitize(tag))
    }

    /// Extract the entity-type label from a well-formed key
    pub fn extract_entity(&self, key: &str) -> Option<String> {
        let rest = key.strip_prefix(&self.config.prefix)?.strip_prefix(':')?;
        let entity = rest.split(':').next()?;
        (!entity.is_empty()).then(|| entity.to_string())
    }

    /// Prefix configured for this generator
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    fn simple_key(&self, ctx: &RequestContext, prefix: &str) -> String {
        let mut key = format!(
            "{}:{}:{}:{}",
            prefix,
            ctx.entity_type,
            ctx.verb.as_str(),
            normalize_endpoint(&ctx.endpoint).join("_")
        );
        let params = self.significant_params(ctx);
        if !params.is_empty() {
            let serialized: Vec<String> = params
                .iter()
                .map(|(k, v)| format!("{k}={}", compact_value(v)))
                .collect();
            key.push(':');
            key.push_str(&serialized.join("&"));
        }
        if ctx.verb.is_write() {
            if let Some(body) = &ctx.body {
                key.push(':');
                key.push_str(&digest_hex(&body.to_string(), 8));
            }
        }
        key
    }

    fn hash_key(&self, ctx: &RequestContext, prefix: &str) -> String {
        let canonical = serde_json::json!({
            "verb": ctx.verb.as_str(),
            "endpoint": normalize_endpoint(&ctx.endpoint).join("/"),
            "entity": ctx.entity_type,
            "params": self.significant_params(ctx)
                .into_iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<serde_json::Map<String, Value>>(),
            "body": ctx.body,
            "scope": ctx.scope,
        });
        format!(
            "{}:{}:{}",
            prefix,
            ctx.entity_type,
            digest_hex(&canonical.to_string(), 16)
        )
    }

    fn hierarchical_key(&self, ctx: &RequestContext, prefix: &str) -> String {
        let mut parts = vec![
            prefix.to_string(),
            ctx.entity_type.clone(),
            ctx.verb.as_str().to_string(),
        ];
        parts.extend(normalize_endpoint(&ctx.endpoint));

        let params = self.significant_params(ctx);
        if !params.is_empty() {
            let serialized: Vec<String> = params
                .iter()
                .map(|(k, v)| format!("{k}={}", compact_value(v)))
                .collect();
            parts.push(digest_hex(&serialized.join("&"), 12));
        }
        if let Some(body) = &ctx.body {
            parts.push("body".to_string());
            parts.push(digest_hex(&body.to_string(), 8));
        }
        if self.config.include_scope {
            if let Some(scope) = &ctx.scope {
                parts.push("user".to_string());
                parts.push(digest_hex(scope, 8));
            }
        }
        if let Some(window) = self.config.time_window {
            let secs = ctx
                .timestamp
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            parts.push(format!("t:{}", secs / window.as_secs().max(1)));
        }
        parts.join(":")
    }

    fn semantic_key(&self, ctx: &RequestContext, prefix: &str) -> String {
        let mut parts = vec![
            prefix.to_string(),
            ctx.entity_type.clone(),
            ctx.verb.as_str().to_string(),
        ];
        let params = &ctx.params;

        if params.contains_key("search") || params.contains_key("query") {
            parts.push("search".to_string());
        }
        if params.contains_key("id") {
            parts.push("single".to_string());
        } else if ctx.verb == ApiVerb::Read {
            parts.push("list".to_string());
        }
        if params.contains_key("filter") {
            parts.push("filtered".to_string());
        }
        if params.contains_key("sort") || params.contains_key("orderBy") {
            parts.push("sorted".to_string());
        }
        if let Some(n) = params
            .get("top")
            .or_else(|| params.get("limit"))
            .and_then(Value::as_u64)
        {
            parts.push(format!("top{n}"));
        }
        if params.contains_key("page") || params.contains_key("offset") {
            parts.push("paged".to_string());
        }
        if params.contains_key("companyId") || params.contains_key("company_id") {
            parts.push("byCompany".to_string());
        }
        if let Some(status) = params.get("status") {
            parts.push(format!("status{}", digest_hex(&compact_value(status), 4)));
        }
        parts.join(":")
    }

    /// Sorted, non-null, non-ignored parameters
    fn significant_params<'a>(&self, ctx: &'a RequestContext) -> Vec<(&'a String, &'a Value)> {
        ctx.params
            .iter()
            .filter(|(k, v)| !v.is_null() && !self.config.ignored_params.contains(*k))
            .collect()
    }

    /// Replace an over-long tail with an underscore and an 8-char digest of
    /// the full string.
    fn cap_length(&self, key: String) -> String {
        if key.len() <= self.config.max_length {
            return key;
        }
        let digest = digest_hex(&key, 8);
        let keep = self.config.max_length.saturating_sub(digest.len() + 1);
        // Sanitized keys are ASCII, so byte slicing is char-safe. Trailing
        // underscores are trimmed so the digest separator stays single.
        format!("{}_{}", key[..keep].trim_end_matches('_'), digest)
    }
}

fn digest_hex(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(len);
    hex
}

/// A scalar rendering of a parameter value, stable across runs
fn compact_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strip slashes, drop API-version segments, replace numeric IDs and UUIDs,
/// lowercase.
fn normalize_endpoint(endpoint: &str) -> Vec<String> {
    endpoint
        .split('/')
        .filter(|s| !s.is_empty())
        .filter(|s| !is_version_segment(s))
        .map(|s| {
            if is_numeric_segment(s) {
                "{id}".to_string()
            } else if is_uuid_segment(s) {
                "{uuid}".to_string()
            } else {
                s.to_ascii_lowercase()
            }
        })
        .collect()
}

fn is_version_segment(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some('v' | 'V'))
        && s.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

fn is_numeric_segment(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn is_uuid_segment(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    s.char_indices().all(|(i, c)| match i {
        8 | 13 | 18 | 23 => c == '-',
        _ => c.is_ascii_hexdigit(),
    })
}

/// Collapse disallowed characters to `_` and runs of `_` to one.
fn sanitize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_underscore = false;
    for c in key.chars() {
        let mapped = match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | ':' | '_' | '-' | '.' => c,
            _ => '_',
        };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(mapped);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rescache_core::KeyStrategy;
    use serde_json::json;

    fn generator(strategy: KeyStrategy) -> KeyGenerator {
        KeyGenerator::new(KeyGeneratorConfig {
            prefix: "app".to_string(),
            strategy,
            ..Default::default()
        })
    }

    fn read_ctx() -> RequestContext {
        RequestContext::read("companies", "/v1/companies/42").param("id", 42)
    }

    #[test]
    fn test_deterministic() {
        for strategy in [
            KeyStrategy::Simple,
            KeyStrategy::Hash,
            KeyStrategy::Hierarchical,
            KeyStrategy::Semantic,
        ] {
            let g = generator(strategy);
            assert_eq!(g.generate(&read_ctx()), g.generate(&read_ctx()));
        }
    }

    #[test]
    fn test_hierarchical_shape() {
        let g = generator(KeyStrategy::Hierarchical);
        let key = g.generate(&read_ctx());
        // Version segment is dropped and the numeric id is templated.
        assert!(key.starts_with("app:companies:read:companies:{id}"));
        assert!(!key.contains("v1"));
    }

    #[test]
    fn test_differing_params_differ() {
        let g = generator(KeyStrategy::Hierarchical);
        let a = g.generate(&RequestContext::read("tickets", "/tickets").param("page", 1));
        let b = g.generate(&RequestContext::read("tickets", "/tickets").param("page", 2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_differing_endpoints_differ() {
        let g = generator(KeyStrategy::Hierarchical);
        let a = g.generate(&RequestContext::read("companies", "/companies/1/contacts"));
        let b = g.generate(&RequestContext::read("companies", "/companies/1/tickets"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_differing_verbs_differ() {
        let g = generator(KeyStrategy::Hierarchical);
        let a = g.generate(&RequestContext::read("companies", "/companies/1"));
        let b = g.generate(&RequestContext::delete("companies", "/companies/1"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_null_params_are_ignored() {
        let g = generator(KeyStrategy::Hierarchical);
        let a = g.generate(&RequestContext::read("tickets", "/tickets"));
        let b = g.generate(
            &RequestContext::read("tickets", "/tickets").param("filter", Value::Null),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_scope_partitions_keys() {
        let g = generator(KeyStrategy::Hierarchical);
        let a = g.generate(&RequestContext::read("tickets", "/tickets").scope("tenant-a"));
        let b = g.generate(&RequestContext::read("tickets", "/tickets").scope("tenant-b"));
        assert_ne!(a, b);
        assert!(a.contains(":user:"));
    }

    #[test]
    fn test_uuid_segment_is_templated() {
        let g = generator(KeyStrategy::Hierarchical);
        let key = g.generate(&RequestContext::read(
            "contacts",
            "/contacts/550e8400-e29b-41d4-a716-446655440000",
        ));
        assert!(key.contains("{uuid}"));
    }

    #[test]
    fn test_sanitize_collapses_runs() {
        assert_eq!(sanitize("a b?c"), "a_b_c");
        assert_eq!(sanitize("a  ??  b"), "a_b");
        assert!(!sanitize("x@@y").contains("__"));
    }

    #[test]
    fn test_length_cap_appends_digest() {
        let g = generator(KeyStrategy::Hierarchical);
        let long_endpoint = format!("/tickets/{}", "segment/".repeat(60));
        let key = g.generate(&RequestContext::read("tickets", &long_endpoint));
        assert!(key.len() <= 250);
        let tail = &key[key.len() - 9..];
        assert!(tail.starts_with('_'));
        assert!(tail[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_strategy_shape() {
        let g = generator(KeyStrategy::Hash);
        let key = g.generate(&read_ctx());
        let hash = key.rsplit(':').next().unwrap();
        assert_eq!(hash.len(), 16);
        assert!(key.starts_with("app:companies:"));
    }

    #[test]
    fn test_semantic_tokens() {
        let g = generator(KeyStrategy::Semantic);

        let single = g.generate(&RequestContext::read("companies", "/companies/1").param("id", 1));
        assert!(single.contains(":single"));

        let list = g.generate(
            &RequestContext::read("tickets", "/tickets")
                .param("limit", 25)
                .param("page", 2)
                .param("sort", "createdAt"),
        );
        assert!(list.contains(":list"));
        assert!(list.contains(":sorted"));
        assert!(list.contains(":top25"));
        assert!(list.contains(":paged"));

        let search = g.generate(
            &RequestContext::read("tickets", "/tickets")
                .param("search", "printer")
                .param("companyId", 7)
                .param("status", "open"),
        );
        assert!(search.contains(":search"));
        assert!(search.contains(":byCompany"));
        assert!(search.contains(":status"));
    }

    #[test]
    fn test_write_body_affects_simple_key() {
        let g = generator(KeyStrategy::Simple);
        let a = g.generate(
            &RequestContext::create("tickets", "/tickets").body(json!({"title": "a"})),
        );
        let b = g.generate(
            &RequestContext::create("tickets", "/tickets").body(json!({"title": "b"})),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_entity_pattern_and_tag_key() {
        let g = generator(KeyStrategy::Hierarchical);
        assert_eq!(g.entity_pattern("companies"), "app:companies:*");
        assert_eq!(g.tag_key("company"), "app:tags:company");
    }

    #[test]
    fn test_extract_entity() {
        let g = generator(KeyStrategy::Hierarchical);
        let key = g.generate(&read_ctx());
        assert_eq!(g.extract_entity(&key), Some("companies".to_string()));
        assert_eq!(g.extract_entity("otherprefix:x:y"), None);
    }

    #[test]
    fn test_version_segment_detection() {
        assert!(is_version_segment("v1"));
        assert!(is_version_segment("v12"));
        assert!(!is_version_segment("v"));
        assert!(!is_version_segment("video"));
    }
}
