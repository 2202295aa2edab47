//! Rule-driven cache invalidation
//!
//! Applies deletions in response to explicit calls or entity-change
//! events: single keys, batches, glob patterns, tag unions, and TTL
//! cleanup. Cascades follow the entity dependency map, optionally delayed;
//! rules carry dot-path conditions evaluated against the changed entity.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use rescache_core::{
    epoch_millis, CacheError, CacheEvent, CacheStore, ChangeType, EventSink, InvalidationPhase,
    Result,
};

use crate::key::KeyGenerator;

/// What to invalidate: the pattern kind plus its target payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum InvalidationTarget {
    /// Delete one key
    Single(String),
    /// Delete each listed key
    Batch(Vec<String>),
    /// Delete keys matching a `*`-wildcard glob
    Pattern(String),
    /// Delete the union of keys carrying any of the tags
    TagBased(Vec<String>),
    /// Run store cleanup of expired entries
    Ttl,
}

impl InvalidationTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            InvalidationTarget::Single(_) => "single",
            InvalidationTarget::Batch(_) => "batch",
            InvalidationTarget::Pattern(_) => "pattern",
            InvalidationTarget::TagBased(_) => "tag_based",
            InvalidationTarget::Ttl => "ttl",
        }
    }

    fn describe(&self) -> String {
        match self {
            InvalidationTarget::Single(key) => key.clone(),
            InvalidationTarget::Batch(keys) => keys.join(","),
            InvalidationTarget::Pattern(pattern) => pattern.clone(),
            InvalidationTarget::TagBased(tags) => tags.join(","),
            InvalidationTarget::Ttl => "expired".to_string(),
        }
    }
}

/// Comparison operator of an invalidation condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Contains,
    StartsWith,
    EndsWith,
}

/// A single rule condition over the changed entity's data
///
/// `field` uses dot notation for nesting; the reserved field
/// `__changeType` compares against the triggering event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationCondition {
    pub field: String,
    pub operator: ConditionOp,
    pub value: Value,
}

impl InvalidationCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOp, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    fn evaluate(&self, data: &Value, change: ChangeType) -> bool {
        let change_value;
        let actual = if self.field == "__changeType" {
            change_value = Value::String(change.as_str().to_string());
            &change_value
        } else {
            lookup_path(data, &self.field).unwrap_or(&Value::Null)
        };

        match self.operator {
            ConditionOp::Eq => actual == &self.value,
            ConditionOp::Ne => actual != &self.value,
            ConditionOp::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            ConditionOp::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            ConditionOp::Gte => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            ConditionOp::Lte => compare(actual, &self.value).is_some_and(|o| o.is_le()),
            ConditionOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.contains(actual)),
            ConditionOp::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            ConditionOp::StartsWith => match (actual, &self.value) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix),
                _ => false,
            },
            ConditionOp::EndsWith => match (actual, &self.value) {
                (Value::String(s), Value::String(suffix)) => s.ends_with(suffix),
                _ => false,
            },
        }
    }
}

fn lookup_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |acc, segment| acc.get(segment))
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.as_str().cmp(r.as_str())),
        _ => None,
    }
}

/// A named invalidation rule evaluated on entity-change events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationRule {
    pub name: String,
    /// Target entity type; `*` matches every entity
    pub entity_type: String,
    pub target: InvalidationTarget,
    pub conditions: Vec<InvalidationCondition>,
    /// Higher priority rules fire first
    pub priority: i32,
    pub enabled: bool,
    pub delay: Option<Duration>,
}

impl InvalidationRule {
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        target: InvalidationTarget,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            target,
            conditions: Vec::new(),
            priority: 0,
            enabled: true,
            delay: None,
        }
    }

    pub fn condition(mut self, condition: InvalidationCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn matches(&self, entity_type: &str, data: &Value, change: ChangeType) -> bool {
        if !self.enabled {
            return false;
        }
        if self.entity_type != "*" && self.entity_type != entity_type {
            return false;
        }
        self.conditions.iter().all(|c| c.evaluate(data, change))
    }
}

/// One edge of the entity dependency map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDependency {
    pub dependent: String,
    pub delay: Option<Duration>,
}

impl EntityDependency {
    pub fn new(dependent: impl Into<String>, delay: Option<Duration>) -> Self {
        Self {
            dependent: dependent.into(),
            delay,
        }
    }
}

/// Options for a direct invalidation call
#[derive(Debug, Clone, Default)]
pub struct InvalidateOptions {
    /// Follow the dependency map of `entity_type`
    pub cascade: bool,
    pub entity_type: Option<String>,
    /// Report what would be deleted without mutating
    pub dry_run: bool,
    /// Schedule the operation instead of running it now
    pub delay: Option<Duration>,
}

/// One operation inside a named batch
#[derive(Debug, Clone)]
pub struct BatchOperation {
    pub target: InvalidationTarget,
    pub entity_type: Option<String>,
}

/// Aggregate result of a named batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub name: String,
    pub total_invalidated: u64,
    pub succeeded: usize,
    pub failed: usize,
}

/// Cache invalidator
pub struct Invalidator {
    store: Arc<dyn CacheStore>,
    keys: Arc<KeyGenerator>,
    sink: Arc<dyn EventSink>,
    rules: RwLock<Vec<InvalidationRule>>,
    dependencies: DashMap<String, Vec<EntityDependency>>,
    timers: Arc<DashMap<u64, JoinHandle<()>>>,
    timer_seq: AtomicU64,
}

impl Invalidator {
    pub fn new(
        store: Arc<dyn CacheStore>,
        keys: Arc<KeyGenerator>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let invalidator = Self {
            store,
            keys,
            sink,
            rules: RwLock::new(Vec::new()),
            dependencies: DashMap::new(),
            timers: Arc::new(DashMap::new()),
            timer_seq: AtomicU64::new(0),
        };
        invalidator.seed_defaults();
        invalidator
    }

    /// Default rules and dependencies for the canonical PSA entity set
    fn seed_defaults(&self) {
        let prefix = self.keys.prefix().to_string();
        let mut rules = self.rules.write();
        rules.push(
            InvalidationRule::new(
                "company_update_cascade",
                "companies",
                InvalidationTarget::TagBased(vec!["company".to_string()]),
            )
            .condition(InvalidationCondition::new(
                "__changeType",
                ConditionOp::In,
                serde_json::json!(["update", "delete"]),
            ))
            .priority(10),
        );
        rules.push(
            InvalidationRule::new(
                "ticket_status_lists",
                "tickets",
                InvalidationTarget::Pattern(format!("{prefix}:tickets:*:list*")),
            )
            .condition(InvalidationCondition::new(
                "status",
                ConditionOp::Ne,
                Value::Null,
            ))
            .priority(8),
        );
        rules.push(
            InvalidationRule::new(
                "project_completed",
                "projects",
                InvalidationTarget::Pattern(format!("{prefix}:projects:*")),
            )
            .condition(InvalidationCondition::new(
                "status",
                ConditionOp::Eq,
                Value::String("Complete".to_string()),
            ))
            .priority(7)
            .delay(Duration::from_secs(5)),
        );
        drop(rules);

        self.dependencies.insert(
            "companies".to_string(),
            ["contacts", "tickets", "projects", "contracts"]
                .into_iter()
                .map(|d| EntityDependency::new(d, Some(Duration::from_secs(1))))
                .collect(),
        );
        self.dependencies.insert(
            "contacts".to_string(),
            vec![EntityDependency::new(
                "tickets",
                Some(Duration::from_millis(500)),
            )],
        );
        self.dependencies.insert(
            "projects".to_string(),
            ["tasks", "tickets"]
                .into_iter()
                .map(|d| EntityDependency::new(d, Some(Duration::from_secs(2))))
                .collect(),
        );
    }

    /// Register a rule
    pub fn add_rule(&self, rule: InvalidationRule) {
        self.rules.write().push(rule);
    }

    /// Remove a rule by name; returns whether it existed
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    /// Register a dependency edge
    pub fn add_dependency(&self, source: impl Into<String>, dependency: EntityDependency) {
        self.dependencies
            .entry(source.into())
            .or_default()
            .push(dependency);
    }

    /// Apply (or schedule, or dry-run) one invalidation
    pub async fn invalidate(
        &self,
        target: InvalidationTarget,
        opts: InvalidateOptions,
    ) -> Result<u64> {
        self.emit(
            InvalidationPhase::Before,
            opts.entity_type.as_deref(),
            &target,
            None,
            None,
            None,
        );
        let start = Instant::now();

        if opts.dry_run {
            let count = self.dry_count(&target).await?;
            self.emit(
                InvalidationPhase::After,
                opts.entity_type.as_deref(),
                &target,
                Some(count),
                None,
                Some(start.elapsed()),
            );
            return Ok(count);
        }

        if let Some(delay) = opts.delay {
            self.schedule_delayed(target, delay);
            return Ok(0);
        }

        let mut count = match self.apply(&target).await {
            Ok(count) => count,
            Err(e) => {
                self.emit(
                    InvalidationPhase::Error,
                    opts.entity_type.as_deref(),
                    &target,
                    None,
                    Some(e.to_string()),
                    Some(start.elapsed()),
                );
                return Err(e);
            }
        };

        if opts.cascade {
            if let Some(entity_type) = &opts.entity_type {
                count += self.cascade(entity_type).await?;
            }
        }

        self.emit(
            InvalidationPhase::After,
            opts.entity_type.as_deref(),
            &target,
            Some(count),
            None,
            Some(start.elapsed()),
        );
        Ok(count)
    }

    async fn apply(&self, target: &InvalidationTarget) -> Result<u64> {
        apply_target(self.store.as_ref(), target).await
    }

    /// Exact counts of what an invalidation would delete
    async fn dry_count(&self, target: &InvalidationTarget) -> Result<u64> {
        match target {
            InvalidationTarget::Single(key) => Ok(self.store.exists(key).await? as u64),
            InvalidationTarget::Batch(keys) => {
                let mut count = 0;
                for key in keys {
                    if self.store.exists(key).await? {
                        count += 1;
                    }
                }
                Ok(count)
            }
            InvalidationTarget::Pattern(pattern) => {
                Ok(self.store.keys(Some(pattern)).await?.len() as u64)
            }
            InvalidationTarget::TagBased(tags) => {
                let mut union: HashSet<String> = HashSet::new();
                for tag in tags {
                    union.extend(self.store.keys_by_tag(tag).await?);
                }
                Ok(union.len() as u64)
            }
            InvalidationTarget::Ttl => self.store.expired_count().await,
        }
    }

    /// Cascade to dependents of `entity_type`. Immediate dependents count
    /// into the return value; delayed ones are scheduled fire-and-forget.
    async fn cascade(&self, entity_type: &str) -> Result<u64> {
        let dependents = self
            .dependencies
            .get(entity_type)
            .map(|d| d.value().clone())
            .unwrap_or_default();

        let mut count = 0;
        for dependency in dependents {
            let pattern = self.keys.entity_pattern(&dependency.dependent);
            let target = InvalidationTarget::Pattern(pattern);
            match dependency.delay {
                Some(delay) => self.schedule_delayed(target, delay),
                None => count += self.apply(&target).await?,
            }
        }
        Ok(count)
    }

    /// Schedule a deferred invalidation; the timer is tracked and
    /// cancelled on shutdown.
    fn schedule_delayed(&self, target: InvalidationTarget, delay: Duration) {
        let id = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();
        let sink = self.sink.clone();
        let timers = self.timers.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let start = Instant::now();
            match apply_target(store.as_ref(), &target).await {
                Ok(count) => {
                    sink.emit(&CacheEvent::Invalidation {
                        phase: InvalidationPhase::After,
                        entity_type: None,
                        pattern: target.kind().to_string(),
                        target: target.describe(),
                        count: Some(count),
                        error: None,
                        timestamp_ms: epoch_millis(),
                        execution_time_ms: Some(start.elapsed().as_millis() as u64),
                    });
                }
                Err(e) => {
                    sink.emit(&CacheEvent::Invalidation {
                        phase: InvalidationPhase::Error,
                        entity_type: None,
                        pattern: target.kind().to_string(),
                        target: target.describe(),
                        count: None,
                        error: Some(e.to_string()),
                        timestamp_ms: epoch_millis(),
                        execution_time_ms: Some(start.elapsed().as_millis() as u64),
                    });
                }
            }
            timers.remove(&id);
        });
        self.timers.insert(id, handle);
    }

    /// Number of invalidations currently waiting on a timer
    pub fn pending_delayed(&self) -> usize {
        self.timers.len()
    }

    /// Evaluate rules against an entity change and fire the matches in
    /// descending priority. Individual rule failures do not abort the
    /// batch.
    pub async fn invalidate_by_entity_change(
        &self,
        entity_type: &str,
        data: &Value,
        change: ChangeType,
        _entity_id: Option<&str>,
    ) -> Result<u64> {
        let mut matching: Vec<InvalidationRule> = {
            let rules = self.rules.read();
            rules
                .iter()
                .filter(|r| r.matches(entity_type, data, change))
                .cloned()
                .collect()
        };
        matching.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut total = 0;
        for rule in matching {
            let opts = InvalidateOptions {
                cascade: true,
                entity_type: Some(entity_type.to_string()),
                dry_run: false,
                delay: rule.delay,
            };
            match self.invalidate(rule.target.clone(), opts).await {
                Ok(count) => total += count,
                Err(e) => {
                    tracing::warn!(
                        rule = %rule.name,
                        error = %e,
                        "invalidation rule failed; continuing"
                    );
                }
            }
        }
        Ok(total)
    }

    /// Run a named batch of invalidations
    pub async fn run_batch(
        &self,
        name: &str,
        operations: Vec<BatchOperation>,
        parallel: bool,
        continue_on_error: bool,
    ) -> Result<BatchReport> {
        let mut report = BatchReport {
            name: name.to_string(),
            total_invalidated: 0,
            succeeded: 0,
            failed: 0,
        };

        let opts_for = |op: &BatchOperation| InvalidateOptions {
            cascade: false,
            entity_type: op.entity_type.clone(),
            dry_run: false,
            delay: None,
        };

        if parallel {
            let futures: Vec<_> = operations
                .iter()
                .map(|op| self.invalidate(op.target.clone(), opts_for(op)))
                .collect();
            for result in join_all(futures).await {
                match result {
                    Ok(count) => {
                        report.total_invalidated += count;
                        report.succeeded += 1;
                    }
                    Err(e) => {
                        report.failed += 1;
                        if !continue_on_error {
                            return Err(CacheError::InvalidationRule {
                                rule: name.to_string(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        } else {
            for op in &operations {
                match self.invalidate(op.target.clone(), opts_for(op)).await {
                    Ok(count) => {
                        report.total_invalidated += count;
                        report.succeeded += 1;
                    }
                    Err(e) => {
                        report.failed += 1;
                        if !continue_on_error {
                            return Err(CacheError::InvalidationRule {
                                rule: name.to_string(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    /// Cancel all pending delayed invalidations
    pub fn shutdown(&self) {
        for item in self.timers.iter() {
            item.value().abort();
        }
        self.timers.clear();
    }

    fn emit(
        &self,
        phase: InvalidationPhase,
        entity_type: Option<&str>,
        target: &InvalidationTarget,
        count: Option<u64>,
        error: Option<String>,
        execution_time: Option<Duration>,
    ) {
        self.sink.emit(&CacheEvent::Invalidation {
            phase,
            entity_type: entity_type.map(str::to_string),
            pattern: target.kind().to_string(),
            target: target.describe(),
            count,
            error,
            timestamp_ms: epoch_millis(),
            execution_time_ms: execution_time.map(|d| d.as_millis() as u64),
        });
    }
}

async fn apply_target(store: &dyn CacheStore, target: &InvalidationTarget) -> Result<u64> {
    match target {
        InvalidationTarget::Single(key) => Ok(store.delete(key).await? as u64),
        InvalidationTarget::Batch(keys) => store.delete_many(keys).await,
        InvalidationTarget::Pattern(pattern) => store.delete_by_pattern(pattern).await,
        InvalidationTarget::TagBased(tags) => store.delete_by_tags(tags).await,
        InvalidationTarget::Ttl => store.cleanup().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyGenerator, KeyGeneratorConfig};
    use rescache_core::{CacheEntry, NoopSink};
    use rescache_storage::MemoryStore;
    use serde_json::json;

    fn invalidator() -> (Arc<MemoryStore>, Invalidator) {
        let store = Arc::new(MemoryStore::with_defaults());
        let keys = Arc::new(KeyGenerator::new(KeyGeneratorConfig {
            prefix: "app".to_string(),
            ..Default::default()
        }));
        let invalidator = Invalidator::new(store.clone(), keys, Arc::new(NoopSink));
        (store, invalidator)
    }

    async fn seed(store: &MemoryStore, key: &str, tags: &[&str]) {
        let entry = CacheEntry::new(
            b"v".to_vec(),
            Duration::from_secs(60),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        store.set(key, entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_invalidation() {
        let (store, invalidator) = invalidator();
        seed(&store, "app:companies:read:1", &[]).await;

        let count = invalidator
            .invalidate(
                InvalidationTarget::Single("app:companies:read:1".to_string()),
                InvalidateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(count, 1);

        // Deleting again reports zero.
        let count = invalidator
            .invalidate(
                InvalidationTarget::Single("app:companies:read:1".to_string()),
                InvalidateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_pattern_invalidation_removes_all_matches() {
        let (store, invalidator) = invalidator();
        seed(&store, "app:tickets:read:1", &[]).await;
        seed(&store, "app:tickets:read:2", &[]).await;
        seed(&store, "app:projects:read:1", &[]).await;

        let count = invalidator
            .invalidate(
                InvalidationTarget::Pattern("app:tickets:*".to_string()),
                InvalidateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(store.keys(Some("app:tickets:*")).await.unwrap().is_empty());
        assert!(store.exists("app:projects:read:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_mutating() {
        let (store, invalidator) = invalidator();
        seed(&store, "app:tickets:read:1", &["ticket"]).await;
        seed(&store, "app:tickets:read:2", &["ticket"]).await;

        let count = invalidator
            .invalidate(
                InvalidationTarget::TagBased(vec!["ticket".to_string()]),
                InvalidateOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(store.exists("app:tickets:read:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delayed_invalidation_fires_later() {
        let (store, invalidator) = invalidator();
        seed(&store, "app:tickets:read:1", &[]).await;

        let count = invalidator
            .invalidate(
                InvalidationTarget::Single("app:tickets:read:1".to_string()),
                InvalidateOptions {
                    delay: Some(Duration::from_millis(50)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Delayed work is not counted eagerly.
        assert_eq!(count, 0);
        assert!(store.exists("app:tickets:read:1").await.unwrap());
        assert_eq!(invalidator.pending_delayed(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!store.exists("app:tickets:read:1").await.unwrap());
        assert_eq!(invalidator.pending_delayed(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_timers() {
        let (store, invalidator) = invalidator();
        seed(&store, "app:tickets:read:1", &[]).await;

        invalidator
            .invalidate(
                InvalidationTarget::Single("app:tickets:read:1".to_string()),
                InvalidateOptions {
                    delay: Some(Duration::from_millis(50)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        invalidator.shutdown();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.exists("app:tickets:read:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_entity_change_fires_matching_rule() {
        let (store, invalidator) = invalidator();
        seed(&store, "app:companies:read:7", &["company"]).await;
        seed(&store, "app:contacts:read:1", &["company"]).await;
        seed(&store, "app:other:read:1", &["unrelated"]).await;

        let count = invalidator
            .invalidate_by_entity_change("companies", &json!({"id": 7}), ChangeType::Update, None)
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert!(!store.exists("app:companies:read:7").await.unwrap());
        assert!(store.exists("app:other:read:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_entity_change_create_does_not_match_company_rule() {
        let (store, invalidator) = invalidator();
        seed(&store, "app:companies:read:7", &["company"]).await;

        let count = invalidator
            .invalidate_by_entity_change("companies", &json!({"id": 7}), ChangeType::Create, None)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(store.exists("app:companies:read:7").await.unwrap());
    }

    #[tokio::test]
    async fn test_condition_operators() {
        let data = json!({
            "status": "In Progress",
            "company": {"id": 12},
            "labels": ["urgent", "vip"],
        });

        let eq = InvalidationCondition::new("company.id", ConditionOp::Eq, json!(12));
        assert!(eq.evaluate(&data, ChangeType::Update));

        let gt = InvalidationCondition::new("company.id", ConditionOp::Gt, json!(10));
        assert!(gt.evaluate(&data, ChangeType::Update));

        let starts = InvalidationCondition::new("status", ConditionOp::StartsWith, json!("In"));
        assert!(starts.evaluate(&data, ChangeType::Update));

        let contains = InvalidationCondition::new("labels", ConditionOp::Contains, json!("vip"));
        assert!(contains.evaluate(&data, ChangeType::Update));

        let change = InvalidationCondition::new(
            "__changeType",
            ConditionOp::In,
            json!(["update", "delete"]),
        );
        assert!(change.evaluate(&data, ChangeType::Update));
        assert!(!change.evaluate(&data, ChangeType::Create));

        let missing = InvalidationCondition::new("missing.field", ConditionOp::Ne, Value::Null);
        assert!(!missing.evaluate(&data, ChangeType::Update));
    }

    #[tokio::test]
    async fn test_rule_priority_order() {
        let (_store, invalidator) = invalidator();
        let rules = invalidator.rules.read();
        let company = rules
            .iter()
            .find(|r| r.name == "company_update_cascade")
            .unwrap();
        let ticket = rules.iter().find(|r| r.name == "ticket_status_lists").unwrap();
        assert!(company.priority > ticket.priority);
    }

    #[tokio::test]
    async fn test_batch_sequential_and_parallel() {
        let (store, invalidator) = invalidator();
        seed(&store, "app:a", &[]).await;
        seed(&store, "app:b", &[]).await;

        let report = invalidator
            .run_batch(
                "cleanup",
                vec![
                    BatchOperation {
                        target: InvalidationTarget::Single("app:a".to_string()),
                        entity_type: None,
                    },
                    BatchOperation {
                        target: InvalidationTarget::Single("app:b".to_string()),
                        entity_type: None,
                    },
                ],
                false,
                true,
            )
            .await
            .unwrap();
        assert_eq!(report.total_invalidated, 2);
        assert_eq!(report.succeeded, 2);

        seed(&store, "app:c", &[]).await;
        seed(&store, "app:d", &[]).await;
        let report = invalidator
            .run_batch(
                "cleanup_parallel",
                vec![
                    BatchOperation {
                        target: InvalidationTarget::Single("app:c".to_string()),
                        entity_type: None,
                    },
                    BatchOperation {
                        target: InvalidationTarget::Single("app:d".to_string()),
                        entity_type: None,
                    },
                ],
                true,
                true,
            )
            .await
            .unwrap();
        assert_eq!(report.total_invalidated, 2);
    }

    #[tokio::test]
    async fn test_cascade_schedules_dependents() {
        let (store, invalidator) = invalidator();
        seed(&store, "app:contacts:read:1", &[]).await;

        // companies -> contacts has a 1s delay; use a custom immediate edge.
        invalidator.add_dependency(
            "widgets",
            EntityDependency::new("contacts", None),
        );
        let count = invalidator
            .invalidate(
                InvalidationTarget::Pattern("app:widgets:*".to_string()),
                InvalidateOptions {
                    cascade: true,
                    entity_type: Some("widgets".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(!store.exists("app:contacts:read:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_invalidation_runs_cleanup() {
        let (store, invalidator) = invalidator();
        let mut entry = CacheEntry::new(b"v".to_vec(), Duration::from_secs(60), vec![]);
        entry.expires_at = std::time::SystemTime::now() - Duration::from_secs(1);
        store.set("app:dead", entry).await.unwrap();

        let count = invalidator
            .invalidate(InvalidationTarget::Ttl, InvalidateOptions::default())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
