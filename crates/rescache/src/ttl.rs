//! Adaptive TTL selection
//!
//! Computes a lifetime for each new entry from the entity's strategy,
//! update history, business hours, and content volatility. Every result is
//! clamped into the entity's `[min_ttl, max_ttl]` band.

use std::time::{Duration, SystemTime};

use chrono::{Datelike, Local, Timelike, Weekday};
use dashmap::DashMap;

use rescache_core::{
    CacheStrategy, EntityCacheConfig, RequestContext, TtlStrategy, VolatilityClass,
    DEFAULT_MAX_TTL, DEFAULT_MIN_TTL,
};

/// The frequency window resets after this much wall-clock age.
const FREQUENCY_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

/// Minimum observed updates before adaptive TTL trusts its statistics.
const ADAPTIVE_MIN_SAMPLES: u32 = 3;

/// Configuration for the TTL manager
#[derive(Debug, Clone)]
pub struct TtlConfig {
    /// Strategy used when the entity config does not choose one
    pub default_strategy: TtlStrategy,
    /// Fallback TTL when no entity config applies
    pub default_ttl: Duration,
    /// Local business hours as `[start, end)` hour-of-day
    pub business_hours: (u32, u32),
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_strategy: TtlStrategy::Fixed,
            default_ttl: Duration::from_secs(300),
            business_hours: (8, 18),
        }
    }
}

/// Outcome of a TTL computation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlDecision {
    pub ttl: Duration,
    /// How much the strategy trusts this value (0.0 - 1.0)
    pub confidence: f64,
    pub strategy: TtlStrategy,
}

/// Running inter-update statistics for one entity type
#[derive(Debug, Clone)]
struct UpdateFrequency {
    last_update: SystemTime,
    /// Running mean inter-update interval, milliseconds
    mean_ms: f64,
    /// Running mean absolute deviation, milliseconds
    deviation_ms: f64,
    samples: u32,
    window_start: SystemTime,
}

impl UpdateFrequency {
    fn new(now: SystemTime) -> Self {
        Self {
            last_update: now,
            mean_ms: 0.0,
            deviation_ms: 0.0,
            samples: 0,
            window_start: now,
        }
    }

    fn observe(&mut self, now: SystemTime) {
        let interval_ms = now
            .duration_since(self.last_update)
            .unwrap_or_default()
            .as_millis() as f64;
        self.last_update = now;
        self.samples += 1;
        let n = self.samples as f64;
        self.mean_ms += (interval_ms - self.mean_ms) / n;
        self.deviation_ms += ((interval_ms - self.mean_ms).abs() - self.deviation_ms) / n;
    }
}

/// TTL manager
///
/// Volatility classification and update-frequency tracking are concurrent
/// tables; both can be adjusted at runtime.
pub struct TtlManager {
    config: TtlConfig,
    volatility: DashMap<String, VolatilityClass>,
    frequencies: DashMap<String, UpdateFrequency>,
}

impl TtlManager {
    pub fn new(config: TtlConfig) -> Self {
        let manager = Self {
            config,
            volatility: DashMap::new(),
            frequencies: DashMap::new(),
        };
        manager.seed_volatility();
        manager
    }

    pub fn with_defaults() -> Self {
        Self::new(TtlConfig::default())
    }

    fn seed_volatility(&self) {
        let seeds = [
            ("companies", VolatilityClass::Low),
            ("contacts", VolatilityClass::Low),
            ("contracts", VolatilityClass::Low),
            ("resources", VolatilityClass::Low),
            ("projects", VolatilityClass::Medium),
            ("tickets", VolatilityClass::High),
            ("tasks", VolatilityClass::High),
            ("time_entries", VolatilityClass::VeryHigh),
        ];
        for (entity, class) in seeds {
            self.volatility.insert(entity.to_string(), class);
        }
    }

    /// Classify an entity type; unknown entities are medium volatility.
    pub fn classify(&self, entity_type: &str) -> VolatilityClass {
        self.volatility
            .get(entity_type)
            .map(|c| *c)
            .unwrap_or_default()
    }

    /// Adjust the volatility class of an entity type at runtime
    pub fn set_volatility(&self, entity_type: impl Into<String>, class: VolatilityClass) {
        self.volatility.insert(entity_type.into(), class);
    }

    /// Record a write event for adaptive statistics. The first event only
    /// anchors the record; samples count observed intervals. The rolling
    /// window resets after seven days.
    pub fn record_update(&self, entity_type: &str) {
        let now = SystemTime::now();
        match self.frequencies.entry(entity_type.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(UpdateFrequency::new(now));
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                let stale = now
                    .duration_since(record.window_start)
                    .map(|age| age > FREQUENCY_WINDOW)
                    .unwrap_or(false);
                if stale {
                    *record = UpdateFrequency::new(now);
                } else {
                    record.observe(now);
                }
            }
        }
    }

    /// Number of observed updates for an entity type
    pub fn observed_samples(&self, entity_type: &str) -> u32 {
        self.frequencies
            .get(entity_type)
            .map(|r| r.samples)
            .unwrap_or(0)
    }

    /// Compute the TTL for a new entry
    pub fn compute(
        &self,
        ctx: &RequestContext,
        entity: Option<&EntityCacheConfig>,
    ) -> TtlDecision {
        self.compute_at(ctx, entity, Local::now())
    }

    /// Compute with an explicit local time (time-aware strategy input)
    pub fn compute_at(
        &self,
        ctx: &RequestContext,
        entity: Option<&EntityCacheConfig>,
        now: chrono::DateTime<Local>,
    ) -> TtlDecision {
        let strategy = entity
            .map(|e| e.ttl_strategy)
            .unwrap_or(self.config.default_strategy);
        let base = self.base_ttl(ctx, entity);

        let (ttl, confidence) = match strategy {
            TtlStrategy::Fixed => (base, 1.0),
            TtlStrategy::Adaptive => self.adaptive_ttl(&ctx.entity_type, base),
            TtlStrategy::TimeAware => (self.time_aware_ttl(base, now), 1.0),
            TtlStrategy::VolatilityBased => (self.volatility_ttl(ctx), 1.0),
            TtlStrategy::BusinessRules => (self.business_rules_ttl(ctx, entity, base), 1.0),
        };

        let min = entity.map(|e| e.min_ttl).unwrap_or(DEFAULT_MIN_TTL);
        let max = entity.map(|e| e.max_ttl).unwrap_or(DEFAULT_MAX_TTL);
        TtlDecision {
            ttl: ttl.clamp(min, max),
            confidence,
            strategy,
        }
    }

    /// Entity default TTL, else the default for its volatility class
    fn base_ttl(&self, ctx: &RequestContext, entity: Option<&EntityCacheConfig>) -> Duration {
        entity
            .map(|e| e.default_ttl)
            .unwrap_or_else(|| self.classify(&ctx.entity_type).default_ttl())
    }

    fn adaptive_ttl(&self, entity_type: &str, base: Duration) -> (Duration, f64) {
        let Some(record) = self.frequencies.get(entity_type) else {
            return (base, 0.5);
        };
        if record.samples < ADAPTIVE_MIN_SAMPLES || record.mean_ms <= 0.0 {
            return (base, 0.5);
        }

        let mean = record.mean_ms;
        let sigma = record.deviation_ms;
        let raw_ms = mean * 0.4 * (1.0 - 0.3 * (sigma / mean).min(1.0));
        let floor = base.as_millis() as f64 * 0.1;
        let ceil = base.as_millis() as f64 * 5.0;
        let ttl = Duration::from_millis(raw_ms.clamp(floor, ceil) as u64);
        let confidence = (1.0 - sigma / (0.5 * mean)).max(0.3);
        (ttl, confidence)
    }

    fn time_aware_ttl(&self, base: Duration, now: chrono::DateTime<Local>) -> Duration {
        let (start, end) = self.config.business_hours;
        let hour = now.hour();
        let mut factor = if hour >= start && hour < end { 0.5 } else { 2.0 };
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            factor *= 1.5;
        }
        base.mul_f64(factor)
    }

    fn volatility_ttl(&self, ctx: &RequestContext) -> Duration {
        let mut ttl = self.classify(&ctx.entity_type).default_ttl();
        if ctx.has_id_param() {
            ttl = ttl.mul_f64(1.5);
        }
        if ctx.is_filtered() {
            ttl = ttl.mul_f64(0.7);
        }
        ttl
    }

    fn business_rules_ttl(
        &self,
        ctx: &RequestContext,
        entity: Option<&EntityCacheConfig>,
        base: Duration,
    ) -> Duration {
        let status = ctx
            .params
            .get("status")
            .or_else(|| {
                ctx.body
                    .as_ref()
                    .and_then(|b| b.get("status"))
            })
            .and_then(|v| v.as_str())
            .map(str::to_ascii_lowercase);

        let mut factor = match ctx.entity_type.as_str() {
            "companies" | "contacts" => 3.0,
            "tickets" => match status.as_deref() {
                Some("closed") | Some("complete") => 1.5,
                _ => 0.3,
            },
            "projects" => match status.as_deref() {
                Some("active") => 0.8,
                _ => 2.0,
            },
            "time_entries" => 0.5,
            "contracts" => 2.0,
            _ => 1.0,
        };

        if entity.is_some_and(|e| e.strategy == CacheStrategy::RefreshAhead) {
            factor *= 0.8;
        }
        // List reads go stale faster than single-entity reads.
        if ctx.verb == rescache_core::ApiVerb::Read && !ctx.has_id_param() {
            factor *= 0.8;
        }
        base.mul_f64(factor)
    }
}

impl Default for TtlManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rescache_core::TtlStrategy;

    fn local_time(year: i32, month: u32, day: u32, hour: u32) -> chrono::DateTime<Local> {
        Local
            .with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()
            .expect("valid local timestamp")
    }

    fn ctx(entity: &str) -> RequestContext {
        RequestContext::read(entity, format!("/{entity}"))
    }

    fn entity(entity_type: &str, strategy: TtlStrategy) -> EntityCacheConfig {
        EntityCacheConfig::new(entity_type)
            .ttl(Duration::from_secs(600))
            .ttl_strategy(strategy)
    }

    #[test]
    fn test_fixed_returns_entity_default() {
        let manager = TtlManager::with_defaults();
        let config = entity("companies", TtlStrategy::Fixed);
        let decision = manager.compute(&ctx("companies"), Some(&config));
        assert_eq!(decision.ttl, Duration::from_secs(600));
        assert_eq!(decision.strategy, TtlStrategy::Fixed);
    }

    #[test]
    fn test_fixed_without_entity_uses_volatility_default() {
        let manager = TtlManager::with_defaults();
        let decision = manager.compute(&ctx("tickets"), None);
        // tickets are high volatility: 30 minutes
        assert_eq!(decision.ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_unknown_entity_defaults_to_medium() {
        let manager = TtlManager::with_defaults();
        assert_eq!(manager.classify("widgets"), VolatilityClass::Medium);
    }

    #[test]
    fn test_volatility_modifiable_at_runtime() {
        let manager = TtlManager::with_defaults();
        manager.set_volatility("widgets", VolatilityClass::VeryHigh);
        assert_eq!(manager.classify("widgets"), VolatilityClass::VeryHigh);
    }

    #[test]
    fn test_adaptive_needs_three_samples() {
        let manager = TtlManager::with_defaults();
        let config = entity("tickets", TtlStrategy::Adaptive);

        manager.record_update("tickets");
        manager.record_update("tickets");
        let decision = manager.compute(&ctx("tickets"), Some(&config));
        assert_eq!(decision.ttl, Duration::from_secs(600));
        assert!((decision.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_adaptive_stays_in_band() {
        let manager = TtlManager::with_defaults();
        let config = entity("tickets", TtlStrategy::Adaptive)
            .ttl_bounds(Duration::from_secs(1), Duration::from_secs(86400));

        for _ in 0..5 {
            manager.record_update("tickets");
        }
        let decision = manager.compute(&ctx("tickets"), Some(&config));
        let base = Duration::from_secs(600);
        assert!(decision.ttl >= base.mul_f64(0.1).min(Duration::from_secs(1)));
        assert!(decision.ttl <= base.mul_f64(5.0));
        assert!(decision.confidence >= 0.3);
        assert!(decision.confidence <= 1.0);
    }

    #[test]
    fn test_time_aware_business_hours() {
        let manager = TtlManager::with_defaults();
        let config = entity("companies", TtlStrategy::TimeAware);

        // Wednesday 10:00 inside business hours: x0.5
        let decision = manager.compute_at(
            &ctx("companies"),
            Some(&config),
            local_time(2026, 7, 29, 10),
        );
        assert_eq!(decision.ttl, Duration::from_secs(300));

        // Wednesday 22:00 outside business hours: x2
        let decision = manager.compute_at(
            &ctx("companies"),
            Some(&config),
            local_time(2026, 7, 29, 22),
        );
        assert_eq!(decision.ttl, Duration::from_secs(1200));

        // Saturday 22:00: x2 x1.5
        let decision = manager.compute_at(
            &ctx("companies"),
            Some(&config),
            local_time(2026, 8, 1, 22),
        );
        assert_eq!(decision.ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_volatility_based_modifiers() {
        let manager = TtlManager::with_defaults();
        let config = entity("tickets", TtlStrategy::VolatilityBased);

        // Single-entity read: 30min x 1.5
        let single = manager.compute(
            &ctx("tickets").param("id", 1),
            Some(&config),
        );
        assert_eq!(single.ttl, Duration::from_secs(2700));

        // Search read: 30min x 0.7
        let search = manager.compute(
            &ctx("tickets").param("search", "printer"),
            Some(&config),
        );
        assert_eq!(search.ttl, Duration::from_secs(1260));
    }

    #[test]
    fn test_business_rules_master_data() {
        let manager = TtlManager::with_defaults();
        let config = entity("companies", TtlStrategy::BusinessRules);

        // companies x3, list read x0.8: 600 * 2.4 = 1440
        let decision = manager.compute(&ctx("companies"), Some(&config));
        assert_eq!(decision.ttl, Duration::from_secs(1440));
    }

    #[test]
    fn test_business_rules_ticket_status() {
        let manager = TtlManager::with_defaults();
        let config = entity("tickets", TtlStrategy::BusinessRules);

        // Active ticket, single read: 600 * 0.3 = 180
        let active = manager.compute(
            &ctx("tickets").param("id", 1).param("status", "open"),
            Some(&config),
        );
        assert_eq!(active.ttl, Duration::from_secs(180));

        // Closed ticket, single read: 600 * 1.5 = 900
        let closed = manager.compute(
            &ctx("tickets").param("id", 1).param("status", "Closed"),
            Some(&config),
        );
        assert_eq!(closed.ttl, Duration::from_secs(900));
    }

    #[test]
    fn test_result_clamped_to_entity_bounds() {
        let manager = TtlManager::with_defaults();
        let config = entity("companies", TtlStrategy::BusinessRules)
            .ttl_bounds(Duration::from_secs(60), Duration::from_secs(1000));

        // Unclamped would be 1440s; max_ttl caps it.
        let decision = manager.compute(&ctx("companies"), Some(&config));
        assert_eq!(decision.ttl, Duration::from_secs(1000));
    }

    #[test]
    fn test_samples_count_intervals() {
        let manager = TtlManager::with_defaults();
        assert_eq!(manager.observed_samples("tickets"), 0);
        // The first event anchors the record; the next two are intervals.
        manager.record_update("tickets");
        manager.record_update("tickets");
        manager.record_update("tickets");
        assert_eq!(manager.observed_samples("tickets"), 2);
    }
}
