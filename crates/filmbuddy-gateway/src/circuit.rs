//! Per-model circuit breaker.
//!
//! Bursts of 429/5xx create thundering herds even with retries and model
//! fallback. Each model carries a small health record so routing can skip
//! a known-bad model for a short cooldown window without a network call.

use chrono::{DateTime, Duration, Utc};
use filmbuddy_core::{CircuitConfig, Clock, SharedClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Health record for one model.
#[derive(Debug, Clone, Default)]
pub struct CircuitState {
    pub failure_streak: u32,
    pub open_until: Option<DateTime<Utc>>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
}

/// Storage for circuit records, shared across overlapping requests.
pub trait CircuitStore: Send + Sync {
    fn load(&self, model: &str) -> Option<CircuitState>;
    fn save(&self, model: &str, state: &CircuitState);
    fn clear(&self, model: &str);
}

#[derive(Debug, Default)]
pub struct MemoryCircuitStore {
    states: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitStore for MemoryCircuitStore {
    fn load(&self, model: &str) -> Option<CircuitState> {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(model)
            .cloned()
    }

    fn save(&self, model: &str, state: &CircuitState) {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(model.to_string(), state.clone());
    }

    fn clear(&self, model: &str) {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(model);
    }
}

/// Failure classes that indicate provider health rather than caller
/// configuration: rate limits, 5xx, and transport failures (no status).
/// 400/401/403 never trip the circuit.
pub fn should_trip(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(429) => true,
        Some(s) => (500..=599).contains(&s),
    }
}

pub struct CircuitBreaker {
    cfg: CircuitConfig,
    store: Arc<dyn CircuitStore>,
    clock: SharedClock,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitConfig, store: Arc<dyn CircuitStore>, clock: SharedClock) -> Self {
        Self { cfg, store, clock }
    }

    /// True when the model should be skipped without a network call.
    pub fn is_open(&self, model: &str) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        let Some(state) = self.store.load(model) else {
            return false;
        };
        state
            .open_until
            .is_some_and(|until| self.clock.now() < until)
    }

    /// Record a failure. Opens the circuit once the streak reaches the
    /// threshold; an explicit Retry-After hint overrides the default
    /// cooldown.
    pub fn on_failure(
        &self,
        model: &str,
        status: Option<u16>,
        error: Option<&str>,
        retry_after_seconds: Option<u64>,
    ) {
        if !self.cfg.enabled || !should_trip(status) {
            return;
        }
        let mut state = self.store.load(model).unwrap_or_default();
        state.failure_streak = state.failure_streak.saturating_add(1);
        state.last_status = status;
        state.last_error = error.map(ToString::to_string);
        if state.failure_streak >= self.cfg.threshold {
            let cooldown = retry_after_seconds
                .filter(|s| *s > 0)
                .unwrap_or_else(|| self.cfg.clamped_cooldown_seconds());
            state.open_until = Some(self.clock.now() + Duration::seconds(cooldown as i64));
        }
        self.store.save(model, &state);
    }

    /// Any 2xx success closes the circuit immediately.
    pub fn on_success(&self, model: &str) {
        if !self.cfg.enabled {
            return;
        }
        self.store.clear(model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filmbuddy_core::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitConfig::default(),
            Arc::new(MemoryCircuitStore::default()),
            clock,
        )
    }

    #[test]
    fn trip_classification() {
        assert!(should_trip(None));
        assert!(should_trip(Some(429)));
        assert!(should_trip(Some(500)));
        assert!(should_trip(Some(599)));
        assert!(!should_trip(Some(400)));
        assert!(!should_trip(Some(401)));
        assert!(!should_trip(Some(403)));
        assert!(!should_trip(Some(404)));
    }

    #[test]
    fn opens_after_threshold_and_reopens_after_cooldown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cb = breaker(Arc::clone(&clock));

        cb.on_failure("a/one", Some(503), Some("unavailable"), None);
        cb.on_failure("a/one", Some(503), Some("unavailable"), None);
        assert!(!cb.is_open("a/one"), "below threshold stays closed");

        cb.on_failure("a/one", Some(503), Some("unavailable"), None);
        assert!(cb.is_open("a/one"), "third failure opens the circuit");

        clock.advance(Duration::seconds(31));
        assert!(!cb.is_open("a/one"), "eligible again after cooldown");
    }

    #[test]
    fn retry_after_extends_the_cooldown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cb = breaker(Arc::clone(&clock));
        for _ in 0..3 {
            cb.on_failure("a/one", Some(429), Some("rate limited"), Some(120));
        }
        clock.advance(Duration::seconds(60));
        assert!(cb.is_open("a/one"), "still open inside the hinted window");
        clock.advance(Duration::seconds(61));
        assert!(!cb.is_open("a/one"));
    }

    #[test]
    fn terminal_failures_never_trip() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cb = breaker(clock);
        for _ in 0..10 {
            cb.on_failure("a/one", Some(401), Some("invalid key"), None);
            cb.on_failure("a/one", Some(400), Some("bad payload"), None);
        }
        assert!(!cb.is_open("a/one"));
    }

    #[test]
    fn success_closes_immediately() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cb = breaker(clock);
        for _ in 0..3 {
            cb.on_failure("a/one", Some(503), None, None);
        }
        assert!(cb.is_open("a/one"));
        cb.on_success("a/one");
        assert!(!cb.is_open("a/one"));
    }

    #[test]
    fn disabled_breaker_is_inert() {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(Utc::now()));
        let cb = CircuitBreaker::new(
            CircuitConfig {
                enabled: false,
                ..CircuitConfig::default()
            },
            Arc::new(MemoryCircuitStore::default()),
            clock,
        );
        for _ in 0..5 {
            cb.on_failure("a/one", Some(503), None, None);
        }
        assert!(!cb.is_open("a/one"));
    }
}
