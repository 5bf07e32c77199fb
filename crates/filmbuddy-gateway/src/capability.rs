//! Per-model capability discovery.
//!
//! Before shipping a payload, the router asks which request parameters
//! the (endpoint, model, provider) tuple actually supports, with
//! precedence: in-process TTL cache → persistent cache row → live probe
//! against `GET {base}/models`. An unknown set means "assume supported";
//! over-stripping loses requested behavior silently, which is worse than
//! a retryable 400.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use filmbuddy_core::{CapabilityConfig, Clock, SharedClock};
use indexmap::IndexSet;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Cache key: one endpoint/model/provider tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityKey {
    pub base_url: String,
    pub model: String,
    pub provider: String,
}

impl CapabilityKey {
    pub fn new(base_url: &str, model: &str, provider: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            provider: provider.unwrap_or("any").to_string(),
        }
    }
}

/// Last-known supported parameters. `None` = the catalog listed the
/// model but carried no parameter list (permissive).
#[derive(Debug, Clone)]
pub struct CapabilityRecord {
    pub supported_parameters: Option<IndexSet<String>>,
    pub fetched_at: DateTime<Utc>,
}

/// Persistent cache behind the in-process one.
pub trait CapabilityStore: Send + Sync {
    fn load(&self, key: &CapabilityKey) -> Option<CapabilityRecord>;
    fn save(&self, key: &CapabilityKey, record: &CapabilityRecord);
}

/// Live catalog lookup. Separated out so tests can script probes.
pub trait CapabilityProber: Send + Sync {
    /// `Ok(None)` means the catalog knows the model but lists no
    /// parameters; an `Err` means the probe itself failed.
    fn probe(&self, base_url: &str, model: &str) -> Result<Option<IndexSet<String>>>;
}

/// Probes `GET {base}/models` and reads `supported_parameters` from the
/// matching row.
pub struct HttpCapabilityProber {
    client: reqwest::blocking::Client,
}

impl HttpCapabilityProber {
    pub fn new(cfg: &CapabilityConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.probe_timeout_seconds))
            .build()?;
        Ok(Self { client })
    }
}

impl CapabilityProber for HttpCapabilityProber {
    fn probe(&self, base_url: &str, model: &str) -> Result<Option<IndexSet<String>>> {
        let url = format!("{}/models", base_url.trim_end_matches('/'));
        let resp = self.client.get(&url).send()?;
        if !resp.status().is_success() {
            return Err(anyhow!("model catalog returned {}", resp.status()));
        }
        let body: Value = resp.json()?;
        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("model catalog payload missing data[]"))?;
        let row = rows
            .iter()
            .find(|row| row.get("id").and_then(|v| v.as_str()) == Some(model))
            .ok_or_else(|| anyhow!("model '{model}' not in catalog"))?;
        Ok(parse_supported_parameters(row))
    }
}

pub fn parse_supported_parameters(row: &Value) -> Option<IndexSet<String>> {
    let params = row.get("supported_parameters")?.as_array()?;
    Some(
        params
            .iter()
            .filter_map(|v| v.as_str())
            .map(ToString::to_string)
            .collect(),
    )
}

enum ProbeSlot {
    Pending,
    Done(Option<CapabilityRecord>),
}

struct InflightProbe {
    slot: Mutex<ProbeSlot>,
    ready: Condvar,
}

/// Read-through capability cache with single-flight probing: concurrent
/// lookups for the same key share one outstanding probe instead of
/// stampeding the catalog.
pub struct CapabilityGate {
    cfg: CapabilityConfig,
    memory: Mutex<HashMap<CapabilityKey, CapabilityRecord>>,
    inflight: Mutex<HashMap<CapabilityKey, Arc<InflightProbe>>>,
    persistent: Option<Arc<dyn CapabilityStore>>,
    prober: Arc<dyn CapabilityProber>,
    clock: SharedClock,
}

impl CapabilityGate {
    pub fn new(
        cfg: CapabilityConfig,
        persistent: Option<Arc<dyn CapabilityStore>>,
        prober: Arc<dyn CapabilityProber>,
        clock: SharedClock,
    ) -> Self {
        Self {
            cfg,
            memory: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            persistent,
            prober,
            clock,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(self.cfg.ttl_seconds as i64)
    }

    fn is_fresh(&self, record: &CapabilityRecord) -> bool {
        self.clock.now().signed_duration_since(record.fetched_at) < self.ttl()
    }

    /// Resolve the supported-parameter set for a key. `None` means
    /// unknown: gate nothing.
    pub fn resolve(&self, key: &CapabilityKey) -> Option<IndexSet<String>> {
        if let Some(record) = self.memory_get(key)
            && self.is_fresh(&record)
        {
            return record.supported_parameters;
        }
        if let Some(store) = &self.persistent
            && let Some(record) = store.load(key)
            && self.is_fresh(&record)
        {
            self.memory_put(key, &record);
            return record.supported_parameters;
        }
        self.probe_shared(key)
            .and_then(|record| record.supported_parameters)
    }

    fn memory_get(&self, key: &CapabilityKey) -> Option<CapabilityRecord> {
        self.memory
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn memory_put(&self, key: &CapabilityKey, record: &CapabilityRecord) {
        self.memory
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.clone(), record.clone());
    }

    /// Single-flight probe: the first caller for a key performs the
    /// lookup; concurrent callers block on the shared slot and reuse the
    /// result. Probe failure falls back to any stale record rather than
    /// erroring out.
    fn probe_shared(&self, key: &CapabilityKey) -> Option<CapabilityRecord> {
        let (probe, leader) = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            match inflight.get(key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let probe = Arc::new(InflightProbe {
                        slot: Mutex::new(ProbeSlot::Pending),
                        ready: Condvar::new(),
                    });
                    inflight.insert(key.clone(), Arc::clone(&probe));
                    (probe, true)
                }
            }
        };

        if !leader {
            let mut slot = probe.slot.lock().unwrap_or_else(|p| p.into_inner());
            while matches!(*slot, ProbeSlot::Pending) {
                slot = probe
                    .ready
                    .wait(slot)
                    .unwrap_or_else(|p| p.into_inner());
            }
            return match &*slot {
                ProbeSlot::Done(record) => record.clone(),
                ProbeSlot::Pending => None,
            };
        }

        let outcome = match self.prober.probe(&key.base_url, &key.model) {
            Ok(supported_parameters) => {
                let record = CapabilityRecord {
                    supported_parameters,
                    fetched_at: self.clock.now(),
                };
                self.memory_put(key, &record);
                if let Some(store) = &self.persistent {
                    store.save(key, &record);
                }
                Some(record)
            }
            // Stale beats absent when the catalog is unreachable.
            Err(_) => self
                .memory_get(key)
                .or_else(|| self.persistent.as_ref().and_then(|s| s.load(key))),
        };

        {
            let mut slot = probe.slot.lock().unwrap_or_else(|p| p.into_inner());
            *slot = ProbeSlot::Done(outcome.clone());
            probe.ready.notify_all();
        }
        self.inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filmbuddy_core::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProber {
        calls: AtomicUsize,
        result: Option<IndexSet<String>>,
        fail: bool,
        delay_ms: u64,
    }

    impl ScriptedProber {
        fn returning(params: &[&str]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: Some(params.iter().map(|s| s.to_string()).collect()),
                fail: false,
                delay_ms: 0,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: None,
                fail: true,
                delay_ms: 0,
            }
        }
    }

    impl CapabilityProber for ScriptedProber {
        fn probe(&self, _base_url: &str, _model: &str) -> Result<Option<IndexSet<String>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(self.delay_ms));
            }
            if self.fail {
                return Err(anyhow!("catalog unreachable"));
            }
            Ok(self.result.clone())
        }
    }

    fn gate(prober: Arc<ScriptedProber>, clock: Arc<ManualClock>) -> CapabilityGate {
        CapabilityGate::new(CapabilityConfig::default(), None, prober, clock)
    }

    #[test]
    fn parses_supported_parameters_from_catalog_row() {
        let row = json!({
            "id": "a/one",
            "supported_parameters": ["tools", "response_format", 7]
        });
        let parsed = parse_supported_parameters(&row).expect("set");
        assert!(parsed.contains("tools"));
        assert!(parsed.contains("response_format"));
        assert_eq!(parsed.len(), 2);

        assert!(parse_supported_parameters(&json!({"id": "a/one"})).is_none());
    }

    #[test]
    fn memory_cache_serves_within_ttl_then_reprobes() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let prober = Arc::new(ScriptedProber::returning(&["tools"]));
        let gate = gate(Arc::clone(&prober), Arc::clone(&clock));
        let key = CapabilityKey::new("http://x/api/v1", "a/one", None);

        assert!(gate.resolve(&key).expect("caps").contains("tools"));
        assert!(gate.resolve(&key).is_some());
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1, "cache hit");

        clock.advance(Duration::seconds(301));
        let _ = gate.resolve(&key);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2, "TTL expired");
    }

    #[test]
    fn probe_failure_falls_back_to_stale_record() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let prober = Arc::new(ScriptedProber::failing());
        let gate = CapabilityGate::new(
            CapabilityConfig::default(),
            None,
            Arc::clone(&prober) as Arc<dyn CapabilityProber>,
            Arc::clone(&clock) as SharedClock,
        );
        let key = CapabilityKey::new("http://x/api/v1", "a/one", None);

        // Seed a record, then expire it.
        let mut params = IndexSet::new();
        params.insert("tools".to_string());
        gate.memory_put(
            &key,
            &CapabilityRecord {
                supported_parameters: Some(params),
                fetched_at: clock.now(),
            },
        );
        clock.advance(Duration::seconds(301));

        let resolved = gate.resolve(&key);
        assert!(resolved.expect("stale set").contains("tools"));
    }

    #[test]
    fn probe_failure_with_no_history_is_permissive() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let prober = Arc::new(ScriptedProber::failing());
        let gate = gate(prober, clock);
        let key = CapabilityKey::new("http://x/api/v1", "a/one", None);
        assert!(gate.resolve(&key).is_none());
    }

    #[test]
    fn concurrent_lookups_share_one_probe() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let prober = Arc::new(ScriptedProber {
            calls: AtomicUsize::new(0),
            result: Some(["tools".to_string()].into_iter().collect()),
            fail: false,
            delay_ms: 40,
        });
        let gate = Arc::new(gate(Arc::clone(&prober), clock));
        let key = CapabilityKey::new("http://x/api/v1", "a/one", None);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let key = key.clone();
                std::thread::spawn(move || gate.resolve(&key))
            })
            .collect();
        for handle in handles {
            let resolved = handle.join().expect("join");
            assert!(resolved.expect("caps").contains("tools"));
        }
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1, "single flight");
    }

    #[test]
    fn provider_distinguishes_cache_keys() {
        let a = CapabilityKey::new("http://x/api/v1/", "a/one", Some("deepinfra"));
        let b = CapabilityKey::new("http://x/api/v1", "a/one", None);
        assert_ne!(a, b);
        assert_eq!(a.base_url, b.base_url, "trailing slash normalized");
    }
}
