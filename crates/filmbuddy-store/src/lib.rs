//! SQLite persistence for the orchestrator.
//!
//! Four concerns live here: the reply ledger (idempotency and supersede
//! checks), the per-user rate limiter, the capability cache behind the
//! in-process one, and circuit state shared across restarts. All of them
//! key the orchestrator's defenses against duplicate replies, so they sit
//! on a strongly consistent store rather than a best-effort cache.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use filmbuddy_core::{RateLimitConfig, ReplyState, TraceEntry};
use filmbuddy_errors::Attempt;
use filmbuddy_gateway::{CapabilityKey, CapabilityRecord, CapabilityStore, CircuitState, CircuitStore};
use indexmap::IndexSet;
use rusqlite::{Connection, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS inbound_messages (
            message_id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            received_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_inbound_conversation
            ON inbound_messages(conversation_id, user_id, received_at);
         CREATE TABLE IF NOT EXISTS replies (
            reply_id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            reply TEXT NOT NULL,
            attempts TEXT NOT NULL,
            trace TEXT NOT NULL,
            created_at TEXT NOT NULL
         );",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS rate_limit_events (
            id INTEGER PRIMARY KEY,
            user_id TEXT NOT NULL,
            at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_rate_limit_user_time
            ON rate_limit_events(user_id, at);",
    ),
    (
        3,
        "CREATE TABLE IF NOT EXISTS capability_cache (
            base_url TEXT NOT NULL,
            model TEXT NOT NULL,
            provider TEXT NOT NULL,
            supported_parameters TEXT,
            fetched_at TEXT NOT NULL,
            PRIMARY KEY (base_url, model, provider)
         );
         CREATE TABLE IF NOT EXISTS circuit_state (
            model TEXT PRIMARY KEY,
            failure_streak INTEGER NOT NULL,
            open_until TEXT,
            last_status INTEGER,
            last_error TEXT,
            updated_at TEXT NOT NULL
         );",
    ),
];

/// One persisted reply, keyed by the triggering message id. Replaying a
/// delivery finds this row instead of starting a new model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRecord {
    pub reply_id: Uuid,
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub reply: ReplyState,
    pub attempts: Vec<Attempt>,
    pub trace: Vec<TraceEntry>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub received_at: DateTime<Utc>,
}

/// Outcome of a sliding-window rate check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_seconds: u64 },
}

/// Reply ledger and supersede lookups.
pub trait ReplyStore: Send + Sync {
    fn load_by_message(&self, message_id: &str) -> Result<Option<ReplyRecord>>;
    fn save_reply(&self, record: &ReplyRecord) -> Result<()>;
    fn record_inbound(&self, inbound: &InboundRecord) -> Result<()>;
    /// Timestamp of the newest inbound message for (conversation, user).
    fn newest_inbound_at(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Sliding-window request counter. Check and record are one operation so
/// two concurrent deliveries cannot both slip under the limit.
pub trait RateLimitStore: Send + Sync {
    fn check_and_record(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        cfg: &RateLimitConfig,
    ) -> Result<RateDecision>;
}

// ── SQLite implementation ───────────────────────────────────────────────

pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let store = Self {
            db_path: dir.join("filmbuddy.sqlite"),
        };
        store.init_db()?;
        Ok(store)
    }

    fn db(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        // Writers queue behind each other instead of failing with BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;
        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

impl ReplyStore for SqliteStore {
    fn load_by_message(&self, message_id: &str) -> Result<Option<ReplyRecord>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT reply_id, message_id, conversation_id, user_id, reply, attempts, trace, created_at
             FROM replies WHERE message_id = ?1",
        )?;
        let mut rows = stmt.query([message_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(ReplyRecord {
                reply_id: Uuid::parse_str(row.get::<_, String>(0)?.as_str())?,
                message_id: row.get(1)?,
                conversation_id: row.get(2)?,
                user_id: row.get(3)?,
                reply: serde_json::from_str(&row.get::<_, String>(4)?)?,
                attempts: serde_json::from_str(&row.get::<_, String>(5)?)?,
                trace: serde_json::from_str(&row.get::<_, String>(6)?)?,
                created_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
            }));
        }
        Ok(None)
    }

    fn save_reply(&self, record: &ReplyRecord) -> Result<()> {
        let conn = self.db()?;
        // INSERT OR IGNORE keeps the first reply for a message id; a
        // racing duplicate handler loses and reads the winner back.
        conn.execute(
            "INSERT OR IGNORE INTO replies
             (reply_id, message_id, conversation_id, user_id, reply, attempts, trace, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.reply_id.to_string(),
                record.message_id,
                record.conversation_id,
                record.user_id,
                serde_json::to_string(&record.reply)?,
                serde_json::to_string(&record.attempts)?,
                serde_json::to_string(&record.trace)?,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn record_inbound(&self, inbound: &InboundRecord) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT OR IGNORE INTO inbound_messages (message_id, conversation_id, user_id, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                inbound.message_id,
                inbound.conversation_id,
                inbound.user_id,
                inbound.received_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn newest_inbound_at(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT MAX(received_at) FROM inbound_messages
             WHERE conversation_id = ?1 AND user_id = ?2",
        )?;
        let newest: Option<String> = stmt.query_row([conversation_id, user_id], |r| r.get(0))?;
        newest.map(|raw| parse_rfc3339(&raw)).transpose()
    }
}

impl RateLimitStore for SqliteStore {
    fn check_and_record(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        cfg: &RateLimitConfig,
    ) -> Result<RateDecision> {
        let mut conn = self.db()?;
        // Count and insert must be atomic: an immediate transaction takes
        // the write lock up front, so two concurrent deliveries at the
        // boundary serialize instead of both observing the same count.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let window_start = now - Duration::seconds(cfg.window_seconds as i64);
        tx.execute(
            "DELETE FROM rate_limit_events WHERE user_id = ?1 AND at < ?2",
            params![user_id, window_start.to_rfc3339()],
        )?;
        let in_window: i64 = tx.query_row(
            "SELECT COUNT(1) FROM rate_limit_events WHERE user_id = ?1 AND at >= ?2",
            params![user_id, window_start.to_rfc3339()],
            |r| r.get(0),
        )?;
        if in_window >= cfg.max_requests as i64 {
            let oldest: Option<String> = tx.query_row(
                "SELECT MIN(at) FROM rate_limit_events WHERE user_id = ?1 AND at >= ?2",
                params![user_id, window_start.to_rfc3339()],
                |r| r.get(0),
            )?;
            let retry_after = match oldest {
                Some(raw) => {
                    let oldest_at = parse_rfc3339(&raw)?;
                    let free_at = oldest_at + Duration::seconds(cfg.window_seconds as i64);
                    free_at.signed_duration_since(now).num_seconds().max(1) as u64
                }
                None => cfg.window_seconds,
            };
            tx.commit()?;
            return Ok(RateDecision::Limited {
                retry_after_seconds: retry_after,
            });
        }
        tx.execute(
            "INSERT INTO rate_limit_events (user_id, at) VALUES (?1, ?2)",
            params![user_id, now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(RateDecision::Allowed)
    }
}

// The gateway's cache traits are infallible by design (a cache miss and a
// storage error route the same way: fall through to the next source), so
// storage failures degrade to None here instead of propagating.
impl CapabilityStore for SqliteStore {
    fn load(&self, key: &CapabilityKey) -> Option<CapabilityRecord> {
        let conn = self.db().ok()?;
        let mut stmt = conn
            .prepare(
                "SELECT supported_parameters, fetched_at FROM capability_cache
                 WHERE base_url = ?1 AND model = ?2 AND provider = ?3",
            )
            .ok()?;
        let row = stmt
            .query_row(
                params![key.base_url, key.model, key.provider],
                |r| Ok((r.get::<_, Option<String>>(0)?, r.get::<_, String>(1)?)),
            )
            .ok()?;
        let supported_parameters = match row.0 {
            Some(raw) => Some(serde_json::from_str::<IndexSet<String>>(&raw).ok()?),
            None => None,
        };
        Some(CapabilityRecord {
            supported_parameters,
            fetched_at: parse_rfc3339(&row.1).ok()?,
        })
    }

    fn save(&self, key: &CapabilityKey, record: &CapabilityRecord) {
        let Ok(conn) = self.db() else {
            return;
        };
        let serialized = record
            .supported_parameters
            .as_ref()
            .and_then(|set| serde_json::to_string(set).ok());
        let _ = conn.execute(
            "INSERT OR REPLACE INTO capability_cache
             (base_url, model, provider, supported_parameters, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.base_url,
                key.model,
                key.provider,
                serialized,
                record.fetched_at.to_rfc3339(),
            ],
        );
    }
}

impl CircuitStore for SqliteStore {
    fn load(&self, model: &str) -> Option<CircuitState> {
        let conn = self.db().ok()?;
        let mut stmt = conn
            .prepare(
                "SELECT failure_streak, open_until, last_status, last_error
                 FROM circuit_state WHERE model = ?1",
            )
            .ok()?;
        stmt.query_row([model], |r| {
            Ok(CircuitState {
                failure_streak: r.get::<_, i64>(0)? as u32,
                open_until: r.get::<_, Option<String>>(1)?.and_then(|raw| {
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|dt| dt.with_timezone(&Utc))
                        .ok()
                }),
                last_status: r.get::<_, Option<i64>>(2)?.map(|s| s as u16),
                last_error: r.get(3)?,
            })
        })
        .ok()
    }

    fn save(&self, model: &str, state: &CircuitState) {
        let Ok(conn) = self.db() else {
            return;
        };
        let _ = conn.execute(
            "INSERT OR REPLACE INTO circuit_state
             (model, failure_streak, open_until, last_status, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                model,
                state.failure_streak as i64,
                state.open_until.map(|at| at.to_rfc3339()),
                state.last_status.map(|s| s as i64),
                state.last_error,
                Utc::now().to_rfc3339(),
            ],
        );
    }

    fn clear(&self, model: &str) {
        let Ok(conn) = self.db() else {
            return;
        };
        let _ = conn.execute("DELETE FROM circuit_state WHERE model = ?1", [model]);
    }
}

// ── In-memory implementation for tests and single-process deployments ───

#[derive(Default)]
pub struct MemoryStore {
    replies: Mutex<HashMap<String, ReplyRecord>>,
    inbound: Mutex<Vec<InboundRecord>>,
    rate_events: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl ReplyStore for MemoryStore {
    fn load_by_message(&self, message_id: &str) -> Result<Option<ReplyRecord>> {
        Ok(self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(message_id)
            .cloned())
    }

    fn save_reply(&self, record: &ReplyRecord) -> Result<()> {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(record.message_id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    fn record_inbound(&self, inbound: &InboundRecord) -> Result<()> {
        self.inbound
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(inbound.clone());
        Ok(())
    }

    fn newest_inbound_at(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .inbound
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.user_id == user_id)
            .map(|m| m.received_at)
            .max())
    }
}

impl RateLimitStore for MemoryStore {
    fn check_and_record(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        cfg: &RateLimitConfig,
    ) -> Result<RateDecision> {
        let mut events = self.rate_events.lock().unwrap_or_else(|p| p.into_inner());
        let window_start = now - Duration::seconds(cfg.window_seconds as i64);
        let user_events = events.entry(user_id.to_string()).or_default();
        user_events.retain(|at| *at >= window_start);
        if user_events.len() >= cfg.max_requests as usize {
            let retry_after = user_events
                .iter()
                .min()
                .map(|oldest| {
                    (*oldest + Duration::seconds(cfg.window_seconds as i64))
                        .signed_duration_since(now)
                        .num_seconds()
                        .max(1) as u64
                })
                .unwrap_or(cfg.window_seconds);
            return Ok(RateDecision::Limited {
                retry_after_seconds: retry_after,
            });
        }
        user_events.push(now);
        Ok(RateDecision::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filmbuddy_core::{ToolCall, ToolResult};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_reply(message_id: &str) -> ReplyRecord {
        let mut trace = Vec::new();
        trace.push(TraceEntry {
            call: ToolCall {
                tool: "get_trending".to_string(),
                args: json!({"limit": 5}),
            },
            result: ToolResult::ok(json!({"items": []})),
            at: Utc::now(),
        });
        ReplyRecord {
            reply_id: Uuid::now_v7(),
            message_id: message_id.to_string(),
            conversation_id: "c1".to_string(),
            user_id: "u1".to_string(),
            reply: ReplyState {
                text: "Here you go".to_string(),
                model_used: Some("a/one".to_string()),
                ..ReplyState::default()
            },
            attempts: vec![Attempt {
                model: "a/one".to_string(),
                variant: "base".to_string(),
                status: Some(200),
                message: None,
                upstream_request_id: None,
            }],
            trace,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn reply_round_trips_with_attempts_and_trace() {
        let dir = TempDir::new().expect("tempdir");
        let store = SqliteStore::open(dir.path()).expect("open");
        let record = sample_reply("m1");
        store.save_reply(&record).expect("save");

        let loaded = store
            .load_by_message("m1")
            .expect("load")
            .expect("row exists");
        assert_eq!(loaded.reply_id, record.reply_id);
        assert_eq!(loaded.reply.text, "Here you go");
        assert_eq!(loaded.attempts.len(), 1);
        assert_eq!(loaded.trace.len(), 1);
        assert_eq!(loaded.trace[0].call.tool, "get_trending");
    }

    #[test]
    fn duplicate_message_id_keeps_the_first_reply() {
        let dir = TempDir::new().expect("tempdir");
        let store = SqliteStore::open(dir.path()).expect("open");
        let first = sample_reply("m1");
        let mut second = sample_reply("m1");
        second.reply.text = "different".to_string();
        store.save_reply(&first).expect("save first");
        store.save_reply(&second).expect("save second");

        let loaded = store.load_by_message("m1").expect("load").expect("row");
        assert_eq!(loaded.reply_id, first.reply_id);
        assert_eq!(loaded.reply.text, "Here you go");
    }

    #[test]
    fn newest_inbound_supports_supersede_checks() {
        let dir = TempDir::new().expect("tempdir");
        let store = SqliteStore::open(dir.path()).expect("open");
        let t0 = Utc::now();
        for (id, offset) in [("m1", 0), ("m2", 5)] {
            store
                .record_inbound(&InboundRecord {
                    message_id: id.to_string(),
                    conversation_id: "c1".to_string(),
                    user_id: "u1".to_string(),
                    received_at: t0 + Duration::seconds(offset),
                })
                .expect("record");
        }
        let newest = store
            .newest_inbound_at("c1", "u1")
            .expect("query")
            .expect("present");
        assert_eq!(newest.timestamp(), (t0 + Duration::seconds(5)).timestamp());
        assert!(store.newest_inbound_at("c2", "u1").expect("query").is_none());
    }

    #[test]
    fn rate_limit_window_slides() {
        let dir = TempDir::new().expect("tempdir");
        let store = SqliteStore::open(dir.path()).expect("open");
        let cfg = RateLimitConfig {
            window_seconds: 60,
            max_requests: 2,
        };
        let t0 = Utc::now();
        assert_eq!(
            store.check_and_record("u1", t0, &cfg).expect("first"),
            RateDecision::Allowed
        );
        assert_eq!(
            store.check_and_record("u1", t0, &cfg).expect("second"),
            RateDecision::Allowed
        );
        match store.check_and_record("u1", t0, &cfg).expect("third") {
            RateDecision::Limited { retry_after_seconds } => {
                assert!(retry_after_seconds >= 1 && retry_after_seconds <= 60);
            }
            RateDecision::Allowed => panic!("third request should be limited"),
        }
        // Other users are unaffected; time passing frees the window.
        assert_eq!(
            store.check_and_record("u2", t0, &cfg).expect("other user"),
            RateDecision::Allowed
        );
        let later = t0 + Duration::seconds(61);
        assert_eq!(
            store.check_and_record("u1", later, &cfg).expect("later"),
            RateDecision::Allowed
        );
    }

    #[test]
    fn concurrent_deliveries_cannot_both_slip_under_the_limit() {
        let dir = TempDir::new().expect("tempdir");
        let store = std::sync::Arc::new(SqliteStore::open(dir.path()).expect("open"));
        let cfg = RateLimitConfig {
            window_seconds: 60,
            max_requests: 1,
        };
        let t0 = Utc::now();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                let barrier = std::sync::Arc::clone(&barrier);
                let cfg = cfg.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.check_and_record("u1", t0, &cfg).expect("check")
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|decision| *decision == RateDecision::Allowed)
            .count();
        assert_eq!(admitted, 1, "exactly one delivery fits under max_requests=1");
    }

    #[test]
    fn capability_rows_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let store = SqliteStore::open(dir.path()).expect("open");
        let key = CapabilityKey::new("https://openrouter.ai/api/v1", "a/one", None);
        let mut params_set = IndexSet::new();
        params_set.insert("tools".to_string());
        params_set.insert("temperature".to_string());
        let record = CapabilityRecord {
            supported_parameters: Some(params_set.clone()),
            fetched_at: Utc::now(),
        };
        CapabilityStore::save(&store, &key, &record);

        let loaded = CapabilityStore::load(&store, &key).expect("row");
        assert_eq!(loaded.supported_parameters, Some(params_set));

        // A catalog row without a parameter list stays permissive.
        let bare = CapabilityRecord {
            supported_parameters: None,
            fetched_at: Utc::now(),
        };
        let key2 = CapabilityKey::new("https://openrouter.ai/api/v1", "b/two", None);
        CapabilityStore::save(&store, &key2, &bare);
        let loaded = CapabilityStore::load(&store, &key2).expect("row");
        assert!(loaded.supported_parameters.is_none());
    }

    #[test]
    fn circuit_rows_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let open_until = Utc::now() + Duration::seconds(30);
        {
            let store = SqliteStore::open(dir.path()).expect("open");
            CircuitStore::save(
                &store,
                "a/one",
                &CircuitState {
                    failure_streak: 3,
                    open_until: Some(open_until),
                    last_status: Some(503),
                    last_error: Some("unavailable".to_string()),
                },
            );
        }
        let store = SqliteStore::open(dir.path()).expect("reopen");
        let state = CircuitStore::load(&store, "a/one").expect("row");
        assert_eq!(state.failure_streak, 3);
        assert_eq!(state.last_status, Some(503));
        assert_eq!(
            state.open_until.expect("open until").timestamp(),
            open_until.timestamp()
        );
        CircuitStore::clear(&store, "a/one");
        assert!(CircuitStore::load(&store, "a/one").is_none());
    }

    #[test]
    fn memory_store_mirrors_sqlite_semantics() {
        let store = MemoryStore::default();
        let record = sample_reply("m1");
        store.save_reply(&record).expect("save");
        let mut second = sample_reply("m1");
        second.reply.text = "different".to_string();
        store.save_reply(&second).expect("save duplicate");
        let loaded = store.load_by_message("m1").expect("load").expect("row");
        assert_eq!(loaded.reply_id, record.reply_id);

        let cfg = RateLimitConfig {
            window_seconds: 60,
            max_requests: 1,
        };
        let t0 = Utc::now();
        assert_eq!(
            store.check_and_record("u1", t0, &cfg).expect("first"),
            RateDecision::Allowed
        );
        assert!(matches!(
            store.check_and_record("u1", t0, &cfg).expect("second"),
            RateDecision::Limited { .. }
        ));
    }
}
