use anyhow::Result;
use chrono::Utc;
use filmbuddy_core::TelemetryConfig;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// One lifecycle event while handling an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestEvent {
    Received {
        conversation_id: Uuid,
        message_id: String,
    },
    GateShortCircuit {
        message_id: String,
        gate: String,
    },
    ModelAttempt {
        message_id: String,
        model: String,
        variant: String,
        status: Option<u16>,
    },
    ToolExecuted {
        message_id: String,
        tool: String,
        ok: bool,
        duration_ms: u64,
    },
    ActionProposed {
        message_id: String,
        tool: String,
        action_id: String,
    },
    ReplyPersisted {
        message_id: String,
        reply_id: Uuid,
        model_used: Option<String>,
        loops: u32,
    },
    RequestFailed {
        message_id: String,
        code: String,
        reason: String,
    },
}

pub struct Observer {
    log_path: PathBuf,
    telemetry: Option<TelemetrySink>,
    verbose: bool,
}

struct TelemetrySink {
    endpoint: String,
    client: Client,
}

impl Observer {
    pub fn new(dir: &Path, telemetry_cfg: &TelemetryConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let telemetry = telemetry_sink(telemetry_cfg)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            telemetry,
            verbose: false,
        })
    }

    pub fn record(&self, event: &RequestEvent) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))?;
        self.emit_telemetry("request.event", serde_json::to_value(event)?)
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log a message to stderr with `[filmbuddy]` prefix when verbose
    /// mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[filmbuddy] {msg}");
        }
    }

    /// Log a warning — always written to the log file, and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[filmbuddy WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    fn emit_telemetry(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        let Some(sink) = &self.telemetry else {
            return Ok(());
        };

        let body = json!({
            "name": name,
            "at": Utc::now().to_rfc3339(),
            "payload": payload,
        });

        // Fire-and-forget: telemetry must never block or fail the request
        // being handled.
        let client = sink.client.clone();
        let endpoint = sink.endpoint.clone();
        let log_path = self.log_path.clone();
        std::thread::spawn(move || {
            if let Err(err) = client.post(&endpoint).json(&body).send() {
                let line = format!("{} TELEMETRY_ERROR error={}", Utc::now().to_rfc3339(), err);
                let _ = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .and_then(|mut f| writeln!(f, "{line}"));
            }
        });
        Ok(())
    }
}

fn telemetry_sink(cfg: &TelemetryConfig) -> Result<Option<TelemetrySink>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let Some(endpoint) = cfg.endpoint.clone() else {
        return Ok(None);
    };
    let client = Client::builder().timeout(Duration::from_secs(3)).build()?;
    Ok(Some(TelemetrySink { endpoint, client }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    fn sample_event() -> RequestEvent {
        RequestEvent::ReplyPersisted {
            message_id: "m1".to_string(),
            reply_id: Uuid::now_v7(),
            model_used: Some("a/one".to_string()),
            loops: 1,
        }
    }

    #[test]
    fn telemetry_disabled_does_not_require_endpoint() {
        let dir = std::env::temp_dir().join(format!("filmbuddy-observe-test-{}", Uuid::now_v7()));
        let observer = Observer::new(
            &dir,
            &TelemetryConfig {
                enabled: false,
                endpoint: None,
            },
        )
        .expect("observer");
        observer.record(&sample_event()).expect("record event");
    }

    #[test]
    fn set_verbose_toggles_mode() {
        let dir = std::env::temp_dir().join(format!("filmbuddy-observe-test-{}", Uuid::now_v7()));
        let mut observer = Observer::new(
            &dir,
            &TelemetryConfig {
                enabled: false,
                endpoint: None,
            },
        )
        .expect("observer");
        assert!(!observer.is_verbose());
        observer.set_verbose(true);
        assert!(observer.is_verbose());
        observer.set_verbose(false);
        assert!(!observer.is_verbose());
    }

    #[test]
    fn warn_log_writes_to_log_file() {
        let dir = std::env::temp_dir().join(format!("filmbuddy-observe-test-{}", Uuid::now_v7()));
        let observer = Observer::new(
            &dir,
            &TelemetryConfig {
                enabled: false,
                endpoint: None,
            },
        )
        .expect("observer");
        observer.warn_log("catalog unreachable");

        let log_content = fs::read_to_string(&observer.log_path).expect("read log");
        assert!(log_content.contains("WARN"));
        assert!(log_content.contains("catalog unreachable"));
    }

    #[test]
    fn telemetry_posts_when_enabled() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = vec![0_u8; 8192];
            let n = stream.read(&mut buf).expect("read request");
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
            request
        });

        let dir = std::env::temp_dir().join(format!("filmbuddy-observe-test-{}", Uuid::now_v7()));
        let observer = Observer::new(
            &dir,
            &TelemetryConfig {
                enabled: true,
                endpoint: Some(format!("http://{addr}/collect")),
            },
        )
        .expect("observer");
        observer.record(&sample_event()).expect("record event");
        let request = server.join().expect("join server");
        assert!(request.contains("POST /collect"));
        assert!(request.contains("request.event"));
    }
}
