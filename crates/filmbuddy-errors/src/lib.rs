//! Error taxonomy for the orchestration engine.
//!
//! Every upstream failure is classified into a stable code with a
//! retryable flag, an optional "culprit" pointer naming the exact
//! setting/credential likely responsible, and the full per-attempt log
//! (model, status, variant) gathered during routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable programmatic error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ErrorCode {
    /// No usable model or credentials configured.
    #[error("NOT_CONFIGURED")]
    #[serde(rename = "NOT_CONFIGURED")]
    NotConfigured,
    /// Credential rejected upstream (401/403).
    #[error("UNAUTHORIZED")]
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    /// Upstream or local rate limit.
    #[error("RATE_LIMITED")]
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    /// Payload rejected, usually a model/variant mismatch.
    #[error("BAD_REQUEST")]
    #[serde(rename = "BAD_REQUEST")]
    BadRequest,
    /// 5xx, timeout, or network failure.
    #[error("UPSTREAM_UNAVAILABLE")]
    #[serde(rename = "UPSTREAM_UNAVAILABLE")]
    UpstreamUnavailable,
    /// Model output failed schema validation after repair.
    #[error("VALIDATION_FAILED")]
    #[serde(rename = "VALIDATION_FAILED")]
    ValidationFailed,
    /// A tool rejected its arguments or state.
    #[error("TOOL_ERROR")]
    #[serde(rename = "TOOL_ERROR")]
    ToolError,
    #[error("DEADLINE_EXCEEDED")]
    #[serde(rename = "DEADLINE_EXCEEDED")]
    DeadlineExceeded,
}

impl ErrorCode {
    /// Transient codes drive automatic variant/model fallback; the rest
    /// fail fast.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::UpstreamUnavailable)
    }
}

/// Where a culprit value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CulpritSource {
    Config,
    Env,
    Computed,
    Default,
    Unknown,
}

/// The exact setting/credential likely responsible for a configuration
/// failure, for operator diagnosis. Never carries secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Culprit {
    /// e.g. `gateway.api_key_env`, `OPENROUTER_API_KEY`.
    pub var: String,
    pub source: CulpritSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Culprit {
    pub fn new(var: impl Into<String>, source: CulpritSource) -> Self {
        Self {
            var: var.into(),
            source,
            value_preview: None,
            note: None,
        }
    }

    pub fn with_preview(mut self, value: &str) -> Self {
        self.value_preview = Some(preview(value, 180));
        self
    }
}

/// One routing attempt, recorded regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub model: String,
    pub variant: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
    /// Upstream correlation id when the gateway returned one.
    #[serde(default)]
    pub upstream_request_id: Option<String>,
}

/// Structured failure envelope surfaced to callers and telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code}: {reason}")]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub reason: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culprit: Option<Culprit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            retryable: code.is_retryable(),
            culprit: None,
            status: None,
            model: None,
            attempts: Vec::new(),
        }
    }

    pub fn with_culprit(mut self, culprit: Culprit) -> Self {
        self.culprit = Some(culprit);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_attempts(mut self, attempts: Vec<Attempt>) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Classify an upstream failure from its HTTP status (None = transport
/// failure) and message text.
pub fn classify_upstream(status: Option<u16>, message: &str) -> ErrorCode {
    let lower = message.to_ascii_lowercase();
    if lower.contains("api_key") && (lower.contains("missing") || lower.contains("not set")) {
        return ErrorCode::NotConfigured;
    }
    match status {
        Some(401) | Some(403) => ErrorCode::Unauthorized,
        Some(429) => ErrorCode::RateLimited,
        Some(400) => ErrorCode::BadRequest,
        Some(s) if s >= 500 => ErrorCode::UpstreamUnavailable,
        Some(408) => ErrorCode::UpstreamUnavailable,
        Some(_) => {
            if lower.contains("unauthorized") || lower.contains("invalid api key") {
                ErrorCode::Unauthorized
            } else if lower.contains("rate limit") {
                ErrorCode::RateLimited
            } else {
                ErrorCode::UpstreamUnavailable
            }
        }
        None => ErrorCode::UpstreamUnavailable,
    }
}

/// Pull a human-useful message out of a gateway error body. Providers
/// return `{error:{message}}`, `{error:"..."}` or `{message:"..."}`.
pub fn upstream_error_message(body: &Value) -> Option<String> {
    if let Some(s) = body.as_str() {
        return Some(s.to_string());
    }
    if let Some(message) = body.get("message").and_then(|v| v.as_str()) {
        return Some(message.to_string());
    }
    match body.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(err) => err
            .get("message")
            .and_then(|v| v.as_str())
            .map(ToString::to_string),
        None => None,
    }
}

/// How much diagnostic detail a rendered message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetailMode {
    Friendly,
    Code,
    #[default]
    Technical,
}

/// Render a user-facing message for an envelope.
pub fn render_user_message(env: &ErrorEnvelope, mode: DetailMode) -> String {
    match mode {
        DetailMode::Friendly => {
            let headline = match env.code {
                ErrorCode::NotConfigured => "The assistant is not configured right now.",
                ErrorCode::Unauthorized => "Assistant credentials are invalid or missing.",
                ErrorCode::RateLimited => "The assistant is busy. Please try again in a moment.",
                ErrorCode::DeadlineExceeded => "That took too long to answer. Please try again.",
                ErrorCode::ValidationFailed => {
                    "The assistant returned a malformed answer. Please try again."
                }
                _ => "The assistant could not be reached in time. Please try again shortly.",
            };
            headline.to_string()
        }
        DetailMode::Code => {
            let mut out = format!("ASSISTANT_ERROR/{} — {}", env.code, env.reason);
            let mut bits = Vec::new();
            if let Some(status) = env.status {
                bits.push(format!("status={status}"));
            }
            if let Some(model) = &env.model {
                bits.push(format!("model={model}"));
            }
            if let Some(culprit) = &env.culprit {
                bits.push(format!("culprit={}", culprit.var));
            }
            if !bits.is_empty() {
                out.push('\n');
                out.push_str(&bits.join(" "));
            }
            out
        }
        DetailMode::Technical => {
            let mut parts = vec![format!("Assistant error: {}", env.code)];
            if let Some(status) = env.status {
                parts.push(format!("Status: {status}"));
            }
            if let Some(model) = &env.model {
                parts.push(format!("Model: {model}"));
            }
            if let Some(culprit) = &env.culprit {
                match &culprit.value_preview {
                    Some(v) => parts.push(format!("Culprit: {} = {}", culprit.var, v)),
                    None => parts.push(format!("Culprit: {}", culprit.var)),
                }
            }
            parts.push(format!("Reason: {}", env.reason));
            if !env.attempts.is_empty() {
                let tried: Vec<String> = env
                    .attempts
                    .iter()
                    .map(|a| {
                        format!(
                            "{}@{}={}",
                            a.model,
                            a.variant,
                            a.status.map_or("net".to_string(), |s| s.to_string())
                        )
                    })
                    .collect();
                parts.push(format!("Tried: {}", tried.join(", ")));
            }
            parts.join("\n")
        }
    }
}

/// Short, single-line preview of a value, never longer than `max`.
pub fn preview(value: &str, max: usize) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(max.saturating_sub(1)).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification_matches_status_classes() {
        assert_eq!(classify_upstream(Some(401), ""), ErrorCode::Unauthorized);
        assert_eq!(classify_upstream(Some(403), ""), ErrorCode::Unauthorized);
        assert_eq!(classify_upstream(Some(429), ""), ErrorCode::RateLimited);
        assert_eq!(classify_upstream(Some(400), ""), ErrorCode::BadRequest);
        assert_eq!(
            classify_upstream(Some(503), ""),
            ErrorCode::UpstreamUnavailable
        );
        assert_eq!(classify_upstream(None, "connection refused"), ErrorCode::UpstreamUnavailable);
    }

    #[test]
    fn missing_key_is_not_configured() {
        assert_eq!(
            classify_upstream(None, "OPENROUTER_API_KEY missing"),
            ErrorCode::NotConfigured
        );
    }

    #[test]
    fn retryable_flags_follow_taxonomy() {
        assert!(ErrorCode::RateLimited.is_retryable());
        assert!(ErrorCode::UpstreamUnavailable.is_retryable());
        assert!(!ErrorCode::Unauthorized.is_retryable());
        assert!(!ErrorCode::BadRequest.is_retryable());
        assert!(!ErrorCode::NotConfigured.is_retryable());
    }

    #[test]
    fn extracts_nested_upstream_messages() {
        assert_eq!(
            upstream_error_message(&json!({"error": {"message": "model not found"}})),
            Some("model not found".to_string())
        );
        assert_eq!(
            upstream_error_message(&json!({"error": "bad payload"})),
            Some("bad payload".to_string())
        );
        assert_eq!(
            upstream_error_message(&json!({"message": "nope"})),
            Some("nope".to_string())
        );
        assert_eq!(upstream_error_message(&json!({"ok": true})), None);
    }

    #[test]
    fn technical_rendering_names_the_culprit_and_attempts() {
        let env = ErrorEnvelope::new(ErrorCode::Unauthorized, "Upstream returned 401")
            .with_status(401)
            .with_model("meta-llama/llama-3.3-70b-instruct")
            .with_culprit(
                Culprit::new("OPENROUTER_API_KEY", CulpritSource::Env).with_preview("sk-or-…"),
            )
            .with_attempts(vec![Attempt {
                model: "meta-llama/llama-3.3-70b-instruct".to_string(),
                variant: "base".to_string(),
                status: Some(401),
                message: Some("invalid api key".to_string()),
                upstream_request_id: None,
            }]);
        let msg = render_user_message(&env, DetailMode::Technical);
        assert!(msg.contains("UNAUTHORIZED"));
        assert!(msg.contains("OPENROUTER_API_KEY"));
        assert!(msg.contains("base=401"));
    }

    #[test]
    fn friendly_rendering_hides_internals() {
        let env = ErrorEnvelope::new(ErrorCode::RateLimited, "Upstream returned 429")
            .with_status(429);
        let msg = render_user_message(&env, DetailMode::Friendly);
        assert!(!msg.contains("429"));
        assert!(msg.to_lowercase().contains("busy"));
    }

    #[test]
    fn preview_collapses_whitespace_and_truncates() {
        assert_eq!(preview("a  b\n c", 20), "a b c");
        let long = "x".repeat(50);
        let shortened = preview(&long, 10);
        assert!(shortened.chars().count() <= 10);
        assert!(shortened.ends_with('…'));
    }
}
