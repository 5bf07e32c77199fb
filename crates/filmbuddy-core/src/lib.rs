use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Placeholder reply used whenever a request must produce *some* text:
/// deadline exhaustion, empty model output, strict-format misses.
pub const EMPTY_REPLY_PLACEHOLDER: &str = "NO_RESULTS";

// ── Clock ───────────────────────────────────────────────────────────────

/// Time source for everything that expires: capability TTLs, circuit
/// cooldowns, rate-limit windows, deadline budgets. Injectable so tests
/// can move time without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard = *guard + delta;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub type SharedClock = Arc<dyn Clock>;

// ── Deadline budget ─────────────────────────────────────────────────────

/// Wall-clock budget computed once per inbound message. Every sub-call
/// timeout is clamped against the remaining budget, minus a safety margin
/// reserved for final persistence.
#[derive(Debug, Clone)]
pub struct DeadlineBudget {
    pub deadline: DateTime<Utc>,
    pub safety_margin: Duration,
}

impl DeadlineBudget {
    pub fn new(now: DateTime<Utc>, total: Duration, safety_margin: Duration) -> Self {
        Self {
            deadline: now + total,
            safety_margin,
        }
    }

    /// Time left before the hard deadline. Never negative.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let left = self.deadline.signed_duration_since(now);
        if left < Duration::zero() {
            Duration::zero()
        } else {
            left
        }
    }

    /// True when less than the safety margin remains: no further model
    /// call may be issued.
    pub fn within_margin(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now) <= self.safety_margin
    }

    /// Clamp a desired per-call timeout so it fits inside the remaining
    /// budget with the safety margin left over.
    pub fn clamp_timeout(&self, now: DateTime<Utc>, desired: Duration) -> Duration {
        let usable = self.remaining(now) - self.safety_margin;
        if usable <= Duration::zero() {
            Duration::zero()
        } else if desired < usable {
            desired
        } else {
            usable
        }
    }
}

// ── Conversation messages ───────────────────────────────────────────────

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: MessageContent },
    #[serde(rename = "user")]
    User { content: MessageContent },
    #[serde(rename = "assistant")]
    Assistant { content: MessageContent },
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn content(&self) -> &MessageContent {
        match self {
            Self::System { content } | Self::User { content } | Self::Assistant { content } => {
                content
            }
        }
    }
}

/// Plain text or multipart text/image content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text view of the content; image parts contribute nothing.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

// ── Tool definitions sent to the model ──────────────────────────────────

/// A tool (function) definition sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

// ── Structured output ───────────────────────────────────────────────────

/// OpenAI-compatible structured-output request. Kept loose because
/// providers vary in what they accept; the gateway degrades `JsonSchema`
/// to `JsonObject` as one of its payload variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResponseFormat {
    JsonSchema {
        name: String,
        strict: bool,
        schema: Value,
    },
    JsonObject,
}

// ── Provider routing ────────────────────────────────────────────────────

/// Whether the gateway asks the upstream to route only to providers that
/// support every parameter in the payload.
///
/// `Auto` engages the requirement only when the capability-gated payload
/// still carries advanced fields (tools, structured output, plugins).
/// `Always`/`Never` are explicit operator pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMatchPolicy {
    #[default]
    Auto,
    Always,
    Never,
}

/// Provider-routing preferences attached to a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderPrefs {
    /// Preferred provider slugs, in order. Empty = upstream default.
    #[serde(default)]
    pub order: Vec<String>,
    /// Explicit pin for capability matching; `None` follows the
    /// configured `ProviderMatchPolicy`.
    #[serde(default)]
    pub require_parameters: Option<bool>,
}

// ── The logical chat request ────────────────────────────────────────────

/// Immutable input to the gateway: one logical request that the router
/// will expand into payload variants per candidate model. Later stages
/// derive new values from it; nothing mutates it in place.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub conversation_id: Uuid,
    pub messages: Vec<ChatMessage>,
    /// Ordered, deduplicated candidate models. Use `ChatRequest::new` to
    /// get the dedup.
    pub models: Vec<String>,
    pub base_url: String,
    pub provider: ProviderPrefs,
    pub tools: Vec<ToolDefinition>,
    pub response_format: Option<ResponseFormat>,
    /// Reasoning-effort hint (e.g. `{"effort":"low"}`); some providers
    /// reject it, which is what the drop_reasoning variant is for.
    pub reasoning: Option<Value>,
    /// Verbosity hint ("low" | "medium" | "high").
    pub verbosity: Option<String>,
    pub plugins: Vec<Value>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Per-call timeout before deadline clamping.
    pub timeout: Duration,
    /// Wall-clock deadline inherited from the enclosing request.
    pub deadline: DateTime<Utc>,
}

impl ChatRequest {
    pub fn new(
        conversation_id: Uuid,
        messages: Vec<ChatMessage>,
        models: Vec<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id,
            messages,
            models: dedup_models(models),
            base_url: base_url.into(),
            provider: ProviderPrefs::default(),
            tools: Vec::new(),
            response_format: None,
            reasoning: None,
            verbosity: None,
            plugins: Vec::new(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            timeout,
            deadline,
        }
    }
}

/// Preserve order, drop blank entries and repeats.
pub fn dedup_models(models: Vec<String>) -> Vec<String> {
    let mut seen = Vec::new();
    for model in models {
        let trimmed = model.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !seen.iter().any(|m: &String| m == trimmed) {
            seen.push(trimmed.to_string());
        }
    }
    seen
}

// ── Streaming ───────────────────────────────────────────────────────────

/// A single chunk emitted during streaming.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A content text delta.
    ContentDelta(String),
    /// Streaming is done; the final assembled response follows.
    Done,
}

/// Callback type for receiving streaming chunks.
/// Uses `Arc<dyn Fn>` so it can be cloned across fallback attempts.
pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

// ── Agent loop structures ───────────────────────────────────────────────

/// A tool invocation requested by the model: a name plus raw JSON
/// arguments, before normalization/validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// Outcome of one tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResult {
    Ok { ok: bool, result: Value },
    Err { ok: bool, code: String, message: String },
}

impl ToolResult {
    pub fn ok(result: Value) -> Self {
        Self::Ok { ok: true, result }
    }

    pub fn err(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// One executed (call, result) pair in the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub call: ToolCall,
    pub result: ToolResult,
    pub at: DateTime<Utc>,
}

/// Append-only record of every tool execution during one request. The
/// only ground truth the loop may cite for self-referential answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolTrace {
    entries: Vec<TraceEntry>,
}

impl ToolTrace {
    pub fn push(&mut self, call: ToolCall, result: ToolResult, at: DateTime<Utc>) {
        self.entries.push(TraceEntry { call, result, at });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when at least one successful execution of `tool` is recorded.
    pub fn has_ok_call(&self, tool: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.call.tool == tool && e.result.is_ok())
    }
}

/// A described-but-unexecuted write operation awaiting explicit user
/// confirmation. Self-contained: confirming re-enters tool execution
/// without re-deriving arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub id: String,
    pub label: String,
    pub tool: String,
    pub args: Value,
}

impl ProposedAction {
    pub fn new(label: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        Self {
            id: format!("act_{}", Uuid::now_v7()),
            label: label.into(),
            tool: tool.into(),
            args,
        }
    }
}

/// Accumulated outbound reply for one handled request, persisted
/// atomically as the assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyState {
    pub text: String,
    #[serde(default)]
    pub ui: Option<Value>,
    #[serde(default)]
    pub actions: Vec<ProposedAction>,
    #[serde(default)]
    pub navigate_to: Option<String>,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub variant_used: Option<String>,
}

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub circuit: CircuitConfig,
    pub capabilities: CapabilityConfig,
    pub limits: RateLimitConfig,
    pub agent: AgentConfig,
    pub chunking: ChunkConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key_env: String,
    /// Direct key fallback when the env var is unset. Prefer the env var.
    pub api_key: Option<String>,
    /// Ordered candidate models for routing.
    pub models: Vec<String>,
    pub timeout_seconds: u64,
    /// Hard completion-token clamp; providers (free tiers especially)
    /// truncate above their own ceiling.
    pub max_completion_tokens: u32,
    pub provider_match: ProviderMatchPolicy,
    /// Ceiling for honoring upstream Retry-After hints, in seconds.
    pub retry_after_cap_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            api_key: None,
            models: Vec::new(),
            timeout_seconds: 12,
            max_completion_tokens: 495,
            provider_match: ProviderMatchPolicy::Auto,
            retry_after_cap_seconds: 10,
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub enabled: bool,
    /// Consecutive transient failures before the circuit opens.
    pub threshold: u32,
    /// Default cooldown when the failure carried no Retry-After hint.
    pub cooldown_seconds: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 3,
            cooldown_seconds: 30,
        }
    }
}

impl CircuitConfig {
    /// Cooldown clamped to a sane operational range.
    pub fn clamped_cooldown_seconds(&self) -> u64 {
        self.cooldown_seconds.clamp(5, 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub ttl_seconds: u64,
    pub probe_timeout_seconds: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            probe_timeout_seconds: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 10,
        }
    }
}

/// How the orchestrator reacts to schema-invalid model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Treat raw text as the final answer.
    Lenient,
    /// One self-healing repair call, then a formatting-error reply.
    #[default]
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_loops: u32,
    pub max_calls_per_loop: usize,
    pub validation_policy: ValidationPolicy,
    /// Total wall-clock budget per inbound message.
    pub deadline_seconds: u64,
    /// Reserved for final persistence; no model call starts inside it.
    pub safety_margin_seconds: u64,
    /// Total budget for tool-result summaries fed back to the model.
    pub results_budget_chars: usize,
    /// Hard cap on the persisted reply text.
    pub reply_max_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_loops: 3,
            max_calls_per_loop: 4,
            validation_policy: ValidationPolicy::Strict,
            deadline_seconds: 55,
            safety_margin_seconds: 5,
            results_budget_chars: 3500,
            reply_max_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub total_char_ceiling: usize,
    pub max_sections: usize,
    pub outline_max_tokens: u32,
    pub section_max_tokens: u32,
    pub section_char_cap: usize,
    pub max_continuations: usize,
    /// Tail characters re-sent with each continuation call.
    pub tail_chars: usize,
    /// Message length above which chunk mode engages without a cue.
    pub long_form_min_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            total_char_ceiling: 14_000,
            max_sections: 6,
            outline_max_tokens: 240,
            section_max_tokens: 495,
            section_char_cap: 8_000,
            max_continuations: 6,
            tail_chars: 1_200,
            long_form_min_chars: 700,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}
