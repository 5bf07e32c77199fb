//! Offline smoke harness: the full orchestrator stack wired to a canned
//! gateway, so an end-to-end reply can be exercised without the network.

use anyhow::Result;
use filmbuddy_agent::{HandleOutcome, InboundMessage, RequestOrchestrator};
use filmbuddy_core::{
    AppConfig, ChatRequest, Clock, SharedClock, StreamCallback, SystemClock, TelemetryConfig,
    ToolCall, ToolDefinition, ToolResult,
};
use filmbuddy_errors::ErrorEnvelope;
use filmbuddy_gateway::{LlmGateway, RouteOutcome};
use filmbuddy_observe::Observer;
use filmbuddy_store::MemoryStore;
use filmbuddy_tools::{ToolRegistry, default_definitions};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Gateway that answers every request with the same final agent turn.
pub struct CannedGateway {
    reply: String,
}

impl CannedGateway {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
        }
    }
}

impl LlmGateway for CannedGateway {
    fn route(&self, _req: &ChatRequest) -> Result<RouteOutcome, ErrorEnvelope> {
        Ok(RouteOutcome {
            content: json!({"type": "final", "text": self.reply}).to_string(),
            model_used: "meta-llama/llama-3.3-70b-instruct".to_string(),
            variant_used: "base".to_string(),
            finish_reason: "stop".to_string(),
            raw: json!({}),
        })
    }

    fn route_stream(
        &self,
        req: &ChatRequest,
        _cb: StreamCallback,
    ) -> Result<RouteOutcome, ErrorEnvelope> {
        self.route(req)
    }
}

/// Registry that answers every tool with an empty-but-ok payload.
pub struct EmptyRegistry;

impl ToolRegistry for EmptyRegistry {
    fn execute(&self, _user_id: &str, _call: &ToolCall) -> ToolResult {
        ToolResult::ok(json!({"items": []}))
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        default_definitions()
    }
}

/// Drive one inbound message through the full stack and return the
/// persisted reply text.
pub fn run_reply_smoke(dir: &Path, canned_reply: &str, user_text: &str) -> Result<String> {
    let store = Arc::new(MemoryStore::default());
    let observer = Arc::new(Observer::new(
        dir,
        &TelemetryConfig {
            enabled: false,
            endpoint: None,
        },
    )?);
    let clock: SharedClock = Arc::new(SystemClock);
    let orchestrator = RequestOrchestrator::new(
        AppConfig::default(),
        Arc::new(CannedGateway::new(canned_reply)),
        Arc::new(EmptyRegistry),
        store.clone(),
        store,
        observer,
        clock.clone(),
    );
    let inbound = InboundMessage {
        message_id: format!("smoke-{}", Uuid::now_v7()),
        conversation_id: Uuid::now_v7(),
        user_id: "smoke-user".to_string(),
        text: user_text.to_string(),
        history: Vec::new(),
        received_at: clock.now(),
    };
    match orchestrator.handle(&inbound)? {
        HandleOutcome::Replied(record) => Ok(record.reply.text),
        other => anyhow::bail!("smoke request was gated: {other:?}"),
    }
}
