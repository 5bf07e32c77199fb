//! Scripted collaborators shared by the agent crate's tests.

use filmbuddy_core::{
    ChatMessage, ChatRequest, StreamCallback, ToolCall, ToolDefinition, ToolResult,
};
use filmbuddy_errors::{ErrorCode, ErrorEnvelope};
use filmbuddy_gateway::{LlmGateway, RouteOutcome};
use filmbuddy_tools::{ToolRegistry, default_definitions};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

pub struct ScriptedGateway {
    outcomes: Mutex<VecDeque<Result<RouteOutcome, ErrorEnvelope>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedGateway {
    pub fn new(outcomes: Vec<Result<RouteOutcome, ErrorEnvelope>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmGateway for ScriptedGateway {
    fn route(&self, req: &ChatRequest) -> Result<RouteOutcome, ErrorEnvelope> {
        self.requests.lock().unwrap().push(req.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ErrorEnvelope::new(
                    ErrorCode::UpstreamUnavailable,
                    "scripted gateway exhausted",
                ))
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

pub fn plain_outcome(content: &str, finish_reason: &str) -> RouteOutcome {
    RouteOutcome {
        content: content.to_string(),
        model_used: "meta-llama/llama-3.3-70b-instruct".to_string(),
        variant_used: "base".to_string(),
        finish_reason: finish_reason.to_string(),
        raw: json!({}),
    }
}

/// A completion carrying a final agent turn.
pub fn final_turn(text: &str) -> RouteOutcome {
    plain_outcome(&json!({"type": "final", "text": text}).to_string(), "stop")
}

/// A completion carrying a batch of tool calls.
pub fn tool_turn(calls: Value) -> RouteOutcome {
    plain_outcome(&json!({"type": "tool", "calls": calls}).to_string(), "stop")
}

pub fn base_request(deadline: chrono::DateTime<chrono::Utc>) -> ChatRequest {
    ChatRequest::new(
        Uuid::now_v7(),
        vec![ChatMessage::user("hi")],
        vec!["meta-llama/llama-3.3-70b-instruct".to_string()],
        "http://127.0.0.1:1/v1",
        chrono::Duration::seconds(12),
        deadline,
    )
}

/// Registry returning scripted payloads per tool and recording every
/// execution.
pub struct StubRegistry {
    results: Mutex<HashMap<String, Value>>,
    executed: Mutex<Vec<ToolCall>>,
}

impl StubRegistry {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with(self, tool: &str, result: Value) -> Self {
        self.results.lock().unwrap().insert(tool.to_string(), result);
        self
    }

    pub fn executed(&self) -> Vec<ToolCall> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_tools(&self) -> Vec<String> {
        self.executed().into_iter().map(|c| c.tool).collect()
    }
}

impl Default for StubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry for StubRegistry {
    fn execute(&self, _user_id: &str, call: &ToolCall) -> ToolResult {
        self.executed.lock().unwrap().push(call.clone());
        match self.results.lock().unwrap().get(call.tool.as_str()) {
            Some(value) => ToolResult::ok(value.clone()),
            None => ToolResult::err("TOOL_ERROR", "unscripted tool"),
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        default_definitions()
    }
}
