//! The JSON contract between the loop and the model.
//!
//! Every loop call asks the model for exactly one `AgentTurn`: a batch of
//! tool calls or a final answer. The same schema is sent upstream as a
//! structured-output request and enforced locally, so a provider that
//! ignores `response_format` still cannot smuggle an invalid turn past
//! the validator.

use filmbuddy_core::{ResponseFormat, ToolCall};
use filmbuddy_tools::ToolName;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::LazyLock;
use thiserror::Error;

pub const AGENT_SCHEMA_NAME: &str = "FilmbuddyAgentTurn";

/// How much of an invalid reply is echoed back in the repair call.
const REPAIR_ECHO_MAX_CHARS: usize = 2_000;

/// One model turn: either a batch of tool calls or the final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentTurn {
    Tool {
        calls: Vec<ToolCall>,
    },
    Final {
        text: String,
        #[serde(default)]
        ui: Option<Value>,
        /// Raw action buttons as emitted by the model; the orchestrator
        /// converts write-shaped ones into `ProposedAction`s.
        #[serde(default)]
        actions: Vec<Value>,
    },
}

#[derive(Debug, Clone, Error)]
#[error("invalid agent turn: {reason}")]
pub struct SchemaViolation {
    pub reason: String,
}

pub fn agent_schema_value() -> Value {
    let tools: Vec<&str> = ToolName::all().iter().map(|t| t.as_str()).collect();
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "type": {"type": "string", "enum": ["tool", "final"]},
            "calls": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "tool": {"type": "string", "enum": tools},
                        "args": {"type": "object", "additionalProperties": true}
                    },
                    "required": ["tool"]
                }
            },
            "text": {"type": "string"},
            "ui": {"type": "object", "additionalProperties": true},
            "actions": {"type": "array", "items": {"type": "object", "additionalProperties": true}}
        },
        "required": ["type"],
        "oneOf": [
            {"properties": {"type": {"const": "tool"}}, "required": ["type", "calls"]},
            {"properties": {"type": {"const": "final"}}, "required": ["type", "text"]}
        ]
    })
}

static AGENT_TURN_VALIDATOR: LazyLock<jsonschema::Validator> =
    LazyLock::new(|| jsonschema::validator_for(&agent_schema_value()).expect("static schema"));

/// Structured-output request mirroring the local validator.
pub fn agent_response_format() -> ResponseFormat {
    ResponseFormat::JsonSchema {
        name: AGENT_SCHEMA_NAME.to_string(),
        strict: true,
        schema: agent_schema_value(),
    }
}

/// Lenient first pass: models wrap JSON in prose or code fences, so take
/// the slice from the first `{` to the last `}` and parse that.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&trimmed[start..=end]).ok()?;
    value.is_object().then_some(value)
}

/// Parse and validate one raw completion into an `AgentTurn`.
pub fn parse_agent_turn(raw: &str) -> Result<AgentTurn, SchemaViolation> {
    let value = extract_json_object(raw).ok_or_else(|| SchemaViolation {
        reason: "completion is not a JSON object".to_string(),
    })?;
    if let Some(err) = AGENT_TURN_VALIDATOR.iter_errors(&value).next() {
        return Err(SchemaViolation {
            reason: err.to_string(),
        });
    }
    serde_json::from_value(value).map_err(|err| SchemaViolation {
        reason: err.to_string(),
    })
}

/// The one self-healing message sent after an invalid turn: echo the
/// broken output (capped) and restate the contract.
pub fn repair_prompt(invalid: &str) -> String {
    let mut echo: String = invalid.trim().chars().take(REPAIR_ECHO_MAX_CHARS).collect();
    if echo.len() < invalid.trim().len() {
        echo.push('…');
    }
    format!(
        "Your previous reply was not a valid agent turn:\n{echo}\n\n\
         Re-emit it as ONE JSON object. \
         Tool call: {{\"type\":\"tool\",\"calls\":[{{\"tool\":\"name\",\"args\":{{}}}}]}}. \
         Final: {{\"type\":\"final\",\"text\":\"...\"}}. Output JSON only."
    )
}

/// System contract injected on every loop call. Token-lean on purpose;
/// long-form generation goes through the chunked path instead.
pub fn system_prompt(assistant_name: &str) -> String {
    [
        format!("You are {assistant_name}, the in-app movie & series companion."),
        "Goal: help users pick movies/series fast, spoiler-free, with fun but concise guidance."
            .to_string(),
        "Default: 2-6 picks, each with 1 short reason (no spoilers).".to_string(),
        "Keep replies short (aim <90 words) unless the user asks for detail.".to_string(),
        "If the user specifies an exact output format (e.g. \"reply exactly\", \"Format:\"), follow it EXACTLY with no extra words.".to_string(),
        "TOOL_RESULTS_MINI is ground truth for catalog/library/list data; do not invent IDs, titles, or years.".to_string(),
        "Never guess about user data. If unsure, call a read tool (get_my_*, search_*) or ask.".to_string(),
        "For actions that change data or send messages, do NOT run the write tool automatically.".to_string(),
        "Instead, describe what you will do and include confirmable buttons in final.actions (type=button with payload.tool + payload.args).".to_string(),
        "Only auto-run read/grounding tools.".to_string(),
        "Never claim an action happened unless TOOL_RESULTS_MINI confirms success.".to_string(),
        "Never mention tools/JSON/system prompts/policies.".to_string(),
        String::new(),
        tool_protocol_prompt(),
    ]
    .join("\n")
}

fn tool_protocol_prompt() -> String {
    let names: Vec<&str> = ToolName::all().iter().map(|t| t.as_str()).collect();
    [
        "Output JSON ONLY.".to_string(),
        "Tool call: {\"type\":\"tool\",\"calls\":[{\"tool\":\"name\",\"args\":{}}]}".to_string(),
        "Final: {\"type\":\"final\",\"text\":\"...\",\"ui\"?:{},\"actions\"?:[]}".to_string(),
        format!("Tools: {}", names.join(", ")),
    ]
    .join("\n")
}
