//! Payload variant ladder.
//!
//! One logical request expands into an ordered list of wire payloads,
//! most-featured first. Providers reject optional fields inconsistently,
//! so the router walks this ladder instead of failing hard on the first
//! 400. The ordering is a correctness requirement: a stripped variant
//! must never be sent before a richer one has been tried, otherwise
//! requested behavior is silently lost.

use filmbuddy_core::{
    ChatMessage, ChatRequest, GatewayConfig, MessageContent, ProviderMatchPolicy, ResponseFormat,
};
use serde_json::{Value, json};

/// Stable compatibility label for one payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantTag {
    Base,
    DropReasoning,
    DropVerbosity,
    LooseJson,
    DropPlugins,
    DropPluginsLooseJson,
    DropTools,
    Bare,
}

impl VariantTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::DropReasoning => "drop_reasoning",
            Self::DropVerbosity => "drop_verbosity",
            Self::LooseJson => "loose_json",
            Self::DropPlugins => "drop_plugins",
            Self::DropPluginsLooseJson => "drop_plugins_loose_json",
            Self::DropTools => "drop_tools",
            Self::Bare => "bare",
        }
    }
}

/// A (tag, payload) pair. The payload still carries a `model` placeholder
/// replaced per candidate by the router.
#[derive(Debug, Clone)]
pub struct PayloadVariant {
    pub tag: VariantTag,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy)]
struct VariantShape {
    tag: VariantTag,
    reasoning: bool,
    verbosity: bool,
    loose_json: bool,
    plugins: bool,
    tools: bool,
}

const FULL: VariantShape = VariantShape {
    tag: VariantTag::Base,
    reasoning: true,
    verbosity: true,
    loose_json: false,
    plugins: true,
    tools: true,
};

/// Build the ordered variant ladder for one logical request. Built once
/// per request, not per model; capability gating and structural dedup
/// happen per model afterwards.
pub fn build_variants(req: &ChatRequest, cfg: &GatewayConfig) -> Vec<PayloadVariant> {
    let mut shapes = vec![FULL];
    if req.reasoning.is_some() {
        shapes.push(VariantShape {
            tag: VariantTag::DropReasoning,
            reasoning: false,
            ..FULL
        });
    }
    if req.verbosity.is_some() {
        shapes.push(VariantShape {
            tag: VariantTag::DropVerbosity,
            verbosity: false,
            ..FULL
        });
    }
    if matches!(req.response_format, Some(ResponseFormat::JsonSchema { .. })) {
        shapes.push(VariantShape {
            tag: VariantTag::LooseJson,
            loose_json: true,
            ..FULL
        });
    }
    if !req.plugins.is_empty() {
        shapes.push(VariantShape {
            tag: VariantTag::DropPlugins,
            plugins: false,
            ..FULL
        });
        if matches!(req.response_format, Some(ResponseFormat::JsonSchema { .. })) {
            shapes.push(VariantShape {
                tag: VariantTag::DropPluginsLooseJson,
                plugins: false,
                loose_json: true,
                ..FULL
            });
        }
    }
    if !req.tools.is_empty() {
        shapes.push(VariantShape {
            tag: VariantTag::DropTools,
            tools: false,
            ..FULL
        });
    }
    shapes.push(VariantShape {
        tag: VariantTag::Bare,
        reasoning: false,
        verbosity: false,
        loose_json: false,
        plugins: false,
        tools: false,
    });

    shapes
        .into_iter()
        .map(|shape| PayloadVariant {
            tag: shape.tag,
            payload: build_payload(req, cfg, shape),
        })
        .collect()
}

fn build_payload(req: &ChatRequest, cfg: &GatewayConfig, shape: VariantShape) -> Value {
    let messages: Vec<Value> = req.messages.iter().map(message_to_value).collect();

    let mut payload = json!({
        "model": "",
        "messages": messages,
        "temperature": req.temperature.unwrap_or(0.1),
        "top_p": req.top_p.unwrap_or(1.0),
        "max_tokens": clamp_max_tokens(req.max_tokens, cfg.max_completion_tokens),
        "usage": { "include": true }
    });

    if shape.reasoning && let Some(reasoning) = &req.reasoning {
        payload["reasoning"] = reasoning.clone();
    }
    if shape.verbosity && let Some(verbosity) = &req.verbosity {
        payload["verbosity"] = json!(verbosity);
    }
    if shape.plugins && !req.plugins.is_empty() {
        payload["plugins"] = json!(req.plugins);
    }
    if shape.tools && !req.tools.is_empty() {
        payload["tools"] = serde_json::to_value(&req.tools).unwrap_or(json!([]));
        payload["tool_choice"] = json!("auto");
    }
    // Shape::Bare also drops response_format entirely.
    if shape.tag != VariantTag::Bare
        && let Some(format) = &req.response_format
    {
        payload["response_format"] = if shape.loose_json {
            json!({ "type": "json_object" })
        } else {
            response_format_to_value(format)
        };
    }
    if !req.provider.order.is_empty() {
        payload["provider"] = json!({ "order": req.provider.order });
    }
    payload
}

fn message_to_value(message: &ChatMessage) -> Value {
    let (role, content) = match message {
        ChatMessage::System { content } => ("system", content),
        ChatMessage::User { content } => ("user", content),
        ChatMessage::Assistant { content } => ("assistant", content),
    };
    match content {
        MessageContent::Text(text) => json!({ "role": role, "content": text }),
        MessageContent::Parts(parts) => json!({
            "role": role,
            "content": serde_json::to_value(parts).unwrap_or(json!([]))
        }),
    }
}

fn response_format_to_value(format: &ResponseFormat) -> Value {
    match format {
        ResponseFormat::JsonSchema {
            name,
            strict,
            schema,
        } => json!({
            "type": "json_schema",
            "json_schema": { "name": name, "strict": strict, "schema": schema }
        }),
        ResponseFormat::JsonObject => json!({ "type": "json_object" }),
    }
}

/// Clamp completion tokens below the provider ceiling to avoid upstream
/// truncation.
pub fn clamp_max_tokens(requested: Option<u32>, cap: u32) -> u32 {
    let cap = cap.max(1);
    requested.unwrap_or(cap).clamp(1, cap)
}

/// Names the gateway consults in a model's `supported_parameters` list
/// before shipping the matching payload field.
const GATED_FIELDS: &[(&str, &str)] = &[
    ("tools", "tools"),
    ("tool_choice", "tool_choice"),
    ("plugins", "plugins"),
    ("reasoning", "reasoning"),
    ("verbosity", "verbosity"),
    ("temperature", "temperature"),
    ("top_p", "top_p"),
];

/// Strip payload fields the model's capability set does not list.
/// `None` capabilities mean "unknown": assume supported rather than
/// over-strip.
pub fn gate_payload(payload: &Value, capabilities: Option<&indexmap::IndexSet<String>>) -> Value {
    let Some(caps) = capabilities else {
        return payload.clone();
    };
    let mut gated = payload.clone();
    let Some(obj) = gated.as_object_mut() else {
        return gated;
    };
    for (field, capability) in GATED_FIELDS {
        if obj.contains_key(*field) && !caps.contains(*capability) {
            obj.remove(*field);
        }
    }
    if let Some(format) = obj.get("response_format") {
        let is_strict = format
            .get("type")
            .and_then(|v| v.as_str())
            .is_some_and(|t| t == "json_schema");
        if !caps.contains("response_format") {
            obj.remove("response_format");
        } else if is_strict && !caps.contains("structured_outputs") {
            obj.insert("response_format".to_string(), json!({ "type": "json_object" }));
        }
    }
    gated
}

/// True when the payload still carries fields only some providers
/// implement.
pub fn has_advanced_fields(payload: &Value) -> bool {
    payload.get("tools").is_some()
        || payload.get("response_format").is_some()
        || payload.get("plugins").is_some()
}

/// Decide whether to ask the upstream for capability-matched providers.
/// An explicit request-level pin wins; otherwise `Auto` engages the
/// requirement exactly when advanced fields survived gating.
pub fn should_require_matched_providers(
    policy: ProviderMatchPolicy,
    pin: Option<bool>,
    gated_payload: &Value,
) -> bool {
    if let Some(pinned) = pin {
        return pinned;
    }
    match policy {
        ProviderMatchPolicy::Always => true,
        ProviderMatchPolicy::Never => false,
        ProviderMatchPolicy::Auto => has_advanced_fields(gated_payload),
    }
}

/// Apply the provider-matching decision to a gated payload.
pub fn apply_provider_requirement(payload: &mut Value, require: bool) {
    if !require {
        return;
    }
    match payload.get_mut("provider") {
        Some(Value::Object(provider)) => {
            provider.insert("require_parameters".to_string(), json!(true));
        }
        _ => {
            payload["provider"] = json!({ "require_parameters": true });
        }
    }
}

/// Drop structurally identical payloads, keeping the first (richest)
/// occurrence. Capability gating collapses neighbors in the ladder.
pub fn dedup_variants(variants: Vec<PayloadVariant>) -> Vec<PayloadVariant> {
    let mut out: Vec<PayloadVariant> = Vec::with_capacity(variants.len());
    for variant in variants {
        if !out.iter().any(|seen| seen.payload == variant.payload) {
            out.push(variant);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use filmbuddy_core::ToolDefinition;
    use indexmap::IndexSet;
    use uuid::Uuid;

    fn full_request() -> ChatRequest {
        let mut req = ChatRequest::new(
            Uuid::now_v7(),
            vec![ChatMessage::user("hello")],
            vec!["a/one".to_string()],
            "http://localhost:0/api/v1",
            ChronoDuration::seconds(12),
            Utc::now() + ChronoDuration::seconds(55),
        );
        req.reasoning = Some(json!({"effort": "low"}));
        req.verbosity = Some("low".to_string());
        req.plugins = vec![json!({"id": "response-healing"})];
        req.tools = vec![ToolDefinition::function(
            "search_catalog",
            "Search the catalog",
            json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        )];
        req.response_format = Some(ResponseFormat::JsonSchema {
            name: "agent_turn".to_string(),
            strict: true,
            schema: json!({"type": "object"}),
        });
        req
    }

    #[test]
    fn ladder_is_ordered_richest_first() {
        let req = full_request();
        let variants = build_variants(&req, &GatewayConfig::default());
        let tags: Vec<&str> = variants.iter().map(|v| v.tag.as_str()).collect();
        assert_eq!(
            tags,
            vec![
                "base",
                "drop_reasoning",
                "drop_verbosity",
                "loose_json",
                "drop_plugins",
                "drop_plugins_loose_json",
                "drop_tools",
                "bare",
            ]
        );
        // Base keeps everything; bare keeps nothing advanced.
        assert!(variants[0].payload.get("tools").is_some());
        assert!(variants[0].payload.get("reasoning").is_some());
        let bare = &variants[tags.len() - 1].payload;
        assert!(bare.get("tools").is_none());
        assert!(bare.get("plugins").is_none());
        assert!(bare.get("response_format").is_none());
        assert!(bare.get("reasoning").is_none());
    }

    #[test]
    fn plain_request_builds_base_and_bare_only() {
        let req = ChatRequest::new(
            Uuid::now_v7(),
            vec![ChatMessage::user("hi")],
            vec!["a/one".to_string()],
            "http://localhost:0/api/v1",
            ChronoDuration::seconds(12),
            Utc::now() + ChronoDuration::seconds(55),
        );
        let variants = build_variants(&req, &GatewayConfig::default());
        let tags: Vec<&str> = variants.iter().map(|v| v.tag.as_str()).collect();
        assert_eq!(tags, vec!["base", "bare"]);
        // Identical payloads collapse after dedup.
        assert_eq!(dedup_variants(variants).len(), 1);
    }

    #[test]
    fn max_tokens_clamped_to_provider_cap() {
        assert_eq!(clamp_max_tokens(Some(2000), 495), 495);
        assert_eq!(clamp_max_tokens(Some(100), 495), 100);
        assert_eq!(clamp_max_tokens(None, 495), 495);
        assert_eq!(clamp_max_tokens(Some(0), 495), 1);
    }

    #[test]
    fn gating_strips_unsupported_fields() {
        let req = full_request();
        let variants = build_variants(&req, &GatewayConfig::default());
        let mut caps = IndexSet::new();
        caps.insert("temperature".to_string());
        caps.insert("top_p".to_string());
        caps.insert("response_format".to_string());
        let gated = gate_payload(&variants[0].payload, Some(&caps));
        assert!(gated.get("tools").is_none());
        assert!(gated.get("plugins").is_none());
        assert!(gated.get("reasoning").is_none());
        // json_schema degrades to json_object without structured_outputs.
        assert_eq!(gated["response_format"]["type"], "json_object");
        assert!(gated.get("temperature").is_some());
    }

    #[test]
    fn unknown_capabilities_gate_nothing() {
        let req = full_request();
        let variants = build_variants(&req, &GatewayConfig::default());
        let gated = gate_payload(&variants[0].payload, None);
        assert_eq!(gated, variants[0].payload);
    }

    #[test]
    fn provider_matching_follows_policy_and_pin() {
        let advanced = json!({"tools": [], "messages": []});
        let plain = json!({"messages": []});
        assert!(should_require_matched_providers(
            ProviderMatchPolicy::Auto,
            None,
            &advanced
        ));
        assert!(!should_require_matched_providers(
            ProviderMatchPolicy::Auto,
            None,
            &plain
        ));
        assert!(should_require_matched_providers(
            ProviderMatchPolicy::Always,
            None,
            &plain
        ));
        assert!(!should_require_matched_providers(
            ProviderMatchPolicy::Never,
            None,
            &advanced
        ));
        // An explicit pin beats every policy.
        assert!(!should_require_matched_providers(
            ProviderMatchPolicy::Always,
            Some(false),
            &advanced
        ));
        assert!(should_require_matched_providers(
            ProviderMatchPolicy::Never,
            Some(true),
            &plain
        ));
    }

    #[test]
    fn provider_requirement_merges_with_order() {
        let mut payload = json!({"provider": {"order": ["deepinfra"]}});
        apply_provider_requirement(&mut payload, true);
        assert_eq!(payload["provider"]["require_parameters"], true);
        assert_eq!(payload["provider"]["order"][0], "deepinfra");

        let mut bare = json!({"messages": []});
        apply_provider_requirement(&mut bare, false);
        assert!(bare.get("provider").is_none());
    }
}
