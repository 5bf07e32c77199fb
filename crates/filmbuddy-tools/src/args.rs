//! Argument normalization for model-produced tool calls.
//!
//! Models emit arguments in whatever casing they saw during training:
//! `titleId`, `title_id`, a nested `title.id`, or nothing at all with the
//! identifier buried in the user's text. Normalization folds all of those
//! into the canonical snake_case the typed layer expects.

use crate::name::ToolName;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::LazyLock;

/// String coercion for loosely typed argument values. Numbers and bools
/// stringify; everything else is empty.
pub fn coerce_arg_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn pick_string(obj: &Map<String, Value>, keys: &[&str]) -> String {
    for key in keys {
        let value = if let Some((outer, inner)) = key.split_once('.') {
            obj.get(outer).and_then(|v| v.get(inner))
        } else {
            obj.get(*key)
        };
        let s = coerce_arg_string(value);
        if !s.is_empty() {
            return s;
        }
    }
    String::new()
}

/// Strip wrapping quotes and trailing punctuation from a list name the
/// model lifted out of conversational text.
pub fn normalize_list_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .trim_start_matches(['"', '\u{201c}', '\u{201d}', '\''])
        .trim_end_matches(['"', '\u{201c}', '\u{201d}', '\''])
        .trim_end_matches(['.', '!', '?', ',', ';', ':']);
    unquoted.trim().to_string()
}

fn normalize_content_type(value: Option<&Value>) -> String {
    coerce_arg_string(value).to_ascii_lowercase()
}

const TITLE_ID_KEYS: &[&str] = &[
    "title_id",
    "titleId",
    "id",
    "media_item_id",
    "title.id",
    "title.title_id",
    "title.titleId",
    "title.media_item_id",
];

const CONTENT_TYPE_KEYS: &[&str] = &["content_type", "contentType", "kind", "type"];

fn set_if_missing(obj: &mut Map<String, Value>, key: &str, value: String) {
    if !value.is_empty() && coerce_arg_string(obj.get(key)).is_empty() {
        obj.insert(key.to_string(), json!(value));
    }
}

/// Fold aliased and nested argument spellings into canonical snake_case
/// keys for the given tool. Unknown keys are preserved untouched.
pub fn normalize_tool_args(tool: ToolName, args: &Value) -> Value {
    let mut obj = args.as_object().cloned().unwrap_or_default();
    let name = tool.as_str();

    if name.starts_with("list_") || tool == ToolName::GetListItems || tool == ToolName::CreateList {
        let list_id = pick_string(&obj, &["list_id", "listId", "listID", "list.id", "list.list_id"]);
        set_if_missing(&mut obj, "list_id", list_id);
        let list_name =
            normalize_list_name(&pick_string(&obj, &["list_name", "listName", "name", "list.name"]));
        set_if_missing(&mut obj, "list_name", list_name);
    }

    match tool {
        ToolName::ListAddItem
        | ToolName::ListRemoveItem
        | ToolName::RateTitle
        | ToolName::ReviewUpsert
        | ToolName::DiarySetStatus
        | ToolName::GetMyRating
        | ToolName::GetMyReview => {
            let title_id = pick_string(&obj, TITLE_ID_KEYS);
            set_if_missing(&mut obj, "title_id", title_id);
            let content_type = normalize_content_type(
                CONTENT_TYPE_KEYS.iter().find_map(|k| obj.get(*k)).cloned().as_ref(),
            );
            set_if_missing(&mut obj, "content_type", content_type);
        }
        ToolName::ListAddItems => {
            let title_id = pick_string(&obj, TITLE_ID_KEYS);
            set_if_missing(&mut obj, "title_id", title_id);
            if obj.get("title_ids").map(|v| v.is_array()) != Some(true)
                && let Some(aliased) = obj.get("titleIds").cloned()
                && aliased.is_array()
            {
                obj.insert("title_ids".to_string(), aliased);
            }
            // Single id degrades gracefully into the batch shape.
            if obj.get("title_ids").and_then(|v| v.as_array()).is_none_or(|a| a.is_empty()) {
                let single = coerce_arg_string(obj.get("title_id"));
                if !single.is_empty() {
                    obj.insert("title_ids".to_string(), json!([single]));
                }
            }
        }
        ToolName::ListSetVisibility => {
            if obj.get("is_public").is_none()
                && let Some(aliased) = obj.get("isPublic").cloned()
            {
                obj.insert("is_public".to_string(), aliased);
            }
        }
        ToolName::FollowUser | ToolName::UnfollowUser | ToolName::GetRelationshipStatus => {
            let target = pick_string(
                &obj,
                &["target_user_id", "targetUserId", "user_id", "userId"],
            );
            set_if_missing(&mut obj, "target_user_id", target);
        }
        ToolName::MessageSend => {
            let conversation = pick_string(&obj, &["conversation_id", "conversationId"]);
            set_if_missing(&mut obj, "conversation_id", conversation);
            let target = pick_string(
                &obj,
                &["target_user_id", "targetUserId", "user_id", "userId"],
            );
            set_if_missing(&mut obj, "target_user_id", target);
        }
        _ => {}
    }

    if tool == ToolName::ListRemoveItem {
        let item_id = pick_string(&obj, &["item_id", "itemId", "list_item_id", "id"]);
        set_if_missing(&mut obj, "item_id", item_id);
    }

    Value::Object(obj)
}

static LIST_NAME_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\blist\s+(?:named\s+)?["“”']([^"“”']{1,120})["“”']"#).unwrap()
});
static LIST_NAME_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfrom\s+list\s+([^\n\r.!?]{1,120})").unwrap());
static LIST_NAME_TO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bto\s+list\s+([^\n\r.!?]{1,120})").unwrap());
static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9a-f]{8}-[0-9a-f]{4}-[1-7][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12})")
        .unwrap()
});

/// Pull a list name out of the user's message text, quoted forms first.
pub fn extract_list_name_from_text(text: &str) -> String {
    for pattern in [&*LIST_NAME_QUOTED, &*LIST_NAME_FROM, &*LIST_NAME_TO] {
        if let Some(captures) = pattern.captures(text)
            && let Some(m) = captures.get(1)
        {
            return normalize_list_name(m.as_str());
        }
    }
    String::new()
}

/// First UUID mentioned anywhere in the text, lowercased.
pub fn extract_title_id_from_text(text: &str) -> String {
    UUID_PATTERN
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Backfill identifiers the model omitted from explicit mentions in the
/// triggering user text. Only fills gaps; never overrides supplied args.
pub fn apply_text_inferences(tool: ToolName, args: &Value, text: &str) -> Value {
    let mut obj = args.as_object().cloned().unwrap_or_default();
    let inferred_list = extract_list_name_from_text(text);
    let inferred_title = extract_title_id_from_text(text);

    if tool.as_str().starts_with("list_")
        && coerce_arg_string(obj.get("list_id")).is_empty()
        && coerce_arg_string(obj.get("list_name")).is_empty()
        && !inferred_list.is_empty()
    {
        obj.insert("list_name".to_string(), json!(inferred_list));
    }

    let wants_title = matches!(
        tool,
        ToolName::ListAddItem
            | ToolName::ListAddItems
            | ToolName::ListRemoveItem
            | ToolName::RateTitle
            | ToolName::ReviewUpsert
            | ToolName::DiarySetStatus
    );
    if wants_title && coerce_arg_string(obj.get("title_id")).is_empty() && !inferred_title.is_empty()
    {
        let remove_keyed_by_item = tool == ToolName::ListRemoveItem
            && !coerce_arg_string(obj.get("item_id")).is_empty();
        if !remove_keyed_by_item {
            obj.insert("title_id".to_string(), json!(inferred_title));
        }
    }

    if tool == ToolName::ListAddItems
        && obj.get("title_ids").and_then(|v| v.as_array()).is_none_or(|a| a.is_empty())
        && !inferred_title.is_empty()
    {
        obj.insert("title_ids".to_string(), json!([inferred_title]));
    }

    Value::Object(obj)
}
