//! Compact result summaries fed back into the model conversation.
//!
//! Raw tool payloads are unbounded; the loop only ever shows the model a
//! short line per result, which keeps token growth linear in the number
//! of calls rather than in payload size.

use crate::name::ToolName;
use serde_json::{Map, Value};

const MAX_STRING_CHARS: usize = 800;
const MAX_ARRAY_ITEMS: usize = 20;
const MAX_OBJECT_KEYS: usize = 30;
const MAX_DEPTH: usize = 3;

/// Bounded deep copy for persistence: strings, arrays, objects and
/// nesting depth are all capped so one oversized payload cannot blow up
/// a stored row.
pub fn truncate_deep(value: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return Value::Null;
    }
    match value {
        Value::String(s) => {
            if s.chars().count() > MAX_STRING_CHARS {
                let cut: String = s.chars().take(MAX_STRING_CHARS).collect();
                Value::String(format!("{cut}…"))
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(MAX_ARRAY_ITEMS)
                .map(|item| truncate_deep(item, depth + 1))
                .collect(),
        ),
        Value::Object(obj) => {
            let mut out = Map::new();
            for (key, item) in obj.iter().take(MAX_OBJECT_KEYS) {
                out.insert(key.clone(), truncate_deep(item, depth + 1));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}

fn as_items<'a>(result: &'a Value, keys: &[&str]) -> Vec<&'a Value> {
    for key in keys {
        if let Some(arr) = result.get(*key).and_then(|v| v.as_array()) {
            return arr.iter().collect();
        }
    }
    result.as_array().map(|a| a.iter().collect()).unwrap_or_default()
}

fn title_line(item: &Value) -> String {
    let id = item
        .get("id")
        .or_else(|| item.get("title_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let title = item
        .get("title")
        .or_else(|| item.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let year = item
        .get("release_date")
        .or_else(|| item.get("releaseDate"))
        .and_then(|v| v.as_str())
        .filter(|d| d.len() >= 4)
        .map(|d| &d[..4])
        .unwrap_or("");
    [id, title, year]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" | ")
}

fn sample_lines(items: &[&Value], max: usize) -> String {
    items
        .iter()
        .take(max)
        .map(|item| title_line(item))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

fn resolved_line(label: &str, result: &Value) -> String {
    let best_id = result
        .get("best")
        .and_then(|b| b.get("id"))
        .and_then(|v| v.as_str());
    match best_id {
        Some(id) => format!("{label}: {id}"),
        None => label.to_string(),
    }
}

/// One short line describing a tool's outcome, suitable for the mini
/// trace shown to the model on the next iteration.
pub fn summarize_tool_result(tool: ToolName, result: &Value) -> String {
    if result.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        return result
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("TOOL_ERROR")
            .to_string();
    }
    let payload = result.get("result").unwrap_or(result);

    match tool {
        ToolName::GetTrending => {
            let items = as_items(payload, &["items", "trending"]);
            let sample = sample_lines(&items, 5);
            if sample.is_empty() {
                format!("Trending: {}", items.len())
            } else {
                format!("Trending: {} | {sample}", items.len())
            }
        }
        ToolName::GetRecommendations => {
            let items = as_items(payload, &["items", "recommendations"]);
            let sample = sample_lines(&items, 5);
            if sample.is_empty() {
                format!("Recommendations: {}", items.len())
            } else {
                format!("Recommendations: {} | {sample}", items.len())
            }
        }
        ToolName::SearchCatalog | ToolName::SearchMyLibrary => {
            let items = as_items(payload, &["items", "results"]);
            let sample = sample_lines(&items, 5);
            if sample.is_empty() {
                format!("Results: {}", items.len())
            } else {
                format!("Results: {} | {sample}", items.len())
            }
        }
        ToolName::ResolveTitle => resolved_line("Resolved", payload),
        ToolName::ResolveList => resolved_line("Resolved list", payload),
        ToolName::ResolveUser => resolved_line("Resolved user", payload),
        ToolName::GetMyLibrary => {
            format!("Library: {}", as_items(payload, &["items", "entries"]).len())
        }
        ToolName::GetListItems => {
            format!("List items: {}", as_items(payload, &["items", "rows"]).len())
        }
        ToolName::GetMyLists => {
            format!("Lists: {}", as_items(payload, &["items", "lists"]).len())
        }
        ToolName::CreateList => match payload
            .get("list_id")
            .or_else(|| payload.get("id"))
            .and_then(|v| v.as_str())
        {
            Some(id) => format!("List created: {id}"),
            None => "List created".to_string(),
        },
        ToolName::ListAddItem | ToolName::ListAddItems => "Added to list".to_string(),
        ToolName::ListRemoveItem => "Removed from list".to_string(),
        ToolName::ListSetVisibility => {
            if payload.get("is_public").and_then(|v| v.as_bool()) == Some(true) {
                "List is public".to_string()
            } else {
                "List is private".to_string()
            }
        }
        ToolName::RateTitle => match payload.get("rating") {
            Some(rating) => format!("Rated: {rating}"),
            None => "Rated".to_string(),
        },
        ToolName::ReviewUpsert => {
            if payload.get("created").and_then(|v| v.as_bool()) == Some(true) {
                "Review created".to_string()
            } else {
                "Review saved".to_string()
            }
        }
        ToolName::DiarySetStatus => match payload.get("status").and_then(|v| v.as_str()) {
            Some(status) if !status.is_empty() => format!("Status: {status}"),
            _ => "Updated status".to_string(),
        },
        ToolName::FollowUser => "Followed".to_string(),
        ToolName::UnfollowUser => "Unfollowed".to_string(),
        ToolName::MessageSend => "Message sent".to_string(),
        ToolName::GetMyRating => match payload.get("rating") {
            Some(Value::Null) | None => "No rating".to_string(),
            Some(rating) => format!("Rating: {rating}"),
        },
        ToolName::GetMyReview => {
            if payload.get("body").and_then(|v| v.as_str()).is_some() {
                "Has review".to_string()
            } else {
                "No review".to_string()
            }
        }
        ToolName::GetRelationshipStatus => match payload.get("status").and_then(|v| v.as_str()) {
            Some(status) if !status.is_empty() => format!("Relationship: {status}"),
            _ => "Relationship unknown".to_string(),
        },
        ToolName::GetCtxSnapshot => "Snapshot loaded".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_results_summarize_to_their_code() {
        let result = json!({"ok": false, "code": "LIST_NOT_FOUND", "message": "nope"});
        assert_eq!(
            summarize_tool_result(ToolName::GetListItems, &result),
            "LIST_NOT_FOUND"
        );
    }

    #[test]
    fn search_summaries_sample_ids_titles_and_years() {
        let result = json!({"ok": true, "result": {"items": [
            {"id": "t1", "title": "Dune", "release_date": "2021-10-22"},
            {"id": "t2", "title": "Arrival", "release_date": "2016-11-11"}
        ]}});
        let line = summarize_tool_result(ToolName::SearchCatalog, &result);
        assert_eq!(line, "Results: 2 | t1 | Dune | 2021; t2 | Arrival | 2016");
    }

    #[test]
    fn resolver_summary_carries_the_winning_id() {
        let result = json!({"ok": true, "result": {"best": {"id": "t9"}, "confidence": 0.93}});
        assert_eq!(
            summarize_tool_result(ToolName::ResolveTitle, &result),
            "Resolved: t9"
        );
    }

    #[test]
    fn truncate_deep_caps_strings_arrays_keys_and_depth() {
        let long = "x".repeat(900);
        let wide: Vec<Value> = (0..40).map(|i| json!(i)).collect();
        let value = json!({"text": long, "items": wide, "nested": {"a": {"b": {"c": {"d": 1}}}}});

        let bounded = truncate_deep(&value, 0);
        let text = bounded["text"].as_str().expect("string kept");
        assert_eq!(text.chars().count(), MAX_STRING_CHARS + 1, "cap plus ellipsis");
        assert_eq!(bounded["items"].as_array().expect("array").len(), MAX_ARRAY_ITEMS);
        assert_eq!(bounded["nested"]["a"]["b"]["c"], Value::Null);
    }
}
