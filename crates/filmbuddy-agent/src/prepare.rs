//! Turns a raw model tool call into something safe to act on.
//!
//! Three outcomes: reads with resolved arguments execute; writes become
//! confirmable proposals; anything unresolvable is dropped with a reason
//! the loop can feed back. A dropped call is always preferable to a
//! guessed identifier.

use crate::deterministic::pick_items;
use filmbuddy_core::{ProposedAction, ToolCall, ToolResult};
use filmbuddy_tools::{
    ToolName, ToolRegistry, TypedCall, apply_text_inferences, is_confident, normalize_tool_args,
    score_candidates,
};
use serde_json::{Value, json};

#[derive(Debug)]
pub enum PreparedCall {
    Execute(ToolCall),
    Propose(ProposedAction),
    Dropped { tool: String, reason: String },
}

pub struct ToolCallPreparer<'a> {
    registry: &'a dyn ToolRegistry,
    user_id: &'a str,
}

impl<'a> ToolCallPreparer<'a> {
    pub fn new(registry: &'a dyn ToolRegistry, user_id: &'a str) -> Self {
        Self { registry, user_id }
    }

    pub fn prepare(&self, call: &ToolCall, latest_user_text: &str) -> PreparedCall {
        let Some(tool) = ToolName::from_api_name(&call.tool) else {
            return PreparedCall::Dropped {
                tool: call.tool.clone(),
                reason: "unknown tool".to_string(),
            };
        };

        let mut args = normalize_tool_args(tool, &call.args);
        args = apply_text_inferences(tool, &args, latest_user_text);

        if needs_title_resolution(tool, &args) {
            match self.resolve_title(&args, latest_user_text) {
                Some(id) => args["title_id"] = json!(id),
                None => {
                    return PreparedCall::Dropped {
                        tool: tool.as_str().to_string(),
                        reason: "could not resolve a title with enough confidence".to_string(),
                    };
                }
            }
        }
        if needs_list_resolution(tool, &args) {
            match self.resolve_list(&args) {
                Some(id) => args["list_id"] = json!(id),
                None => {
                    return PreparedCall::Dropped {
                        tool: tool.as_str().to_string(),
                        reason: "could not resolve a list with enough confidence".to_string(),
                    };
                }
            }
        }

        let normalized = ToolCall {
            tool: tool.as_str().to_string(),
            args,
        };
        if let Err(err) = TypedCall::parse(&normalized) {
            return PreparedCall::Dropped {
                tool: tool.as_str().to_string(),
                reason: err.to_string(),
            };
        }

        if tool.is_write() {
            let label = action_label_for(tool, &normalized.args);
            return PreparedCall::Propose(ProposedAction::new(
                label,
                normalized.tool,
                normalized.args,
            ));
        }
        PreparedCall::Execute(normalized)
    }

    fn resolve_title(&self, args: &Value, latest_user_text: &str) -> Option<String> {
        let query = resolution_query(args, &["title", "title_name", "query", "name"])
            .unwrap_or_else(|| latest_user_text.to_string());
        self.resolve_via(ToolName::ResolveTitle, &query)
    }

    fn resolve_list(&self, args: &Value) -> Option<String> {
        let query = resolution_query(args, &["list_name", "name", "query"])?;
        self.resolve_via(ToolName::ResolveList, &query)
    }

    fn resolve_via(&self, resolver: ToolName, query: &str) -> Option<String> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        let result = self.registry.execute(
            self.user_id,
            &ToolCall {
                tool: resolver.as_str().to_string(),
                args: json!({"query": query, "limit": 10}),
            },
        );
        let ToolResult::Ok { result, .. } = result else {
            return None;
        };
        let candidates: Vec<(String, String)> = pick_items(&result)
            .iter()
            .filter_map(|item| {
                let id = item.get("id").and_then(Value::as_str)?;
                let name = item
                    .get("title")
                    .or_else(|| item.get("name"))
                    .and_then(Value::as_str)?;
                Some((id.to_string(), name.to_string()))
            })
            .collect();
        let resolution = score_candidates(query, &candidates)?;
        is_confident(&resolution).then_some(resolution.id)
    }
}

/// Tools addressing a specific title need a concrete id before they can
/// run or be proposed.
fn needs_title_resolution(tool: ToolName, args: &Value) -> bool {
    let addresses_title = matches!(
        tool,
        ToolName::RateTitle
            | ToolName::ReviewUpsert
            | ToolName::DiarySetStatus
            | ToolName::ListAddItem
            | ToolName::ListRemoveItem
    );
    addresses_title && !has_uuid_field(args, "title_id")
}

fn needs_list_resolution(tool: ToolName, args: &Value) -> bool {
    let addresses_list = matches!(
        tool,
        ToolName::ListAddItem
            | ToolName::ListAddItems
            | ToolName::ListRemoveItem
            | ToolName::ListSetVisibility
            | ToolName::GetListItems
    );
    addresses_list && !has_uuid_field(args, "list_id")
}

fn has_uuid_field(args: &Value, key: &str) -> bool {
    args.get(key)
        .and_then(Value::as_str)
        .is_some_and(|s| uuid::Uuid::parse_str(s.trim()).is_ok())
}

fn resolution_query(args: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = args.get(*key).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Button label for a proposed write.
pub fn action_label_for(tool: ToolName, args: &Value) -> String {
    match tool {
        ToolName::CreateList => {
            let name = args.get("list_name").and_then(Value::as_str).unwrap_or("list");
            format!("Create list “{name}”")
        }
        ToolName::ListAddItem | ToolName::ListAddItems => "Add to list".to_string(),
        ToolName::ListRemoveItem => "Remove from list".to_string(),
        ToolName::ListSetVisibility => {
            if args.get("is_public").and_then(Value::as_bool).unwrap_or(false) {
                "Make list public".to_string()
            } else {
                "Make list private".to_string()
            }
        }
        ToolName::RateTitle => match args.get("rating").and_then(Value::as_f64) {
            Some(rating) => format!("Rate: {rating}"),
            None => "Rate title".to_string(),
        },
        ToolName::ReviewUpsert => "Save review".to_string(),
        ToolName::DiarySetStatus => {
            let status = args.get("status").and_then(Value::as_str).unwrap_or("updated");
            format!("Set status: {status}")
        }
        ToolName::FollowUser => "Follow".to_string(),
        ToolName::UnfollowUser => "Unfollow".to_string(),
        ToolName::MessageSend => "Send message".to_string(),
        _ => "Apply change".to_string(),
    }
}

/// Narrow read issued after a confirmed write executes, proving the
/// effect landed instead of trusting the write's own response.
pub fn verification_read(tool: ToolName, args: &Value) -> Option<ToolCall> {
    let read = |name: ToolName, args: Value| ToolCall {
        tool: name.as_str().to_string(),
        args,
    };
    match tool {
        ToolName::RateTitle => Some(read(
            ToolName::GetMyRating,
            json!({"title_id": args.get("title_id").cloned().unwrap_or(Value::Null)}),
        )),
        ToolName::ReviewUpsert => Some(read(
            ToolName::GetMyReview,
            json!({"title_id": args.get("title_id").cloned().unwrap_or(Value::Null)}),
        )),
        ToolName::CreateList | ToolName::ListAddItem | ToolName::ListAddItems | ToolName::ListRemoveItem => {
            args.get("list_id").cloned().map(|list_id| {
                read(ToolName::GetListItems, json!({"list_id": list_id, "limit": 12}))
            })
        }
        ToolName::FollowUser | ToolName::UnfollowUser => Some(read(
            ToolName::GetRelationshipStatus,
            json!({"target_user_id": args.get("target_user_id").cloned().unwrap_or(Value::Null)}),
        )),
        ToolName::DiarySetStatus => Some(read(ToolName::GetMyLibrary, json!({"limit": 12}))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedRegistry {
        resolve_result: Value,
        executed: Mutex<Vec<ToolCall>>,
    }

    impl ScriptedRegistry {
        fn new(resolve_result: Value) -> Self {
            Self {
                resolve_result,
                executed: Mutex::new(Vec::new()),
            }
        }
    }

    impl ToolRegistry for ScriptedRegistry {
        fn execute(&self, _user_id: &str, call: &ToolCall) -> ToolResult {
            self.executed.lock().unwrap().push(call.clone());
            ToolResult::ok(self.resolve_result.clone())
        }

        fn definitions(&self) -> Vec<filmbuddy_core::ToolDefinition> {
            filmbuddy_tools::default_definitions()
        }
    }

    #[test]
    fn unknown_tools_are_dropped() {
        let registry = ScriptedRegistry::new(json!([]));
        let preparer = ToolCallPreparer::new(&registry, "u1");
        let prepared = preparer.prepare(
            &ToolCall {
                tool: "drop_tables".to_string(),
                args: json!({}),
            },
            "",
        );
        assert!(matches!(prepared, PreparedCall::Dropped { ref reason, .. } if reason.contains("unknown")));
    }

    #[test]
    fn reads_with_complete_args_execute_directly() {
        let registry = ScriptedRegistry::new(json!([]));
        let preparer = ToolCallPreparer::new(&registry, "u1");
        let prepared = preparer.prepare(
            &ToolCall {
                tool: "search_catalog".to_string(),
                args: json!({"query": "dune", "limit": 5}),
            },
            "find dune",
        );
        let PreparedCall::Execute(call) = prepared else {
            panic!("expected execute");
        };
        assert_eq!(call.tool, "search_catalog");
        assert!(registry.executed.lock().unwrap().is_empty());
    }

    #[test]
    fn writes_become_proposals_with_labels() {
        let registry = ScriptedRegistry::new(json!([]));
        let preparer = ToolCallPreparer::new(&registry, "u1");
        let prepared = preparer.prepare(
            &ToolCall {
                tool: "rate_title".to_string(),
                args: json!({
                    "title_id": "0198b2f0-0000-7000-8000-000000000001",
                    "rating": 4.5
                }),
            },
            "",
        );
        let PreparedCall::Propose(action) = prepared else {
            panic!("expected proposal");
        };
        assert_eq!(action.tool, "rate_title");
        assert_eq!(action.label, "Rate: 4.5");
        assert!(action.id.starts_with("act_"));
        assert!(registry.executed.lock().unwrap().is_empty());
    }

    #[test]
    fn confident_resolution_fills_the_title_id() {
        let registry = ScriptedRegistry::new(json!({"items": [
            {"id": "0198b2f0-0000-7000-8000-000000000001", "title": "Spirited Away"},
            {"id": "0198b2f0-0000-7000-8000-000000000002", "title": "The Godfather"},
        ]}));
        let preparer = ToolCallPreparer::new(&registry, "u1");
        let prepared = preparer.prepare(
            &ToolCall {
                tool: "rate_title".to_string(),
                args: json!({"title": "spirited away", "rating": 5}),
            },
            "rate spirited away 5 stars",
        );
        let PreparedCall::Propose(action) = prepared else {
            panic!("expected proposal");
        };
        assert_eq!(
            action.args["title_id"],
            json!("0198b2f0-0000-7000-8000-000000000001")
        );
        let executed = registry.executed.lock().unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].tool, "resolve_title");
    }

    #[test]
    fn ambiguous_resolution_drops_the_call() {
        let registry = ScriptedRegistry::new(json!({"items": [
            {"id": "0198b2f0-0000-7000-8000-000000000001", "title": "Dune (1984)"},
            {"id": "0198b2f0-0000-7000-8000-000000000002", "title": "Dune (2021)"},
        ]}));
        let preparer = ToolCallPreparer::new(&registry, "u1");
        let prepared = preparer.prepare(
            &ToolCall {
                tool: "rate_title".to_string(),
                args: json!({"title": "dune", "rating": 5}),
            },
            "rate dune 5 stars",
        );
        assert!(
            matches!(prepared, PreparedCall::Dropped { ref reason, .. } if reason.contains("confidence")),
            "threshold is {}",
            filmbuddy_tools::CONFIDENCE_THRESHOLD
        );
    }

    #[test]
    fn verification_reads_cover_each_write_family() {
        let rate = verification_read(
            ToolName::RateTitle,
            &json!({"title_id": "0198b2f0-0000-7000-8000-000000000001"}),
        )
        .expect("read-back");
        assert_eq!(rate.tool, "get_my_rating");

        let list = verification_read(
            ToolName::ListAddItem,
            &json!({"list_id": "0198b2f0-0000-7000-8000-00000000dddd"}),
        )
        .expect("read-back");
        assert_eq!(list.tool, "get_list_items");
        assert_eq!(list.args["limit"], json!(12));

        assert!(verification_read(ToolName::MessageSend, &json!({})).is_none());
    }
}
