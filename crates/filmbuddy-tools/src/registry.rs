//! Execution seam between the agent loop and actual tool bodies.
//!
//! The loop decides when to call a tool and whether it may auto-execute;
//! the bodies live behind this trait (backed by the data store in the
//! real deployment, scripted in tests).

use crate::name::ToolName;
use filmbuddy_core::{ToolCall, ToolResult};
use serde_json::json;

pub trait ToolRegistry: Send + Sync {
    /// Execute one validated, normalized call on behalf of `user_id`.
    /// Failures come back as an error envelope, never as a panic.
    fn execute(&self, user_id: &str, call: &ToolCall) -> ToolResult;

    /// Wire-format tool declarations advertised to the model.
    fn definitions(&self) -> Vec<filmbuddy_core::ToolDefinition>;
}

/// Declarations for the read-only vocabulary plus write intents. Writes
/// are declared so the model can propose them, even though the loop never
/// auto-executes one.
pub fn default_definitions() -> Vec<filmbuddy_core::ToolDefinition> {
    let tools = [
        (
            ToolName::SearchCatalog,
            "Search the movie/series catalog by title text",
            json!({"type": "object", "properties": {"query": {"type": "string"}, "kind": {"type": "string"}, "limit": {"type": "integer"}}, "required": ["query"]}),
        ),
        (
            ToolName::SearchMyLibrary,
            "Search only the user's own library",
            json!({"type": "object", "properties": {"query": {"type": "string"}, "limit": {"type": "integer"}}, "required": ["query"]}),
        ),
        (
            ToolName::GetTrending,
            "Currently trending titles",
            json!({"type": "object", "properties": {"kind": {"type": "string"}, "limit": {"type": "integer"}}}),
        ),
        (
            ToolName::GetRecommendations,
            "Personalized recommendations for the user",
            json!({"type": "object", "properties": {"kind": {"type": "string"}, "limit": {"type": "integer"}}}),
        ),
        (
            ToolName::GetMyLists,
            "The user's lists",
            json!({"type": "object", "properties": {}}),
        ),
        (
            ToolName::GetListItems,
            "Items in one of the user's lists",
            json!({"type": "object", "properties": {"list_id": {"type": "string"}, "limit": {"type": "integer"}}, "required": ["list_id"]}),
        ),
        (
            ToolName::GetMyLibrary,
            "The user's watch library",
            json!({"type": "object", "properties": {"limit": {"type": "integer"}}}),
        ),
        (
            ToolName::GetCtxSnapshot,
            "Compact snapshot of the user's profile, lists, ratings and recent activity",
            json!({"type": "object", "properties": {}}),
        ),
        (
            ToolName::ResolveTitle,
            "Resolve a title name to a concrete title id",
            json!({"type": "object", "properties": {"query": {"type": "string"}, "year": {"type": "integer"}, "kind": {"type": "string"}, "limit": {"type": "integer"}}, "required": ["query"]}),
        ),
        (
            ToolName::CreateList,
            "Create a new list (requires confirmation)",
            json!({"type": "object", "properties": {"list_name": {"type": "string"}, "is_public": {"type": "boolean"}}, "required": ["list_name"]}),
        ),
        (
            ToolName::ListAddItem,
            "Add a title to a list (requires confirmation)",
            json!({"type": "object", "properties": {"list_id": {"type": "string"}, "list_name": {"type": "string"}, "title_id": {"type": "string"}}}),
        ),
        (
            ToolName::RateTitle,
            "Rate a title 0.5-5 (requires confirmation)",
            json!({"type": "object", "properties": {"title_id": {"type": "string"}, "rating": {"type": "number"}}, "required": ["rating"]}),
        ),
        (
            ToolName::ReviewUpsert,
            "Create or update the user's review of a title (requires confirmation)",
            json!({"type": "object", "properties": {"title_id": {"type": "string"}, "body": {"type": "string"}}, "required": ["body"]}),
        ),
        (
            ToolName::DiarySetStatus,
            "Set watch status for a title (requires confirmation)",
            json!({"type": "object", "properties": {"title_id": {"type": "string"}, "status": {"type": "string"}}, "required": ["status"]}),
        ),
        (
            ToolName::FollowUser,
            "Follow another user (requires confirmation)",
            json!({"type": "object", "properties": {"target_user_id": {"type": "string"}, "query": {"type": "string"}}}),
        ),
    ];
    tools
        .into_iter()
        .map(|(name, description, schema)| {
            filmbuddy_core::ToolDefinition::function(name.as_str(), description, schema)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_declared_tool_name_is_known() {
        for def in default_definitions() {
            assert!(
                ToolName::from_api_name(&def.function.name).is_some(),
                "unknown declared tool {}",
                def.function.name
            );
        }
    }
}
