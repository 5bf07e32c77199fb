//! Typed view of a tool call.
//!
//! The loop receives `{tool, args}` as loose JSON. Parsing it into this
//! tagged union is the validation step: unknown tools and malformed
//! argument shapes become a [`TypedCallError`], never a runtime surprise
//! inside a tool body.

use crate::args::normalize_tool_args;
use crate::name::ToolName;
use filmbuddy_core::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypedCallError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: ToolName, reason: String },
}

fn default_search_limit() -> u32 {
    10
}

fn default_resolve_limit() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum TypedCall {
    SearchCatalog {
        query: String,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default = "default_search_limit")]
        limit: u32,
    },
    SearchMyLibrary {
        query: String,
        #[serde(default = "default_search_limit")]
        limit: u32,
    },
    GetTrending {
        #[serde(default)]
        kind: Option<String>,
        #[serde(default = "default_search_limit")]
        limit: u32,
    },
    GetRecommendations {
        #[serde(default)]
        kind: Option<String>,
        #[serde(default = "default_search_limit")]
        limit: u32,
    },
    GetMyLists {},
    GetListItems {
        list_id: String,
        #[serde(default = "default_search_limit")]
        limit: u32,
    },
    GetMyLibrary {
        #[serde(default = "default_search_limit")]
        limit: u32,
    },
    GetMyRating {
        title_id: String,
    },
    GetMyReview {
        title_id: String,
    },
    GetRelationshipStatus {
        target_user_id: String,
    },
    GetCtxSnapshot {},
    ResolveTitle {
        query: String,
        #[serde(default)]
        year: Option<i32>,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default = "default_resolve_limit")]
        limit: u32,
    },
    ResolveList {
        query: String,
        #[serde(default = "default_resolve_limit")]
        limit: u32,
    },
    ResolveUser {
        query: String,
        #[serde(default = "default_resolve_limit")]
        limit: u32,
    },
    CreateList {
        #[serde(default)]
        list_name: String,
        #[serde(default)]
        is_public: bool,
        #[serde(default)]
        items: Vec<Value>,
    },
    ListAddItem {
        #[serde(default)]
        list_id: String,
        #[serde(default)]
        list_name: String,
        #[serde(default)]
        title_id: String,
        #[serde(default)]
        content_type: Option<String>,
    },
    ListAddItems {
        #[serde(default)]
        list_id: String,
        #[serde(default)]
        list_name: String,
        #[serde(default)]
        title_ids: Vec<String>,
    },
    ListRemoveItem {
        #[serde(default)]
        list_id: String,
        #[serde(default)]
        list_name: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        title_id: String,
    },
    ListSetVisibility {
        #[serde(default)]
        list_id: String,
        #[serde(default)]
        list_name: String,
        is_public: bool,
    },
    RateTitle {
        #[serde(default)]
        title_id: String,
        rating: f64,
        #[serde(default)]
        content_type: Option<String>,
    },
    ReviewUpsert {
        #[serde(default)]
        title_id: String,
        body: String,
        #[serde(default)]
        content_type: Option<String>,
    },
    DiarySetStatus {
        #[serde(default)]
        title_id: String,
        status: String,
    },
    FollowUser {
        #[serde(default)]
        target_user_id: String,
    },
    UnfollowUser {
        #[serde(default)]
        target_user_id: String,
    },
    MessageSend {
        #[serde(default)]
        conversation_id: String,
        #[serde(default)]
        target_user_id: String,
        text: String,
    },
}

impl TypedCall {
    /// Normalize the loose call's arguments, then parse into the typed
    /// shape. The normalization step runs first so aliased keys count.
    pub fn parse(call: &ToolCall) -> Result<(ToolName, Self), TypedCallError> {
        let name = ToolName::from_api_name(&call.tool)
            .ok_or_else(|| TypedCallError::UnknownTool(call.tool.clone()))?;
        let normalized = normalize_tool_args(name, &call.args);
        let tagged = json!({"tool": name.as_str(), "args": normalized});
        let typed = serde_json::from_value(tagged).map_err(|err| TypedCallError::InvalidArgs {
            tool: name,
            reason: err.to_string(),
        })?;
        Ok((name, typed))
    }
}
