//! The tool vocabulary and its read/write classification.

use serde::{Deserialize, Serialize};

/// Every tool the agent may request. Reads auto-execute; writes only ever
/// surface as confirmable proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    // Read-only.
    SearchCatalog,
    SearchMyLibrary,
    GetTrending,
    GetRecommendations,
    GetMyLists,
    GetListItems,
    GetMyLibrary,
    GetMyRating,
    GetMyReview,
    GetRelationshipStatus,
    GetCtxSnapshot,
    ResolveTitle,
    ResolveList,
    ResolveUser,
    // Writes.
    CreateList,
    ListAddItem,
    ListAddItems,
    ListRemoveItem,
    ListSetVisibility,
    RateTitle,
    ReviewUpsert,
    DiarySetStatus,
    FollowUser,
    UnfollowUser,
    MessageSend,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchCatalog => "search_catalog",
            Self::SearchMyLibrary => "search_my_library",
            Self::GetTrending => "get_trending",
            Self::GetRecommendations => "get_recommendations",
            Self::GetMyLists => "get_my_lists",
            Self::GetListItems => "get_list_items",
            Self::GetMyLibrary => "get_my_library",
            Self::GetMyRating => "get_my_rating",
            Self::GetMyReview => "get_my_review",
            Self::GetRelationshipStatus => "get_relationship_status",
            Self::GetCtxSnapshot => "get_ctx_snapshot",
            Self::ResolveTitle => "resolve_title",
            Self::ResolveList => "resolve_list",
            Self::ResolveUser => "resolve_user",
            Self::CreateList => "create_list",
            Self::ListAddItem => "list_add_item",
            Self::ListAddItems => "list_add_items",
            Self::ListRemoveItem => "list_remove_item",
            Self::ListSetVisibility => "list_set_visibility",
            Self::RateTitle => "rate_title",
            Self::ReviewUpsert => "review_upsert",
            Self::DiarySetStatus => "diary_set_status",
            Self::FollowUser => "follow_user",
            Self::UnfollowUser => "unfollow_user",
            Self::MessageSend => "message_send",
        }
    }

    /// Tolerant lookup for model-produced names: trims, lowercases and
    /// accepts hyphens for underscores. Unknown names stay unknown; the
    /// caller decides whether that is a validation error or a dropped call.
    pub fn from_api_name(raw: &str) -> Option<Self> {
        let name = raw.trim().to_ascii_lowercase().replace('-', "_");
        ALL.iter().copied().find(|t| t.as_str() == name)
    }

    /// Writes mutate user state or send messages; they are never
    /// auto-executed.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::CreateList
                | Self::ListAddItem
                | Self::ListAddItems
                | Self::ListRemoveItem
                | Self::ListSetVisibility
                | Self::RateTitle
                | Self::ReviewUpsert
                | Self::DiarySetStatus
                | Self::FollowUser
                | Self::UnfollowUser
                | Self::MessageSend
        )
    }

    pub fn is_read(&self) -> bool {
        !self.is_write()
    }

    /// Full vocabulary in declaration order.
    pub fn all() -> &'static [ToolName] {
        &ALL
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALL: [ToolName; 25] = [
    ToolName::SearchCatalog,
    ToolName::SearchMyLibrary,
    ToolName::GetTrending,
    ToolName::GetRecommendations,
    ToolName::GetMyLists,
    ToolName::GetListItems,
    ToolName::GetMyLibrary,
    ToolName::GetMyRating,
    ToolName::GetMyReview,
    ToolName::GetRelationshipStatus,
    ToolName::GetCtxSnapshot,
    ToolName::ResolveTitle,
    ToolName::ResolveList,
    ToolName::ResolveUser,
    ToolName::CreateList,
    ToolName::ListAddItem,
    ToolName::ListAddItems,
    ToolName::ListRemoveItem,
    ToolName::ListSetVisibility,
    ToolName::RateTitle,
    ToolName::ReviewUpsert,
    ToolName::DiarySetStatus,
    ToolName::FollowUser,
    ToolName::UnfollowUser,
    ToolName::MessageSend,
];
