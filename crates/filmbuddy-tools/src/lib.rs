//! Tool vocabulary, argument normalization and result shaping for the
//! agent loop. Tool bodies live elsewhere; this crate owns the contract
//! around them.

pub mod args;
pub mod name;
pub mod registry;
pub mod score;
pub mod summary;
pub mod typed;

pub use args::{apply_text_inferences, coerce_arg_string, normalize_tool_args};
pub use name::ToolName;
pub use registry::{ToolRegistry, default_definitions};
pub use score::{CONFIDENCE_THRESHOLD, Resolution, is_confident, score_candidates};
pub use summary::{summarize_tool_result, truncate_deep};
pub use typed::{TypedCall, TypedCallError};
