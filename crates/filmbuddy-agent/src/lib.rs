//! The bounded agent loop: deterministic command routing, schema-guarded
//! model turns, gated writes, and chunked long-form generation, all under
//! one wall-clock deadline.

pub mod chunked;
pub mod deterministic;
pub mod orchestrator;
pub mod prepare;
pub mod schema;

#[cfg(test)]
pub(crate) mod testutil;

pub use chunked::{
    ChunkedGenerator, TRUNCATION_MARKER, is_strict_output_request, merge_with_overlap,
    should_use_chunk_mode,
};
pub use deterministic::{DeterministicReply, ToolRunner};
pub use orchestrator::{
    ConfirmOutcome, HandleOutcome, InboundMessage, RequestOrchestrator, needs_evidence,
};
pub use prepare::{PreparedCall, ToolCallPreparer, action_label_for, verification_read};
pub use schema::{
    AgentTurn, agent_response_format, parse_agent_turn, repair_prompt, system_prompt,
};
