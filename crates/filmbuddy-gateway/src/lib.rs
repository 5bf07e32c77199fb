//! Multi-model gateway client.
//!
//! One logical [`filmbuddy_core::ChatRequest`] fans out into an ordered
//! ladder of payload variants per candidate model. Capability gating
//! trims fields the upstream catalog says a model will reject, a
//! per-model circuit breaker skips known-bad models, and the router
//! walks models and variants until one attempt yields usable content.

pub mod capability;
pub mod circuit;
pub mod router;
pub mod variants;

pub use capability::{
    CapabilityGate, CapabilityKey, CapabilityProber, CapabilityRecord, CapabilityStore,
    HttpCapabilityProber,
};
pub use circuit::{CircuitBreaker, CircuitState, CircuitStore, MemoryCircuitStore};
pub use router::{LlmGateway, ModelRouter, RouteOutcome};
pub use variants::{PayloadVariant, VariantTag, build_variants};
