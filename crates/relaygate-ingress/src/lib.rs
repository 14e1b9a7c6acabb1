//! RelayGate Ingress
//!
//! This crate accepts tenant requests and drives them to an upstream account:
//! - The dispatch pipeline (validation, quota, selection, dispatch, settlement)
//! - Session fingerprinting for sticky routing
//! - Error taxonomy and its HTTP mapping
//! - The axum router for `/v1/messages` and `/v1/chat/completions`

pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod session;

pub use error::{DispatchError, DispatchResult};
pub use middleware::{RequestContext, request_context_middleware};
pub use pipeline::{
    BufferedReply, DispatchOutcome, DispatchPipeline, Endpoint, InboundRequest,
    PipelineComponents, ReplyStream,
};
pub use routes::{IngressConfig, router};
pub use session::derive_session_hash;
