//! Error types for the module orchestration protocol.

use crate::phase::ModulePhase;
use thiserror::Error;

/// Errors raised while interpreting or producing protocol events.
///
/// None of these cross the transport boundary as-is: the host turns them into
/// typed failure events (or `error{message}` as a last resort).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed config envelope: {0}")]
    MalformedEnvelope(String),
    #[error("illegal phase transition: {from} -> {to}")]
    IllegalTransition { from: ModulePhase, to: ModulePhase },
    #[error("transition to failed requires a reason")]
    MissingFailureReason,
    #[error("revision conflict: expected base revision {expected}, got {actual}")]
    RevisionConflict { expected: u64, actual: u64 },
    #[error("config id mismatch: target holds {stored}, got {actual}")]
    ConfigIdMismatch { stored: String, actual: String },
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    #[error("capability not offered: {0}")]
    CapabilityNotOffered(String),
    #[error("capability offer rejected: {0}")]
    OfferRejected(String),
    #[error("invalid route expression: {0}")]
    InvalidRoute(String),
    #[error("compatibility rejected: {0}")]
    CompatibilityRejected(String),
    #[error("session not authenticated: {0}")]
    Unauthenticated(String),
    #[error("identity mismatch: session {session} announced {announced}")]
    IdentityMismatch { session: String, announced: String },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("config store failure: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
