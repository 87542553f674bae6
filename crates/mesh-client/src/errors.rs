//! Mesh client error types.
//!
//! A failure inside one peer session never propagates to other sessions or
//! to the presence tracker. Only `RelayUnavailable` is worth retrying, and
//! retrying is always the caller's decision.

use thiserror::Error;

/// Mesh client error type.
///
/// Metric labels (see [`MeshError::label`]):
/// - `RelayUnavailable`: `relay_unavailable`
/// - `MalformedSignal`: `malformed`
/// - `StaleSignal`: `stale`
/// - `NegotiationFailed`: `negotiation_failed`
/// - `ResourceExhausted`: `resource_exhausted`
/// - Transport, Config, Internal, Closed: their own snake-case names
#[derive(Debug, Error)]
pub enum MeshError {
    /// Relay send or subscribe failed.
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Signal payload is missing the field its kind requires.
    #[error("Malformed signal: {0}")]
    MalformedSignal(String),

    /// Signal addressed to a peer with no live session.
    #[error("Stale signal from {0}")]
    StaleSignal(String),

    /// Path negotiation failed or did not reach connectivity in time.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// No capacity for another peer session.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transport backend error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Actor channel or task failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The mesh has been torn down.
    #[error("Mesh is closed")]
    Closed,
}

impl MeshError {
    /// Whether the caller may retry the failed operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeshError::RelayUnavailable(_))
    }

    /// Bounded label for metrics and structured logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            MeshError::RelayUnavailable(_) => "relay_unavailable",
            MeshError::MalformedSignal(_) => "malformed",
            MeshError::StaleSignal(_) => "stale",
            MeshError::NegotiationFailed(_) => "negotiation_failed",
            MeshError::ResourceExhausted(_) => "resource_exhausted",
            MeshError::Transport(_) => "transport",
            MeshError::Config(_) => "config",
            MeshError::Internal(_) => "internal",
            MeshError::Closed => "closed",
        }
    }
}

impl From<crate::config::ConfigError> for MeshError {
    fn from(err: crate::config::ConfigError) -> Self {
        MeshError::Config(err.to_string())
    }
}
