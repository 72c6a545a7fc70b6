//! Error types for the callwire domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] wraps them all.

use thiserror::Error;

use crate::envelope::CallId;

/// The top-level error type for all callwire operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Wire errors ---
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    // --- Transport errors ---
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // --- Handler errors ---
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    // --- Outgoing call errors ---
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Rejected inbound input. Nothing that fails these checks reaches the
/// correlation state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope has no id")]
    MissingId,

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport closed: {0}")]
    Closed(String),

    #[error("Send failed on {transport}: {reason}")]
    SendFailed { transport: String, reason: String },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Transport already started: {0}")]
    AlreadyStarted(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("Handler '{name}' failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Handler panicked or was aborted: {0}")]
    Aborted(String),
}

impl HandlerError {
    /// Shorthand for a handler-side failure.
    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("Engine dropped before call {0} was answered")]
    Disconnected(CallId),

    #[error("Call name must not be empty")]
    EmptyName,

    #[error("Call ids exhausted; next id would be {0}")]
    IdsExhausted(CallId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_error_displays_correctly() {
        let err = Error::Envelope(EnvelopeError::MissingId);
        assert!(err.to_string().contains("no id"));
    }

    #[test]
    fn handler_error_displays_correctly() {
        let err = Error::Handler(HandlerError::failed("sum", "overflow"));
        assert!(err.to_string().contains("sum"));
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn io_error_converts_to_transport_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::Io(ref m) if m.contains("pipe gone")));
    }
}
