//! Shared error types for the mooring tool-server supervisor.
//!
//! Every mooring crate reports failures through the single [`MooringError`]
//! enum so that callers match on one type regardless of which subsystem
//! produced the error.
//!
//! # Main types
//!
//! - [`MooringError`] — Unified error enum for all mooring subsystems.
//! - [`MooringResult`] — Convenience alias for `Result<T, MooringError>`.

/// Top-level error type for the mooring workspace.
///
/// Variants that end a retry sequence (`RetriesExhausted`) or reject a call
/// outright (`NotConnected`, `UnknownServer`) are surfaced to callers;
/// `ConnectionFailed` is recoverable and consumed by the supervisor's retry
/// loop before it ever reaches a caller mid-sequence.
#[derive(Debug, thiserror::Error)]
pub enum MooringError {
    /// A single connect attempt against a tool server failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Every allowed connect attempt failed; the server was auto-disabled.
    #[error("Retries exhausted: {0}")]
    RetriesExhausted(String),

    /// An operation was requested on a server with no connected handle.
    #[error("Server not connected: {0}")]
    NotConnected(String),

    /// An operation named a server the supervisor has never seen.
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// A tool invocation was delivered but the server reported failure.
    #[error("Tool error: {0}")]
    Tool(String),

    /// The server sent something that is not valid for the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`MooringError`].
pub type MooringResult<T> = Result<T, MooringError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_server_detail() {
        let err = MooringError::NotConnected("files".to_string());
        assert_eq!(err.to_string(), "Server not connected: files");
    }

    #[test]
    fn test_json_error_converts() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: MooringError = parse_err.into();
        assert!(matches!(err, MooringError::Json(_)));
    }

    #[test]
    fn test_io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: MooringError = io_err.into();
        assert!(err.to_string().starts_with("IO error:"));
    }
}
