use thiserror::Error;

/// Errors surfaced by the RPC layer.
///
/// Correlation mismatches are intentionally absent: a response that matches
/// no pending request is an expected artifact of abandoned calls and is
/// dropped silently, never reported.
#[derive(Error, Debug)]
pub enum Error {
    /// Broker unreachable. Fatal at startup once the reconnect policy is
    /// exhausted; reconnection afterwards is the broker collaborator's concern.
    #[error("broker connection failed: {0}")]
    Connect(String),

    /// An outbound publish could not be completed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// No matching response arrived within the caller's deadline.
    ///
    /// This is a distinguishable outcome, never masked as a default value.
    /// The caller may retry with a fresh `call`; a late reply for the
    /// abandoned correlation id is dropped when observed.
    #[error("request timed out waiting for response")]
    Timeout,

    /// A server-side handler failed. Results in reject-without-requeue;
    /// never terminates the dispatch loop.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Configuration rejected before any broker connection was attempted.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Broker collaborator failure (declare, subscribe, ack plumbing).
    #[error("broker error: {0}")]
    Broker(String),

    /// JSON serialization or deserialization failed (typed call/handler).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;
