//! Agent error types
//!
//! One enum per failure domain. Connection-scoped errors stay local and drive
//! reconnect/log behaviour; task-scoped errors always end up in a `fail`
//! crawl result.

use thiserror::Error;

/// Socket open/send failures. Never fatal, they schedule a reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport closed")]
    Closed,
}

/// Malformed inbound frames. Logged and dropped, the connection stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Invalid payload for '{kind}': {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of a single task. Each one becomes a `crawl_result` with status `fail`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("script not found: {0}")]
    ScriptNotFound(String),

    #[error("no execution target available")]
    NoTarget,

    #[error("cannot run scripts on restricted page {url}: {reason}")]
    RestrictedPage { url: String, reason: String },

    #[error("script execution failed: {0}")]
    Execution(String),

    #[error("script execution timed out after {0}s")]
    Timeout(u64),

    #[error("page host unavailable: {0}")]
    HostUnavailable(String),
}

/// Identity signal collection failure. Triggers the fallback identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Signal collection failed: {0}")]
    Signals(String),
}

/// Outbound messages rejected before reaching the socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("No client identity available, message not sent")]
    MissingClientId,

    #[error("Outbound queue closed")]
    Closed,

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),
}
