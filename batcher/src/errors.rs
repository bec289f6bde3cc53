use thiserror::Error;

/// Result type alias for batcher operations
pub type Result<T, E = BatchError> = std::result::Result<T, E>;

/// Errors returned synchronously to callers of the batching forwarder
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Missing required routing field: {0}")]
    MissingRoutingField(&'static str),

    #[error("Batcher is closed")]
    Closed,

    #[error("Timed out draining batches with {pending} forwards still in flight")]
    DrainTimeout { pending: usize },

    #[error("Forwarding service error: {0}")]
    Forward(#[from] ForwardError),
}

/// Errors raised by a forwarding service.
///
/// Once a payload has been accepted into a batch these are only ever logged.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Payload rejected: {0}")]
    Rejected(String),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
