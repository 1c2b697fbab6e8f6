use burrow_proto::CodecError;
use thiserror::Error;

/// A backend link failure. Any of these means the link is unusable for the
/// request that triggered it; the session treats them like a remote-closed
/// connection and surfaces a synthesized reply to the client.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to reach backend: {0}")]
    Connect(#[source] std::io::Error),

    #[error("backend request timed out")]
    Timeout,

    #[error("relay transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned HTTP status {0}")]
    Status(u16),

    #[error("backend link closed")]
    Closed,

    #[error("wire error: {0}")]
    Codec(#[from] CodecError),

    #[error("no backend manager named {0:?}")]
    NoManager(String),
}
