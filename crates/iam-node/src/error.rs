//! Node client errors

use iam_server::ServiceError;
use thiserror::Error;

/// Errors raised while connecting to or serving the main node
#[derive(Debug, Error)]
pub enum ClientError {
    /// Main node URL could not be parsed
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// TLS could not be applied to the channel
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Connection to the main node failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// RegisterNode stream could not be opened or broke
    #[error("stream failed: {0}")]
    StreamFailed(String),

    /// Outbound frame channel closed
    #[error("channel closed")]
    ChannelClosed,

    /// Local node info could not be read
    #[error("node info unavailable: {0}")]
    NodeInfo(#[from] ServiceError),
}
