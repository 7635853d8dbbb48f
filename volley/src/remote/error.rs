use http::StatusCode;
use thiserror::Error;

/// Failures of the local HTTP transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Transport is not running")]
    NotRunning,

    #[error("Transport is already running")]
    AlreadyRunning,
}

/// Failures of an outgoing RPC call.
///
/// These are reported as events rather than returned to the caller of a
/// fire-and-forget call, so they are cheap to clone.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// The remote answered with a non-success status.
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },

    /// The request never got an answer: refused, reset or timed out.
    #[error("Connection error calling {url}: {reason}")]
    Connection { url: String, reason: String },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Client was destroyed")]
    Destroyed,
}

impl ClientError {
    /// Connection errors are the only ones worth retrying.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Raised by an endpoint method body. Answered with a 500 carrying the message.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct MethodError(pub String);

impl From<&str> for MethodError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for MethodError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<crate::error::Error> for MethodError {
    fn from(err: crate::error::Error) -> Self {
        Self(err.to_string())
    }
}

impl From<serde_json::Error> for MethodError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("Invalid parameters: {err}"))
    }
}
