//! User-facing error taxonomy.
//!
//! Transport and channel failures are converted into [`Error`] at the
//! supervisor boundary. [`Error::Authentication`] is kept distinct so the UI
//! can prompt for a new shared secret; [`Error::Network`] is always treated as
//! recoverable by the reconnect policy.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Missing or invalid endpoint. Fatal to connecting, not to the process.
    #[error("{0}")]
    Configuration(String),
    /// HTTP 401 or a rejected `auth` frame.
    #[error("Invalid API secret")]
    Authentication,
    /// Connection refused, DNS failure, timeout, socket closed.
    #[error("{0}")]
    Network(String),
    /// Any other non-2xx response.
    #[error("{}", http_message(.status, .message))]
    Http { status: u16, message: String },
    /// Malformed payload.
    #[error("Invalid response: {0}")]
    Decode(String),
    /// A newer connect/config operation superseded the one being awaited.
    #[error("connection attempt superseded")]
    Superseded,
    /// The supervisor has shut down.
    #[error("supervisor stopped")]
    Stopped,
}

fn http_message(status: &u16, message: &str) -> String {
    if message.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        message.to_string()
    }
}

impl Error {
    /// Whether the reconnect policy should retry after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Network(msg) => Error::Network(msg),
            TransportError::Http { status: 401, .. } => Error::Authentication,
            TransportError::Http { status, message } => Error::Http { status, message },
            TransportError::Decode(msg) => Error::Decode(msg),
            TransportError::InvalidUrl(msg) => Error::Configuration(msg),
        }
    }
}
