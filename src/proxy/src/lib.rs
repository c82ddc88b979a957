pub mod diff;
pub mod listener;
pub mod monitor;
pub mod protocol;
pub mod readconn;
pub mod server;
pub mod service;
pub mod session;
pub mod worker;

use thiserror::Error;

/// Error classes at the session layer. Routers may elect to tolerate
/// anything but `Fatal`; the session is torn down otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Connection loss or timeout; a reconnect may succeed.
    Transient,
    /// The backend is gone for good (removed, protocol mismatch).
    Permanent,
    /// The session itself is broken and must close.
    Fatal,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    #[error("session closed")]
    SessionClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Admin(String),
}

impl ProxyError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            ProxyError::Io(_) | ProxyError::Backend { .. } => ErrorType::Transient,
            ProxyError::Malformed(_) | ProxyError::Config(_) | ProxyError::Admin(_) => {
                ErrorType::Permanent
            }
            ProxyError::SessionClosed => ErrorType::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
