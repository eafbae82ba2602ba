use std::time::Duration;

use thiserror::Error;

/// Every failure an authentication attempt or a broker cycle can produce.
///
/// Payloads are plain strings so one outcome can be cloned out to every
/// request waiting on the same cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Identity collection failed (exit status {status:?}): {stderr}")]
    IdentityCollectionFailed { status: Option<i32>, stderr: String },

    #[error("Failed to load private key: {0}")]
    KeyLoad(String),

    #[error("Failed to sign authentication request: {0}")]
    Signing(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server rejected authentication request with status {status}")]
    ServerRejected { status: u16 },

    #[error("Bus call error: {0}")]
    BusCall(String),

    #[error("No token received within {0:?}")]
    TokenFetchTimeout(Duration),

    #[error("Authenticator shut down with requests outstanding")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for AuthError {
    fn from(e: std::io::Error) -> Self {
        AuthError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Transport(e.to_string())
    }
}

impl From<reqwest_middleware::Error> for AuthError {
    fn from(e: reqwest_middleware::Error) -> Self {
        AuthError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
