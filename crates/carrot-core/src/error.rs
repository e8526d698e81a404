//! Error taxonomy for the hub and its connections

use thiserror::Error;

/// Errors produced by the session store, the hub, and connection pumps.
///
/// Every variant is local to one request or one connection; none of them
/// stops the hub loop.
#[derive(Debug, Error)]
pub enum CarrotError {
    #[error("session token absent or unknown: {0}")]
    SessionInvalid(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("outbound queue full for client {0}")]
    QueueOverflow(u64),

    #[error("client secret does not match")]
    SecretMismatch,

    #[error("could not mint a unique session token after {0} attempts")]
    TokenGeneration(usize),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("hub is not running")]
    HubClosed,
}

pub type CarrotResult<T> = Result<T, CarrotError>;
