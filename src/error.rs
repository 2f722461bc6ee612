use std::io;
use thiserror::Error;

/// Errors surfaced by the call negotiation core.
#[derive(Debug, Error)]
pub enum CallError {
    /// Local camera or screen capture is unavailable or was denied
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// The transport endpoint rejected a description or candidate, or an
    /// operation arrived out of order
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// A fetched session record has passed its expiration time
    #[error("Session record for room '{room}' expired at {expired_at}")]
    StaleRecord { room: String, expired_at: i64 },

    /// The transport endpoint reported a failed connection
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The call reached `failed` while an operation was waiting on it
    #[error("Call failed: {0}")]
    CallFailed(String),

    /// Shared record store error
    #[error("Signaling store error: {0}")]
    Store(#[from] StoreError),

    /// Identity persistence error
    #[error("Identity store error: {0}")]
    Identity(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session was torn down while an operation was suspended
    #[error("Session cancelled")]
    Cancelled,
}

impl From<webrtc::Error> for CallError {
    fn from(err: webrtc::Error) -> Self {
        CallError::Negotiation(err.to_string())
    }
}

impl CallError {
    /// Whether this error ends the session in the `failed` state rather than
    /// aborting it before anything was written.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallError::MediaAcquisition(_) | CallError::Cancelled)
    }
}

/// Errors raised by a [`RecordStore`](crate::signaling::RecordStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend is unreachable or refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Change feed for the room was closed
    #[error("Change feed closed for room '{0}'")]
    FeedClosed(String),
}

pub type Result<T> = std::result::Result<T, CallError>;
