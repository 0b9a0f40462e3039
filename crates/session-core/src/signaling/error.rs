//! Signaling error type.

use crate::errors::SessionError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("Failed to connect to rendezvous service: {0}")]
    Connect(String),

    #[error("No roster received within {0} seconds")]
    JoinTimeout(u64),

    #[error("Signaling connection closed")]
    Closed,

    #[error("Malformed message '{kind}': {reason}")]
    Malformed { kind: String, reason: String },

    #[error("Unknown message type: {0}")]
    UnknownMessage(String),

    #[error("Rejected by rendezvous service: {0}")]
    Rejected(String),

    #[error("Not joined")]
    NotJoined,

    #[error("Join already attempted in phase {0}")]
    AlreadyJoined(&'static str),
}

impl From<SignalingError> for SessionError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::NotJoined | SignalingError::AlreadyJoined(_) => {
                SessionError::InvalidState(err.to_string())
            }
            other => SessionError::SignalingUnavailable(other.to_string()),
        }
    }
}
