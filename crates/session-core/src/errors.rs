//! Session error types.
//!
//! Errors are split by blast radius. Acquisition and signaling failures abort
//! the whole session; negotiation and upload failures stay contained to one
//! link or one segment and are reported as events instead.

use thiserror::Error;

/// Top-level error returned by session operations.
///
/// Error codes reported to the embedding UI:
/// - `SignalingUnavailable`: `SIGNALING_UNAVAILABLE`
/// - `MediaUnavailable`, `ConstraintsNotSatisfiable`: `MEDIA_UNAVAILABLE`
/// - `Negotiation`: `NEGOTIATION_FAILED`
/// - `RecordingAlreadyActive`, `NoLocalStream`, `InvalidState`: `INVALID_STATE`
/// - `Upload`: `UPLOAD_FAILED`
/// - `Unsupported`: `UNSUPPORTED`
/// - `ParticipantNotFound`: `NOT_FOUND`
/// - `Config`, `Internal`: `INTERNAL_ERROR`
#[derive(Debug, Error)]
pub enum SessionError {
    /// The rendezvous service could not be reached in time, or the control
    /// connection was lost and could not be re-established.
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// Capture hardware denied or absent.
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// The device cannot meet the requested resolution/frame-rate bounds.
    #[error("Constraints not satisfiable: {0}")]
    ConstraintsNotSatisfiable(String),

    /// Offer/answer exchange or ICE failed for one participant.
    #[error("Negotiation failed for {participant_id}: {reason}")]
    Negotiation {
        participant_id: String,
        reason: String,
    },

    /// `start()` called while a recording is already running.
    #[error("Recording already active")]
    RecordingAlreadyActive,

    /// An operation needs an acquired local stream and there is none.
    #[error("No local stream acquired")]
    NoLocalStream,

    /// Segment upload failed after the last attempt.
    #[error("Upload failed: {0}")]
    Upload(String),

    /// The capability is not offered by the underlying device or transport.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Participant not found.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// The operation is not valid in the current session phase.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor mailbox closed, task join failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Returns the error code reported to the UI layer.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::SignalingUnavailable(_) => "SIGNALING_UNAVAILABLE",
            SessionError::MediaUnavailable(_) | SessionError::ConstraintsNotSatisfiable(_) => {
                "MEDIA_UNAVAILABLE"
            }
            SessionError::Negotiation { .. } => "NEGOTIATION_FAILED",
            SessionError::RecordingAlreadyActive
            | SessionError::NoLocalStream
            | SessionError::InvalidState(_) => "INVALID_STATE",
            SessionError::Upload(_) => "UPLOAD_FAILED",
            SessionError::Unsupported(_) => "UNSUPPORTED",
            SessionError::ParticipantNotFound(_) => "NOT_FOUND",
            SessionError::Config(_) | SessionError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error ends the whole session.
    ///
    /// Only acquisition and signaling failures are session-fatal; everything
    /// else is contained to a link, a segment or a single command.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::SignalingUnavailable(_)
                | SessionError::MediaUnavailable(_)
                | SessionError::ConstraintsNotSatisfiable(_)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            SessionError::SignalingUnavailable("timeout".to_string()).error_code(),
            "SIGNALING_UNAVAILABLE"
        );
        assert_eq!(
            SessionError::ConstraintsNotSatisfiable("1080p".to_string()).error_code(),
            "MEDIA_UNAVAILABLE"
        );
        assert_eq!(
            SessionError::RecordingAlreadyActive.error_code(),
            "INVALID_STATE"
        );
        assert_eq!(SessionError::NoLocalStream.error_code(), "INVALID_STATE");
        assert_eq!(
            SessionError::Negotiation {
                participant_id: "pro-1".to_string(),
                reason: "ice failed".to_string(),
            }
            .error_code(),
            "NEGOTIATION_FAILED"
        );
        assert_eq!(
            SessionError::Internal("mailbox closed".to_string()).error_code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_only_acquisition_and_signaling_are_fatal() {
        assert!(SessionError::SignalingUnavailable("down".to_string()).is_session_fatal());
        assert!(SessionError::MediaUnavailable("denied".to_string()).is_session_fatal());

        assert!(!SessionError::Upload("503".to_string()).is_session_fatal());
        assert!(!SessionError::Negotiation {
            participant_id: "client-1".to_string(),
            reason: "stuck offer".to_string(),
        }
        .is_session_fatal());
        assert!(!SessionError::RecordingAlreadyActive.is_session_fatal());
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!(
                "{}",
                SessionError::Negotiation {
                    participant_id: "pro-1".to_string(),
                    reason: "ice failed".to_string(),
                }
            ),
            "Negotiation failed for pro-1: ice failed"
        );
        assert_eq!(
            format!("{}", SessionError::NoLocalStream),
            "No local stream acquired"
        );
    }
}
