//! Message types for the session actor.
//!
//! Commands go in through [`SessionMessage`] with a `oneshot` for the reply.
//! Everything the UI should render comes out as a [`SessionEvent`].

use crate::errors::SessionError;
use crate::media::{DegradedAcquisition, LocalStream, TrackKind};
use crate::monitor::HealthSample;
use crate::peer::{LinkSnapshot, LinkState, RemoteStream};
use crate::quality::{QualityChange, QualityTier};
use crate::recording::{RecordingArtifact, RecordingState, RecordingWarning};
use crate::signaling::{Participant, SessionPhase};
use common::secret::SecretString;
use common::types::{ParticipantId, SessionId};
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Join the session, acquire local media and open links to the roster.
    Join {
        session_id: SessionId,
        token: SecretString,
        respond_to: oneshot::Sender<Result<Vec<Participant>, SessionError>>,
    },

    /// Tear everything down. Returns the artifact if a recording was running.
    Leave {
        respond_to: oneshot::Sender<Option<RecordingArtifact>>,
    },

    /// Mute or unmute a local track.
    SetMediaEnabled {
        kind: TrackKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    StartScreenShare {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    StopScreenShare {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    StartRecording {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    StopRecording {
        respond_to: oneshot::Sender<Option<RecordingArtifact>>,
    },

    SetAdaptiveQuality {
        adaptive: bool,
    },

    /// Manual override of the active quality profile.
    ForceQuality {
        tier: QualityTier,
        respond_to: oneshot::Sender<Option<QualityChange>>,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },

    /// Release one participant's link.
    DestroyLink {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<bool>,
    },
    ReconnectLink {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Everything observable about a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined {
        session_id: SessionId,
        participants: Vec<Participant>,
    },
    /// Local media was acquired below what was asked for.
    AcquisitionDegraded(DegradedAcquisition),
    ParticipantJoined(Participant),
    ParticipantLeft(ParticipantId),
    ParticipantMediaChanged {
        participant_id: ParticipantId,
        has_video: bool,
        has_audio: bool,
    },
    RemoteStreamAvailable {
        participant_id: ParticipantId,
        stream: RemoteStream,
    },
    LinkStateChanged {
        participant_id: ParticipantId,
        from: LinkState,
        to: LinkState,
    },
    /// The link closed for good. The participant may still be in the session.
    ParticipantLinkLost {
        participant_id: ParticipantId,
        reason: String,
    },
    StatsUpdated(HealthSample),
    QualityChanged(QualityChange),
    RecordingStateChanged(RecordingState),
    SegmentUploaded {
        sequence: u64,
    },
    RecordingWarning(RecordingWarning),
    RecordingFinished(RecordingArtifact),
    /// A remote participant started or stopped recording.
    RemoteRecording {
        started: bool,
        by: Option<ParticipantId>,
    },
    SignalingReconnecting {
        attempt: u32,
        delay: Duration,
    },
    SignalingRestored,
    /// Reconnect attempts exhausted. The session is torn down after this.
    SignalingLost {
        attempts: u32,
    },
    ServerError(String),
    Ended,
}

/// Immutable view of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub local_id: ParticipantId,
    pub session_id: Option<SessionId>,
    pub phase: SessionPhase,
    /// Sorted by participant id.
    pub participants: Vec<Participant>,
    /// Sorted by participant id.
    pub links: Vec<LinkSnapshot>,
    pub local_stream: Option<LocalStream>,
    pub screen_sharing: bool,
    pub quality: QualityTier,
    pub adaptive_quality: bool,
    pub recording: RecordingState,
    pub signaling_connected: bool,
}
