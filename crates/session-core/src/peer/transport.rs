//! Capability interface over the media transport engine.
//!
//! The session core never talks to a codec, ICE agent or DTLS stack directly.
//! An adapter over the chosen engine implements [`PeerTransport`] and reports
//! asynchronous happenings through the [`TransportNotifier`] it is given at
//! creation. The `webrtc` adapter lives in [`super::webrtc`].

use crate::config::IceServer;
use crate::media::{LocalStream, LocalTrack};
use crate::monitor::RawTransportStats;
use async_trait::async_trait;
use common::types::ParticipantId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a transport adapter.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Failed to create transport: {0}")]
    Create(String),

    #[error("Description rejected: {0}")]
    Description(String),

    #[error("Candidate rejected: {0}")]
    Candidate(String),

    #[error("Stats unavailable: {0}")]
    Stats(String),

    #[error("Transport closed")]
    Closed,
}

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// ICE candidate as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Negotiation payload relayed between peers.
///
/// Wire form: `{"type": "offer", "sdp": ...}`, `{"type": "answer", "sdp": ...}`
/// or `{"type": "candidate", "candidate": ..., "sdpMid": ..., "sdpMLineIndex": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl Signal {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate(_) => "candidate",
        }
    }
}

/// Connectivity as reported by the engine (ICE connection state, folded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    /// ICE connected or completed.
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Remote media handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub has_audio: bool,
    pub has_video: bool,
}

/// Something the engine observed on one transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// A candidate gathered locally that must be relayed to the peer.
    LocalCandidate(IceCandidate),
    RemoteStream(RemoteStream),
}

/// A [`TransportEvent`] tagged with the link it belongs to.
///
/// `generation` identifies the transport instance. A participant whose link
/// was replaced gets a new generation, so late notices from the old
/// transport can be told apart.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportNotice {
    pub participant_id: ParticipantId,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sending half handed to one transport at creation.
#[derive(Debug, Clone)]
pub struct TransportNotifier {
    participant_id: ParticipantId,
    generation: u64,
    tx: mpsc::Sender<TransportNotice>,
}

impl TransportNotifier {
    #[must_use]
    pub fn new(
        participant_id: ParticipantId,
        generation: u64,
        tx: mpsc::Sender<TransportNotice>,
    ) -> Self {
        Self {
            participant_id,
            generation,
            tx,
        }
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn notice(&self, event: TransportEvent) -> TransportNotice {
        TransportNotice {
            participant_id: self.participant_id.clone(),
            generation: self.generation,
            event,
        }
    }

    /// Reports an event. Returns `false` once the session stopped listening.
    pub async fn notify(&self, event: TransportEvent) -> bool {
        self.tx.send(self.notice(event)).await.is_ok()
    }

    /// Reports an event without waiting. Dropped if the queue is full.
    pub fn try_notify(&self, event: TransportEvent) -> bool {
        self.tx.try_send(self.notice(event)).is_ok()
    }
}

/// One transport link to one remote participant.
#[async_trait]
pub trait PeerTransport: Send {
    /// Attaches every local track for sending.
    async fn attach_stream(&mut self, stream: &LocalStream) -> Result<(), TransportError>;

    /// Creates a local offer and applies it as the local description.
    async fn create_offer(&mut self) -> Result<String, TransportError>;

    /// Creates a local answer to the applied remote offer.
    async fn create_answer(&mut self) -> Result<String, TransportError>;

    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<(), TransportError>;

    /// Discards a pending local offer.
    async fn rollback(&mut self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Swaps the outgoing video track without renegotiation.
    async fn replace_video_track(&mut self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Cumulative counters of the inbound RTP streams and the selected
    /// candidate pair.
    async fn stats(&mut self) -> Result<RawTransportStats, TransportError>;

    /// Caps the bitrate of the outgoing video encoder.
    async fn set_encoder_ceiling(&mut self, max_bitrate_bps: u64) -> Result<(), TransportError>;

    /// Releases engine resources. Must be safe to call more than once.
    fn close(&mut self);
}

/// Creates transports for new links.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Creates a transport for `notifier.participant_id()`. Every event of the
    /// new transport goes through `notifier`.
    async fn create(
        &self,
        ice_servers: &[IceServer],
        notifier: TransportNotifier,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_format() {
        let signal = Signal::Offer {
            sdp: "v=0".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&signal).unwrap(),
            json!({"type": "offer", "sdp": "v=0"})
        );
    }

    #[test]
    fn test_candidate_wire_format() {
        let value = json!({
            "type": "candidate",
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });

        let signal: Signal = serde_json::from_value(value.clone()).unwrap();
        let Signal::Candidate(c) = &signal else {
            panic!("expected candidate, got {signal:?}");
        };
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert_eq!(serde_json::to_value(&signal).unwrap(), value);
    }

    #[test]
    fn test_candidate_without_optional_fields() {
        let signal: Signal =
            serde_json::from_value(json!({"type": "candidate", "candidate": "c"})).unwrap();
        assert_eq!(
            signal,
            Signal::Candidate(IceCandidate {
                candidate: "c".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            })
        );
        assert_eq!(signal.kind(), "candidate");
    }

    #[tokio::test]
    async fn test_notifier_tags_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let notifier = TransportNotifier::new(ParticipantId::from("pro-1"), 3, tx);

        assert!(notifier.notify(TransportEvent::StateChanged(TransportState::Connecting)).await);
        assert!(notifier.try_notify(TransportEvent::StateChanged(TransportState::Connected)));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.participant_id, ParticipantId::from("pro-1"));
        assert_eq!(first.generation, 3);
        assert_eq!(
            rx.recv().await.unwrap().event,
            TransportEvent::StateChanged(TransportState::Connected)
        );

        drop(rx);
        assert!(!notifier.notify(TransportEvent::StateChanged(TransportState::Closed)).await);
    }

    #[test]
    fn test_unknown_signal_type_rejected() {
        let result: Result<Signal, _> = serde_json::from_value(json!({"type": "pranswer", "sdp": ""}));
        assert!(result.is_err());
    }
}
