//! Wire format of the rendezvous protocol.
//!
//! Every frame is a JSON envelope `{"type", "sessionId", "payload"}`. The
//! envelope is decoded first and the payload is interpreted per `type`, so an
//! unknown message type is reported without failing the whole frame parse.

use super::error::SignalingError;
use crate::peer::transport::Signal;
use common::secret::{ExposeSecret, SecretString};
use common::types::{ParticipantId, SessionId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,

    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: &str, session_id: &SessionId, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            session_id: Some(session_id.clone()),
            payload,
        }
    }
}

/// A participant as announced by the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub participant_id: ParticipantId,
    /// Changes every time the participant reconnects.
    pub transport_id: String,
    #[serde(default)]
    pub has_video: bool,
    #[serde(default)]
    pub has_audio: bool,
    #[serde(default)]
    pub is_screen_sharing: bool,
}

/// Messages sent to the rendezvous service.
pub enum ClientMessage {
    Join { token: SecretString },
    Leave,
    Relay { target: ParticipantId, signal: Signal },
    MediaSettings { has_video: bool, has_audio: bool },
    RecordingStarted,
    RecordingStopped,
}

impl ClientMessage {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join-consultation",
            ClientMessage::Leave => "leave-consultation",
            ClientMessage::Relay { .. } => "webrtc-signal",
            ClientMessage::MediaSettings { .. } => "update-video-settings",
            ClientMessage::RecordingStarted => "recording-started",
            ClientMessage::RecordingStopped => "recording-stopped",
        }
    }

    /// Encodes the message for `session_id`.
    ///
    /// The identity token is only exposed here, at the wire boundary.
    pub fn to_envelope(&self, session_id: &SessionId) -> Envelope {
        let payload = match self {
            ClientMessage::Join { token } => json!({
                "sessionId": session_id,
                "token": token.expose_secret(),
            }),
            ClientMessage::Leave | ClientMessage::RecordingStarted | ClientMessage::RecordingStopped => {
                json!({})
            }
            ClientMessage::Relay { target, signal } => json!({
                "targetParticipantId": target,
                "signal": signal,
            }),
            ClientMessage::MediaSettings {
                has_video,
                has_audio,
            } => json!({
                "hasVideo": has_video,
                "hasAudio": has_audio,
            }),
        };
        Envelope::new(self.kind(), session_id, payload)
    }
}

/// Messages received from the rendezvous service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ExistingParticipants(Vec<Participant>),
    ParticipantJoined(Participant),
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    Signal {
        from: ParticipantId,
        signal: Signal,
    },
    MediaSettings {
        participant_id: ParticipantId,
        has_video: bool,
        has_audio: bool,
    },
    RecordingStarted {
        by: Option<ParticipantId>,
    },
    RecordingStopped {
        by: Option<ParticipantId>,
    },
    Error {
        message: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeftPayload {
    participant_id: ParticipantId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalPayload {
    from_participant_id: ParticipantId,
    signal: Signal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaSettingsPayload {
    participant_id: ParticipantId,
    #[serde(default)]
    has_video: bool,
    #[serde(default)]
    has_audio: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RecordingPayload {
    #[serde(default)]
    participant_id: Option<ParticipantId>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
}

fn payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, SignalingError> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| SignalingError::Malformed {
        kind: envelope.kind.clone(),
        reason: e.to_string(),
    })
}

impl ServerMessage {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, SignalingError> {
        let message = match envelope.kind.as_str() {
            "existing-participants" => ServerMessage::ExistingParticipants(payload(envelope)?),
            "participant-joined" => ServerMessage::ParticipantJoined(payload(envelope)?),
            "participant-left" => {
                let p: LeftPayload = payload(envelope)?;
                ServerMessage::ParticipantLeft {
                    participant_id: p.participant_id,
                }
            }
            "webrtc-signal" => {
                let p: SignalPayload = payload(envelope)?;
                ServerMessage::Signal {
                    from: p.from_participant_id,
                    signal: p.signal,
                }
            }
            "update-video-settings" => {
                let p: MediaSettingsPayload = payload(envelope)?;
                ServerMessage::MediaSettings {
                    participant_id: p.participant_id,
                    has_video: p.has_video,
                    has_audio: p.has_audio,
                }
            }
            "recording-started" | "recording-stopped" => {
                let p: RecordingPayload = if envelope.payload.is_null() {
                    RecordingPayload::default()
                } else {
                    payload(envelope)?
                };
                if envelope.kind == "recording-started" {
                    ServerMessage::RecordingStarted {
                        by: p.participant_id,
                    }
                } else {
                    ServerMessage::RecordingStopped {
                        by: p.participant_id,
                    }
                }
            }
            "error" => {
                let p: ErrorPayload = payload(envelope)?;
                ServerMessage::Error { message: p.message }
            }
            other => return Err(SignalingError::UnknownMessage(other.to_string())),
        };
        Ok(message)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::from("consult-42")
    }

    fn envelope(kind: &str, payload: Value) -> Envelope {
        Envelope::new(kind, &session(), payload)
    }

    #[test]
    fn test_join_envelope_carries_session_and_token() {
        let env = ClientMessage::Join {
            token: SecretString::from("id-token"),
        }
        .to_envelope(&session());

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "join-consultation",
                "sessionId": "consult-42",
                "payload": {"sessionId": "consult-42", "token": "id-token"}
            })
        );
    }

    #[test]
    fn test_relay_envelope() {
        let env = ClientMessage::Relay {
            target: ParticipantId::from("pro-1"),
            signal: Signal::Answer {
                sdp: "v=0".to_string(),
            },
        }
        .to_envelope(&session());

        assert_eq!(env.kind, "webrtc-signal");
        assert_eq!(
            env.payload,
            json!({"targetParticipantId": "pro-1", "signal": {"type": "answer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn test_media_settings_envelope() {
        let env = ClientMessage::MediaSettings {
            has_video: false,
            has_audio: true,
        }
        .to_envelope(&session());
        assert_eq!(env.kind, "update-video-settings");
        assert_eq!(env.payload, json!({"hasVideo": false, "hasAudio": true}));
    }

    #[test]
    fn test_existing_participants() {
        let msg = ServerMessage::from_envelope(&envelope(
            "existing-participants",
            json!([{
                "participantId": "pro-1",
                "transportId": "sock-9",
                "hasVideo": true,
                "hasAudio": true,
                "isScreenSharing": false
            }]),
        ))
        .unwrap();

        let ServerMessage::ExistingParticipants(roster) = msg else {
            panic!("expected roster");
        };
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].participant_id.as_str(), "pro-1");
        assert_eq!(roster[0].transport_id, "sock-9");
        assert!(roster[0].has_video);
    }

    #[test]
    fn test_incoming_signal() {
        let msg = ServerMessage::from_envelope(&envelope(
            "webrtc-signal",
            json!({
                "fromParticipantId": "client-1",
                "signal": {"type": "candidate", "candidate": "c", "sdpMid": "0", "sdpMLineIndex": 0}
            }),
        ))
        .unwrap();

        assert!(matches!(
            msg,
            ServerMessage::Signal { ref from, signal: Signal::Candidate(_) } if from.as_str() == "client-1"
        ));
    }

    #[test]
    fn test_participant_left() {
        let msg = ServerMessage::from_envelope(&envelope(
            "participant-left",
            json!({"participantId": "client-1"}),
        ))
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::ParticipantLeft {
                participant_id: ParticipantId::from("client-1")
            }
        );
    }

    #[test]
    fn test_recording_notice_without_payload() {
        let env: Envelope =
            serde_json::from_str(r#"{"type": "recording-started", "sessionId": "consult-42"}"#)
                .unwrap();
        assert_eq!(
            ServerMessage::from_envelope(&env).unwrap(),
            ServerMessage::RecordingStarted { by: None }
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert!(matches!(
            ServerMessage::from_envelope(&envelope("chat-message", json!({"text": "hi"}))),
            Err(SignalingError::UnknownMessage(kind)) if kind == "chat-message"
        ));
        assert!(matches!(
            ServerMessage::from_envelope(&envelope("participant-left", json!({"who": "x"}))),
            Err(SignalingError::Malformed { .. })
        ));
    }
}
