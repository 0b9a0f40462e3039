//! Signaling channel: the persistent control connection to the rendezvous
//! service.
//!
//! The channel owns the session phase. Transport to the service is behind
//! [`SignalingConnector`], which yields a pair of envelope channels; the
//! WebSocket implementation lives in [`super::websocket`].

use super::error::SignalingError;
use super::messages::{ClientMessage, Envelope, Participant, ServerMessage};
use crate::peer::transport::Signal;
use async_trait::async_trait;
use common::secret::SecretString;
use common::types::{ParticipantId, SessionId};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Envelope channels of one control connection.
///
/// Dropping `outbound` closes the connection.
pub struct SignalingLink {
    pub outbound: mpsc::Sender<Envelope>,
    pub inbound: mpsc::Receiver<Envelope>,
}

/// Opens control connections to the rendezvous service.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingLink, SignalingError>;
}

/// Phase of the session as seen by signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    Joining,
    Active,
    Ended,
}

impl SessionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Joining => "joining",
            SessionPhase::Active => "active",
            SessionPhase::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous events after the roster.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    ParticipantJoined(Participant),
    ParticipantLeft(ParticipantId),
    SignalReceived {
        from: ParticipantId,
        signal: Signal,
    },
    MediaSettingsChanged {
        participant_id: ParticipantId,
        has_video: bool,
        has_audio: bool,
    },
    RemoteRecording {
        started: bool,
        by: Option<ParticipantId>,
    },
    ServerError(String),
    /// The control connection dropped. The channel stays `Active` and can be
    /// re-established with [`SignalingChannel::reconnect`].
    Disconnected,
}

pub struct SignalingChannel {
    connector: Arc<dyn SignalingConnector>,
    join_timeout: Duration,
    phase: SessionPhase,
    session_id: Option<SessionId>,
    token: Option<SecretString>,
    link: Option<SignalingLink>,
    /// Events received while waiting for the roster, delivered after it.
    backlog: VecDeque<SignalingEvent>,
}

impl SignalingChannel {
    pub fn new(connector: Arc<dyn SignalingConnector>, join_timeout: Duration) -> Self {
        Self {
            connector,
            join_timeout,
            phase: SessionPhase::Idle,
            session_id: None,
            token: None,
            link: None,
            backlog: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Joins `session_id` and returns the participants already present.
    ///
    /// Fails if the service cannot be reached or does not send the roster
    /// within the join timeout; the phase then goes back to `Idle`.
    #[instrument(skip_all, name = "vs.signaling.join", fields(session_id = %session_id))]
    pub async fn join(
        &mut self,
        session_id: SessionId,
        token: SecretString,
    ) -> Result<Vec<Participant>, SignalingError> {
        if self.phase != SessionPhase::Idle {
            return Err(SignalingError::AlreadyJoined(self.phase.as_str()));
        }

        self.phase = SessionPhase::Joining;
        self.session_id = Some(session_id.clone());
        self.token = Some(token);

        match self.handshake().await {
            Ok(roster) => {
                self.phase = SessionPhase::Active;
                info!(
                    target: "vs.signaling",
                    session_id = %session_id,
                    participants = roster.len(),
                    "Joined session"
                );
                Ok(roster)
            }
            Err(e) => {
                warn!(target: "vs.signaling", session_id = %session_id, error = %e, "Join failed");
                self.phase = SessionPhase::Idle;
                self.session_id = None;
                self.token = None;
                self.link = None;
                Err(e)
            }
        }
    }

    /// Re-establishes a dropped connection and re-sends the join. Returns the
    /// fresh roster.
    #[instrument(skip_all, name = "vs.signaling.reconnect")]
    pub async fn reconnect(&mut self) -> Result<Vec<Participant>, SignalingError> {
        if self.phase != SessionPhase::Active {
            return Err(SignalingError::NotJoined);
        }
        self.link = None;
        self.backlog.clear();
        let roster = self.handshake().await?;
        info!(
            target: "vs.signaling",
            participants = roster.len(),
            "Signaling connection restored"
        );
        Ok(roster)
    }

    async fn handshake(&mut self) -> Result<Vec<Participant>, SignalingError> {
        let (Some(session_id), Some(token)) = (self.session_id.clone(), self.token.clone()) else {
            return Err(SignalingError::NotJoined);
        };
        let join = ClientMessage::Join { token }.to_envelope(&session_id);
        let timeout = self.join_timeout;

        let (link, roster, backlog) =
            tokio::time::timeout(timeout, await_roster(Arc::clone(&self.connector), join))
                .await
                .map_err(|_| SignalingError::JoinTimeout(timeout.as_secs()))??;

        self.link = Some(link);
        self.backlog = backlog;
        Ok(roster)
    }

    /// Waits for the next event.
    ///
    /// Cancel-safe. Pends forever while there is no connection, so it can sit
    /// in a `select!` next to the reconnect timer.
    pub async fn next_event(&mut self) -> SignalingEvent {
        if let Some(event) = self.backlog.pop_front() {
            return event;
        }
        let Some(link) = self.link.as_mut() else {
            return std::future::pending().await;
        };

        loop {
            let Some(envelope) = link.inbound.recv().await else {
                warn!(target: "vs.signaling", "Signaling connection lost");
                self.link = None;
                return SignalingEvent::Disconnected;
            };

            match ServerMessage::from_envelope(&envelope) {
                Ok(message) => {
                    if let Some(event) = to_event(message) {
                        return event;
                    }
                }
                Err(SignalingError::UnknownMessage(kind)) => {
                    debug!(target: "vs.signaling", kind = %kind, "Ignoring unknown message");
                }
                Err(e) => {
                    warn!(target: "vs.signaling", error = %e, "Dropping malformed message");
                }
            }
        }
    }

    async fn send(&mut self, message: ClientMessage) -> Result<(), SignalingError> {
        if self.phase != SessionPhase::Active {
            return Err(SignalingError::NotJoined);
        }
        let (Some(link), Some(session_id)) = (self.link.as_ref(), self.session_id.as_ref()) else {
            return Err(SignalingError::Closed);
        };

        let kind = message.kind();
        if link.outbound.send(message.to_envelope(session_id)).await.is_err() {
            warn!(target: "vs.signaling", kind, "Delivery failed, connection is gone");
            self.link = None;
            return Err(SignalingError::Closed);
        }
        debug!(target: "vs.signaling", kind, "Message sent");
        Ok(())
    }

    /// Relays a negotiation payload to one participant.
    pub async fn relay(
        &mut self,
        target: ParticipantId,
        signal: Signal,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::Relay { target, signal }).await
    }

    pub async fn announce_media(
        &mut self,
        has_video: bool,
        has_audio: bool,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::MediaSettings {
            has_video,
            has_audio,
        })
        .await
    }

    /// Informational only; the other side decides what to show.
    pub async fn announce_recording(&mut self, started: bool) -> Result<(), SignalingError> {
        let message = if started {
            ClientMessage::RecordingStarted
        } else {
            ClientMessage::RecordingStopped
        };
        self.send(message).await
    }

    /// Sends a best-effort leave and closes the connection. Idempotent.
    pub fn leave(&mut self) {
        if self.phase == SessionPhase::Ended {
            return;
        }
        if let (Some(link), Some(session_id)) = (self.link.take(), self.session_id.as_ref()) {
            if let Err(e) = link
                .outbound
                .try_send(ClientMessage::Leave.to_envelope(session_id))
            {
                debug!(target: "vs.signaling", error = %e, "Leave not delivered");
            }
        }
        self.backlog.clear();
        self.token = None;
        self.phase = SessionPhase::Ended;
        info!(target: "vs.signaling", "Left session");
    }
}

/// Connects, sends the join and waits for the roster. Anything that arrives
/// before the roster is kept for later delivery.
async fn await_roster(
    connector: Arc<dyn SignalingConnector>,
    join: Envelope,
) -> Result<(SignalingLink, Vec<Participant>, VecDeque<SignalingEvent>), SignalingError> {
    let mut link = connector.connect().await?;
    link.outbound
        .send(join)
        .await
        .map_err(|_| SignalingError::Closed)?;

    let mut backlog = VecDeque::new();
    loop {
        let envelope = link.inbound.recv().await.ok_or(SignalingError::Closed)?;
        match ServerMessage::from_envelope(&envelope) {
            Ok(ServerMessage::ExistingParticipants(roster)) => return Ok((link, roster, backlog)),
            Ok(ServerMessage::Error { message }) => return Err(SignalingError::Rejected(message)),
            Ok(other) => {
                if let Some(event) = to_event(other) {
                    backlog.push_back(event);
                }
            }
            Err(e) => {
                debug!(target: "vs.signaling", error = %e, "Skipping message during join");
            }
        }
    }
}

fn to_event(message: ServerMessage) -> Option<SignalingEvent> {
    let event = match message {
        ServerMessage::ParticipantJoined(p) => SignalingEvent::ParticipantJoined(p),
        ServerMessage::ParticipantLeft { participant_id } => {
            SignalingEvent::ParticipantLeft(participant_id)
        }
        ServerMessage::Signal { from, signal } => SignalingEvent::SignalReceived { from, signal },
        ServerMessage::MediaSettings {
            participant_id,
            has_video,
            has_audio,
        } => SignalingEvent::MediaSettingsChanged {
            participant_id,
            has_video,
            has_audio,
        },
        ServerMessage::RecordingStarted { by } => SignalingEvent::RemoteRecording { started: true, by },
        ServerMessage::RecordingStopped { by } => SignalingEvent::RemoteRecording { started: false, by },
        ServerMessage::Error { message } => SignalingEvent::ServerError(message),
        ServerMessage::ExistingParticipants(_) => {
            debug!(target: "vs.signaling", "Unsolicited roster ignored");
            return None;
        }
    };
    Some(event)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Hands out prepared links; the test keeps the far ends.
    struct Prepared {
        links: Mutex<Vec<SignalingLink>>,
    }

    #[async_trait]
    impl SignalingConnector for Prepared {
        async fn connect(&self) -> Result<SignalingLink, SignalingError> {
            self.links
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| SignalingError::Connect("refused".to_string()))
        }
    }

    struct FarEnd {
        to_client: mpsc::Sender<Envelope>,
        from_client: mpsc::Receiver<Envelope>,
    }

    fn pair() -> (SignalingLink, FarEnd) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        (
            SignalingLink {
                outbound: out_tx,
                inbound: in_rx,
            },
            FarEnd {
                to_client: in_tx,
                from_client: out_rx,
            },
        )
    }

    fn channel_with(links: Vec<SignalingLink>) -> SignalingChannel {
        SignalingChannel::new(
            Arc::new(Prepared {
                links: Mutex::new(links),
            }),
            Duration::from_secs(10),
        )
    }

    fn server(kind: &str, payload: serde_json::Value) -> Envelope {
        Envelope::new(kind, &SessionId::from("consult-1"), payload)
    }

    fn roster() -> Envelope {
        server(
            "existing-participants",
            json!([{"participantId": "pro-1", "transportId": "s1", "hasVideo": true, "hasAudio": true}]),
        )
    }

    #[tokio::test]
    async fn test_join_returns_roster_then_backlog() {
        let (link, mut far) = pair();
        let mut channel = channel_with(vec![link]);

        far.to_client
            .send(server("participant-joined", json!({"participantId": "client-2", "transportId": "s2"})))
            .await
            .unwrap();
        far.to_client.send(roster()).await.unwrap();

        let roster = channel
            .join(SessionId::from("consult-1"), SecretString::from("tok"))
            .await
            .unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(channel.phase(), SessionPhase::Active);

        let join = far.from_client.recv().await.unwrap();
        assert_eq!(join.kind, "join-consultation");
        assert_eq!(join.payload["token"], "tok");

        assert!(matches!(
            channel.next_event().await,
            SignalingEvent::ParticipantJoined(p) if p.participant_id.as_str() == "client-2"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let mut channel = channel_with(Vec::new());
        let err = channel
            .join(SessionId::from("consult-1"), SecretString::from("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Connect(_)));
        assert_eq!(channel.phase(), SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_times_out_without_roster() {
        let (link, _far) = pair();
        let mut channel = channel_with(vec![link]);

        let err = channel
            .join(SessionId::from("consult-1"), SecretString::from("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::JoinTimeout(10)));
        assert!(matches!(
            crate::errors::SessionError::from(err),
            crate::errors::SessionError::SignalingUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_server_error_rejects_join() {
        let (link, far) = pair();
        let mut channel = channel_with(vec![link]);
        far.to_client
            .send(server("error", json!({"message": "session closed"})))
            .await
            .unwrap();

        let err = channel
            .join(SessionId::from("consult-1"), SecretString::from("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Rejected(m) if m == "session closed"));
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let (second, mut far2) = pair();
        let (first, far1) = pair();
        // Links are popped from the back
        let mut channel = channel_with(vec![second, first]);

        far1.to_client.send(roster()).await.unwrap();
        channel
            .join(SessionId::from("consult-1"), SecretString::from("tok"))
            .await
            .unwrap();

        drop(far1);
        assert_eq!(channel.next_event().await, SignalingEvent::Disconnected);
        assert!(!channel.is_connected());
        assert!(channel.relay(ParticipantId::from("pro-1"), Signal::Offer { sdp: String::new() }).await.is_err());

        far2.to_client.send(roster()).await.unwrap();
        let roster = channel.reconnect().await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(far2.from_client.recv().await.unwrap().kind, "join-consultation");

        channel
            .relay(ParticipantId::from("pro-1"), Signal::Offer { sdp: "o".to_string() })
            .await
            .unwrap();
        let relayed = far2.from_client.recv().await.unwrap();
        assert_eq!(relayed.kind, "webrtc-signal");
        assert_eq!(relayed.payload["targetParticipantId"], "pro-1");
    }

    #[tokio::test]
    async fn test_unknown_messages_are_skipped() {
        let (link, far) = pair();
        let mut channel = channel_with(vec![link]);
        far.to_client.send(roster()).await.unwrap();
        channel
            .join(SessionId::from("consult-1"), SecretString::from("tok"))
            .await
            .unwrap();

        far.to_client.send(server("chat-message", json!({"text": "hi"}))).await.unwrap();
        far.to_client
            .send(server("participant-left", json!({"participantId": "pro-1"})))
            .await
            .unwrap();

        assert_eq!(
            channel.next_event().await,
            SignalingEvent::ParticipantLeft(ParticipantId::from("pro-1"))
        );
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (link, mut far) = pair();
        let mut channel = channel_with(vec![link]);
        far.to_client.send(roster()).await.unwrap();
        channel
            .join(SessionId::from("consult-1"), SecretString::from("tok"))
            .await
            .unwrap();
        far.from_client.recv().await.unwrap();

        channel.leave();
        channel.leave();

        assert_eq!(channel.phase(), SessionPhase::Ended);
        assert_eq!(far.from_client.recv().await.unwrap().kind, "leave-consultation");
        // Outbound dropped after the single leave
        assert!(far.from_client.recv().await.is_none());
        assert!(matches!(
            channel.announce_recording(true).await,
            Err(SignalingError::NotJoined)
        ));
    }
}
