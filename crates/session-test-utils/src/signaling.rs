//! Fake rendezvous service.
//!
//! Every `connect()` opens a fresh in-memory link. A background task per
//! link records what the client sends and answers `join-consultation` with
//! the configured roster. The test pushes server messages with [`FakeSignaling::push`]
//! and simulates a dropped connection with [`FakeSignaling::drop_connection`].
//!
//! # Example
//!
//! ```rust,ignore
//! let signaling = FakeSignaling::with_roster(vec![participant("pro-1")]);
//! // ... join through a SignalingChannel or SessionActor ...
//! signaling.push(signaling::participant_left(&"pro-1".into())).await;
//! ```

use async_trait::async_trait;
use common::types::ParticipantId;
use serde_json::{json, Value};
use session_core::peer::Signal;
use session_core::signaling::{
    Envelope, Participant, SignalingConnector, SignalingError, SignalingLink,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

/// How long the `wait_for_*` helpers wait before failing the test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct State {
    roster: Option<Vec<Participant>>,
    refuse: u32,
    connects: u32,
    generation: u64,
    current: Option<mpsc::Sender<Envelope>>,
    received: Vec<Envelope>,
}

/// Fake rendezvous service. Clones share state.
#[derive(Clone, Default)]
pub struct FakeSignaling {
    state: Arc<Mutex<State>>,
}

impl FakeSignaling {
    /// A service that accepts connections but never answers a join.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A service that answers every join with `roster`.
    #[must_use]
    pub fn with_roster(roster: Vec<Participant>) -> Self {
        let fake = Self::default();
        fake.set_roster(roster);
        fake
    }

    /// Roster sent in reply to the next joins.
    pub fn set_roster(&self, roster: Vec<Participant>) {
        self.state.lock().unwrap().roster = Some(roster);
    }

    /// Stop answering joins. Connections still succeed.
    pub fn go_silent(&self) {
        self.state.lock().unwrap().roster = None;
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.state.lock().unwrap().refuse = count;
    }

    /// Connection attempts seen so far, refused ones included.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    /// Whether a client link is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Sends a server message to the connected client.
    ///
    /// # Panics
    ///
    /// Panics if no client is connected.
    pub async fn push(&self, envelope: Envelope) {
        let tx = self
            .state
            .lock()
            .unwrap()
            .current
            .clone()
            .expect("no client connected");
        tx.send(envelope).await.expect("client link closed");
    }

    /// Closes the server side of the current link.
    pub fn drop_connection(&self) {
        self.state.lock().unwrap().current = None;
    }

    /// Every envelope the client sent, across all connections.
    #[must_use]
    pub fn received(&self) -> Vec<Envelope> {
        self.state.lock().unwrap().received.clone()
    }

    /// Message types the client sent, in order.
    #[must_use]
    pub fn received_kinds(&self) -> Vec<String> {
        self.received().into_iter().map(|e| e.kind).collect()
    }

    /// Negotiation payloads the client relayed to `target`, in order.
    #[must_use]
    pub fn relayed_to(&self, target: &ParticipantId) -> Vec<Signal> {
        self.received()
            .into_iter()
            .filter(|e| e.kind == "webrtc-signal")
            .filter(|e| e.payload["targetParticipantId"] == target.as_str())
            .map(|e| serde_json::from_value(e.payload["signal"].clone()).unwrap())
            .collect()
    }

    /// Waits until the client has sent a message of type `kind` and returns
    /// the latest one.
    ///
    /// # Panics
    ///
    /// Panics if nothing arrives within [`WAIT_TIMEOUT`].
    pub async fn wait_for_kind(&self, kind: &str) -> Envelope {
        self.wait_until(|received| received.iter().rev().find(|e| e.kind == kind).cloned())
            .await
    }

    /// Waits until the client has sent `count` messages of type `kind` and
    /// returns all of them.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive within [`WAIT_TIMEOUT`].
    pub async fn wait_for_count(&self, kind: &str, count: usize) -> Vec<Envelope> {
        self.wait_until(|received| {
            let matching: Vec<Envelope> =
                received.iter().filter(|e| e.kind == kind).cloned().collect();
            (matching.len() >= count).then_some(matching)
        })
        .await
    }

    /// Waits until at least `count` signals were relayed to `target`.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive within [`WAIT_TIMEOUT`].
    pub async fn wait_for_relayed(&self, target: &ParticipantId, count: usize) -> Vec<Signal> {
        self.wait_until(|_| {
            let relayed = self.relayed_to(target);
            (relayed.len() >= count).then_some(relayed)
        })
        .await
    }

    async fn wait_until<T>(&self, check: impl Fn(&[Envelope]) -> Option<T>) -> T {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let received = self.received();
                if let Some(found) = check(&received) {
                    return found;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .expect("timed out waiting for client message")
    }

    fn server_end(&self, generation: u64) -> Option<mpsc::Sender<Envelope>> {
        let state = self.state.lock().unwrap();
        if state.generation == generation {
            state.current.clone()
        } else {
            None
        }
    }

    async fn serve(self, generation: u64, mut from_client: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = from_client.recv().await {
            let is_join = envelope.kind == "join-consultation";
            let roster = {
                let mut state = self.state.lock().unwrap();
                state.received.push(envelope);
                state.roster.clone()
            };

            if let (true, Some(roster)) = (is_join, roster) {
                if let Some(tx) = self.server_end(generation) {
                    let _ = tx.send(existing_participants(&roster)).await;
                }
            }
        }
    }
}

#[async_trait]
impl SignalingConnector for FakeSignaling {
    async fn connect(&self) -> Result<SignalingLink, SignalingError> {
        let (to_client, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound, from_client) = mpsc::channel(CHANNEL_CAPACITY);

        let generation = {
            let mut state = self.state.lock().unwrap();
            state.connects += 1;
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(SignalingError::Connect("connection refused".to_string()));
            }
            state.generation += 1;
            state.current = Some(to_client);
            state.generation
        };

        tokio::spawn(self.clone().serve(generation, from_client));
        Ok(SignalingLink { outbound, inbound })
    }
}

fn server_message(kind: &str, payload: Value) -> Envelope {
    Envelope {
        kind: kind.to_string(),
        session_id: None,
        payload,
    }
}

#[must_use]
pub fn existing_participants(roster: &[Participant]) -> Envelope {
    server_message("existing-participants", json!(roster))
}

#[must_use]
pub fn participant_joined(participant: &Participant) -> Envelope {
    server_message("participant-joined", json!(participant))
}

#[must_use]
pub fn participant_left(participant_id: &ParticipantId) -> Envelope {
    server_message(
        "participant-left",
        json!({ "participantId": participant_id }),
    )
}

#[must_use]
pub fn signal_from(from: &ParticipantId, signal: &Signal) -> Envelope {
    server_message(
        "webrtc-signal",
        json!({ "fromParticipantId": from, "signal": signal }),
    )
}

#[must_use]
pub fn media_settings(participant_id: &ParticipantId, has_video: bool, has_audio: bool) -> Envelope {
    server_message(
        "update-video-settings",
        json!({
            "participantId": participant_id,
            "hasVideo": has_video,
            "hasAudio": has_audio,
        }),
    )
}

#[must_use]
pub fn server_error(message: &str) -> Envelope {
    server_message("error", json!({ "message": message }))
}
