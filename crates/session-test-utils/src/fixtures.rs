//! Pre-configured test data and a session harness.
//!
//! Provides:
//! - Participants and identity tokens
//! - A configuration with test-friendly timings
//! - [`TestSession`]: a spawned `SessionActor` wired to every fake

use crate::devices::FakeDevices;
use crate::recorder::FakeRecorderFactory;
use crate::signaling::FakeSignaling;
use crate::transport::FakeTransportFactory;
use crate::uploader::ScriptedUploader;
use common::secret::SecretString;
use common::types::{ParticipantId, SessionId};
use session_core::errors::SessionError;
use session_core::signaling::Participant;
use session_core::{SessionActor, SessionConfig, SessionDeps, SessionEvent, SessionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Session every fixture joins.
pub const TEST_SESSION_ID: &str = "consult-42";

/// How long [`TestSession::wait_for`] waits before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(300);

/// A participant with audio and video whose transport id is `<id>-t1`.
#[must_use]
pub fn participant(id: &str) -> Participant {
    participant_on(id, &format!("{id}-t1"))
}

/// A participant with audio and video on a given transport id.
#[must_use]
pub fn participant_on(id: &str, transport_id: &str) -> Participant {
    Participant {
        participant_id: ParticipantId::from(id),
        transport_id: transport_id.to_string(),
        has_video: true,
        has_audio: true,
        is_screen_sharing: false,
    }
}

#[must_use]
pub fn session_id() -> SessionId {
    SessionId::from(TEST_SESSION_ID)
}

#[must_use]
pub fn token() -> SecretString {
    SecretString::from("test-identity-token")
}

/// Default configuration with a short segment length and upload backoff.
#[must_use]
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::new("ws://rendezvous.test/ws");
    config.segment_duration = Duration::from_secs(2);
    config.upload_initial_backoff = Duration::from_millis(100);
    config
}

/// A running `SessionActor` wired to fakes.
pub struct TestSession {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<()>,
    pub cancel_token: CancellationToken,
    pub signaling: FakeSignaling,
    pub transports: FakeTransportFactory,
    pub devices: FakeDevices,
    pub recorder: FakeRecorderFactory,
    pub uploader: ScriptedUploader,
}

impl TestSession {
    /// Spawns a session whose rendezvous service answers joins with an
    /// empty roster.
    #[must_use]
    pub fn spawn(local_id: &str) -> Self {
        Self::spawn_with(
            local_id,
            test_config(),
            FakeSignaling::with_roster(Vec::new()),
            FakeDevices::new(),
        )
    }

    #[must_use]
    pub fn spawn_with(
        local_id: &str,
        config: SessionConfig,
        signaling: FakeSignaling,
        devices: FakeDevices,
    ) -> Self {
        let transports = FakeTransportFactory::new();
        let recorder = FakeRecorderFactory::new();
        let uploader = ScriptedUploader::new();
        let cancel_token = CancellationToken::new();

        let deps = SessionDeps {
            signaling: Arc::new(signaling.clone()),
            transports: Arc::new(transports.clone()),
            devices: Arc::new(devices.clone()),
            recorder: Arc::new(recorder.clone()),
            uploader: Arc::new(uploader.clone()),
        };
        let (handle, events, task) = SessionActor::spawn(
            config,
            ParticipantId::from(local_id),
            deps,
            cancel_token.clone(),
        );

        Self {
            handle,
            events,
            task,
            cancel_token,
            signaling,
            transports,
            devices,
            recorder,
            uploader,
        }
    }

    /// Joins [`TEST_SESSION_ID`].
    pub async fn join(&self) -> Result<Vec<Participant>, SessionError> {
        self.handle.join(session_id(), token()).await
    }

    /// Waits for the first event matching `predicate`, skipping the rest.
    ///
    /// # Panics
    ///
    /// Panics if the event stream ends or nothing matches within
    /// [`EVENT_TIMEOUT`].
    pub async fn wait_for(&mut self, predicate: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let events = &mut self.events;
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let event = events.recv().await.expect("event stream ended");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    /// Drains every event already emitted.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}
