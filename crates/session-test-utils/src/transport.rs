//! Fake peer transports.
//!
//! Every transport the factory creates appends its calls to a shared log as
//! `"<participant>:<call>"`. The factory keeps every transport's notifier so
//! the test can play the media engine: report a connection, a lost connection
//! or a local candidate, also from a transport that was since replaced.

use async_trait::async_trait;
use common::types::ParticipantId;
use session_core::config::IceServer;
use session_core::media::{LocalStream, LocalTrack};
use session_core::monitor::RawTransportStats;
use session_core::peer::{
    IceCandidate, PeerTransport, PeerTransportFactory, RemoteStream, SdpKind, TransportError,
    TransportEvent, TransportNotifier, TransportState,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    log: Vec<String>,
    created: Vec<ParticipantId>,
    notifiers: HashMap<ParticipantId, Vec<TransportNotifier>>,
    stats: HashMap<ParticipantId, VecDeque<RawTransportStats>>,
    fail_create: bool,
}

/// Factory of fake transports. Clones share state.
#[derive(Clone, Default)]
pub struct FakeTransportFactory {
    state: Arc<Mutex<State>>,
}

impl FakeTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `create` fail.
    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Full call log.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    /// Calls made on transports for one participant, without the prefix.
    #[must_use]
    pub fn calls_for(&self, participant_id: &ParticipantId) -> Vec<String> {
        let prefix = format!("{participant_id}:");
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Participants a transport was created for, in creation order.
    #[must_use]
    pub fn created(&self) -> Vec<ParticipantId> {
        self.state.lock().unwrap().created.clone()
    }

    /// Queue cumulative counters for a participant's transport.
    ///
    /// Each stats read takes the next queued reading; the last one repeats.
    pub fn push_stats(&self, participant_id: &ParticipantId, stats: RawTransportStats) {
        self.state
            .lock()
            .unwrap()
            .stats
            .entry(participant_id.clone())
            .or_default()
            .push_back(stats);
    }

    /// Plays a transport event for the latest transport of a participant.
    ///
    /// # Panics
    ///
    /// Panics if no transport was created for the participant.
    pub async fn notify(&self, participant_id: &ParticipantId, event: TransportEvent) {
        let count = self.transport_count(participant_id);
        assert!(count > 0, "no transport for participant");
        self.notify_transport(participant_id, count - 1, event).await;
    }

    /// Plays a transport event for the `nth` transport (0-based, creation
    /// order) ever created for a participant.
    ///
    /// # Panics
    ///
    /// Panics if that transport was never created.
    pub async fn notify_transport(
        &self,
        participant_id: &ParticipantId,
        nth: usize,
        event: TransportEvent,
    ) {
        let notifier = self
            .state
            .lock()
            .unwrap()
            .notifiers
            .get(participant_id)
            .and_then(|all| all.get(nth))
            .cloned()
            .expect("no such transport for participant");
        assert!(
            notifier.notify(event).await,
            "session stopped reading transport notices"
        );
    }

    /// How many transports were created for a participant.
    #[must_use]
    pub fn transport_count(&self, participant_id: &ParticipantId) -> usize {
        self.state
            .lock()
            .unwrap()
            .notifiers
            .get(participant_id)
            .map_or(0, Vec::len)
    }

    pub async fn set_state(&self, participant_id: &ParticipantId, state: TransportState) {
        self.notify(participant_id, TransportEvent::StateChanged(state))
            .await;
    }

    pub async fn remote_stream(&self, participant_id: &ParticipantId) {
        self.notify(
            participant_id,
            TransportEvent::RemoteStream(RemoteStream {
                stream_id: format!("stream-{participant_id}"),
                has_audio: true,
                has_video: true,
            }),
        )
        .await;
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        notifier: TransportNotifier,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let participant_id = notifier.participant_id().clone();
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(TransportError::Create("engine unavailable".to_string()));
        }
        state.created.push(participant_id.clone());
        state
            .notifiers
            .entry(participant_id.clone())
            .or_default()
            .push(notifier);
        state.log.push(format!("{participant_id}:create"));

        Ok(Box::new(FakeTransport {
            participant_id: participant_id.clone(),
            state: Arc::clone(&self.state),
            offers: 0,
        }))
    }
}

struct FakeTransport {
    participant_id: ParticipantId,
    state: Arc<Mutex<State>>,
    offers: u32,
}

impl FakeTransport {
    fn push(&self, call: impl AsRef<str>) {
        self.state
            .lock()
            .unwrap()
            .log
            .push(format!("{}:{}", self.participant_id, call.as_ref()));
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn attach_stream(&mut self, stream: &LocalStream) -> Result<(), TransportError> {
        self.push(format!("attach-{}", stream.tracks.len()));
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<String, TransportError> {
        self.offers += 1;
        self.push("offer");
        Ok(format!("offer-{}-{}", self.participant_id, self.offers))
    }

    async fn create_answer(&mut self) -> Result<String, TransportError> {
        self.push("answer");
        Ok(format!("answer-{}", self.participant_id))
    }

    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        _sdp: &str,
    ) -> Result<(), TransportError> {
        let kind = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        self.push(format!("remote-{kind}"));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransportError> {
        self.push("rollback");
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.push(format!("candidate-{}", candidate.candidate));
        Ok(())
    }

    async fn replace_video_track(&mut self, track: &LocalTrack) -> Result<(), TransportError> {
        self.push(format!("replace-{:?}", track.source));
        Ok(())
    }

    async fn stats(&mut self) -> Result<RawTransportStats, TransportError> {
        let mut state = self.state.lock().unwrap();
        let queue = state.stats.entry(self.participant_id.clone()).or_default();
        let stats = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        };
        Ok(stats.unwrap_or_default())
    }

    async fn set_encoder_ceiling(&mut self, max_bitrate_bps: u64) -> Result<(), TransportError> {
        self.push(format!("ceiling-{max_bitrate_bps}"));
        Ok(())
    }

    fn close(&mut self) {
        self.push("close");
    }
}
