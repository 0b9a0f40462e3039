//! One transport link to one remote participant.

use super::transport::{IceCandidate, PeerTransport, RemoteStream, SdpKind, TransportError};
use crate::media::{LocalStream, LocalTrack};
use crate::monitor::{ConnectionStats, HealthSample, LinkHealth, RawTransportStats};
use common::types::ParticipantId;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifecycle of a link.
///
/// `Idle -> Offering | Answering -> Connected <-> Reconnecting`, any state to
/// `Closed`. A renegotiation offer on a live link moves it to `Answering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Idle,
    Offering,
    Answering,
    Connected,
    Reconnecting,
    Closed,
}

impl LinkState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Offering => "offering",
            LinkState::Answering => "answering",
            LinkState::Connected => "connected",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Closed => "closed",
        }
    }

    /// Still negotiating, counted against the negotiation timeout.
    #[must_use]
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            LinkState::Idle | LinkState::Offering | LinkState::Answering
        )
    }

    #[must_use]
    pub fn can_transition_to(self, to: LinkState) -> bool {
        use LinkState::{Answering, Closed, Connected, Idle, Offering, Reconnecting};
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Offering | Answering)
            | (Offering, Answering | Connected)
            | (Answering, Connected)
            | (Connected, Reconnecting | Answering)
            | (Reconnecting, Connected | Answering) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offer/answer sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Stable,
    OfferSent,
    AnswerPending,
}

/// Immutable view of a link for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub participant_id: ParticipantId,
    pub transport_id: Option<String>,
    pub state: LinkState,
    pub negotiation: NegotiationState,
    pub health: Option<LinkHealth>,
    pub last_stats: Option<ConnectionStats>,
    pub remote_stream: Option<RemoteStream>,
}

pub struct PeerLink {
    participant_id: ParticipantId,
    generation: u64,
    transport_id: Option<String>,
    transport: Box<dyn PeerTransport>,
    state: LinkState,
    negotiation: NegotiationState,
    state_since: Instant,
    remote_description_set: bool,
    tracks_attached: bool,
    pending_candidates: Vec<IceCandidate>,
    health: Option<LinkHealth>,
    last_stats: Option<ConnectionStats>,
    remote_stream: Option<RemoteStream>,
}

impl PeerLink {
    pub fn new(
        participant_id: ParticipantId,
        generation: u64,
        transport_id: Option<String>,
        transport: Box<dyn PeerTransport>,
        now: Instant,
    ) -> Self {
        Self {
            participant_id,
            generation,
            transport_id,
            transport,
            state: LinkState::Idle,
            negotiation: NegotiationState::Stable,
            state_since: now,
            remote_description_set: false,
            tracks_attached: false,
            pending_candidates: Vec::new(),
            health: None,
            last_stats: None,
            remote_stream: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Which transport instance this link owns.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn negotiation(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn transport_id(&self) -> Option<&str> {
        self.transport_id.as_deref()
    }

    pub fn set_transport_id(&mut self, transport_id: String) {
        self.transport_id = Some(transport_id);
    }

    pub fn state_since(&self) -> Instant {
        self.state_since
    }

    /// Moves to `to` if the transition is legal. Returns the previous state
    /// when the state actually changed.
    pub fn transition(&mut self, to: LinkState, now: Instant) -> Option<LinkState> {
        if self.state == to {
            return None;
        }
        if !self.state.can_transition_to(to) {
            debug!(
                target: "vs.peer",
                participant_id = %self.participant_id,
                from = %self.state,
                to = %to,
                "Ignoring illegal link transition"
            );
            return None;
        }
        let from = std::mem::replace(&mut self.state, to);
        self.state_since = now;
        Some(from)
    }

    async fn attach(&mut self, stream: Option<&LocalStream>) -> Result<(), TransportError> {
        if self.tracks_attached {
            return Ok(());
        }
        if let Some(stream) = stream {
            self.transport.attach_stream(stream).await?;
            self.tracks_attached = true;
        }
        Ok(())
    }

    /// Attaches local tracks and creates an offer.
    pub async fn start_offer(
        &mut self,
        stream: Option<&LocalStream>,
        now: Instant,
    ) -> Result<String, TransportError> {
        self.attach(stream).await?;
        let sdp = self.transport.create_offer().await?;
        self.negotiation = NegotiationState::OfferSent;
        self.transition(LinkState::Offering, now);
        Ok(sdp)
    }

    /// Applies a remote offer and creates the answer.
    ///
    /// A pending local offer is rolled back first.
    pub async fn accept_offer(
        &mut self,
        sdp: &str,
        stream: Option<&LocalStream>,
        now: Instant,
    ) -> Result<String, TransportError> {
        if self.negotiation == NegotiationState::OfferSent {
            self.transport.rollback().await?;
            self.negotiation = NegotiationState::Stable;
        }

        self.attach(stream).await?;
        self.transport
            .set_remote_description(SdpKind::Offer, sdp)
            .await?;
        self.remote_description_set = true;
        self.negotiation = NegotiationState::AnswerPending;
        self.flush_candidates().await;

        let answer = self.transport.create_answer().await?;
        self.negotiation = NegotiationState::Stable;
        if self.state != LinkState::Connected {
            self.transition(LinkState::Answering, now);
        }
        Ok(answer)
    }

    /// Applies the answer to our offer. Returns `false` when no offer was
    /// outstanding and the answer was ignored.
    pub async fn accept_answer(&mut self, sdp: &str) -> Result<bool, TransportError> {
        if self.negotiation != NegotiationState::OfferSent {
            return Ok(false);
        }
        self.transport
            .set_remote_description(SdpKind::Answer, sdp)
            .await?;
        self.remote_description_set = true;
        self.negotiation = NegotiationState::Stable;
        self.flush_candidates().await;
        Ok(true)
    }

    /// Feeds a remote candidate, buffering it until a remote description is
    /// applied.
    pub async fn add_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
            warn!(
                target: "vs.peer",
                participant_id = %self.participant_id,
                error = %e,
                "Remote candidate rejected"
            );
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(
                target: "vs.peer",
                participant_id = %self.participant_id,
                count = pending.len(),
                "Flushing buffered candidates"
            );
        }
        for candidate in pending {
            self.add_candidate(candidate).await;
        }
    }

    pub async fn replace_video_track(&mut self, track: &LocalTrack) -> Result<(), TransportError> {
        self.transport.replace_video_track(track).await
    }

    pub async fn set_encoder_ceiling(&mut self, bps: u64) -> Result<(), TransportError> {
        self.transport.set_encoder_ceiling(bps).await
    }

    pub async fn stats(&mut self) -> Result<RawTransportStats, TransportError> {
        self.transport.stats().await
    }

    pub fn record_health(&mut self, sample: &HealthSample) {
        self.health = Some(sample.health);
        self.last_stats = Some(sample.stats);
    }

    pub fn set_remote_stream(&mut self, stream: RemoteStream) {
        self.remote_stream = Some(stream);
    }

    /// Releases the transport. Safe to call more than once.
    pub fn close(&mut self, now: Instant) -> Option<LinkState> {
        let previous = self.transition(LinkState::Closed, now);
        if previous.is_some() {
            self.transport.close();
            self.pending_candidates.clear();
        }
        previous
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            participant_id: self.participant_id.clone(),
            transport_id: self.transport_id.clone(),
            state: self.state,
            negotiation: self.negotiation,
            health: self.health,
            last_stats: self.last_stats,
            remote_stream: self.remote_stream.clone(),
        }
    }
}
