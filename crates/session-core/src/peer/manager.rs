//! Peer link manager: one link per remote participant.
//!
//! Every operation returns the [`LinkOutput`]s it produced instead of
//! publishing them itself. The session actor relays signals and turns the
//! rest into session events, so a failure on one link never becomes an error
//! of the whole operation.

use super::link::{LinkSnapshot, LinkState, NegotiationState, PeerLink};
use super::transport::{
    IceCandidate, PeerTransportFactory, RemoteStream, Signal, TransportError, TransportEvent,
    TransportNotice, TransportNotifier, TransportState,
};
use crate::config::IceServer;
use crate::media::{LocalStream, LocalTrack};
use crate::monitor::{HealthSample, RawTransportStats};
use crate::observability::metrics;
use common::types::ParticipantId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Early candidates kept per sender before its link exists.
pub const MAX_EARLY_CANDIDATES: usize = 32;
/// Distinct senders with buffered early candidates.
pub const MAX_EARLY_SENDERS: usize = 16;

/// Something the caller must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutput {
    /// Send `signal` to `target` over the signaling channel.
    Relay {
        target: ParticipantId,
        signal: Signal,
    },
    RemoteStreamAvailable {
        participant_id: ParticipantId,
        stream: RemoteStream,
    },
    StateChanged {
        participant_id: ParticipantId,
        from: LinkState,
        to: LinkState,
    },
    /// The link is closed for good. No automatic retry.
    LinkLost {
        participant_id: ParticipantId,
        reason: String,
    },
}

pub struct PeerLinkManager {
    local_id: ParticipantId,
    factory: Arc<dyn PeerTransportFactory>,
    ice_servers: Vec<IceServer>,
    notices: mpsc::Sender<TransportNotice>,
    links: HashMap<ParticipantId, PeerLink>,
    next_generation: u64,
    /// Candidates that arrived before their link existed.
    early_candidates: HashMap<ParticipantId, Vec<IceCandidate>>,
    negotiation_timeout: Duration,
    grace_period: Duration,
    encoder_ceiling: Option<u64>,
}

impl PeerLinkManager {
    pub fn new(
        local_id: ParticipantId,
        factory: Arc<dyn PeerTransportFactory>,
        ice_servers: Vec<IceServer>,
        notices: mpsc::Sender<TransportNotice>,
        negotiation_timeout: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            local_id,
            factory,
            ice_servers,
            notices,
            links: HashMap::new(),
            next_generation: 0,
            early_candidates: HashMap::new(),
            negotiation_timeout,
            grace_period,
            encoder_ceiling: None,
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    #[must_use]
    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.links.contains_key(participant_id)
    }

    #[must_use]
    pub fn link_state(&self, participant_id: &ParticipantId) -> Option<LinkState> {
        self.links.get(participant_id).map(PeerLink::state)
    }

    /// Transport generation of the current link to `participant_id`.
    #[must_use]
    pub fn generation(&self, participant_id: &ParticipantId) -> Option<u64> {
        self.links.get(participant_id).map(PeerLink::generation)
    }

    #[must_use]
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn connected_participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self
            .links
            .iter()
            .filter(|(_, link)| link.state() == LinkState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn has_connected(&self) -> bool {
        self.links
            .values()
            .any(|link| link.state() == LinkState::Connected)
    }

    /// Immutable views of every link, ordered by participant.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut snapshots: Vec<_> = self.links.values().map(PeerLink::snapshot).collect();
        snapshots.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        snapshots
    }

    async fn create_link(
        &mut self,
        participant_id: &ParticipantId,
        transport_id: Option<String>,
        now: Instant,
    ) -> Result<&mut PeerLink, TransportError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let notifier =
            TransportNotifier::new(participant_id.clone(), generation, self.notices.clone());
        let transport = self.factory.create(&self.ice_servers, notifier).await?;
        let link = PeerLink::new(
            participant_id.clone(),
            generation,
            transport_id,
            transport,
            now,
        );
        metrics::record_link_created();
        Ok(self.links.entry(participant_id.clone()).or_insert(link))
    }

    /// Handles a participant that is (or just became) present.
    ///
    /// The same identity with a new transport id replaces the old link. When
    /// `initiate` is set an offer is created and relayed; otherwise the link
    /// waits idle for the remote offer.
    #[instrument(skip_all, name = "vs.peer.participant", fields(participant_id = %participant_id))]
    pub async fn on_participant(
        &mut self,
        participant_id: &ParticipantId,
        transport_id: &str,
        initiate: bool,
        stream: Option<&LocalStream>,
    ) -> Vec<LinkOutput> {
        let now = Instant::now();
        let mut outputs = Vec::new();

        let known = self
            .links
            .get(participant_id)
            .map(|link| link.transport_id().map(str::to_string));
        match known {
            Some(Some(known)) if known == transport_id => return outputs,
            Some(None) => {
                // Link was opened by an early offer; adopt the roster transport id.
                if let Some(link) = self.links.get_mut(participant_id) {
                    link.set_transport_id(transport_id.to_string());
                }
                return outputs;
            }
            Some(Some(_)) => {
                info!(
                    target: "vs.peer",
                    participant_id = %participant_id,
                    "Participant rejoined with a new transport, replacing link"
                );
                if let Some(mut old) = self.links.remove(participant_id) {
                    if let Some(from) = old.close(now) {
                        outputs.push(LinkOutput::StateChanged {
                            participant_id: participant_id.clone(),
                            from,
                            to: LinkState::Closed,
                        });
                    }
                }
            }
            None => {}
        }

        let result = self
            .open_link(participant_id, transport_id, initiate, stream, now)
            .await;

        match result {
            Ok(Some(sdp)) => {
                debug!(target: "vs.peer", participant_id = %participant_id, "Offer created");
                outputs.push(LinkOutput::StateChanged {
                    participant_id: participant_id.clone(),
                    from: LinkState::Idle,
                    to: LinkState::Offering,
                });
                outputs.push(LinkOutput::Relay {
                    target: participant_id.clone(),
                    signal: Signal::Offer { sdp },
                });
            }
            Ok(None) => {
                debug!(target: "vs.peer", participant_id = %participant_id, "Waiting for remote offer");
            }
            Err(e) => outputs.extend(self.fail(participant_id, &e.to_string(), now)),
        }
        outputs
    }

    async fn open_link(
        &mut self,
        participant_id: &ParticipantId,
        transport_id: &str,
        initiate: bool,
        stream: Option<&LocalStream>,
        now: Instant,
    ) -> Result<Option<String>, TransportError> {
        let early = self.early_candidates.remove(participant_id).unwrap_or_default();
        let link = self
            .create_link(participant_id, Some(transport_id.to_string()), now)
            .await?;
        for candidate in early {
            link.add_candidate(candidate).await;
        }
        if initiate {
            return link.start_offer(stream, now).await.map(Some);
        }
        Ok(None)
    }

    /// Handles a negotiation payload from a remote participant.
    #[instrument(skip_all, name = "vs.peer.signal", fields(participant_id = %from, kind = signal.kind()))]
    pub async fn on_signal(
        &mut self,
        from: &ParticipantId,
        signal: Signal,
        stream: Option<&LocalStream>,
    ) -> Vec<LinkOutput> {
        let now = Instant::now();
        match signal {
            Signal::Offer { sdp } => self.on_offer(from, &sdp, stream, now).await,
            Signal::Answer { sdp } => {
                let Some(link) = self.links.get_mut(from) else {
                    warn!(target: "vs.peer", participant_id = %from, "Answer for unknown link ignored");
                    return Vec::new();
                };
                match link.accept_answer(&sdp).await {
                    Ok(true) => {
                        debug!(target: "vs.peer", participant_id = %from, "Answer applied");
                        Vec::new()
                    }
                    Ok(false) => {
                        warn!(
                            target: "vs.peer",
                            participant_id = %from,
                            "Answer without outstanding offer ignored"
                        );
                        Vec::new()
                    }
                    Err(e) => self.fail(from, &e.to_string(), now),
                }
            }
            Signal::Candidate(candidate) => {
                match self.links.get_mut(from) {
                    Some(link) => link.add_candidate(candidate).await,
                    None => self.buffer_early_candidate(from, candidate),
                }
                Vec::new()
            }
        }
    }

    fn buffer_early_candidate(&mut self, from: &ParticipantId, candidate: IceCandidate) {
        if !self.early_candidates.contains_key(from)
            && self.early_candidates.len() >= MAX_EARLY_SENDERS
        {
            debug!(target: "vs.peer", participant_id = %from, "Too many early senders, candidate dropped");
            return;
        }
        let buffered = self.early_candidates.entry(from.clone()).or_default();
        if buffered.len() >= MAX_EARLY_CANDIDATES {
            debug!(target: "vs.peer", participant_id = %from, "Early candidate buffer full, candidate dropped");
            return;
        }
        debug!(target: "vs.peer", participant_id = %from, "Buffering early candidate");
        buffered.push(candidate);
    }

    async fn on_offer(
        &mut self,
        from: &ParticipantId,
        sdp: &str,
        stream: Option<&LocalStream>,
        now: Instant,
    ) -> Vec<LinkOutput> {
        if let Some(link) = self.links.get(from) {
            if link.negotiation() == NegotiationState::OfferSent && self.local_id < *from {
                info!(
                    target: "vs.peer",
                    participant_id = %from,
                    "Offer collision, keeping local offer"
                );
                metrics::record_glare("kept_local");
                return Vec::new();
            }
        }

        if !self.links.contains_key(from) {
            if let Err(e) = self.create_link(from, None, now).await {
                return self.fail(from, &e.to_string(), now);
            }
            let early = self.early_candidates.remove(from).unwrap_or_default();
            if let Some(link) = self.links.get_mut(from) {
                for candidate in early {
                    link.add_candidate(candidate).await;
                }
            }
        }

        let Some(link) = self.links.get_mut(from) else {
            return Vec::new();
        };
        let rolled_back = link.negotiation() == NegotiationState::OfferSent;
        if rolled_back {
            info!(
                target: "vs.peer",
                participant_id = %from,
                "Offer collision, rolling back local offer"
            );
            metrics::record_glare("rolled_back");
        }

        let before = link.state();
        match link.accept_offer(sdp, stream, now).await {
            Ok(answer) => {
                let mut outputs = Vec::new();
                let after = link.state();
                if after != before {
                    outputs.push(LinkOutput::StateChanged {
                        participant_id: from.clone(),
                        from: before,
                        to: after,
                    });
                }
                outputs.push(LinkOutput::Relay {
                    target: from.clone(),
                    signal: Signal::Answer { sdp: answer },
                });
                outputs
            }
            Err(e) => self.fail(from, &e.to_string(), now),
        }
    }

    /// Handles a notice from a transport adapter.
    pub async fn on_transport_event(&mut self, notice: TransportNotice) -> Vec<LinkOutput> {
        let now = Instant::now();
        let participant_id = notice.participant_id;
        let ceiling = self.encoder_ceiling;
        let Some(link) = self.links.get_mut(&participant_id) else {
            debug!(
                target: "vs.peer",
                participant_id = %participant_id,
                "Notice for unknown link dropped"
            );
            return Vec::new();
        };
        if link.generation() != notice.generation {
            debug!(
                target: "vs.peer",
                participant_id = %participant_id,
                generation = notice.generation,
                current = link.generation(),
                "Notice from replaced transport dropped"
            );
            return Vec::new();
        }

        match notice.event {
            TransportEvent::LocalCandidate(candidate) => vec![LinkOutput::Relay {
                target: participant_id,
                signal: Signal::Candidate(candidate),
            }],
            TransportEvent::RemoteStream(stream) => {
                link.set_remote_stream(stream.clone());
                vec![LinkOutput::RemoteStreamAvailable {
                    participant_id,
                    stream,
                }]
            }
            TransportEvent::StateChanged(TransportState::Connected) => {
                let Some(from) = link.transition(LinkState::Connected, now) else {
                    return Vec::new();
                };
                if let Some(bps) = ceiling {
                    if let Err(e) = link.set_encoder_ceiling(bps).await {
                        warn!(target: "vs.peer", participant_id = %participant_id, error = %e, "Failed to apply encoder ceiling");
                    }
                }
                info!(target: "vs.peer", participant_id = %participant_id, from = %from, "Link connected");
                metrics::record_link_transition(LinkState::Connected.as_str());
                vec![LinkOutput::StateChanged {
                    participant_id,
                    from,
                    to: LinkState::Connected,
                }]
            }
            TransportEvent::StateChanged(TransportState::Disconnected | TransportState::Failed)
                if link.state() == LinkState::Connected =>
            {
                let Some(from) = link.transition(LinkState::Reconnecting, now) else {
                    return Vec::new();
                };
                warn!(target: "vs.peer", participant_id = %participant_id, "Link interrupted, waiting for recovery");
                metrics::record_link_transition(LinkState::Reconnecting.as_str());
                vec![LinkOutput::StateChanged {
                    participant_id,
                    from,
                    to: LinkState::Reconnecting,
                }]
            }
            TransportEvent::StateChanged(TransportState::Failed) if link.state().is_negotiating() => {
                self.fail(&participant_id, "ICE failed during negotiation", now)
            }
            TransportEvent::StateChanged(TransportState::Closed) => {
                self.fail(&participant_id, "transport closed", now)
            }
            TransportEvent::StateChanged(_) => Vec::new(),
        }
    }

    /// Closes links stuck in negotiation or in `Reconnecting` past their
    /// grace period.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<LinkOutput> {
        let expired: Vec<(ParticipantId, &'static str)> = self
            .links
            .iter()
            .filter_map(|(id, link)| {
                let elapsed = now.saturating_duration_since(link.state_since());
                if link.state().is_negotiating() && elapsed >= self.negotiation_timeout {
                    Some((id.clone(), "negotiation timed out"))
                } else if link.state() == LinkState::Reconnecting && elapsed >= self.grace_period {
                    Some((id.clone(), "not recovered within grace period"))
                } else {
                    None
                }
            })
            .collect();

        let mut outputs = Vec::new();
        for (participant_id, reason) in expired {
            outputs.extend(self.fail(&participant_id, reason, now));
        }
        outputs
    }

    /// Closes and removes a link, reporting it lost.
    fn fail(&mut self, participant_id: &ParticipantId, reason: &str, now: Instant) -> Vec<LinkOutput> {
        let mut outputs = Vec::new();
        let Some(mut link) = self.links.remove(participant_id) else {
            return outputs;
        };
        warn!(
            target: "vs.peer",
            participant_id = %participant_id,
            state = %link.state(),
            reason,
            "Link lost"
        );
        if let Some(from) = link.close(now) {
            outputs.push(LinkOutput::StateChanged {
                participant_id: participant_id.clone(),
                from,
                to: LinkState::Closed,
            });
        }
        self.early_candidates.remove(participant_id);
        metrics::record_link_lost();
        outputs.push(LinkOutput::LinkLost {
            participant_id: participant_id.clone(),
            reason: reason.to_string(),
        });
        outputs
    }

    /// Releases a link's transport. Returns whether a link existed.
    ///
    /// Idempotent: a second call finds nothing and does nothing.
    pub fn destroy(&mut self, participant_id: &ParticipantId) -> bool {
        self.early_candidates.remove(participant_id);
        let Some(mut link) = self.links.remove(participant_id) else {
            return false;
        };
        link.close(Instant::now());
        info!(target: "vs.peer", participant_id = %participant_id, "Link destroyed");
        true
    }

    /// Closes every link immediately, including links in `Reconnecting`.
    /// Returns the participants whose links were closed.
    pub fn close_all(&mut self) -> Vec<ParticipantId> {
        let now = Instant::now();
        self.early_candidates.clear();
        let mut closed: Vec<_> = self
            .links
            .drain()
            .map(|(id, mut link)| {
                link.close(now);
                id
            })
            .collect();
        closed.sort();
        if !closed.is_empty() {
            info!(target: "vs.peer", count = closed.len(), "All links closed");
        }
        closed
    }

    /// Pushes an encoder ceiling to every connected link and remembers it for
    /// links that connect later. Returns how many links accepted it.
    pub async fn set_encoder_ceiling(&mut self, max_bitrate_bps: u64) -> usize {
        self.encoder_ceiling = Some(max_bitrate_bps);
        let mut applied = 0;
        for (participant_id, link) in &mut self.links {
            if link.state() != LinkState::Connected {
                continue;
            }
            match link.set_encoder_ceiling(max_bitrate_bps).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(
                    target: "vs.peer",
                    participant_id = %participant_id,
                    error = %e,
                    "Failed to apply encoder ceiling"
                ),
            }
        }
        applied
    }

    /// Swaps the outgoing video track on every live link.
    pub async fn replace_video_track(&mut self, track: &LocalTrack) -> usize {
        let mut replaced = 0;
        for (participant_id, link) in &mut self.links {
            match link.replace_video_track(track).await {
                Ok(()) => replaced += 1,
                Err(e) => warn!(
                    target: "vs.peer",
                    participant_id = %participant_id,
                    error = %e,
                    "Failed to replace video track"
                ),
            }
        }
        replaced
    }

    /// Reads raw counters of one link. `None` if the link is gone.
    pub async fn read_stats(
        &mut self,
        participant_id: &ParticipantId,
    ) -> Option<Result<RawTransportStats, TransportError>> {
        match self.links.get_mut(participant_id) {
            Some(link) => Some(link.stats().await),
            None => None,
        }
    }

    pub fn record_health(&mut self, participant_id: &ParticipantId, sample: &HealthSample) {
        if let Some(link) = self.links.get_mut(participant_id) {
            link.record_health(sample);
        }
    }
}

impl Drop for PeerLinkManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
