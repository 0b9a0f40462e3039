//! `SessionActor` - owns every component of one consultation session.
//!
//! All inputs (UI commands, signaling events, transport notices, monitor
//! ticks, timeout ticks, recording progress, reconnect timer) are branches of
//! a single `select!` loop, so each handler runs to completion before the
//! next input is looked at.
//!
//! # Teardown
//!
//! On leave, cancellation or signaling loss: stop the recording, close every
//! link, release local media, leave signaling. In that order.

use super::messages::{SessionEvent, SessionMessage, SessionSnapshot};
use crate::config::SessionConfig;
use crate::errors::SessionError;
use crate::media::{CaptureDevices, MediaSource, TrackKind};
use crate::monitor::ConnectionMonitor;
use crate::observability::metrics;
use crate::peer::{LinkOutput, PeerLinkManager, PeerTransportFactory, TransportNotice};
use crate::quality::{QualityChange, QualityController, QualityTier};
use crate::recording::{
    RecorderFactory, RecordingArtifact, RecordingEvent, RecordingPipeline, RecordingSettings,
    RecordingState, SegmentUploader,
};
use crate::retry::Backoff;
use crate::signaling::{
    Participant, SessionPhase, SignalingChannel, SignalingConnector, SignalingError,
    SignalingEvent,
};
use common::secret::SecretString;
use common::types::{ParticipantId, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 64;

/// Channel buffer size for transport notices.
const TRANSPORT_CHANNEL_BUFFER: usize = 256;

/// How often negotiation and grace-period deadlines are checked.
const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// External capabilities a session runs on.
#[derive(Clone)]
pub struct SessionDeps {
    pub signaling: Arc<dyn SignalingConnector>,
    pub transports: Arc<dyn PeerTransportFactory>,
    pub devices: Arc<dyn CaptureDevices>,
    pub recorder: Arc<dyn RecorderFactory>,
    pub uploader: Arc<dyn SegmentUploader>,
}

/// Handle to a `SessionActor`.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    local_id: ParticipantId,
}

impl SessionHandle {
    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SessionError::Internal(format!("response receive failed: {e}")))
    }

    /// Joins `session_id` and returns the participants already present.
    ///
    /// # Errors
    ///
    /// - `SignalingUnavailable` if the rendezvous service cannot be reached in
    ///   time
    /// - `MediaUnavailable`/`ConstraintsNotSatisfiable` if local media cannot
    ///   be acquired even at the lowest profile
    pub async fn join(
        &self,
        session_id: SessionId,
        token: SecretString,
    ) -> Result<Vec<Participant>, SessionError> {
        self.request(|respond_to| SessionMessage::Join {
            session_id,
            token,
            respond_to,
        })
        .await?
    }

    /// Leaves the session. Safe to call more than once.
    pub async fn leave(&self) -> Result<Option<RecordingArtifact>, SessionError> {
        self.request(|respond_to| SessionMessage::Leave { respond_to })
            .await
    }

    pub async fn set_media_enabled(
        &self,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<(), SessionError> {
        self.request(|respond_to| SessionMessage::SetMediaEnabled {
            kind,
            enabled,
            respond_to,
        })
        .await?
    }

    pub async fn start_screen_share(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionMessage::StartScreenShare { respond_to })
            .await?
    }

    pub async fn stop_screen_share(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionMessage::StopScreenShare { respond_to })
            .await?
    }

    pub async fn start_recording(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionMessage::StartRecording { respond_to })
            .await?
    }

    /// Stops the recording and waits for outstanding uploads. `None` when
    /// nothing was recording.
    pub async fn stop_recording(&self) -> Result<Option<RecordingArtifact>, SessionError> {
        self.request(|respond_to| SessionMessage::StopRecording { respond_to })
            .await
    }

    pub async fn set_adaptive_quality(&self, adaptive: bool) -> Result<(), SessionError> {
        self.sender
            .send(SessionMessage::SetAdaptiveQuality { adaptive })
            .await
            .map_err(|e| SessionError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn force_quality(
        &self,
        tier: QualityTier,
    ) -> Result<Option<QualityChange>, SessionError> {
        self.request(|respond_to| SessionMessage::ForceQuality { tier, respond_to })
            .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|respond_to| SessionMessage::GetSnapshot { respond_to })
            .await
    }

    /// Releases one participant's link. Returns whether a link existed.
    pub async fn destroy_link(&self, participant_id: ParticipantId) -> Result<bool, SessionError> {
        self.request(|respond_to| SessionMessage::DestroyLink {
            participant_id,
            respond_to,
        })
        .await
    }

    /// Opens a fresh link to a present participant whose link was lost,
    /// offering from this side.
    pub async fn reconnect_link(&self, participant_id: ParticipantId) -> Result<(), SessionError> {
        self.request(|respond_to| SessionMessage::ReconnectLink {
            participant_id,
            respond_to,
        })
        .await?
    }

    /// Cancel the session actor. It tears down before exiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct Reconnect {
    backoff: Backoff,
    at: Instant,
}

pub struct SessionActor {
    local_id: ParticipantId,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
    signaling: SignalingChannel,
    media: MediaSource,
    links: PeerLinkManager,
    transport_rx: mpsc::Receiver<TransportNotice>,
    monitor: ConnectionMonitor,
    quality: QualityController,
    recording: RecordingPipeline,
    recording_rx: mpsc::UnboundedReceiver<RecordingEvent>,
    /// Roster as last reported by the rendezvous service.
    participants: HashMap<ParticipantId, Participant>,
    reconnect: Option<Reconnect>,
    signaling_max_reconnects: u32,
    ended: bool,
}

impl SessionActor {
    /// Spawns a session actor.
    ///
    /// Returns the handle, the event stream and the task handle.
    pub fn spawn(
        config: SessionConfig,
        local_id: ParticipantId,
        deps: SessionDeps,
        cancel_token: CancellationToken,
    ) -> (
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
        JoinHandle<()>,
    ) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_CHANNEL_BUFFER);

        let (recording, recording_rx) = RecordingPipeline::new(
            deps.recorder,
            deps.uploader,
            RecordingSettings {
                segment_duration: config.segment_duration,
                upload_max_attempts: config.upload_max_attempts,
                upload_initial_backoff: config.upload_initial_backoff,
            },
        );

        let actor = Self {
            local_id: local_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            events,
            signaling: SignalingChannel::new(deps.signaling, config.join_timeout),
            media: MediaSource::new(deps.devices),
            links: PeerLinkManager::new(
                local_id.clone(),
                deps.transports,
                config.ice_servers.clone(),
                transport_tx,
                config.negotiation_timeout,
                config.link_grace_period,
            ),
            transport_rx,
            monitor: ConnectionMonitor::new(config.monitor_interval),
            quality: QualityController::new(
                config.initial_quality,
                config.adaptive_quality,
                config.thresholds,
            ),
            recording,
            recording_rx,
            participants: HashMap::new(),
            reconnect: None,
            signaling_max_reconnects: config.signaling_max_reconnects,
            ended: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            local_id,
        };

        (handle, events_rx, task_handle)
    }

    #[instrument(skip_all, name = "vs.session.actor", fields(local_id = %self.local_id))]
    async fn run(mut self) {
        info!(target: "vs.session", "SessionActor started");

        let interval = self.monitor.interval();
        let mut monitor_tick = tokio::time::interval_at(Instant::now() + interval, interval);
        monitor_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timeout_tick =
            tokio::time::interval_at(Instant::now() + TIMEOUT_CHECK_INTERVAL, TIMEOUT_CHECK_INTERVAL);
        timeout_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let sampling = self.links.has_connected();
            let reconnect_at = self.reconnect.as_ref().map(|r| r.at);

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "vs.session", "SessionActor received cancellation signal");
                    self.teardown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    if let Some(message) = msg {
                        self.handle_message(message).await;
                    } else {
                        info!(target: "vs.session", "All handles dropped, exiting");
                        self.teardown().await;
                        break;
                    }
                }

                event = self.signaling.next_event() => {
                    self.handle_signaling_event(event).await;
                }

                Some(notice) = self.transport_rx.recv() => {
                    let outputs = self.links.on_transport_event(notice).await;
                    self.dispatch(outputs).await;
                }

                _ = monitor_tick.tick(), if sampling => {
                    self.sample_links().await;
                }

                _ = timeout_tick.tick() => {
                    let outputs = self.links.check_timeouts(Instant::now());
                    self.dispatch(outputs).await;
                }

                Some(event) = self.recording_rx.recv() => {
                    self.handle_recording_event(event).await;
                }

                () = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.try_reconnect().await;
                }
            }
        }

        info!(target: "vs.session", "SessionActor stopped");
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!(target: "vs.session", "Event receiver dropped");
        }
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join {
                session_id,
                token,
                respond_to,
            } => {
                let result = self.handle_join(session_id, token).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::Leave { respond_to } => {
                let artifact = self.teardown().await;
                let _ = respond_to.send(artifact);
            }
            SessionMessage::SetMediaEnabled {
                kind,
                enabled,
                respond_to,
            } => {
                let result = self.handle_set_media_enabled(kind, enabled).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::StartScreenShare { respond_to } => {
                let result = match self.media.start_screen_share().await {
                    Ok(screen) => {
                        let replaced = self.links.replace_video_track(&screen).await;
                        debug!(target: "vs.session", links = replaced, "Screen track sent");
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }
            SessionMessage::StopScreenShare { respond_to } => {
                let result = match self.media.restore_camera() {
                    Ok(camera) => {
                        let replaced = self.links.replace_video_track(&camera).await;
                        debug!(target: "vs.session", links = replaced, "Camera track sent");
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }
            SessionMessage::StartRecording { respond_to } => {
                let result = self.handle_start_recording().await;
                let _ = respond_to.send(result);
            }
            SessionMessage::StopRecording { respond_to } => {
                let artifact = self.finish_recording().await;
                let _ = respond_to.send(artifact);
            }
            SessionMessage::SetAdaptiveQuality { adaptive } => {
                self.quality.set_adaptive(adaptive);
            }
            SessionMessage::ForceQuality { tier, respond_to } => {
                let change = self.quality.force(tier);
                if let Some(change) = change {
                    self.apply_quality(change).await;
                }
                let _ = respond_to.send(change);
            }
            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            SessionMessage::DestroyLink {
                participant_id,
                respond_to,
            } => {
                let existed = self.links.destroy(&participant_id);
                self.monitor.forget(&participant_id);
                metrics::set_links_connected(self.links.connected_participants().len());
                let _ = respond_to.send(existed);
            }
            SessionMessage::ReconnectLink {
                participant_id,
                respond_to,
            } => {
                let result = self.handle_reconnect_link(&participant_id).await;
                let _ = respond_to.send(result);
            }
        }
    }

    #[instrument(skip_all, name = "vs.session.join", fields(session_id = %session_id))]
    async fn handle_join(
        &mut self,
        session_id: SessionId,
        token: SecretString,
    ) -> Result<Vec<Participant>, SessionError> {
        if self.ended {
            return Err(SessionError::InvalidState("session has ended".to_string()));
        }
        let roster = self.signaling.join(session_id.clone(), token).await?;

        let acquisition = match self.media.acquire(self.quality.active()).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                warn!(target: "vs.session", error = %e, "Local media unavailable, abandoning join");
                self.signaling.leave();
                self.ended = true;
                self.emit(SessionEvent::Ended);
                return Err(e);
            }
        };
        for degraded in acquisition.degraded {
            self.emit(SessionEvent::AcquisitionDegraded(degraded));
        }
        // Capture may have settled on a lower tier than requested.
        if let Some(change) = self.quality.force(self.media.profile()) {
            metrics::record_quality_change(change.from.as_str(), change.to.as_str());
            info!(
                target: "vs.quality",
                from = %change.from,
                to = %change.to,
                "Quality profile follows acquired capture"
            );
            self.emit(SessionEvent::QualityChanged(change));
        }

        let stream = acquisition.stream;
        if let Err(e) = self
            .signaling
            .announce_media(stream.is_sending(TrackKind::Video), stream.is_sending(TrackKind::Audio))
            .await
        {
            warn!(target: "vs.session", error = %e, "Failed to announce media settings");
        }

        // Every link gets the active profile's ceiling once it connects
        self.links
            .set_encoder_ceiling(self.quality.active().profile().max_bitrate_bps)
            .await;

        for participant in &roster {
            self.participants
                .insert(participant.participant_id.clone(), participant.clone());
            let outputs = self
                .links
                .on_participant(
                    &participant.participant_id,
                    &participant.transport_id,
                    false,
                    self.media.stream(),
                )
                .await;
            self.dispatch(outputs).await;
        }

        info!(
            target: "vs.session",
            participants = roster.len(),
            quality = %self.quality.active(),
            "Session joined"
        );
        self.emit(SessionEvent::Joined {
            session_id,
            participants: roster.clone(),
        });
        Ok(roster)
    }

    async fn handle_set_media_enabled(
        &mut self,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<(), SessionError> {
        self.media.set_enabled(kind, enabled).await?;

        let (has_video, has_audio) = self.media.stream().map_or((false, false), |s| {
            (s.is_sending(TrackKind::Video), s.is_sending(TrackKind::Audio))
        });
        if let Err(e) = self.signaling.announce_media(has_video, has_audio).await {
            warn!(target: "vs.session", error = %e, "Failed to announce media settings");
            self.schedule_reconnect_if_closed(&e).await;
        }
        Ok(())
    }

    async fn handle_reconnect_link(&mut self, participant_id: &ParticipantId) -> Result<(), SessionError> {
        if self.ended || self.signaling.session_id().is_none() {
            return Err(SessionError::InvalidState("not joined".to_string()));
        }
        let transport_id = self
            .participants
            .get(participant_id)
            .map(|p| p.transport_id.clone())
            .ok_or_else(|| SessionError::ParticipantNotFound(participant_id.to_string()))?;
        if self.links.contains(participant_id) {
            return Err(SessionError::InvalidState(format!(
                "link to {participant_id} is still open"
            )));
        }

        info!(target: "vs.session", participant_id = %participant_id, "Reconnecting link");
        let outputs = self
            .links
            .on_participant(participant_id, &transport_id, true, self.media.stream())
            .await;
        self.dispatch(outputs).await;
        Ok(())
    }

        async fn handle_start_recording(&mut self) -> Result<(), SessionError> {
        let session_id = self
            .signaling
            .session_id()
            .cloned()
            .ok_or_else(|| SessionError::InvalidState("not joined".to_string()))?;
        self.recording.start(session_id, self.media.stream())?;
        self.emit(SessionEvent::RecordingStateChanged(RecordingState::Recording));

        if let Err(e) = self.signaling.announce_recording(true).await {
            warn!(target: "vs.session", error = %e, "Failed to announce recording start");
        }
        Ok(())
    }

    /// Stops the recording if one is running and reports the artifact.
    async fn finish_recording(&mut self) -> Option<RecordingArtifact> {
        let artifact = self.recording.stop().await?;
        self.emit(SessionEvent::RecordingStateChanged(RecordingState::Idle));
        self.emit(SessionEvent::RecordingFinished(artifact.clone()));

        if let Err(e) = self.signaling.announce_recording(false).await {
            debug!(target: "vs.session", error = %e, "Failed to announce recording stop");
        }
        Some(artifact)
    }

    async fn handle_recording_event(&mut self, event: RecordingEvent) {
        match event {
            RecordingEvent::SegmentAcknowledged { sequence } => {
                self.emit(SessionEvent::SegmentUploaded { sequence });
            }
            RecordingEvent::Warning(warning) => {
                self.emit(SessionEvent::RecordingWarning(warning));
            }
            RecordingEvent::CaptureEnded => {
                warn!(target: "vs.session", "Recorder ended, finalizing recording");
                self.finish_recording().await;
            }
        }
    }

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::ParticipantJoined(participant) => {
                self.on_participant_joined(participant).await;
            }
            SignalingEvent::ParticipantLeft(participant_id) => {
                self.on_participant_left(&participant_id);
            }
            SignalingEvent::SignalReceived { from, signal } => {
                let outputs = self
                    .links
                    .on_signal(&from, signal, self.media.stream())
                    .await;
                self.dispatch(outputs).await;
            }
            SignalingEvent::MediaSettingsChanged {
                participant_id,
                has_video,
                has_audio,
            } => {
                if let Some(participant) = self.participants.get_mut(&participant_id) {
                    participant.has_video = has_video;
                    participant.has_audio = has_audio;
                }
                self.emit(SessionEvent::ParticipantMediaChanged {
                    participant_id,
                    has_video,
                    has_audio,
                });
            }
            SignalingEvent::RemoteRecording { started, by } => {
                self.emit(SessionEvent::RemoteRecording { started, by });
            }
            SignalingEvent::ServerError(message) => {
                warn!(target: "vs.session", message = %message, "Rendezvous service reported an error");
                self.emit(SessionEvent::ServerError(message));
            }
            SignalingEvent::Disconnected => self.schedule_reconnect().await,
        }
    }

    /// An existing member offers to a newcomer.
    async fn on_participant_joined(&mut self, participant: Participant) {
        info!(
            target: "vs.session",
            participant_id = %participant.participant_id,
            "Participant joined"
        );
        self.participants
            .insert(participant.participant_id.clone(), participant.clone());
        let outputs = self
            .links
            .on_participant(
                &participant.participant_id,
                &participant.transport_id,
                true,
                self.media.stream(),
            )
            .await;
        self.emit(SessionEvent::ParticipantJoined(participant));
        self.dispatch(outputs).await;
    }

    fn on_participant_left(&mut self, participant_id: &ParticipantId) {
        info!(target: "vs.session", participant_id = %participant_id, "Participant left");
        self.participants.remove(participant_id);
        self.links.destroy(participant_id);
        self.monitor.forget(participant_id);
        metrics::set_links_connected(self.links.connected_participants().len());
        self.emit(SessionEvent::ParticipantLeft(participant_id.clone()));
    }

    /// Acts on link manager output: relays signals and publishes the rest.
    async fn dispatch(&mut self, outputs: Vec<LinkOutput>) {
        for output in outputs {
            match output {
                LinkOutput::Relay { target, signal } => {
                    let kind = signal.kind();
                    match self.signaling.relay(target.clone(), signal).await {
                        Ok(()) => metrics::record_signal_relayed(kind),
                        Err(e) => {
                            warn!(
                                target: "vs.session",
                                participant_id = %target,
                                kind,
                                error = %e,
                                "Failed to relay signal"
                            );
                            self.schedule_reconnect_if_closed(&e).await;
                        }
                    }
                }
                LinkOutput::RemoteStreamAvailable {
                    participant_id,
                    stream,
                } => {
                    self.emit(SessionEvent::RemoteStreamAvailable {
                        participant_id,
                        stream,
                    });
                }
                LinkOutput::StateChanged {
                    participant_id,
                    from,
                    to,
                } => {
                    metrics::set_links_connected(self.links.connected_participants().len());
                    self.emit(SessionEvent::LinkStateChanged {
                        participant_id,
                        from,
                        to,
                    });
                }
                LinkOutput::LinkLost {
                    participant_id,
                    reason,
                } => {
                    self.monitor.forget(&participant_id);
                    self.emit(SessionEvent::ParticipantLinkLost {
                        participant_id,
                        reason,
                    });
                }
            }
        }
    }

    /// One monitor tick: every sample is published, then the tick is
    /// evaluated as a whole with the worst link deciding.
    async fn sample_links(&mut self) {
        let samples = self.monitor.sample(&mut self.links).await;
        let change = self.quality.on_samples(samples.iter().map(|s| &s.stats));
        for sample in samples {
            self.emit(SessionEvent::StatsUpdated(sample));
        }
        if let Some(change) = change {
            self.apply_quality(change).await;
        }
    }

    /// Pushes a new profile to local capture and to every connected link.
    async fn apply_quality(&mut self, change: QualityChange) {
        let profile = change.to.profile();
        let settings = self.media.apply_profile(change.to).await;
        let links = self.links.set_encoder_ceiling(profile.max_bitrate_bps).await;

        info!(
            target: "vs.quality",
            from = %change.from,
            to = %change.to,
            max_bitrate_bps = profile.max_bitrate_bps,
            capture_applied = settings.is_some(),
            links,
            "Quality profile changed"
        );
        metrics::record_quality_change(change.from.as_str(), change.to.as_str());
        self.emit(SessionEvent::QualityChanged(change));
    }

    async fn schedule_reconnect_if_closed(&mut self, error: &SignalingError) {
        if matches!(error, SignalingError::Closed) {
            self.schedule_reconnect().await;
        }
    }

    async fn schedule_reconnect(&mut self) {
        if self.ended || self.reconnect.is_some() || self.signaling.phase() != SessionPhase::Active {
            return;
        }
        let mut backoff = Backoff::signaling(self.signaling_max_reconnects);
        let Some(delay) = backoff.next_delay() else {
            self.signaling_lost(0).await;
            return;
        };
        warn!(
            target: "vs.session",
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Signaling lost, reconnecting"
        );
        self.reconnect = Some(Reconnect {
            backoff,
            at: Instant::now() + delay,
        });
        self.emit(SessionEvent::SignalingReconnecting { attempt: 1, delay });
    }

    #[instrument(skip_all, name = "vs.session.reconnect")]
    async fn try_reconnect(&mut self) {
        let Some(mut state) = self.reconnect.take() else {
            return;
        };
        let attempt = state.backoff.retries();

        match self.signaling.reconnect().await {
            Ok(roster) => {
                metrics::record_signaling_reconnect("success");
                info!(target: "vs.session", attempt, "Signaling restored");
                self.emit(SessionEvent::SignalingRestored);
                self.reconcile(roster).await;
            }
            Err(e) => {
                metrics::record_signaling_reconnect("error");
                warn!(target: "vs.session", attempt, error = %e, "Signaling reconnect failed");
                if let Some(delay) = state.backoff.next_delay() {
                    state.at = Instant::now() + delay;
                    self.emit(SessionEvent::SignalingReconnecting {
                        attempt: state.backoff.retries(),
                        delay,
                    });
                    self.reconnect = Some(state);
                } else {
                    self.signaling_lost(state.backoff.retries()).await;
                }
            }
        }
    }

    async fn signaling_lost(&mut self, attempts: u32) {
        metrics::record_signaling_reconnect("exhausted");
        warn!(target: "vs.session", attempts, "Signaling reconnect attempts exhausted");
        self.emit(SessionEvent::SignalingLost { attempts });
        self.teardown().await;
    }

    /// Brings the local roster in line with a fresh one after a reconnect.
    ///
    /// Missing participants are treated as left. New ones, and known ones
    /// with a new transport id, are handled like roster entries at join.
    async fn reconcile(&mut self, roster: Vec<Participant>) {
        let present: HashSet<ParticipantId> =
            roster.iter().map(|p| p.participant_id.clone()).collect();
        let mut gone: Vec<ParticipantId> = self
            .participants
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        gone.sort();
        for participant_id in gone {
            self.on_participant_left(&participant_id);
        }

        for participant in roster {
            let is_new = !self.participants.contains_key(&participant.participant_id);
            let outputs = self
                .links
                .on_participant(
                    &participant.participant_id,
                    &participant.transport_id,
                    false,
                    self.media.stream(),
                )
                .await;
            self.participants
                .insert(participant.participant_id.clone(), participant.clone());
            if is_new {
                self.emit(SessionEvent::ParticipantJoined(participant));
            }
            self.dispatch(outputs).await;
        }
    }

    /// Stops everything in teardown order. Idempotent.
    async fn teardown(&mut self) -> Option<RecordingArtifact> {
        if self.ended {
            return None;
        }
        self.ended = true;
        self.reconnect = None;

        let artifact = self.finish_recording().await;

        let closed = self.links.close_all();
        for participant_id in &closed {
            self.monitor.forget(participant_id);
        }
        metrics::set_links_connected(0);

        self.media.release();
        self.signaling.leave();
        self.participants.clear();

        info!(target: "vs.session", links_closed = closed.len(), "Session torn down");
        self.emit(SessionEvent::Ended);
        artifact
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut participants: Vec<Participant> = self.participants.values().cloned().collect();
        participants.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

        SessionSnapshot {
            local_id: self.local_id.clone(),
            session_id: self.signaling.session_id().cloned(),
            phase: self.signaling.phase(),
            participants,
            links: self.links.snapshot(),
            local_stream: self.media.stream().cloned(),
            screen_sharing: self.media.is_screen_sharing(),
            quality: self.quality.active(),
            adaptive_quality: self.quality.is_adaptive(),
            recording: self.recording.state(),
            signaling_connected: self.signaling.is_connected(),
        }
    }
}
