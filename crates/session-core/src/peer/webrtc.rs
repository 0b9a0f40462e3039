//! [`PeerTransport`] over the `webrtc` crate.
//!
//! Each link gets its own `RTCPeerConnection`. Local tracks are
//! `TrackLocalStaticSample`s kept in a [`LocalTrackRegistry`] shared by every
//! connection, so the capture pipeline writes a frame once and all links
//! send it. Connection state, local candidates and remote tracks are reported
//! through the link's [`TransportNotifier`].
//!
//! The engine cannot cap the bitrate of a sample track itself. The ceiling is
//! published on a `watch` channel that the encoder feeding the registry's
//! tracks subscribes to.

use super::transport::{
    IceCandidate, PeerTransport, PeerTransportFactory, RemoteStream, SdpKind, TransportError,
    TransportEvent, TransportNotifier, TransportState,
};
use crate::config::IceServer;
use crate::media::{LocalStream, LocalTrack, TrackKind};
use crate::monitor::RawTransportStats;
use async_trait::async_trait;
use common::secret::ExposeSecret;
use common::types::{StreamId, TrackId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Sample tracks for the local capture, keyed by track id.
///
/// Clones share state. The capture side looks tracks up with [`get`] and
/// writes encoded samples into them.
///
/// [`get`]: LocalTrackRegistry::get
#[derive(Clone)]
pub struct LocalTrackRegistry {
    tracks: Arc<Mutex<HashMap<TrackId, Arc<TrackLocalStaticSample>>>>,
    ceiling: Arc<watch::Sender<u64>>,
}

impl Default for LocalTrackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTrackRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (ceiling, _) = watch::channel(0);
        Self {
            tracks: Arc::new(Mutex::new(HashMap::new())),
            ceiling: Arc::new(ceiling),
        }
    }

    pub async fn get(&self, id: TrackId) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().await.get(&id).cloned()
    }

    /// Latest encoder ceiling in bits per second. 0 until one is set.
    #[must_use]
    pub fn encoder_ceiling(&self) -> watch::Receiver<u64> {
        self.ceiling.subscribe()
    }

    fn set_encoder_ceiling(&self, max_bitrate_bps: u64) {
        self.ceiling.send_replace(max_bitrate_bps);
    }

    async fn sample_track(&self, track: &LocalTrack, stream: StreamId) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock().await;
        let sample = tracks.entry(track.id).or_insert_with(|| {
            let mime_type = match track.kind {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video => MIME_TYPE_VP8,
            };
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.to_string(),
                stream.to_string(),
            ))
        });
        Arc::clone(sample)
    }
}

/// Creates one `RTCPeerConnection` per link.
pub struct WebRtcTransportFactory {
    api: Arc<API>,
    tracks: LocalTrackRegistry,
}

impl WebRtcTransportFactory {
    /// Builds the engine with the default codecs and interceptors.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Create` if codec or interceptor registration
    /// fails.
    pub fn new(tracks: LocalTrackRegistry) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Create(format!("codec registration: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Create(format!("interceptor registration: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api: Arc::new(api),
            tracks,
        })
    }

    #[must_use]
    pub fn tracks(&self) -> &LocalTrackRegistry {
        &self.tracks
    }
}

fn rtc_configuration(ice_servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s
                    .credential
                    .as_ref()
                    .map(|c| c.expose_secret().to_string())
                    .unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        notifier: TransportNotifier,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let config = rtc_configuration(ice_servers);
        let (pc, live) = connect(&self.api, config.clone(), &notifier).await?;
        debug!(
            target: "vs.peer.webrtc",
            participant_id = %notifier.participant_id(),
            generation = notifier.generation(),
            "Peer connection created"
        );
        Ok(Box::new(WebRtcTransport {
            api: Arc::clone(&self.api),
            config,
            notifier,
            tracks: self.tracks.clone(),
            pc,
            live,
            stream: None,
            video_sender: None,
        }))
    }
}

/// Maps the engine's connection state. `None` for states the link ignores.
fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Creates a peer connection and wires its callbacks to `notifier`.
///
/// Callbacks go quiet once the returned flag is cleared, so a connection that
/// is being replaced cannot report on behalf of its successor.
async fn connect(
    api: &API,
    config: RTCConfiguration,
    notifier: &TransportNotifier,
) -> Result<(Arc<RTCPeerConnection>, Arc<AtomicBool>), TransportError> {
    let pc = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(|e| TransportError::Create(e.to_string()))?,
    );
    let live = Arc::new(AtomicBool::new(true));

    let (n, l) = (notifier.clone(), Arc::clone(&live));
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let (notifier, live) = (n.clone(), Arc::clone(&l));
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!(target: "vs.peer.webrtc", participant_id = %notifier.participant_id(), "Candidate gathering complete");
                return;
            };
            if !live.load(Ordering::Acquire) {
                return;
            }
            match candidate.to_json() {
                Ok(init) => {
                    notifier
                        .notify(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }))
                        .await;
                }
                Err(e) => warn!(target: "vs.peer.webrtc", error = %e, "Unserializable local candidate"),
            }
        })
    }));

    let (n, l) = (notifier.clone(), Arc::clone(&live));
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let (notifier, live) = (n.clone(), Arc::clone(&l));
        Box::pin(async move {
            debug!(target: "vs.peer.webrtc", participant_id = %notifier.participant_id(), state = %state, "Connection state");
            if !live.load(Ordering::Acquire) {
                return;
            }
            if let Some(state) = transport_state(state) {
                notifier.notify(TransportEvent::StateChanged(state)).await;
            }
        })
    }));

    // Audio and video arrive as separate tracks of one stream.
    let remote: Arc<Mutex<Option<RemoteStream>>> = Arc::default();
    let (n, l) = (notifier.clone(), Arc::clone(&live));
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let (notifier, live, remote) = (n.clone(), Arc::clone(&l), Arc::clone(&remote));
            Box::pin(async move {
                if !live.load(Ordering::Acquire) {
                    return;
                }
                let stream = {
                    let mut remote = remote.lock().await;
                    let stream = remote.get_or_insert_with(|| RemoteStream {
                        stream_id: track.stream_id(),
                        has_audio: false,
                        has_video: false,
                    });
                    match track.kind() {
                        RTPCodecType::Audio => stream.has_audio = true,
                        RTPCodecType::Video => stream.has_video = true,
                        RTPCodecType::Unspecified => {}
                    }
                    stream.clone()
                };
                notifier.notify(TransportEvent::RemoteStream(stream)).await;
            })
        },
    ));

    Ok((pc, live))
}

fn description_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Description(e.to_string())
}

/// Folds an engine stats report into cumulative link counters.
///
/// Received counters come from inbound RTP streams. Loss is what the remote
/// end reported for our outbound streams. Round trip prefers the nominated
/// candidate pair.
fn raw_stats(report: &StatsReport) -> RawTransportStats {
    let mut stats = RawTransportStats::default();
    let mut pair_rtt = None;
    let mut rtcp_rtt = None;
    for entry in report.reports.values() {
        match entry {
            StatsReportType::InboundRTP(inbound) => {
                stats.bytes_received += inbound.bytes_received;
                stats.packets_received += inbound.packets_received;
            }
            StatsReportType::RemoteInboundRTP(remote) => {
                stats.packets_lost += u64::try_from(remote.packets_lost).unwrap_or(0);
                if let Some(rtt) = remote.round_trip_time {
                    rtcp_rtt = Some(rtt * 1000.0);
                }
            }
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                pair_rtt = Some(pair.current_round_trip_time * 1000.0);
            }
            _ => {}
        }
    }
    stats.round_trip_ms = pair_rtt.filter(|rtt| *rtt > 0.0).or(rtcp_rtt);
    stats
}

struct WebRtcTransport {
    api: Arc<API>,
    config: RTCConfiguration,
    notifier: TransportNotifier,
    tracks: LocalTrackRegistry,
    pc: Arc<RTCPeerConnection>,
    live: Arc<AtomicBool>,
    stream: Option<LocalStream>,
    video_sender: Option<Arc<RTCRtpSender>>,
}

impl WebRtcTransport {
    async fn add_track(
        &mut self,
        track: &LocalTrack,
        stream: StreamId,
    ) -> Result<(), TransportError> {
        let sample = self.tracks.sample_track(track, stream).await;
        let sender = self
            .pc
            .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(description_error)?;
        if track.kind == TrackKind::Video {
            self.video_sender = Some(sender);
        }
        Ok(())
    }

    fn retire(&mut self) {
        self.live.store(false, Ordering::Release);
        let pc = Arc::clone(&self.pc);
        let participant_id = self.notifier.participant_id().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = pc.close().await {
                        debug!(target: "vs.peer.webrtc", participant_id = %participant_id, error = %e, "Close failed");
                    }
                });
            }
            Err(_) => {
                warn!(target: "vs.peer.webrtc", participant_id = %participant_id, "No runtime to close peer connection");
            }
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn attach_stream(&mut self, stream: &LocalStream) -> Result<(), TransportError> {
        for track in &stream.tracks {
            self.add_track(track, stream.id).await?;
        }
        self.stream = Some(stream.clone());
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<String, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(description_error)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(description_error)?;
        Ok(sdp)
    }

    async fn create_answer(&mut self) -> Result<String, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(description_error)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(description_error)?;
        Ok(sdp)
    }

    async fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(description_error)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(description_error)
    }

    /// The engine has no local rollback, so the connection is rebuilt with
    /// the same configuration and tracks. Nothing was connected yet while an
    /// offer was outstanding.
    async fn rollback(&mut self) -> Result<(), TransportError> {
        self.retire();
        let (pc, live) = connect(&self.api, self.config.clone(), &self.notifier).await?;
        self.pc = pc;
        self.live = live;
        self.video_sender = None;
        if let Some(stream) = self.stream.clone() {
            for track in &stream.tracks {
                self.add_track(track, stream.id).await?;
            }
        }
        debug!(target: "vs.peer.webrtc", participant_id = %self.notifier.participant_id(), "Local offer rolled back");
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn replace_video_track(&mut self, track: &LocalTrack) -> Result<(), TransportError> {
        let stream = self.stream.as_ref().map_or_else(StreamId::new, |s| s.id);
        let Some(sender) = self.video_sender.clone() else {
            return self.add_track(track, stream).await;
        };
        let sample = self.tracks.sample_track(track, stream).await;
        sender
            .replace_track(Some(sample as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(description_error)
    }

    async fn stats(&mut self) -> Result<RawTransportStats, TransportError> {
        if !self.live.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(raw_stats(&self.pc.get_stats().await))
    }

    async fn set_encoder_ceiling(&mut self, max_bitrate_bps: u64) -> Result<(), TransportError> {
        self.tracks.set_encoder_ceiling(max_bitrate_bps);
        Ok(())
    }

    fn close(&mut self) {
        self.retire();
    }
}
