//! Local capture: the media source.
//!
//! The [`MediaSource`] is the only component that mutates local tracks.
//! Links and the recorder receive cloned [`LocalStream`] snapshots.

use crate::errors::SessionError;
use crate::quality::{QualityProfile, QualityTier, Resolution};
use async_trait::async_trait;
use common::types::{StreamId, TrackId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// Settings a video track is actually running at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSettings {
    pub resolution: Resolution,
    pub frame_rate: u32,
}

/// Bounds requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub ideal: Resolution,
    pub max: Resolution,
    pub max_frame_rate: u32,
}

impl From<&QualityProfile> for CaptureConstraints {
    fn from(profile: &QualityProfile) -> Self {
        Self {
            ideal: profile.ideal,
            max: profile.max,
            max_frame_rate: profile.max_frame_rate,
        }
    }
}

impl From<TrackSettings> for CaptureConstraints {
    fn from(settings: TrackSettings) -> Self {
        Self {
            ideal: settings.resolution,
            max: settings.resolution,
            max_frame_rate: settings.frame_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub source: TrackSource,
    pub label: String,
    /// `None` for audio tracks.
    pub settings: Option<TrackSettings>,
    pub enabled: bool,
}

/// Immutable view of the acquired local media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: StreamId,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.track(TrackKind::Audio).is_some()
    }

    #[must_use]
    pub fn has_video(&self) -> bool {
        self.track(TrackKind::Video).is_some()
    }

    /// Whether an enabled track of this kind is being sent.
    #[must_use]
    pub fn is_sending(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some_and(|t| t.enabled)
    }

    fn track_mut(&mut self, kind: TrackKind) -> Option<&mut LocalTrack> {
        self.tracks.iter_mut().find(|t| t.kind == kind)
    }
}

/// Optional features of the device layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaCapabilities {
    pub screen_share: bool,
}

#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("Permission denied: {0}")]
    Denied(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    /// The device cannot satisfy the bounds; `nearest` is what it can do.
    #[error("Constraint '{constraint}' cannot be satisfied")]
    Overconstrained {
        constraint: String,
        nearest: Option<TrackSettings>,
    },

    #[error("Device failure: {0}")]
    Failed(String),
}

impl From<DeviceError> for SessionError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Overconstrained { .. } => {
                SessionError::ConstraintsNotSatisfiable(err.to_string())
            }
            other => SessionError::MediaUnavailable(other.to_string()),
        }
    }
}

/// Capture hardware as exposed by the platform.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    fn capabilities(&self) -> MediaCapabilities;

    async fn open_audio(&self) -> Result<LocalTrack, DeviceError>;

    async fn open_video(&self, constraints: &CaptureConstraints) -> Result<LocalTrack, DeviceError>;

    /// Opens a display capture track. Only called when
    /// [`MediaCapabilities::screen_share`] is set.
    async fn open_screen(&self) -> Result<LocalTrack, DeviceError>;

    /// Re-applies bounds to a live video track and returns the new settings.
    async fn apply_constraints(
        &self,
        track: TrackId,
        constraints: &CaptureConstraints,
    ) -> Result<TrackSettings, DeviceError>;

    async fn set_track_enabled(&self, track: TrackId, enabled: bool) -> Result<(), DeviceError>;

    fn stop_track(&self, track: TrackId);
}

/// Why an acquisition did not get what was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedAcquisition {
    pub requested: QualityTier,
    pub reason: String,
    pub settings: Option<TrackSettings>,
}

#[derive(Debug, Clone)]
pub struct Acquisition {
    pub stream: LocalStream,
    pub degraded: Vec<DegradedAcquisition>,
}

pub struct MediaSource {
    devices: Arc<dyn CaptureDevices>,
    stream: Option<LocalStream>,
    /// Camera track parked while the screen is shared.
    parked_camera: Option<LocalTrack>,
    profile: QualityTier,
}

impl MediaSource {
    #[must_use]
    pub fn new(devices: Arc<dyn CaptureDevices>) -> Self {
        Self {
            devices,
            stream: None,
            parked_camera: None,
            profile: QualityTier::Medium,
        }
    }

    #[must_use]
    pub fn capabilities(&self) -> MediaCapabilities {
        self.devices.capabilities()
    }

    #[must_use]
    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.parked_camera.is_some()
    }

    /// Acquires microphone and camera at `tier`.
    ///
    /// If nothing can be opened, one more attempt is made at `Low` before
    /// giving up.
    #[instrument(skip_all, name = "vs.media.acquire", fields(tier = %tier))]
    pub async fn acquire(&mut self, tier: QualityTier) -> Result<Acquisition, SessionError> {
        if self.stream.is_some() {
            return Err(SessionError::InvalidState(
                "local media already acquired".to_string(),
            ));
        }

        let mut acquired_at = tier;
        let acquisition = match self.open_tracks(tier).await {
            Ok(acquisition) => acquisition,
            Err(e) if tier != QualityTier::Low => {
                warn!(
                    target: "vs.media",
                    error = %e,
                    "Acquisition failed, retrying at low quality"
                );
                let mut acquisition = self.open_tracks(QualityTier::Low).await?;
                acquired_at = QualityTier::Low;
                acquisition.degraded.push(DegradedAcquisition {
                    requested: tier,
                    reason: format!("retried at low quality after: {e}"),
                    settings: acquisition
                        .stream
                        .track(TrackKind::Video)
                        .and_then(|t| t.settings),
                });
                acquisition
            }
            Err(e) => return Err(e),
        };

        self.profile = acquired_at;
        self.stream = Some(acquisition.stream.clone());

        info!(
            target: "vs.media",
            stream_id = %acquisition.stream.id,
            has_audio = acquisition.stream.has_audio(),
            has_video = acquisition.stream.has_video(),
            degraded = !acquisition.degraded.is_empty(),
            "Local media acquired"
        );
        Ok(acquisition)
    }

    async fn open_tracks(&self, tier: QualityTier) -> Result<Acquisition, SessionError> {
        let mut degraded = Vec::new();

        let audio = self.devices.open_audio().await;
        let video = match self.devices.open_video(&tier.profile().into()).await {
            Err(DeviceError::Overconstrained {
                constraint,
                nearest: Some(nearest),
            }) => {
                warn!(
                    target: "vs.media",
                    constraint = %constraint,
                    resolution = %nearest.resolution,
                    frame_rate = nearest.frame_rate,
                    "Requested constraints not satisfiable, using nearest settings"
                );
                degraded.push(DegradedAcquisition {
                    requested: tier,
                    reason: format!("constraint '{constraint}' not satisfiable"),
                    settings: Some(nearest),
                });
                self.devices.open_video(&nearest.into()).await
            }
            other => other,
        };

        let mut tracks = Vec::with_capacity(2);
        let mut failures = Vec::new();
        for (kind, result) in [(TrackKind::Audio, audio), (TrackKind::Video, video)] {
            match result {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    warn!(target: "vs.media", kind = kind.as_str(), error = %e, "Track unavailable");
                    failures.push((kind, e));
                }
            }
        }

        if tracks.is_empty() {
            return Err(failures.into_iter().next().map_or_else(
                || SessionError::MediaUnavailable("no capture devices".to_string()),
                |(_, e)| SessionError::from(e),
            ));
        }

        for (kind, e) in failures {
            degraded.push(DegradedAcquisition {
                requested: tier,
                reason: format!("{} unavailable: {e}", kind.as_str()),
                settings: None,
            });
        }

        Ok(Acquisition {
            stream: LocalStream {
                id: StreamId::new(),
                tracks,
            },
            degraded,
        })
    }

    /// Mute semantics: the track stays allocated but is suppressed.
    pub async fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<(), SessionError> {
        let stream = self.stream.as_mut().ok_or(SessionError::NoLocalStream)?;
        let track = stream
            .track_mut(kind)
            .ok_or_else(|| SessionError::InvalidState(format!("no local {} track", kind.as_str())))?;

        if track.enabled == enabled {
            return Ok(());
        }
        self.devices.set_track_enabled(track.id, enabled).await?;
        track.enabled = enabled;

        debug!(target: "vs.media", kind = kind.as_str(), enabled, "Track toggled");
        Ok(())
    }

    /// Swaps the outgoing video track and returns the previous one.
    ///
    /// The previous track is not stopped; the caller decides.
    pub fn replace_video_track(&mut self, track: LocalTrack) -> Result<LocalTrack, SessionError> {
        let stream = self.stream.as_mut().ok_or(SessionError::NoLocalStream)?;
        let slot = stream
            .track_mut(TrackKind::Video)
            .ok_or_else(|| SessionError::InvalidState("no local video track".to_string()))?;
        Ok(std::mem::replace(slot, track))
    }

    /// Replaces the camera with a display capture. Returns the screen track.
    #[instrument(skip_all, name = "vs.media.screen_share")]
    pub async fn start_screen_share(&mut self) -> Result<LocalTrack, SessionError> {
        if !self.capabilities().screen_share {
            return Err(SessionError::Unsupported(
                "screen share is not available on this device".to_string(),
            ));
        }
        if self.stream.is_none() {
            return Err(SessionError::NoLocalStream);
        }
        if self.parked_camera.is_some() {
            return Err(SessionError::InvalidState(
                "screen share already active".to_string(),
            ));
        }

        let screen = self.devices.open_screen().await?;
        match self.replace_video_track(screen.clone()) {
            Ok(camera) => {
                self.parked_camera = Some(camera);
                info!(target: "vs.media", track_id = %screen.id, "Screen share started");
                Ok(screen)
            }
            Err(e) => {
                self.devices.stop_track(screen.id);
                Err(e)
            }
        }
    }

    /// Swaps the parked camera back in and stops the screen track.
    pub fn restore_camera(&mut self) -> Result<LocalTrack, SessionError> {
        let camera = self
            .parked_camera
            .take()
            .ok_or_else(|| SessionError::InvalidState("screen share not active".to_string()))?;

        match self.replace_video_track(camera.clone()) {
            Ok(screen) => {
                self.devices.stop_track(screen.id);
                info!(target: "vs.media", "Camera restored");
                Ok(camera)
            }
            Err(e) => {
                self.parked_camera = Some(camera);
                Err(e)
            }
        }
    }

    /// Re-applies `tier` to the camera track.
    ///
    /// Never drops the track: on failure the previous settings stay in force
    /// and `None` is returned.
    pub async fn apply_profile(&mut self, tier: QualityTier) -> Option<TrackSettings> {
        self.profile = tier;
        let constraints = CaptureConstraints::from(tier.profile());

        let camera = match self.parked_camera.as_mut() {
            Some(parked) => Some(parked),
            None => self
                .stream
                .as_mut()
                .and_then(|s| s.track_mut(TrackKind::Video))
                .filter(|t| t.source == TrackSource::Camera),
        }?;

        match self.devices.apply_constraints(camera.id, &constraints).await {
            Ok(settings) => {
                camera.settings = Some(settings);
                debug!(
                    target: "vs.media",
                    tier = %tier,
                    resolution = %settings.resolution,
                    frame_rate = settings.frame_rate,
                    "Profile applied to camera"
                );
                Some(settings)
            }
            Err(e) => {
                warn!(
                    target: "vs.media",
                    tier = %tier,
                    error = %e,
                    "Failed to apply profile, keeping previous settings"
                );
                None
            }
        }
    }

    #[must_use]
    pub fn profile(&self) -> QualityTier {
        self.profile
    }

    /// Stops every track. Idempotent.
    pub fn release(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let parked = self.parked_camera.take();
        for track in stream.tracks.iter().chain(parked.iter()) {
            self.devices.stop_track(track.id);
        }
        info!(target: "vs.media", stream_id = %stream.id, "Local media released");
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.release();
    }
}
