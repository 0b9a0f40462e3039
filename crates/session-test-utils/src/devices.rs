//! Fake capture devices.
//!
//! Every device opens at exactly the requested ideal resolution unless told
//! to fail. Opened and stopped tracks are recorded.

use async_trait::async_trait;
use common::types::TrackId;
use session_core::media::{
    CaptureConstraints, CaptureDevices, DeviceError, LocalTrack, MediaCapabilities, TrackKind,
    TrackSettings, TrackSource,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    deny_audio: bool,
    deny_video: bool,
    frame_rate_limit: Option<u32>,
    screen_share: bool,
    opened: Vec<(TrackSource, Option<TrackSettings>)>,
    applied: Vec<TrackSettings>,
    stopped: Vec<TrackId>,
}

/// Fake capture devices. Clones share state.
#[derive(Clone, Default)]
pub struct FakeDevices {
    state: Arc<Mutex<State>>,
}

impl FakeDevices {
    /// Microphone and camera available, no screen capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_screen_share(self) -> Self {
        self.state.lock().unwrap().screen_share = true;
        self
    }

    /// Deny microphone access.
    pub fn deny_audio(&self) {
        self.state.lock().unwrap().deny_audio = true;
    }

    /// Deny camera access.
    pub fn deny_video(&self) {
        self.state.lock().unwrap().deny_video = true;
    }

    /// Camera refuses constraints above `fps` frames per second.
    pub fn limit_frame_rate(&self, fps: u32) {
        self.state.lock().unwrap().frame_rate_limit = Some(fps);
    }

    /// Sources opened so far with the settings they opened at.
    #[must_use]
    pub fn opened(&self) -> Vec<(TrackSource, Option<TrackSettings>)> {
        self.state.lock().unwrap().opened.clone()
    }

    /// Settings applied to live tracks, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<TrackSettings> {
        self.state.lock().unwrap().applied.clone()
    }

    #[must_use]
    pub fn stopped(&self) -> Vec<TrackId> {
        self.state.lock().unwrap().stopped.clone()
    }

    fn open(&self, kind: TrackKind, source: TrackSource, settings: Option<TrackSettings>) -> LocalTrack {
        self.state.lock().unwrap().opened.push((source, settings));
        LocalTrack {
            id: TrackId::new(),
            kind,
            source,
            label: format!("fake {source:?}"),
            settings,
            enabled: true,
        }
    }
}

fn settings_for(constraints: &CaptureConstraints) -> TrackSettings {
    TrackSettings {
        resolution: constraints.ideal,
        frame_rate: constraints.max_frame_rate,
    }
}

#[async_trait]
impl CaptureDevices for FakeDevices {
    fn capabilities(&self) -> MediaCapabilities {
        MediaCapabilities {
            screen_share: self.state.lock().unwrap().screen_share,
        }
    }

    async fn open_audio(&self) -> Result<LocalTrack, DeviceError> {
        if self.state.lock().unwrap().deny_audio {
            return Err(DeviceError::Denied("microphone".to_string()));
        }
        Ok(self.open(TrackKind::Audio, TrackSource::Microphone, None))
    }

    async fn open_video(&self, constraints: &CaptureConstraints) -> Result<LocalTrack, DeviceError> {
        let (deny, limit) = {
            let state = self.state.lock().unwrap();
            (state.deny_video, state.frame_rate_limit)
        };
        if deny {
            return Err(DeviceError::Denied("camera".to_string()));
        }
        if limit.is_some_and(|fps| constraints.max_frame_rate > fps) {
            return Err(DeviceError::Overconstrained {
                constraint: "frameRate".to_string(),
                nearest: None,
            });
        }
        Ok(self.open(
            TrackKind::Video,
            TrackSource::Camera,
            Some(settings_for(constraints)),
        ))
    }

    async fn open_screen(&self) -> Result<LocalTrack, DeviceError> {
        if !self.state.lock().unwrap().screen_share {
            return Err(DeviceError::NotFound("screen capture".to_string()));
        }
        Ok(self.open(TrackKind::Video, TrackSource::Screen, None))
    }

    async fn apply_constraints(
        &self,
        _track: TrackId,
        constraints: &CaptureConstraints,
    ) -> Result<TrackSettings, DeviceError> {
        let settings = settings_for(constraints);
        self.state.lock().unwrap().applied.push(settings);
        Ok(settings)
    }

    async fn set_track_enabled(&self, _track: TrackId, _enabled: bool) -> Result<(), DeviceError> {
        Ok(())
    }

    fn stop_track(&self, track: TrackId) {
        self.state.lock().unwrap().stopped.push(track);
    }
}
