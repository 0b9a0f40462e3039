//! Fake segment recorder.
//!
//! The test feeds encoded chunks through [`FakeRecorderFactory::feed`].
//! Stopping the recorder closes the feed: buffered chunks still come out,
//! then the recorder ends. [`FakeRecorderFactory::end_capture`] ends it from
//! the capture side instead.

use async_trait::async_trait;
use bytes::Bytes;
use session_core::errors::SessionError;
use session_core::media::LocalStream;
use session_core::recording::{MediaRecorder, RecorderFactory, SegmentMetadata};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct State {
    feed: Option<mpsc::UnboundedSender<Bytes>>,
    created: usize,
    stopped: usize,
    unsupported: bool,
}

/// Factory of fake recorders. Clones share state.
#[derive(Clone, Default)]
pub struct FakeRecorderFactory {
    state: Arc<Mutex<State>>,
}

impl FakeRecorderFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `create` fail as unsupported.
    pub fn unsupported(&self) {
        self.state.lock().unwrap().unsupported = true;
    }

    /// Chunk feed of the most recently created recorder.
    ///
    /// # Panics
    ///
    /// Panics if no recorder was created yet, or its capture was ended.
    #[must_use]
    pub fn feed(&self) -> mpsc::UnboundedSender<Bytes> {
        self.state
            .lock()
            .unwrap()
            .feed
            .clone()
            .expect("no live recorder")
    }

    /// Ends the latest recorder's capture once the test drops its feeds.
    pub fn end_capture(&self) {
        self.state.lock().unwrap().feed = None;
    }

    /// Number of recorders created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    /// Number of recorders stopped.
    #[must_use]
    pub fn stopped(&self) -> usize {
        self.state.lock().unwrap().stopped
    }
}

impl RecorderFactory for FakeRecorderFactory {
    fn create(&self, _stream: &LocalStream) -> Result<Box<dyn MediaRecorder>, SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.unsupported {
            return Err(SessionError::Unsupported("recording".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.feed = Some(tx);
        state.created += 1;
        Ok(Box::new(FakeRecorder {
            chunks: rx,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeRecorder {
    chunks: mpsc::UnboundedReceiver<Bytes>,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl MediaRecorder for FakeRecorder {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        self.chunks.recv().await
    }

    fn metadata(&self) -> SegmentMetadata {
        SegmentMetadata {
            format: "webm".to_string(),
            codec: "vp8".to_string(),
            resolution: "1280x720".to_string(),
        }
    }

    fn stop(&mut self) {
        self.chunks.close();
        self.state.lock().unwrap().stopped += 1;
    }
}
