//! Scripted segment uploader.
//!
//! Succeeds unless a sequence number was scripted to fail. Each attempt is
//! recorded, so tests can assert on retries.

use async_trait::async_trait;
use session_core::recording::{RecordingSegment, SegmentUploader, UploadError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    /// Remaining failures per sequence. `u32::MAX` fails forever.
    failures: HashMap<u64, u32>,
    attempts: Vec<u64>,
    stored: Vec<(u64, usize)>,
}

/// Scripted uploader. Clones share state.
#[derive(Clone, Default)]
pub struct ScriptedUploader {
    state: Arc<Mutex<State>>,
}

impl ScriptedUploader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `times` attempts of segment `sequence` with a 503.
    pub fn fail_times(&self, sequence: u64, times: u32) {
        self.state.lock().unwrap().failures.insert(sequence, times);
    }

    /// Fail every attempt of segment `sequence`.
    pub fn fail_always(&self, sequence: u64) {
        self.fail_times(sequence, u32::MAX);
    }

    /// Sequence number of every attempt, in order.
    #[must_use]
    pub fn attempts(&self) -> Vec<u64> {
        self.state.lock().unwrap().attempts.clone()
    }

    /// Stored segments as `(sequence, bytes)`, in completion order.
    #[must_use]
    pub fn stored(&self) -> Vec<(u64, usize)> {
        self.state.lock().unwrap().stored.clone()
    }
}

#[async_trait]
impl SegmentUploader for ScriptedUploader {
    async fn upload(&self, segment: &RecordingSegment) -> Result<(), UploadError> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(segment.sequence);

        if let Some(remaining) = state.failures.get_mut(&segment.sequence) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(UploadError::Status(503));
            }
        }

        state.stored.push((segment.sequence, segment.len()));
        Ok(())
    }
}
