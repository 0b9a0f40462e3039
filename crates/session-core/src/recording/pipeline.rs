//! Recording pipeline: groups recorder chunks into timed segments and
//! uploads each one with bounded retry.
//!
//! Capture and upload are decoupled. One writer task owns the recorder and
//! cuts segments on a fixed interval; every completed segment is uploaded in
//! its own task, so a slow or retrying upload never holds up the next
//! segment.

use super::uploader::{RecordingSegment, SegmentMetadata, SegmentUploader, UploadError};
use crate::errors::SessionError;
use crate::media::LocalStream;
use crate::observability::metrics;
use crate::retry::Backoff;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::types::SessionId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long `stop()` waits for the recorder to hand over its last chunks.
const FINAL_CHUNK_TIMEOUT: Duration = Duration::from_secs(2);

/// Produces encoded chunks from a local stream.
#[async_trait]
pub trait MediaRecorder: Send {
    /// Next encoded chunk, `None` once the recorder has ended.
    ///
    /// Must be cancel-safe. After [`MediaRecorder::stop`] the recorder yields
    /// whatever it still buffers and then `None`.
    async fn next_chunk(&mut self) -> Option<Bytes>;

    fn metadata(&self) -> SegmentMetadata;

    fn stop(&mut self);
}

pub trait RecorderFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns `SessionError::Unsupported` when the stream cannot be recorded.
    fn create(&self, stream: &LocalStream) -> Result<Box<dyn MediaRecorder>, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordingState {
    Idle,
    Recording,
    Finalizing,
}

impl RecordingState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Recording => "recording",
            RecordingState::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that went wrong with one segment without stopping the
/// recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingWarning {
    /// Uploaded, but only after `attempts` tries.
    Retried { sequence: u64, attempts: u32 },
    /// Every attempt failed; the segment is lost.
    UploadFailed {
        sequence: u64,
        attempts: u32,
        error: UploadError,
    },
}

impl RecordingWarning {
    #[must_use]
    pub fn sequence(&self) -> u64 {
        match self {
            RecordingWarning::Retried { sequence, .. }
            | RecordingWarning::UploadFailed { sequence, .. } => *sequence,
        }
    }
}

/// Progress reported while recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingEvent {
    SegmentAcknowledged { sequence: u64 },
    Warning(RecordingWarning),
    /// The recorder stopped producing on its own; call `stop()` to finalize.
    CaptureEnded,
}

/// Summary of a finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingArtifact {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    /// Sequence numbers accepted by the sink, ascending.
    pub acknowledged: Vec<u64>,
    pub warnings: Vec<RecordingWarning>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordingSettings {
    pub segment_duration: Duration,
    pub upload_max_attempts: u32,
    pub upload_initial_backoff: Duration,
}

#[derive(Default)]
struct WriterReport {
    acknowledged: Vec<u64>,
    warnings: Vec<RecordingWarning>,
}

struct ActiveRecording {
    session_id: SessionId,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    writer: JoinHandle<WriterReport>,
}

pub struct RecordingPipeline {
    factory: Arc<dyn RecorderFactory>,
    uploader: Arc<dyn SegmentUploader>,
    settings: RecordingSettings,
    state: RecordingState,
    active: Option<ActiveRecording>,
    events: mpsc::UnboundedSender<RecordingEvent>,
}

impl RecordingPipeline {
    pub fn new(
        factory: Arc<dyn RecorderFactory>,
        uploader: Arc<dyn SegmentUploader>,
        settings: RecordingSettings,
    ) -> (Self, mpsc::UnboundedReceiver<RecordingEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                factory,
                uploader,
                settings,
                state: RecordingState::Idle,
                active: None,
                events,
            },
            events_rx,
        )
    }

    #[must_use]
    pub fn state(&self) -> RecordingState {
        self.state
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    /// Starts recording `stream`.
    ///
    /// # Errors
    ///
    /// - `RecordingAlreadyActive` unless idle
    /// - `NoLocalStream` without an acquired stream
    /// - whatever the recorder factory reports
    #[instrument(skip_all, name = "vs.recording.start", fields(session_id = %session_id))]
    pub fn start(
        &mut self,
        session_id: SessionId,
        stream: Option<&LocalStream>,
    ) -> Result<(), SessionError> {
        if self.state != RecordingState::Idle {
            return Err(SessionError::RecordingAlreadyActive);
        }
        let stream = stream.ok_or(SessionError::NoLocalStream)?;
        let recorder = self.factory.create(stream)?;

        let cancel = CancellationToken::new();
        let writer = SegmentWriter {
            session_id: session_id.clone(),
            metadata: recorder.metadata(),
            uploader: Arc::clone(&self.uploader),
            settings: self.settings,
            events: self.events.clone(),
        };
        let writer = tokio::spawn(writer.run(recorder, cancel.clone()));

        self.active = Some(ActiveRecording {
            session_id,
            started_at: Utc::now(),
            cancel,
            writer,
        });
        self.state = RecordingState::Recording;
        info!(target: "vs.recording", "Recording started");
        Ok(())
    }

    /// Flushes the in-flight segment, waits for every outstanding upload and
    /// returns the artifact. `None` when nothing was recording.
    #[instrument(skip_all, name = "vs.recording.stop")]
    pub async fn stop(&mut self) -> Option<RecordingArtifact> {
        let active = self.active.take()?;
        self.state = RecordingState::Finalizing;
        active.cancel.cancel();

        let report = match active.writer.await {
            Ok(report) => report,
            Err(e) => {
                error!(target: "vs.recording", error = %e, "Segment writer task failed");
                WriterReport::default()
            }
        };
        self.state = RecordingState::Idle;

        let artifact = RecordingArtifact {
            session_id: active.session_id,
            started_at: active.started_at,
            stopped_at: Utc::now(),
            acknowledged: report.acknowledged,
            warnings: report.warnings,
        };
        info!(
            target: "vs.recording",
            session_id = %artifact.session_id,
            segments = artifact.acknowledged.len(),
            warnings = artifact.warnings.len(),
            "Recording finalized"
        );
        Some(artifact)
    }
}

impl Drop for RecordingPipeline {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

struct UploadOutcome {
    sequence: u64,
    attempts: u32,
    result: Result<(), UploadError>,
}

struct SegmentWriter {
    session_id: SessionId,
    metadata: SegmentMetadata,
    uploader: Arc<dyn SegmentUploader>,
    settings: RecordingSettings,
    events: mpsc::UnboundedSender<RecordingEvent>,
}

impl SegmentWriter {
    async fn run(
        self,
        mut recorder: Box<dyn MediaRecorder>,
        cancel: CancellationToken,
    ) -> WriterReport {
        let period = self.settings.segment_duration;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut report = WriterReport::default();
        let mut uploads = JoinSet::new();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut segment_started = Instant::now();
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                chunk = recorder.next_chunk() => {
                    if let Some(chunk) = chunk {
                        chunks.push(chunk);
                    } else {
                        warn!(target: "vs.recording", session_id = %self.session_id, "Recorder ended");
                        let _ = self.events.send(RecordingEvent::CaptureEnded);
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.cut(&mut chunks, &mut sequence, &mut segment_started, &mut uploads);
                }

                Some(joined) = uploads.join_next(), if !uploads.is_empty() => {
                    self.settle(joined, &mut report);
                }
            }
        }

        recorder.stop();
        let drained = tokio::time::timeout(FINAL_CHUNK_TIMEOUT, async {
            while let Some(chunk) = recorder.next_chunk().await {
                chunks.push(chunk);
            }
        })
        .await;
        if drained.is_err() {
            warn!(target: "vs.recording", "Recorder did not finish within timeout");
        }
        self.cut(&mut chunks, &mut sequence, &mut segment_started, &mut uploads);

        while let Some(joined) = uploads.join_next().await {
            self.settle(joined, &mut report);
        }
        report.acknowledged.sort_unstable();
        report.warnings.sort_by_key(RecordingWarning::sequence);
        report
    }

    /// Closes the current segment and hands it to an upload task. Empty
    /// segments are skipped without consuming a sequence number.
    fn cut(
        &self,
        chunks: &mut Vec<Bytes>,
        sequence: &mut u64,
        segment_started: &mut Instant,
        uploads: &mut JoinSet<UploadOutcome>,
    ) {
        let now = Instant::now();
        let duration = now.duration_since(*segment_started);
        *segment_started = now;
        if chunks.is_empty() {
            return;
        }

        *sequence += 1;
        let segment = RecordingSegment {
            session_id: self.session_id.clone(),
            sequence: *sequence,
            chunks: std::mem::take(chunks),
            duration,
            metadata: self.metadata.clone(),
        };
        debug!(
            target: "vs.recording",
            sequence = segment.sequence,
            bytes = segment.len(),
            "Segment complete"
        );

        let backoff = Backoff::upload(
            self.settings.upload_initial_backoff,
            self.settings.upload_max_attempts,
        );
        uploads.spawn(upload_with_retry(Arc::clone(&self.uploader), segment, backoff));
    }

    fn settle(
        &self,
        joined: Result<UploadOutcome, tokio::task::JoinError>,
        report: &mut WriterReport,
    ) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(target: "vs.recording", error = %e, "Upload task failed");
                return;
            }
        };

        let warning = match outcome.result {
            Ok(()) => {
                report.acknowledged.push(outcome.sequence);
                let _ = self.events.send(RecordingEvent::SegmentAcknowledged {
                    sequence: outcome.sequence,
                });
                (outcome.attempts > 1).then_some(RecordingWarning::Retried {
                    sequence: outcome.sequence,
                    attempts: outcome.attempts,
                })
            }
            Err(error) => Some(RecordingWarning::UploadFailed {
                sequence: outcome.sequence,
                attempts: outcome.attempts,
                error,
            }),
        };

        if let Some(warning) = warning {
            report.warnings.push(warning.clone());
            let _ = self.events.send(RecordingEvent::Warning(warning));
        }
    }
}

async fn upload_with_retry(
    uploader: Arc<dyn SegmentUploader>,
    segment: RecordingSegment,
    mut backoff: Backoff,
) -> UploadOutcome {
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match uploader.upload(&segment).await {
            Ok(()) => {
                metrics::record_segment_upload("success", started.elapsed());
                debug!(
                    target: "vs.recording",
                    sequence = segment.sequence,
                    attempts,
                    "Segment acknowledged"
                );
                return UploadOutcome {
                    sequence: segment.sequence,
                    attempts,
                    result: Ok(()),
                };
            }
            Err(e) => {
                let Some(delay) = backoff.next_delay() else {
                    metrics::record_segment_upload("failed", started.elapsed());
                    error!(
                        target: "vs.recording",
                        sequence = segment.sequence,
                        attempts,
                        error = %e,
                        "Segment upload failed, giving up"
                    );
                    return UploadOutcome {
                        sequence: segment.sequence,
                        attempts,
                        result: Err(e),
                    };
                };
                metrics::record_upload_retry();
                warn!(
                    target: "vs.recording",
                    sequence = segment.sequence,
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Segment upload failed, will retry"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, TrackKind, TrackSource};
    use common::types::{StreamId, TrackId};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ChannelRecorder {
        rx: mpsc::Receiver<Bytes>,
    }

    #[async_trait]
    impl MediaRecorder for ChannelRecorder {
        async fn next_chunk(&mut self) -> Option<Bytes> {
            self.rx.recv().await
        }

        fn metadata(&self) -> SegmentMetadata {
            SegmentMetadata {
                format: "webm".to_string(),
                codec: "vp8,opus".to_string(),
                resolution: "1280x720".to_string(),
            }
        }

        fn stop(&mut self) {
            self.rx.close();
        }
    }

    struct OneShotFactory {
        rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    }

    impl RecorderFactory for OneShotFactory {
        fn create(&self, _stream: &LocalStream) -> Result<Box<dyn MediaRecorder>, SessionError> {
            let rx = self
                .rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| SessionError::Unsupported("recorder in use".to_string()))?;
            Ok(Box::new(ChannelRecorder { rx }))
        }
    }

    /// Fails the first `n` attempts for each listed sequence.
    #[derive(Default)]
    struct FlakyUploader {
        failures: Mutex<HashMap<u64, u32>>,
        attempts: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl SegmentUploader for FlakyUploader {
        async fn upload(&self, segment: &RecordingSegment) -> Result<(), UploadError> {
            self.attempts.lock().unwrap().push(segment.sequence);
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&segment.sequence) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(UploadError::Status(503))
                }
                _ => Ok(()),
            }
        }
    }

    fn stream() -> LocalStream {
        LocalStream {
            id: StreamId::new(),
            tracks: vec![LocalTrack {
                id: TrackId::new(),
                kind: TrackKind::Audio,
                source: TrackSource::Microphone,
                label: "mic".to_string(),
                settings: None,
                enabled: true,
            }],
        }
    }

    fn settings() -> RecordingSettings {
        RecordingSettings {
            segment_duration: Duration::from_secs(10),
            upload_max_attempts: 3,
            upload_initial_backoff: Duration::from_millis(500),
        }
    }

    fn pipeline(
        uploader: Arc<FlakyUploader>,
    ) -> (
        RecordingPipeline,
        mpsc::UnboundedReceiver<RecordingEvent>,
        mpsc::Sender<Bytes>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let factory = Arc::new(OneShotFactory {
            rx: Mutex::new(Some(rx)),
        });
        let (pipeline, events) = RecordingPipeline::new(factory, uploader, settings());
        (pipeline, events, tx)
    }

    async fn until_acknowledged(events: &mut mpsc::UnboundedReceiver<RecordingEvent>, sequence: u64) {
        loop {
            if events.recv().await.unwrap() == (RecordingEvent::SegmentAcknowledged { sequence }) {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_segment_is_acknowledged_with_one_warning() {
        let uploader = Arc::new(FlakyUploader::default());
        uploader.failures.lock().unwrap().insert(2, 1);
        let (mut pipeline, mut events, tx) = pipeline(Arc::clone(&uploader));

        pipeline
            .start(SessionId::from("consult-1"), Some(&stream()))
            .unwrap();
        assert_eq!(pipeline.state(), RecordingState::Recording);

        tx.send(Bytes::from_static(b"one")).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        until_acknowledged(&mut events, 1).await;

        tx.send(Bytes::from_static(b"two")).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        until_acknowledged(&mut events, 2).await;

        tx.send(Bytes::from_static(b"three")).await.unwrap();
        let artifact = pipeline.stop().await.unwrap();

        assert_eq!(artifact.acknowledged, vec![1, 2, 3]);
        assert_eq!(
            artifact.warnings,
            vec![RecordingWarning::Retried {
                sequence: 2,
                attempts: 2
            }]
        );
        assert_eq!(*uploader.attempts.lock().unwrap(), vec![1, 2, 2, 3]);
        assert_eq!(pipeline.state(), RecordingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_upload_is_warning_not_error() {
        let uploader = Arc::new(FlakyUploader::default());
        uploader.failures.lock().unwrap().insert(1, 10);
        let (mut pipeline, _events, tx) = pipeline(Arc::clone(&uploader));

        pipeline
            .start(SessionId::from("consult-1"), Some(&stream()))
            .unwrap();
        tx.send(Bytes::from_static(b"lost")).await.unwrap();

        let artifact = pipeline.stop().await.unwrap();
        assert!(artifact.acknowledged.is_empty());
        assert_eq!(
            artifact.warnings,
            vec![RecordingWarning::UploadFailed {
                sequence: 1,
                attempts: 3,
                error: UploadError::Status(503),
            }]
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (mut pipeline, _events, _tx) = pipeline(Arc::new(FlakyUploader::default()));
        pipeline
            .start(SessionId::from("consult-1"), Some(&stream()))
            .unwrap();
        assert!(matches!(
            pipeline.start(SessionId::from("consult-1"), Some(&stream())),
            Err(SessionError::RecordingAlreadyActive)
        ));
    }

    #[tokio::test]
    async fn test_start_without_stream() {
        let (mut pipeline, _events, _tx) = pipeline(Arc::new(FlakyUploader::default()));
        assert!(matches!(
            pipeline.start(SessionId::from("consult-1"), None),
            Err(SessionError::NoLocalStream)
        ));
        assert_eq!(pipeline.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let (mut pipeline, _events, _tx) = pipeline(Arc::new(FlakyUploader::default()));
        assert!(pipeline.stop().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_interval_consumes_no_sequence() {
        let uploader = Arc::new(FlakyUploader::default());
        let (mut pipeline, _events, tx) = pipeline(Arc::clone(&uploader));
        pipeline
            .start(SessionId::from("consult-1"), Some(&stream()))
            .unwrap();

        tokio::time::advance(Duration::from_secs(25)).await;
        tx.send(Bytes::from_static(b"late")).await.unwrap();

        let artifact = pipeline.stop().await.unwrap();
        assert_eq!(artifact.acknowledged, vec![1]);
    }

    #[tokio::test]
    async fn test_recorder_end_is_reported() {
        let (mut pipeline, mut events, tx) = pipeline(Arc::new(FlakyUploader::default()));
        pipeline
            .start(SessionId::from("consult-1"), Some(&stream()))
            .unwrap();
        drop(tx);

        assert_eq!(events.recv().await.unwrap(), RecordingEvent::CaptureEnded);
        let artifact = pipeline.stop().await.unwrap();
        assert!(artifact.acknowledged.is_empty());
    }
}
