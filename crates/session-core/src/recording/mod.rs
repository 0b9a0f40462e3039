//! Session recording: segmenting and durable upload.

pub mod pipeline;
pub mod uploader;

pub use pipeline::{
    MediaRecorder, RecorderFactory, RecordingArtifact, RecordingEvent, RecordingPipeline,
    RecordingSettings, RecordingState, RecordingWarning,
};
pub use uploader::{
    HttpSegmentUploader, RecordingSegment, SegmentMetadata, SegmentUploader, UploadError,
};
