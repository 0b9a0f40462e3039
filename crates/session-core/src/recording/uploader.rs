//! Segment upload sink.
//!
//! A segment is posted as `multipart/form-data` with the media bytes in the
//! `recording` field and the identifying metadata as text fields. The sink
//! answers `{"success": bool}`.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use common::secret::{ExposeSecret, SecretString};
use common::types::SessionId;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

/// Default HTTP timeout for one upload attempt.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Container and encoding of recorded chunks, as reported by the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMetadata {
    /// Container, e.g. `webm`.
    pub format: String,
    pub codec: String,
    /// `WIDTHxHEIGHT` of the recorded video.
    pub resolution: String,
}

impl SegmentMetadata {
    #[must_use]
    pub fn mime_type(&self) -> String {
        format!("video/{}", self.format)
    }
}

/// A completed segment ready for upload.
#[derive(Debug, Clone)]
pub struct RecordingSegment {
    pub session_id: SessionId,
    /// Starts at 1 for each recording.
    pub sequence: u64,
    pub chunks: Vec<Bytes>,
    pub duration: Duration,
    pub metadata: SegmentMetadata,
}

impl RecordingSegment {
    /// Total payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Bytes::is_empty)
    }

    /// Chunks concatenated in capture order.
    #[must_use]
    pub fn body(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("Upload request failed: {0}")]
    Http(String),

    #[error("Upload sink returned status {0}")]
    Status(u16),

    #[error("Upload sink reported failure")]
    Rejected,

    #[error("Invalid upload response: {0}")]
    InvalidResponse(String),

    #[error("Upload client misconfigured: {0}")]
    Configuration(String),
}

/// Destination for recorded segments. One call is one attempt; retries are
/// the caller's business.
#[async_trait]
pub trait SegmentUploader: Send + Sync {
    async fn upload(&self, segment: &RecordingSegment) -> Result<(), UploadError>;
}

#[derive(Deserialize)]
struct UploadResponse {
    success: bool,
}

/// Multipart HTTP uploader.
pub struct HttpSegmentUploader {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpSegmentUploader {
    /// # Errors
    ///
    /// Returns `UploadError::Configuration` if the HTTP client cannot be built.
    pub fn new(
        url: impl Into<String>,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                UploadError::Configuration(format!("Failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }

    fn form(segment: &RecordingSegment) -> Result<Form, UploadError> {
        let file_name = format!(
            "{}-{:05}.{}",
            segment.session_id, segment.sequence, segment.metadata.format
        );
        let part = Part::bytes(segment.body().to_vec())
            .file_name(file_name)
            .mime_str(&segment.metadata.mime_type())
            .map_err(|e| UploadError::Configuration(format!("Invalid mime type: {e}")))?;

        Ok(Form::new()
            .part("recording", part)
            .text("consultationId", segment.session_id.to_string())
            .text("sequence", segment.sequence.to_string())
            .text("format", segment.metadata.format.clone())
            .text("codec", segment.metadata.codec.clone())
            .text("resolution", segment.metadata.resolution.clone())
            .text("duration", segment.duration.as_secs_f64().to_string()))
    }
}

#[async_trait]
impl SegmentUploader for HttpSegmentUploader {
    #[instrument(
        skip_all,
        name = "vs.recording.upload",
        fields(session_id = %segment.session_id, sequence = segment.sequence)
    )]
    async fn upload(&self, segment: &RecordingSegment) -> Result<(), UploadError> {
        debug!(
            target: "vs.recording",
            bytes = segment.len(),
            "Uploading segment"
        );

        let mut request = self.client.post(&self.url).multipart(Self::form(segment)?);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            debug!(target: "vs.recording", error = %e, "Upload request failed");
            UploadError::Http(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "vs.recording", status = %status, "Upload sink returned error status");
            trace!(target: "vs.recording", body = %body, "Upload error response body");
            return Err(UploadError::Status(status.as_u16()));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))?;
        if !body.success {
            return Err(UploadError::Rejected);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn segment(sequence: u64) -> RecordingSegment {
        RecordingSegment {
            session_id: SessionId::from("consult-42"),
            sequence,
            chunks: vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")],
            duration: Duration::from_secs(10),
            metadata: SegmentMetadata {
                format: "webm".to_string(),
                codec: "vp8,opus".to_string(),
                resolution: "1280x720".to_string(),
            },
        }
    }

    fn uploader(server: &MockServer, token: Option<&str>) -> HttpSegmentUploader {
        HttpSegmentUploader::new(
            format!("{}/api/recordings/segments", server.uri()),
            token.map(SecretString::from),
            DEFAULT_UPLOAD_TIMEOUT,
        )
        .unwrap()
    }

    #[test]
    fn test_body_concatenates_chunks() {
        let seg = segment(1);
        assert_eq!(seg.len(), 6);
        assert_eq!(seg.body(), Bytes::from_static(b"abcdef"));
        assert!(!seg.is_empty());
    }

    #[tokio::test]
    async fn test_upload_sends_fields_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/recordings/segments"))
            .and(header("authorization", "Bearer upload-secret"))
            .and(body_string_contains("name=\"consultationId\""))
            .and(body_string_contains("consult-42"))
            .and(body_string_contains("name=\"sequence\""))
            .and(body_string_contains("name=\"recording\""))
            .and(body_string_contains("abcdef"))
            .and(body_string_contains("vp8,opus"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        uploader(&server, Some("upload-secret"))
            .upload(&segment(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_2xx_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = uploader(&server, None).upload(&segment(1)).await.unwrap_err();
        assert_eq!(err, UploadError::Status(503));
    }

    #[tokio::test]
    async fn test_success_false_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": false})))
            .mount(&server)
            .await;

        let err = uploader(&server, None).upload(&segment(1)).await.unwrap_err();
        assert_eq!(err, UploadError::Rejected);
    }

    #[tokio::test]
    async fn test_unparseable_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let err = uploader(&server, None).upload(&segment(1)).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidResponse(_)));
    }
}
