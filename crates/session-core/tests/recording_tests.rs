//! Recording through the session actor: segmenting, upload retries and
//! finalization on stop and on leave.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use session_core::errors::SessionError;
use session_core::recording::{RecordingState, RecordingWarning};
use session_core::SessionEvent;
use session_test_utils::fixtures::{participant, TestSession};
use std::time::Duration;

/// Segment length configured by `test_config`.
const SEGMENT: Duration = Duration::from_secs(2);

fn chunk(tag: &str) -> Bytes {
    Bytes::from(format!("chunk-{tag}"))
}

#[tokio::test(start_paused = true)]
async fn test_three_segments_with_one_retried_upload() {
    let mut session = TestSession::spawn("client-1");
    session.join().await.unwrap();
    session.uploader.fail_times(2, 1);

    session.handle.start_recording().await.unwrap();
    session
        .wait_for(|e| *e == SessionEvent::RecordingStateChanged(RecordingState::Recording))
        .await;
    session.signaling.wait_for_kind("recording-started").await;

    let feed = session.recorder.feed();
    feed.send(chunk("a")).unwrap();
    tokio::time::sleep(SEGMENT + Duration::from_millis(500)).await;
    feed.send(chunk("b")).unwrap();
    tokio::time::sleep(SEGMENT).await;
    feed.send(chunk("c")).unwrap();

    let artifact = session.handle.stop_recording().await.unwrap().unwrap();

    assert_eq!(artifact.acknowledged, vec![1, 2, 3]);
    assert_eq!(
        artifact.warnings,
        vec![RecordingWarning::Retried {
            sequence: 2,
            attempts: 2
        }]
    );
    assert!(artifact.stopped_at >= artifact.started_at);
    assert_eq!(session.uploader.attempts(), vec![1, 2, 2, 3]);
    assert_eq!(session.recorder.stopped(), 1);

    session
        .wait_for(|e| matches!(e, SessionEvent::RecordingFinished(_)))
        .await;
    session.signaling.wait_for_kind("recording-stopped").await;
    assert_eq!(
        session.handle.snapshot().await.unwrap().recording,
        RecordingState::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn test_upload_failure_is_a_warning_not_an_error() {
    let mut session = TestSession::spawn("client-1");
    session.join().await.unwrap();
    session.uploader.fail_always(1);

    session.handle.start_recording().await.unwrap();
    session.recorder.feed().send(chunk("a")).unwrap();

    let warning = session
        .wait_for(|e| matches!(e, SessionEvent::RecordingWarning(RecordingWarning::UploadFailed { .. })))
        .await;
    let SessionEvent::RecordingWarning(warning) = warning else {
        unreachable!()
    };
    assert_eq!(warning.sequence(), 1);

    // Recording continues with the next segment
    session.recorder.feed().send(chunk("b")).unwrap();
    session
        .wait_for(|e| *e == SessionEvent::SegmentUploaded { sequence: 2 })
        .await;

    let artifact = session.handle.stop_recording().await.unwrap().unwrap();
    assert_eq!(artifact.acknowledged, vec![2]);
    assert_eq!(artifact.warnings.len(), 1);
    assert_eq!(session.uploader.attempts(), vec![1, 1, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_recording_requires_joined_session() {
    let session = TestSession::spawn("client-1");

    let err = session.handle.start_recording().await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(_)), "{err:?}");
    assert_eq!(session.recorder.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected() {
    let session = TestSession::spawn("client-1");
    session.join().await.unwrap();

    session.handle.start_recording().await.unwrap();
    let err = session.handle.start_recording().await.unwrap_err();
    assert!(matches!(err, SessionError::RecordingAlreadyActive), "{err:?}");
    assert_eq!(session.recorder.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_recording_returns_nothing() {
    let session = TestSession::spawn("client-1");
    session.join().await.unwrap();

    assert!(session.handle.stop_recording().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_leave_finalizes_recording_before_teardown() {
    let mut session = TestSession::spawn("client-1");
    session.signaling.set_roster(vec![participant("pro-1")]);
    session.join().await.unwrap();

    session.handle.start_recording().await.unwrap();
    session.recorder.feed().send(chunk("a")).unwrap();

    let artifact = session.handle.leave().await.unwrap().unwrap();
    assert_eq!(artifact.acknowledged, vec![1]);
    assert_eq!(session.uploader.stored(), vec![(1, chunk("a").len())]);

    let events = session.drain();
    let finished = events
        .iter()
        .position(|e| matches!(e, SessionEvent::RecordingFinished(_)))
        .unwrap();
    let ended = events
        .iter()
        .position(|e| *e == SessionEvent::Ended)
        .unwrap();
    assert!(finished < ended, "{events:?}");

    // The recording stop was announced before leaving
    let kinds = session.signaling.wait_for_count("leave-consultation", 1).await;
    assert_eq!(kinds.len(), 1);
    let received = session.signaling.received_kinds();
    let stopped = received.iter().position(|k| k == "recording-stopped").unwrap();
    let left = received.iter().position(|k| k == "leave-consultation").unwrap();
    assert!(stopped < left, "{received:?}");
}

#[tokio::test(start_paused = true)]
async fn test_recorder_ending_finalizes_recording() {
    let mut session = TestSession::spawn("client-1");
    session.join().await.unwrap();

    session.handle.start_recording().await.unwrap();
    session.recorder.feed().send(chunk("a")).unwrap();
    session.recorder.end_capture();

    let finished = session
        .wait_for(|e| matches!(e, SessionEvent::RecordingFinished(_)))
        .await;
    let SessionEvent::RecordingFinished(artifact) = finished else {
        unreachable!()
    };
    assert_eq!(artifact.acknowledged, vec![1]);
    assert_eq!(
        session.handle.snapshot().await.unwrap().recording,
        RecordingState::Idle
    );
}
