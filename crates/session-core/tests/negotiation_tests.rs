//! Offer collisions and signaling reconnects through the session actor.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use common::types::ParticipantId;
use session_core::peer::{IceCandidate, LinkState, Signal, TransportEvent, TransportState};
use session_core::signaling::SessionPhase;
use session_core::SessionEvent;
use session_test_utils::fixtures::{participant, participant_on, test_config, TestSession};
use session_test_utils::signaling::{self, FakeSignaling};
use session_test_utils::FakeDevices;
use std::time::Duration;

/// Joins an empty session, then lets `remote` arrive so the local side
/// offers to it.
async fn offering_to(local: &str, remote: &str) -> (TestSession, ParticipantId) {
    let mut session = TestSession::spawn(local);
    session.join().await.unwrap();

    let pid = ParticipantId::from(remote);
    session
        .signaling
        .push(signaling::participant_joined(&participant(remote)))
        .await;
    session
        .wait_for(|e| matches!(e, SessionEvent::LinkStateChanged { to: LinkState::Offering, .. }))
        .await;
    session.signaling.wait_for_relayed(&pid, 1).await;
    (session, pid)
}

fn remote_offer() -> Signal {
    Signal::Offer {
        sdp: "colliding-offer".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_glare_smaller_local_id_keeps_its_offer() {
    // "alice-1" < "pro-1"
    let (mut session, pid) = offering_to("alice-1", "pro-1").await;

    session
        .signaling
        .push(signaling::signal_from(&pid, &remote_offer()))
        .await;
    // Barrier: the actor has handled the colliding offer once this returns
    session
        .signaling
        .push(signaling::server_error("barrier"))
        .await;
    session
        .wait_for(|e| matches!(e, SessionEvent::ServerError(_)))
        .await;

    let calls = session.transports.calls_for(&pid);
    assert!(!calls.contains(&"rollback".to_string()), "{calls:?}");
    assert!(!calls.contains(&"answer".to_string()), "{calls:?}");
    assert_eq!(session.signaling.relayed_to(&pid).len(), 1);

    let snapshot = session.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.links[0].state, LinkState::Offering);
}

#[tokio::test(start_paused = true)]
async fn test_glare_larger_local_id_rolls_back_and_answers() {
    // "zoe-1" > "pro-1"
    let (mut session, pid) = offering_to("zoe-1", "pro-1").await;

    session
        .signaling
        .push(signaling::signal_from(&pid, &remote_offer()))
        .await;
    session
        .wait_for(|e| {
            matches!(
                e,
                SessionEvent::LinkStateChanged {
                    from: LinkState::Offering,
                    to: LinkState::Answering,
                    ..
                }
            )
        })
        .await;

    let relayed = session.signaling.wait_for_relayed(&pid, 2).await;
    assert_eq!(
        relayed[1],
        Signal::Answer {
            sdp: "answer-pro-1".to_string()
        }
    );

    let calls = session.transports.calls_for(&pid);
    let rollback = calls.iter().position(|c| c == "rollback").unwrap();
    let remote = calls.iter().position(|c| c == "remote-offer").unwrap();
    assert!(rollback < remote, "{calls:?}");
}

#[tokio::test(start_paused = true)]
async fn test_candidates_before_remote_description_are_applied_after_it() {
    let mut session = TestSession::spawn("client-1");
    session.signaling.set_roster(vec![participant("pro-1")]);
    session.join().await.unwrap();
    let pid = ParticipantId::from("pro-1");

    let candidate = |name: &str| {
        Signal::Candidate(IceCandidate {
            candidate: name.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        })
    };
    for signal in [candidate("c1"), remote_offer(), candidate("c2")] {
        session
            .signaling
            .push(signaling::signal_from(&pid, &signal))
            .await;
    }
    session.signaling.wait_for_relayed(&pid, 1).await;
    session
        .signaling
        .push(signaling::server_error("barrier"))
        .await;
    session
        .wait_for(|e| matches!(e, SessionEvent::ServerError(_)))
        .await;

    let calls = session.transports.calls_for(&pid);
    let remote = calls.iter().position(|c| c == "remote-offer").unwrap();
    let c1 = calls.iter().position(|c| c == "candidate-c1").unwrap();
    let c2 = calls.iter().position(|c| c == "candidate-c2").unwrap();
    assert!(remote < c1 && c1 < c2, "{calls:?}");

    // Local candidates are relayed as they are gathered
    session
        .transports
        .notify(
            &pid,
            TransportEvent::LocalCandidate(IceCandidate {
                candidate: "local-1".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            }),
        )
        .await;
    let relayed = session.signaling.wait_for_relayed(&pid, 2).await;
    assert_eq!(relayed[1].kind(), "candidate");
}

#[tokio::test(start_paused = true)]
async fn test_late_notices_from_replaced_transport_are_ignored() {
    let (mut session, pid) = offering_to("client-1", "pro-1").await;

    // Same identity rejoins on a new transport: the link is replaced
    session
        .signaling
        .push(signaling::participant_joined(&participant_on("pro-1", "pro-1-t2")))
        .await;
    session.signaling.wait_for_relayed(&pid, 2).await;
    assert_eq!(session.transports.transport_count(&pid), 2);

    // The old transport reports its shutdown and a late candidate
    session
        .transports
        .notify_transport(&pid, 0, TransportEvent::StateChanged(TransportState::Closed))
        .await;
    session
        .transports
        .notify_transport(
            &pid,
            0,
            TransportEvent::LocalCandidate(IceCandidate {
                candidate: "stale".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            }),
        )
        .await;
    // Barrier on the same notice queue
    session.transports.remote_stream(&pid).await;

    let first = session
        .wait_for(|e| {
            matches!(
                e,
                SessionEvent::ParticipantLinkLost { .. } | SessionEvent::RemoteStreamAvailable { .. }
            )
        })
        .await;
    assert!(
        matches!(first, SessionEvent::RemoteStreamAvailable { .. }),
        "{first:?}"
    );

    let snapshot = session.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.links.len(), 1);
    assert_eq!(snapshot.links[0].transport_id.as_deref(), Some("pro-1-t2"));
    assert_eq!(snapshot.links[0].state, LinkState::Offering);

    let relayed = session.signaling.relayed_to(&pid);
    assert_eq!(relayed.len(), 2, "{relayed:?}");
    assert!(relayed.iter().all(|s| matches!(s, Signal::Offer { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_reconciles_roster() {
    let mut session = TestSession::spawn("client-1");
    session
        .signaling
        .set_roster(vec![participant("pro-1"), participant("pro-2")]);
    session.join().await.unwrap();

    // While disconnected: pro-1 rejoined on a new transport, pro-2 left,
    // pro-3 arrived
    session.signaling.set_roster(vec![
        participant_on("pro-1", "pro-1-t2"),
        participant("pro-3"),
    ]);
    session.signaling.drop_connection();

    let reconnecting = session
        .wait_for(|e| matches!(e, SessionEvent::SignalingReconnecting { .. }))
        .await;
    assert_eq!(
        reconnecting,
        SessionEvent::SignalingReconnecting {
            attempt: 1,
            delay: Duration::from_secs(1),
        }
    );
    session
        .wait_for(|e| *e == SessionEvent::SignalingRestored)
        .await;
    session
        .wait_for(|e| *e == SessionEvent::ParticipantLeft(ParticipantId::from("pro-2")))
        .await;
    session
        .wait_for(|e| *e == SessionEvent::ParticipantJoined(participant("pro-3")))
        .await;

    let snapshot = session.handle.snapshot().await.unwrap();
    assert!(snapshot.signaling_connected);
    assert_eq!(snapshot.phase, SessionPhase::Active);
    assert_eq!(
        snapshot.participants,
        vec![participant_on("pro-1", "pro-1-t2"), participant("pro-3")]
    );
    let transports: Vec<Option<&str>> = snapshot
        .links
        .iter()
        .map(|l| l.transport_id.as_deref())
        .collect();
    assert_eq!(transports, vec![Some("pro-1-t2"), Some("pro-3-t1")]);

    let created: Vec<String> = session
        .transports
        .created()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(created, vec!["pro-1", "pro-2", "pro-1", "pro-3"]);
    assert_eq!(session.signaling.connect_count(), 2);
    assert_eq!(
        session.signaling.wait_for_count("join-consultation", 2).await.len(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_signaling_lost_after_reconnects_exhausted() {
    let mut config = test_config();
    config.signaling_max_reconnects = 2;
    let mut session = TestSession::spawn_with(
        "client-1",
        config,
        FakeSignaling::with_roster(vec![participant("pro-1")]),
        FakeDevices::new(),
    );
    session.join().await.unwrap();

    session.signaling.refuse_connects(10);
    session.signaling.drop_connection();

    session
        .wait_for(|e| {
            *e == SessionEvent::SignalingReconnecting {
                attempt: 2,
                delay: Duration::from_secs(2),
            }
        })
        .await;
    let lost = session
        .wait_for(|e| matches!(e, SessionEvent::SignalingLost { .. }))
        .await;
    assert_eq!(lost, SessionEvent::SignalingLost { attempts: 2 });
    session.wait_for(|e| *e == SessionEvent::Ended).await;

    // Initial connect plus two refused reconnects
    assert_eq!(session.signaling.connect_count(), 3);
    let pid = ParticipantId::from("pro-1");
    assert_eq!(session.transports.calls_for(&pid).last().unwrap(), "close");

    let snapshot = session.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Ended);
    assert!(snapshot.links.is_empty());
    assert!(snapshot.local_stream.is_none());
}
