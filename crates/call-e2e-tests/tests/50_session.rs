//! The participant's session state machine against a live server.

use call_client::{CallIdentity, CallPhase, ClientError, ConnectionStatus};
use call_e2e_tests::{assert_eventually, snapshot_eventually, Settle, TestFleet, HUNT};
use common::types::{CallId, HuntId, TabId};

fn identity(call: &str) -> Option<CallIdentity> {
    Some(CallIdentity {
        hunt: HuntId::from(HUNT),
        call: CallId::from(call),
        tab: TabId::from("tab-1"),
    })
}

#[tokio::test]
async fn test_session_joins_and_leaves() {
    let fleet = TestFleet::spawn(1).await.unwrap();
    fleet.admit("alice");
    let (mut session, capture, device) = fleet.server(0).session("alice");
    let busy = session.busy();

    session.set_identity(identity("call-1")).await;
    session.join(None).await.unwrap();
    assert_eq!(session.phase(), CallPhase::InCall);
    assert!(*busy.borrow());

    let mut snapshot = session.connection().unwrap().snapshot();
    snapshot_eventually(&mut snapshot, Settle::Negotiation, |s| s.producers == 1)
        .await
        .unwrap();
    assert_eq!(fleet.peers("call-1").await.len(), 1);

    session.leave().await.unwrap();
    assert_eq!(session.phase(), CallPhase::NotInCall);
    assert!(!*busy.borrow());
    assert_eq!(capture.live_streams(), 0);
    assert_eq!(device.stats().transports, 0);
    assert!(fleet.rooms("call-1").await.is_empty());
}

#[tokio::test]
async fn test_media_error_leaves_server_untouched() {
    let fleet = TestFleet::spawn(1).await.unwrap();
    fleet.admit("alice");
    let (mut session, capture, _device) = fleet.server(0).session("alice");
    capture.deny("NotAllowedError");

    session.set_identity(identity("call-1")).await;
    let err = session.join(None).await.unwrap_err();
    assert!(matches!(err, ClientError::Capture(_)));
    assert!(err.is_retryable());
    assert!(matches!(session.phase(), CallPhase::MediaError { .. }));
    assert!(!*session.busy().borrow());
    assert!(fleet.rooms("call-1").await.is_empty());
}

#[tokio::test]
async fn test_switching_calls_leaves_the_old_one() {
    let fleet = TestFleet::spawn(1).await.unwrap();
    fleet.admit("alice");
    let (mut session, _capture, _device) = fleet.server(0).session("alice");

    session.set_identity(identity("call-1")).await;
    session.join(None).await.unwrap();
    assert_eventually(Settle::Negotiation, || async {
        fleet.peers("call-1").await.len() == 1
    })
    .await
    .unwrap();

    session.set_identity(identity("call-2")).await;
    assert_eq!(session.phase(), CallPhase::NotInCall);
    assert!(fleet.rooms("call-1").await.is_empty());

    session.join(None).await.unwrap();
    assert_eventually(Settle::Negotiation, || async {
        fleet.peers("call-2").await.len() == 1
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unauthorized_join_fails_session() {
    let fleet = TestFleet::spawn(1).await.unwrap();
    let (mut session, capture, _device) = fleet.server(0).session("mallory");

    session.set_identity(identity("call-1")).await;
    session.join(None).await.unwrap();
    let mut snapshot = session.connection().unwrap().snapshot();
    snapshot_eventually(&mut snapshot, Settle::Negotiation, |s| {
        matches!(s.status, ConnectionStatus::Failed(_))
    })
    .await
    .unwrap();

    session.refresh().await;
    assert!(matches!(session.phase(), CallPhase::Failed { .. }));
    assert!(!*session.busy().borrow());
    assert_eq!(capture.live_streams(), 0);
}
