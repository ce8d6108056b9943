//! Mute/deafen policy end to end.

use call_client::{ClientError, ConnectionStatus};
use call_controller::errors::CallError;
use call_e2e_tests::{assert_eventually, Settle, TestFleet};
use call_protocol::{DesiredPeerState, PeerState};
use common::types::UserId;

#[tokio::test]
async fn test_remote_mute_is_acknowledged_and_blocks_unmute() {
    let fleet = TestFleet::spawn(2).await.unwrap();
    fleet.admit("alice");
    fleet.admit("bob");

    let mut alice = fleet.server(0).join("alice", "call-1", "tab-a", None).await;
    let mut bob = fleet.server(1).join("bob", "call-1", "tab-b", None).await;
    let alice_peer = alice.until_hearing(1).await.unwrap().peer.unwrap();
    bob.until_hearing(1).await.unwrap();

    fleet
        .server(1)
        .service
        .remote_mute(&UserId::from("bob"), &alice_peer.peer_id())
        .await
        .unwrap();

    let snapshot = alice
        .until(|s| s.remote_mute_notice.is_some() && s.paused_producers == 1)
        .await
        .unwrap();
    assert_eq!(snapshot.remote_mute_notice, Some(UserId::from("bob")));

    // The client acknowledges; the server clears the flag and keeps the mute.
    assert_eventually(Settle::Negotiation, || async {
        fleet
            .peers("call-1")
            .await
            .iter()
            .any(|p| p.meta.id == alice_peer.meta.id && p.remote_muted_by.is_none() && p.muted)
    })
    .await
    .unwrap();

    // Remote-muting an already muted peer conflicts.
    let err = fleet
        .server(1)
        .service
        .remote_mute(&UserId::from("bob"), &alice_peer.peer_id())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Conflict(_)));

    assert_eq!(
        alice.connection.set_muted(false).await,
        Err(ClientError::RemoteMuteNotDismissed)
    );
    alice.connection.dismiss_remote_mute().await.unwrap();
    alice.connection.set_muted(false).await.unwrap();
    alice
        .until(|s| s.paused_producers == 0 && s.remote_mute_notice.is_none())
        .await
        .unwrap();
    assert_eventually(Settle::Negotiation, || async {
        fleet
            .peers("call-1")
            .await
            .iter()
            .any(|p| p.meta.id == alice_peer.meta.id && !p.muted)
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_cannot_remote_mute_self_or_as_non_member() {
    let fleet = TestFleet::spawn(1).await.unwrap();
    fleet.admit("alice");
    let mut alice = fleet.server(0).join("alice", "call-1", "tab-a", None).await;
    let peer = alice.until(|s| s.peer.is_some()).await.unwrap().peer.unwrap();
    let service = &fleet.server(0).service;

    let err = service
        .remote_mute(&UserId::from("alice"), &peer.peer_id())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::PermissionDenied(_)));

    let err = service
        .remote_mute(&UserId::from("mallory"), &peer.peer_id())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotAMember(_)));
}

#[tokio::test]
async fn test_deafened_reconnect_keeps_hidden_mute_bit() {
    let fleet = TestFleet::spawn(2).await.unwrap();
    fleet.admit("alice");

    let mut first = fleet.server(0).join("alice", "call-1", "tab-a", None).await;
    first.until_hearing(0).await.unwrap();
    first.connection.set_muted(true).await.unwrap();
    first.connection.set_deafened(true).await.unwrap();
    assert_eventually(Settle::Negotiation, || async {
        fleet
            .peers("call-1")
            .await
            .first()
            .is_some_and(|p| p.bits() == DesiredPeerState::new(true, true))
    })
    .await
    .unwrap();

    // The tab reconnects to another server without stating a preference.
    let mut second = fleet.server(1).join("alice", "call-1", "tab-a", None).await;
    let snapshot = second.until(|s| s.producers == 1).await.unwrap();
    assert_eq!(snapshot.effective, Some(PeerState::Deafened));
    assert_eq!(snapshot.desired, DesiredPeerState::new(true, true));
    first
        .until(|s| matches!(s.status, ConnectionStatus::Failed(_)))
        .await
        .unwrap();

    // Undeafening reveals the explicit mute.
    second.connection.set_deafened(false).await.unwrap();
    let snapshot = second.until(|s| !s.desired.deafened).await.unwrap();
    assert_eq!(snapshot.effective, Some(PeerState::Muted));
    assert_eq!(snapshot.paused_producers, 1);
}

#[tokio::test]
async fn test_client_preference_wins_over_resumed_state() {
    let fleet = TestFleet::spawn(1).await.unwrap();
    fleet.admit("alice");

    let mut first = fleet.server(0).join("alice", "call-1", "tab-a", None).await;
    first.until_hearing(0).await.unwrap();
    first.connection.set_deafened(true).await.unwrap();
    first
        .until(|s| s.peer.as_ref().is_some_and(|p| p.deafened))
        .await
        .unwrap();

    let mut second = fleet
        .server(0)
        .join(
            "alice",
            "call-1",
            "tab-a",
            Some(DesiredPeerState::new(false, false)),
        )
        .await;
    let snapshot = second.until(|s| s.producers == 1).await.unwrap();
    assert_eq!(snapshot.effective, Some(PeerState::Active));
    assert_eq!(snapshot.paused_producers, 0);
    let peers = fleet.peers("call-1").await;
    assert_eq!(peers.len(), 1);
    assert!(!peers[0].deafened);
}
