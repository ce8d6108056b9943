//! Negotiation across servers: only the routing server touches its SFU,
//! every client negotiates purely through records.

use call_controller::sfu::SfuOperation;
use call_client::TransportPhase;
use call_e2e_tests::{assert_eventually, Settle, TestFleet};
use std::time::Duration;

#[tokio::test]
async fn test_clients_on_two_servers_hear_each_other() {
    let fleet = TestFleet::spawn(2).await.unwrap();
    fleet.admit("alice");
    fleet.admit("bob");

    let mut alice = fleet.server(0).join("alice", "call-1", "tab-a", None).await;
    alice.until_hearing(0).await.unwrap();
    // bob's server never routes this call.
    let mut bob = fleet.server(1).join("bob", "call-1", "tab-b", None).await;

    bob.until_hearing(1).await.unwrap();
    alice.until_hearing(1).await.unwrap();

    let rooms = fleet.rooms("call-1").await;
    assert_eq!(rooms.len(), 1);
    assert_eq!(&rooms[0].routed_server, fleet.server(0).id());

    let routing = fleet.server(0).sfu.stats();
    assert_eq!(routing.routers, 1);
    assert_eq!(routing.transports, 4);
    assert_eq!(routing.connected_transports, 4);
    assert_eq!(routing.producers, 2);
    assert_eq!(routing.consumers, 2);
    assert_eq!(routing.paused_consumers, 0);
    assert_eq!(fleet.server(1).sfu.stats().routers, 0);

    // Every SFU id the client holds came from a record.
    let snapshot = alice.until(|s| s.others.len() == 1).await.unwrap();
    assert_eq!(snapshot.others[0].user().as_str(), "bob");

    bob.leave().await.unwrap();
    alice.until_hearing(0).await.unwrap();
    assert_eventually(Settle::Negotiation, || async {
        let stats = fleet.server(0).sfu.stats();
        stats.producers == 1 && stats.consumers == 0 && stats.transports == 2
    })
    .await
    .unwrap();

    alice.leave().await.unwrap();
    assert!(fleet.rooms("call-1").await.is_empty());
    assert_eventually(Settle::Negotiation, || async {
        fleet.server(0).sfu.stats().routers == 0
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_late_joiner_consumes_existing_producers() {
    let fleet = TestFleet::spawn(1).await.unwrap();
    for user in ["alice", "bob", "carol"] {
        fleet.admit(user);
    }
    let server = fleet.server(0);

    let mut alice = server.join("alice", "call-1", "tab-a", None).await;
    let mut bob = server.join("bob", "call-1", "tab-b", None).await;
    alice.until_hearing(1).await.unwrap();
    bob.until_hearing(1).await.unwrap();

    let mut carol = server.join("carol", "call-1", "tab-c", None).await;
    carol.until_hearing(2).await.unwrap();
    alice.until_hearing(2).await.unwrap();
    bob.until_hearing(2).await.unwrap();
    assert_eq!(server.sfu.stats().consumers, 6);
}

#[tokio::test]
async fn test_failed_sfu_connect_stalls_without_retry() {
    let fleet = TestFleet::spawn(1).await.unwrap();
    fleet.admit("alice");
    let server = fleet.server(0);
    server.sfu.fail(SfuOperation::ConnectTransport);

    let mut alice = server.join("alice", "call-1", "tab-a", None).await;
    let snapshot = alice
        .until(|s| s.send == TransportPhase::ConnectRequested)
        .await
        .unwrap();
    assert_eq!(snapshot.producers, 0);

    // Healing the SFU does not replay the request; the caller bounds the stall.
    server.sfu.heal(SfuOperation::ConnectTransport);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = alice.snapshot.borrow().clone();
    assert_eq!(snapshot.send, TransportPhase::ConnectRequested);
    assert_eq!(server.sfu.stats().connected_transports, 0);

    alice.leave().await.unwrap();
}

#[tokio::test]
async fn test_non_member_is_rejected() {
    let fleet = TestFleet::spawn(1).await.unwrap();
    let mut mallory = fleet.server(0).join("mallory", "call-1", "tab-m", None).await;
    let snapshot = mallory
        .until(|s| matches!(s.status, call_client::ConnectionStatus::Failed(_)))
        .await
        .unwrap();
    assert!(snapshot.last_error.unwrap().contains("Not allowed"));
    assert!(fleet.rooms("call-1").await.is_empty());
}
