//! End-to-end rendezvous scenarios: registration, discovery, matching,
//! bridging and post-session recovery, all over in-process channels.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use quay::{Peer, PeerConfig, PeerEvent};
use quay_hub::{Hub, HubConfig};
use quay_proto::{Message, MessageWriter, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex, split};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn hub_cfg() -> HubConfig {
    let mut cfg = HubConfig::default();
    cfg.silence_duration_ms = 2_000;
    cfg.silence_timeout_ms = 2_000;
    cfg.max_idle_ms = 300;
    cfg.request_timeout_ms = 5_000;
    cfg.resync_timeout_ms = 10_000;
    cfg
}

fn peer_cfg() -> PeerConfig {
    let mut cfg = PeerConfig::default();
    cfg.connector.resync.timeout = Duration::from_secs(10);
    cfg.connector.resync.settle_min = Duration::from_millis(10);
    cfg.connector.resync.settle_max = Duration::from_millis(200);
    cfg
}

async fn join(hub: &Hub, id: &str) -> (Peer, UnboundedReceiver<PeerEvent>) {
    let (peer_stream, hub_stream) = duplex(16 * 1024);
    hub.accept(hub_stream);
    Peer::join(peer_stream, id, peer_cfg()).await.unwrap()
}

async fn expect_session(events: &mut UnboundedReceiver<PeerEvent>) -> quay::DataSession {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no session event in time")
            .expect("event stream ended");
        if let PeerEvent::Session(session) = event {
            return session;
        }
    }
}

/// Reads until end-of-stream, tolerating stray resync markers trailing the
/// payload after the far side closes.
async fn drain_to_eof(stream: &mut quay::SessionStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[tokio::test]
async fn status_excludes_the_caller() {
    let hub = Hub::new(hub_cfg());
    let (alice, _alice_events) = join(&hub, "alice").await;
    let (_bob, _bob_events) = join(&hub, "bob").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let peers = alice.status().await.unwrap();
    assert_eq!(peers, vec![PeerId::new("bob")]);
}

#[tokio::test]
async fn unregister_of_unknown_id_is_a_noop() {
    let hub = Hub::new(hub_cfg());
    let (alice, _alice_events) = join(&hub, "alice").await;

    // A raw channel releases an id nobody registered; the hub must shrug.
    let (ghost_stream, hub_stream) = duplex(4096);
    hub.accept(hub_stream);
    let (_gr, gw) = split(ghost_stream);
    let mut ghost = MessageWriter::new(gw);
    ghost
        .send(&Message::Unregister {
            peer_id: "ghost".into(),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hub.peer_count(), 1);
    assert!(alice.status().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_register_is_rejected_without_state_change() {
    let hub = Hub::new(hub_cfg());
    let (_alice, _alice_events) = join(&hub, "alice").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.peer_count(), 1);

    // A second channel claims the same id; the registration is refused and
    // the first owner keeps it.
    let (imposter_stream, hub_stream) = duplex(4096);
    hub.accept(hub_stream);
    let (_ir, iw) = split(imposter_stream);
    let mut imposter = MessageWriter::new(iw);
    imposter
        .send(&Message::Register {
            peer_id: "alice".into(),
            direct_capable: false,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hub.peer_count(), 1);
}

#[tokio::test]
async fn end_to_end_session_between_alice_and_bob() {
    let hub = Hub::new(hub_cfg());
    let (alice, mut alice_events) = join(&hub, "alice").await;
    let (bob, mut bob_events) = join(&hub, "bob").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.open_session("bob").await.unwrap();

    let mut alice_session = expect_session(&mut alice_events).await;
    let mut bob_session = expect_session(&mut bob_events).await;
    assert_eq!(alice_session.source, "alice".into());
    assert_eq!(alice_session.target, "bob".into());
    assert_eq!(bob_session.remote(bob.id()), &PeerId::new("alice"));

    // Verbatim bytes, both directions, across the bridged channels.
    alice_session
        .stream
        .write_all(b"hello from alice")
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    timeout(Duration::from_secs(5), bob_session.stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello from alice");

    bob_session.stream.write_all(b"hi back").await.unwrap();
    let mut buf = [0u8; 7];
    timeout(
        Duration::from_secs(5),
        alice_session.stream.read_exact(&mut buf),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(&buf, b"hi back");

    // Closing alice's end cascades: bob's stream ends within the idle
    // windows.
    drop(alice_session);
    timeout(Duration::from_secs(8), drain_to_eof(&mut bob_session.stream))
        .await
        .unwrap();
    drop(bob_session);

    // Both channels resynchronize; the control protocol works again and
    // reflects bob's departure.
    tokio::time::sleep(Duration::from_secs(2)).await;
    bob.unregister().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let peers = alice.status().await.unwrap();
    assert!(peers.is_empty(), "expected no peers, got {peers:?}");
}

#[tokio::test]
async fn unknown_target_is_dropped_silently_and_connector_survives() {
    let hub = Hub::new(hub_cfg());
    let (alice, mut alice_events) = join(&hub, "alice").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.open_session("carol").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // No session materializes and no teardown happens.
    assert!(alice_events.try_recv().is_err());
    assert!(alice.status().await.unwrap().is_empty());
}

#[tokio::test]
async fn simultaneous_cross_requests_yield_one_session() {
    let hub = Hub::new(hub_cfg());
    let (alice, mut alice_events) = join(&hub, "alice").await;
    let (bob, mut bob_events) = join(&hub, "bob").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.open_session("bob").await.unwrap();
    bob.open_session("alice").await.unwrap();

    let alice_session = expect_session(&mut alice_events).await;
    let bob_session = expect_session(&mut bob_events).await;

    // Exactly one session per peer: no second event shows up.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(alice_events.try_recv().is_err());
    assert!(bob_events.try_recv().is_err());
    drop((alice_session, bob_session));
}
