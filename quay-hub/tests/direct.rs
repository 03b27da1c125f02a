//! Direct-socket rendezvous: a direct-capable target takes its session on
//! a freshly dialed TCP socket while its control channel stays untouched.

#![allow(clippy::unwrap_used)]

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use quay::{Peer, PeerConfig, PeerEvent, Phase};
use quay_hub::{Hub, HubConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn hub_cfg() -> HubConfig {
    let mut cfg = HubConfig::default();
    cfg.direct_bind = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    cfg.direct_accept_timeout_ms = 5_000;
    cfg.silence_duration_ms = 2_000;
    cfg.silence_timeout_ms = 2_000;
    cfg.max_idle_ms = 400;
    cfg.request_timeout_ms = 5_000;
    cfg.resync_timeout_ms = 10_000;
    cfg
}

async fn join(hub: &Hub, id: &str, direct: bool) -> (Peer, UnboundedReceiver<PeerEvent>) {
    let (peer_stream, hub_stream) = duplex(16 * 1024);
    hub.accept(hub_stream);
    let mut cfg = PeerConfig::default();
    cfg.connector.resync.timeout = Duration::from_secs(10);
    if direct {
        cfg.hub_host = Some("127.0.0.1".to_owned());
        cfg.direct_capable = true;
    }
    Peer::join(peer_stream, id, cfg).await.unwrap()
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

#[tokio::test]
async fn direct_capable_target_gets_a_fresh_socket() {
    let hub = Hub::new(hub_cfg());
    let (alice, mut alice_events) = join(&hub, "alice", false).await;
    let (bob, mut bob_events) = join(&hub, "bob", true).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.open_session("bob").await.unwrap();

    let mut alice_session = expect_session(&mut alice_events).await;
    let mut bob_session = expect_session(&mut bob_events).await;
    assert_eq!(bob_session.source, "alice".into());
    assert_eq!(bob_session.target, "bob".into());

    // Bob's shared channel never left the control protocol: the session
    // rides the dialed socket, so bob can still talk to the hub mid-session.
    assert_eq!(bob.phase(), Phase::Control);
    let peers = bob.status().await.unwrap();
    assert_eq!(peers, vec!["alice".into()]);

    alice_session.stream.write_all(b"over the top").await.unwrap();
    let mut buf = [0u8; 12];
    timeout(Duration::from_secs(5), bob_session.stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"over the top");

    bob_session.stream.write_all(b"roger").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(
        Duration::from_secs(5),
        alice_session.stream.read_exact(&mut buf),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(&buf, b"roger");

    drop((alice_session, bob_session));
}

#[tokio::test]
async fn direct_path_disabled_without_bind_address() {
    let mut cfg = hub_cfg();
    cfg.direct_bind = None;
    let hub = Hub::new(cfg);
    let (alice, mut alice_events) = join(&hub, "alice", false).await;
    let (_bob, mut bob_events) = join(&hub, "bob", true).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // With no direct bind address the hub falls back to the shared-channel
    // path even for a direct-capable target.
    alice.open_session("bob").await.unwrap();
    let alice_session = expect_session(&mut alice_events).await;
    let bob_session = expect_session(&mut bob_events).await;
    drop((alice_session, bob_session));
}
