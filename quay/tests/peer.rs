//! Peer-surface tests against a scripted hub end: wire-level dedup,
//! deferred requests and status round trips.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use quay::{Peer, PeerConfig, PeerEvent};
use quay_proto::{Message, MessageReader, MessageWriter};
use tokio::io::{duplex, split};
use tokio::time::timeout;

/// A peer joined over a duplex pipe, plus framed access to the hub end.
async fn rig(
    id: &str,
) -> (
    Peer,
    tokio::sync::mpsc::UnboundedReceiver<PeerEvent>,
    MessageReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    MessageWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
) {
    let (peer_stream, hub_stream) = duplex(8192);
    let (hr, hw) = split(hub_stream);
    let mut reader = MessageReader::new(hr);
    let writer = MessageWriter::new(hw);

    let mut cfg = PeerConfig::default();
    cfg.connector.silence_timeout = Duration::from_secs(2);
    let (peer, events) = Peer::join(peer_stream, id, cfg).await.unwrap();

    let hello = reader.next().await.unwrap();
    assert_eq!(
        hello,
        Message::Register {
            peer_id: id.into(),
            direct_capable: false,
        }
    );
    (peer, events, reader, writer)
}

#[tokio::test]
async fn duplicate_pair_sends_exactly_one_wire_request() {
    let (peer, _events, mut reader, _writer) = rig("alice").await;

    peer.open_session("bob").await.unwrap();
    peer.open_session("bob").await.unwrap();

    let first = timeout(Duration::from_secs(2), reader.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        first,
        Message::ConnectRequest {
            peer_id: "bob".into(),
        }
    );

    // Nothing further may arrive for the duplicated pair.
    assert!(
        timeout(Duration::from_millis(300), reader.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn status_round_trips_and_excludes_nobody_client_side() {
    let (peer, _events, mut reader, mut writer) = rig("alice").await;

    let status = tokio::spawn(async move { peer.status().await });
    let req = timeout(Duration::from_secs(2), reader.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(req, Message::StatusRequest);
    writer
        .send(&Message::StatusReply {
            peers: vec!["bob".into(), "carol".into()],
        })
        .await
        .unwrap();

    let peers = status.await.unwrap().unwrap();
    assert_eq!(peers, vec!["bob".into(), "carol".into()]);
}

#[tokio::test]
async fn request_issued_while_silenced_is_deferred_once() {
    let (peer, _events, mut reader, mut writer) = rig("alice").await;

    // Silence the peer with a short window.
    writer
        .send(&Message::SilenceRequest { duration_ms: 300 })
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(2), reader.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::SilenceReply { duration_ms: 300 });

    // A request made now must produce no wire traffic: the peer promised
    // silence.
    peer.open_session("bob").await.unwrap();
    assert!(
        timeout(Duration::from_millis(150), reader.next())
            .await
            .is_err()
    );

    // Once the silent window lapses the deferred request goes out, once.
    let deferred = timeout(Duration::from_secs(2), reader.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        deferred,
        Message::ConnectRequest {
            peer_id: "bob".into(),
        }
    );
    assert!(
        timeout(Duration::from_millis(300), reader.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn unregister_sends_the_release() {
    let (peer, _events, mut reader, _writer) = rig("alice").await;
    peer.unregister().await.unwrap();
    let msg = timeout(Duration::from_secs(2), reader.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        msg,
        Message::Unregister {
            peer_id: "alice".into(),
        }
    );
}

#[tokio::test]
async fn hub_loss_surfaces_as_closed_event() {
    let (_peer, mut events, reader, writer) = rig("alice").await;
    drop((reader, writer));

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, PeerEvent::Closed { .. }));
}
