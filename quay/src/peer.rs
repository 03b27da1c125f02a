//! Peer-side surface: registration, discovery and session requests.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use quay_proto::{Message, PeerId};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::channel::ByteStream;
use crate::connector::{Connector, ConnectorConfig, Phase, Role};
use crate::error::{Error, Result};
use crate::pending::{ConnectionRequest, PairKey};
use crate::session::{DataSession, SessionStream};

/// Configuration for a peer-side connector.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct PeerConfig {
    /// Connector timing and sizing.
    pub connector: ConnectorConfig,
    /// Host the hub is reachable on, used to dial back for direct-socket
    /// sessions. Without it the peer cannot be direct-capable.
    pub hub_host: Option<String>,
    /// Advertise that data sessions may arrive on a freshly dialed socket
    /// instead of the shared channel. Requires `hub_host`.
    pub direct_capable: bool,
}

/// Events delivered to the application, in occurrence order, each exactly
/// once.
#[derive(Debug)]
#[non_exhaustive]
pub enum PeerEvent {
    /// A data session opened; the stream is the raw byte pipe.
    Session(DataSession),
    /// The connector was torn down.
    Closed {
        /// Human-readable cause.
        reason: String,
    },
}

/// Peer-side role hooks.
pub(crate) struct PeerRole {
    events: mpsc::UnboundedSender<PeerEvent>,
    /// Completion for the in-flight status request, if any. Requests are
    /// serialized by `status_op`, so one slot suffices and every reply is
    /// delivered exactly once.
    status_waiter: Mutex<Option<oneshot::Sender<Vec<PeerId>>>>,
    status_op: tokio::sync::Mutex<()>,
    hub_host: Option<String>,
    dial_timeout: Duration,
}

impl Role for PeerRole {
    async fn on_control(&self, conn: &Connector<Self>, msg: Message) -> Result<()> {
        match msg {
            Message::StatusReply { peers } => {
                let waiter = self.take_status_waiter();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(peers);
                    }
                    None => warn!("unsolicited STATUS_REPLY dropped"),
                }
                Ok(())
            }
            Message::NewSocketRequest { peer_id, port } => {
                self.dial_direct(conn, peer_id, port);
                Ok(())
            }
            other => {
                // Hub-bound messages echoed at a peer: log and drop.
                warn!(msg = other.name(), "unexpected message on peer channel, dropped");
                Ok(())
            }
        }
    }

    async fn on_session(&self, _conn: &Connector<Self>, session: DataSession) {
        let _ = self.events.send(PeerEvent::Session(session));
    }

    async fn on_control_resumed(&self, conn: &Connector<Self>) {
        // Requests issued while the channel was silenced or in a session
        // were queued without their wire message; send those now.
        let targets = {
            #[allow(clippy::unwrap_used)]
            let mut pending = conn.pending().lock().unwrap();
            pending.take_unsent(Instant::now())
        };
        for target in targets {
            debug!(%target, "sending deferred connection request");
            if let Err(e) = conn
                .send(&Message::ConnectRequest {
                    peer_id: target.clone(),
                })
                .await
            {
                warn!(%target, error = %e, "deferred connection request failed");
            }
        }
    }

    async fn on_closed(&self, _conn: &Connector<Self>, reason: &Error) {
        // Unblock a status() caller that will never get its reply.
        self.take_status_waiter();
        let _ = self.events.send(PeerEvent::Closed {
            reason: reason.to_string(),
        });
    }
}

impl PeerRole {
    #[allow(clippy::unwrap_used)]
    fn take_status_waiter(&self) -> Option<oneshot::Sender<Vec<PeerId>>> {
        self.status_waiter.lock().unwrap().take()
    }

    #[allow(clippy::unwrap_used)]
    fn set_status_waiter(&self, tx: oneshot::Sender<Vec<PeerId>>) {
        *self.status_waiter.lock().unwrap() = Some(tx);
    }

    /// Dials the hub host back for a direct-socket session and delivers it
    /// as an ordinary session event. Runs detached so the pump is never
    /// blocked on connection establishment.
    fn dial_direct(&self, conn: &Connector<Self>, source: PeerId, port: u16) {
        let Some(host) = self.hub_host.clone() else {
            warn!("NEW_SOCKET_REQUEST but no hub host configured, dropped");
            return;
        };
        let Some(own_id) = conn.registered_id() else {
            warn!("NEW_SOCKET_REQUEST before registration, dropped");
            return;
        };
        let events = self.events.clone();
        let timeout = self.dial_timeout;
        tokio::spawn(async move {
            let dial = TcpStream::connect((host.as_str(), port));
            match tokio::time::timeout(timeout, dial).await {
                Ok(Ok(stream)) => {
                    debug!(%source, port, "direct socket dialed");
                    let _ = events.send(PeerEvent::Session(DataSession {
                        source,
                        target: own_id,
                        stream: SessionStream::new(stream),
                    }));
                }
                Ok(Err(e)) => warn!(%source, port, error = %e, "direct socket dial failed"),
                Err(_) => warn!(%source, port, "direct socket dial timed out"),
            }
        });
    }
}

/// A registered peer on a hub.
///
/// Wraps one connector over one physical channel. Data sessions and
/// teardown arrive on the event receiver returned by [`join`](Peer::join).
#[derive(Debug)]
pub struct Peer {
    conn: Connector<PeerRole>,
    id: PeerId,
}

impl Peer {
    /// Registers on a hub over an already-open duplex channel.
    ///
    /// Transport provisioning is the caller's business: a TCP connection in
    /// production, an in-process duplex pipe in tests.
    pub async fn join(
        stream: impl ByteStream,
        id: impl Into<PeerId>,
        config: PeerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>)> {
        let id = id.into();
        let direct = config.direct_capable && config.hub_host.is_some();
        if config.direct_capable && !direct {
            warn!("direct_capable requested without hub_host, disabled");
        }
        let (events, rx) = mpsc::unbounded_channel();
        let role = PeerRole {
            events,
            status_waiter: Mutex::new(None),
            status_op: tokio::sync::Mutex::new(()),
            hub_host: config.hub_host.clone(),
            dial_timeout: config.connector.silence_timeout,
        };
        let conn = Connector::spawn(stream, role, config.connector);
        conn.set_registered(id.clone());
        conn.set_direct_capable(direct);
        conn.send(&Message::Register {
            peer_id: id.clone(),
            direct_capable: direct,
        })
        .await?;
        Ok((Self { conn, id }, rx))
    }

    /// This peer's id.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Current connector phase; mostly useful in tests and diagnostics.
    pub fn phase(&self) -> Phase {
        self.conn.phase()
    }

    /// Requests a data session with `target`.
    ///
    /// The request is queued with a deadline; a second request for the
    /// same unordered pair while one is outstanding produces no further
    /// wire traffic. If the channel is currently silenced the wire message
    /// is deferred until the control protocol resumes. The session itself
    /// arrives later as a [`PeerEvent::Session`].
    pub async fn open_session(&self, target: impl Into<PeerId>) -> Result<()> {
        let target = target.into();
        if target == self.id {
            return Err(Error::Protocol(
                "cannot request a session with oneself".into(),
            ));
        }
        let deadline = Instant::now() + self.conn.config().request_timeout;
        let req = ConnectionRequest {
            source: self.id.clone(),
            target: target.clone(),
            deadline,
            direct: false,
            wire_sent: false,
        };
        let send_now = {
            #[allow(clippy::unwrap_used)]
            let mut pending = self.conn.pending().lock().unwrap();
            if !pending.push(req) {
                return Ok(());
            }
            // Mark before sending so a concurrent resume cannot send a
            // second copy.
            if self.conn.phase() == Phase::Control {
                pending.mark_wire_sent(&PairKey::new(&self.id, &target));
                true
            } else {
                false
            }
        };
        if send_now {
            self.conn
                .send(&Message::ConnectRequest {
                    peer_id: target.clone(),
                })
                .await?;
            debug!(%target, "connection request sent");
        } else {
            debug!(%target, "connection request queued until control resumes");
        }
        Ok(())
    }

    /// Asks the hub for the set of registered peers (never including this
    /// one).
    ///
    /// Errors with [`Error::ChannelBusy`] while a data session owns the
    /// channel.
    pub async fn status(&self) -> Result<Vec<PeerId>> {
        let _serialized = self.conn.role().status_op.lock().await;
        let (tx, rx) = oneshot::channel();
        self.conn.role().set_status_waiter(tx);
        let sent = self.conn.send_if_control(&Message::StatusRequest).await?;
        if !sent {
            self.conn.role().take_status_waiter();
            return Err(Error::ChannelBusy);
        }
        rx.await.map_err(|_| Error::Closed)
    }

    /// Releases this peer's registration on the hub.
    pub async fn unregister(&self) -> Result<()> {
        let sent = self
            .conn
            .send_if_control(&Message::Unregister {
                peer_id: self.id.clone(),
            })
            .await?;
        if sent { Ok(()) } else { Err(Error::ChannelBusy) }
    }

    /// Unregisters (best effort) and closes the connector.
    pub async fn close(self) {
        let _ = self.unregister().await;
        self.conn.shutdown();
    }
}
