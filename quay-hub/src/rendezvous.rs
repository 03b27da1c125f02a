//! Request matching and full-duplex session bridging.
//!
//! The hub never frames or interprets session bytes. For shared-channel
//! peers it relays only the negotiation: each side's connector silences and
//! clears its own channel, reports its raw session stream here, and once
//! both streams of a pair have arrived they are bridged byte-for-byte. The
//! bridge lives exactly as long as both sides' idle timers permit; either
//! session ending starves the other of its pipe and tears everything down
//! gracefully.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use quay::{ConnectionRequest, DataSession, DeadlineTimer, PairKey, PeerId, SessionStream};
use quay_proto::Message;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::registry::RegistryEntry;
use crate::server::HubState;

/// A pair waiting for its two session streams.
struct PendingMatch {
    /// The first stream to arrive, if one has.
    first: Option<SessionStream>,
    /// Expires the record if the match never completes; failed attempts
    /// are always cleaned up.
    _expiry: DeadlineTimer,
}

impl std::fmt::Debug for PendingMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMatch")
            .field("first_arrived", &self.first.is_some())
            .finish_non_exhaustive()
    }
}

/// The hub's match table.
#[derive(Debug, Default)]
pub(crate) struct Rendezvous {
    matches: Mutex<HashMap<PairKey, PendingMatch>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles a CONNECT_REQUEST from `source` naming `target`.
    ///
    /// Unknown targets are dropped silently (the peer may retry). A pair
    /// that is already pending is not re-requested, which collapses
    /// near-simultaneous A→B and B→A requests into one session.
    pub async fn open_request(&self, hub: &Arc<HubState>, source: PeerId, target: PeerId) {
        let Some(src_entry) = hub.registry.entry(&source) else {
            warn!(%source, "request from unregistered source dropped");
            return;
        };
        let Some(tgt_entry) = hub.registry.entry(&target) else {
            debug!(%source, %target, "request for unknown target dropped");
            return;
        };

        let pair = PairKey::new(&source, &target);
        {
            let mut matches = self.lock();
            if matches.contains_key(&pair) {
                debug!(%source, %target, "pair already pending, request collapsed");
                return;
            }
            let expiry = {
                let hub = Arc::clone(hub);
                let pair = pair.clone();
                DeadlineTimer::schedule(hub.cfg.request_timeout(), async move {
                    hub.rendezvous.expire(&pair);
                })
            };
            matches.insert(
                pair.clone(),
                PendingMatch {
                    first: None,
                    _expiry: expiry,
                },
            );
        }
        info!(%source, %target, "connection request open");

        let request = ConnectionRequest {
            source: source.clone(),
            target: target.clone(),
            deadline: Instant::now() + hub.cfg.request_timeout(),
            direct: tgt_entry.direct,
            wire_sent: true,
        };

        let direct_ok = tgt_entry.direct && hub.cfg.direct_bind.is_some();
        if direct_ok {
            // The target's shared channel never leaves the control
            // protocol; its session arrives on a freshly dialed socket.
            self.open_direct(hub, &pair, &source, &tgt_entry).await;
        } else if let Err(e) = tgt_entry.conn.enqueue_request(request.clone()).await {
            warn!(%target, error = %e, "target connector refused request");
            self.expire(&pair);
            return;
        }

        if let Err(e) = src_entry.conn.enqueue_request(request).await {
            warn!(%source, error = %e, "source connector refused request");
            self.expire(&pair);
        }
    }

    /// Allocates a fresh listening socket, tells the direct-capable target
    /// to dial it, and feeds the accepted stream into the match.
    async fn open_direct(
        &self,
        hub: &Arc<HubState>,
        pair: &PairKey,
        source: &PeerId,
        target: &RegistryEntry,
    ) {
        let Some(bind_ip) = hub.cfg.direct_bind else {
            return;
        };
        let listener = match TcpListener::bind((bind_ip, 0)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "direct socket allocation failed");
                self.expire(pair);
                return;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(error = %e, "direct socket has no local address");
                self.expire(pair);
                return;
            }
        };
        if let Err(e) = target
            .conn
            .send(&Message::NewSocketRequest {
                peer_id: source.clone(),
                port,
            })
            .await
        {
            warn!(port, error = %e, "NEW_SOCKET_REQUEST failed");
            self.expire(pair);
            return;
        }
        debug!(port, "direct socket offered");

        let hub = Arc::clone(hub);
        let pair = pair.clone();
        let accept_timeout = hub.cfg.direct_accept_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(accept_timeout, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    debug!(%addr, "direct socket dialed back");
                    hub.rendezvous
                        .offer(&pair, SessionStream::new(stream))
                        .await;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "direct socket accept failed");
                    hub.rendezvous.expire(&pair);
                }
                Err(_) => {
                    warn!("direct socket never dialed back");
                    hub.rendezvous.expire(&pair);
                }
            }
        });
    }

    /// A hub-side connector cleared its channel and reports the session.
    pub async fn session_ready(&self, session: DataSession) {
        let pair = PairKey::new(&session.source, &session.target);
        self.offer(&pair, session.stream).await;
    }

    /// Feeds one raw stream into a pending match; the second arrival
    /// starts the bridge.
    async fn offer(&self, pair: &PairKey, stream: SessionStream) {
        let both = {
            let mut matches = self.lock();
            match matches.get_mut(pair) {
                None => {
                    // The record expired or a party died; dropping the
                    // stream lets the reporting side's session end.
                    debug!(?pair, "session stream with no pending match dropped");
                    return;
                }
                Some(entry) => match entry.first.take() {
                    None => {
                        entry.first = Some(stream);
                        None
                    }
                    Some(first) => {
                        matches.remove(pair);
                        Some((first, stream))
                    }
                },
            }
        };
        if let Some((a, b)) = both {
            info!(?pair, "bridging data session");
            tokio::spawn(bridge(a, b));
        }
    }

    /// Drops a pending record; any stored stream goes with it, which the
    /// owning session observes as its consumer closing.
    pub fn expire(&self, pair: &PairKey) {
        if self.lock().remove(pair).is_some() {
            warn!(?pair, "connection attempt abandoned");
        }
    }

    /// Removes every pending record naming `id`. Run when a connector
    /// closes so failed attempts never linger.
    pub fn fail_peer(&self, id: &PeerId) {
        let mut matches = self.lock();
        let stale: Vec<PairKey> = matches
            .keys()
            .filter(|pair| pair.involves(id))
            .cloned()
            .collect();
        for pair in stale {
            matches.remove(&pair);
            warn!(?pair, peer = %id, "pending match dropped with its peer");
        }
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PairKey, PendingMatch>> {
        self.matches.lock().unwrap()
    }
}

/// Copies bytes between the two raw streams until either side ends.
async fn bridge(mut a: SessionStream, mut b: SessionStream) {
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((ab, ba)) => debug!(forward = ab, backward = ba, "bridge closed"),
        Err(e) => debug!(error = %e, "bridge failed"),
    }
}
