//! Per-connector queue of pending connection requests.

use std::collections::VecDeque;
use std::time::Instant;

use quay_proto::PeerId;
use tracing::debug;

/// Unordered peer pair, the dedup key for connection requests.
///
/// `(alice, bob)` and `(bob, alice)` name the same pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(PeerId, PeerId);

impl PairKey {
    /// Normalizes a pair into its canonical order.
    pub fn new(a: &PeerId, b: &PeerId) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    /// Whether either side of the pair is `id`.
    pub fn involves(&self, id: &PeerId) -> bool {
        &self.0 == id || &self.1 == id
    }
}

/// A rendezvous request waiting for its channel to become silent.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// Peer that initiated the request.
    pub source: PeerId,
    /// Peer the request is aimed at.
    pub target: PeerId,
    /// Instant past which the request is stale and silently discarded.
    pub deadline: Instant,
    /// Whether the target's transport can take the session on a fresh
    /// direct socket instead of the shared channel.
    pub direct: bool,
    /// Whether the wire-level CONNECT_REQUEST for this entry has been
    /// sent. Only meaningful on the peer side, where a request issued
    /// while the channel is silenced is deferred until the control
    /// protocol resumes.
    pub wire_sent: bool,
}

impl ConnectionRequest {
    /// The request's unordered pair key.
    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.source, &self.target)
    }

    /// Whether the deadline has passed.
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Ordered FIFO of pending requests, deduplicated by unordered pair.
///
/// Mutated under the connector's mutex by the pump task, by application
/// tasks issuing outbound requests, and by timer callbacks.
#[derive(Debug, Default)]
pub struct PendingRequests {
    queue: VecDeque<ConnectionRequest>,
}

impl PendingRequests {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a request unless the same unordered pair is already
    /// queued. Returns whether the request was actually added.
    ///
    /// Expired entries are purged first so a stale attempt never blocks a
    /// fresh request for the same pair.
    pub fn push(&mut self, req: ConnectionRequest) -> bool {
        let now = Instant::now();
        self.queue.retain(|q| {
            if q.expired(now) {
                debug!(source = %q.source, target = %q.target, "discarding expired connection request");
                false
            } else {
                true
            }
        });
        let pair = req.pair();
        if self.queue.iter().any(|q| q.pair() == pair) {
            debug!(source = %req.source, target = %req.target, "duplicate connection request ignored");
            return false;
        }
        self.queue.push_back(req);
        true
    }

    /// Pops the first live request, discarding expired entries from the
    /// front. Expired requests are logged and never retried.
    pub fn pop_live(&mut self, now: Instant) -> Option<ConnectionRequest> {
        while let Some(req) = self.queue.pop_front() {
            if req.expired(now) {
                debug!(source = %req.source, target = %req.target, "discarding expired connection request");
                continue;
            }
            return Some(req);
        }
        None
    }

    /// Removes a queued request for the given unordered pair, if any.
    pub fn remove_pair(&mut self, pair: &PairKey) -> Option<ConnectionRequest> {
        let idx = self.queue.iter().position(|q| &q.pair() == pair)?;
        self.queue.remove(idx)
    }

    /// Marks the entry for `pair` as sent on the wire.
    pub fn mark_wire_sent(&mut self, pair: &PairKey) {
        if let Some(req) = self.queue.iter_mut().find(|q| &q.pair() == pair) {
            req.wire_sent = true;
        }
    }

    /// Live entries whose wire request has not been sent yet; marks them
    /// sent and returns their targets. Peer-side resume path.
    pub fn take_unsent(&mut self, now: Instant) -> Vec<PeerId> {
        let mut targets = Vec::new();
        for req in &mut self.queue {
            if !req.wire_sent && !req.expired(now) {
                req.wire_sent = true;
                targets.push(req.target.clone());
            }
        }
        targets
    }

    /// Whether a live entry exists.
    pub fn has_live(&self, now: Instant) -> bool {
        self.queue.iter().any(|q| !q.expired(now))
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued entries, live or not.
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
