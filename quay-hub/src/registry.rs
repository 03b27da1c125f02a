//! Peer directory: `PeerId` → connector.

use std::collections::HashMap;
use std::sync::Mutex;

use quay::{Connector, Error, PeerId, Result};
use tracing::{debug, info};

use crate::connector::HubRole;

/// A registered peer's directory entry.
#[derive(Clone)]
pub(crate) struct RegistryEntry {
    /// The hub-side connector of the peer's channel.
    pub conn: Connector<HubRole>,
    /// Whether the peer advertised direct-socket capability.
    pub direct: bool,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("direct", &self.direct)
            .finish_non_exhaustive()
    }
}

/// The hub's peer directory.
///
/// Entries appear on REGISTER and vanish on UNREGISTER or channel loss; a
/// peer id maps to at most one live connector, so a duplicate REGISTER is
/// rejected with an explicit error and no state change.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    peers: Mutex<HashMap<PeerId, RegistryEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer, rejecting an id that is already live.
    pub fn register(&self, id: PeerId, conn: Connector<HubRole>, direct: bool) -> Result<()> {
        let mut peers = self.lock();
        if peers.contains_key(&id) {
            return Err(Error::DuplicateRegistration(id));
        }
        info!(peer = %id, direct, "peer registered");
        peers.insert(id, RegistryEntry { conn, direct });
        Ok(())
    }

    /// Removes a registration. Unknown ids are a no-op.
    pub fn unregister(&self, id: &PeerId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            info!(peer = %id, "peer unregistered");
        } else {
            debug!(peer = %id, "UNREGISTER for unknown id ignored");
        }
        removed
    }

    /// Removes `id` only if it still maps to the given connector.
    ///
    /// Channel-loss cleanup must not evict a fresh registration that
    /// reclaimed the id in the meantime.
    pub fn remove_if_same(&self, id: &PeerId, conn: &Connector<HubRole>) -> bool {
        let mut peers = self.lock();
        match peers.get(id) {
            Some(entry) if entry.conn.same_channel(conn) => {
                peers.remove(id);
                info!(peer = %id, "registration removed after channel loss");
                true
            }
            _ => false,
        }
    }

    /// Looks a peer up.
    pub fn entry(&self, id: &PeerId) -> Option<RegistryEntry> {
        self.lock().get(id).cloned()
    }

    /// All registered ids except `me`, sorted for deterministic replies.
    pub fn peers_excluding(&self, me: Option<&PeerId>) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .lock()
            .keys()
            .filter(|id| Some(*id) != me)
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, RegistryEntry>> {
        self.peers.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::HubConfig;
    use crate::server::Hub;

    /// Two hub-side connectors over throwaway in-process channels.
    fn two_connectors() -> (Connector<HubRole>, Connector<HubRole>) {
        let hub = Hub::new(HubConfig::default());
        let (a, _keep_a) = tokio::io::duplex(64);
        let (b, _keep_b) = tokio::io::duplex(64);
        // The far ends are dropped; these connectors only serve as
        // registry handles here.
        (hub.accept(a), hub.accept(b))
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let registry = Registry::new();
        let (c1, c2) = two_connectors();
        registry.register("alice".into(), c1, false).unwrap();
        let err = registry.register("alice".into(), c2, false).unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unregister_unknown_is_noop() {
        let registry = Registry::new();
        assert!(!registry.unregister(&"ghost".into()));
    }

    #[tokio::test]
    async fn status_excludes_caller() {
        let registry = Registry::new();
        let (c1, c2) = two_connectors();
        registry.register("alice".into(), c1, false).unwrap();
        registry.register("bob".into(), c2, false).unwrap();
        let me: PeerId = "alice".into();
        assert_eq!(registry.peers_excluding(Some(&me)), vec![PeerId::new("bob")]);
        assert_eq!(registry.peers_excluding(None).len(), 2);
    }

    #[tokio::test]
    async fn remove_if_same_spares_a_reclaimed_id() {
        let registry = Registry::new();
        let (c1, c2) = two_connectors();
        registry.register("alice".into(), c1.clone(), false).unwrap();
        // Old channel's cleanup must not evict the new owner.
        registry.unregister(&"alice".into());
        registry.register("alice".into(), c2, false).unwrap();
        assert!(!registry.remove_if_same(&"alice".into(), &c1));
        assert_eq!(registry.len(), 1);
    }
}
