//! Hub-side connector role.
//!
//! The silence negotiation and session mechanics live in the shared
//! connector core; this role wires the remaining control messages into the
//! registry and the rendezvous.

use std::sync::Arc;

use quay::{Connector, DataSession, Error, Result, Role};
use quay_proto::Message;
use tracing::{debug, info, warn};

use crate::server::HubState;

/// Role hooks for a connector on the hub side of a peer channel.
pub struct HubRole {
    pub(crate) hub: Arc<HubState>,
}

impl std::fmt::Debug for HubRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubRole").finish_non_exhaustive()
    }
}

impl Role for HubRole {
    async fn on_control(&self, conn: &Connector<Self>, msg: Message) -> Result<()> {
        match msg {
            Message::Register {
                peer_id,
                direct_capable,
            } => {
                if let Some(existing) = conn.registered_id() {
                    warn!(%existing, attempted = %peer_id, "channel already registered, REGISTER dropped");
                    return Ok(());
                }
                match self
                    .hub
                    .registry
                    .register(peer_id.clone(), conn.clone(), direct_capable)
                {
                    Ok(()) => {
                        conn.set_registered(peer_id);
                        conn.set_direct_capable(direct_capable);
                    }
                    // Conflict: rejected with no state change; the channel
                    // itself stays usable.
                    Err(e) => warn!(error = %e, "registration rejected"),
                }
                Ok(())
            }
            Message::Unregister { peer_id } => {
                if conn.registered_id().as_ref() == Some(&peer_id) {
                    self.hub.registry.unregister(&peer_id);
                    self.hub.rendezvous.fail_peer(&peer_id);
                    conn.clear_registered();
                } else {
                    debug!(%peer_id, "UNREGISTER for unknown or foreign id ignored");
                }
                Ok(())
            }
            Message::ConnectRequest { peer_id: target } => {
                let Some(source) = conn.registered_id() else {
                    warn!(%target, "CONNECT_REQUEST before REGISTER dropped");
                    return Ok(());
                };
                self.hub
                    .rendezvous
                    .open_request(&self.hub, source, target)
                    .await;
                Ok(())
            }
            Message::StatusRequest => {
                let peers = self
                    .hub
                    .registry
                    .peers_excluding(conn.registered_id().as_ref());
                conn.send(&Message::StatusReply { peers }).await
            }
            other => {
                warn!(msg = other.name(), "unexpected message on hub channel, dropped");
                Ok(())
            }
        }
    }

    async fn on_session(&self, _conn: &Connector<Self>, session: DataSession) {
        self.hub.rendezvous.session_ready(session).await;
    }

    async fn on_control_resumed(&self, conn: &Connector<Self>) {
        // A request queued during a failed negotiation or a finished
        // session gets a fresh chance; expired ones fall out on pop.
        if conn.has_live_request() {
            debug!("re-negotiating silence for queued request");
            if let Err(e) = conn.ask_for_silence().await {
                warn!(error = %e, "silence renegotiation failed");
            }
        }
    }

    async fn on_closed(&self, conn: &Connector<Self>, reason: &Error) {
        if let Some(id) = conn.registered_id() {
            info!(peer = %id, reason = %reason, "channel lost, cleaning up");
            self.hub.registry.remove_if_same(&id, conn);
            self.hub.rendezvous.fail_peer(&id);
        }
    }
}
