//! Hub server: channel accept loop and shared state.

use std::sync::Arc;

use quay::{ByteStream, Connector, ConnectorConfig};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::connector::HubRole;
use crate::registry::Registry;
use crate::rendezvous::Rendezvous;

/// State shared by every hub-side connector.
#[derive(Debug)]
pub(crate) struct HubState {
    pub cfg: HubConfig,
    pub connector_cfg: ConnectorConfig,
    pub registry: Registry,
    pub rendezvous: Rendezvous,
}

/// The rendezvous hub.
///
/// The registry and match table are owned here and injected into every
/// connector at construction; their lifetime is the hub's own.
#[derive(Debug, Clone)]
pub struct Hub {
    state: Arc<HubState>,
}

impl Hub {
    /// Builds a hub from its configuration.
    pub fn new(cfg: HubConfig) -> Self {
        let connector_cfg = cfg.connector();
        Self {
            state: Arc::new(HubState {
                cfg,
                connector_cfg,
                registry: Registry::new(),
                rendezvous: Rendezvous::new(),
            }),
        }
    }

    /// Takes ownership of one freshly accepted peer channel.
    ///
    /// Transport provisioning is the caller's business: `serve` feeds TCP
    /// connections here, tests feed in-process duplex pipes.
    pub fn accept(&self, stream: impl ByteStream) -> Connector<HubRole> {
        Connector::spawn(
            stream,
            HubRole {
                hub: Arc::clone(&self.state),
            },
            self.state.connector_cfg.clone(),
        )
    }

    /// Accepts peer channels forever.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "hub listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!(%addr, "peer channel accepted");
            self.accept(stream);
        }
    }

    /// Number of currently registered peers.
    pub fn peer_count(&self) -> usize {
        self.state.registry.len()
    }
}
