//! Hub configuration.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use quay::{ConnectorConfig, ResyncConfig};
use quay_proto::HUB_PORT;
use serde::Deserialize;

/// Hub server configuration, loadable from a JSON file.
///
/// All protocol timings are in milliseconds on disk. Defaults are suitable
/// for LAN deployments; tests shrink them drastically.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct HubConfig {
    /// Address the hub listens on for peer channels.
    pub bind: SocketAddr,
    /// Address direct-socket listeners bind to. `None` disables the
    /// direct-socket path entirely; direct-capable peers then fall back to
    /// their shared channel.
    pub direct_bind: Option<IpAddr>,
    /// How long a freshly allocated direct socket waits for the peer to
    /// dial back.
    pub direct_accept_timeout_ms: u64,
    /// Silent window asked of a peer during negotiation.
    pub silence_duration_ms: u64,
    /// How long to wait for a SILENCE_REPLY.
    pub silence_timeout_ms: u64,
    /// Data-session idle window.
    pub max_idle_ms: u64,
    /// Deadline on connection requests awaiting a match.
    pub request_timeout_ms: u64,
    /// Overall deadline for post-session resynchronization. Keep this
    /// comfortably above `max_idle_ms`: the end that closed first waits
    /// out the other end's idle timer.
    pub resync_timeout_ms: u64,
    /// Buffer size of the per-session bridge pipe.
    pub session_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), HUB_PORT),
            direct_bind: None,
            direct_accept_timeout_ms: 10_000,
            silence_duration_ms: 10_000,
            silence_timeout_ms: 5_000,
            max_idle_ms: 30_000,
            request_timeout_ms: 20_000,
            resync_timeout_ms: 75_000,
            session_buffer: 64 * 1024,
        }
    }
}

impl HubConfig {
    /// Loads a configuration file, filling omitted fields from defaults.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Deadline on connection requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Direct-socket accept deadline.
    pub fn direct_accept_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_accept_timeout_ms)
    }

    /// The per-connector configuration this hub hands its connectors.
    pub fn connector(&self) -> ConnectorConfig {
        let mut resync = ResyncConfig::default();
        resync.timeout = Duration::from_millis(self.resync_timeout_ms);
        let mut cfg = ConnectorConfig::default();
        cfg.silence_duration = Duration::from_millis(self.silence_duration_ms);
        cfg.silence_timeout = Duration::from_millis(self.silence_timeout_ms);
        cfg.max_idle = Duration::from_millis(self.max_idle_ms);
        cfg.request_timeout = Duration::from_millis(self.request_timeout_ms);
        cfg.session_buffer = self.session_buffer;
        cfg.resync = resync;
        cfg
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.bind.port(), HUB_PORT);
        assert!(cfg.direct_bind.is_none());
        // Resync must outlive the idle window (see field docs).
        assert!(cfg.resync_timeout_ms > cfg.max_idle_ms);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: HubConfig =
            serde_json::from_str(r#"{"bind": "0.0.0.0:9000", "max_idle_ms": 1000}"#).unwrap();
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.max_idle_ms, 1000);
        assert_eq!(
            cfg.silence_timeout_ms,
            HubConfig::default().silence_timeout_ms
        );
    }

    #[test]
    fn connector_config_carries_timings() {
        let mut cfg = HubConfig::default();
        cfg.max_idle_ms = 1234;
        let conn = cfg.connector();
        assert_eq!(conn.max_idle, Duration::from_millis(1234));
    }
}
