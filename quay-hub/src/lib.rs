//! Rendezvous hub for quay peers.
//!
//! Peers hold one duplex channel each to the hub, register an id, discover
//! each other through status queries and ask the hub to mediate data
//! sessions. The hub silences both channels, matches the two raw streams
//! and bridges them full-duplex; for direct-capable peers it hands out a
//! fresh socket instead and leaves their control channel untouched.
//!
//! # Quick start — embedded hub
//!
//! ```no_run
//! use quay_hub::{Hub, HubConfig};
//! use tokio::net::TcpListener;
//!
//! # async fn demo() -> std::io::Result<()> {
//! let hub = Hub::new(HubConfig::default());
//! let listener = TcpListener::bind("127.0.0.1:7117").await?;
//! hub.serve(listener).await
//! # }
//! ```

mod config;
mod connector;
mod registry;
mod rendezvous;
mod server;

pub use config::HubConfig;
pub use connector::HubRole;
pub use server::Hub;
