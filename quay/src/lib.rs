//! Connector core for the quay rendezvous service.
//!
//! Peers hold one long-lived duplex channel to a shared hub and use it for
//! two things that must never mix: an always-on control protocol, and
//! temporary raw data sessions that look like an exclusive unframed pipe
//! to both applications. This crate implements the machinery that makes
//! the sharing safe: the per-channel protocol engine, the silence
//! negotiation state machine, the pending-request queue, the data-session
//! passthrough and the post-session stream resynchronization.
//!
//! # Quick start — joining a hub
//!
//! ```no_run
//! use quay::{Peer, PeerConfig, PeerEvent};
//! use tokio::net::TcpStream;
//!
//! # async fn demo() -> quay::Result<()> {
//! let stream = TcpStream::connect(("hub.example", quay::HUB_PORT)).await?;
//! let (peer, mut events) = Peer::join(stream, "alice", PeerConfig::default()).await?;
//!
//! peer.open_session("bob").await?;
//! if let Some(PeerEvent::Session(session)) = events.recv().await {
//!     // session.stream is a raw byte pipe to bob.
//!     drop(session);
//! }
//! # Ok(())
//! # }
//! ```

mod channel;
mod connector;
mod engine;
mod error;
mod pending;
mod peer;
mod resync;
mod session;
mod timer;

pub use channel::{ByteStream, ChannelReader, ChannelWriter, split};
pub use connector::{Connector, ConnectorConfig, Phase, Role};
pub use error::{Error, Result};
pub use pending::{ConnectionRequest, PairKey, PendingRequests};
pub use peer::{Peer, PeerConfig, PeerEvent};
pub use quay_proto::{HUB_PORT, Message, PeerId};
pub use resync::{ResyncConfig, ResyncError};
pub use session::{DataSession, SessionStream};
pub use timer::DeadlineTimer;
