//! Protocol message types for hub↔peer communication.

use std::fmt;

/// Default TCP port for a quay hub.
pub const HUB_PORT: u16 = 7117;

/// Opaque identifier of a registered peer on a hub.
///
/// Unique per hub: the registry maps each id to at most one live connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps a string as a peer id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Wire message tags, one byte each.
///
/// There is no version byte: compatibility is closed-world per physical
/// link, and an unknown tag is a fatal decode error.
pub(crate) mod tag {
    pub const REGISTER: u8 = 0x01;
    pub const UNREGISTER: u8 = 0x02;
    pub const CONNECT_REQUEST: u8 = 0x03;
    pub const STATUS_REQUEST: u8 = 0x04;
    pub const STATUS_REPLY: u8 = 0x05;
    pub const SILENCE_REQUEST: u8 = 0x06;
    pub const SILENCE_REPLY: u8 = 0x07;
    pub const CHANNEL_CLEAR: u8 = 0x08;
    pub const NEW_SOCKET_REQUEST: u8 = 0x09;
}

/// A control-protocol message.
///
/// Encoded as one tag byte followed by fixed-width big-endian integers and
/// length-prefixed strings/bytes; see the codec module for exact layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Message {
    /// Claim a peer id on the hub this channel is connected to.
    Register {
        /// Id the peer wants to be reachable under.
        peer_id: PeerId,
        /// Whether the peer's transport can dial a fresh socket back to
        /// the hub for a data session, sparing the shared channel.
        direct_capable: bool,
    },
    /// Release a previously registered peer id. Unknown ids are a no-op.
    Unregister {
        /// Id to release.
        peer_id: PeerId,
    },
    /// Ask the hub for a data session with another peer.
    ///
    /// The source id is implied by the channel the request arrives on.
    ConnectRequest {
        /// Target peer id.
        peer_id: PeerId,
    },
    /// Ask the hub for the set of currently registered peers.
    StatusRequest,
    /// Registered peers, always excluding the caller's own id.
    StatusReply {
        /// Registered peer ids.
        peers: Vec<PeerId>,
    },
    /// Ask the remote control protocol to go silent for a bounded window.
    SilenceRequest {
        /// Requested silent window in milliseconds.
        duration_ms: u32,
    },
    /// Grant a silence request.
    SilenceReply {
        /// Granted silent window in milliseconds.
        duration_ms: u32,
    },
    /// Commit the silenced channel to a raw data session.
    ///
    /// The sender is committed the moment this is written; there is no
    /// rollback.
    ChannelClear {
        /// Peer that initiated the connection request.
        source: PeerId,
        /// Peer the request was aimed at.
        target: PeerId,
        /// Idle window after which the session is torn down.
        max_idle_ms: u32,
        /// Random seed shared by both channel ends; the post-session
        /// resynchronization derives its markers from it.
        sync_token: Vec<u8>,
    },
    /// Ask a direct-capable peer to dial a fresh socket on the hub host.
    NewSocketRequest {
        /// Peer the resulting data session will be bridged to.
        peer_id: PeerId,
        /// Port of the freshly allocated listening socket.
        port: u16,
    },
}

impl Message {
    /// The message's wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Register { .. } => tag::REGISTER,
            Self::Unregister { .. } => tag::UNREGISTER,
            Self::ConnectRequest { .. } => tag::CONNECT_REQUEST,
            Self::StatusRequest => tag::STATUS_REQUEST,
            Self::StatusReply { .. } => tag::STATUS_REPLY,
            Self::SilenceRequest { .. } => tag::SILENCE_REQUEST,
            Self::SilenceReply { .. } => tag::SILENCE_REPLY,
            Self::ChannelClear { .. } => tag::CHANNEL_CLEAR,
            Self::NewSocketRequest { .. } => tag::NEW_SOCKET_REQUEST,
        }
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "REGISTER",
            Self::Unregister { .. } => "UNREGISTER",
            Self::ConnectRequest { .. } => "CONNECT_REQUEST",
            Self::StatusRequest => "STATUS_REQUEST",
            Self::StatusReply { .. } => "STATUS_REPLY",
            Self::SilenceRequest { .. } => "SILENCE_REQUEST",
            Self::SilenceReply { .. } => "SILENCE_REPLY",
            Self::ChannelClear { .. } => "CHANNEL_CLEAR",
            Self::NewSocketRequest { .. } => "NEW_SOCKET_REQUEST",
        }
    }
}
