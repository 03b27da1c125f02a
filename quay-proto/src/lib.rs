//! Wire protocol for quay hub↔peer communication.
//!
//! Messages are self-framing: one tag byte selects a fixed decoder, fields
//! are fixed-width big-endian integers or length-prefixed strings/bytes.
//! Suitable for any reliable byte stream (TCP, Unix socket, in-process
//! duplex pipes in tests).

mod codec;
mod message;

pub use codec::{
    MAX_PEER_ID_LEN, MAX_STATUS_PEERS, MAX_TOKEN_LEN, MessageReader, MessageWriter, decode, encode,
};
pub use message::{HUB_PORT, Message, PeerId};
