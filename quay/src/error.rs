//! Error types for connector operations.

use quay_proto::PeerId;

use crate::resync::ResyncError;

/// Alias for `Result<T, quay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by connector and peer operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O failure on the physical channel. Always fatal for the
    /// connector that hit it.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The channel is currently owned by a data session; control traffic
    /// must wait until the protocol resumes.
    #[error("channel is owned by a data session")]
    ChannelBusy,

    /// The connector has been torn down.
    #[error("connector is closed")]
    Closed,

    /// The remote violated the protocol badly enough to tear the
    /// connector down.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A peer id was already registered on the hub.
    #[error("peer id {0} is already registered")]
    DuplicateRegistration(PeerId),

    /// Post-session stream resynchronization failed; the channel cannot be
    /// trusted again and the connector is discarded.
    #[error("resynchronization failed: {0}")]
    Resync(#[from] ResyncError),
}
