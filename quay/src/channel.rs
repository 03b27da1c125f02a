//! The physical channel abstraction.
//!
//! Transport provisioning hands connector constructors an already-open
//! duplex byte connection; TCP in production, `tokio::io::duplex` pipes in
//! tests. The connector splits it once and threads the two halves through
//! whichever logical layer currently owns the channel.

use tokio::io::{AsyncRead, AsyncWrite};

/// Any reliable duplex byte stream usable as a physical channel.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

/// Boxed read half of a channel.
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a channel.
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Splits a duplex stream into boxed halves.
pub fn split(stream: impl ByteStream) -> (ChannelReader, ChannelWriter) {
    let (r, w) = tokio::io::split(stream);
    (Box::new(r), Box::new(w))
}
