//! Raw data-session passthrough.
//!
//! While a session runs, the shared channel is exposed byte-for-byte to the
//! local consumer: the application on a peer, the bridge on the hub. The
//! connector's pump is stopped and the session loop is the sole owner of
//! both channel halves; the consumer sees an ordinary duplex pipe whose far
//! end this loop shovels to and from the channel.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use quay_proto::{MessageReader, PeerId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::Instant;
use tracing::trace;

use crate::channel::ByteStream;

/// The raw byte pipe handed to a session consumer.
///
/// Reads and writes travel the shared channel verbatim; dropping (or
/// shutting down) the stream ends the session, which both sides observe
/// within the session's idle window.
pub struct SessionStream {
    inner: Box<dyn ByteStream>,
}

impl SessionStream {
    /// Wraps any duplex byte stream.
    pub fn new(stream: impl ByteStream) -> Self {
        Self {
            inner: Box::new(stream),
        }
    }
}

impl fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStream").finish_non_exhaustive()
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A data session delivered to the application (or, hub-side, the bridge).
#[derive(Debug)]
#[non_exhaustive]
pub struct DataSession {
    /// Peer that initiated the connection request.
    pub source: PeerId,
    /// Peer the request was aimed at.
    pub target: PeerId,
    /// The raw byte pipe.
    pub stream: SessionStream,
}

impl DataSession {
    /// The far peer's id, given the local one.
    pub fn remote<'a>(&'a self, local: &PeerId) -> &'a PeerId {
        if &self.source == local {
            &self.target
        } else {
            &self.source
        }
    }
}

/// Why a session ended without killing the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// No bytes in either direction for the whole idle window.
    Idle,
    /// The local consumer closed its end of the pipe.
    ConsumerClosed,
}

/// Shovels bytes between the channel halves and the consumer's pipe until
/// the session ends.
///
/// Channel end-of-stream or a channel write failure is a genuine loss of
/// the physical link and is returned as an error; the connector is then
/// torn down. Idle expiry and consumer close are ordinary session endings;
/// the caller proceeds to resynchronization.
pub(crate) async fn run<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut W,
    mut far: DuplexStream,
    max_idle: Duration,
) -> io::Result<SessionEnd>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut chan_buf = [0u8; 8192];
    let mut app_buf = [0u8; 8192];
    let mut deadline = Instant::now() + max_idle;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                return Ok(SessionEnd::Idle);
            }
            read = reader.read(&mut chan_buf) => {
                let n = read?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "channel closed during data session",
                    ));
                }
                trace!(bytes = n, "channel -> consumer");
                if far.write_all(&chan_buf[..n]).await.is_err() {
                    // Consumer dropped its end; remote bytes past this
                    // point are strays for the resync to flush.
                    return Ok(SessionEnd::ConsumerClosed);
                }
                deadline = Instant::now() + max_idle;
            }
            read = far.read(&mut app_buf) => {
                match read {
                    Ok(0) | Err(_) => return Ok(SessionEnd::ConsumerClosed),
                    Ok(n) => {
                        trace!(bytes = n, "consumer -> channel");
                        writer.write_all(&app_buf[..n]).await?;
                        writer.flush().await?;
                        deadline = Instant::now() + max_idle;
                    }
                }
            }
        }
    }
}
