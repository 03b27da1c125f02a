//! Tag-byte codec over any reliable byte stream.
//!
//! Each message is one tag byte followed by fixed-width big-endian integers
//! and length-prefixed strings/bytes; messages are self-framing, there is
//! no outer length prefix. Decoding is incremental so a partially received
//! message is never consumed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::message::{Message, PeerId, tag};

/// Maximum encoded length of a peer id.
pub const MAX_PEER_ID_LEN: usize = 255;
/// Maximum length of a sync token.
pub const MAX_TOKEN_LEN: usize = 64;
/// Maximum number of entries in a status reply.
pub const MAX_STATUS_PEERS: usize = 4096;

/// Shorthand for an `InvalidData` error.
fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Appends a length-prefixed string, enforcing [`MAX_PEER_ID_LEN`].
fn put_str(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    if s.len() > MAX_PEER_ID_LEN {
        return Err(invalid("peer id exceeds maximum length"));
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Appends a length-prefixed byte string, enforcing [`MAX_TOKEN_LEN`].
fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) -> io::Result<()> {
    if b.len() > MAX_TOKEN_LEN {
        return Err(invalid("sync token exceeds maximum length"));
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
    buf.extend_from_slice(b);
    Ok(())
}

/// Encodes `msg` onto the end of `buf`.
pub fn encode(msg: &Message, buf: &mut Vec<u8>) -> io::Result<()> {
    buf.push(msg.tag());
    match msg {
        Message::Register {
            peer_id,
            direct_capable,
        } => {
            put_str(buf, peer_id.as_str())?;
            buf.push(u8::from(*direct_capable));
        }
        Message::Unregister { peer_id } | Message::ConnectRequest { peer_id } => {
            put_str(buf, peer_id.as_str())?;
        }
        Message::StatusRequest => {}
        Message::StatusReply { peers } => {
            if peers.len() > MAX_STATUS_PEERS {
                return Err(invalid("status reply exceeds maximum peer count"));
            }
            #[allow(clippy::cast_possible_truncation)]
            buf.extend_from_slice(&(peers.len() as u16).to_be_bytes());
            for p in peers {
                put_str(buf, p.as_str())?;
            }
        }
        Message::SilenceRequest { duration_ms } | Message::SilenceReply { duration_ms } => {
            buf.extend_from_slice(&duration_ms.to_be_bytes());
        }
        Message::ChannelClear {
            source,
            target,
            max_idle_ms,
            sync_token,
        } => {
            put_str(buf, source.as_str())?;
            put_str(buf, target.as_str())?;
            buf.extend_from_slice(&max_idle_ms.to_be_bytes());
            put_bytes(buf, sync_token)?;
        }
        Message::NewSocketRequest { peer_id, port } => {
            put_str(buf, peer_id.as_str())?;
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }
    Ok(())
}

/// Incremental reader over a borrowed byte slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> io::Result<Option<String>> {
        let Some(len) = self.u16() else {
            return Ok(None);
        };
        if usize::from(len) > MAX_PEER_ID_LEN {
            return Err(invalid("peer id exceeds maximum length"));
        }
        let Some(raw) = self.take(usize::from(len)) else {
            return Ok(None);
        };
        let s = std::str::from_utf8(raw).map_err(|_| invalid("peer id is not valid UTF-8"))?;
        Ok(Some(s.to_owned()))
    }

    fn peer_id(&mut self) -> io::Result<Option<PeerId>> {
        Ok(self.string()?.map(PeerId::new))
    }

    fn token(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Some(len) = self.u16() else {
            return Ok(None);
        };
        if usize::from(len) > MAX_TOKEN_LEN {
            return Err(invalid("sync token exceeds maximum length"));
        }
        Ok(self.take(usize::from(len)).map(<[u8]>::to_vec))
    }
}

/// Pulls the next value out of a decode step, returning `Ok(None)` from the
/// enclosing function when more bytes are needed.
macro_rules! need {
    ($step:expr) => {
        match $step {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

/// Decodes one message from the front of `buf`.
///
/// Returns the message and the number of bytes it consumed, `Ok(None)` if
/// the buffer does not yet hold a complete message, or `InvalidData` for an
/// unknown tag or a violated size cap. Decode errors are fatal for the
/// channel; the caller tears the connector down.
pub fn decode(buf: &[u8]) -> io::Result<Option<(Message, usize)>> {
    let mut cur = Cursor { buf, pos: 0 };
    let tag = need!(cur.u8());
    let msg = match tag {
        tag::REGISTER => {
            let peer_id = need!(cur.peer_id()?);
            let direct = need!(cur.u8());
            Message::Register {
                peer_id,
                direct_capable: direct != 0,
            }
        }
        tag::UNREGISTER => Message::Unregister {
            peer_id: need!(cur.peer_id()?),
        },
        tag::CONNECT_REQUEST => Message::ConnectRequest {
            peer_id: need!(cur.peer_id()?),
        },
        tag::STATUS_REQUEST => Message::StatusRequest,
        tag::STATUS_REPLY => {
            let count = need!(cur.u16());
            if usize::from(count) > MAX_STATUS_PEERS {
                return Err(invalid("status reply exceeds maximum peer count"));
            }
            let mut peers = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                peers.push(need!(cur.peer_id()?));
            }
            Message::StatusReply { peers }
        }
        tag::SILENCE_REQUEST => Message::SilenceRequest {
            duration_ms: need!(cur.u32()),
        },
        tag::SILENCE_REPLY => Message::SilenceReply {
            duration_ms: need!(cur.u32()),
        },
        tag::CHANNEL_CLEAR => {
            let source = need!(cur.peer_id()?);
            let target = need!(cur.peer_id()?);
            let max_idle_ms = need!(cur.u32());
            let sync_token = need!(cur.token()?);
            Message::ChannelClear {
                source,
                target,
                max_idle_ms,
                sync_token,
            }
        }
        tag::NEW_SOCKET_REQUEST => {
            let peer_id = need!(cur.peer_id()?);
            let port = need!(cur.u16());
            Message::NewSocketRequest { peer_id, port }
        }
        _ => return Err(invalid("unknown message tag")),
    };
    Ok(Some((msg, cur.pos)))
}

/// Framed message reader over the read half of a channel.
///
/// Bytes are accumulated in an internal buffer, so awaiting [`next`] is
/// cancellation-safe: a partially received message survives across a
/// cancelled poll. The reader also passes raw bytes through (`AsyncRead`),
/// draining anything already buffered first, which is how a data session
/// and the resynchronization handshake reuse the channel.
///
/// [`next`]: MessageReader::next
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wraps the read half of a channel.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Reads the next complete message.
    ///
    /// `UnexpectedEof` means the channel closed; any other error is a fatal
    /// decode or I/O failure.
    pub async fn next(&mut self) -> io::Result<Message> {
        loop {
            if let Some((msg, used)) = decode(&self.buf)? {
                self.buf.advance(used);
                return Ok(msg);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed",
                ));
            }
        }
    }

    /// Pushes one byte back to the front of the buffer.
    ///
    /// Used by the resynchronization settle drain when it reads the first
    /// byte of resumed control traffic.
    pub fn push_back_byte(&mut self, byte: u8) {
        let mut buf = BytesMut::with_capacity(self.buf.len() + 1);
        buf.extend_from_slice(&[byte]);
        buf.extend_from_slice(&self.buf);
        self.buf = buf;
    }

    /// Number of bytes currently buffered ahead of the stream.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for MessageReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            let n = this.buf.len().min(out.remaining());
            out.put_slice(&this.buf[..n]);
            this.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

/// Framed message writer over the write half of a channel.
///
/// Also passes raw bytes through (`AsyncWrite`) for data sessions and the
/// resynchronization handshake. Serializing concurrent writers is the
/// caller's job; the connector keeps the writer behind a mutex-held slot.
#[derive(Debug)]
pub struct MessageWriter<W> {
    inner: W,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wraps the write half of a channel.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: Vec::with_capacity(256),
        }
    }

    /// Encodes `msg` and writes it out, flushing afterwards.
    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.scratch.clear();
        encode(msg, &mut self.scratch)?;
        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await
    }

    /// Shuts the write side down, flushing buffered bytes first.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for MessageWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
