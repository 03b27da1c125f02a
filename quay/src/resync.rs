//! Post-session stream resynchronization.
//!
//! During a data session the channel is exposed raw to an opaque consumer
//! on both ends; neither end knows exactly when the other stopped, and
//! stray application bytes may remain in flight. Resuming the control
//! protocol without realignment risks misparsing leftovers as protocol
//! messages. Both ends therefore run this symmetric flush handshake right
//! after closing the raw channel to the application, paying the cost once
//! per session teardown and never during steady-state control traffic.

use std::io;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use quay_proto::MessageReader;

/// Tuning for the resynchronization handshake.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ResyncConfig {
    /// Consecutive unambiguous round trips required before the channel is
    /// considered flushed.
    pub repetitions: u32,
    /// Attempts at drawing a distinct marker pair before giving up.
    pub marker_attempts: u32,
    /// Stray bytes tolerated before the handshake is declared failed.
    pub max_stray_bytes: usize,
    /// Overall deadline for the whole handshake. Must comfortably exceed
    /// the session idle window: the end that closed first waits for the
    /// other end's idle timer before any confirmation can flow.
    pub timeout: Duration,
    /// Settle-drain duration is the observed round trip scaled by this.
    pub settle_factor: u32,
    /// Lower bound on the settle drain.
    pub settle_min: Duration,
    /// Upper bound on the settle drain.
    pub settle_max: Duration,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            repetitions: 4,
            marker_attempts: 100,
            max_stray_bytes: 1024,
            timeout: Duration::from_secs(75),
            settle_factor: 4,
            settle_min: Duration::from_millis(25),
            settle_max: Duration::from_secs(1),
        }
    }
}

/// Why resynchronization failed. Every variant is fatal: both local stream
/// ends are closed and the connector is discarded, no recovery attempted.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResyncError {
    /// Could not derive two distinct markers within the attempt budget.
    #[error("marker derivation failed to produce distinct values")]
    MarkerDerivation,

    /// The channel closed mid-handshake.
    #[error("channel closed during resynchronization")]
    ChannelClosed,

    /// More stray bytes than the configured tolerance.
    #[error("persistent stream garbage: {0} stray bytes")]
    StrayOverflow(usize),

    /// The handshake exceeded its overall deadline.
    #[error("resynchronization timed out")]
    Timeout,

    /// I/O failure on the channel.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Derives the marker pair both ends use from the shared sync token.
///
/// The derivation is deterministic so that the two channel ends, seeded by
/// the token exchanged in CHANNEL_CLEAR, agree on both values without any
/// further negotiation. Colliding candidates are redrawn from the same
/// stream; the attempt budget bounds the loop.
fn derive_markers(token: &[u8], attempts: u32) -> Result<(u8, u8), ResyncError> {
    let mut seed = [0u8; 32];
    for (slot, byte) in seed.iter_mut().zip(token.iter()) {
        *slot = *byte;
    }
    #[allow(clippy::cast_possible_truncation)]
    {
        // Token length folded in so an empty and an all-zero token differ.
        seed[31] ^= token.len() as u8;
    }
    let mut rng = StdRng::from_seed(seed);
    for _ in 0..attempts {
        let a: u8 = rng.random();
        let b: u8 = rng.random();
        if a != b {
            return Ok((a, b));
        }
    }
    Err(ResyncError::MarkerDerivation)
}

/// Runs the resynchronization handshake on one channel end.
///
/// `initiator` is true on the end that sent CHANNEL_CLEAR; it takes the
/// first marker of the derived pair, the other end takes the second.
pub(crate) async fn run<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut W,
    token: &[u8],
    initiator: bool,
    cfg: &ResyncConfig,
) -> Result<(), ResyncError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    match tokio::time::timeout(cfg.timeout, flush(reader, writer, token, initiator, cfg)).await {
        Ok(result) => result,
        Err(_) => Err(ResyncError::Timeout),
    }
}

/// The flush handshake proper; see the module docs for the shape.
async fn flush<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut W,
    token: &[u8],
    initiator: bool,
    cfg: &ResyncConfig,
) -> Result<(), ResyncError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let (first, second) = derive_markers(token, cfg.marker_attempts)?;
    let (local, remote) = if initiator {
        (first, second)
    } else {
        (second, first)
    };
    // The greater marker designates the end that re-emits on stray reads,
    // keeping the exchange alive when garbage swallowed an earlier marker.
    let first_sender = local > remote;
    trace!(local, remote, first_sender, "resync markers derived");

    let started = Instant::now();
    writer.write_all(&[local]).await?;
    writer.flush().await?;

    let mut confirmations = 0u32;
    let mut strays = 0usize;
    let mut first_confirmation: Option<Duration> = None;

    while confirmations < cfg.repetitions {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ResyncError::ChannelClosed);
            }
            Err(e) => return Err(e.into()),
        };
        if byte == remote {
            if first_confirmation.is_none() {
                first_confirmation = Some(started.elapsed());
            }
            confirmations += 1;
            // Echo for every confirmation but the last, so both ends send
            // and consume exactly `repetitions` markers in the clean case.
            if confirmations < cfg.repetitions {
                writer.write_all(&[local]).await?;
                writer.flush().await?;
            }
        } else {
            strays += 1;
            confirmations = 0;
            if strays > cfg.max_stray_bytes {
                return Err(ResyncError::StrayOverflow(strays));
            }
            if first_sender {
                writer.write_all(&[local]).await?;
                writer.flush().await?;
            }
        }
    }
    debug!(strays, elapsed = ?started.elapsed(), "channel flushed");

    settle(reader, local, remote, first_confirmation, cfg).await
}

/// Settle drain: waits out a window proportional to the observed round
/// trip, consuming residual marker bytes the counting could have left in
/// flight. The first non-marker byte belongs to resumed control traffic
/// and is pushed back for the pump.
async fn settle<R>(
    reader: &mut MessageReader<R>,
    local: u8,
    remote: u8,
    rtt: Option<Duration>,
    cfg: &ResyncConfig,
) -> Result<(), ResyncError>
where
    R: AsyncRead + Unpin + Send,
{
    let rtt = rtt.unwrap_or(cfg.settle_min).max(Duration::from_millis(1));
    let window = (rtt * cfg.settle_factor).clamp(cfg.settle_min, cfg.settle_max);
    let deadline = Instant::now() + window;

    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(());
        }
        match tokio::time::timeout(left, reader.read_u8()).await {
            Err(_) => return Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ResyncError::ChannelClosed);
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(b)) if b == local || b == remote => {
                trace!(byte = b, "drained residual marker");
            }
            Ok(Ok(b)) => {
                reader.push_back_byte(b);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use quay_proto::{Message, MessageWriter};
    use tokio::io::{AsyncWriteExt as _, duplex, split};

    fn test_cfg() -> ResyncConfig {
        let mut cfg = ResyncConfig::default();
        cfg.timeout = Duration::from_secs(5);
        cfg.settle_min = Duration::from_millis(5);
        cfg.settle_max = Duration::from_millis(50);
        cfg
    }

    #[test]
    fn marker_derivation_is_deterministic_and_distinct() {
        let token = [7u8; 8];
        let (a1, b1) = derive_markers(&token, 100).unwrap();
        let (a2, b2) = derive_markers(&token, 100).unwrap();
        assert_eq!((a1, b1), (a2, b2));
        assert_ne!(a1, b1);

        let (c, d) = derive_markers(&[1, 2, 3], 100).unwrap();
        assert_ne!(c, d);
    }

    #[test]
    fn marker_derivation_differs_with_token() {
        let x = derive_markers(&[1u8; 8], 100).unwrap();
        let y = derive_markers(&[2u8; 8], 100).unwrap();
        // Not guaranteed in general, but holds for these fixed tokens and
        // pins the seed folding.
        assert_ne!(x, y);
    }

    /// Runs both ends of the handshake over an in-process channel with
    /// `left_strays`/`right_strays` junk bytes still in flight toward the
    /// respective reader, then proves control traffic round-trips.
    async fn exercise(token: &[u8], left_strays: &[u8], right_strays: &[u8]) {
        let cfg = test_cfg();
        let (left, right) = duplex(4096);
        let (lr, mut lw) = split(left);
        let (rr, mut rw) = split(right);

        // Strays: bytes the far application wrote before closing, so they
        // sit in front of the markers in each direction.
        rw.write_all(left_strays).await.unwrap();
        lw.write_all(right_strays).await.unwrap();

        let mut left_reader = MessageReader::new(lr);
        let mut right_reader = MessageReader::new(rr);

        let tok = token.to_vec();
        let cfg2 = cfg.clone();
        let far = tokio::spawn(async move {
            run(&mut right_reader, &mut rw, &tok, false, &cfg2)
                .await
                .unwrap();
            (right_reader, rw)
        });
        run(&mut left_reader, &mut lw, token, true, &cfg)
            .await
            .unwrap();
        let (mut right_reader, rw) = far.await.unwrap();

        // The channel must carry framed control traffic again.
        let mut writer = MessageWriter::new(lw);
        writer.send(&Message::StatusRequest).await.unwrap();
        assert_eq!(right_reader.next().await.unwrap(), Message::StatusRequest);
        drop((writer, rw));
    }

    /// Junk bytes guaranteed to collide with neither derived marker.
    fn junk(token: &[u8], n: usize) -> Vec<u8> {
        let (a, b) = derive_markers(token, 100).unwrap();
        (0u8..=255)
            .filter(|x| *x != a && *x != b)
            .cycle()
            .take(n)
            .collect()
    }

    #[tokio::test]
    async fn clean_channel_resyncs() {
        exercise(&[42u8; 8], &[], &[]).await;
    }

    #[tokio::test]
    async fn resyncs_with_strays_toward_initiator() {
        let token = [5u8; 8];
        exercise(&token, &junk(&token, 7), &[]).await;
    }

    #[tokio::test]
    async fn resyncs_with_strays_toward_responder() {
        let token = [6u8; 8];
        exercise(&token, &[], &junk(&token, 7)).await;
    }

    #[tokio::test]
    async fn resyncs_with_strays_both_ways() {
        let token = [9u8; 8];
        for k in [1usize, 2, 3, 32] {
            exercise(&token, &junk(&token, k), &junk(&token, k)).await;
        }
    }

    #[tokio::test]
    async fn absent_peer_times_out() {
        let mut cfg = test_cfg();
        cfg.timeout = Duration::from_millis(100);
        let (left, _right) = duplex(4096);
        let (lr, mut lw) = split(left);
        let mut reader = MessageReader::new(lr);
        let err = run(&mut reader, &mut lw, &[1u8; 8], true, &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, ResyncError::Timeout));
    }

    #[tokio::test]
    async fn closed_channel_is_fatal() {
        let cfg = test_cfg();
        let (left, right) = duplex(4096);
        drop(right);
        let (lr, mut lw) = split(left);
        let mut reader = MessageReader::new(lr);
        let err = run(&mut reader, &mut lw, &[1u8; 8], true, &cfg)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResyncError::ChannelClosed | ResyncError::Io(_)
        ));
    }
}
