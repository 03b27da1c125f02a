//! The per-channel connector state machine.
//!
//! One connector owns one physical channel to the far side (peer↔hub) and
//! arbitrates which logical layer holds it: the control protocol's message
//! pump, or a raw data session. The silence negotiation, the pending-queue
//! examination and the commitment to a data session all live here; the hub
//! and peer variants differ only in the role hooks at the seam.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quay_proto::{Message, MessageReader, MessageWriter, PeerId};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ByteStream, ChannelReader, ChannelWriter, split};
use crate::engine;
use crate::error::{Error, Result};
use crate::pending::{ConnectionRequest, PairKey, PendingRequests};
use crate::resync::{self, ResyncConfig};
use crate::session::{self, DataSession, SessionStream};
use crate::timer::DeadlineTimer;

/// Timing and sizing knobs for a connector.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectorConfig {
    /// Silent window asked of (and granted to) the far side.
    pub silence_duration: Duration,
    /// How long to wait for a SILENCE_REPLY before giving up.
    pub silence_timeout: Duration,
    /// Data-session idle window.
    pub max_idle: Duration,
    /// Deadline attached to locally issued connection requests.
    pub request_timeout: Duration,
    /// Buffer size of the consumer-facing session pipe.
    pub session_buffer: usize,
    /// Resynchronization tuning.
    pub resync: ResyncConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            silence_duration: Duration::from_secs(10),
            silence_timeout: Duration::from_secs(5),
            max_idle: Duration::from_secs(30),
            request_timeout: Duration::from_secs(20),
            session_buffer: 64 * 1024,
            resync: ResyncConfig::default(),
        }
    }
}

/// The states a connector moves through.
///
/// A data session starts only from [`Silenced`](Phase::Silenced); write
/// ownership of the channel belongs to the pump everywhere except
/// [`DataSession`](Phase::DataSession) and [`Resyncing`](Phase::Resyncing),
/// where the session loop holds it exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Phase {
    /// Steady state: the pump owns the channel and dispatches messages.
    Control,
    /// A local silence request is outstanding, deadline running.
    AskedForSilence,
    /// The channel is quiet and a data session may start, deadline running.
    Silenced,
    /// Raw passthrough; the pump is stopped.
    DataSession,
    /// Session over; flushing stray bytes before the pump restarts.
    Resyncing,
    /// Torn down; the registration, if any, has been removed.
    Closed,
}

/// Role-specific hooks at the seam of the shared state machine.
///
/// Two implementations exist: the peer side (application events, status
/// replies, direct-socket dialing) and the hub side (registry, rendezvous).
/// The silence negotiation and session/resync mechanics are common.
pub trait Role: Send + Sync + Sized + 'static {
    /// Handles control messages the shared machine does not consume.
    fn on_control(
        &self,
        conn: &Connector<Self>,
        msg: Message,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delivers a freshly opened data session to the local consumer.
    fn on_session(
        &self,
        conn: &Connector<Self>,
        session: DataSession,
    ) -> impl Future<Output = ()> + Send;

    /// The control protocol (re)gained the channel; resume queued work.
    fn on_control_resumed(&self, conn: &Connector<Self>) -> impl Future<Output = ()> + Send;

    /// The connector was torn down.
    fn on_closed(&self, conn: &Connector<Self>, reason: &Error)
    -> impl Future<Output = ()> + Send;
}

/// Instructions for the engine task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Re-examine the pending queue; a request may be startable.
    Examine,
    /// Stop pumping and close the connector cleanly.
    Shutdown,
}

/// Everything the engine needs to open a data session.
#[derive(Debug)]
pub(crate) struct SessionPlan {
    /// Initiating peer of the underlying request.
    pub source: PeerId,
    /// Target peer of the underlying request.
    pub target: PeerId,
    /// Idle window for this session.
    pub max_idle: Duration,
    /// Shared resynchronization seed.
    pub token: Vec<u8>,
    /// Whether this end must emit the CHANNEL_CLEAR (it popped the
    /// request) or received one.
    pub send_clear: bool,
}

/// Mutable state guarded by the connector's mutex.
struct StateCell {
    phase: Phase,
    /// Bumped on every transition; timer callbacks check it so a late
    /// firing never acts on a superseded state.
    epoch: u64,
    timer: Option<DeadlineTimer>,
    /// In `Silenced`: whether this end requested the silence (and so is
    /// the one that pops the queue and clears the channel).
    silence_initiator: bool,
}

/// Shared connector innards.
struct Shared<R: Role> {
    cfg: ConnectorConfig,
    role: R,
    state: Mutex<StateCell>,
    /// The protocol writer, present whenever the control protocol owns the
    /// write side. A running data session takes it out of the slot, which
    /// is what makes write ownership exclusive.
    writer: tokio::sync::Mutex<Option<MessageWriter<ChannelWriter>>>,
    pending: Mutex<PendingRequests>,
    peer_id: Mutex<Option<PeerId>>,
    direct_capable: AtomicBool,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

/// Handle to a connector; clones share the same underlying channel.
pub struct Connector<R: Role> {
    shared: Arc<Shared<R>>,
}

impl<R: Role> Clone for Connector<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Role> std::fmt::Debug for Connector<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("phase", &self.phase())
            .field("peer_id", &self.registered_id())
            .finish_non_exhaustive()
    }
}

impl<R: Role> Connector<R> {
    /// Takes ownership of an open duplex channel and starts the protocol
    /// engine on it.
    pub fn spawn(stream: impl ByteStream, role: R, cfg: ConnectorConfig) -> Self {
        let (reader_half, writer_half) = split(stream);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            cfg,
            role,
            state: Mutex::new(StateCell {
                phase: Phase::Control,
                epoch: 0,
                timer: None,
                silence_initiator: false,
            }),
            writer: tokio::sync::Mutex::new(Some(MessageWriter::new(writer_half))),
            pending: Mutex::new(PendingRequests::new()),
            peer_id: Mutex::new(None),
            direct_capable: AtomicBool::new(false),
            cmd_tx,
        });
        let conn = Self { shared };
        tokio::spawn(engine::run(
            conn.clone(),
            MessageReader::new(reader_half),
            cmd_rx,
        ));
        conn
    }

    /// Current state.
    pub fn phase(&self) -> Phase {
        self.lock_state().phase
    }

    /// The connector's timing configuration.
    pub fn config(&self) -> &ConnectorConfig {
        &self.shared.cfg
    }

    /// The peer id bound to this channel, once known.
    pub fn registered_id(&self) -> Option<PeerId> {
        self.lock_peer_id().clone()
    }

    /// Binds a peer id to this channel.
    pub fn set_registered(&self, id: PeerId) {
        *self.lock_peer_id() = Some(id);
    }

    /// Unbinds the peer id.
    pub fn clear_registered(&self) {
        *self.lock_peer_id() = None;
    }

    /// Records whether this channel's far side can take data sessions on a
    /// freshly dialed socket.
    pub fn set_direct_capable(&self, value: bool) {
        self.shared.direct_capable.store(value, Ordering::Relaxed);
    }

    /// Whether the far side advertised direct-socket capability.
    pub fn direct_capable(&self) -> bool {
        self.shared.direct_capable.load(Ordering::Relaxed)
    }

    /// Whether a live pending request is queued.
    pub fn has_live_request(&self) -> bool {
        self.lock_pending().has_live(Instant::now())
    }

    /// Whether two handles refer to the same underlying channel.
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn role(&self) -> &R {
        &self.shared.role
    }

    pub(crate) fn pending(&self) -> &Mutex<PendingRequests> {
        &self.shared.pending
    }

    /// Sends one protocol message, serialized against all other writers.
    ///
    /// Fails with [`Error::ChannelBusy`] while a data session owns the
    /// write side.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        if self.phase() == Phase::Closed {
            return Err(Error::Closed);
        }
        let mut slot = self.shared.writer.lock().await;
        let writer = slot.as_mut().ok_or(Error::ChannelBusy)?;
        writer.send(msg).await?;
        Ok(())
    }

    /// Sends `msg` only if the control protocol currently owns the channel;
    /// returns whether it was sent.
    ///
    /// The phase check happens under the writer lock, so a message admitted
    /// here is serialized before any transition the pump makes afterwards.
    pub async fn send_if_control(&self, msg: &Message) -> Result<bool> {
        let mut slot = self.shared.writer.lock().await;
        if self.phase() != Phase::Control {
            return Ok(false);
        }
        let writer = slot.as_mut().ok_or(Error::ChannelBusy)?;
        writer.send(msg).await?;
        Ok(true)
    }

    /// Queues a connection request on this connector and nudges the state
    /// machine toward a data session.
    ///
    /// Entering from `Control` starts a silence negotiation immediately;
    /// while one is already outstanding the request is only enqueued, so
    /// no duplicate wire message is ever produced. Requests for an already
    /// queued unordered pair are dropped.
    pub async fn enqueue_request(&self, req: ConnectionRequest) -> Result<()> {
        if self.phase() == Phase::Closed {
            return Err(Error::Closed);
        }
        let added = self.lock_pending().push(req);
        if !added {
            return Ok(());
        }
        if !self.ask_for_silence().await? {
            // Not in Control: either a negotiation is already running or
            // the channel is silenced/busy. A nudge lets the pump start
            // the session at once if we are already silenced.
            let _ = self.shared.cmd_tx.send(Command::Examine);
        }
        Ok(())
    }

    /// Starts a silence negotiation if the connector is in `Control`.
    ///
    /// Returns whether a SILENCE_REQUEST went out.
    pub async fn ask_for_silence(&self) -> Result<bool> {
        {
            let mut st = self.lock_state();
            if st.phase != Phase::Control {
                return Ok(false);
            }
            self.advance(&mut st, Phase::AskedForSilence, false);
            st.timer = Some(self.schedule_deadline(st.epoch, self.shared.cfg.silence_timeout));
        }
        let duration_ms = duration_ms(self.shared.cfg.silence_duration);
        self.send(&Message::SilenceRequest { duration_ms }).await?;
        debug!(duration_ms, "asked far side for silence");
        Ok(true)
    }

    /// Requests a clean shutdown; the engine closes the connector.
    pub fn shutdown(&self) {
        let _ = self.shared.cmd_tx.send(Command::Shutdown);
    }

    /// Handles an incoming SILENCE_REQUEST.
    ///
    /// In `Control` this grants and jumps straight to `Silenced`; in
    /// `AskedForSilence` (both sides asked at once) it also grants, keeping
    /// our own queued requests for later. Anywhere else it is logged and
    /// dropped.
    pub(crate) async fn handle_silence_request(&self, duration_ms: u32) -> Result<()> {
        let granted = {
            let mut st = self.lock_state();
            match st.phase {
                Phase::Control | Phase::AskedForSilence => {
                    self.advance(&mut st, Phase::Silenced, false);
                    st.timer = Some(
                        self.schedule_deadline(st.epoch, Duration::from_millis(duration_ms.into())),
                    );
                    true
                }
                _ => {
                    warn!(phase = ?st.phase, "SILENCE_REQUEST in unexpected state, dropped");
                    false
                }
            }
        };
        if granted {
            self.send(&Message::SilenceReply { duration_ms }).await?;
            debug!(duration_ms, "granted silence");
        }
        Ok(())
    }

    /// Handles an incoming SILENCE_REPLY; on success the queue is examined
    /// and a session may start immediately.
    pub(crate) async fn handle_silence_reply(&self, duration_ms: u32) -> Option<SessionPlan> {
        {
            let mut st = self.lock_state();
            if st.phase != Phase::AskedForSilence {
                warn!(phase = ?st.phase, "SILENCE_REPLY in unexpected state, dropped");
                return None;
            }
            self.advance(&mut st, Phase::Silenced, true);
            st.timer =
                Some(self.schedule_deadline(st.epoch, Duration::from_millis(duration_ms.into())));
        }
        debug!(duration_ms, "far side went silent");
        self.try_open_session()
    }

    /// Pops the next live queued request and commits to a data session, if
    /// this end is the silenced initiator.
    pub(crate) fn try_open_session(&self) -> Option<SessionPlan> {
        let mut st = self.lock_state();
        if st.phase != Phase::Silenced || !st.silence_initiator {
            return None;
        }
        let req = self.lock_pending().pop_live(Instant::now())?;
        self.advance(&mut st, Phase::DataSession, false);
        let token = rand::rng().random::<[u8; 8]>().to_vec();
        Some(SessionPlan {
            source: req.source,
            target: req.target,
            max_idle: self.shared.cfg.max_idle,
            token,
            send_clear: true,
        })
    }

    /// Handles an incoming CHANNEL_CLEAR: the far side is committed, so
    /// anywhere but `Silenced` this is a fatal protocol violation.
    pub(crate) fn handle_channel_clear(
        &self,
        source: PeerId,
        target: PeerId,
        max_idle_ms: u32,
        token: Vec<u8>,
    ) -> Result<SessionPlan> {
        let mut st = self.lock_state();
        if st.phase != Phase::Silenced {
            return Err(Error::Protocol(format!(
                "CHANNEL_CLEAR received in {:?}",
                st.phase
            )));
        }
        self.advance(&mut st, Phase::DataSession, false);
        self.lock_pending()
            .remove_pair(&PairKey::new(&source, &target));
        Ok(SessionPlan {
            source,
            target,
            max_idle: Duration::from_millis(max_idle_ms.into()),
            token,
            send_clear: false,
        })
    }

    /// Runs a data session followed by resynchronization, then hands the
    /// channel back to the control protocol.
    ///
    /// This is the explicit ownership transfer: the pump has already
    /// stopped, the writer is taken out of its slot, and the session loop
    /// is the only owner of both halves until resync completes.
    pub(crate) async fn run_session(
        &self,
        reader: &mut MessageReader<ChannelReader>,
        plan: SessionPlan,
    ) -> Result<()> {
        let mut writer = self
            .shared
            .writer
            .lock()
            .await
            .take()
            .ok_or(Error::ChannelBusy)?;

        if plan.send_clear {
            writer
                .send(&Message::ChannelClear {
                    source: plan.source.clone(),
                    target: plan.target.clone(),
                    max_idle_ms: duration_ms(plan.max_idle),
                    sync_token: plan.token.clone(),
                })
                .await?;
        }

        info!(source = %plan.source, target = %plan.target, "data session open");
        let (consumer, far) = tokio::io::duplex(self.shared.cfg.session_buffer);
        let session = DataSession {
            source: plan.source.clone(),
            target: plan.target.clone(),
            stream: SessionStream::new(consumer),
        };
        self.shared.role.on_session(self, session).await;

        let end = session::run(reader, &mut writer, far, plan.max_idle).await?;
        debug!(?end, "data session ended, resynchronizing");
        {
            let mut st = self.lock_state();
            self.advance(&mut st, Phase::Resyncing, false);
        }

        resync::run(
            reader,
            &mut writer,
            &plan.token,
            plan.send_clear,
            &self.shared.cfg.resync,
        )
        .await?;

        *self.shared.writer.lock().await = Some(writer);
        {
            let mut st = self.lock_state();
            self.advance(&mut st, Phase::Control, false);
        }
        info!("control protocol resumed");
        self.shared.role.on_control_resumed(self).await;
        Ok(())
    }

    /// Tears the connector down. Idempotent.
    pub(crate) async fn close(&self, reason: &Error) {
        {
            let mut st = self.lock_state();
            if st.phase == Phase::Closed {
                return;
            }
            self.advance(&mut st, Phase::Closed, false);
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.role.on_closed(self, reason).await;
    }

    /// Transition helper: swaps the phase, bumps the epoch and cancels any
    /// running timer. The caller may install a new timer afterwards.
    fn advance(&self, st: &mut StateCell, phase: Phase, initiator: bool) {
        if let Some(timer) = st.timer.take() {
            timer.cancel();
        }
        st.phase = phase;
        st.silence_initiator = initiator;
        st.epoch += 1;
    }

    /// Schedules the negotiation/silence deadline for the given epoch.
    fn schedule_deadline(&self, epoch: u64, after: Duration) -> DeadlineTimer {
        let conn = self.clone();
        DeadlineTimer::schedule(after, async move {
            conn.on_deadline(epoch).await;
        })
    }

    /// Deadline callback: a negotiation or silent window ran out with no
    /// session started, so the control protocol resumes. Queued requests
    /// stay queued and are re-examined by the role hook.
    async fn on_deadline(self, epoch: u64) {
        let resumed = {
            let mut st = self.lock_state();
            if st.epoch != epoch {
                false
            } else {
                match st.phase {
                    Phase::AskedForSilence => {
                        debug!("silence not granted in time, resuming control protocol");
                        self.retire_timer(&mut st);
                        true
                    }
                    Phase::Silenced => {
                        debug!("silent window expired with no session, resuming control protocol");
                        self.retire_timer(&mut st);
                        true
                    }
                    _ => false,
                }
            }
        };
        if resumed {
            self.shared.role.on_control_resumed(&self).await;
        }
    }

    /// Like [`advance`](Self::advance) back to `Control`, but disarms the
    /// timer instead of aborting it: this runs inside the timer's own task.
    fn retire_timer(&self, st: &mut StateCell) {
        if let Some(timer) = st.timer.take() {
            timer.disarm();
        }
        st.phase = Phase::Control;
        st.silence_initiator = false;
        st.epoch += 1;
    }

    #[allow(clippy::unwrap_used)]
    fn lock_state(&self) -> std::sync::MutexGuard<'_, StateCell> {
        // Poisoning cannot happen: no code path panics while holding it.
        self.shared.state.lock().unwrap()
    }

    #[allow(clippy::unwrap_used)]
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingRequests> {
        self.shared.pending.lock().unwrap()
    }

    #[allow(clippy::unwrap_used)]
    fn lock_peer_id(&self) -> std::sync::MutexGuard<'_, Option<PeerId>> {
        self.shared.peer_id.lock().unwrap()
    }
}

/// Converts a duration to whole milliseconds on the wire, saturating.
fn duration_ms(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}
