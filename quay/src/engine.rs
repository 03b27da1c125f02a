//! The protocol engine: per-channel message pump.
//!
//! One engine task runs per physical channel. It pumps incoming messages
//! into the connector state machine until either a data session must start
//! (the pump stops and lends the channel to the session loop, restarting
//! after resynchronization) or the connector shuts down. Pumping is
//! stoppable without closing the channel: frame reads accumulate in the
//! reader's buffer, so a cancelled read never loses bytes.

use quay_proto::{Message, MessageReader};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::channel::ChannelReader;
use crate::connector::{Command, Connector, Role, SessionPlan};
use crate::error::{Error, Result};

/// Why the pump stopped.
enum PumpExit {
    /// Hand the channel to a data session, then pump again.
    Session(SessionPlan),
    /// Stop for good.
    Shutdown,
}

/// Engine entry point, spawned by `Connector::spawn`.
pub(crate) async fn run<R: Role>(
    conn: Connector<R>,
    mut reader: MessageReader<ChannelReader>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    match drive(&conn, &mut reader, &mut cmd_rx).await {
        Ok(()) => {
            debug!("connector shutting down");
            conn.close(&Error::Closed).await;
        }
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            debug!("channel closed by far side");
            conn.close(&Error::Io(e)).await;
        }
        Err(e) => {
            warn!(error = %e, "connector failed");
            conn.close(&e).await;
        }
    }
}

/// Alternates between pumping control messages and running data sessions.
async fn drive<R: Role>(
    conn: &Connector<R>,
    reader: &mut MessageReader<ChannelReader>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<()> {
    loop {
        match pump(conn, reader, cmd_rx).await? {
            PumpExit::Session(plan) => conn.run_session(reader, plan).await?,
            PumpExit::Shutdown => return Ok(()),
        }
    }
}

/// Reads and dispatches messages until a session starts or shutdown is
/// requested.
async fn pump<R: Role>(
    conn: &Connector<R>,
    reader: &mut MessageReader<ChannelReader>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<PumpExit> {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Examine) => {
                    if let Some(plan) = conn.try_open_session() {
                        return Ok(PumpExit::Session(plan));
                    }
                }
                Some(Command::Shutdown) | None => return Ok(PumpExit::Shutdown),
            },
            msg = reader.next() => {
                if let Some(exit) = dispatch(conn, msg?).await? {
                    return Ok(exit);
                }
            }
        }
    }
}

/// Feeds one message into the shared state machine, deferring everything
/// role-specific to the role hook.
async fn dispatch<R: Role>(conn: &Connector<R>, msg: Message) -> Result<Option<PumpExit>> {
    trace!(msg = msg.name(), "dispatch");
    match msg {
        Message::SilenceRequest { duration_ms } => {
            conn.handle_silence_request(duration_ms).await?;
            Ok(None)
        }
        Message::SilenceReply { duration_ms } => Ok(conn
            .handle_silence_reply(duration_ms)
            .await
            .map(PumpExit::Session)),
        Message::ChannelClear {
            source,
            target,
            max_idle_ms,
            sync_token,
        } => {
            let plan = conn.handle_channel_clear(source, target, max_idle_ms, sync_token)?;
            Ok(Some(PumpExit::Session(plan)))
        }
        other => {
            conn.role().on_control(conn, other).await?;
            Ok(None)
        }
    }
}
