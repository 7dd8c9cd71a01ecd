//! Per-connection handler: registration, reader and writer, and close.
//!
//! Each admitted connection runs as two tasks:
//!   1. The reader reads client frames, records liveness, and hands
//!      replies (app-level `pong`, `error`) to the writer.
//!   2. The writer drains the hub queue onto the socket, sends heartbeat
//!      pings, and decides when the connection ends: eviction, silence,
//!      session expiry, write failure, or the reader finishing.
//!
//! Only the writer touches the socket's write half and only the reader
//! touches the read half. They share a `CancellationToken`, a child of
//! the server's shutdown token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use vigil_hub::{CloseReason, ConnectionState, HubHandle, Member, Registration};
use vigil_protocol::{Codec, JsonCodec, Message, MessageKind, SessionId};
use vigil_session::{AuthError, RevocationListener, SessionAuthority, SessionStore};
use vigil_transport::{
    ConnectionError, ConnectionId, FrameReader, FrameWriter, Inbound, WebSocketConnection,
};

use crate::VigilError;
use crate::gate::AdmittedSession;

/// Replies queued by the reader beyond this are dropped.
const CONTROL_CAPACITY: usize = 16;

/// Longest heartbeat interval or silence timeout accepted.
const MAX_HEARTBEAT: Duration = Duration::from_secs(24 * 60 * 60);

/// Stand-in for a deadline that `Instant` can't represent.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing for one connection.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// How often the writer sends a heartbeat ping (`T_ping`).
    ///
    /// Default: 30 seconds.
    pub ping_interval: Duration,

    /// How long the client may stay silent before it's dropped (`T_pong`).
    /// Any inbound frame counts, including pongs to our pings.
    ///
    /// Default: 60 seconds.
    pub pong_timeout: Duration,

    /// Upper bound on a single socket write.
    ///
    /// Default: 10 seconds.
    pub write_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl HandlerConfig {
    /// Returns a copy with zero durations raised, heartbeat timing capped
    /// at one day, and `pong_timeout` pushed above `ping_interval`.
    pub fn validated(mut self) -> Self {
        if self.ping_interval.is_zero() {
            tracing::warn!("ping_interval was 0, using 1s");
            self.ping_interval = Duration::from_secs(1);
        }
        if self.ping_interval >= MAX_HEARTBEAT {
            tracing::warn!("ping_interval too long, using 12h");
            self.ping_interval = MAX_HEARTBEAT / 2;
        }
        if self.pong_timeout > MAX_HEARTBEAT {
            tracing::warn!("pong_timeout too long, using 24h");
            self.pong_timeout = MAX_HEARTBEAT;
        }
        if self.pong_timeout <= self.ping_interval {
            tracing::warn!(
                ping_ms = self.ping_interval.as_millis() as u64,
                pong_ms = self.pong_timeout.as_millis() as u64,
                "pong_timeout must exceed ping_interval, using twice the ping interval"
            );
            self.pong_timeout = self.ping_interval * 2;
        }
        if self.write_timeout.is_zero() {
            tracing::warn!("write_timeout was 0, using 1s");
            self.write_timeout = Duration::from_secs(1);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Session liveness
// ---------------------------------------------------------------------------

/// Answers whether an admitted session still exists.
///
/// Checked once the connection is registered, so a revocation that landed
/// between the handshake and registration still closes it.
pub trait SessionLiveness: Send + Sync + 'static {
    fn is_live(&self, session_id: SessionId) -> Result<bool, AuthError>;
}

impl<S, L> SessionLiveness for SessionAuthority<S, L>
where
    S: SessionStore,
    L: RevocationListener,
{
    fn is_live(&self, session_id: SessionId) -> Result<bool, AuthError> {
        SessionAuthority::is_live(self, session_id)
    }
}

// ---------------------------------------------------------------------------
// Guards and bookkeeping
// ---------------------------------------------------------------------------

/// Unregisters the connection if the handler unwinds before doing it
/// itself. `Drop` is synchronous, so the unregister is spawned.
struct RegistrationGuard {
    id: ConnectionId,
    hub: Option<HubHandle>,
}

impl RegistrationGuard {
    /// Takes the hub handle back for an orderly, awaited unregister.
    fn disarm(&mut self) -> Option<HubHandle> {
        self.hub.take()
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let Some(hub) = self.hub.take() else {
            return;
        };
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                hub.unregister(id).await;
            });
        }
    }
}

/// Tracks one connection through [`ConnectionState`].
struct Lifecycle {
    id: ConnectionId,
    state: ConnectionState,
}

impl Lifecycle {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
        }
    }

    fn advance(&mut self, to: ConnectionState) {
        if self.state.can_transition_to(to) {
            tracing::trace!(conn_id = %self.id, from = %self.state, %to, "connection state");
            self.state = to;
        } else {
            tracing::warn!(conn_id = %self.id, from = %self.state, %to, "illegal state transition ignored");
        }
    }
}

/// Sent from the reader to the writer.
enum Control {
    Reply(Message),
    Ended(CloseReason),
}

// ---------------------------------------------------------------------------
// ConnectionHandler
// ---------------------------------------------------------------------------

/// Runs admitted connections. Cheap to clone; the server gives one clone
/// to every connection task.
#[derive(Clone)]
pub struct ConnectionHandler {
    hub: HubHandle,
    sessions: Arc<dyn SessionLiveness>,
    config: Arc<HandlerConfig>,
    shutdown: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        hub: HubHandle,
        sessions: Arc<dyn SessionLiveness>,
        config: HandlerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            sessions,
            config: Arc::new(config.validated()),
            shutdown,
        }
    }

    /// Serves one connection until it closes, and returns why it closed.
    ///
    /// The connection is registered with the hub first; if that fails the
    /// socket is closed with `1001` and the hub's error is returned. A
    /// session that is gone by the time registration completes is closed
    /// with `4001`.
    pub async fn serve(
        &self,
        conn: WebSocketConnection,
        admitted: AdmittedSession,
    ) -> Result<CloseReason, VigilError> {
        let id = conn.id();
        let peer = conn.peer_addr();
        let AdmittedSession {
            principal,
            expires_in,
        } = admitted;

        let mut lifecycle = Lifecycle::new(id);
        lifecycle.advance(ConnectionState::Authenticated);

        let (reader, mut writer) = conn.split();
        let member = Member {
            session_id: principal.session_id,
            user_id: principal.user_id,
            username: principal.username.clone(),
        };

        let registration = match self.hub.register(id, member).await {
            Ok(registration) => registration,
            Err(e) => {
                tracing::warn!(conn_id = %id, error = %e, "hub registration failed");
                lifecycle.advance(ConnectionState::Closing);
                close(&mut writer, CloseReason::ServerShutdown, self.config.write_timeout).await;
                lifecycle.advance(ConnectionState::Closed);
                return Err(e.into());
            }
        };
        let mut guard = RegistrationGuard {
            id,
            hub: Some(self.hub.clone()),
        };
        lifecycle.advance(ConnectionState::Active);

        // Revocations delete the row before notifying the hub, so one that
        // raced the handshake is visible here if the hub missed it.
        let live = self.sessions.is_live(principal.session_id).unwrap_or_else(|e| {
            tracing::warn!(conn_id = %id, error = %e, "session lookup failed, closing");
            false
        });
        if !live {
            tracing::info!(
                conn_id = %id,
                session_id = %principal.session_id,
                "session revoked before registration completed"
            );
            let reason = CloseReason::SessionRevoked;
            lifecycle.advance(ConnectionState::Closing);
            close(&mut writer, reason, self.config.write_timeout).await;
            if let Some(hub) = guard.disarm() {
                hub.unregister(id).await;
            }
            lifecycle.advance(ConnectionState::Closed);
            return Ok(reason);
        }

        tracing::info!(
            conn_id = %id,
            %peer,
            user_id = %principal.user_id,
            session_id = %principal.session_id,
            "realtime connection active"
        );

        let cancel = self.shutdown.child_token();
        let (liveness_tx, liveness_rx) = watch::channel(Instant::now());
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let reader_task = tokio::spawn(read_loop(reader, liveness_tx, control_tx, cancel.clone()));

        let reason = write_loop(
            &mut writer,
            registration,
            control_rx,
            liveness_rx,
            &self.config,
            expires_in,
            &cancel,
        )
        .await;

        lifecycle.advance(ConnectionState::Closing);
        cancel.cancel();
        if reason == CloseReason::SlowConsumer {
            tracing::warn!(conn_id = %id, error = %ConnectionError::QueueFull, "dropping slow consumer");
        }
        close(&mut writer, reason, self.config.write_timeout).await;
        if let Err(e) = reader_task.await {
            tracing::debug!(conn_id = %id, error = %e, "reader task ended abnormally");
        }
        if let Some(hub) = guard.disarm() {
            hub.unregister(id).await;
        }
        lifecycle.advance(ConnectionState::Closed);

        tracing::info!(conn_id = %id, user_id = %principal.user_id, %reason, "realtime connection closed");
        Ok(reason)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

async fn read_loop(
    mut reader: FrameReader,
    liveness: watch::Sender<Instant>,
    control: mpsc::Sender<Control>,
    cancel: CancellationToken,
) {
    let id = reader.id();
    let codec = JsonCodec;

    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = reader.next_frame() => frame,
        };
        match frame {
            Ok(Some(inbound)) => {
                liveness.send_replace(Instant::now());
                if let Some(reply) = reply_to(&codec, id, inbound) {
                    if control.try_send(Control::Reply(reply)).is_err() {
                        tracing::debug!(conn_id = %id, "writer backlogged, reply dropped");
                    }
                }
            }
            Ok(None) => break CloseReason::ClientClosed,
            Err(e) => {
                tracing::debug!(conn_id = %id, error = %e, "read failed");
                break CloseReason::ProtocolError;
            }
        }
    };

    let _ = control.send(Control::Ended(reason)).await;
}

/// What, if anything, the server says back to a client frame.
///
/// Clients have nothing to ask of this channel except app-level `ping`.
/// Other well-formed messages are ignored; garbage gets an `error`.
fn reply_to(codec: &JsonCodec, id: ConnectionId, inbound: Inbound) -> Option<Message> {
    match inbound {
        Inbound::Ping | Inbound::Pong => None,
        Inbound::Binary(data) => {
            tracing::debug!(conn_id = %id, len = data.len(), "binary frame ignored");
            None
        }
        Inbound::Text(text) => match codec.decode::<Message>(&text) {
            Ok(message) if message.kind == MessageKind::Ping => Some(Message::pong()),
            Ok(message) => {
                tracing::debug!(conn_id = %id, kind = %message.kind, "client message ignored");
                None
            }
            Err(e) => {
                tracing::debug!(conn_id = %id, error = %e, "undecodable client frame");
                Some(Message::error(400, "unrecognized message"))
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

async fn write_loop(
    writer: &mut FrameWriter,
    mut registration: Registration,
    mut control: mpsc::Receiver<Control>,
    liveness: watch::Receiver<Instant>,
    config: &HandlerConfig,
    expires_in: Duration,
    cancel: &CancellationToken,
) -> CloseReason {
    let id = writer.id();
    let codec = JsonCodec;
    let start = Instant::now();

    let mut heartbeat =
        time::interval_at(deadline(start, config.ping_interval), config.ping_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let silence = time::sleep_until(deadline(start, config.pong_timeout));
    tokio::pin!(silence);
    let expiry = time::sleep_until(deadline(start, expires_in));
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            biased;

            evicted = &mut registration.eviction => {
                // No value means the entry was removed without a reason,
                // which only happens when the hub itself is going away.
                return evicted.unwrap_or(CloseReason::ServerShutdown);
            }

            msg = control.recv() => match msg {
                Some(Control::Reply(message)) => match codec.encode(&message) {
                    Ok(frame) => {
                        if let Err(reason) =
                            guarded(id, config.write_timeout, writer.send_text(&frame)).await
                        {
                            return reason;
                        }
                    }
                    Err(e) => tracing::warn!(conn_id = %id, error = %e, "reply not encodable"),
                },
                Some(Control::Ended(reason)) => return reason,
                None => return CloseReason::ClientClosed,
            },

            _ = cancel.cancelled() => return CloseReason::ServerShutdown,

            frame = registration.queue.recv() => match frame {
                Some(frame) => {
                    if let Err(reason) =
                        guarded(id, config.write_timeout, writer.send_text(&frame)).await
                    {
                        return reason;
                    }
                }
                None => {
                    return registration
                        .eviction
                        .try_recv()
                        .unwrap_or(CloseReason::ServerShutdown);
                }
            },

            _ = &mut expiry => {
                tracing::info!(conn_id = %id, "session expired");
                return CloseReason::SessionExpired;
            }

            _ = &mut silence => {
                let last_seen = *liveness.borrow();
                let silent_until = deadline(last_seen, config.pong_timeout);
                if Instant::now() >= silent_until {
                    tracing::warn!(
                        conn_id = %id,
                        error = %ConnectionError::ReadTimeout,
                        silent_ms = last_seen.elapsed().as_millis() as u64,
                        "client silent too long"
                    );
                    return CloseReason::HeartbeatTimeout;
                }
                silence.as_mut().reset(silent_until);
            }

            _ = heartbeat.tick() => {
                if let Err(reason) = guarded(id, config.write_timeout, writer.send_ping()).await {
                    return reason;
                }
            }
        }
    }
}

/// `from + after`, or a point decades away if that overflows.
fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Runs one socket write under `limit`, mapping failure to a close reason.
async fn guarded(
    id: ConnectionId,
    limit: Duration,
    write: impl Future<Output = Result<(), ConnectionError>>,
) -> Result<(), CloseReason> {
    match time::timeout(limit, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(ConnectionError::Closed)) => Err(CloseReason::ClientClosed),
        Ok(Err(e)) => {
            tracing::debug!(conn_id = %id, error = %e, "write failed");
            Err(CloseReason::WriteFailed)
        }
        Err(_) => {
            tracing::warn!(conn_id = %id, error = %ConnectionError::WriteTimeout, "write stalled");
            Err(CloseReason::WriteFailed)
        }
    }
}

/// Best-effort close frame carrying the reason's code.
async fn close(writer: &mut FrameWriter, reason: CloseReason, limit: Duration) {
    let id = writer.id();
    match time::timeout(limit, writer.close(reason.close_code(), reason.as_str())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::trace!(conn_id = %id, error = %e, "close frame not sent"),
        Err(_) => tracing::debug!(conn_id = %id, "close frame timed out"),
    }
}
