//! Hub actor: the single task that owns the connection registry.
//!
//! Everything goes through [`HubHandle`], which wraps the actor's command
//! channel. The actor never awaits on a connection: delivery is a
//! `try_send` onto that connection's bounded queue, and a full queue gets
//! the connection evicted rather than waited on.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use vigil_protocol::{Codec, JsonCodec, Message, MessageKind, SessionId, UserId};
use vigil_session::{Revocation, RevocationListener, RevocationReason};
use vigil_transport::ConnectionId;

use crate::{CloseReason, HubConfig, HubError};

/// An encoded message, shared by every queue it is delivered to.
pub type Frame = Arc<str>;

/// Who a registered connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: String,
}

/// Handed to a connection handler by a successful `register`.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    /// Broadcast frames, in broadcast order. Drained by the writer.
    pub queue: mpsc::Receiver<Frame>,
    /// Fires when the hub evicts this connection. Dropped without a value
    /// when the connection is unregistered normally.
    pub eviction: oneshot::Receiver<CloseReason>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was queued for.
    pub delivered: usize,
    /// Connections removed during this broadcast (full or closed queue).
    pub evicted: usize,
}

/// Commands sent to the hub actor through its channel.
enum HubCommand {
    Register {
        id: ConnectionId,
        member: Member,
        reply: oneshot::Sender<Result<Registration, HubError>>,
    },
    Unregister {
        id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        frame: Frame,
        kind: MessageKind,
        reply: oneshot::Sender<BroadcastReport>,
    },
    DisconnectSession {
        session_id: SessionId,
        reason: CloseReason,
        reply: oneshot::Sender<usize>,
    },
    DisconnectUser {
        user_id: UserId,
        reason: CloseReason,
        reply: oneshot::Sender<usize>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

// ---------------------------------------------------------------------------
// HubHandle
// ---------------------------------------------------------------------------

/// Handle to the running hub actor.
///
/// Cheap to clone: it's an `mpsc::Sender` wrapper. The server, every
/// connection handler, the telemetry publisher, and the session authority
/// (as its revocation listener) each hold one.
#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
    codec: JsonCodec,
}

impl HubHandle {
    /// Spawns the hub actor and returns a handle plus the actor's task.
    pub fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        let config = config.validated();
        let (sender, receiver) = mpsc::channel(config.command_capacity);
        let actor = HubActor {
            entries: HashMap::new(),
            codec: JsonCodec,
            config,
            receiver,
        };
        let task = tokio::spawn(actor.run());
        (
            Self {
                sender,
                codec: JsonCodec,
            },
            task,
        )
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(make(reply_tx))
            .await
            .map_err(|_| HubError::Unavailable)?;
        reply_rx.await.map_err(|_| HubError::Unavailable)
    }

    /// Adds an already-authenticated connection to the registry.
    ///
    /// The hub doesn't re-validate; it records `member.session_id` so the
    /// connection can be found by a later revocation.
    ///
    /// # Errors
    /// [`HubError::AlreadyRegistered`] if `id` is taken,
    /// [`HubError::Unavailable`] after shutdown.
    pub async fn register(
        &self,
        id: ConnectionId,
        member: Member,
    ) -> Result<Registration, HubError> {
        self.request(|reply| HubCommand::Register { id, member, reply })
            .await?
    }

    /// Removes a connection. Idempotent: unknown ids and a stopped hub are
    /// both a quiet `false`.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        self.request(|reply| HubCommand::Unregister { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Queues `message` for every registered connection.
    ///
    /// Encodes once; each connection gets the same shared frame. Completes
    /// after one pass over the registry, regardless of how slow any client
    /// is.
    pub async fn broadcast(&self, message: &Message) -> Result<BroadcastReport, HubError> {
        let frame: Frame = self.codec.encode(message)?.into();
        let kind = message.kind;
        self.request(|reply| HubCommand::Broadcast { frame, kind, reply })
            .await
    }

    /// Evicts every connection registered under `session_id`.
    pub async fn disconnect_session(
        &self,
        session_id: SessionId,
        reason: CloseReason,
    ) -> Result<usize, HubError> {
        self.request(|reply| HubCommand::DisconnectSession {
            session_id,
            reason,
            reply,
        })
        .await
    }

    /// Evicts every connection belonging to `user_id`.
    pub async fn disconnect_user(
        &self,
        user_id: UserId,
        reason: CloseReason,
    ) -> Result<usize, HubError> {
        self.request(|reply| HubCommand::DisconnectUser {
            user_id,
            reason,
            reply,
        })
        .await
    }

    pub async fn connection_count(&self) -> Result<usize, HubError> {
        self.request(|reply| HubCommand::Count { reply }).await
    }

    /// Evicts every connection with [`CloseReason::ServerShutdown`] and
    /// stops the actor. Returns how many connections were evicted.
    pub async fn shutdown(&self) -> Result<usize, HubError> {
        self.request(|reply| HubCommand::Shutdown { reply }).await
    }
}

impl RevocationListener for HubHandle {
    async fn on_revoked(&self, revocation: Revocation, reason: RevocationReason) {
        let result = match revocation {
            Revocation::Session(session_id) => {
                self.disconnect_session(session_id, CloseReason::SessionRevoked)
                    .await
            }
            Revocation::User(user_id) => {
                self.disconnect_user(user_id, CloseReason::SessionRevoked)
                    .await
            }
        };
        match result {
            Ok(count) => tracing::debug!(
                ?revocation,
                reason = reason.as_str(),
                count,
                "revocation applied to live connections"
            ),
            Err(e) => tracing::warn!(?revocation, error = %e, "revocation not applied"),
        }
    }
}

// ---------------------------------------------------------------------------
// HubActor
// ---------------------------------------------------------------------------

/// One registry entry.
struct Entry {
    member: Member,
    queue: mpsc::Sender<Frame>,
    eviction: oneshot::Sender<CloseReason>,
}

/// The internal hub state. Runs inside a Tokio task.
struct HubActor {
    entries: HashMap<ConnectionId, Entry>,
    codec: JsonCodec,
    config: HubConfig,
    receiver: mpsc::Receiver<HubCommand>,
}

impl HubActor {
    /// Runs the actor loop, processing commands until shutdown.
    async fn run(mut self) {
        tracing::info!(
            queue_capacity = self.config.queue_capacity,
            "hub actor started"
        );

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                HubCommand::Register { id, member, reply } => {
                    let _ = reply.send(self.handle_register(id, member));
                }
                HubCommand::Unregister { id, reply } => {
                    let _ = reply.send(self.handle_unregister(id));
                }
                HubCommand::Broadcast { frame, kind, reply } => {
                    let report = self.broadcast_frame(frame);
                    tracing::trace!(
                        kind = kind.as_str(),
                        delivered = report.delivered,
                        evicted = report.evicted,
                        "broadcast"
                    );
                    let _ = reply.send(report);
                }
                HubCommand::DisconnectSession {
                    session_id,
                    reason,
                    reply,
                } => {
                    let count = self.evict_where(|m| m.session_id == session_id, reason);
                    let _ = reply.send(count);
                }
                HubCommand::DisconnectUser {
                    user_id,
                    reason,
                    reply,
                } => {
                    let count = self.evict_where(|m| m.user_id == user_id, reason);
                    let _ = reply.send(count);
                }
                HubCommand::Count { reply } => {
                    let _ = reply.send(self.entries.len());
                }
                HubCommand::Shutdown { reply } => {
                    let count = self.entries.len();
                    for (id, entry) in self.entries.drain() {
                        let _ = entry.eviction.send(CloseReason::ServerShutdown);
                        tracing::debug!(conn_id = %id, "evicted on shutdown");
                    }
                    tracing::info!(count, "hub shutting down");
                    let _ = reply.send(count);
                    break;
                }
            }
        }

        tracing::info!("hub actor stopped");
    }

    fn handle_register(
        &mut self,
        id: ConnectionId,
        member: Member,
    ) -> Result<Registration, HubError> {
        if self.entries.contains_key(&id) {
            return Err(HubError::AlreadyRegistered(id));
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let (eviction_tx, eviction_rx) = oneshot::channel();

        tracing::info!(
            conn_id = %id,
            user_id = %member.user_id,
            session_id = %member.session_id,
            connections = self.entries.len() + 1,
            "connection registered"
        );

        let joined = Message::user_joined(member.user_id, member.username.clone());
        self.entries.insert(
            id,
            Entry {
                member,
                queue: queue_tx,
                eviction: eviction_tx,
            },
        );

        if self.config.announce_presence {
            self.announce(&joined);
        }

        Ok(Registration {
            id,
            queue: queue_rx,
            eviction: eviction_rx,
        })
    }

    fn handle_unregister(&mut self, id: ConnectionId) -> bool {
        match self.remove(id, None) {
            Some(member) => {
                self.announce_departures(vec![member]);
                true
            }
            None => false,
        }
    }

    /// Removes an entry, signalling `reason` to its handler if given.
    fn remove(&mut self, id: ConnectionId, reason: Option<CloseReason>) -> Option<Member> {
        let entry = self.entries.remove(&id)?;
        match reason {
            Some(reason) => {
                let _ = entry.eviction.send(reason);
                tracing::info!(
                    conn_id = %id,
                    user_id = %entry.member.user_id,
                    %reason,
                    connections = self.entries.len(),
                    "connection evicted"
                );
            }
            None => tracing::info!(
                conn_id = %id,
                user_id = %entry.member.user_id,
                connections = self.entries.len(),
                "connection unregistered"
            ),
        }
        Some(entry.member)
    }

    fn evict_where(&mut self, predicate: impl Fn(&Member) -> bool, reason: CloseReason) -> usize {
        let ids: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(_, e)| predicate(&e.member))
            .map(|(id, _)| *id)
            .collect();
        let departed: Vec<Member> = ids
            .into_iter()
            .filter_map(|id| self.remove(id, Some(reason)))
            .collect();
        let count = departed.len();
        self.announce_departures(departed);
        count
    }

    /// Queues `frame` on every connection. Full queues are evicted as slow
    /// consumers; closed queues (handler already gone) are removed quietly.
    fn fan_out(&mut self, frame: &Frame) -> (BroadcastReport, Vec<Member>) {
        let mut report = BroadcastReport::default();
        let mut stalled = Vec::new();
        let mut gone = Vec::new();

        for (id, entry) in &self.entries {
            match entry.queue.try_send(Arc::clone(frame)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => stalled.push(*id),
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }

        let mut departed = Vec::with_capacity(stalled.len() + gone.len());
        for id in stalled {
            tracing::warn!(conn_id = %id, "outbound queue full, dropping slow consumer");
            departed.extend(self.remove(id, Some(CloseReason::SlowConsumer)));
        }
        for id in gone {
            departed.extend(self.remove(id, None));
        }
        report.evicted = departed.len();
        (report, departed)
    }

    fn broadcast_frame(&mut self, frame: Frame) -> BroadcastReport {
        let (report, departed) = self.fan_out(&frame);
        self.announce_departures(departed);
        report
    }

    /// Broadcasts `user_left` for each departed member. A departure
    /// announcement can itself evict slow consumers, so this works through
    /// a queue until nobody else leaves.
    fn announce_departures(&mut self, mut departed: Vec<Member>) {
        if !self.config.announce_presence {
            return;
        }
        while let Some(member) = departed.pop() {
            let left = Message::user_left(member.user_id, member.username);
            if let Some(frame) = self.encode(&left) {
                let (_, more) = self.fan_out(&frame);
                departed.extend(more);
            }
        }
    }

    fn announce(&mut self, message: &Message) {
        if let Some(frame) = self.encode(message) {
            let (_, departed) = self.fan_out(&frame);
            self.announce_departures(departed);
        }
    }

    fn encode(&self, message: &Message) -> Option<Frame> {
        match self.codec.encode(message) {
            Ok(text) => Some(text.into()),
            Err(e) => {
                tracing::warn!(kind = message.kind.as_str(), error = %e, "presence message not encoded");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> HubConfig {
        HubConfig {
            announce_presence: false,
            ..HubConfig::default()
        }
    }

    fn member() -> Member {
        Member {
            session_id: SessionId::new(),
            user_id: UserId::new(),
            username: "alice".into(),
        }
    }

    #[tokio::test]
    async fn test_register_duplicate_id_returns_already_registered() {
        let (hub, _task) = HubHandle::spawn(quiet());
        let id = ConnectionId::new(1);

        let _reg = hub.register(id, member()).await.unwrap();
        let err = hub.register(id, member()).await.unwrap_err();

        assert!(matches!(err, HubError::AlreadyRegistered(dup) if dup == id));
        assert_eq!(hub.connection_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unregister_twice_is_noop() {
        let (hub, _task) = HubHandle::spawn(quiet());
        let id = ConnectionId::new(1);
        let _reg = hub.register(id, member()).await.unwrap();

        assert!(hub.unregister(id).await);
        assert!(!hub.unregister(id).await);
        assert!(!hub.unregister(ConnectionId::new(99)).await);
        assert_eq!(hub.connection_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unregister_drops_eviction_without_reason() {
        let (hub, _task) = HubHandle::spawn(quiet());
        let id = ConnectionId::new(1);
        let reg = hub.register(id, member()).await.unwrap();

        hub.unregister(id).await;

        assert!(reg.eviction.await.is_err());
    }

    #[tokio::test]
    async fn test_broadcast_empty_hub_reports_zero() {
        let (hub, _task) = HubHandle::spawn(quiet());
        let report = hub.broadcast(&Message::ping()).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_broadcast_closed_queue_removed_quietly() {
        let (hub, _task) = HubHandle::spawn(quiet());
        let reg = hub.register(ConnectionId::new(1), member()).await.unwrap();
        drop(reg.queue);

        let report = hub.broadcast(&Message::ping()).await.unwrap();

        assert_eq!(report.delivered, 0);
        assert_eq!(report.evicted, 1);
        assert!(reg.eviction.await.is_err());
        assert_eq!(hub.connection_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_evicts_all_then_unavailable() {
        let (hub, task) = HubHandle::spawn(quiet());
        let a = hub.register(ConnectionId::new(1), member()).await.unwrap();
        let b = hub.register(ConnectionId::new(2), member()).await.unwrap();

        assert_eq!(hub.shutdown().await.unwrap(), 2);
        task.await.unwrap();

        assert_eq!(a.eviction.await.unwrap(), CloseReason::ServerShutdown);
        assert_eq!(b.eviction.await.unwrap(), CloseReason::ServerShutdown);
        assert!(matches!(
            hub.connection_count().await,
            Err(HubError::Unavailable)
        ));
        assert!(!hub.unregister(ConnectionId::new(1)).await);
    }
}
