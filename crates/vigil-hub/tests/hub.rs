//! Integration tests for the hub actor.
//!
//! These drive the hub purely through `HubHandle`, with the test playing
//! the part of each connection's writer by draining `Registration::queue`.

use std::time::Duration;

use vigil_hub::{CloseReason, HubConfig, HubHandle, Member, Registration};
use vigil_protocol::{Message, MessageKind, Notification, NotificationLevel, SessionId, UserId};
use vigil_session::{ClientInfo, RevocationReason, SessionAuthority, SessionConfig, UserIdentity};
use vigil_transport::ConnectionId;

fn quiet(queue_capacity: usize) -> HubConfig {
    HubConfig {
        queue_capacity,
        announce_presence: false,
        ..HubConfig::default()
    }
}

fn member(name: &str) -> Member {
    Member {
        session_id: SessionId::new(),
        user_id: UserId::new(),
        username: name.to_string(),
    }
}

fn notice(n: u32) -> Message {
    Message::notification(&Notification {
        title: format!("notice {n}"),
        message: String::new(),
        level: NotificationLevel::Info,
    })
}

/// Pulls one frame off a queue without waiting.
fn take(reg: &mut Registration) -> Option<Message> {
    reg.queue
        .try_recv()
        .ok()
        .map(|frame| serde_json::from_str(&frame).expect("hub frames are valid json"))
}

fn title(message: &Message) -> String {
    message.data["title"].as_str().unwrap_or_default().to_string()
}

// =========================================================================
// Fan-out and ordering
// =========================================================================

#[tokio::test]
async fn test_broadcast_reaches_every_registered_connection() {
    let (hub, _task) = HubHandle::spawn(quiet(16));
    let mut regs = Vec::new();
    for i in 0..10 {
        regs.push(
            hub.register(ConnectionId::new(i), member("u"))
                .await
                .unwrap(),
        );
    }

    let report = hub.broadcast(&notice(1)).await.unwrap();

    assert_eq!(report.delivered, 10);
    assert_eq!(report.evicted, 0);
    for reg in &mut regs {
        let msg = take(reg).expect("every connection gets the frame");
        assert_eq!(msg.kind, MessageKind::Notification);
    }
}

#[tokio::test]
async fn test_broadcast_preserves_call_order_per_connection() {
    let (hub, _task) = HubHandle::spawn(quiet(16));
    let mut reg = hub
        .register(ConnectionId::new(1), member("u"))
        .await
        .unwrap();

    for n in 0..5 {
        hub.broadcast(&notice(n)).await.unwrap();
    }

    let titles: Vec<String> = std::iter::from_fn(|| take(&mut reg))
        .map(|m| title(&m))
        .collect();
    assert_eq!(
        titles,
        vec!["notice 0", "notice 1", "notice 2", "notice 3", "notice 4"]
    );
}

// =========================================================================
// Backpressure
// =========================================================================

#[tokio::test]
async fn test_broadcast_fifty_connections_one_stalled_only_it_dropped() {
    let capacity = 4;
    let (hub, _task) = HubHandle::spawn(quiet(capacity));

    let mut healthy = Vec::new();
    for i in 0..49 {
        healthy.push(
            hub.register(ConnectionId::new(i), member("healthy"))
                .await
                .unwrap(),
        );
    }
    let stalled_id = ConnectionId::new(49);
    let stalled = hub.register(stalled_id, member("stalled")).await.unwrap();

    // Fill the stalled queue, draining the healthy ones after each round.
    for n in 0..capacity as u32 {
        let report = hub.broadcast(&notice(n)).await.unwrap();
        assert_eq!(report.delivered, 50);
        for reg in &mut healthy {
            assert_eq!(title(&take(reg).unwrap()), format!("notice {n}"));
        }
    }

    // The next broadcast overflows the stalled queue.
    let report = hub.broadcast(&notice(100)).await.unwrap();
    assert_eq!(report.delivered, 49);
    assert_eq!(report.evicted, 1);
    assert_eq!(stalled.eviction.await.unwrap(), CloseReason::SlowConsumer);
    assert_eq!(hub.connection_count().await.unwrap(), 49);

    // Everyone else keeps receiving every subsequent broadcast.
    for reg in &mut healthy {
        assert_eq!(title(&take(reg).unwrap()), "notice 100");
    }
    hub.broadcast(&notice(101)).await.unwrap();
    for reg in &mut healthy {
        assert_eq!(title(&take(reg).unwrap()), "notice 101");
    }

    // The evicted id is gone; unregistering it again is a no-op.
    assert!(!hub.unregister(stalled_id).await);
}

#[tokio::test]
async fn test_broadcast_never_waits_on_a_full_queue() {
    let (hub, _task) = HubHandle::spawn(quiet(1));
    let _stuck = hub
        .register(ConnectionId::new(1), member("u"))
        .await
        .unwrap();

    // Nobody ever drains the queue; all broadcasts must still complete.
    tokio::time::timeout(Duration::from_secs(1), async {
        for n in 0..100 {
            hub.broadcast(&notice(n)).await.unwrap();
        }
    })
    .await
    .expect("broadcast must not block on a stalled consumer");
}

// =========================================================================
// Targeted disconnects and revocation
// =========================================================================

#[tokio::test]
async fn test_disconnect_session_evicts_only_matching_connections() {
    let (hub, _task) = HubHandle::spawn(quiet(8));
    let target = member("alice");
    let mut other_session = target.clone();
    other_session.session_id = SessionId::new();

    let a = hub.register(ConnectionId::new(1), target.clone()).await.unwrap();
    let b = hub.register(ConnectionId::new(2), target.clone()).await.unwrap();
    let mut c = hub.register(ConnectionId::new(3), other_session).await.unwrap();

    let count = hub
        .disconnect_session(target.session_id, CloseReason::SessionRevoked)
        .await
        .unwrap();

    assert_eq!(count, 2);
    assert_eq!(a.eviction.await.unwrap(), CloseReason::SessionRevoked);
    assert_eq!(b.eviction.await.unwrap(), CloseReason::SessionRevoked);
    assert!(c.eviction.try_recv().is_err());
    assert_eq!(hub.connection_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_disconnect_user_evicts_all_sessions_of_user() {
    let (hub, _task) = HubHandle::spawn(quiet(8));
    let alice_laptop = member("alice");
    let mut alice_phone = member("alice");
    alice_phone.user_id = alice_laptop.user_id;
    let bob = member("bob");

    let laptop = hub.register(ConnectionId::new(1), alice_laptop.clone()).await.unwrap();
    let phone = hub.register(ConnectionId::new(2), alice_phone).await.unwrap();
    let _bob = hub.register(ConnectionId::new(3), bob).await.unwrap();

    let count = hub
        .disconnect_user(alice_laptop.user_id, CloseReason::SessionRevoked)
        .await
        .unwrap();

    assert_eq!(count, 2);
    assert_eq!(laptop.eviction.await.unwrap(), CloseReason::SessionRevoked);
    assert_eq!(phone.eviction.await.unwrap(), CloseReason::SessionRevoked);
    assert_eq!(hub.connection_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_revoke_session_through_authority_evicts_live_connection() {
    let (hub, _task) = HubHandle::spawn(quiet(8));
    let authority = SessionAuthority::new(b"secret", SessionConfig::default())
        .with_listener(hub.clone());
    let user = UserIdentity {
        user_id: UserId::new(),
        username: "alice".into(),
    };
    let issued = authority.issue_session(&user, ClientInfo::default()).unwrap();
    let principal = authority.validate_token(&issued.token).unwrap();

    let reg = hub
        .register(
            ConnectionId::new(1),
            Member {
                session_id: principal.session_id,
                user_id: principal.user_id,
                username: principal.username,
            },
        )
        .await
        .unwrap();

    authority
        .revoke_session(issued.session_id, RevocationReason::Logout)
        .await
        .unwrap();

    assert_eq!(reg.eviction.await.unwrap(), CloseReason::SessionRevoked);
    assert_eq!(hub.connection_count().await.unwrap(), 0);
}

// =========================================================================
// Presence
// =========================================================================

#[tokio::test]
async fn test_presence_announces_join_and_leave() {
    let (hub, _task) = HubHandle::spawn(HubConfig {
        queue_capacity: 8,
        ..HubConfig::default()
    });
    let watcher = member("watcher");
    let mut watching = hub.register(ConnectionId::new(1), watcher).await.unwrap();
    // The watcher sees its own join.
    assert_eq!(take(&mut watching).unwrap().kind, MessageKind::UserJoined);

    let bob = member("bob");
    let bob_id = ConnectionId::new(2);
    let _bob_reg = hub.register(bob_id, bob.clone()).await.unwrap();

    let joined = take(&mut watching).unwrap();
    assert_eq!(joined.kind, MessageKind::UserJoined);
    assert_eq!(joined.user_id, Some(bob.user_id));
    assert_eq!(joined.username.as_deref(), Some("bob"));

    hub.unregister(bob_id).await;

    let left = take(&mut watching).unwrap();
    assert_eq!(left.kind, MessageKind::UserLeft);
    assert_eq!(left.user_id, Some(bob.user_id));
}

#[tokio::test]
async fn test_presence_disabled_sends_nothing_on_join() {
    let (hub, _task) = HubHandle::spawn(quiet(8));
    let mut a = hub.register(ConnectionId::new(1), member("a")).await.unwrap();
    let _b = hub.register(ConnectionId::new(2), member("b")).await.unwrap();
    assert!(take(&mut a).is_none());
}
