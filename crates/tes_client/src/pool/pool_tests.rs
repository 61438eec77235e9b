#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{Value, json};
use tes_domain::{Condition, EventType, Subscription, Transport};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use super::*;
use crate::testing::{
	ServerEnd, channel_connector, failing_connector, keepalive_frame, notification_frame, reconnect_frame,
	revocation_frame, welcome_frame,
};

fn ws_url() -> Url {
	Url::parse("wss://eventsub.example.test/ws").unwrap()
}

fn sub(id: &str, kind: &str, broadcaster: &str, session: &str) -> Subscription {
	Subscription {
		id: id.to_string(),
		kind: kind.to_string(),
		version: "1".to_string(),
		status: Some("enabled".to_string()),
		condition: Condition::from([("broadcaster_user_id", broadcaster)]),
		transport: Transport::websocket(session),
		created_at: None,
		cost: Some(0),
	}
}

/// Let spawned session tasks drain their queues.
async fn settle() {
	sleep(Duration::from_millis(1)).await;
}

type Seen = Arc<Mutex<Vec<(EventType, Value)>>>;

fn recording_dispatcher() -> (EventDispatcher, Seen) {
	let d = EventDispatcher::new();
	let seen: Seen = Arc::new(Mutex::new(Vec::new()));
	for kind in ["channel.update", "connection_lost", "revocation"] {
		let s = seen.clone();
		d.on(kind, move |payload, desc| s.lock().push((desc.event_type(), payload.clone())));
	}
	(d, seen)
}

async fn open_session(
	pool: &ConnectionPool,
	accepted: &mut mpsc::UnboundedReceiver<ServerEnd>,
	session_id: &str,
) -> ServerEnd {
	let p = pool.clone();
	let waiter = tokio::spawn(async move { p.get_free_connection().await });
	let server = accepted.recv().await.unwrap();
	server.send_json(welcome_frame(session_id, 10));
	assert_eq!(waiter.await.unwrap().unwrap(), session_id);
	server
}

#[tokio::test(start_paused = true)]
async fn free_connection_waits_for_welcome() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());

	let p = pool.clone();
	let waiter = tokio::spawn(async move { p.get_free_connection().await });

	let server = accepted.recv().await.unwrap();
	assert_eq!(server.url, ws_url());
	settle().await;
	assert!(!waiter.is_finished());
	assert_eq!(pool.connection_count(), 0);

	server.send_json(welcome_frame("s1", 10));
	assert_eq!(waiter.await.unwrap().unwrap(), "s1");
	assert_eq!(pool.connection_count(), 1);
	assert_eq!(pool.keepalive("s1"), Some(Duration::from_secs(10)));

	// Existing connection with room is reused without dialing.
	assert_eq!(pool.get_free_connection().await.unwrap(), "s1");
	assert!(accepted.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn full_connections_spill_over_until_capacity() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());

	let mut servers = Vec::new();
	for n in 0..MAX_CONNECTIONS {
		let session = format!("s{n}");
		servers.push(open_session(&pool, &mut accepted, &session).await);
		for i in 0..MAX_SUBSCRIPTIONS_PER_CONNECTION {
			pool.add_subscription(&session, &sub(&format!("{session}-{i}"), "channel.update", &i.to_string(), &session))
				.unwrap();
		}
		assert_eq!(pool.subscription_count(&session), Some(MAX_SUBSCRIPTIONS_PER_CONNECTION));
	}

	assert!(matches!(pool.get_free_connection().await, Err(TesError::Capacity)));
	assert!(matches!(
		pool.add_subscription("s0", &sub("overflow", "channel.update", "x", "s0")),
		Err(TesError::Capacity)
	));
	assert_eq!(pool.connection_count(), MAX_CONNECTIONS);

	pool.remove_subscription("s1-7");
	assert_eq!(pool.get_free_connection().await.unwrap(), "s1");
}

#[tokio::test(start_paused = true)]
async fn failed_dial_releases_reservation() {
	let pool = ConnectionPool::new(ws_url(), failing_connector(), EventDispatcher::new());

	for _ in 0..(MAX_CONNECTIONS + 1) {
		let err = pool.get_free_connection().await.unwrap_err();
		assert!(matches!(err, TesError::Websocket(_)), "{err}");
	}
	assert_eq!(pool.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn hang_up_before_welcome_fails_waiter() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());

	let p = pool.clone();
	let waiter = tokio::spawn(async move { p.get_free_connection().await });
	let mut server = accepted.recv().await.unwrap();
	server.hang_up();

	assert!(matches!(waiter.await.unwrap(), Err(TesError::Websocket(_))));
	assert_eq!(pool.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_and_frees_the_dial() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());

	let p = pool.clone();
	let waiter = tokio::spawn(async move { p.get_free_connection().await });
	let _silent = accepted.recv().await.unwrap();

	sleep(WELCOME_TIMEOUT - Duration::from_millis(1)).await;
	assert!(!waiter.is_finished());

	sleep(Duration::from_millis(2)).await;
	assert!(matches!(waiter.await.unwrap(), Err(TesError::Websocket(_))));
	assert_eq!(pool.connection_count(), 0);

	// The abandoned dial no longer counts against the cap.
	let p = pool.clone();
	let waiter = tokio::spawn(async move { p.get_free_connection().await });
	let server = accepted.recv().await.unwrap();
	server.send_json(welcome_frame("s1", 10));
	assert_eq!(waiter.await.unwrap().unwrap(), "s1");
}

#[tokio::test(start_paused = true)]
async fn reserved_slots_count_against_the_limit() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());
	let _s1 = open_session(&pool, &mut accepted, "s1").await;

	for i in 0..MAX_SUBSCRIPTIONS_PER_CONNECTION - 1 {
		pool.add_subscription("s1", &sub(&format!("s1-{i}"), "channel.update", &i.to_string(), "s1"))
			.unwrap();
	}

	let slot = pool.reserve_slot().await.unwrap();
	assert_eq!(slot.session_id(), "s1");
	assert!(matches!(
		pool.add_subscription("s1", &sub("late", "channel.update", "late", "s1")),
		Err(TesError::Capacity)
	));

	// With the last slot held, the next caller dials a fresh session.
	let p = pool.clone();
	let waiter = tokio::spawn(async move { p.reserve_slot().await.map(|r| r.session_id().to_string()) });
	let s2 = accepted.recv().await.unwrap();
	s2.send_json(welcome_frame("s2", 10));
	assert_eq!(waiter.await.unwrap().unwrap(), "s2");

	slot.commit(&sub("last", "channel.update", "last", "s1")).unwrap();
	assert_eq!(pool.subscription_count("s1"), Some(MAX_SUBSCRIPTIONS_PER_CONNECTION));
	let last = Condition::from([("broadcaster_user_id", "last")]);
	assert_eq!(pool.find_subscription_id("channel.update", &last), Some("last".to_string()));
}

#[tokio::test(start_paused = true)]
async fn dropped_reservation_gives_the_slot_back() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());
	let _s1 = open_session(&pool, &mut accepted, "s1").await;

	for i in 0..MAX_SUBSCRIPTIONS_PER_CONNECTION - 1 {
		pool.add_subscription("s1", &sub(&format!("s1-{i}"), "channel.update", &i.to_string(), "s1"))
			.unwrap();
	}

	drop(pool.reserve_slot().await.unwrap());
	pool.add_subscription("s1", &sub("last", "channel.update", "last", "s1")).unwrap();
	assert_eq!(pool.subscription_count("s1"), Some(MAX_SUBSCRIPTIONS_PER_CONNECTION));
	assert!(accepted.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn commit_after_session_left_is_not_found() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());
	let mut server = open_session(&pool, &mut accepted, "s1").await;

	let slot = pool.reserve_slot().await.unwrap();
	server.hang_up();
	settle().await;
	assert_eq!(pool.connection_count(), 0);

	assert!(matches!(
		slot.commit(&sub("a", "channel.update", "1", "s1")),
		Err(TesError::NotFound(_))
	));
	let cond = Condition::from([("broadcaster_user_id", "1")]);
	assert_eq!(pool.find_subscription_id("channel.update", &cond), None);
}

#[tokio::test(start_paused = true)]
async fn notification_is_dispatched_by_subscription_type() {
	let (connector, mut accepted) = channel_connector();
	let (dispatcher, seen) = recording_dispatcher();
	let pool = ConnectionPool::new(ws_url(), connector, dispatcher);

	let server = open_session(&pool, &mut accepted, "s1").await;
	let s = sub("sub-1", "channel.update", "1337", "s1");
	pool.add_subscription("s1", &s).unwrap();

	server.send_json(notification_frame(&s, json!({ "title": "new title" })));
	settle().await;

	let seen = seen.lock();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].0, EventType::from("channel.update"));
	assert_eq!(seen[0].1["title"], "new title");
}

#[tokio::test(start_paused = true)]
async fn keepalives_hold_liveness_and_silence_loses_connection() {
	let (connector, mut accepted) = channel_connector();
	let (dispatcher, seen) = recording_dispatcher();
	let pool = ConnectionPool::new(ws_url(), connector, dispatcher);

	let mut server = open_session(&pool, &mut accepted, "s1").await;
	pool.add_subscription("s1", &sub("sub-1", "channel.update", "1337", "s1")).unwrap();

	sleep(Duration::from_secs(10)).await;
	server.send_json(keepalive_frame());
	settle().await;

	sleep(Duration::from_secs(10)).await;
	assert_eq!(pool.connection_count(), 1);
	assert!(seen.lock().is_empty());

	sleep(Duration::from_millis(200)).await;
	assert_eq!(pool.connection_count(), 0);

	let seen = seen.lock();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].0, EventType::ConnectionLost);
	assert_eq!(
		seen[0].1,
		json!({ "sub-1": { "type": "channel.update", "condition": { "broadcaster_user_id": "1337" } } })
	);
	drop(seen);

	// Socket is dropped by the finished task.
	assert!(server.from_client.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn revocation_fires_and_forgets_subscription() {
	let (connector, mut accepted) = channel_connector();
	let (dispatcher, seen) = recording_dispatcher();
	let pool = ConnectionPool::new(ws_url(), connector, dispatcher);

	let server = open_session(&pool, &mut accepted, "s1").await;
	let s = sub("sub-1", "channel.update", "1337", "s1");
	pool.add_subscription("s1", &s).unwrap();
	assert_eq!(
		pool.find_subscription_id("channel.update", &s.condition).as_deref(),
		Some("sub-1")
	);

	let mut revoked = s.clone();
	revoked.status = Some("authorization_revoked".to_string());
	server.send_json(revocation_frame(&revoked));
	settle().await;

	assert_eq!(pool.find_subscription_id("channel.update", &s.condition), None);
	let seen = seen.lock();
	assert_eq!(seen.len(), 1);
	assert_eq!(seen[0].0, EventType::Revocation);
	assert_eq!(seen[0].1["status"], "authorization_revoked");
}

#[tokio::test(start_paused = true)]
async fn socket_close_removes_connection_without_loss_event() {
	let (connector, mut accepted) = channel_connector();
	let (dispatcher, seen) = recording_dispatcher();
	let pool = ConnectionPool::new(ws_url(), connector, dispatcher);

	let server = open_session(&pool, &mut accepted, "s1").await;
	server.send(Message::Close(None));
	settle().await;

	assert_eq!(pool.connection_count(), 0);
	assert!(seen.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_swaps_in_replacement_after_its_welcome() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());

	let mut old = open_session(&pool, &mut accepted, "s1").await;
	pool.add_subscription("s1", &sub("sub-1", "channel.update", "1337", "s1")).unwrap();

	old.send_json(reconnect_frame("s1", "wss://reconnect.example.test/ws?id=s1"));
	let new = accepted.recv().await.unwrap();
	assert_eq!(new.url.as_str(), "wss://reconnect.example.test/ws?id=s1");

	settle().await;
	assert_eq!(pool.session_ids(), vec!["s1".to_string()]);
	assert_eq!(pool.subscription_count("s1"), Some(1));

	new.send_json(welcome_frame("s1", 10));
	settle().await;

	// Same session id, fresh entry: records are not carried over.
	assert_eq!(pool.connection_count(), 1);
	assert_eq!(pool.subscription_count("s1"), Some(0));
	assert!(old.from_client.recv().await.is_none());

	// The old socket going away must not evict its replacement.
	settle().await;
	assert_eq!(pool.session_ids(), vec!["s1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn ping_is_answered_with_pong() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());

	let mut server = open_session(&pool, &mut accepted, "s1").await;
	server.send(Message::Ping(vec![1u8, 2, 3].into()));

	let reply = server.from_client.recv().await.unwrap();
	assert_eq!(reply, Message::Pong(vec![1u8, 2, 3].into()));
}

#[tokio::test(start_paused = true)]
async fn close_all_empties_pool() {
	let (connector, mut accepted) = channel_connector();
	let pool = ConnectionPool::new(ws_url(), connector, EventDispatcher::new());

	let mut server = open_session(&pool, &mut accepted, "s1").await;
	pool.add_subscription("s1", &sub("x", "channel.update", "1", "s1")).unwrap();

	pool.close_all();
	assert_eq!(pool.connection_count(), 0);
	assert!(server.from_client.recv().await.is_none());
}

#[test]
fn add_to_unknown_connection_is_not_found() {
	let pool = ConnectionPool::new(ws_url(), failing_connector(), EventDispatcher::new());
	assert!(matches!(
		pool.add_subscription("nope", &sub("a", "t", "1", "nope")),
		Err(TesError::NotFound(_))
	));
}

#[test]
fn find_after_add_and_after_remove() {
	let pool = ConnectionPool::new(ws_url(), failing_connector(), EventDispatcher::new());
	let _a = pool.insert_detached("s1");
	let _b = pool.insert_detached("s2");

	let s = sub("sub-9", "channel.update", "1337", "s2");
	pool.add_subscription("s2", &s).unwrap();
	assert_eq!(
		pool.find_subscription_id("channel.update", &Condition::from([("broadcaster_user_id", "1337")]))
			.as_deref(),
		Some("sub-9")
	);
	assert_eq!(
		pool.find_subscription_id(
			"channel.update",
			&Condition::from([("broadcaster_user_id", "1337"), ("extra", "1")])
		),
		None
	);

	pool.remove_subscription("sub-9");
	pool.remove_subscription("sub-9");
	assert_eq!(pool.find_subscription_id("channel.update", &s.condition), None);
}

#[derive(Debug, Clone)]
enum Op {
	Add { conn: usize, id: u16 },
	Remove { id: u16 },
}

fn op() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0usize..MAX_CONNECTIONS, 0u16..400).prop_map(|(conn, id)| Op::Add { conn, id }),
		(0u16..400).prop_map(|id| Op::Remove { id }),
	]
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(64))]

	#[test]
	fn pool_never_exceeds_limits(ops in prop::collection::vec(op(), 1..1200)) {
		let pool = ConnectionPool::new(ws_url(), failing_connector(), EventDispatcher::new());
		let _controls: Vec<_> = (0..MAX_CONNECTIONS).map(|n| pool.insert_detached(&format!("s{n}"))).collect();

		for op in ops {
			match op {
				Op::Add { conn, id } => {
					let session = format!("s{conn}");
					let s = sub(&format!("{session}-{id}"), "channel.update", &id.to_string(), &session);
					let _ = pool.add_subscription(&session, &s);
					if let Some(found) = pool.find_subscription_id("channel.update", &s.condition) {
						let suffix = format!("-{id}");
						prop_assert!(found.ends_with(&suffix));
					}
				}
				Op::Remove { id } => {
					for n in 0..MAX_CONNECTIONS {
						pool.remove_subscription(&format!("s{n}-{id}"));
					}
					let cond = Condition::from([("broadcaster_user_id", id.to_string())]);
					prop_assert_eq!(pool.find_subscription_id("channel.update", &cond), None);
				}
			}

			prop_assert!(pool.connection_count() <= MAX_CONNECTIONS);
			for session in pool.session_ids() {
				prop_assert!(pool.subscription_count(&session).unwrap_or(0) <= MAX_SUBSCRIPTIONS_PER_CONNECTION);
			}
		}
	}
}
