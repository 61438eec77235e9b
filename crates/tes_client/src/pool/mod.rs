#![forbid(unsafe_code)]

//! Pool of websocket sessions multiplexing subscriptions.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tes_domain::{Condition, EventDescriptor, Subscription};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::dispatch::EventDispatcher;
use crate::error::TesError;
use crate::eventsub;

pub mod session;

#[cfg(test)]
mod pool_tests;

pub use session::{LIVENESS_GRACE, SessionAction, SessionInput, SessionState, WELCOME_TIMEOUT};

pub const MAX_CONNECTIONS: usize = 3;
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 300;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Duplex message socket a session runs over.
pub trait SessionSocket: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin {}

impl<T> SessionSocket for T where T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin {}

pub type BoxSocket = Box<dyn SessionSocket>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<BoxSocket>> + Send + Sync>;

async fn connect_eventsub_ws(url: Url) -> anyhow::Result<BoxSocket> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to eventsub ws")?;
	Ok(Box::new(ws))
}

/// Connector dialing real websocket endpoints.
pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(connect_eventsub_ws(url)) as BoxFuture<'static, anyhow::Result<BoxSocket>>)
}

/// Locally tracked `(type, condition)` of a subscription bound to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
	pub kind: String,
	pub condition: Condition,
}

#[derive(Debug)]
enum SessionCommand {
	Close,
}

struct Connection {
	/// Distinguishes a session from its replacement, which may reuse the session id.
	seq: u64,
	keepalive: Duration,
	subscriptions: HashMap<String, SubscriptionRecord>,
	/// Slots handed out by `reserve_slot` whose subscription is still being created.
	pending: usize,
	control: mpsc::UnboundedSender<SessionCommand>,
}

impl Connection {
	fn has_room(&self) -> bool {
		self.subscriptions.len() + self.pending < MAX_SUBSCRIPTIONS_PER_CONNECTION
	}
}

#[derive(Default)]
struct PoolState {
	connections: HashMap<String, Connection>,
	/// Fresh sessions dialed but not yet welcomed; they count against the cap.
	opening: usize,
}

/// Why a session task was started.
enum SessionRole {
	Fresh(oneshot::Sender<Result<String, TesError>>),
	Replacement { previous: String, previous_seq: u64 },
}

struct PoolInner {
	url: Url,
	connector: WsConnector,
	dispatcher: EventDispatcher,
	state: Mutex<PoolState>,
	next_seq: AtomicU64,
}

/// Up to three websocket sessions, each carrying up to 300 subscriptions.
#[derive(Clone)]
pub struct ConnectionPool {
	inner: Arc<PoolInner>,
}

impl ConnectionPool {
	pub fn new(url: Url, connector: WsConnector, dispatcher: EventDispatcher) -> Self {
		Self {
			inner: Arc::new(PoolInner {
				url,
				connector,
				dispatcher,
				state: Mutex::new(PoolState::default()),
				next_seq: AtomicU64::new(1),
			}),
		}
	}

	/// Session id of a connection with room for another subscription, dialing a new one
	/// (and waiting for its welcome) when none has room.
	pub async fn get_free_connection(&self) -> Result<String, TesError> {
		let slot = self.reserve_slot().await?;
		Ok(slot.session_id().to_string())
	}

	/// Like [`get_free_connection`](Self::get_free_connection), but holds one slot on the
	/// returned session until the reservation is committed or dropped.
	pub async fn reserve_slot(&self) -> Result<SlotReservation, TesError> {
		loop {
			let rx = {
				let mut state = self.inner.state.lock();

				if let Some((id, conn)) = state.connections.iter_mut().find(|(_, c)| c.has_room()) {
					conn.pending += 1;
					debug!(session_id = %id, pending = conn.pending, "reserved slot on websocket connection");
					return Ok(SlotReservation {
						pool: self.inner.clone(),
						session_id: id.clone(),
						seq: conn.seq,
						held: true,
					});
				}

				if state.connections.len() + state.opening >= MAX_CONNECTIONS {
					debug!("no free websocket connection and pool is full");
					return Err(TesError::Capacity);
				}

				state.opening += 1;
				let (tx, rx) = oneshot::channel();
				debug!("no free websocket connection, opening a new one");
				self.spawn_session(self.inner.url.clone(), SessionRole::Fresh(tx));
				rx
			};

			// The welcomed session is picked up on the next pass, unless others filled it first.
			let session_id = rx
				.await
				.map_err(|_| TesError::Websocket("session ended before welcome".to_string()))??;
			debug!(%session_id, "new websocket connection welcomed");
		}
	}

	/// Record `subscription` under the session it was created on.
	pub fn add_subscription(&self, session_id: &str, subscription: &Subscription) -> Result<(), TesError> {
		let mut state = self.inner.state.lock();
		let Some(conn) = state.connections.get_mut(session_id) else {
			return Err(TesError::NotFound(format!("websocket connection {session_id} not found")));
		};

		if !conn.subscriptions.contains_key(&subscription.id) && !conn.has_room() {
			return Err(TesError::Capacity);
		}

		conn.subscriptions.insert(
			subscription.id.clone(),
			SubscriptionRecord {
				kind: subscription.kind.clone(),
				condition: subscription.condition.clone(),
			},
		);
		Ok(())
	}

	/// Forget `id` on every session. Idempotent.
	pub fn remove_subscription(&self, id: &str) {
		self.inner.remove_subscription(id);
	}

	/// First locally tracked subscription with this type and a shallow-equal condition.
	pub fn find_subscription_id(&self, kind: &str, condition: &Condition) -> Option<String> {
		let state = self.inner.state.lock();
		state.connections.values().find_map(|conn| {
			conn.subscriptions
				.iter()
				.find(|(_, rec)| rec.kind == kind && rec.condition.shallow_eq(condition))
				.map(|(id, _)| id.clone())
		})
	}

	pub fn connection_count(&self) -> usize {
		self.inner.state.lock().connections.len()
	}

	pub fn session_ids(&self) -> Vec<String> {
		self.inner.state.lock().connections.keys().cloned().collect()
	}

	pub fn subscription_count(&self, session_id: &str) -> Option<usize> {
		self.inner
			.state
			.lock()
			.connections
			.get(session_id)
			.map(|c| c.subscriptions.len())
	}

	pub fn keepalive(&self, session_id: &str) -> Option<Duration> {
		self.inner.state.lock().connections.get(session_id).map(|c| c.keepalive)
	}

	/// Ask every session to close; each removes itself from the pool.
	pub fn close_all(&self) {
		let mut state = self.inner.state.lock();
		for (id, conn) in state.connections.drain() {
			debug!(session_id = %id, "closing websocket session");
			let _ = conn.control.send(SessionCommand::Close);
		}
		metrics::gauge!("tes_ws_connections").set(0.0);
	}

	fn spawn_session(&self, url: Url, role: SessionRole) {
		let inner = self.inner.clone();
		let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
		tokio::spawn(async move {
			run_session(inner, url, role, seq).await;
		});
	}

	#[cfg(test)]
	fn insert_detached(&self, session_id: &str) -> mpsc::UnboundedReceiver<SessionCommand> {
		let (control, rx) = mpsc::unbounded_channel();
		let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
		self.inner.state.lock().connections.insert(
			session_id.to_string(),
			Connection {
				seq,
				keepalive: session::DEFAULT_KEEPALIVE,
				subscriptions: HashMap::new(),
				pending: 0,
				control,
			},
		);
		rx
	}
}

impl PoolInner {
	/// Put a welcomed session into the pool. Returns false if it must close instead.
	fn register(
		&self,
		session_id: &str,
		seq: u64,
		keepalive: Duration,
		control: mpsc::UnboundedSender<SessionCommand>,
		role: SessionRole,
	) -> bool {
		let conn = Connection {
			seq,
			keepalive,
			subscriptions: HashMap::new(),
			pending: 0,
			control,
		};

		let mut state = self.state.lock();
		let registered = match role {
			SessionRole::Fresh(reply) => {
				state.opening = state.opening.saturating_sub(1);
				state.connections.insert(session_id.to_string(), conn);
				let _ = reply.send(Ok(session_id.to_string()));
				info!(%session_id, "websocket session welcomed");
				true
			}
			SessionRole::Replacement { previous, previous_seq } => {
				let still_there = state.connections.get(&previous).is_some_and(|c| c.seq == previous_seq);
				if still_there {
					if let Some(old) = state.connections.remove(&previous) {
						let _ = old.control.send(SessionCommand::Close);
					}
					state.connections.insert(session_id.to_string(), conn);
					info!(%session_id, %previous, "websocket session replaced after reconnect");
					true
				} else if state.connections.len() + state.opening < MAX_CONNECTIONS {
					state.connections.insert(session_id.to_string(), conn);
					info!(%session_id, %previous, "websocket reconnect welcomed after previous session ended");
					true
				} else {
					warn!(%session_id, %previous, "websocket reconnect welcomed but pool is full; closing it");
					false
				}
			}
		};

		metrics::gauge!("tes_ws_connections").set(state.connections.len() as f64);
		registered
	}

	fn deregister(&self, session_id: &str, seq: u64) {
		let mut state = self.state.lock();
		if state.connections.get(session_id).is_some_and(|c| c.seq == seq) {
			state.connections.remove(session_id);
			debug!(%session_id, "websocket session removed from pool");
		}
		metrics::gauge!("tes_ws_connections").set(state.connections.len() as f64);
	}

	/// A session task ended before its welcome.
	fn abandon(&self, role: SessionRole, reason: String) {
		match role {
			SessionRole::Fresh(reply) => {
				{
					let mut state = self.state.lock();
					state.opening = state.opening.saturating_sub(1);
				}
				let _ = reply.send(Err(TesError::Websocket(reason)));
			}
			SessionRole::Replacement { previous, .. } => {
				warn!(%previous, %reason, "websocket reconnect failed; previous session kept");
			}
		}
	}

	/// `{ id: { type, condition } }` for everything tracked on `session_id`.
	fn snapshot(&self, session_id: &str, seq: u64) -> Value {
		let state = self.state.lock();
		let mut out = Map::new();
		if let Some(conn) = state.connections.get(session_id).filter(|c| c.seq == seq) {
			for (id, rec) in &conn.subscriptions {
				out.insert(id.clone(), json!({ "type": rec.kind, "condition": rec.condition }));
			}
		}
		Value::Object(out)
	}

	fn release_slot(&self, session_id: &str, seq: u64) {
		let mut state = self.state.lock();
		if let Some(conn) = state.connections.get_mut(session_id).filter(|c| c.seq == seq) {
			conn.pending = conn.pending.saturating_sub(1);
		}
	}

	fn remove_subscription(&self, id: &str) {
		let mut state = self.state.lock();
		for conn in state.connections.values_mut() {
			conn.subscriptions.remove(id);
		}
	}
}

/// One subscription slot held on a pooled session while the subscription is created
/// remotely. Dropping it without [`commit`](Self::commit) gives the slot back.
pub struct SlotReservation {
	pool: Arc<PoolInner>,
	session_id: String,
	seq: u64,
	held: bool,
}

impl SlotReservation {
	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	/// Turn the slot into a tracked subscription. Fails with `NotFound` when the session
	/// left the pool (or was replaced) in the meantime.
	pub fn commit(mut self, subscription: &Subscription) -> Result<(), TesError> {
		self.held = false;
		let mut state = self.pool.state.lock();
		let Some(conn) = state
			.connections
			.get_mut(&self.session_id)
			.filter(|c| c.seq == self.seq)
		else {
			return Err(TesError::NotFound(format!(
				"websocket connection {} not found",
				self.session_id
			)));
		};

		conn.pending = conn.pending.saturating_sub(1);
		conn.subscriptions.insert(
			subscription.id.clone(),
			SubscriptionRecord {
				kind: subscription.kind.clone(),
				condition: subscription.condition.clone(),
			},
		);
		Ok(())
	}
}

impl Drop for SlotReservation {
	fn drop(&mut self) {
		if self.held {
			self.pool.release_slot(&self.session_id, self.seq);
		}
	}
}

async fn liveness_sleep(deadline: Option<Instant>) {
	match deadline {
		Some(at) => sleep_until(at).await,
		None => std::future::pending::<()>().await,
	}
}

async fn run_session(pool: Arc<PoolInner>, url: Url, role: SessionRole, seq: u64) {
	let welcome_deadline = Instant::now() + WELCOME_TIMEOUT;
	let mut socket = match tokio::time::timeout_at(welcome_deadline, (pool.connector)(url.clone())).await {
		Ok(Ok(s)) => s,
		Ok(Err(e)) => {
			warn!(%url, error = %e, "failed to connect eventsub ws");
			pool.abandon(role, format!("{e:#}"));
			return;
		}
		Err(_) => {
			warn!(%url, "timed out connecting eventsub ws");
			pool.abandon(role, "timed out connecting".to_string());
			return;
		}
	};
	debug!(%url, "eventsub ws connected, waiting for welcome");

	let (control_tx, mut control_rx) = mpsc::unbounded_channel();
	let mut role = Some(role);
	let mut state = SessionState::Connecting;
	// Until the welcome arrives this bounds the wait for it.
	let mut liveness: Option<Instant> = Some(welcome_deadline);

	loop {
		let input = tokio::select! {
			msg = socket.next() => match msg {
				Some(Ok(Message::Text(t))) => match eventsub::parse_frame(&t) {
					Ok(frame) => SessionInput::Frame(frame),
					Err(e) => {
						warn!(error = %e, "failed to parse eventsub frame");
						continue;
					}
				},
				Some(Ok(Message::Ping(p))) => {
					let _ = socket.send(Message::Pong(p)).await;
					continue;
				}
				Some(Ok(Message::Close(frame))) => {
					debug!(session_id = ?state.session_id(), ?frame, "eventsub ws closed by server");
					SessionInput::SocketClosed
				}
				Some(Ok(_)) => continue,
				Some(Err(e)) => {
					warn!(session_id = ?state.session_id(), error = %e, "eventsub ws read error");
					SessionInput::SocketClosed
				}
				None => SessionInput::SocketClosed,
			},

			_ = liveness_sleep(liveness) => SessionInput::LivenessExpired,

			Some(SessionCommand::Close) = control_rx.recv() => SessionInput::CloseRequested,
		};

		let (next, actions) = state.on_input(input);
		state = next;

		for action in actions {
			match action {
				SessionAction::Register { session_id, keepalive } => {
					let Some(r) = role.take() else {
						continue;
					};
					if !pool.register(&session_id, seq, keepalive, control_tx.clone(), r) {
						state = SessionState::Closed;
						let _ = socket.close().await;
						break;
					}
				}
				SessionAction::ResetLiveness(window) => {
					liveness = Some(Instant::now() + window);
				}
				SessionAction::Dispatch { subscription, event } => {
					debug!(subscription_type = %subscription.kind, subscription_id = %subscription.id, "received notification");
					pool.dispatcher.fire(&EventDescriptor::Subscription(subscription), &event);
				}
				SessionAction::Revoke(subscription) => {
					info!(subscription_id = %subscription.id, status = ?subscription.status, "received revocation");
					let payload = serde_json::to_value(&subscription).unwrap_or(Value::Null);
					let id = subscription.id.clone();
					pool.dispatcher.fire(&EventDescriptor::Revocation(subscription), &payload);
					pool.remove_subscription(&id);
				}
				SessionAction::OpenReplacement { url: next_url } => {
					let Some(previous) = state.session_id().map(str::to_string) else {
						continue;
					};
					match Url::parse(&next_url) {
						Ok(u) => {
							info!(session_id = %previous, "received session_reconnect; opening replacement");
							ConnectionPool { inner: pool.clone() }.spawn_session(
								u,
								SessionRole::Replacement {
									previous,
									previous_seq: seq,
								},
							);
						}
						Err(e) => warn!(url = %next_url, error = %e, "invalid reconnect url"),
					}
				}
				SessionAction::ConnectionLost { session_id } => {
					warn!(%session_id, "websocket keepalive missed; connection lost");
					metrics::counter!("tes_ws_connection_lost_total").increment(1);
					let snapshot = pool.snapshot(&session_id, seq);
					pool.dispatcher.fire(&EventDescriptor::ConnectionLost, &snapshot);
				}
				SessionAction::Deregister { session_id } => {
					pool.deregister(&session_id, seq);
				}
				SessionAction::CloseSocket => {
					let _ = socket.close().await;
				}
			}
		}

		if state.is_closed() {
			break;
		}
	}

	if let Some(r) = role.take() {
		pool.abandon(r, "eventsub ws closed before welcome".to_string());
	}
	debug!(%url, "eventsub session task finished");
}
