#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tes_domain::{EventDescriptor, EventType, Subscription};
use tes_util::{TimerHandle, schedule_once};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::TesError;

/// How long a webhook subscription may wait for its challenge.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Consumer callback: `(event payload, what produced it)`.
pub type Handler = Arc<dyn Fn(&Value, &EventDescriptor) + Send + Sync>;

pub type ConfirmationResult = Result<Subscription, TesError>;

struct PendingConfirmation {
	subscription: Subscription,
	reply: oneshot::Sender<ConfirmationResult>,
	deadline: TimerHandle,
}

struct DispatchInner {
	handlers: RwLock<HashMap<EventType, Handler>>,
	pending: Mutex<HashMap<String, PendingConfirmation>>,
	confirmation_timeout: Duration,
}

/// Type-keyed handler table plus the queue of webhook subscriptions awaiting their
/// challenge.
///
/// One handler per event type: registering again replaces the previous handler.
#[derive(Clone)]
pub struct EventDispatcher {
	inner: Arc<DispatchInner>,
}

impl Default for EventDispatcher {
	fn default() -> Self {
		Self::new()
	}
}

impl EventDispatcher {
	pub fn new() -> Self {
		Self::with_confirmation_timeout(CONFIRMATION_TIMEOUT)
	}

	pub fn with_confirmation_timeout(confirmation_timeout: Duration) -> Self {
		Self {
			inner: Arc::new(DispatchInner {
				handlers: RwLock::new(HashMap::new()),
				pending: Mutex::new(HashMap::new()),
				confirmation_timeout,
			}),
		}
	}

	/// Register `handler` for `event`. Returns true if it replaced an existing handler.
	pub fn on<F>(&self, event: impl Into<EventType>, handler: F) -> bool
	where
		F: Fn(&Value, &EventDescriptor) + Send + Sync + 'static,
	{
		let event = event.into();
		debug!(event_type = %event, "registering handler");
		self.inner.handlers.write().insert(event, Arc::new(handler)).is_some()
	}

	/// Remove the handler for `event`. Returns true if one was registered.
	pub fn off(&self, event: impl Into<EventType>) -> bool {
		let event = event.into();
		debug!(event_type = %event, "removing handler");
		self.inner.handlers.write().remove(&event).is_some()
	}

	pub fn clear(&self) {
		debug!("removing all handlers");
		self.inner.handlers.write().clear();
	}

	pub fn has_handler(&self, event: &EventType) -> bool {
		self.inner.handlers.read().contains_key(event)
	}

	/// Deliver `payload` to the handler for `descriptor`'s type.
	///
	/// Returns false (and logs) when no handler is registered. The handler runs
	/// synchronously with no dispatcher lock held, so it may register or remove handlers.
	pub fn fire(&self, descriptor: &EventDescriptor, payload: &Value) -> bool {
		let event = descriptor.event_type();
		let handler = self.inner.handlers.read().get(&event).cloned();

		match handler {
			Some(handler) => {
				handler(payload, descriptor);
				true
			}
			None => {
				warn!(event_type = %event, "received event with no registered handler");
				false
			}
		}
	}

	/// Park a freshly created webhook subscription until its challenge arrives.
	///
	/// The receiver yields the original subscription on confirmation, or a timeout
	/// error once the deadline passes.
	pub fn queue_confirmation(&self, subscription: Subscription) -> oneshot::Receiver<ConfirmationResult> {
		let (tx, rx) = oneshot::channel();
		let id = subscription.id.clone();
		let timeout = self.inner.confirmation_timeout;

		let weak: Weak<DispatchInner> = Arc::downgrade(&self.inner);
		let expired_id = id.clone();
		let deadline = schedule_once(timeout, async move {
			let Some(inner) = weak.upgrade() else {
				return;
			};
			let Some(entry) = inner.pending.lock().remove(&expired_id) else {
				return;
			};

			warn!(
				subscription_id = %expired_id,
				"subscription verification timed out, this will need to be cleaned up"
			);
			let PendingConfirmation { reply, deadline, .. } = entry;
			let _ = reply.send(Err(TesError::Timeout {
				what: "subscription verification",
				after: timeout,
			}));
			drop(deadline);
		});

		debug!(subscription_id = %id, "queued subscription confirmation");
		self.inner.pending.lock().insert(
			id,
			PendingConfirmation {
				subscription,
				reply: tx,
				deadline,
			},
		);

		rx
	}

	/// Complete the pending confirmation for `id`. No-op (returns false) if none is queued.
	pub fn resolve_confirmation(&self, id: &str) -> bool {
		let Some(entry) = self.inner.pending.lock().remove(id) else {
			debug!(subscription_id = %id, "no pending confirmation to resolve");
			return false;
		};

		entry.deadline.cancel();
		debug!(subscription_id = %id, "subscription confirmed");
		let _ = entry.reply.send(Ok(entry.subscription));
		true
	}

	/// Fail the pending confirmation for `id` with `error`. No-op if none is queued.
	pub fn reject_confirmation(&self, id: &str, error: TesError) -> bool {
		let Some(entry) = self.inner.pending.lock().remove(id) else {
			return false;
		};

		entry.deadline.cancel();
		debug!(subscription_id = %id, error = %error, "subscription confirmation rejected");
		let _ = entry.reply.send(Err(error));
		true
	}

	pub fn pending_confirmations(&self) -> usize {
		self.inner.pending.lock().len()
	}
}
