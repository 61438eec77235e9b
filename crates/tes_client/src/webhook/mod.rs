#![forbid(unsafe_code)]

//! Signed webhook deliveries: signature check, dedup, staleness, routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Sha256, Sha512};
use tes_domain::EventDescriptor;
use tes_util::{Clock, SystemClock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::SecretString;
use crate::dispatch::EventDispatcher;
use crate::error::{SignatureError, TesError};
use crate::eventsub::{self, MSG_CHALLENGE, MSG_NOTIFICATION, MSG_REVOCATION};

pub mod server;


pub use server::serve;

pub const HEADER_MESSAGE_ID: &str = "twitch-eventsub-message-id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "twitch-eventsub-message-signature";
pub const HEADER_MESSAGE_TYPE: &str = "twitch-eventsub-message-type";

/// Deliveries older than this are dropped.
pub const STALE_AFTER: Duration = Duration::from_secs(600);

/// How long an accepted message id is remembered for dedup.
pub const DEDUP_RETENTION: Duration = Duration::from_secs(601);

/// Constant-time check of `digest` against the MAC of `parts`.
fn mac_matches<M: Mac + KeyInit>(secret: &[u8], parts: [&[u8]; 3], digest: &[u8]) -> bool {
	let Ok(mut mac) = <M as KeyInit>::new_from_slice(secret) else {
		return false;
	};
	for part in parts {
		Mac::update(&mut mac, part);
	}
	mac.verify_slice(digest).is_ok()
}

/// Check `signature` (`"<algorithm>=<hex digest>"`) over `id ‖ timestamp ‖ body`.
///
/// A missing signature is `Missing`; any other failure, including an unsupported
/// algorithm, is `Mismatch`.
pub fn verify_signature(
	secret: &[u8],
	message_id: &str,
	timestamp: &str,
	body: &[u8],
	signature: Option<&str>,
) -> Result<(), SignatureError> {
	let Some(signature) = signature.filter(|s| !s.is_empty()) else {
		return Err(SignatureError::Missing);
	};

	let Some((algorithm, provided)) = signature.split_once('=') else {
		return Err(SignatureError::Mismatch);
	};

	let Ok(digest) = hex::decode(provided.trim()) else {
		return Err(SignatureError::Mismatch);
	};

	let parts = [message_id.as_bytes(), timestamp.as_bytes(), body];
	let matches = match algorithm.trim().to_ascii_lowercase().as_str() {
		"sha256" => mac_matches::<Hmac<Sha256>>(secret, parts, &digest),
		"sha512" => mac_matches::<Hmac<Sha512>>(secret, parts, &digest),
		_ => false,
	};

	if matches { Ok(()) } else { Err(SignatureError::Mismatch) }
}

/// Message ids accepted within the retention window.
#[derive(Debug)]
pub struct RecentMessageIds {
	retention: Duration,
	seen: HashMap<String, Instant>,
}

impl RecentMessageIds {
	pub fn new(retention: Duration) -> Self {
		Self {
			retention,
			seen: HashMap::new(),
		}
	}

	fn prune(&mut self, now: Instant) {
		let retention = self.retention;
		self.seen.retain(|_, at| now.duration_since(*at) < retention);
	}

	pub fn contains(&mut self, id: &str) -> bool {
		self.prune(Instant::now());
		self.seen.contains_key(id)
	}

	pub fn insert(&mut self, id: &str) {
		let now = Instant::now();
		self.prune(now);
		self.seen.insert(id.to_string(), now);
	}

	pub fn len(&self) -> usize {
		self.seen.len()
	}

	pub fn is_empty(&self) -> bool {
		self.seen.is_empty()
	}
}

/// The four EventSub headers of a delivery.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
	pub message_id: Option<String>,
	pub timestamp: Option<String>,
	pub signature: Option<String>,
	pub message_type: Option<String>,
}

impl WebhookHeaders {
	pub fn from_header_map(headers: &hyper::HeaderMap) -> Self {
		let get = |name: &str| {
			headers
				.get(name)
				.and_then(|v| v.to_str().ok())
				.map(str::to_string)
		};
		Self {
			message_id: get(HEADER_MESSAGE_ID),
			timestamp: get(HEADER_MESSAGE_TIMESTAMP),
			signature: get(HEADER_MESSAGE_SIGNATURE),
			message_type: get(HEADER_MESSAGE_TYPE),
		}
	}
}

/// HTTP answer for a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookReply {
	pub status: u16,
	pub content_type: &'static str,
	pub body: String,
}

impl WebhookReply {
	fn text(status: u16, body: impl Into<String>) -> Self {
		Self {
			status,
			content_type: "text/plain; charset=utf-8",
			body: body.into(),
		}
	}

	fn ok() -> Self {
		Self::text(200, "OK")
	}
}

#[derive(Debug, PartialEq, Eq)]
enum Screen<'a> {
	Accept(&'a str),
	Unhandled,
	NoMessageId,
	Duplicate,
	Stale,
}

/// Verifies and routes webhook deliveries into the dispatcher.
pub struct WebhookHandler {
	secret: SecretString,
	dispatcher: EventDispatcher,
	clock: Arc<dyn Clock>,
	recent: Mutex<RecentMessageIds>,
	ignore_duplicates: bool,
	ignore_old: bool,
}

impl WebhookHandler {
	pub fn new(secret: SecretString, dispatcher: EventDispatcher) -> Self {
		Self {
			secret,
			dispatcher,
			clock: Arc::new(SystemClock),
			recent: Mutex::new(RecentMessageIds::new(DEDUP_RETENTION)),
			ignore_duplicates: true,
			ignore_old: true,
		}
	}

	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	pub fn ignore_duplicates(mut self, on: bool) -> Self {
		self.ignore_duplicates = on;
		self
	}

	pub fn ignore_old(mut self, on: bool) -> Self {
		self.ignore_old = on;
		self
	}

	/// Handle one delivery given its headers and the raw, unparsed body.
	pub fn handle(&self, headers: &WebhookHeaders, body: &[u8]) -> WebhookReply {
		metrics::counter!("tes_webhook_requests_total").increment(1);

		let id = headers.message_id.as_deref().unwrap_or_default();
		let timestamp = headers.timestamp.as_deref().unwrap_or_default();

		match verify_signature(
			self.secret.expose().as_bytes(),
			id,
			timestamp,
			body,
			headers.signature.as_deref(),
		) {
			Ok(()) => {}
			Err(SignatureError::Missing) => {
				debug!("received unsigned request to webhook endpoint");
				metrics::counter!("tes_webhook_signature_missing_total").increment(1);
				return WebhookReply::text(
					SignatureError::Missing.http_status(),
					"Unauthorized request to EventSub webhook",
				);
			}
			Err(SignatureError::Mismatch) => {
				debug!(message_id = %id, "webhook signature mismatch");
				metrics::counter!("tes_webhook_signature_invalid_total").increment(1);
				return WebhookReply::text(SignatureError::Mismatch.http_status(), "Request signature mismatch");
			}
		}

		let payload = match eventsub::parse_webhook_body(body) {
			Ok(p) => p,
			Err(e) => {
				warn!(error = %e, "webhook body parse failed");
				return WebhookReply::text(400, "Invalid request body");
			}
		};

		let message_type = headers.message_type.as_deref().unwrap_or_default();

		if message_type == MSG_CHALLENGE
			&& let Some(challenge) = payload.challenge.as_deref()
		{
			info!(
				subscription_type = %payload.subscription.kind,
				subscription_id = %payload.subscription.id,
				"received challenge, returning it"
			);
			let reply = WebhookReply::text(200, urlencoding::encode(challenge).into_owned());
			self.dispatcher.resolve_confirmation(&payload.subscription.id);
			return reply;
		}

		let message_id = match self.screen(message_type, headers.message_id.as_deref(), timestamp) {
			Screen::Accept(id) => id,
			Screen::Unhandled => {
				info!(%message_type, "received request with unhandled message type");
				return WebhookReply::ok();
			}
			Screen::NoMessageId => return WebhookReply::ok(),
			Screen::Duplicate => {
				debug!(message_id = %id, "dropping duplicate delivery");
				metrics::counter!("tes_webhook_duplicates_total").increment(1);
				return WebhookReply::ok();
			}
			Screen::Stale => {
				debug!(message_id = %id, %timestamp, "dropping old delivery");
				metrics::counter!("tes_webhook_stale_total").increment(1);
				return WebhookReply::ok();
			}
		};

		self.recent.lock().insert(message_id);
		if message_type == MSG_NOTIFICATION {
			debug!(subscription_type = %payload.subscription.kind, "received notification");
			if let Some(event) = payload.event {
				self.dispatcher
					.fire(&EventDescriptor::Subscription(payload.subscription), &event);
			}
		} else {
			let sub = payload.subscription;
			info!(subscription_id = %sub.id, status = ?sub.status, "received revocation");
			self.dispatcher
				.reject_confirmation(&sub.id, TesError::Revoked(sub.id.clone()));
			let body = serde_json::to_value(&sub).unwrap_or(serde_json::Value::Null);
			self.dispatcher.fire(&EventDescriptor::Revocation(sub), &body);
		}

		WebhookReply::ok()
	}

	/// Decide whether a verified, non-challenge delivery is routed. Only notifications and
	/// revocations are subject to dedup and staleness.
	fn screen<'a>(&self, message_type: &str, message_id: Option<&'a str>, timestamp: &str) -> Screen<'a> {
		if message_type != MSG_NOTIFICATION && message_type != MSG_REVOCATION {
			return Screen::Unhandled;
		}
		let Some(message_id) = message_id.filter(|m| !m.is_empty()) else {
			return Screen::NoMessageId;
		};
		if self.ignore_duplicates && self.recent.lock().contains(message_id) {
			return Screen::Duplicate;
		}
		if self.ignore_old && self.is_stale(timestamp) {
			return Screen::Stale;
		}
		Screen::Accept(message_id)
	}

	/// Unparseable timestamps are not stale.
	fn is_stale(&self, timestamp: &str) -> bool {
		let Some(sent) = eventsub::parse_message_timestamp(timestamp) else {
			return false;
		};
		self.clock
			.now()
			.duration_since(sent)
			.is_ok_and(|age| age > STALE_AFTER)
	}
}
