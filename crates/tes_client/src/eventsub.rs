#![forbid(unsafe_code)]

//! Wire shapes of inbound EventSub traffic (websocket frames and webhook bodies).

use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tes_domain::Subscription;

pub const MSG_WELCOME: &str = "session_welcome";
pub const MSG_KEEPALIVE: &str = "session_keepalive";
pub const MSG_RECONNECT: &str = "session_reconnect";
pub const MSG_NOTIFICATION: &str = "notification";
pub const MSG_REVOCATION: &str = "revocation";
pub const MSG_CHALLENGE: &str = "webhook_callback_verification";

/// Cheap look at `metadata.message_type` before committing to a full parse.
#[derive(Debug, Deserialize)]
struct MetadataPeek {
	metadata: MetadataPeekInner,
}

#[derive(Debug, Deserialize)]
struct MetadataPeekInner {
	message_type: String,
}

#[derive(Debug, Deserialize)]
struct SessionFrame {
	payload: SessionPayload,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
	session: Session,
}

#[derive(Debug, Deserialize)]
struct Session {
	id: String,

	#[serde(default)]
	keepalive_timeout_seconds: Option<u64>,

	#[serde(default)]
	reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionFrame {
	payload: SubscriptionPayload,
}

#[derive(Debug, Deserialize)]
struct SubscriptionPayload {
	subscription: Subscription,

	#[serde(default)]
	event: Option<Value>,
}

/// A decoded websocket text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
	Welcome {
		session_id: String,
		keepalive_timeout_seconds: Option<u64>,
	},
	Keepalive,
	Reconnect {
		session_id: String,
		reconnect_url: String,
	},
	Notification {
		subscription: Subscription,
		event: Value,
	},
	Revocation {
		subscription: Subscription,
	},
	/// A message type this client does not act on.
	Unknown(String),
}

pub fn peek_message_type(text: &str) -> anyhow::Result<String> {
	let peek: MetadataPeek = serde_json::from_str(text).context("eventsub peek metadata")?;
	Ok(peek.metadata.message_type)
}

pub fn parse_frame(text: &str) -> anyhow::Result<InboundFrame> {
	let message_type = peek_message_type(text)?;

	match message_type.as_str() {
		MSG_WELCOME => {
			let frame: SessionFrame = serde_json::from_str(text).context("eventsub parse session_welcome")?;
			Ok(InboundFrame::Welcome {
				session_id: frame.payload.session.id,
				keepalive_timeout_seconds: frame.payload.session.keepalive_timeout_seconds,
			})
		}
		MSG_KEEPALIVE => Ok(InboundFrame::Keepalive),
		MSG_RECONNECT => {
			let frame: SessionFrame = serde_json::from_str(text).context("eventsub parse session_reconnect")?;
			let reconnect_url = frame
				.payload
				.session
				.reconnect_url
				.context("session_reconnect without reconnect_url")?;
			Ok(InboundFrame::Reconnect {
				session_id: frame.payload.session.id,
				reconnect_url,
			})
		}
		MSG_NOTIFICATION => {
			let frame: SubscriptionFrame = serde_json::from_str(text).context("eventsub parse notification")?;
			Ok(InboundFrame::Notification {
				subscription: frame.payload.subscription,
				event: frame.payload.event.unwrap_or(Value::Null),
			})
		}
		MSG_REVOCATION => {
			let frame: SubscriptionFrame = serde_json::from_str(text).context("eventsub parse revocation")?;
			Ok(InboundFrame::Revocation {
				subscription: frame.payload.subscription,
			})
		}
		_ => Ok(InboundFrame::Unknown(message_type)),
	}
}

/// JSON body of a webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookBody {
	#[serde(default)]
	pub challenge: Option<String>,

	pub subscription: Subscription,

	#[serde(default)]
	pub event: Option<Value>,
}

pub fn parse_webhook_body(body: &[u8]) -> anyhow::Result<WebhookBody> {
	serde_json::from_slice(body).context("webhook parse body")
}

/// Parse an RFC 3339 message timestamp (nanosecond precision is common).
pub fn parse_message_timestamp(s: &str) -> Option<SystemTime> {
	DateTime::parse_from_rfc3339(s.trim())
		.ok()
		.map(|dt| SystemTime::from(dt.with_timezone(&Utc)))
}
