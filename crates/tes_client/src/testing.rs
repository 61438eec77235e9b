#![forbid(unsafe_code)]

//! In-memory websocket plumbing for tests.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tes_domain::Subscription;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::pool::{BoxFuture, BoxSocket, WsConnector};
use crate::webhook::WebhookHeaders;

/// Client half of an in-memory socket.
pub(crate) struct ChannelSocket {
	inbound: mpsc::UnboundedReceiver<Result<Message, WsError>>,
	outbound: mpsc::UnboundedSender<Message>,
}

impl Stream for ChannelSocket {
	type Item = Result<Message, WsError>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.get_mut().inbound.poll_recv(cx)
	}
}

impl Sink<Message> for ChannelSocket {
	type Error = WsError;

	fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
		self.outbound.send(item).map_err(|_| WsError::ConnectionClosed)
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}
}

/// Server half of an in-memory socket.
pub(crate) struct ServerEnd {
	pub(crate) url: Url,
	to_client: Option<mpsc::UnboundedSender<Result<Message, WsError>>>,
	pub(crate) from_client: mpsc::UnboundedReceiver<Message>,
}

impl ServerEnd {
	pub(crate) fn send_json(&self, frame: Value) {
		if let Some(tx) = &self.to_client {
			let _ = tx.send(Ok(Message::text(frame.to_string())));
		}
	}

	pub(crate) fn send(&self, msg: Message) {
		if let Some(tx) = &self.to_client {
			let _ = tx.send(Ok(msg));
		}
	}

	/// End the client's read stream.
	pub(crate) fn hang_up(&mut self) {
		self.to_client = None;
	}
}

/// Connector handing every dialed socket's server half to the returned receiver.
pub(crate) fn channel_connector() -> (WsConnector, mpsc::UnboundedReceiver<ServerEnd>) {
	let (accepted_tx, accepted_rx) = mpsc::unbounded_channel::<ServerEnd>();

	let connector: WsConnector = Arc::new(move |url: Url| {
		let accepted_tx = accepted_tx.clone();
		Box::pin(async move {
			let (to_client, inbound) = mpsc::unbounded_channel();
			let (outbound, from_client) = mpsc::unbounded_channel();
			accepted_tx
				.send(ServerEnd {
					url,
					to_client: Some(to_client),
					from_client,
				})
				.map_err(|_| anyhow::anyhow!("test server gone"))?;
			Ok::<BoxSocket, anyhow::Error>(Box::new(ChannelSocket { inbound, outbound }))
		}) as BoxFuture<'static, anyhow::Result<BoxSocket>>
	});

	(connector, accepted_rx)
}

/// Connector that always fails to dial.
pub(crate) fn failing_connector() -> WsConnector {
	Arc::new(|url: Url| {
		Box::pin(async move { Err::<BoxSocket, _>(anyhow::anyhow!("connection refused: {url}")) })
			as BoxFuture<'static, anyhow::Result<BoxSocket>>
	})
}

pub(crate) fn welcome_frame(session_id: &str, keepalive_secs: u64) -> Value {
	json!({
		"metadata": { "message_id": "m-welcome", "message_type": "session_welcome", "message_timestamp": "2023-07-19T14:56:51.634234626Z" },
		"payload": { "session": {
			"id": session_id,
			"status": "connected",
			"connected_at": "2023-07-19T14:56:51.616329898Z",
			"keepalive_timeout_seconds": keepalive_secs,
			"reconnect_url": null
		} }
	})
}

pub(crate) fn keepalive_frame() -> Value {
	json!({
		"metadata": { "message_id": "m-ka", "message_type": "session_keepalive", "message_timestamp": "2023-07-19T14:56:52Z" },
		"payload": {}
	})
}

pub(crate) fn reconnect_frame(session_id: &str, url: &str) -> Value {
	json!({
		"metadata": { "message_id": "m-rc", "message_type": "session_reconnect", "message_timestamp": "2023-07-19T14:56:52Z" },
		"payload": { "session": {
			"id": session_id,
			"status": "reconnecting",
			"keepalive_timeout_seconds": null,
			"reconnect_url": url,
			"connected_at": "2023-07-19T14:56:51.616329898Z"
		} }
	})
}

pub(crate) fn notification_frame(subscription: &Subscription, event: Value) -> Value {
	json!({
		"metadata": {
			"message_id": "m-note",
			"message_type": "notification",
			"message_timestamp": "2023-07-19T14:56:52Z",
			"subscription_type": subscription.kind,
			"subscription_version": subscription.version
		},
		"payload": { "subscription": subscription, "event": event }
	})
}

pub(crate) fn revocation_frame(subscription: &Subscription) -> Value {
	json!({
		"metadata": {
			"message_id": "m-revoke",
			"message_type": "revocation",
			"message_timestamp": "2023-07-19T14:56:52Z",
			"subscription_type": subscription.kind,
			"subscription_version": subscription.version
		},
		"payload": { "subscription": subscription }
	})
}

/// `sha256=<hex>` signature the platform would attach to a webhook delivery.
pub(crate) fn sign_sha256(secret: &str, id: &str, ts: &str, body: &[u8]) -> String {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
	mac.update(id.as_bytes());
	mac.update(ts.as_bytes());
	mac.update(body);
	format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Signed headers plus raw body for a webhook delivery of `body`.
pub(crate) fn signed_delivery(secret: &str, message_type: &str, id: &str, ts: &str, body: &Value) -> (WebhookHeaders, Vec<u8>) {
	let raw = serde_json::to_vec(body).unwrap();
	let headers = WebhookHeaders {
		message_id: Some(id.to_string()),
		timestamp: Some(ts.to_string()),
		signature: Some(sign_sha256(secret, id, ts, &raw)),
		message_type: Some(message_type.to_string()),
	};
	(headers, raw)
}
