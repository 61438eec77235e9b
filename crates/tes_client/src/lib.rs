#![forbid(unsafe_code)]

//! EventSub client: subscribe to platform events and receive them over a signed
//! webhook or a pooled set of websocket sessions.

use std::fmt;

pub mod auth;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod eventsub;
pub mod helix;
pub mod pool;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{HttpOAuthApi, OAuthApi, TokenGrant, TokenManager, TokenRefresher, TokenValidation};
pub use client::{EventSubClient, EventSubClientBuilder};
pub use config::{IdentityConfig, ListenerConfig, TesConfig};
pub use dispatch::{ConfirmationResult, EventDispatcher, Handler};
pub use error::{SignatureError, TesError};
pub use helix::{HelixClient, SubscriptionApi, SubscriptionFilter};
pub use pool::{BoxSocket, ConnectionPool, WsConnector};
pub use webhook::{WebhookHandler, WebhookHeaders, WebhookReply};

pub use tes_domain::{
	Condition, EventDescriptor, EventType, Subscription, SubscriptionPage, Transport, TransportMethod,
};

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = <String as serde::Deserialize>::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
