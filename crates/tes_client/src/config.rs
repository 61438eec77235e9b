#![forbid(unsafe_code)]

use std::sync::Arc;

use tes_domain::TransportMethod;

use crate::SecretString;
use crate::auth::TokenRefresher;
use crate::error::TesError;

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://id.twitch.tv/oauth2";
pub const DEFAULT_WEBSOCKET_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
pub const DEFAULT_WEBHOOK_PATH: &str = "/teswh/event";

/// Application identity and credential sources.
#[derive(Clone)]
pub struct IdentityConfig {
	pub client_id: String,
	pub client_secret: Option<SecretString>,
	pub access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,

	/// Called instead of the OAuth token endpoint when the token must be renewed.
	pub refresher: Option<Arc<dyn TokenRefresher>>,

	/// The token is owned by someone else (e.g. a browser session); refreshing always fails.
	pub disable_refresh: bool,

	pub oauth_base_url: String,
	pub helix_base_url: String,
}

impl IdentityConfig {
	pub fn new(client_id: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret: None,
			access_token: None,
			refresh_token: None,
			refresher: None,
			disable_refresh: false,
			oauth_base_url: DEFAULT_OAUTH_BASE_URL.to_string(),
			helix_base_url: DEFAULT_HELIX_BASE_URL.to_string(),
		}
	}

	pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
		self.client_secret = Some(SecretString::new(secret));
		self
	}

	pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
		self.access_token = Some(SecretString::new(token));
		self
	}

	pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
		self.refresh_token = Some(SecretString::new(token));
		self
	}

	pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
		self.refresher = Some(refresher);
		self
	}
}

/// Where and how events are received.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
	pub method: TransportMethod,

	/// Public origin the platform calls back on (webhook only).
	pub base_url: Option<String>,

	/// Shared HMAC secret for webhook signatures.
	pub secret: Option<SecretString>,

	pub webhook_path: String,
	pub ignore_duplicate_messages: bool,
	pub ignore_old_messages: bool,

	pub websocket_url: String,
}

impl ListenerConfig {
	pub fn webhook(base_url: impl Into<String>, secret: impl Into<String>) -> Self {
		Self {
			method: TransportMethod::Webhook,
			base_url: Some(base_url.into()),
			secret: Some(SecretString::new(secret)),
			..Self::websocket()
		}
	}

	pub fn websocket() -> Self {
		Self {
			method: TransportMethod::Websocket,
			base_url: None,
			secret: None,
			webhook_path: DEFAULT_WEBHOOK_PATH.to_string(),
			ignore_duplicate_messages: true,
			ignore_old_messages: true,
			websocket_url: DEFAULT_WEBSOCKET_URL.to_string(),
		}
	}

	/// Full callback URL registered with the platform.
	pub fn callback_url(&self) -> Option<String> {
		let base = self.base_url.as_deref()?.trim_end_matches('/');
		let path = self.webhook_path.trim_start_matches('/');
		Some(format!("{base}/{path}"))
	}
}

/// Client configuration.
#[derive(Clone)]
pub struct TesConfig {
	pub identity: IdentityConfig,
	pub listener: ListenerConfig,
}

impl TesConfig {
	pub fn new(identity: IdentityConfig, listener: ListenerConfig) -> Self {
		Self { identity, listener }
	}

	/// Reject configurations that cannot authenticate or receive events.
	pub fn validate(&self) -> Result<(), TesError> {
		let id = &self.identity;
		let listener = &self.listener;

		if id.client_id.trim().is_empty() {
			return Err(TesError::Config("identity config must contain 'client_id'".to_string()));
		}

		match listener.method {
			TransportMethod::Webhook => {
				if is_blank(&id.client_secret) {
					return Err(TesError::Config("identity config must contain 'client_secret'".to_string()));
				}
				if listener.base_url.as_deref().is_none_or(|u| u.trim().is_empty()) {
					return Err(TesError::Config("listener config must contain 'base_url'".to_string()));
				}
				if is_blank(&listener.secret) {
					return Err(TesError::Config("listener config must contain 'secret'".to_string()));
				}
			}
			TransportMethod::Websocket => {
				if is_blank(&id.access_token) {
					return Err(TesError::Config("identity config must contain 'access_token'".to_string()));
				}
				if !id.disable_refresh && id.refresher.is_none() && is_blank(&id.refresh_token) {
					return Err(TesError::Config(
						"identity config must contain either a refresher or 'refresh_token'".to_string(),
					));
				}
				if !is_blank(&id.refresh_token) && is_blank(&id.client_secret) {
					return Err(TesError::Config("identity config must contain 'client_secret'".to_string()));
				}
			}
		}

		Ok(())
	}
}

fn is_blank(s: &Option<SecretString>) -> bool {
	s.as_ref().is_none_or(|s| s.expose().trim().is_empty())
}
