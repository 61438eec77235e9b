#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tes_client::config::{DEFAULT_WEBHOOK_PATH, IdentityConfig, ListenerConfig, TesConfig};
use tes_client::{Condition, SecretString, TransportMethod};
use tracing::{info, warn};

/// Default config path: `~/.tes/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tes").join("config.toml"))
}

/// Load the server config from TOML at `path` (if present) and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub identity: IdentitySettings,
	pub listener: ListenerSettings,
	pub server: ServerSettings,
	pub subscriptions: Vec<SubscriptionSettings>,
}

#[derive(Debug, Clone, Default)]
pub struct IdentitySettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	/// Initial bearer token; required for the websocket transport.
	pub access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
	/// The token belongs to someone else; never try to renew it.
	pub disable_refresh: bool,
	pub oauth_base_url: Option<String>,
	pub helix_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
	pub method: TransportMethod,
	/// Public origin the platform calls back on (webhook).
	pub base_url: Option<String>,
	/// Shared HMAC secret for webhook signatures.
	pub secret: Option<SecretString>,
	pub webhook_path: String,
	pub ignore_duplicate_messages: bool,
	pub ignore_old_messages: bool,
	pub websocket_url: Option<String>,
}

impl Default for ListenerSettings {
	fn default() -> Self {
		Self {
			method: TransportMethod::Websocket,
			base_url: None,
			secret: None,
			webhook_path: DEFAULT_WEBHOOK_PATH.to_string(),
			ignore_duplicate_messages: true,
			ignore_old_messages: true,
			websocket_url: None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Local bind address (host:port) for the webhook listener.
	pub webhook_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// One subscription created at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionSettings {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default = "default_subscription_version")]
	pub version: String,
	#[serde(default)]
	pub condition: Condition,
}

fn default_subscription_version() -> String {
	"1".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	identity: FileIdentitySettings,

	#[serde(default)]
	listener: FileListenerSettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	subscriptions: Vec<SubscriptionSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileIdentitySettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	access_token: Option<String>,
	refresh_token: Option<String>,
	disable_refresh: Option<bool>,
	oauth_base_url: Option<String>,
	helix_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileListenerSettings {
	method: Option<String>,
	base_url: Option<String>,
	secret: Option<String>,
	webhook_path: Option<String>,
	ignore_duplicate_messages: Option<bool>,
	ignore_old_messages: Option<bool>,
	websocket_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	webhook_bind: Option<String>,
	metrics_bind: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

fn secret(v: Option<String>) -> Option<SecretString> {
	non_empty(v).map(SecretString::new)
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let method = match non_empty(file.listener.method) {
			Some(m) => m.parse::<TransportMethod>().context("listener.method")?,
			None => TransportMethod::Websocket,
		};

		Ok(Self {
			identity: IdentitySettings {
				client_id: non_empty(file.identity.client_id),
				client_secret: secret(file.identity.client_secret),
				access_token: secret(file.identity.access_token),
				refresh_token: secret(file.identity.refresh_token),
				disable_refresh: file.identity.disable_refresh.unwrap_or(false),
				oauth_base_url: non_empty(file.identity.oauth_base_url),
				helix_base_url: non_empty(file.identity.helix_base_url),
			},
			listener: ListenerSettings {
				method,
				base_url: non_empty(file.listener.base_url),
				secret: secret(file.listener.secret),
				webhook_path: non_empty(file.listener.webhook_path).unwrap_or_else(|| DEFAULT_WEBHOOK_PATH.to_string()),
				ignore_duplicate_messages: file.listener.ignore_duplicate_messages.unwrap_or(true),
				ignore_old_messages: file.listener.ignore_old_messages.unwrap_or(true),
				websocket_url: non_empty(file.listener.websocket_url),
			},
			server: ServerSettings {
				webhook_bind: non_empty(file.server.webhook_bind),
				metrics_bind: non_empty(file.server.metrics_bind),
			},
			subscriptions: file.subscriptions,
		})
	}

	/// Client configuration for these settings. Validation happens when the client is built.
	pub fn to_tes_config(&self) -> TesConfig {
		let id = &self.identity;
		let mut identity = IdentityConfig::new(id.client_id.clone().unwrap_or_default());
		identity.client_secret = id.client_secret.clone();
		identity.access_token = id.access_token.clone();
		identity.refresh_token = id.refresh_token.clone();
		identity.disable_refresh = id.disable_refresh;
		if let Some(url) = &id.oauth_base_url {
			identity.oauth_base_url = url.clone();
		}
		if let Some(url) = &id.helix_base_url {
			identity.helix_base_url = url.clone();
		}

		let l = &self.listener;
		let mut listener = ListenerConfig::websocket();
		listener.method = l.method;
		listener.base_url = l.base_url.clone();
		listener.secret = l.secret.clone();
		listener.webhook_path = l.webhook_path.clone();
		listener.ignore_duplicate_messages = l.ignore_duplicate_messages;
		listener.ignore_old_messages = l.ignore_old_messages;
		if let Some(url) = &l.websocket_url {
			listener.websocket_url = url.clone();
		}

		TesConfig::new(identity, listener)
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides<F>(cfg: &mut ServerConfig, lookup: F)
where
	F: Fn(&str) -> Option<String>,
{
	let string = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = string("TES_CLIENT_ID") {
		cfg.identity.client_id = Some(v);
		info!("identity config: client_id overridden by env");
	}

	if let Some(v) = string("TES_CLIENT_SECRET") {
		cfg.identity.client_secret = Some(SecretString::new(v));
		info!("identity config: client_secret overridden by env");
	}

	if let Some(v) = string("TES_ACCESS_TOKEN") {
		cfg.identity.access_token = Some(SecretString::new(v));
		info!("identity config: access_token overridden by env");
	}

	if let Some(v) = string("TES_REFRESH_TOKEN") {
		cfg.identity.refresh_token = Some(SecretString::new(v));
		info!("identity config: refresh_token overridden by env");
	}

	if let Some(v) = string("TES_DISABLE_REFRESH")
		&& let Some(disable) = parse_env_bool(&v)
	{
		cfg.identity.disable_refresh = disable;
		info!(disable_refresh = disable, "identity config: disable_refresh overridden by env");
	}

	if let Some(v) = string("TES_OAUTH_BASE_URL") {
		cfg.identity.oauth_base_url = Some(v);
		info!("identity config: oauth_base_url overridden by env");
	}

	if let Some(v) = string("TES_HELIX_BASE_URL") {
		cfg.identity.helix_base_url = Some(v);
		info!("identity config: helix_base_url overridden by env");
	}

	if let Some(v) = string("TES_TRANSPORT") {
		match v.parse::<TransportMethod>() {
			Ok(method) => {
				cfg.listener.method = method;
				info!(%method, "listener config: method overridden by env");
			}
			Err(e) => warn!(error = %e, value = %v, "listener config: ignoring invalid TES_TRANSPORT"),
		}
	}

	if let Some(v) = string("TES_BASE_URL") {
		cfg.listener.base_url = Some(v);
		info!("listener config: base_url overridden by env");
	}

	if let Some(v) = string("TES_WEBHOOK_SECRET") {
		cfg.listener.secret = Some(SecretString::new(v));
		info!("listener config: secret overridden by env");
	}

	if let Some(v) = string("TES_WEBHOOK_PATH") {
		cfg.listener.webhook_path = v;
		info!("listener config: webhook_path overridden by env");
	}

	if let Some(v) = string("TES_IGNORE_DUPLICATE_MESSAGES")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.listener.ignore_duplicate_messages = enabled;
		info!(enabled, "listener config: ignore_duplicate_messages overridden by env");
	}

	if let Some(v) = string("TES_IGNORE_OLD_MESSAGES")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.listener.ignore_old_messages = enabled;
		info!(enabled, "listener config: ignore_old_messages overridden by env");
	}

	if let Some(v) = string("TES_WEBSOCKET_URL") {
		cfg.listener.websocket_url = Some(v);
		info!("listener config: websocket_url overridden by env");
	}

	if let Some(v) = string("TES_WEBHOOK_BIND") {
		cfg.server.webhook_bind = Some(v);
		info!("server config: webhook_bind overridden by env");
	}

	if let Some(v) = string("TES_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if cfg.listener.method == TransportMethod::Webhook && cfg.server.webhook_bind.is_none() {
		warn!("listener config: webhook transport without server.webhook_bind; deliveries will not be received");
	}
}
