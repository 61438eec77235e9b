#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use tes_util::{TimerHandle, schedule_every};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::SecretString;
use crate::config::IdentityConfig;
use crate::error::TesError;

/// How long `get_token` waits for a token before giving up.
pub const TOKEN_WAIT_TIMEOUT: Duration = Duration::from_secs(1000);
const TOKEN_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const VALIDATION_INTERVAL: Duration = Duration::from_secs(3600);

/// OAuth2 grant used against the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenGrant {
	ClientCredentials,
	RefreshToken(SecretString),
}

impl TokenGrant {
	pub fn as_str(&self) -> &'static str {
		match self {
			TokenGrant::ClientCredentials => "client_credentials",
			TokenGrant::RefreshToken(_) => "refresh_token",
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidation {
	Valid,
	/// The validate endpoint answered 401.
	Unauthorized,
}

/// Token endpoint operations.
#[async_trait]
pub trait OAuthApi: Send + Sync {
	async fn request_token(&self, grant: TokenGrant) -> anyhow::Result<TokenResponse>;

	async fn validate_token(&self, access_token: &str) -> anyhow::Result<TokenValidation>;
}

/// Consumer-supplied token source used instead of the OAuth token endpoint.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
	async fn refresh(&self) -> anyhow::Result<String>;
}

#[async_trait]
impl<F, Fut> TokenRefresher for F
where
	F: Fn() -> Fut + Send + Sync,
	Fut: Future<Output = anyhow::Result<String>> + Send,
{
	async fn refresh(&self) -> anyhow::Result<String> {
		(self)().await
	}
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
	#[serde(default)]
	message: Option<String>,
}

/// `OAuthApi` over the platform's id endpoints.
#[derive(Clone)]
pub struct HttpOAuthApi {
	http: reqwest::Client,
	base_url: String,
	client_id: String,
	client_secret: Option<SecretString>,
}

impl HttpOAuthApi {
	pub fn new(base_url: &str, client_id: String, client_secret: Option<SecretString>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("tes/0.x (oauth)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url: base_url.trim_end_matches('/').to_string(),
			client_id,
			client_secret,
		})
	}
}

#[async_trait]
impl OAuthApi for HttpOAuthApi {
	async fn request_token(&self, grant: TokenGrant) -> anyhow::Result<TokenResponse> {
		let url = format!("{}/token", self.base_url);
		let secret = self.client_secret.as_ref().map(|s| s.expose()).unwrap_or_default();

		let mut form: Vec<(&str, &str)> = vec![
			("client_id", self.client_id.as_str()),
			("client_secret", secret),
			("grant_type", grant.as_str()),
		];
		if let TokenGrant::RefreshToken(rt) = &grant {
			form.push(("refresh_token", rt.expose()));
		}

		let resp = self
			.http
			.post(url)
			.form(&form)
			.send()
			.await
			.context("oauth token request")?;

		let status = resp.status();
		let body = resp.text().await.context("oauth token read body")?;

		if !status.is_success() {
			let message = serde_json::from_str::<OAuthErrorBody>(&body)
				.ok()
				.and_then(|b| b.message)
				.unwrap_or(body);
			anyhow::bail!("oauth token request failed (grant={}): status={status} message={message}", grant.as_str());
		}

		serde_json::from_str(&body).context("oauth token parse json")
	}

	async fn validate_token(&self, access_token: &str) -> anyhow::Result<TokenValidation> {
		let url = format!("{}/validate", self.base_url);

		let resp = self
			.http
			.get(url)
			.header("client-id", &self.client_id)
			.header("Authorization", format!("Bearer {access_token}"))
			.send()
			.await
			.context("oauth validate request")?;

		let status = resp.status();
		if status == StatusCode::UNAUTHORIZED {
			return Ok(TokenValidation::Unauthorized);
		}
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			anyhow::bail!("oauth validate failed: status={status} body={body}");
		}

		Ok(TokenValidation::Valid)
	}
}

#[derive(Default)]
struct Credential {
	access_token: Option<SecretString>,
	refresh_token: Option<SecretString>,
}

struct TokenInner {
	client_id: String,
	oauth: Arc<dyn OAuthApi>,
	refresher: Option<Arc<dyn TokenRefresher>>,
	refresh_disabled: bool,

	credential: Mutex<Credential>,

	/// Serializes refreshes; `generation` counts successful ones.
	refresh_lock: tokio::sync::Mutex<()>,
	generation: AtomicU64,

	validation: Mutex<Option<TimerHandle>>,
}

/// Owner of the process's bearer credential.
///
/// While a refresh is in flight the access token is absent, so `get_token` never hands
/// out a value that is about to be replaced.
#[derive(Clone)]
pub struct TokenManager {
	inner: Arc<TokenInner>,
}

impl TokenManager {
	/// Must be called inside a tokio runtime: either the validation timer starts
	/// (initial token present) or an initial refresh is spawned.
	pub fn new(identity: &IdentityConfig, oauth: Arc<dyn OAuthApi>) -> Result<Self, TesError> {
		let has_secret = identity.client_secret.as_ref().is_some_and(|s| !s.is_empty());
		if identity.refresher.is_none()
			&& !identity.disable_refresh
			&& (identity.client_id.trim().is_empty() || !has_secret)
		{
			return Err(TesError::Config(
				"token manager needs a client id and secret when no refresher is configured".to_string(),
			));
		}

		let initial = identity.access_token.clone().filter(|t| !t.is_empty());
		let has_initial = initial.is_some();

		let manager = Self {
			inner: Arc::new(TokenInner {
				client_id: identity.client_id.clone(),
				oauth,
				refresher: identity.refresher.clone(),
				refresh_disabled: identity.disable_refresh,
				credential: Mutex::new(Credential {
					access_token: initial,
					refresh_token: identity.refresh_token.clone().filter(|t| !t.is_empty()),
				}),
				refresh_lock: tokio::sync::Mutex::new(()),
				generation: AtomicU64::new(0),
				validation: Mutex::new(None),
			}),
		};

		if has_initial {
			manager.restart_validation();
		} else {
			let m = manager.clone();
			tokio::spawn(async move {
				// Failures are logged by refresh_token; callers of get_token time out.
				let _ = m.refresh_token().await;
			});
		}

		Ok(manager)
	}

	pub fn client_id(&self) -> &str {
		&self.inner.client_id
	}

	/// The token if one is held right now.
	pub fn current_token(&self) -> Option<String> {
		self.inner
			.credential
			.lock()
			.access_token
			.as_ref()
			.map(|t| t.expose().to_string())
	}

	/// Wait until a token is available.
	pub async fn get_token(&self) -> Result<String, TesError> {
		let started = Instant::now();
		loop {
			if let Some(token) = self.current_token() {
				return Ok(token);
			}

			if started.elapsed() > TOKEN_WAIT_TIMEOUT {
				error!("timed out waiting for an access token");
				return Err(TesError::Timeout {
					what: "token wait",
					after: TOKEN_WAIT_TIMEOUT,
				});
			}

			sleep(TOKEN_POLL_INTERVAL).await;
		}
	}

	/// Replace the held token.
	///
	/// Concurrent callers are serialized; a caller that queued behind a successful
	/// refresh adopts its result instead of issuing another exchange.
	pub async fn refresh_token(&self) -> Result<(), TesError> {
		let observed = self.inner.generation.load(Ordering::SeqCst);
		let _guard = self.inner.refresh_lock.lock().await;

		if self.inner.generation.load(Ordering::SeqCst) != observed && self.current_token().is_some() {
			debug!("token refreshed by a concurrent caller");
			return Ok(());
		}

		let refresh_token = {
			let mut cred = self.inner.credential.lock();
			cred.access_token = None;
			cred.refresh_token.clone()
		};

		debug!("refreshing access token");
		match self.fetch_fresh(refresh_token).await {
			Ok((access, refresh)) => {
				{
					let mut cred = self.inner.credential.lock();
					cred.access_token = Some(access);
					if refresh.is_some() {
						cred.refresh_token = refresh;
					}
				}
				self.inner.generation.fetch_add(1, Ordering::SeqCst);
				info!("access token refreshed");
				self.restart_validation();
				Ok(())
			}
			Err(e) => {
				error!(error = %e, "error refreshing access token");
				Err(e)
			}
		}
	}

	async fn fetch_fresh(
		&self,
		refresh_token: Option<SecretString>,
	) -> Result<(SecretString, Option<SecretString>), TesError> {
		if self.inner.refresh_disabled {
			return Err(TesError::RefreshUnsupported);
		}

		if let Some(refresher) = &self.inner.refresher {
			let token = refresher
				.refresh()
				.await
				.map_err(|e| TesError::Auth(format!("custom refresh failed: {e:#}")))?;
			return Ok((SecretString::new(token), None));
		}

		let grant = match refresh_token {
			Some(rt) => TokenGrant::RefreshToken(rt),
			None => TokenGrant::ClientCredentials,
		};

		let resp = self
			.inner
			.oauth
			.request_token(grant)
			.await
			.map_err(|e| TesError::Auth(format!("{e:#}")))?;

		if resp.access_token.is_empty() {
			return Err(TesError::Auth("token endpoint returned an empty access token".to_string()));
		}

		Ok((
			SecretString::new(resp.access_token),
			resp.refresh_token.map(SecretString::new),
		))
	}

	/// Check the held token once; a 401 triggers a refresh.
	pub async fn validate_now(&self) -> Result<(), TesError> {
		let Some(token) = self.current_token() else {
			debug!("skipping validation, no token held");
			return Ok(());
		};

		match self.inner.oauth.validate_token(&token).await {
			Ok(TokenValidation::Valid) => {
				debug!("access token valid");
				Ok(())
			}
			Ok(TokenValidation::Unauthorized) => {
				info!("access token no longer valid, refreshing");
				self.refresh_token().await
			}
			Err(e) => {
				warn!(error = %e, "access token validation failed");
				Err(TesError::Auth(format!("{e:#}")))
			}
		}
	}

	// Replacing the handle aborts the previous timer. When a refresh runs inside the
	// timer task itself, the abort lands on its next await, after the refresh finished.
	fn restart_validation(&self) {
		let weak: Weak<TokenInner> = Arc::downgrade(&self.inner);
		let handle = schedule_every(VALIDATION_INTERVAL, move || {
			let weak = weak.clone();
			async move {
				if let Some(inner) = weak.upgrade() {
					let _ = TokenManager { inner }.validate_now().await;
				}
			}
		});

		*self.inner.validation.lock() = Some(handle);
	}
}
