#![forbid(unsafe_code)]

//! EventSub subscriptions endpoint.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tes_domain::{Condition, Subscription, SubscriptionPage, Transport};
use tracing::{debug, warn};
use url::Url;

use crate::auth::TokenManager;
use crate::error::TesError;


pub const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";

/// Longest wait honoured before the single rate-limit retry.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Body of a create-subscription call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateSubscription {
	#[serde(rename = "type")]
	pub kind: String,
	pub version: String,
	pub condition: Condition,
	pub transport: Transport,
}

/// Server-side filter for listing subscriptions. The API accepts at most one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubscriptionFilter {
	#[default]
	All,
	Type(String),
	Status(String),
}

impl SubscriptionFilter {
	fn query(&self, after: Option<&str>) -> Vec<(&'static str, String)> {
		let mut q = Vec::new();
		match self {
			SubscriptionFilter::All => {}
			SubscriptionFilter::Type(kind) => q.push(("type", kind.clone())),
			SubscriptionFilter::Status(status) => q.push(("status", status.clone())),
		}
		if let Some(cursor) = after.filter(|c| !c.is_empty()) {
			q.push(("after", cursor.to_string()));
		}
		q
	}
}

/// Remote subscription management.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
	async fn create_subscription(&self, request: &CreateSubscription) -> Result<Subscription, TesError>;

	async fn list_subscriptions(
		&self,
		filter: &SubscriptionFilter,
		after: Option<&str>,
	) -> Result<SubscriptionPage, TesError>;

	async fn delete_subscription(&self, id: &str) -> Result<(), TesError>;
}

#[derive(Debug, Default, Deserialize)]
struct HelixErrorBody {
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixCreateSubscriptionResponse {
	data: Vec<Subscription>,
}

/// Turn a non-success response into `TesError::Transport`.
fn transport_error(status: StatusCode, body: &str) -> TesError {
	let parsed: HelixErrorBody = serde_json::from_str(body).unwrap_or_default();
	TesError::Transport {
		status: status.as_u16(),
		error: parsed
			.error
			.unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string()),
		message: parsed.message.unwrap_or_else(|| body.to_string()),
	}
}

/// Delay asked for by a 429, capped at [`MAX_RETRY_DELAY`].
fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	raw_retry_delay(headers).map(|d| d.min(MAX_RETRY_DELAY))
}

fn raw_retry_delay(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// `SubscriptionApi` over Helix, authenticated by the shared [`TokenManager`].
#[derive(Clone)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	tokens: TokenManager,
}

impl HelixClient {
	pub fn new(base_url: &str, tokens: TokenManager) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("tes/0.x (eventsub)")
			.build()
			.context("build reqwest client")?;
		let base_url = Url::parse(base_url).with_context(|| format!("parse helix base url {base_url}"))?;

		Ok(Self { http, base_url, tokens })
	}

	fn url(&self) -> anyhow::Result<Url> {
		self.base_url.join(EVENTSUB_SUBSCRIPTIONS_PATH).context("join helix url")
	}

	fn authed(&self, req: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
		req.header("Client-Id", self.tokens.client_id())
			.header("Authorization", format!("Bearer {token}"))
	}

	/// Send with the current token. A 401 refreshes the token once and retries once;
	/// a 429 carrying a retry delay is retried once after that delay.
	async fn send<F>(&self, label: &'static str, build: F) -> Result<reqwest::Response, TesError>
	where
		F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
	{
		let token = self.tokens.get_token().await?;
		let resp = self
			.authed(build(&self.http), &token)
			.send()
			.await
			.with_context(|| format!("helix {label} send"))?;

		let resp = if resp.status() == StatusCode::UNAUTHORIZED {
			debug!(%label, "helix answered 401, refreshing token");
			match self.tokens.refresh_token().await {
				Ok(()) => {}
				Err(TesError::RefreshUnsupported) => {
					let body = resp.text().await.unwrap_or_default();
					return Err(transport_error(StatusCode::UNAUTHORIZED, &body));
				}
				Err(e) => return Err(e),
			}

			let token = self.tokens.get_token().await?;
			self.authed(build(&self.http), &token)
				.send()
				.await
				.with_context(|| format!("helix {label} retry send"))?
		} else {
			resp
		};

		if resp.status() == StatusCode::TOO_MANY_REQUESTS
			&& let Some(delay) = retry_delay_from_headers(resp.headers())
		{
			warn!(%label, ?delay, "helix rate limited, retrying once");
			tokio::time::sleep(delay).await;
			let token = self.tokens.get_token().await?;
			return Ok(self
				.authed(build(&self.http), &token)
				.send()
				.await
				.with_context(|| format!("helix {label} retry send"))?);
		}

		Ok(resp)
	}

	async fn read(resp: reqwest::Response, label: &'static str) -> Result<String, TesError> {
		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("helix {label} read body"))?;

		if !status.is_success() {
			return Err(transport_error(status, &body));
		}

		Ok(body)
	}
}

#[async_trait]
impl SubscriptionApi for HelixClient {
	async fn create_subscription(&self, request: &CreateSubscription) -> Result<Subscription, TesError> {
		let url = self.url()?;
		let resp = self
			.send("POST /helix/eventsub/subscriptions", |http| {
				http.post(url.clone()).json(request)
			})
			.await?;
		let body = Self::read(resp, "POST /helix/eventsub/subscriptions").await?;

		let parsed: HelixCreateSubscriptionResponse = serde_json::from_str(&body)
			.with_context(|| format!("helix create subscription parse json (type={})", request.kind))?;

		let sub = parsed.data.into_iter().next().ok_or_else(|| {
			TesError::Http(anyhow::anyhow!(
				"helix create subscription returned no data (type={})",
				request.kind
			))
		})?;
		debug!(subscription_id = %sub.id, subscription_type = %sub.kind, "subscription created");
		Ok(sub)
	}

	async fn list_subscriptions(
		&self,
		filter: &SubscriptionFilter,
		after: Option<&str>,
	) -> Result<SubscriptionPage, TesError> {
		let url = self.url()?;
		let query = filter.query(after);
		let resp = self
			.send("GET /helix/eventsub/subscriptions", |http| {
				http.get(url.clone()).query(&query)
			})
			.await?;
		let body = Self::read(resp, "GET /helix/eventsub/subscriptions").await?;

		Ok(serde_json::from_str(&body).context("helix list subscriptions parse json")?)
	}

	async fn delete_subscription(&self, id: &str) -> Result<(), TesError> {
		let url = self.url()?;
		let resp = self
			.send("DELETE /helix/eventsub/subscriptions", |http| {
				http.delete(url.clone()).query(&[("id", id)])
			})
			.await?;
		Self::read(resp, "DELETE /helix/eventsub/subscriptions").await?;

		debug!(subscription_id = %id, "subscription deleted");
		Ok(())
	}
}
