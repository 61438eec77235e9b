#![forbid(unsafe_code)]

//! Public entry point tying tokens, transport and dispatch together.

use std::sync::Arc;

use serde_json::Value;
use tes_domain::{Condition, EventDescriptor, EventType, Subscription, SubscriptionPage, Transport, TransportMethod};
use tes_util::Clock;
use tracing::{debug, info, warn};
use url::Url;

use crate::SecretString;
use crate::auth::{HttpOAuthApi, OAuthApi, TokenManager};
use crate::config::TesConfig;
use crate::dispatch::EventDispatcher;
use crate::error::TesError;
use crate::helix::{CreateSubscription, HelixClient, SubscriptionApi, SubscriptionFilter};
use crate::pool::{ConnectionPool, WsConnector, default_connector};
use crate::webhook::WebhookHandler;

enum Listener {
	Webhook {
		callback: String,
		secret: SecretString,
		handler: Arc<WebhookHandler>,
	},
	Websocket {
		pool: ConnectionPool,
	},
}

struct ClientInner {
	tokens: TokenManager,
	api: Arc<dyn SubscriptionApi>,
	dispatcher: EventDispatcher,
	listener: Listener,
}

/// Builds an [`EventSubClient`], with seams for swapping the remote endpoints.
pub struct EventSubClientBuilder {
	config: TesConfig,
	oauth: Option<Arc<dyn OAuthApi>>,
	api: Option<Arc<dyn SubscriptionApi>>,
	connector: Option<WsConnector>,
	clock: Option<Arc<dyn Clock>>,
	dispatcher: Option<EventDispatcher>,
}

impl EventSubClientBuilder {
	pub fn new(config: TesConfig) -> Self {
		Self {
			config,
			oauth: None,
			api: None,
			connector: None,
			clock: None,
			dispatcher: None,
		}
	}

	pub fn oauth_api(mut self, oauth: Arc<dyn OAuthApi>) -> Self {
		self.oauth = Some(oauth);
		self
	}

	pub fn subscription_api(mut self, api: Arc<dyn SubscriptionApi>) -> Self {
		self.api = Some(api);
		self
	}

	pub fn ws_connector(mut self, connector: WsConnector) -> Self {
		self.connector = Some(connector);
		self
	}

	/// Wall clock used to judge webhook message age.
	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
		self.dispatcher = Some(dispatcher);
		self
	}

	/// Validate the configuration and assemble the client. Must run inside a tokio
	/// runtime, since the token manager starts its timers here.
	pub fn build(self) -> Result<EventSubClient, TesError> {
		self.config.validate()?;
		let TesConfig { identity, listener } = self.config;

		let oauth = match self.oauth {
			Some(oauth) => oauth,
			None => Arc::new(HttpOAuthApi::new(
				&identity.oauth_base_url,
				identity.client_id.clone(),
				identity.client_secret.clone(),
			)?),
		};
		let tokens = TokenManager::new(&identity, oauth)?;

		let api = match self.api {
			Some(api) => api,
			None => Arc::new(HelixClient::new(&identity.helix_base_url, tokens.clone())?),
		};

		let dispatcher = self.dispatcher.unwrap_or_default();

		let listener_kind = match listener.method {
			TransportMethod::Webhook => {
				let callback = listener
					.callback_url()
					.ok_or_else(|| TesError::Config("listener config must contain 'base_url'".to_string()))?;
				let secret = listener
					.secret
					.clone()
					.ok_or_else(|| TesError::Config("listener config must contain 'secret'".to_string()))?;

				let mut handler = WebhookHandler::new(secret.clone(), dispatcher.clone())
					.ignore_duplicates(listener.ignore_duplicate_messages)
					.ignore_old(listener.ignore_old_messages);
				if let Some(clock) = self.clock {
					handler = handler.with_clock(clock);
				}

				info!(%callback, "eventsub client using webhook transport");
				Listener::Webhook {
					callback,
					secret,
					handler: Arc::new(handler),
				}
			}
			TransportMethod::Websocket => {
				let url = Url::parse(&listener.websocket_url)
					.map_err(|e| TesError::Config(format!("invalid websocket url {}: {e}", listener.websocket_url)))?;
				let connector = self.connector.unwrap_or_else(default_connector);

				info!(%url, "eventsub client using websocket transport");
				Listener::Websocket {
					pool: ConnectionPool::new(url, connector, dispatcher.clone()),
				}
			}
		};

		Ok(EventSubClient {
			inner: Arc::new(ClientInner {
				tokens,
				api,
				dispatcher,
				listener: listener_kind,
			}),
		})
	}
}

/// EventSub client over one fixed transport.
#[derive(Clone)]
pub struct EventSubClient {
	inner: Arc<ClientInner>,
}

impl EventSubClient {
	pub fn builder(config: TesConfig) -> EventSubClientBuilder {
		EventSubClientBuilder::new(config)
	}

	/// Shorthand for `builder(config).build()`.
	pub fn new(config: TesConfig) -> Result<Self, TesError> {
		Self::builder(config).build()
	}

	pub fn transport(&self) -> TransportMethod {
		match self.inner.listener {
			Listener::Webhook { .. } => TransportMethod::Webhook,
			Listener::Websocket { .. } => TransportMethod::Websocket,
		}
	}

	pub fn tokens(&self) -> &TokenManager {
		&self.inner.tokens
	}

	pub fn dispatcher(&self) -> &EventDispatcher {
		&self.inner.dispatcher
	}

	/// The delivery handler to mount on an HTTP listener (webhook transport only).
	pub fn webhook_handler(&self) -> Option<Arc<WebhookHandler>> {
		match &self.inner.listener {
			Listener::Webhook { handler, .. } => Some(handler.clone()),
			Listener::Websocket { .. } => None,
		}
	}

	/// The session pool (websocket transport only).
	pub fn pool(&self) -> Option<&ConnectionPool> {
		match &self.inner.listener {
			Listener::Websocket { pool } => Some(pool),
			Listener::Webhook { .. } => None,
		}
	}

	/// Register `handler` for `event`, replacing any previous one.
	pub fn on<F>(&self, event: impl Into<EventType>, handler: F) -> bool
	where
		F: Fn(&Value, &EventDescriptor) + Send + Sync + 'static,
	{
		self.inner.dispatcher.on(event, handler)
	}

	pub fn off(&self, event: impl Into<EventType>) -> bool {
		self.inner.dispatcher.off(event)
	}

	pub fn clear(&self) {
		self.inner.dispatcher.clear();
	}

	/// Create a subscription.
	///
	/// Over webhooks this returns once the platform has proven the callback with a
	/// challenge (or fails after the confirmation deadline). Over websockets it returns
	/// as soon as the subscription is created on a pooled session.
	pub async fn subscribe(
		&self,
		kind: &str,
		condition: Condition,
		version: &str,
	) -> Result<Subscription, TesError> {
		self.inner.tokens.get_token().await?;

		match &self.inner.listener {
			Listener::Webhook { callback, secret, .. } => {
				let request = CreateSubscription {
					kind: kind.to_string(),
					version: version.to_string(),
					condition,
					transport: Transport::webhook(callback.clone(), secret.expose()),
				};
				let created = self.inner.api.create_subscription(&request).await?;
				debug!(subscription_id = %created.id, subscription_type = %kind, "waiting for webhook verification");

				let confirmed = self.inner.dispatcher.queue_confirmation(created);
				let sub = confirmed
					.await
					.map_err(|_| TesError::Http(anyhow::anyhow!("confirmation queue dropped the subscription")))??;
				info!(subscription_id = %sub.id, subscription_type = %kind, "webhook subscription verified");
				Ok(sub)
			}
			Listener::Websocket { pool } => {
				let slot = pool.reserve_slot().await?;
				let session_id = slot.session_id().to_string();
				let request = CreateSubscription {
					kind: kind.to_string(),
					version: version.to_string(),
					condition,
					transport: Transport::websocket(session_id.clone()),
				};
				let sub = self.inner.api.create_subscription(&request).await?;

				if let Err(e) = slot.commit(&sub) {
					// The session went away while the create was in flight.
					warn!(subscription_id = %sub.id, %session_id, error = %e, "websocket session gone; deleting new subscription");
					if let Err(del) = self.inner.api.delete_subscription(&sub.id).await {
						warn!(subscription_id = %sub.id, error = %del, "failed to delete orphaned subscription");
					}
					return Err(e);
				}
				info!(subscription_id = %sub.id, subscription_type = %kind, %session_id, "websocket subscription created");
				Ok(sub)
			}
		}
	}

	/// Delete a subscription by id.
	pub async fn unsubscribe(&self, id: &str) -> Result<(), TesError> {
		self.inner.api.delete_subscription(id).await?;
		if let Listener::Websocket { pool } = &self.inner.listener {
			pool.remove_subscription(id);
		}
		info!(subscription_id = %id, "unsubscribed");
		Ok(())
	}

	/// Delete the subscription matching `kind` with a shallow-equal `condition`.
	pub async fn unsubscribe_matching(&self, kind: &str, condition: &Condition) -> Result<(), TesError> {
		let id = match &self.inner.listener {
			Listener::Websocket { pool } => pool.find_subscription_id(kind, condition),
			Listener::Webhook { .. } => self.find_subscription(kind, condition).await?.map(|s| s.id),
		};

		let Some(id) = id else {
			return Err(TesError::NotFound(
				"subscription with given type and condition not found".to_string(),
			));
		};

		self.unsubscribe(&id).await
	}

	/// One page of every subscription this client id owns.
	pub async fn get_subscriptions(&self, cursor: Option<&str>) -> Result<SubscriptionPage, TesError> {
		self.inner
			.api
			.list_subscriptions(&SubscriptionFilter::All, cursor)
			.await
	}

	pub async fn get_subscriptions_by_type(
		&self,
		kind: &str,
		cursor: Option<&str>,
	) -> Result<SubscriptionPage, TesError> {
		self.inner
			.api
			.list_subscriptions(&SubscriptionFilter::Type(kind.to_string()), cursor)
			.await
	}

	pub async fn get_subscriptions_by_status(
		&self,
		status: &str,
		cursor: Option<&str>,
	) -> Result<SubscriptionPage, TesError> {
		self.inner
			.api
			.list_subscriptions(&SubscriptionFilter::Status(status.to_string()), cursor)
			.await
	}

	/// Page through all subscriptions until `id` turns up.
	pub async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, TesError> {
		self.find_paged(&SubscriptionFilter::All, |s| s.id == id).await
	}

	/// Page through subscriptions of `kind` until one with a shallow-equal condition
	/// turns up.
	pub async fn find_subscription(
		&self,
		kind: &str,
		condition: &Condition,
	) -> Result<Option<Subscription>, TesError> {
		self.find_paged(&SubscriptionFilter::Type(kind.to_string()), |s| s.matches(kind, condition))
			.await
	}

	async fn find_paged<P>(&self, filter: &SubscriptionFilter, pred: P) -> Result<Option<Subscription>, TesError>
	where
		P: Fn(&Subscription) -> bool,
	{
		let mut cursor: Option<String> = None;
		loop {
			let page = self.inner.api.list_subscriptions(filter, cursor.as_deref()).await?;
			let next = page.next_cursor().map(str::to_string);

			if let Some(found) = page.data.into_iter().find(|s| pred(s)) {
				return Ok(Some(found));
			}

			match next {
				Some(c) if cursor.as_deref() != Some(c.as_str()) => cursor = Some(c),
				_ => return Ok(None),
			}
		}
	}

	/// Close every websocket session. Webhook subscriptions are unaffected.
	pub fn close(&self) {
		if let Listener::Websocket { pool } = &self.inner.listener {
			pool.close_all();
		}
	}
}
