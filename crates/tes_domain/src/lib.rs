#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// How the platform delivers events for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMethod {
	Webhook,
	Websocket,
}

impl TransportMethod {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			TransportMethod::Webhook => "webhook",
			TransportMethod::Websocket => "websocket",
		}
	}
}

impl fmt::Display for TransportMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing domain values from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("empty value")]
	Empty,
	#[error("unknown transport method: {0}")]
	UnknownTransport(String),
}

impl FromStr for TransportMethod {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"webhook" => Ok(TransportMethod::Webhook),
			"websocket" | "ws" => Ok(TransportMethod::Websocket),
			other => Err(ParseError::UnknownTransport(other.to_string())),
		}
	}
}

/// Key/value filter narrowing a subscription's scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Condition(BTreeMap<String, Value>);

impl Condition {
	pub fn new() -> Self {
		Self::default()
	}

	/// Builder-style insert.
	pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.0.insert(key.into(), value.into());
		self
	}

	pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
		self.0.insert(key.into(), value.into())
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.get(key)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
		self.0.iter()
	}

	/// Same keys on both sides, and every shared key maps to an equal value.
	///
	/// Values are compared one level deep; nested objects must be equal as a whole.
	pub fn shallow_eq(&self, other: &Condition) -> bool {
		let forward = self.0.iter().all(|(k, v)| other.0.get(k) == Some(v));
		forward && other.0.iter().all(|(k, v)| self.0.get(k) == Some(v))
	}
}

impl<K, V, const N: usize> From<[(K, V); N]> for Condition
where
	K: Into<String>,
	V: Into<Value>,
{
	fn from(pairs: [(K, V); N]) -> Self {
		Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
	}
}

impl fmt::Display for Condition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match serde_json::to_string(&self.0) {
			Ok(s) => f.write_str(&s),
			Err(_) => f.write_str("{}"),
		}
	}
}

/// Transport descriptor attached to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transport {
	pub method: TransportMethod,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub callback: Option<String>,

	/// Only sent on create; the platform never echoes it back.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub secret: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub connected_at: Option<String>,
}

impl Transport {
	pub fn webhook(callback: impl Into<String>, secret: impl Into<String>) -> Self {
		Self {
			method: TransportMethod::Webhook,
			callback: Some(callback.into()),
			secret: Some(secret.into()),
			session_id: None,
			connected_at: None,
		}
	}

	pub fn websocket(session_id: impl Into<String>) -> Self {
		Self {
			method: TransportMethod::Websocket,
			callback: None,
			secret: None,
			session_id: Some(session_id.into()),
			connected_at: None,
		}
	}
}

/// A subscription as returned by the subscriptions API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
	pub id: String,

	#[serde(rename = "type")]
	pub kind: String,

	#[serde(default = "default_version")]
	pub version: String,

	#[serde(default)]
	pub status: Option<String>,

	#[serde(default)]
	pub condition: Condition,

	pub transport: Transport,

	#[serde(default)]
	pub created_at: Option<String>,

	#[serde(default)]
	pub cost: Option<u64>,
}

fn default_version() -> String {
	"1".to_string()
}

impl Subscription {
	/// Whether this subscription targets `kind` with a shallow-equal condition.
	pub fn matches(&self, kind: &str, condition: &Condition) -> bool {
		self.kind == kind && self.condition.shallow_eq(condition)
	}
}

/// Pagination cursor block of a list response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
	#[serde(default)]
	pub cursor: Option<String>,
}

/// One page of the subscriptions listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPage {
	#[serde(default)]
	pub data: Vec<Subscription>,

	#[serde(default)]
	pub total: u64,

	#[serde(default)]
	pub total_cost: u64,

	#[serde(default)]
	pub max_total_cost: u64,

	#[serde(default)]
	pub pagination: Pagination,
}

impl SubscriptionPage {
	/// Cursor for the next page, if any.
	pub fn next_cursor(&self) -> Option<&str> {
		self.pagination.cursor.as_deref().filter(|c| !c.is_empty())
	}
}

/// Dispatch key for consumer handlers.
///
/// Platform notifications are keyed by their subscription type; the client itself
/// raises the two system variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
	Notification(String),
	ConnectionLost,
	Revocation,
}

impl EventType {
	pub const CONNECTION_LOST: &'static str = "connection_lost";
	pub const REVOCATION: &'static str = "revocation";

	pub fn as_str(&self) -> &str {
		match self {
			EventType::Notification(kind) => kind,
			EventType::ConnectionLost => Self::CONNECTION_LOST,
			EventType::Revocation => Self::REVOCATION,
		}
	}
}

impl From<&str> for EventType {
	fn from(s: &str) -> Self {
		match s {
			Self::CONNECTION_LOST => EventType::ConnectionLost,
			Self::REVOCATION => EventType::Revocation,
			other => EventType::Notification(other.to_string()),
		}
	}
}

impl From<String> for EventType {
	fn from(s: String) -> Self {
		EventType::from(s.as_str())
	}
}

impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What produced an event handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDescriptor {
	/// A platform notification for this subscription.
	Subscription(Subscription),

	/// A websocket session stopped sending keepalives.
	ConnectionLost,

	/// The platform revoked this subscription.
	Revocation(Subscription),
}

impl EventDescriptor {
	pub fn event_type(&self) -> EventType {
		match self {
			EventDescriptor::Subscription(sub) => EventType::from(sub.kind.as_str()),
			EventDescriptor::ConnectionLost => EventType::ConnectionLost,
			EventDescriptor::Revocation(_) => EventType::Revocation,
		}
	}

	pub fn subscription(&self) -> Option<&Subscription> {
		match self {
			EventDescriptor::Subscription(sub) | EventDescriptor::Revocation(sub) => Some(sub),
			EventDescriptor::ConnectionLost => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	fn sub_json() -> &'static str {
		r#"{
			"id": "f1c2a387-161a-49f9-a165-0f21d7a4e1c4",
			"status": "enabled",
			"type": "channel.update",
			"version": "2",
			"cost": 1,
			"condition": { "broadcaster_user_id": "1337" },
			"transport": { "method": "websocket", "session_id": "AQoQexAWVYKSTIu4ec_2VAxyuhAB" },
			"created_at": "2023-04-11T10:11:12.123Z"
		}"#
	}

	#[test]
	fn transport_method_parse_and_display() {
		assert_eq!("webhook".parse::<TransportMethod>().unwrap(), TransportMethod::Webhook);
		assert_eq!("WS".parse::<TransportMethod>().unwrap(), TransportMethod::Websocket);
		assert_eq!(TransportMethod::Websocket.to_string(), "websocket");
		assert!("".parse::<TransportMethod>().is_err());
		assert!(matches!(
			"carrier-pigeon".parse::<TransportMethod>(),
			Err(ParseError::UnknownTransport(_))
		));
	}

	#[test]
	fn parses_subscription_from_api_shape() {
		let sub: Subscription = serde_json::from_str(sub_json()).unwrap();
		assert_eq!(sub.kind, "channel.update");
		assert_eq!(sub.version, "2");
		assert_eq!(sub.transport.method, TransportMethod::Websocket);
		assert_eq!(sub.transport.session_id.as_deref(), Some("AQoQexAWVYKSTIu4ec_2VAxyuhAB"));
		assert!(sub.matches("channel.update", &Condition::from([("broadcaster_user_id", "1337")])));
		assert!(!sub.matches("channel.follow", &Condition::from([("broadcaster_user_id", "1337")])));
	}

	#[test]
	fn webhook_transport_omits_absent_fields() {
		let t = Transport::webhook("https://example.com/teswh/event", "s3cr3t-s3cr3t");
		let v = serde_json::to_value(&t).unwrap();
		assert_eq!(v["method"], "webhook");
		assert!(v.get("session_id").is_none());
	}

	#[test]
	fn shallow_eq_detects_extra_and_differing_keys() {
		let a = Condition::from([("broadcaster_user_id", "1337")]);
		let b = Condition::from([("broadcaster_user_id", "1337"), ("moderator_user_id", "1")]);
		let c = Condition::from([("broadcaster_user_id", "42")]);

		assert!(a.shallow_eq(&a.clone()));
		assert!(!a.shallow_eq(&b));
		assert!(!b.shallow_eq(&a));
		assert!(!a.shallow_eq(&c));
		assert!(Condition::new().shallow_eq(&Condition::new()));
	}

	#[test]
	fn event_type_maps_system_names() {
		assert_eq!(EventType::from("connection_lost"), EventType::ConnectionLost);
		assert_eq!(EventType::from("revocation"), EventType::Revocation);
		assert_eq!(
			EventType::from("channel.update"),
			EventType::Notification("channel.update".to_string())
		);
		assert_eq!(EventType::Revocation.to_string(), "revocation");
	}

	#[test]
	fn page_cursor_ignores_empty_string() {
		let page: SubscriptionPage = serde_json::from_str(r#"{"data":[],"pagination":{"cursor":""}}"#).unwrap();
		assert_eq!(page.next_cursor(), None);

		let page: SubscriptionPage = serde_json::from_str(r#"{"data":[],"pagination":{"cursor":"abc"}}"#).unwrap();
		assert_eq!(page.next_cursor(), Some("abc"));
	}

	fn arb_condition() -> impl Strategy<Value = Condition> {
		prop::collection::btree_map("[a-c]{1,2}", "[0-2]{1}", 0..4).prop_map(|m| {
			let mut c = Condition::new();
			for (k, v) in m {
				c.insert(k, v);
			}
			c
		})
	}

	proptest! {
		#[test]
		fn shallow_eq_is_symmetric(a in arb_condition(), b in arb_condition()) {
			prop_assert_eq!(a.shallow_eq(&b), b.shallow_eq(&a));
		}

		#[test]
		fn shallow_eq_agrees_with_key_and_value_sets(a in arb_condition(), b in arb_condition()) {
			let same_keys = a.len() == b.len() && a.iter().all(|(k, _)| b.get(k).is_some());
			let same_values = a.iter().all(|(k, v)| b.get(k).map(|bv| bv == v).unwrap_or(true));
			prop_assert_eq!(a.shallow_eq(&b), same_keys && same_values);
		}
	}
}
