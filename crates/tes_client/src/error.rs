#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the client.
#[derive(Debug, Error)]
pub enum TesError {
	/// Missing or contradictory construction parameters.
	#[error("invalid configuration: {0}")]
	Config(String),

	/// Token refresh or validation failed.
	#[error("auth failed: {0}")]
	Auth(String),

	/// Refresh is disabled for this identity (e.g. a token owned by a browser session).
	#[error("cannot refresh access token: refresh is disabled for this client")]
	RefreshUnsupported,

	#[error("{what} timed out after {after:?}")]
	Timeout { what: &'static str, after: Duration },

	/// Non-success response from the subscriptions API.
	#[error("{status} {error}: {message}")]
	Transport { status: u16, error: String, message: String },

	#[error("http: {0}")]
	Http(#[from] anyhow::Error),

	#[error("websocket: {0}")]
	Websocket(String),

	#[error("maximum number of websocket connections reached")]
	Capacity,

	#[error("{0}")]
	NotFound(String),

	/// The platform revoked a subscription before its confirmation arrived.
	#[error("subscription {0} was revoked")]
	Revoked(String),
}

impl TesError {
	pub fn is_timeout(&self) -> bool {
		matches!(self, TesError::Timeout { .. })
	}

	/// Status code of a remote failure, if this is one.
	pub fn status(&self) -> Option<u16> {
		match self {
			TesError::Transport { status, .. } => Some(*status),
			_ => None,
		}
	}
}

/// Webhook signature check failures. Answered at the HTTP boundary, never handed to
/// event handlers.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SignatureError {
	#[error("missing message signature")]
	Missing,
	#[error("message signature mismatch")]
	Mismatch,
}

impl SignatureError {
	pub const fn http_status(self) -> u16 {
		match self {
			SignatureError::Missing => 401,
			SignatureError::Mismatch => 403,
		}
	}
}
