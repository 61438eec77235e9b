#![forbid(unsafe_code)]

use std::time::Duration;

use serde_json::Value;
use tes_domain::Subscription;

use crate::eventsub::InboundFrame;

/// Added on top of the server's keepalive timeout before a session is declared lost.
pub const LIVENESS_GRACE: Duration = Duration::from_millis(100);

/// Used when a welcome omits `keepalive_timeout_seconds`.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

/// How long a dialed session may take to connect and send its welcome.
pub const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	Connecting,
	Welcomed { session_id: String, keepalive: Duration },
	Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
	Frame(InboundFrame),
	LivenessExpired,
	SocketClosed,
	/// The pool replaced this session and asked it to go away.
	CloseRequested,
}

/// Side effects the socket task performs after a transition, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
	Register { session_id: String, keepalive: Duration },
	ResetLiveness(Duration),
	Dispatch { subscription: Subscription, event: Value },
	Revoke(Subscription),
	OpenReplacement { url: String },
	ConnectionLost { session_id: String },
	Deregister { session_id: String },
	CloseSocket,
}

impl SessionState {
	pub fn session_id(&self) -> Option<&str> {
		match self {
			SessionState::Welcomed { session_id, .. } => Some(session_id),
			_ => None,
		}
	}

	pub fn is_closed(&self) -> bool {
		matches!(self, SessionState::Closed)
	}

	/// Transition function. Pure: all I/O is expressed as returned actions.
	pub fn on_input(self, input: SessionInput) -> (SessionState, Vec<SessionAction>) {
		use SessionAction as A;

		match (self, input) {
			(SessionState::Closed, _) => (SessionState::Closed, Vec::new()),

			(
				SessionState::Connecting,
				SessionInput::Frame(InboundFrame::Welcome {
					session_id,
					keepalive_timeout_seconds,
				}),
			) => {
				let keepalive = keepalive_timeout_seconds
					.filter(|s| *s > 0)
					.map(Duration::from_secs)
					.unwrap_or(DEFAULT_KEEPALIVE);
				let actions = vec![
					A::Register {
						session_id: session_id.clone(),
						keepalive,
					},
					A::ResetLiveness(keepalive + LIVENESS_GRACE),
				];
				(SessionState::Welcomed { session_id, keepalive }, actions)
			}
			(SessionState::Connecting, SessionInput::SocketClosed) => (SessionState::Closed, Vec::new()),
			(SessionState::Connecting, SessionInput::CloseRequested | SessionInput::LivenessExpired) => {
				(SessionState::Closed, vec![A::CloseSocket])
			}
			(state @ SessionState::Connecting, _) => (state, Vec::new()),

			(SessionState::Welcomed { session_id, keepalive }, input) => {
				let window = keepalive + LIVENESS_GRACE;
				match input {
					SessionInput::Frame(InboundFrame::Keepalive) => (
						SessionState::Welcomed { session_id, keepalive },
						vec![A::ResetLiveness(window)],
					),
					SessionInput::Frame(InboundFrame::Notification { subscription, event }) => (
						SessionState::Welcomed { session_id, keepalive },
						vec![A::ResetLiveness(window), A::Dispatch { subscription, event }],
					),
					SessionInput::Frame(InboundFrame::Revocation { subscription }) => (
						SessionState::Welcomed { session_id, keepalive },
						vec![A::ResetLiveness(window), A::Revoke(subscription)],
					),
					SessionInput::Frame(InboundFrame::Reconnect { reconnect_url, .. }) => (
						SessionState::Welcomed { session_id, keepalive },
						vec![A::OpenReplacement { url: reconnect_url }],
					),
					SessionInput::Frame(InboundFrame::Welcome { .. } | InboundFrame::Unknown(_)) => {
						(SessionState::Welcomed { session_id, keepalive }, Vec::new())
					}
					SessionInput::LivenessExpired => (
						SessionState::Closed,
						vec![
							A::ConnectionLost {
								session_id: session_id.clone(),
							},
							A::Deregister { session_id },
							A::CloseSocket,
						],
					),
					SessionInput::SocketClosed => (SessionState::Closed, vec![A::Deregister { session_id }]),
					// The pool already dropped this entry when it swapped in the replacement.
					SessionInput::CloseRequested => (SessionState::Closed, vec![A::CloseSocket]),
				}
			}
		}
	}
}
