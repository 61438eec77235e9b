#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

/// Source of wall-clock time.
///
/// Monotonic deadlines go through `tokio::time` (which tests can pause); this only
/// covers comparisons against timestamps produced by a remote party.
pub trait Clock: Send + Sync + fmt::Debug {
	fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> SystemTime {
		SystemTime::now()
	}
}

/// Hand-driven clock for tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
	now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
	pub fn new(start: SystemTime) -> Self {
		Self {
			now: Arc::new(Mutex::new(start)),
		}
	}

	pub fn set(&self, at: SystemTime) {
		*self.now.lock() = at;
	}

	pub fn advance(&self, by: Duration) {
		let mut now = self.now.lock();
		*now += by;
	}
}

impl Clock for ManualClock {
	fn now(&self) -> SystemTime {
		*self.now.lock()
	}
}
