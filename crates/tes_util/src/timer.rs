#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};

/// Handle to a scheduled task. Dropping it cancels the task.
#[derive(Debug)]
pub struct TimerHandle {
	abort: AbortHandle,
}

impl TimerHandle {
	/// Cancel the task. Safe to call after it already ran.
	pub fn cancel(&self) {
		self.abort.abort();
	}

	pub fn is_finished(&self) -> bool {
		self.abort.is_finished()
	}
}

impl Drop for TimerHandle {
	fn drop(&mut self) {
		self.abort.abort();
	}
}

/// Run `task` once after `delay`.
pub fn schedule_once<F>(delay: Duration, task: F) -> TimerHandle
where
	F: Future<Output = ()> + Send + 'static,
{
	let handle = tokio::spawn(async move {
		sleep(delay).await;
		task.await;
	});

	TimerHandle {
		abort: handle.abort_handle(),
	}
}

/// Run `task` every `period`, first run one full period from now.
///
/// Each run is awaited before the next tick is considered; missed ticks are delayed
/// rather than bursted.
pub fn schedule_every<F, Fut>(period: Duration, mut task: F) -> TimerHandle
where
	F: FnMut() -> Fut + Send + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	let handle = tokio::spawn(async move {
		let mut ticker = interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			task().await;
		}
	});

	TimerHandle {
		abort: handle.abort_handle(),
	}
}
