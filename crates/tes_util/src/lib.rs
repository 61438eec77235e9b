#![forbid(unsafe_code)]

pub mod clock;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use timer::{TimerHandle, schedule_every, schedule_once};
