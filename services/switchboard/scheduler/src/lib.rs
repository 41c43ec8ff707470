//! Deadline scheduling for switchboard sessions.
//!
//! A hashed timer wheel holding every time-bounded obligation of a session
//! (first data, ping, ping timeout, upgrade timeout, ack timeouts) with O(1)
//! schedule and cancel. Fired callbacks are handed to the owning session's
//! current execution affinity instead of running on the wheel's tick task.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod affinity;
pub mod wheel;

pub use affinity::{Affinity, InlineAffinity, Job, RuntimeAffinity, SerialExecutor};
pub use wheel::{DeadlineScheduler, TimerId, TimerKey, WheelConfig};
