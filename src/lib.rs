//! A hashed timing-wheel timer for large volumes of approximate one-shot
//! timeouts.
//!
//! Deadlines hash onto a fixed power-of-two ring of buckets and a single
//! worker thread expires one bucket per tick, giving O(1) amortized
//! scheduling and cancellation regardless of how many timeouts are live.
//! Firing is approximate: up to one tick late, never early. See
//! [`HashedWheelTimer`] for the full contract.

mod bucket;
mod leak;
mod task;
mod timeout;
mod timer;
mod worker;

pub use task::{DefaultThreadFactory, ImmediateExecutor, TaskExecutor, ThreadFactory, TimerTask};
pub use timeout::{Timeout, TimeoutState};
pub use timer::{Builder, HashedWheelTimer, TimerError};
