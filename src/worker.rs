use std::sync::Arc;
use std::time::Duration;

use crate::bucket::Bucket;
use crate::timeout::NO_BUCKET;
use crate::timer::{TimerCore, WORKER_STATE_STARTED};

/// Upper bound on pending-queue entries moved into buckets per tick.
///
/// Bounds the worst-case latency of a single tick under a scheduling burst;
/// the remainder is picked up on subsequent ticks.
const TRANSFER_BATCH: usize = 100_000;

/// Compute the wheel placement for an entry being moved into a bucket.
///
/// `target_tick` is clamped to the current tick so entries whose deadline has
/// already passed (slow hand-off, tiny delays) land in the current bucket and
/// fire on the very next expiry pass instead of being scheduled into the
/// past. Clamping before the division keeps the round arithmetic on
/// non-negative integers with plain truncating division.
#[inline]
fn placement(deadline: u64, tick_duration: u64, current_tick: u64, wheel_len: u64) -> (usize, u64) {
    let target_tick = (deadline / tick_duration).max(current_tick);
    let rounds = (target_tick - current_tick) / wheel_len;
    let index = (target_tick & (wheel_len - 1)) as usize;
    (index, rounds)
}

/// The single background thread driving a timer.
///
/// Owns the wheel outright; no other thread ever sees a bucket. Callers reach
/// the worker exclusively through the two MPSC queues on [`TimerCore`].
pub(crate) struct Worker {
    core: Arc<TimerCore>,
    wheel: Box<[Bucket]>,
    tick: u64,
}

impl Worker {
    pub(crate) fn new(core: Arc<TimerCore>) -> Self {
        let wheel = (0..core.wheel_len as usize)
            .map(Bucket::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            core,
            wheel,
            tick: 0,
        }
    }

    pub(crate) fn run(mut self) {
        self.core.record_start_time();
        tracing::trace!(
            tick_duration_ns = self.core.tick_duration,
            wheel_len = self.core.wheel_len,
            "timer worker started"
        );

        while self.core.state() == WORKER_STATE_STARTED {
            if self.wait_for_next_tick().is_none() {
                break;
            }
            let deadline = self.core.tick_duration.saturating_mul(self.tick + 1);
            let index = (self.tick & self.core.mask) as usize;

            self.process_cancellations();
            self.transfer_to_buckets();
            let executor = Arc::clone(&self.core.executor);
            self.wheel[index].expire_timeouts(deadline, executor.as_ref());

            self.tick += 1;
        }

        self.drain_on_shutdown();
        tracing::trace!(ticks = self.tick, "timer worker stopped");
    }

    /// Sleep until the wall-clock deadline of the next tick.
    ///
    /// Returns the elapsed time at wake, or `None` if shutdown was requested.
    /// The wait sits on a condvar that `stop()` notifies, so a shutdown
    /// request interrupts the sleep promptly instead of waiting the tick out.
    fn wait_for_next_tick(&self) -> Option<u64> {
        let deadline = self.core.tick_duration.saturating_mul(self.tick + 1);

        loop {
            let current = self.core.elapsed();
            if current >= deadline {
                return Some(current);
            }
            if self.core.state() != WORKER_STATE_STARTED {
                return None;
            }
            self.core
                .sleep_until_woken(Duration::from_nanos(deadline - current));
        }
    }

    /// Drain the cancellation queue completely and unlink each entry from its
    /// bucket. Entries that never reached a bucket need no unlinking; their
    /// pending count was already released by `cancel()`.
    fn process_cancellations(&mut self) {
        while let Some(entry) = self.core.cancelled_queue.pop() {
            // SAFETY: worker thread; bucket bookkeeping is worker-owned.
            unsafe {
                let index = entry.bucket_index();
                if index != NO_BUCKET {
                    self.wheel[index].remove(&entry);
                }
            }
        }
    }

    /// Move newly scheduled timeouts from the pending queue into their
    /// buckets, at most [`TRANSFER_BATCH`] per tick.
    fn transfer_to_buckets(&mut self) {
        for _ in 0..TRANSFER_BATCH {
            let Some(entry) = self.core.pending_queue.pop() else {
                break;
            };
            if entry.is_cancelled() {
                // Already counted down by the cancellation pass.
                continue;
            }

            let (index, rounds) = placement(
                entry.deadline,
                self.core.tick_duration,
                self.tick,
                self.core.wheel_len,
            );
            // SAFETY: worker thread; the entry is not linked anywhere yet.
            unsafe { entry.set_rounds(rounds) };
            self.wheel[index].add_timeout(entry);
        }
    }

    /// Shutdown: sweep every bucket, drain the arrivals that never made it
    /// into a bucket, publish the unprocessed snapshot, and run one final
    /// cancellation drain.
    fn drain_on_shutdown(&mut self) {
        let mut unprocessed = Vec::new();

        for bucket in self.wheel.iter_mut() {
            bucket.clear_timeouts(&mut unprocessed);
        }
        while let Some(entry) = self.core.pending_queue.pop() {
            if !entry.is_cancelled() {
                unprocessed.push(entry);
            }
        }
        self.core.publish_unprocessed(unprocessed);

        self.process_cancellations();
    }
}
