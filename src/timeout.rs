use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::task::{TaskExecutor, TimerTask};
use crate::timer::TimerCore;

const ST_INIT: u8 = 0;
const ST_CANCELLED: u8 = 1;
const ST_EXPIRED: u8 = 2;

/// Sentinel bucket index for an entry not currently linked into any bucket.
pub(crate) const NO_BUCKET: usize = usize::MAX;

/// State of a scheduled timeout.
///
/// Transitions exactly once, from `Pending` to either `Cancelled` or
/// `Expired`. The two terminal transitions race via compare-and-swap and only
/// one ever wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutState {
    Pending,
    Cancelled,
    Expired,
}

/// Shared per-entry state behind a [`Timeout`] handle.
///
/// Split into two ownership regimes:
///
/// - `state`, `released` and `task` are touched from multiple threads and are
///   guarded by atomics / a mutex.
/// - `rounds`, `next`, `prev` and `bucket` are intrusive bookkeeping for the
///   wheel and are touched by the worker thread only, never concurrently.
pub(crate) struct TimeoutShared {
    /// Nanoseconds since the timer's start time at which this entry is due.
    pub(crate) deadline: u64,
    state: AtomicU8,
    /// Guards the exactly-once decrement of the timer's pending counter.
    released: AtomicBool,
    task: Mutex<Option<Box<dyn TimerTask>>>,
    timer: Weak<TimerCore>,

    /// Worker-only: full wheel revolutions left before this entry is due.
    rounds: UnsafeCell<u64>,
    /// Worker-only: owning forward link of the bucket list.
    pub(crate) next: UnsafeCell<Option<Arc<TimeoutShared>>>,
    /// Worker-only: raw back link of the bucket list.
    pub(crate) prev: UnsafeCell<*const TimeoutShared>,
    /// Worker-only: wheel index of the owning bucket, `NO_BUCKET` if unlinked.
    bucket: UnsafeCell<usize>,
}

// SAFETY: the UnsafeCell fields are mutated exclusively by the single worker
// thread (enforced by the crate's module structure: only `bucket.rs` and
// `worker.rs` touch them). Every other field is an atomic or a mutex.
unsafe impl Send for TimeoutShared {}
unsafe impl Sync for TimeoutShared {}

impl TimeoutShared {
    pub(crate) fn new(
        timer: Weak<TimerCore>,
        task: Box<dyn TimerTask>,
        deadline: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            deadline,
            state: AtomicU8::new(ST_INIT),
            released: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
            timer,
            rounds: UnsafeCell::new(0),
            next: UnsafeCell::new(None),
            prev: UnsafeCell::new(ptr::null()),
            bucket: UnsafeCell::new(NO_BUCKET),
        })
    }

    pub(crate) fn state(&self) -> TimeoutState {
        match self.state.load(Ordering::Acquire) {
            ST_CANCELLED => TimeoutState::Cancelled,
            ST_EXPIRED => TimeoutState::Expired,
            _ => TimeoutState::Pending,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == ST_CANCELLED
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == ST_EXPIRED
    }

    /// `INIT -> CANCELLED`. Returns `true` only for the winning transition.
    pub(crate) fn mark_cancelled(&self) -> bool {
        self.state
            .compare_exchange(ST_INIT, ST_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `INIT -> EXPIRED`. Returns `true` only for the winning transition.
    fn mark_expired(&self) -> bool {
        self.state
            .compare_exchange(ST_INIT, ST_EXPIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Decrement the owning timer's pending counter. Idempotent: a timeout is
    /// counted down exactly once no matter how many removal paths reach it.
    pub(crate) fn release_pending(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            if let Some(core) = self.timer.upgrade() {
                core.decrement_pending();
            }
        }
    }

    /// Worker-only: expire the entry and hand its task to the executor.
    ///
    /// A no-op if a concurrent `cancel()` won the state race; the cancellation
    /// queue pass owns the entry in that case.
    pub(crate) fn expire(this: &Arc<Self>, executor: &dyn TaskExecutor) {
        if !this.mark_expired() {
            return;
        }

        let task = this
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let handle = Timeout {
                inner: Arc::clone(this),
            };
            executor.execute(Box::new(move || task.run(handle)));
        }
    }

    /// # Safety
    /// Worker thread only.
    pub(crate) unsafe fn rounds(&self) -> u64 {
        unsafe { *self.rounds.get() }
    }

    /// # Safety
    /// Worker thread only.
    pub(crate) unsafe fn set_rounds(&self, rounds: u64) {
        unsafe { *self.rounds.get() = rounds }
    }

    /// # Safety
    /// Worker thread only.
    pub(crate) unsafe fn decrement_rounds(&self) {
        unsafe { *self.rounds.get() -= 1 }
    }

    /// # Safety
    /// Worker thread only.
    pub(crate) unsafe fn bucket_index(&self) -> usize {
        unsafe { *self.bucket.get() }
    }

    /// # Safety
    /// Worker thread only.
    pub(crate) unsafe fn set_bucket_index(&self, index: usize) {
        unsafe { *self.bucket.get() = index }
    }
}

impl fmt::Debug for TimeoutShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutShared")
            .field("deadline", &self.deadline)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle to one scheduled task.
///
/// Returned by [`HashedWheelTimer::new_timeout`]; cheap to clone and share.
/// The only mutation a handle allows is [`cancel`], which is race-free against
/// expiry: whichever of cancel/expire wins the internal compare-and-swap is
/// authoritative, and the loser observes it through the state queries.
///
/// [`HashedWheelTimer::new_timeout`]: crate::HashedWheelTimer::new_timeout
/// [`cancel`]: Timeout::cancel
#[derive(Clone)]
pub struct Timeout {
    pub(crate) inner: Arc<TimeoutShared>,
}

impl Timeout {
    /// Request cancellation.
    ///
    /// Returns `true` if this call transitioned the timeout to cancelled;
    /// `false` if it had already been cancelled or had already expired.
    /// Cancellation is a request: the entry is unlinked from its wheel bucket
    /// by the worker thread within one tick, never by the caller.
    pub fn cancel(&self) -> bool {
        if !self.inner.mark_cancelled() {
            return false;
        }

        // Release the counter here, not in the worker's cancellation pass:
        // a shutdown landing between the state check below and the push
        // would otherwise strand the entry in the queue with its count
        // still held. The release guard makes the worker's later attempt a
        // no-op.
        self.inner.release_pending();
        if let Some(core) = self.inner.timer.upgrade() {
            if !core.is_shutdown() {
                core.cancelled_queue.push(Arc::clone(&self.inner));
            }
        }
        true
    }

    pub fn state(&self) -> TimeoutState {
        self.inner.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.inner.is_expired()
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("deadline_ns", &self.inner.deadline)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ImmediateExecutor;
    use crate::timer::TimerCore;
    use std::sync::atomic::AtomicUsize;

    fn test_core() -> Arc<TimerCore> {
        TimerCore::new(
            100_000_000, // 100ms ticks
            8,
            -1,
            Arc::new(ImmediateExecutor),
        )
    }

    fn entry(core: &Arc<TimerCore>, deadline: u64) -> Arc<TimeoutShared> {
        TimeoutShared::new(Arc::downgrade(core), Box::new(|_t: Timeout| {}), deadline)
    }

    // ==================== State Machine ====================

    #[test]
    fn test_new_is_pending() {
        let core = test_core();
        let t = entry(&core, 0);

        assert_eq!(t.state(), TimeoutState::Pending);
        assert!(!t.is_cancelled());
        assert!(!t.is_expired());
    }

    #[test]
    fn test_cancel_wins_once() {
        let core = test_core();
        let t = entry(&core, 0);

        assert!(t.mark_cancelled());
        assert!(!t.mark_cancelled());
        assert!(!t.mark_expired());
        assert_eq!(t.state(), TimeoutState::Cancelled);
    }

    #[test]
    fn test_expire_blocks_cancel() {
        let core = test_core();
        let t = entry(&core, 0);

        assert!(t.mark_expired());
        assert!(!t.mark_cancelled());
        assert_eq!(t.state(), TimeoutState::Expired);
    }

    // ==================== Handle Cancellation ====================

    #[test]
    fn test_handle_cancel_idempotent() {
        let core = test_core();
        let handle = Timeout {
            inner: entry(&core, 0),
        };

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_handle_cancel_enqueues_once() {
        let core = test_core();
        let handle = Timeout {
            inner: entry(&core, 0),
        };
        let clone = handle.clone();

        assert!(handle.cancel());
        assert!(!clone.cancel());
        assert_eq!(core.cancelled_queue.len(), 1);
    }

    #[test]
    fn test_cancel_releases_pending_without_worker() {
        let core = test_core();
        core.increment_pending();
        let handle = Timeout {
            inner: entry(&core, 0),
        };

        // The counter must not depend on a worker ever draining the queue.
        assert!(handle.cancel());
        assert_eq!(core.pending(), 0);
        assert_eq!(core.cancelled_queue.len(), 1);
    }

    #[test]
    fn test_cancel_after_expiry_returns_false() {
        let core = test_core();
        let handle = Timeout {
            inner: entry(&core, 0),
        };

        TimeoutShared::expire(&handle.inner, &ImmediateExecutor);
        assert!(!handle.cancel());
        assert!(core.cancelled_queue.is_empty());
        assert!(handle.is_expired());
    }

    // ==================== Expiry ====================

    #[test]
    fn test_expire_runs_task_once() {
        let core = test_core();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let t = TimeoutShared::new(
            Arc::downgrade(&core),
            Box::new(move |_t: Timeout| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );

        TimeoutShared::expire(&t, &ImmediateExecutor);
        TimeoutShared::expire(&t, &ImmediateExecutor);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(t.state(), TimeoutState::Expired);
    }

    #[test]
    fn test_expire_after_cancel_is_noop() {
        let core = test_core();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let t = TimeoutShared::new(
            Arc::downgrade(&core),
            Box::new(move |_t: Timeout| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );

        assert!(t.mark_cancelled());
        TimeoutShared::expire(&t, &ImmediateExecutor);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(t.state(), TimeoutState::Cancelled);
    }

    #[test]
    fn test_task_sees_expired_state() {
        let core = test_core();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let t = TimeoutShared::new(
            Arc::downgrade(&core),
            Box::new(move |handle: Timeout| {
                if handle.is_expired() {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            }),
            0,
        );

        TimeoutShared::expire(&t, &ImmediateExecutor);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    // ==================== Pending Counter Release ====================

    #[test]
    fn test_release_pending_exactly_once() {
        let core = test_core();
        core.increment_pending();
        let t = entry(&core, 0);

        assert_eq!(core.pending(), 1);
        t.release_pending();
        t.release_pending();
        assert_eq!(core.pending(), 0);
    }

    #[test]
    fn test_release_pending_after_timer_dropped() {
        let core = test_core();
        let t = entry(&core, 0);
        drop(core);

        // Weak upgrade fails; must not panic.
        t.release_pending();
    }
}
