use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::leak::{self, LeakGuard};
use crate::task::{DefaultThreadFactory, ImmediateExecutor, TaskExecutor, ThreadFactory, TimerTask};
use crate::timeout::{Timeout, TimeoutShared};
use crate::worker::Worker;

pub(crate) const WORKER_STATE_INIT: u8 = 0;
pub(crate) const WORKER_STATE_STARTED: u8 = 1;
pub(crate) const WORKER_STATE_SHUTDOWN: u8 = 2;

const MILLISECOND_NANOS: u64 = 1_000_000;
const MAX_TICKS_PER_WHEEL: usize = 1 << 30;
const WORKER_THREAD_NAME: &str = "hashwheel-worker";

/// Timers are meant to be shared; past this many live instances the crate
/// warns once that something is probably constructing them per-connection.
const INSTANCE_COUNT_LIMIT: usize = 64;

static INSTANCE_COUNT: AtomicUsize = AtomicUsize::new(0);
static WARNED_TOO_MANY_INSTANCES: AtomicBool = AtomicBool::new(false);

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first clock read in this process.
fn monotonic_nanos() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// The timer has been stopped; it cannot be restarted or accept new
    /// timeouts.
    #[error("timer cannot be started once stopped")]
    WorkerStopped,

    /// `stop()` was invoked from the timer's own worker thread, which would
    /// deadlock on the join.
    #[error("cannot stop a timer from its own worker thread")]
    StopFromWorkerThread,

    /// Admission control: scheduling would push the live-timeout count past
    /// the configured ceiling. The counter is rolled back before this is
    /// returned, so backing off and retrying is safe.
    #[error("pending timeouts ({pending}) would exceed the configured maximum ({max})")]
    TooManyPendingTimeouts { pending: i64, max: i64 },

    #[error("failed to spawn timer worker thread")]
    WorkerSpawn(#[from] io::Error),
}

/// State shared between the façade, the worker thread, and every outstanding
/// [`Timeout`] handle (which holds it weakly).
pub(crate) struct TimerCore {
    /// Nanoseconds per wheel slot. At least 1ms.
    pub(crate) tick_duration: u64,
    /// Power of two.
    pub(crate) wheel_len: u64,
    pub(crate) mask: u64,
    max_pending_timeouts: i64,

    /// INIT -> STARTED -> SHUTDOWN, monotonic.
    state: AtomicU8,
    /// Nanoseconds at the worker's first tick; 0 means "not yet started"
    /// (a true zero reading is stored as 1).
    start_time: AtomicU64,
    pending_timeouts: AtomicI64,

    pub(crate) pending_queue: SegQueue<Arc<TimeoutShared>>,
    pub(crate) cancelled_queue: SegQueue<Arc<TimeoutShared>>,
    pub(crate) executor: Arc<dyn TaskExecutor>,

    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
    start_lock: Mutex<bool>,
    start_cv: Condvar,

    unprocessed: Mutex<Vec<Arc<TimeoutShared>>>,
    released: AtomicBool,
}

impl TimerCore {
    pub(crate) fn new(
        tick_duration: u64,
        wheel_len: u64,
        max_pending_timeouts: i64,
        executor: Arc<dyn TaskExecutor>,
    ) -> Arc<Self> {
        debug_assert!(wheel_len.is_power_of_two());
        Arc::new(Self {
            tick_duration,
            wheel_len,
            mask: wheel_len - 1,
            max_pending_timeouts,
            state: AtomicU8::new(WORKER_STATE_INIT),
            start_time: AtomicU64::new(0),
            pending_timeouts: AtomicI64::new(0),
            pending_queue: SegQueue::new(),
            cancelled_queue: SegQueue::new(),
            executor,
            sleep_lock: Mutex::new(()),
            sleep_cv: Condvar::new(),
            start_lock: Mutex::new(false),
            start_cv: Condvar::new(),
            unprocessed: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        })
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.state() == WORKER_STATE_SHUTDOWN
    }

    fn try_start(&self) -> Result<(), u8> {
        match self.state.compare_exchange(
            WORKER_STATE_INIT,
            WORKER_STATE_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(observed) => Err(observed),
        }
    }

    fn try_shutdown(&self) -> bool {
        self.state
            .compare_exchange(
                WORKER_STATE_STARTED,
                WORKER_STATE_SHUTDOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Unconditionally mark the timer shut down, returning the prior state.
    /// Also opens the startup latch so no `start()` caller stays parked
    /// waiting for a worker that will never record a start time.
    fn force_shutdown(&self) -> u8 {
        let prev = self.state.swap(WORKER_STATE_SHUTDOWN, Ordering::AcqRel);
        self.open_start_latch();
        prev
    }

    /// Worker-only: capture the time origin for all deadline math and release
    /// everyone blocked in `start()`.
    pub(crate) fn record_start_time(&self) {
        self.start_time
            .store(monotonic_nanos().max(1), Ordering::Release);
        self.open_start_latch();
    }

    fn open_start_latch(&self) {
        let mut started = self
            .start_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *started = true;
        self.start_cv.notify_all();
    }

    fn await_started(&self) {
        let mut started = self
            .start_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*started {
            started = self
                .start_cv
                .wait(started)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether the worker ever recorded its start time. False after the
    /// startup latch opens only when the worker failed to come up.
    fn has_started(&self) -> bool {
        self.start_time.load(Ordering::Acquire) != 0
    }

    /// Nanoseconds since the recorded start time.
    pub(crate) fn elapsed(&self) -> u64 {
        monotonic_nanos().saturating_sub(self.start_time.load(Ordering::Acquire))
    }

    /// Worker-only: park until `timeout` elapses or `wake_worker` is called.
    pub(crate) fn sleep_until_woken(&self, timeout: Duration) {
        let guard = self
            .sleep_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Re-check under the lock so a wake between the caller's state check
        // and this wait cannot be missed.
        if self.state() != WORKER_STATE_STARTED {
            return;
        }
        drop(
            self.sleep_cv
                .wait_timeout(guard, timeout)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    fn wake_worker(&self) {
        let _guard = self
            .sleep_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.sleep_cv.notify_all();
    }

    pub(crate) fn increment_pending(&self) -> i64 {
        self.pending_timeouts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn decrement_pending(&self) {
        self.pending_timeouts.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn pending(&self) -> i64 {
        self.pending_timeouts.load(Ordering::Acquire)
    }

    pub(crate) fn publish_unprocessed(&self, entries: Vec<Arc<TimeoutShared>>) {
        *self
            .unprocessed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = entries;
    }

    fn take_unprocessed(&self) -> Vec<Arc<TimeoutShared>> {
        std::mem::take(
            &mut *self
                .unprocessed
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Exactly-once guard for the process-wide instance accounting.
    fn release_instance(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

/// Configuration for a [`HashedWheelTimer`].
///
/// Defaults match the common case: 100ms ticks, a 512-slot wheel, no pending
/// ceiling, leak detection on, tasks run inline on the worker thread.
pub struct Builder {
    tick_duration: Duration,
    ticks_per_wheel: usize,
    max_pending_timeouts: i64,
    leak_detection: bool,
    executor: Arc<dyn TaskExecutor>,
    thread_factory: Arc<dyn ThreadFactory>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(100),
            ticks_per_wheel: 512,
            max_pending_timeouts: -1,
            leak_detection: true,
            executor: Arc::new(ImmediateExecutor),
            thread_factory: Arc::new(DefaultThreadFactory),
        }
    }
}

impl Builder {
    /// Wall-clock span of one wheel slot. Values below 1ms are clamped to
    /// 1ms with a warning.
    pub fn tick_duration(mut self, tick_duration: Duration) -> Self {
        self.tick_duration = tick_duration;
        self
    }

    /// Requested wheel size; rounded up to the next power of two.
    pub fn ticks_per_wheel(mut self, ticks_per_wheel: usize) -> Self {
        self.ticks_per_wheel = ticks_per_wheel;
        self
    }

    /// Ceiling on live (pending) timeouts; `new_timeout` fails once it would
    /// be exceeded. Zero or negative disables the check.
    pub fn max_pending_timeouts(mut self, max_pending_timeouts: i64) -> Self {
        self.max_pending_timeouts = max_pending_timeouts;
        self
    }

    /// Whether to warn when the timer is dropped without `stop()`.
    pub fn leak_detection(mut self, enabled: bool) -> Self {
        self.leak_detection = enabled;
        self
    }

    /// Executor that runs expired tasks; defaults to running them inline on
    /// the worker thread.
    pub fn task_executor(mut self, executor: impl TaskExecutor) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Factory for the single worker thread.
    pub fn thread_factory(mut self, factory: impl ThreadFactory) -> Self {
        self.thread_factory = Arc::new(factory);
        self
    }

    /// Build the timer. The worker thread is not spawned until the first
    /// `start()` or `new_timeout()` call.
    ///
    /// # Panics
    ///
    /// Panics if the tick duration is zero, the wheel size is zero or above
    /// 2^30, or `tick_duration * wheel_len` would not fit in a `u64`.
    pub fn build(self) -> HashedWheelTimer {
        assert!(
            self.tick_duration > Duration::ZERO,
            "tick_duration must be greater than 0"
        );
        assert!(
            self.ticks_per_wheel > 0,
            "ticks_per_wheel must be greater than 0"
        );
        assert!(
            self.ticks_per_wheel <= MAX_TICKS_PER_WHEEL,
            "ticks_per_wheel may not exceed 2^30"
        );

        let wheel_len = self.ticks_per_wheel.next_power_of_two() as u64;
        let mut tick_duration = u64::try_from(self.tick_duration.as_nanos()).unwrap_or(u64::MAX);
        if tick_duration < MILLISECOND_NANOS {
            tracing::warn!(
                configured_ns = tick_duration,
                "tick duration below 1ms is not supported; using 1ms"
            );
            tick_duration = MILLISECOND_NANOS;
        }
        assert!(
            tick_duration < u64::MAX / wheel_len,
            "tick_duration too large for a wheel of {wheel_len} ticks"
        );

        let instances = INSTANCE_COUNT.fetch_add(1, Ordering::AcqRel) + 1;
        if instances > INSTANCE_COUNT_LIMIT
            && !WARNED_TOO_MANY_INSTANCES.swap(true, Ordering::AcqRel)
        {
            tracing::warn!(
                instances,
                limit = INSTANCE_COUNT_LIMIT,
                "many HashedWheelTimer instances are live; a timer is meant to be shared"
            );
        }

        HashedWheelTimer {
            core: TimerCore::new(
                tick_duration,
                wheel_len,
                self.max_pending_timeouts,
                self.executor,
            ),
            thread_factory: self.thread_factory,
            worker: Mutex::new(None),
            leak: self.leak_detection.then(|| leak::track("HashedWheelTimer")),
        }
    }
}

/// A timer optimized for approximate one-shot timeouts at scale.
///
/// Deadlines are hashed onto a fixed ring of buckets and a single worker
/// thread expires one bucket per tick, so scheduling and cancellation are
/// O(1) amortized no matter how many timeouts are outstanding. The cost is
/// precision: a timeout fires on the first tick boundary at or after its
/// deadline, i.e. up to one `tick_duration` late, never early.
///
/// Scheduling from any thread never blocks on the worker: both `new_timeout`
/// and [`Timeout::cancel`] only push onto MPSC hand-off queues. Only the
/// worker thread ever touches the wheel itself.
///
/// # Examples
///
/// ```no_run
/// use hashwheel::{HashedWheelTimer, Timeout};
/// use std::time::Duration;
///
/// let timer = HashedWheelTimer::default();
/// let timeout = timer
///     .new_timeout(|_t: Timeout| println!("fired"), Duration::from_millis(250))
///     .unwrap();
/// assert!(!timeout.is_expired());
/// ```
pub struct HashedWheelTimer {
    core: Arc<TimerCore>,
    thread_factory: Arc<dyn ThreadFactory>,
    worker: Mutex<Option<JoinHandle<()>>>,
    leak: Option<Arc<LeakGuard>>,
}

impl Default for HashedWheelTimer {
    fn default() -> Self {
        Builder::default().build()
    }
}

impl HashedWheelTimer {
    /// Timer with the given tick duration and wheel size and default
    /// settings otherwise. See [`Builder`] for the full set of knobs.
    ///
    /// # Panics
    ///
    /// Panics on invalid configuration; see [`Builder::build`].
    pub fn new(tick_duration: Duration, ticks_per_wheel: usize) -> Self {
        Self::builder()
            .tick_duration(tick_duration)
            .ticks_per_wheel(ticks_per_wheel)
            .build()
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Start the worker thread explicitly.
    ///
    /// Idempotent while the timer is running; `new_timeout` calls this
    /// implicitly. Blocks until the worker has recorded its start time, so
    /// deadline math after a successful return always has a valid origin.
    ///
    /// # Errors
    ///
    /// [`TimerError::WorkerStopped`] if the timer was stopped (a timer cannot
    /// be restarted) or if a racing starter's worker spawn failed,
    /// [`TimerError::WorkerSpawn`] if this call's own spawn attempt failed.
    pub fn start(&self) -> Result<(), TimerError> {
        match self.core.try_start() {
            Ok(()) => {
                let core = Arc::clone(&self.core);
                let body = Box::new(move || Worker::new(core).run());
                match self.thread_factory.new_thread(WORKER_THREAD_NAME, body) {
                    Ok(handle) => {
                        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(handle);
                    }
                    Err(err) => {
                        self.core.force_shutdown();
                        return Err(TimerError::WorkerSpawn(err));
                    }
                }
            }
            Err(WORKER_STATE_SHUTDOWN) => return Err(TimerError::WorkerStopped),
            // Another thread started (or is starting) the worker.
            Err(_) => {}
        }

        self.core.await_started();
        // The latch also opens when a racing starter's spawn failed; without
        // a recorded start time there is no worker and no valid time origin.
        if !self.core.has_started() {
            return Err(TimerError::WorkerStopped);
        }
        Ok(())
    }

    /// Schedule `task` to run once `delay` from now has elapsed.
    ///
    /// Starts the worker on first use. Returns a cancellation handle
    /// immediately; the entry is placed into its wheel bucket by the worker
    /// on a subsequent tick. Delays that would overflow the internal
    /// nanosecond deadline saturate: the task fires far in the future rather
    /// than immediately.
    ///
    /// # Errors
    ///
    /// [`TimerError::TooManyPendingTimeouts`] once the configured ceiling
    /// would be exceeded (the pending counter is rolled back first), or any
    /// error from the implicit [`start`](Self::start).
    pub fn new_timeout(
        &self,
        task: impl TimerTask,
        delay: Duration,
    ) -> Result<Timeout, TimerError> {
        let pending = self.core.increment_pending();
        let max = self.core.max_pending_timeouts;
        if max > 0 && pending > max {
            self.core.decrement_pending();
            return Err(TimerError::TooManyPendingTimeouts {
                pending: pending - 1,
                max,
            });
        }

        if let Err(err) = self.start() {
            self.core.decrement_pending();
            return Err(err);
        }

        let delay = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        let deadline = self.core.elapsed().saturating_add(delay);
        let inner = TimeoutShared::new(Arc::downgrade(&self.core), Box::new(task), deadline);
        self.core.pending_queue.push(Arc::clone(&inner));
        Ok(Timeout { inner })
    }

    /// Stop the timer and reclaim unprocessed work.
    ///
    /// Joins the worker thread, then cancels every timeout the worker had
    /// not yet fired or cancelled and returns those handles; each reports
    /// `is_cancelled() == true`. Idempotent: later calls (and `stop()` on a
    /// never-started timer) return an empty set. No task runs after this
    /// returns.
    ///
    /// # Errors
    ///
    /// [`TimerError::StopFromWorkerThread`] when called from a timer task
    /// running on the worker thread itself, which would deadlock on the join.
    pub fn stop(&self) -> Result<Vec<Timeout>, TimerError> {
        {
            let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = worker.as_ref() {
                if handle.thread().id() == thread::current().id() {
                    return Err(TimerError::StopFromWorkerThread);
                }
            }
        }

        if !self.core.try_shutdown() {
            // Never started, a failed spawn, or a racing stop() got there
            // first. release() is exactly-once guarded, so this is safe to
            // repeat.
            self.core.force_shutdown();
            self.release();
            return Ok(Vec::new());
        }

        self.core.wake_worker();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("timer worker thread panicked during shutdown");
            }
        }
        self.release();

        let unprocessed = self.core.take_unprocessed();
        let mut cancelled = Vec::with_capacity(unprocessed.len());
        for inner in unprocessed {
            if inner.mark_cancelled() {
                inner.release_pending();
                cancelled.push(Timeout { inner });
            }
        }
        Ok(cancelled)
    }

    /// Current count of live (neither expired nor cancelled) timeouts.
    pub fn pending_timeouts(&self) -> u64 {
        self.core.pending().max(0) as u64
    }

    fn release(&self) {
        if self.core.release_instance() {
            INSTANCE_COUNT.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(leak) = &self.leak {
            leak.close();
        }
    }
}

impl Drop for HashedWheelTimer {
    fn drop(&mut self) {
        // Safety net for a timer dropped without stop(): shut the worker
        // down, but leave the leak guard open so it reports the missing
        // stop() call.
        let prev = self.core.force_shutdown();
        if prev != WORKER_STATE_SHUTDOWN {
            self.core.wake_worker();
        }
        if self.core.release_instance() {
            INSTANCE_COUNT.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for HashedWheelTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashedWheelTimer")
            .field("tick_duration_ns", &self.core.tick_duration)
            .field("wheel_len", &self.core.wheel_len)
            .field("state", &self.core.state())
            .field("pending_timeouts", &self.core.pending())
            .finish()
    }
}
