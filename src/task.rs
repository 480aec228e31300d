use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;

use crate::timeout::Timeout;

/// A one-shot task scheduled against a [`HashedWheelTimer`].
///
/// The task receives the [`Timeout`] handle it was scheduled under, so it can
/// check whether it lost a late cancellation race before doing real work.
///
/// Implemented for any `FnOnce(Timeout)` closure, which is the common case:
///
/// ```ignore
/// timer.new_timeout(|_t: Timeout| println!("fired"), Duration::from_millis(250))?;
/// ```
///
/// [`HashedWheelTimer`]: crate::HashedWheelTimer
pub trait TimerTask: Send + 'static {
    fn run(self: Box<Self>, timeout: Timeout);
}

impl<F> TimerTask for F
where
    F: FnOnce(Timeout) + Send + 'static,
{
    fn run(self: Box<Self>, timeout: Timeout) {
        (*self)(timeout)
    }
}

/// Executes expired tasks on behalf of the worker thread.
///
/// The worker hands every expired task to the configured executor and moves
/// straight on to the next entry; the executor decides where and when the
/// task actually runs. The only contract is "accepts the closure and
/// eventually runs it".
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Default executor: runs the task inline on the worker thread.
///
/// Panics are caught and logged so a misbehaving task cannot take down the
/// tick loop. Long-running tasks will delay subsequent ticks; inject a
/// pool-backed [`TaskExecutor`] if that matters for your workload.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateExecutor;

impl TaskExecutor for ImmediateExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("timeout task panicked; worker continues");
        }
    }
}

/// Produces the single worker thread for a timer.
///
/// Injected so embedders can control naming, stack size, or priority. The
/// timer spawns exactly one thread through this over its whole lifetime.
pub trait ThreadFactory: Send + Sync + 'static {
    fn new_thread(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;
}

/// Default factory: a plain named `std::thread`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn new_thread(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new().name(name.to_owned()).spawn(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ==================== ImmediateExecutor ====================

    #[test]
    fn test_immediate_executor_runs_inline() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);

        ImmediateExecutor.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_immediate_executor_swallows_panic() {
        ImmediateExecutor.execute(Box::new(|| panic!("boom")));

        // Executor is still usable afterwards.
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        ImmediateExecutor.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    // ==================== DefaultThreadFactory ====================

    #[test]
    fn test_thread_factory_names_thread() {
        let handle = DefaultThreadFactory
            .new_thread(
                "hashwheel-test",
                Box::new(|| {
                    assert_eq!(std::thread::current().name(), Some("hashwheel-test"));
                }),
            )
            .unwrap();
        handle.join().unwrap();
    }
}
