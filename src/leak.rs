use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Tracks a resource that must be explicitly released before it is dropped.
///
/// The timer registers a guard at construction (when leak detection is
/// enabled) and closes it on a successful `stop()`. A guard dropped without
/// being closed means the owning timer was abandoned with its worker thread
/// still alive, which is reported once via `tracing`.
pub(crate) struct LeakGuard {
    resource: &'static str,
    closed: AtomicBool,
}

impl LeakGuard {
    /// Close the guard. Returns `true` only for the call that actually
    /// transitioned it to closed.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for LeakGuard {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            tracing::warn!(
                resource = self.resource,
                "resource leak: dropped without stop(); its worker thread is still running"
            );
        }
    }
}

/// Register a live resource for leak tracking.
pub(crate) fn track(resource: &'static str) -> Arc<LeakGuard> {
    Arc::new(LeakGuard {
        resource,
        closed: AtomicBool::new(false),
    })
}
