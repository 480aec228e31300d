use std::ptr;
use std::sync::Arc;

use crate::task::TaskExecutor;
use crate::timeout::{NO_BUCKET, TimeoutShared};

/// One slot of the wheel: a doubly linked list of timeouts.
///
/// Entries in the same bucket share a wheel index but may be due on different
/// revolutions; the per-entry round counter distinguishes "due this lap" from
/// "due in N more laps".
///
/// The list is owned and mutated by the worker thread only. Forward links are
/// owning (`Arc`), back links are raw pointers; both are valid exactly while
/// an entry is linked here. All methods are `unsafe` against concurrent use
/// from other threads, which the crate rules out structurally rather than
/// with locks.
pub(crate) struct Bucket {
    head: Option<Arc<TimeoutShared>>,
    tail: *const TimeoutShared,
    /// This bucket's wheel index, stamped into entries for O(1) removal.
    index: usize,
}

// SAFETY: a Bucket lives inside the worker's wheel and is never shared;
// Send is needed only to move the wheel into the worker thread at start.
unsafe impl Send for Bucket {}

impl Bucket {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            head: None,
            tail: ptr::null(),
            index,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append an entry to the tail of the list.
    pub(crate) fn add_timeout(&mut self, entry: Arc<TimeoutShared>) {
        let raw: *const TimeoutShared = Arc::as_ptr(&entry);

        // SAFETY: worker thread; `entry` is not linked anywhere else (a
        // timeout is placed into at most one bucket).
        unsafe {
            debug_assert_eq!(entry.bucket_index(), NO_BUCKET);
            entry.set_bucket_index(self.index);
            *entry.prev.get() = self.tail;

            if self.tail.is_null() {
                self.head = Some(entry);
            } else {
                *(*self.tail).next.get() = Some(entry);
            }
        }
        self.tail = raw;
    }

    /// Unlink an entry, returning the list's owning reference to it.
    ///
    /// O(1) given the entry's own prev/next pointers. The entry's bucket
    /// index is reset so later passes see it as unlinked.
    pub(crate) fn remove(&mut self, entry: &TimeoutShared) -> Arc<TimeoutShared> {
        // SAFETY: worker thread; caller guarantees `entry` is linked in this
        // bucket, so its prev/next pointers and the neighbouring nodes are
        // live.
        unsafe {
            debug_assert_eq!(entry.bucket_index(), self.index);

            let prev = *entry.prev.get();
            let next = (*entry.next.get()).take();

            if self.tail == entry as *const TimeoutShared {
                self.tail = prev;
            }
            if let Some(next) = next.as_deref() {
                *next.prev.get() = prev;
            }

            let owned = if prev.is_null() {
                self.head.take()
            } else {
                (*(*prev).next.get()).take()
            };
            let owned = owned.expect("entry not linked in its recorded bucket");
            debug_assert!(ptr::eq(Arc::as_ptr(&owned), entry));

            if prev.is_null() {
                self.head = next;
            } else {
                *(*prev).next.get() = next;
            }

            *entry.prev.get() = ptr::null();
            entry.set_bucket_index(NO_BUCKET);
            entry.release_pending();
            owned
        }
    }

    /// One expiry pass for the tick ending at `deadline` (nanoseconds since
    /// the timer's start time).
    ///
    /// Walks the list once: due entries (round counter at zero) are unlinked
    /// and expired, cancelled entries are unlinked, everything else has its
    /// round counter decremented and stays for a later lap. O(entries in this
    /// bucket), never O(entries in the wheel).
    pub(crate) fn expire_timeouts(&mut self, deadline: u64, executor: &dyn TaskExecutor) {
        // SAFETY: worker thread; `cur` always points at a node still linked
        // in this list, and its successor is captured before any unlink.
        unsafe {
            let mut cur: *const TimeoutShared =
                self.head.as_deref().map_or(ptr::null(), |n| n as *const _);

            while !cur.is_null() {
                let entry = &*cur;
                let next: *const TimeoutShared = (*entry.next.get())
                    .as_deref()
                    .map_or(ptr::null(), |n| n as *const _);

                if entry.rounds() == 0 {
                    let owned = self.remove(entry);
                    if owned.deadline > deadline {
                        // The wheel index already guarantees the entry is due;
                        // a later deadline here means broken placement math.
                        debug_assert!(false, "timeout expired ahead of its deadline");
                        tracing::error!(
                            deadline = owned.deadline,
                            tick_deadline = deadline,
                            "timeout expired ahead of its deadline"
                        );
                    }
                    TimeoutShared::expire(&owned, executor);
                } else if entry.is_cancelled() {
                    self.remove(entry);
                } else {
                    entry.decrement_rounds();
                }

                cur = next;
            }
        }
    }

    /// Shutdown sweep: unlink everything, collecting entries that are still
    /// pending so the caller of `stop()` gets back its unprocessed work.
    pub(crate) fn clear_timeouts(&mut self, out: &mut Vec<Arc<TimeoutShared>>) {
        while let Some(entry) = self.poll_head() {
            if !entry.is_cancelled() && !entry.is_expired() {
                out.push(entry);
            }
        }
        self.tail = ptr::null();
    }

    fn poll_head(&mut self) -> Option<Arc<TimeoutShared>> {
        let head = self.head.take()?;

        // SAFETY: worker thread; `head` was the first linked node.
        unsafe {
            let next = (*head.next.get()).take();
            if let Some(next) = next.as_deref() {
                *next.prev.get() = ptr::null();
            } else {
                self.tail = ptr::null();
            }
            self.head = next;

            *head.prev.get() = ptr::null();
            head.set_bucket_index(NO_BUCKET);
        }
        Some(head)
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        // Unlink iteratively; dropping a long Arc chain recursively would
        // overflow the stack.
        while self.poll_head().is_some() {}
    }
}
