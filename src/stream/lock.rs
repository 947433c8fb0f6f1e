use std::sync::atomic::{AtomicBool, Ordering};

/// Non-reentrant "drop if busy" flag.
///
/// There is no fairness and no queue: a caller that fails `try_acquire` must treat
/// the guarded resource as in use and give up. Only the holder calls `release`.
#[derive(Debug, Default)]
pub struct SingleFlightLock {
    busy: AtomicBool,
}

impl SingleFlightLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and marks the lock busy iff it was free. Never blocks.
    pub fn try_acquire(&self) -> bool {
        // Cheap read first so the common contended path never issues a read-modify-write.
        if self.busy.load(Ordering::Relaxed) {
            return false;
        }
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Clears the busy flag. Idempotent.
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    /// Acquire and return a guard that releases on drop, or `None` when busy.
    pub fn try_guard(&self) -> Option<SingleFlightGuard<'_>> {
        if self.try_acquire() {
            Some(SingleFlightGuard { lock: self })
        } else {
            None
        }
    }
}

/// Releases the owning `SingleFlightLock` when dropped, including during unwinding.
pub struct SingleFlightGuard<'a> {
    lock: &'a SingleFlightLock,
}

impl Drop for SingleFlightGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
