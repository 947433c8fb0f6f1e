//! One-shot cancellation signal shared by the capture loop and every stream.
//!
//! A `CancellationToken` is cheap to clone; all clones observe the same signal.
//! Cancelling is idempotent. Callbacks registered before cancellation run exactly
//! once on the thread that cancels; callbacks registered afterwards run immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    // `None` once the callbacks have been drained by `cancel`.
    callbacks: Mutex<Option<HashMap<u64, Callback>>>,
    sleep_lock: Mutex<()>,
    wake: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                callbacks: Mutex::new(Some(HashMap::new())),
                ..TokenInner::default()
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fire the signal. Returns `true` only for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let _guard = self
                .inner
                .sleep_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.inner.wake.notify_all();
        }
        let callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callbacks) = callbacks {
            let mut ordered: Vec<_> = callbacks.into_iter().collect();
            ordered.sort_by_key(|(id, _)| *id);
            for (_, callback) in ordered {
                callback();
            }
        }
        true
    }

    /// Run `callback` once when the token fires.
    ///
    /// Dropping the returned guard deregisters the callback if it has not run yet.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match callbacks.as_mut() {
                Some(map) => {
                    map.insert(id, Box::new(callback));
                    None
                }
                None => Some(callback),
            }
        };
        if let Some(callback) = pending {
            callback();
        }
        CancelRegistration {
            id,
            token: Arc::downgrade(&self.inner),
        }
    }

    /// Sleep for up to `timeout`. Returns `true` if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .inner
            .sleep_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.wake.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Deregisters a pending cancellation callback on drop.
#[must_use = "dropping the registration removes the callback"]
pub struct CancelRegistration {
    id: u64,
    token: Weak<TokenInner>,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        let Some(inner) = self.token.upgrade() else {
            return;
        };
        let mut callbacks = inner
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(map) = callbacks.as_mut() {
            map.remove(&self.id);
        }
    }
}
