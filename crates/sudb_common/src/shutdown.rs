//! Interruptible shutdown signal for background tasks.
//!
//! The autosave loop must not sleep through a stop request: `wait_timeout`
//! blocks for at most the given interval but wakes immediately when
//! `shutdown()` is called from the control plane.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A cooperative shutdown signal backed by `Condvar`.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    /// Create a new signal in the non-shutdown state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Signal shutdown. Wakes all waiters immediately.
    pub fn shutdown(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Check if shutdown has been requested (non-blocking).
    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `shutdown()`.
    /// Returns `true` if shutdown was requested (caller should exit).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _timeout) = self
            .inner
            .condvar
            .wait_timeout(guard, duration)
            .unwrap_or_else(|e| e.into_inner());
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
