//! Cooperative shutdown signalling.
//!
//! One token is created per process and cloned into every loop. Loops observe
//! it at the top of each iteration and between bounded waits; an in-progress
//! sleep completes before the flag is seen, so shutdown latency is bounded by
//! the longest single wait.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags shutdown and wakes every waiter.
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut stopped = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *stopped = true;
        cvar.notify_all();
    }

    pub fn active(&self) -> bool {
        let (lock, _) = &*self.inner;
        !*lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleeps up to `timeout`, waking early when shutdown triggers. Returns
    /// whether the token is still active.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let stopped = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (stopped, _result) = cvar
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !*stopped
    }
}
