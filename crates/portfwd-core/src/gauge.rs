//! Live-session accounting.
//!
//! Every TCP connection pair and every UDP client session holds a
//! [`SessionGuard`] for as long as its sockets are open. Dropping the guard
//! decrements the owning [`SessionGauge`], so the gauge reads the number
//! of sessions whose sockets have not yet been released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter of live sessions for one forwarder.
#[derive(Debug, Clone, Default)]
pub struct SessionGauge {
    active: Arc<AtomicUsize>,
}

impl SessionGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new session. The returned guard is `Send` so it can be moved
    /// into the task that owns the session's sockets.
    pub fn acquire(&self) -> SessionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            counter: self.active.clone(),
        }
    }

    /// Current number of live sessions.
    ///
    /// `Relaxed` ordering; good for logging and tests, not for synchronisation.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// RAII guard that decrements the session count on drop.
#[derive(Debug)]
pub struct SessionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
