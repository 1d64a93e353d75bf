use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct TrackerInner {
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Aggregate handle over all currently running scheduled work.
///
/// Tracking new work is a single atomic increment and never waits on work
/// already tracked. [`RunTracker::wait_idle`] completes once every tracked run
/// has finished.
#[derive(Debug, Clone, Default)]
pub struct RunTracker {
    inner: Arc<TrackerInner>,
}

/// Keeps one run registered until dropped.
#[derive(Debug)]
pub struct RunGuard {
    inner: Arc<TrackerInner>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self) -> RunGuard {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        RunGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no tracked run is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent last guard drop is not missed
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
