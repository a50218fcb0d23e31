//! In-flight tracking with a bounded drain.
//!
//! Every call holds an [`InFlightGuard`] for its whole duration. Once
//! [`Lifecycle::begin_close`] flips the closed flag, `enter` fails fast and
//! [`Lifecycle::drain`] waits until the last guard is dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::FetchError;

#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    in_flight: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers one call. Fails immediately once closing has started.
    pub(crate) fn enter(&self) -> Result<InFlightGuard<'_>, FetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::Closed);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard { lifecycle: self };
        // close may have started between the check and the increment
        if self.closed.load(Ordering::SeqCst) {
            drop(guard);
            return Err(FetchError::Closed);
        }
        Ok(guard)
    }

    /// Marks the lifecycle closed. Returns `false` if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for the in-flight count to reach zero.
    ///
    /// Returns the number of calls still running if `deadline` elapses first.
    pub(crate) async fn drain(&self, deadline: Duration) -> Result<(), usize> {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.in_flight()),
        }
    }
}

/// Keeps one call counted until dropped.
#[derive(Debug)]
pub(crate) struct InFlightGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.lifecycle.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.lifecycle.idle.notify_waiters();
        }
    }
}
