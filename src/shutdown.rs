//! Cooperative stop signal shared between the supervisor and one worker.
//!
//! Workers poll [`StopSignal::is_stopped`] at every cycle boundary and pace
//! themselves with [`StopSignal::sleep`], which returns early once the signal
//! fires so shutdown never waits out a long idle delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Sleeps for `duration` unless stopped first.
    ///
    /// Returns `true` when the full delay elapsed and the worker should carry
    /// on, `false` when the signal fired.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // register interest before the flag check so a racing stop() is seen
        notified.as_mut().enable();
        if self.is_stopped() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_stopped(),
            _ = notified => false,
        }
    }

    /// Resolves once the signal has fired.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}
