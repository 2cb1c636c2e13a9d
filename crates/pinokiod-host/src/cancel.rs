//! Cooperative cancellation shared by lifecycle operations and everything
//! they call into. Sources cancel, tokens observe; dropping a source does
//! not cancel so scope exits stay side-effect free.

use pinokiod_core::{HostError, HostResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

#[derive(Clone)]
pub struct CancelSource {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that can never fire; for callers without a cancel path.
    pub fn never() -> Self {
        CancelSource::new().token()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Err(`cancelled`) if cancellation has been requested.
    pub fn check(&self) -> HostResult<()> {
        if self.is_cancelled() {
            return Err(HostError::Cancelled);
        }
        Ok(())
    }

    /// Resolve once cancellation is requested. Safe to race with `cancel`.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
