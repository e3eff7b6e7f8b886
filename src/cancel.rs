//! Cooperative cancellation shared by everything one service or client run
//! spawns.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::FlowError;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag cancellation and wake every pending [`sleep`](Self::sleep).
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// `Err(Interrupted)` when already cancelled.
    pub fn check(&self) -> Result<(), FlowError> {
        if self.is_cancelled() {
            Err(FlowError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep for at least `duration` unless cancelled first, in which case
    /// `Err(Interrupted)` is returned as soon as the cancellation happens.
    pub fn sleep(&self, duration: Duration) -> Result<(), FlowError> {
        let deadline = Instant::now() + duration;
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return Err(FlowError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            cancelled = self
                .inner
                .wakeup
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
