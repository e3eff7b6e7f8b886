//! Single-assignment rendezvous: written at most once, read by any number of
//! waiters, cancellable.
//!
//! The server-side provider keeps one slot per logical port so a driver can
//! ask for a connection before the matching socket has been accepted.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::FlowError;

enum State<T> {
    Pending,
    Ready(T),
    Cancelled,
}

pub struct Slot<T> {
    state: Mutex<State<T>>,
    changed: Condvar,
}

impl<T: Clone> Slot<T> {
    pub fn pending() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            changed: Condvar::new(),
        }
    }

    pub fn ready(value: T) -> Self {
        Self {
            state: Mutex::new(State::Ready(value)),
            changed: Condvar::new(),
        }
    }

    /// Store `value` and wake all waiters.  Returns `false` (dropping
    /// nothing, storing nothing) when the slot is already filled or
    /// cancelled.
    pub fn fulfill(&self, value: T) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Ready(value);
        self.changed.notify_all();
        true
    }

    /// Wake all waiters with `Interrupted`.  A filled slot stays filled.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, State::Pending) {
            *state = State::Cancelled;
        }
        self.changed.notify_all();
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::Pending
        )
    }

    /// The value, if already assigned.
    pub fn get(&self) -> Option<T> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Block until the slot is filled or cancelled.
    pub fn wait(&self) -> Result<T, FlowError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                State::Ready(value) => return Ok(value.clone()),
                State::Cancelled => return Err(FlowError::Interrupted),
                State::Pending => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// `Ok(None)` when the slot is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>, FlowError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                State::Ready(value) => return Ok(Some(value.clone())),
                State::Cancelled => return Err(FlowError::Interrupted),
                State::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}
