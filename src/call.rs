//! Write-once result channel between a worker thread and the submitting
//! thread.
//!
//! [`CallSlot`] is the producer half, owned by the callable task; exactly one
//! worker writes it, at most once. [`CallResult`] is the consumer half
//! returned by `submit_call`: move-only, so exactly one logical consumer can
//! await a given unit of work, and `get()` consumes the handle, so the
//! single-consumption contract holds at the type level. If the producer is
//! destroyed without writing (the task was discarded before execution), the
//! consumer observes [`CallError::Abandoned`] instead of blocking forever.

use crate::error::{CallError, ScriptError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct SlotState<T> {
    outcome: Option<Result<T, ScriptError>>,
    producer_gone: bool,
}

struct SlotInner<T> {
    state: Mutex<SlotState<T>>,
    condvar: Condvar,
}

impl<T> SlotInner<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                outcome: None,
                producer_gone: false,
            }),
            condvar: Condvar::new(),
        }
    }
}

/// Creates a connected producer/consumer pair.
pub(crate) fn channel<T>() -> (CallSlot<T>, CallResult<T>) {
    let inner = Arc::new(SlotInner::new());
    (
        CallSlot {
            inner: Arc::clone(&inner),
            written: false,
        },
        CallResult { inner },
    )
}

/// Producer half: written exactly once by the worker that executed the call.
pub(crate) struct CallSlot<T> {
    inner: Arc<SlotInner<T>>,
    written: bool,
}

impl<T> CallSlot<T> {
    /// Publishes the call's outcome and wakes the waiting consumer.
    pub(crate) fn fulfill(mut self, outcome: Result<T, ScriptError>) {
        {
            let mut state = self.inner.state.lock();
            state.outcome = Some(outcome);
        }
        self.written = true;
        self.inner.condvar.notify_all();
    }
}

impl<T> Drop for CallSlot<T> {
    fn drop(&mut self) {
        if !self.written {
            let mut state = self.inner.state.lock();
            state.producer_gone = true;
            drop(state);
            self.inner.condvar.notify_all();
        }
    }
}

/// Future-like handle for a submitted call's outcome.
///
/// Move-only; `get()` consumes the handle. The outcome is retained until
/// consumed, so a slow caller never loses the result.
pub struct CallResult<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T> CallResult<T> {
    /// Blocks until the worker publishes an outcome, then returns it.
    ///
    /// Returns the call's value, the normalized execution error, or
    /// [`CallError::Abandoned`] if the task was discarded before a worker
    /// could execute it.
    pub fn get(self) -> Result<T, CallError> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                return outcome.map_err(CallError::from);
            }
            if state.producer_gone {
                return Err(CallError::Abandoned);
            }
            self.inner.condvar.wait(&mut state);
        }
    }

    /// Waits up to `timeout` for the outcome to become available.
    ///
    /// Returns `true` once an outcome (or abandonment) is observable; the
    /// handle is untouched and `get()` can still consume it. Returns `false`
    /// if the timeout elapsed first.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.outcome.is_some() || state.producer_gone {
                return true;
            }
            if self
                .inner
                .condvar
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.outcome.is_some() || state.producer_gone;
            }
        }
    }

    /// Returns `true` if `get()` would return without blocking.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        let state = self.inner.state.lock();
        state.outcome.is_some() || state.producer_gone
    }
}

impl<T> fmt::Debug for CallResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallResult")
            .field("ready", &self.is_ready())
            .finish()
    }
}
