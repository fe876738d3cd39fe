//! Blocking primitives.
//!
//! There are two kinds of waiting in the firmware and they are kept apart on
//! purpose: [`Event::wait`] parks the calling task until an ISR signals the
//! event (millisecond-scale waits such as GPU stages or a new legacy frame),
//! [`spin_until`] polls a hardware status bit without ever handing the CPU to
//! another task (microsecond-scale waits such as FIFO space or RTC busy).

use std::{
    hint,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct State {
    signaled: bool,
    deleted: bool,
}

/// Kernel event. Shared between the ISR that signals it and the task waiting
/// on it.
#[derive(Debug)]
pub struct Event {
    state: Mutex<State>,
    cond: Condvar,
    one_shot: bool,
}

impl Event {
    /// Event that stays signaled until cleared.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_mode(false))
    }

    /// Event that clears itself when a waiter wakes up.
    #[must_use]
    pub fn one_shot() -> Arc<Self> {
        Arc::new(Self::with_mode(true))
    }

    const fn with_mode(one_shot: bool) -> Self {
        Self {
            state: Mutex::new(State {
                signaled: false,
                deleted: false,
            }),
            cond: Condvar::new(),
            one_shot,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn signal(&self) {
        self.state().signaled = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        self.state().signaled = false;
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state().signaled
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.state().deleted
    }

    /// Blocks the calling task until the event is signaled.
    ///
    /// # Errors
    /// [`Error::EventDeleted`] once the event was deleted, this is how
    /// long-lived tasks learn they should exit.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state();
        loop {
            if state.deleted {
                return Err(Error::EventDeleted);
            }
            if state.signaled {
                if self.one_shot {
                    state.signaled = false;
                }
                return Ok(());
            }
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Event::wait`] but gives up after `timeout`, returning `false`.
    ///
    /// # Errors
    /// [`Error::EventDeleted`] once the event was deleted.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let state = self.state();
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.signaled && !s.deleted)
            .unwrap_or_else(PoisonError::into_inner);

        if state.deleted {
            return Err(Error::EventDeleted);
        }
        let fired = state.signaled;
        if fired && self.one_shot {
            state.signaled = false;
        }
        Ok(fired)
    }

    /// Wakes every waiter with an error, further waits fail immediately.
    pub fn delete(&self) {
        self.state().deleted = true;
        self.cond.notify_all();
    }
}

/// Polls `ready` until it returns `true`.
///
/// Polls low-latency hardware state and does not yield to the scheduler.
/// Only use it for conditions that resolve within microseconds on hardware.
pub fn spin_until(mut ready: impl FnMut() -> bool) {
    let mut spins = 0_u32;
    while !ready() {
        hint::spin_loop();
        spins = spins.wrapping_add(1);
        // The host model may run the other side of the wait on a thread that
        // shares this core.
        if spins % 1024 == 0 {
            thread::yield_now();
        }
    }
}
