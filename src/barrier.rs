//! One-shot start barrier shared by [`crate::receiver::Receiver`] and
//! [`crate::decoder::Decoder`] (spec.md §5: "the `start()` caller waits on a
//! condition variable signalled by the spawned task after it has
//! successfully initialised").
//!
//! The original C++ hand-rolls this twice with a `pthread_mutex_t` +
//! `pthread_cond_t` pair, once in `Receiver.cpp` and once in `Decoder.cpp`.
//! A plain `Mutex<Option<bool>>` + `Condvar` captures the same protocol and
//! is shared between both callers instead of duplicated.

use std::sync::{Condvar, Mutex};

pub struct ReadyBarrier {
    state: Mutex<Option<bool>>,
    cvar: Condvar,
}

impl ReadyBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cvar: Condvar::new(),
        }
    }

    /// Rearm the barrier for the next `start()` cycle.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = None;
    }

    /// Called by the spawned task once it knows whether it initialised.
    pub fn signal(&self, ok: bool) {
        *self.state.lock().unwrap() = Some(ok);
        self.cvar.notify_one();
    }

    /// Called by `start()`; blocks until `signal` has been called.
    pub fn wait(&self) -> bool {
        let mut guard = self.state.lock().unwrap();
        while guard.is_none() {
            guard = self.cvar.wait(guard).unwrap();
        }
        guard.unwrap()
    }
}

impl Default for ReadyBarrier {
    fn default() -> Self {
        Self::new()
    }
}
