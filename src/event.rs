// Xilinx XDMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Binary completion event.
//!
//! Signalled by the interrupt demultiplexer, waited on by the thread that
//! started the transfer. One signal satisfies one wait.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Auto-reset binary event.
#[derive(Debug, Default)]
pub struct Event {
    signalled: Mutex<bool>,
    cv: Condvar,
    #[cfg(feature = "async")]
    notify: tokio::sync::Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event, waking one waiter.
    pub fn signal(&self) {
        let mut s = self.signalled.lock().unwrap_or_else(|p| p.into_inner());
        *s = true;
        self.cv.notify_one();
        #[cfg(feature = "async")]
        self.notify.notify_one();
    }

    /// Clear a pending signal.
    pub fn reset(&self) {
        *self.signalled.lock().unwrap_or_else(|p| p.into_inner()) = false;
    }

    /// Consume a pending signal without blocking.
    pub fn try_wait(&self) -> bool {
        std::mem::take(&mut *self.signalled.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Wait for the event. Returns false if `timeout` expired first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut s = self.signalled.lock().unwrap_or_else(|p| p.into_inner());
        while !*s {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            s = self
                .cv
                .wait_timeout(s, deadline - now)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
        *s = false;
        true
    }

    /// Asynchronous variant of [`Event::wait`].
    #[cfg(feature = "async")]
    pub async fn wait_async(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.try_wait() {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_wait();
            }
        }
    }
}
