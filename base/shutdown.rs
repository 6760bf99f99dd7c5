// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tools for propagating a stop signal to worker threads.
//!
//! Dropping the [`Sender`] requests shutdown. Receivers can be cloned,
//! polled with [`Receiver::check`], or blocked on with
//! [`Receiver::wait_for`], which doubles as an interruptible sleep. The
//! worker is fully synchronous, so there is no future-facing half; a mutex
//! and condvar are all that is needed.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    /// `true` iff shutdown has already happened.
    stopped: Mutex<bool>,
    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Note sequencing: modify the lock state, then notify waiters.
        // The opposite order would create a race in which something might
        // never wake.
        *self.0.stopped.lock().unwrap() = true;
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.stopped.lock().unwrap() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Sleeps for up to `timeout`, returning early with `Err` if shutdown is
    /// requested in the meantime.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let l = self.0.stopped.lock().unwrap();
        let result = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |stopped| !*stopped)
            .unwrap();
        if result.1.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }
}

/// Returns a sender and receiver for a stop signal.
///
/// Dropping the sender will request shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        stopped: Mutex::new(false),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    #[test]
    fn simple_check() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn blocking() {
        let (tx, rx) = super::channel();
        rx.wait_for(std::time::Duration::from_secs(0)).unwrap();
        let h = std::thread::spawn(move || {
            rx.wait_for(std::time::Duration::from_secs(1000))
                .unwrap_err()
        });

        // Make it likely that rx has done its initial check and is waiting on
        // the condvar.
        std::thread::sleep(std::time::Duration::from_millis(10));

        drop(tx);
        h.join().unwrap();
    }

    #[test]
    fn cloned_receivers_all_wake() {
        let (tx, rx) = super::channel();
        let rx2 = rx.clone();
        drop(tx);
        rx.check().unwrap_err();
        rx2.check().unwrap_err();
    }
}
