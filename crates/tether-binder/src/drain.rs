//! One-shot drain signal shared by everyone waiting for in-flight operations.
//!
//! The synchronizer hands out the same [`DrainSignal`] to every party that
//! asks to wait while operations are outstanding, and sets it when the active
//! count reaches zero. Waiting works from a parked thread or a suspended task.

use std::sync::{Condvar, Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use crate::deadline::Deadline;
use crate::lock;

/// A latch that stays set once fired.
#[derive(Debug, Default)]
pub struct DrainSignal {
    set: Mutex<bool>,
    cond: Condvar,
    notify: Notify,
}

impl DrainSignal {
    /// Creates an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal, waking blocked threads and suspended tasks alike.
    pub fn set(&self) {
        let mut set = lock(&self.set);
        if *set {
            return;
        }
        *set = true;
        drop(set);
        self.cond.notify_all();
        self.notify.notify_waiters();
        debug!("drain signal set");
    }

    /// Returns `true` once [`DrainSignal::set`] was called.
    pub fn is_set(&self) -> bool {
        *lock(&self.set)
    }

    /// Parks the calling thread until the signal fires or `deadline` expires.
    /// Returns `false` on expiry.
    pub fn wait(&self, deadline: Deadline) -> bool {
        let mut set = lock(&self.set);
        while !*set {
            if deadline.is_infinite() {
                set = self.cond.wait(set).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return false;
            }
            set = self
                .cond
                .wait_timeout(set, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Suspends until the signal fires or `deadline` expires. Returns `false`
    /// on expiry.
    pub async fn wait_async(&self, deadline: Deadline) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking so a concurrent set() cannot slip between.
        notified.as_mut().enable();
        if self.is_set() {
            return true;
        }
        if deadline.is_infinite() {
            notified.await;
            return true;
        }
        match tokio::time::timeout(deadline.remaining(), notified).await {
            Ok(()) => true,
            Err(_) => self.is_set(),
        }
    }
}
