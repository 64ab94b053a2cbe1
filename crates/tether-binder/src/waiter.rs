//! Waiters and the two acquisition drivers.
//!
//! An acquisition that cannot be served at once either leads (obtains and
//! opens a channel for everyone) or queues a waiter and is resolved later by
//! whoever completes the open, fails it, or stops the synchronizer. The
//! blocking driver parks the thread on a condition variable; the suspending
//! driver awaits a oneshot. Both feed the same transition functions.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::Channel;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::lock;
use crate::masking::MaskingMode;
use crate::synchronizer::{Acquired, Admission, ChannelLease, ChannelSynchronizer, SynchronizerState};

/// What a queued waiter is told.
pub(crate) enum Resolution<C> {
    /// Use this channel; the count already includes the waiter.
    Channel(Arc<C>),
    /// Become the leader and obtain a channel.
    Lead,
    /// The binder faulted.
    Faulted,
    /// The binder closed.
    Closed,
}

/// A queued acquisition.
pub(crate) trait Waiter<C>: Send + Sync {
    fn id(&self) -> u64;

    /// Leader-eligible waiters sit in the leader queue.
    fn can_get_channel(&self) -> bool;

    /// Delivers a resolution. `Err` hands it back when the waiter is gone, so
    /// the caller can undo it.
    fn resolve(&self, resolution: Resolution<C>) -> std::result::Result<(), Resolution<C>>;
}

pub(crate) struct BlockingWaiter<C> {
    id: u64,
    can_get_channel: bool,
    slot: Mutex<Option<Resolution<C>>>,
    cond: Condvar,
}

impl<C> BlockingWaiter<C> {
    pub(crate) fn new(id: u64, can_get_channel: bool) -> Self {
        Self {
            id,
            can_get_channel,
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Parks until resolved or the deadline expires.
    fn wait(&self, deadline: Deadline) -> Option<Resolution<C>> {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(resolution) = slot.take() {
                return Some(resolution);
            }
            if deadline.is_infinite() {
                slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .cond
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn wait_forever(&self) -> Resolution<C> {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(resolution) = slot.take() {
                return resolution;
            }
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<C: Send + Sync> Waiter<C> for BlockingWaiter<C> {
    fn id(&self) -> u64 {
        self.id
    }

    fn can_get_channel(&self) -> bool {
        self.can_get_channel
    }

    fn resolve(&self, resolution: Resolution<C>) -> std::result::Result<(), Resolution<C>> {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            return Err(resolution);
        }
        *slot = Some(resolution);
        drop(slot);
        self.cond.notify_one();
        Ok(())
    }
}

pub(crate) struct AsyncWaiter<C> {
    id: u64,
    can_get_channel: bool,
    tx: Mutex<Option<oneshot::Sender<Resolution<C>>>>,
}

impl<C> AsyncWaiter<C> {
    pub(crate) fn new(id: u64, can_get_channel: bool) -> (Self, oneshot::Receiver<Resolution<C>>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Self {
            id,
            can_get_channel,
            tx: Mutex::new(Some(tx)),
        };
        (waiter, rx)
    }
}

impl<C: Send + Sync> Waiter<C> for AsyncWaiter<C> {
    fn id(&self) -> u64 {
        self.id
    }

    fn can_get_channel(&self) -> bool {
        self.can_get_channel
    }

    fn resolve(&self, resolution: Resolution<C>) -> std::result::Result<(), Resolution<C>> {
        match lock(&self.tx).take() {
            Some(tx) => tx.send(resolution),
            None => Err(resolution),
        }
    }
}

/// Undoes an abandoned open: aborts the half-opened channel and passes the
/// lead on.
struct OpeningGuard<'a, C: Channel> {
    synchronizer: &'a ChannelSynchronizer<C>,
    channel: Option<Arc<C>>,
    armed: bool,
}

impl<'a, C: Channel> OpeningGuard<'a, C> {
    fn new(synchronizer: &'a ChannelSynchronizer<C>) -> Self {
        Self {
            synchronizer,
            channel: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C: Channel> Drop for OpeningGuard<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(channel) = self.channel.take() {
            channel.abort();
        }
        self.synchronizer.metrics().inc_open_failures();
        self.synchronizer.on_get_channel_failed();
    }
}

/// A suspended waiter still registered with the synchronizer. Dropped while
/// armed (the caller's future was cancelled), it withdraws from the queue or
/// undoes a resolution that already arrived.
struct PendingWaiter<'a, C: Channel> {
    synchronizer: &'a ChannelSynchronizer<C>,
    id: u64,
    can_get_channel: bool,
    rx: oneshot::Receiver<Resolution<C>>,
    armed: bool,
}

impl<C: Channel> Drop for PendingWaiter<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.synchronizer.remove_waiter(self.id, self.can_get_channel) {
            return;
        }
        self.rx.close();
        if let Ok(resolution) = self.rx.try_recv() {
            self.synchronizer.reject(resolution);
        }
    }
}

impl<C: Channel> ChannelSynchronizer<C> {
    fn lease(&self, channel: Arc<C>, suspending: bool) -> Acquired<'_, C> {
        Acquired::Channel(ChannelLease::new(self, channel, suspending))
    }

    fn settle(&self, resolution: Resolution<C>, mask: MaskingMode, suspending: bool) -> Result<Acquired<'_, C>> {
        match resolution {
            Resolution::Channel(channel) => Ok(self.lease(channel, suspending)),
            Resolution::Faulted => self.refuse(false, mask),
            Resolution::Closed => self.refuse(true, mask),
            // Handled by the callers before settling.
            Resolution::Lead => self.refuse(self.state() == SynchronizerState::Closed, mask),
        }
    }

    fn complete_lead(&self, mask: MaskingMode, suspending: bool) -> Result<Acquired<'_, C>> {
        match self.on_channel_opened()? {
            Ok(channel) => Ok(self.lease(channel, suspending)),
            Err(terminal) => self.settle(terminal, mask, suspending),
        }
    }

    /// Acquires the shared channel, parking the calling thread while waiting.
    ///
    /// `can_get_channel` lets the caller lead a channel creation;
    /// `can_cause_fault` lets a missing channel fault a binder that does not
    /// tolerate faults.
    pub fn acquire(
        &self,
        can_get_channel: bool,
        can_cause_fault: bool,
        deadline: Deadline,
        mask: MaskingMode,
    ) -> Result<Acquired<'_, C>> {
        let admission = self.admit(can_get_channel, can_cause_fault, mask, || {
            Arc::new(BlockingWaiter::new(self.next_waiter_id(), can_get_channel))
        })?;
        match admission {
            Admission::Ready(channel) => Ok(self.lease(channel, false)),
            Admission::NoChannel => Ok(Acquired::NoChannel),
            Admission::Lead(existing) => self.lead_blocking(existing, deadline, mask),
            Admission::Queued(waiter) => self.wait_blocking(waiter, deadline, mask),
        }
    }

    fn wait_blocking(
        &self,
        waiter: Arc<BlockingWaiter<C>>,
        deadline: Deadline,
        mask: MaskingMode,
    ) -> Result<Acquired<'_, C>> {
        let resolution = match waiter.wait(deadline) {
            Some(resolution) => resolution,
            None if self.remove_waiter(waiter.id, waiter.can_get_channel) => {
                self.metrics().inc_waiter_timeouts();
                debug!(binder = %self.binder_id(), waiter = waiter.id, "waiter timed out");
                return Ok(Acquired::TimedOut);
            }
            None => waiter.wait_forever(),
        };
        match resolution {
            Resolution::Lead => self.lead_blocking(None, deadline, mask),
            other => self.settle(other, mask, false),
        }
    }

    fn lead_blocking(
        &self,
        existing: Option<Arc<C>>,
        deadline: Deadline,
        mask: MaskingMode,
    ) -> Result<Acquired<'_, C>> {
        let mut opening = OpeningGuard::new(self);
        let channel = match existing {
            Some(channel) => channel,
            None => match self.source().try_get_channel(deadline.remaining())? {
                Some(channel) => match self.install_channel(channel) {
                    Some(channel) => channel,
                    None => {
                        opening.disarm();
                        return self.refuse(self.state() == SynchronizerState::Closed, mask);
                    }
                },
                None => return Ok(Acquired::TimedOut),
            },
        };
        opening.channel = Some(Arc::clone(&channel));

        if self.must_open_channel() {
            channel.open(deadline.remaining())?;
        }
        opening.disarm();
        self.complete_lead(mask, false)
    }

    /// Suspending form of [`ChannelSynchronizer::acquire`]. Cancelling the
    /// returned future withdraws the acquisition cleanly.
    pub async fn acquire_async(
        &self,
        can_get_channel: bool,
        can_cause_fault: bool,
        deadline: Deadline,
        mask: MaskingMode,
    ) -> Result<Acquired<'_, C>> {
        let (waiter, rx) = AsyncWaiter::new(self.next_waiter_id(), can_get_channel);
        let waiter = Arc::new(waiter);
        let queued = Arc::clone(&waiter);
        let admission = self.admit(can_get_channel, can_cause_fault, mask, move || queued)?;
        match admission {
            Admission::Ready(channel) => Ok(self.lease(channel, true)),
            Admission::NoChannel => Ok(Acquired::NoChannel),
            Admission::Lead(existing) => self.lead_async(existing, deadline, mask).await,
            Admission::Queued(_) => {
                let pending = PendingWaiter {
                    synchronizer: self,
                    id: waiter.id,
                    can_get_channel,
                    rx,
                    armed: true,
                };
                self.wait_suspended(pending, deadline, mask).await
            }
        }
    }

    async fn wait_suspended<'a>(
        &'a self,
        mut pending: PendingWaiter<'a, C>,
        deadline: Deadline,
        mask: MaskingMode,
    ) -> Result<Acquired<'a, C>> {
        let received = if deadline.is_infinite() {
            Some((&mut pending.rx).await)
        } else {
            tokio::time::timeout(deadline.remaining(), &mut pending.rx)
                .await
                .ok()
        };
        let received = match received {
            Some(received) => received,
            None if self.remove_waiter(pending.id, pending.can_get_channel) => {
                pending.armed = false;
                self.metrics().inc_waiter_timeouts();
                debug!(binder = %self.binder_id(), waiter = pending.id, "waiter timed out");
                return Ok(Acquired::TimedOut);
            }
            None => (&mut pending.rx).await,
        };
        pending.armed = false;

        // A sender dropped unresolved only happens while tearing down.
        let resolution = received.unwrap_or(Resolution::Closed);
        match resolution {
            Resolution::Lead => self.lead_async(None, deadline, mask).await,
            other => self.settle(other, mask, true),
        }
    }

    async fn lead_async(
        &self,
        existing: Option<Arc<C>>,
        deadline: Deadline,
        mask: MaskingMode,
    ) -> Result<Acquired<'_, C>> {
        let mut opening = OpeningGuard::new(self);
        let channel = match existing {
            Some(channel) => channel,
            None => match self.source().try_get_channel_async(deadline.remaining()).await? {
                Some(channel) => match self.install_channel(channel) {
                    Some(channel) => channel,
                    None => {
                        opening.disarm();
                        return self.refuse(self.state() == SynchronizerState::Closed, mask);
                    }
                },
                None => return Ok(Acquired::TimedOut),
            },
        };
        opening.channel = Some(Arc::clone(&channel));

        if self.must_open_channel() {
            channel.open_async(deadline.remaining()).await?;
        }
        opening.disarm();
        self.complete_lead(mask, true)
    }
}
