//! The channel synchronizer: one shared channel, a reference count, and two
//! waiter queues behind a single lock.
//!
//! Every mutation of the shared state goes through one of the named
//! transition functions below. Waiters are woken, channels are opened,
//! closed or aborted, and binder callbacks run only after the lock is
//! released.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelSource, CommunicationState, FaultHandler};
use crate::deadline::Deadline;
use crate::drain::DrainSignal;
use crate::error::{BinderError, Result};
use crate::lock;
use crate::masking::{MaskingMode, TolerateFaultsMode};
use crate::metrics::BinderMetrics;
use crate::waiter::{Resolution, Waiter};

/// Internal lifecycle of a [`ChannelSynchronizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronizerState {
    /// Binder not opened yet.
    Created,
    /// No usable channel; the next eligible acquisition leads.
    NoChannel,
    /// A leader is obtaining and opening a channel.
    ChannelOpening,
    /// The current channel is ready.
    ChannelOpened,
    /// The current channel retires when the last holder releases it.
    ChannelClosing,
    /// Terminal: the binder faulted.
    Faulted,
    /// Terminal: the binder closed or aborted.
    Closed,
}

impl SynchronizerState {
    fn is_terminal(self) -> bool {
        matches!(self, SynchronizerState::Faulted | SynchronizerState::Closed)
    }
}

/// Callbacks from the synchronizer into the binder that owns it.
pub(crate) trait SynchronizerHost<C: Channel>: Send + Sync {
    fn synchronizer(&self) -> &ChannelSynchronizer<C>;
    /// Faults the binder (terminal).
    fn fault(&self);
    /// A tolerated fault retired the channel.
    fn connection_lost(&self);
    fn closed_error(&self, mask: MaskingMode) -> Option<BinderError>;
    fn faulted_error(&self, mask: MaskingMode) -> Option<BinderError>;
    /// Routes a background failure (retired channel close) through masking.
    fn report_exception(&self, error: BinderError);
}

pub(crate) type WaiterQueue<C> = VecDeque<Arc<dyn Waiter<C>>>;

struct SyncCore<C: Channel> {
    state: SynchronizerState,
    current: Option<Arc<C>>,
    subscription: Option<u64>,
    count: usize,
    aborting: bool,
    inner_channel_faulted: bool,
    tolerate_faults: bool,
    leaders: WaiterQueue<C>,
    followers: WaiterQueue<C>,
    drain: Option<Arc<DrainSignal>>,
}

impl<C: Channel> SyncCore<C> {
    fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    fn current_if_created(&self) -> Option<Arc<C>> {
        self.current
            .as_ref()
            .filter(|channel| channel.state() == CommunicationState::Created)
            .cloned()
    }

    fn unsubscribe(&mut self) {
        if let (Some(channel), Some(id)) = (self.current.as_ref(), self.subscription.take()) {
            channel.fault_notifier().unsubscribe(id);
        }
    }
}

/// Outcome of admission, decided under the lock.
pub(crate) enum Admission<C: Channel, W> {
    /// The channel was ready; the count already includes the caller.
    Ready(Arc<C>),
    /// The caller leads; the state is now `ChannelOpening`.
    Lead(Option<Arc<C>>),
    /// The caller was queued and must wait on its waiter.
    Queued(Arc<W>),
    /// No channel and none will be provided to this caller.
    NoChannel,
}

/// Result of a channel acquisition.
pub enum Acquired<'a, C: Channel> {
    /// A channel the caller holds until the lease is released.
    Channel(ChannelLease<'a, C>),
    /// No channel is available and the situation was masked or is not an
    /// error for this caller.
    NoChannel,
    /// The deadline expired before a channel became available.
    TimedOut,
}

impl<C: Channel> std::fmt::Debug for Acquired<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acquired::Channel(_) => f.write_str("Acquired::Channel"),
            Acquired::NoChannel => f.write_str("Acquired::NoChannel"),
            Acquired::TimedOut => f.write_str("Acquired::TimedOut"),
        }
    }
}

/// A counted hold on the shared channel.
///
/// Dropping the lease releases it; [`ChannelLease::release`] does the same
/// and reports whether the channel was being aborted underneath the holder.
pub struct ChannelLease<'a, C: Channel> {
    synchronizer: &'a ChannelSynchronizer<C>,
    channel: Arc<C>,
    suspending: bool,
    released: bool,
}

impl<'a, C: Channel> ChannelLease<'a, C> {
    pub(crate) fn new(synchronizer: &'a ChannelSynchronizer<C>, channel: Arc<C>, suspending: bool) -> Self {
        Self {
            synchronizer,
            channel,
            suspending,
            released: false,
        }
    }

    /// The shared channel instance.
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Releases the hold. Returns `true` when the channel was being aborted by
    /// the synchronizer at release time.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.synchronizer.return_channel(self.suspending)
    }
}

impl<C: Channel> Deref for ChannelLease<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.channel
    }
}

impl<C: Channel> Drop for ChannelLease<'_, C> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.synchronizer.return_channel(self.suspending);
        }
    }
}

/// Settings fixed at construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SynchronizerSettings {
    pub fault_mode: TolerateFaultsMode,
    pub must_open_channel: bool,
    pub must_close_channel: bool,
    pub close_timeout: Duration,
}

/// Owner of the shared channel reference, its lifecycle and its holders.
pub struct ChannelSynchronizer<C: Channel> {
    core: Mutex<SyncCore<C>>,
    source: Arc<dyn ChannelSource<C>>,
    settings: SynchronizerSettings,
    metrics: Arc<BinderMetrics>,
    host: Weak<dyn SynchronizerHost<C>>,
    next_waiter_id: AtomicU64,
    binder_id: Uuid,
}

impl<C: Channel> ChannelSynchronizer<C> {
    pub(crate) fn new(
        channel: Option<Arc<C>>,
        source: Arc<dyn ChannelSource<C>>,
        settings: SynchronizerSettings,
        metrics: Arc<BinderMetrics>,
        host: Weak<dyn SynchronizerHost<C>>,
        binder_id: Uuid,
    ) -> Self {
        Self {
            core: Mutex::new(SyncCore {
                state: SynchronizerState::Created,
                current: channel,
                subscription: None,
                count: 0,
                aborting: false,
                inner_channel_faulted: false,
                tolerate_faults: true,
                leaders: VecDeque::new(),
                followers: VecDeque::new(),
                drain: None,
            }),
            source,
            settings,
            metrics,
            host,
            next_waiter_id: AtomicU64::new(1),
            binder_id,
        }
    }

    fn core(&self) -> MutexGuard<'_, SyncCore<C>> {
        lock(&self.core)
    }

    fn host(&self) -> Option<Arc<dyn SynchronizerHost<C>>> {
        self.host.upgrade()
    }

    pub(crate) fn source(&self) -> &Arc<dyn ChannelSource<C>> {
        &self.source
    }

    pub(crate) fn must_open_channel(&self) -> bool {
        self.settings.must_open_channel
    }

    pub(crate) fn metrics(&self) -> &BinderMetrics {
        &self.metrics
    }

    pub(crate) fn binder_id(&self) -> Uuid {
        self.binder_id
    }

    pub(crate) fn next_waiter_id(&self) -> u64 {
        self.next_waiter_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Current internal state.
    pub fn state(&self) -> SynchronizerState {
        self.core().state
    }

    /// Number of outstanding acquisitions.
    pub fn active_count(&self) -> usize {
        self.core().count
    }

    /// True while the current channel is being aborted on behalf of the owner.
    pub fn aborting(&self) -> bool {
        self.core().aborting
    }

    /// True while a channel is opening or opened.
    pub fn connected(&self) -> bool {
        matches!(
            self.core().state,
            SynchronizerState::ChannelOpening | SynchronizerState::ChannelOpened
        )
    }

    /// The current channel instance, if any.
    pub fn current_channel(&self) -> Option<Arc<C>> {
        self.core().current.clone()
    }

    /// Whether faults of the current channel instance are absorbed.
    pub fn tolerate_faults(&self) -> bool {
        self.core().tolerate_faults
    }

    /// Number of queued leader and follower waiters.
    pub fn queued_waiters(&self) -> (usize, usize) {
        let core = self.core();
        (core.leaders.len(), core.followers.len())
    }

    /// Error (or masked absence of one) for an acquisition against a terminal
    /// synchronizer.
    pub(crate) fn terminal_error(&self, closed: bool, mask: MaskingMode) -> Option<BinderError> {
        match self.host() {
            Some(host) if closed => host.closed_error(mask),
            Some(host) => host.faulted_error(mask),
            None if mask.masks_handled() => None,
            None => Some(BinderError::Closed),
        }
    }

    pub(crate) fn refuse<'a>(&'a self, closed: bool, mask: MaskingMode) -> Result<Acquired<'a, C>> {
        match self.terminal_error(closed, mask) {
            Some(e) => Err(e),
            None => Ok(Acquired::NoChannel),
        }
    }

    fn fault_handler(&self, channel: &Arc<C>) -> FaultHandler {
        let host = self.host.clone();
        let channel = Arc::downgrade(channel);
        Arc::new(move || {
            if let (Some(host), Some(channel)) = (host.upgrade(), channel.upgrade()) {
                host.synchronizer().on_channel_faulted(&channel);
            }
        })
    }

    /// Fixes the fault tolerance for the current instance and watches it for
    /// faults. Called under the lock when the instance becomes ready.
    fn arm_current(&self, core: &mut SyncCore<C>) {
        let Some(channel) = core.current.clone() else {
            return;
        };
        match self.settings.fault_mode {
            TolerateFaultsMode::Never => core.tolerate_faults = false,
            TolerateFaultsMode::IfNotSecuritySession => {
                core.tolerate_faults = !channel.has_security_session()
            }
            TolerateFaultsMode::Always => {}
        }
        core.unsubscribe();
        core.subscription = Some(channel.fault_notifier().subscribe(self.fault_handler(&channel)));
    }

    /// Decides how an acquisition proceeds.
    pub(crate) fn admit<W, F>(
        &self,
        can_get_channel: bool,
        can_cause_fault: bool,
        mask: MaskingMode,
        make_waiter: F,
    ) -> Result<Admission<C, W>>
    where
        W: Waiter<C> + 'static,
        F: FnOnce() -> Arc<W>,
    {
        let fault_binder;
        {
            let mut core = self.core();
            match core.state {
                SynchronizerState::Created => {
                    return Err(BinderError::invalid_state("ChannelSynchronizer", core.state));
                }
                SynchronizerState::Closed | SynchronizerState::Faulted => {
                    let closed = core.state == SynchronizerState::Closed;
                    drop(core);
                    return match self.terminal_error(closed, mask) {
                        Some(e) => Err(e),
                        None => Ok(Admission::NoChannel),
                    };
                }
                SynchronizerState::ChannelOpened => {
                    let Some(channel) = core.current.clone() else {
                        return Err(BinderError::Fatal {
                            reason: "no current channel in the opened state".to_string(),
                        });
                    };
                    core.count += 1;
                    self.metrics.add_acquisitions(1);
                    return Ok(Admission::Ready(channel));
                }
                _ => {}
            }

            let state = core.state;
            if !core.tolerate_faults
                && matches!(state, SynchronizerState::NoChannel | SynchronizerState::ChannelClosing)
            {
                if !can_cause_fault {
                    return Ok(Admission::NoChannel);
                }
                fault_binder = true;
            } else if !can_get_channel
                || matches!(state, SynchronizerState::ChannelOpening | SynchronizerState::ChannelClosing)
            {
                let waiter = make_waiter();
                let queued: Arc<dyn Waiter<C>> = waiter.clone();
                if can_get_channel {
                    core.leaders.push_back(queued);
                } else {
                    core.followers.push_back(queued);
                }
                return Ok(Admission::Queued(waiter));
            } else {
                let existing = core.current_if_created();
                if existing.is_none() {
                    core.unsubscribe();
                    core.current = None;
                }
                core.state = SynchronizerState::ChannelOpening;
                debug!(binder = %self.binder_id, reuse = existing.is_some(), "leading channel open");
                return Ok(Admission::Lead(existing));
            }
        }

        if fault_binder {
            warn!(binder = %self.binder_id, "no channel and faults are not tolerated, faulting binder");
            if let Some(host) = self.host() {
                host.fault();
            }
        }
        Ok(Admission::NoChannel)
    }

    /// Makes `channel` the current instance while a leader is opening.
    /// Returns `None` (after aborting the channel) once the synchronizer is
    /// terminal.
    pub(crate) fn install_channel(&self, channel: Arc<C>) -> Option<Arc<C>> {
        {
            let mut core = self.core();
            if core.is_active() {
                core.unsubscribe();
                core.current = Some(Arc::clone(&channel));
                return Some(channel);
            }
        }
        debug!(binder = %self.binder_id, "synchronizer stopped while leading, aborting new channel");
        channel.abort();
        None
    }

    /// Leader success: every queued waiter shares the channel.
    ///
    /// Returns the channel for the leader, or the terminal resolution when
    /// the synchronizer stopped during the open.
    pub(crate) fn on_channel_opened(&self) -> Result<std::result::Result<Arc<C>, Resolution<C>>> {
        let (channel, leaders, followers) = {
            let mut core = self.core();
            if !core.is_active() {
                let resolution = if core.state == SynchronizerState::Closed {
                    Resolution::Closed
                } else {
                    Resolution::Faulted
                };
                return Ok(Err(resolution));
            }
            if core.state != SynchronizerState::ChannelOpening {
                return Err(BinderError::invalid_state("ChannelSynchronizer", core.state));
            }
            let Some(channel) = core.current.clone() else {
                return Err(BinderError::Fatal {
                    reason: "channel opened without a current channel".to_string(),
                });
            };
            core.state = SynchronizerState::ChannelOpened;
            self.arm_current(&mut core);
            let leaders = std::mem::take(&mut core.leaders);
            let followers = std::mem::take(&mut core.followers);
            let granted = 1 + leaders.len() + followers.len();
            core.count += granted;
            self.metrics.add_acquisitions(granted as u64);
            (channel, leaders, followers)
        };

        self.metrics.inc_channels_opened();
        info!(
            binder = %self.binder_id,
            waiters = leaders.len() + followers.len(),
            "channel opened"
        );
        for waiter in leaders.into_iter().chain(followers) {
            if let Err(rejected) = waiter.resolve(Resolution::Channel(Arc::clone(&channel))) {
                self.reject(rejected);
            }
        }
        // A fault that fired before the subscription was armed.
        if channel.state() == CommunicationState::Faulted {
            self.on_channel_faulted(&channel);
        }
        Ok(Ok(channel))
    }

    /// Leader failure: hand the attempt to the oldest queued leader, or go
    /// back to `NoChannel`.
    pub(crate) fn on_get_channel_failed(&self) {
        loop {
            let next = {
                let mut core = self.core();
                if !core.is_active() {
                    return;
                }
                if core.state != SynchronizerState::ChannelOpening {
                    warn!(binder = %self.binder_id, state = ?core.state, "open failure reported outside ChannelOpening");
                    return;
                }
                if core.current_if_created().is_none() {
                    core.unsubscribe();
                    core.current = None;
                }
                match core.leaders.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        core.state = SynchronizerState::NoChannel;
                        debug!(binder = %self.binder_id, "channel open failed, no queued leader");
                        return;
                    }
                }
            };
            if next.resolve(Resolution::Lead).is_ok() {
                debug!(binder = %self.binder_id, "channel open failed, promoted next leader");
                return;
            }
        }
    }

    /// Undoes a resolution that its waiter can no longer take.
    pub(crate) fn reject(&self, resolution: Resolution<C>) {
        match resolution {
            Resolution::Channel(_) => {
                self.return_channel(true);
            }
            Resolution::Lead => self.on_get_channel_failed(),
            Resolution::Faulted | Resolution::Closed => {}
        }
    }

    /// Removes a queued waiter. `false` means it was already dequeued and a
    /// resolution is on its way.
    pub(crate) fn remove_waiter(&self, id: u64, can_get_channel: bool) -> bool {
        let mut core = self.core();
        if !core.is_active() {
            return false;
        }
        let queue = if can_get_channel {
            &mut core.leaders
        } else {
            &mut core.followers
        };
        match queue.iter().position(|waiter| waiter.id() == id) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Releases one acquisition. Returns the `aborting` flag as it was before
    /// the release.
    pub(crate) fn return_channel(&self, suspending: bool) -> bool {
        let mut fault_binder = false;
        let mut retired = None;
        let mut promoted = None;
        let mut raise_lost = false;
        let drained;
        let aborting;

        {
            let mut core = self.core();
            aborting = core.aborting;
            if core.count == 0 {
                warn!(binder = %self.binder_id, "channel released without an acquisition");
                return aborting;
            }
            core.count -= 1;
            drained = if core.count == 0 { core.drain.take() } else { None };

            if core.is_active() {
                let faulted = core
                    .current
                    .as_ref()
                    .is_some_and(|channel| channel.state() == CommunicationState::Faulted);
                if faulted {
                    fault_binder = !core.tolerate_faults;
                    core.inner_channel_faulted = true;
                    core.state = SynchronizerState::ChannelClosing;
                }

                if !fault_binder && core.state == SynchronizerState::ChannelClosing && core.count == 0 {
                    core.unsubscribe();
                    retired = core.current.take();
                    raise_lost = core.inner_channel_faulted;
                    core.inner_channel_faulted = false;
                    core.state = SynchronizerState::NoChannel;
                    core.aborting = false;
                    if let Some(waiter) = core.leaders.pop_front() {
                        core.state = SynchronizerState::ChannelOpening;
                        promoted = Some(waiter);
                    }
                }
            }
        }

        self.metrics.inc_releases();
        if fault_binder {
            warn!(binder = %self.binder_id, "released channel faulted and faults are not tolerated");
            if let Some(host) = self.host() {
                host.fault();
            }
        }
        if let Some(signal) = drained {
            signal.set();
        }
        if let Some(waiter) = promoted {
            if waiter.resolve(Resolution::Lead).is_err() {
                self.on_get_channel_failed();
            }
        }
        if raise_lost {
            self.raise_connection_lost();
        }
        if let Some(channel) = retired {
            self.retire(channel, suspending);
        }
        aborting
    }

    fn raise_connection_lost(&self) {
        self.metrics.inc_tolerated_faults();
        info!(binder = %self.binder_id, "connection lost, channel will be replaced");
        if let Some(host) = self.host() {
            host.connection_lost();
        }
    }

    /// Closes a healthy retired channel in the background, aborts anything
    /// else. The releasing operation never waits for the close.
    fn retire(&self, channel: Arc<C>, suspending: bool) {
        self.metrics.inc_channels_retired();
        if !self.settings.must_close_channel {
            debug!(binder = %self.binder_id, "retired channel is owned elsewhere, leaving it");
            return;
        }
        if channel.state() != CommunicationState::Opened {
            debug!(binder = %self.binder_id, state = ?channel.state(), "aborting retired channel");
            channel.abort();
            return;
        }

        let timeout = self.settings.close_timeout;
        let host = self.host.clone();
        debug!(binder = %self.binder_id, suspending, "closing retired channel");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if suspending => {
                handle.spawn(async move {
                    if let Err(e) = channel.close_async(timeout).await {
                        close_failed(&*channel, &host, e);
                    }
                });
            }
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    if let Err(e) = channel.close(timeout) {
                        close_failed(&*channel, &host, e);
                    }
                });
            }
            Err(_) => {
                let fallback = Arc::clone(&channel);
                let spawned = std::thread::Builder::new()
                    .name("tether-close".to_string())
                    .spawn(move || {
                        if let Err(e) = channel.close(timeout) {
                            close_failed(&*channel, &host, e);
                        }
                    });
                if let Err(e) = spawned {
                    warn!(binder = %self.binder_id, error = %e, "could not spawn close, aborting channel");
                    fallback.abort();
                }
            }
        }
    }

    /// Reaction to the current channel's fault notification.
    pub(crate) fn on_channel_faulted(&self, channel: &Arc<C>) {
        let mut fault_binder = false;
        let mut raise_lost = false;
        {
            let mut core = self.core();
            let is_current = core
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, channel));
            if !is_current || !core.is_active() {
                return;
            }
            if core.state == SynchronizerState::ChannelOpened {
                if core.count == 0 {
                    core.unsubscribe();
                }
                fault_binder = !core.tolerate_faults;
                core.state = SynchronizerState::ChannelClosing;
                core.inner_channel_faulted = true;

                if !fault_binder && core.count == 0 {
                    core.state = SynchronizerState::NoChannel;
                    core.aborting = false;
                    core.inner_channel_faulted = false;
                    core.current = None;
                    raise_lost = true;
                }
            }
        }

        debug!(binder = %self.binder_id, fault_binder, "channel faulted");
        if fault_binder {
            if let Some(host) = self.host() {
                host.fault();
            }
        }
        channel.abort();
        if raise_lost {
            self.metrics.inc_channels_retired();
            self.raise_connection_lost();
        }
    }

    /// The reader saw end of stream: retire the channel once it drains.
    pub fn on_read_eof(&self) {
        let mut core = self.core();
        if core.count == 0 {
            warn!(binder = %self.binder_id, "read eof reported without an acquisition");
            return;
        }
        if !core.is_active() {
            return;
        }
        let healthy = core
            .current
            .as_ref()
            .is_some_and(|channel| channel.state() != CommunicationState::Faulted);
        if healthy {
            core.state = SynchronizerState::ChannelClosing;
        }
    }

    /// Binder open: `Created -> NoChannel`, fetch a channel without waiting
    /// if none was supplied, and treat it as ready when channels arrive
    /// already open.
    pub(crate) fn start_synchronizing(&self) -> Result<()> {
        let needs_channel = match self.begin_start()? {
            Some(needs_channel) => needs_channel,
            None => return Ok(()),
        };
        let fetched = if needs_channel {
            self.source.try_get_channel(Duration::ZERO)?
        } else {
            None
        };
        self.finish_start(fetched);
        Ok(())
    }

    /// Suspending form of [`ChannelSynchronizer::start_synchronizing`].
    pub(crate) async fn start_synchronizing_async(&self) -> Result<()> {
        let needs_channel = match self.begin_start()? {
            Some(needs_channel) => needs_channel,
            None => return Ok(()),
        };
        let fetched = if needs_channel {
            self.source.try_get_channel_async(Duration::ZERO).await?
        } else {
            None
        };
        self.finish_start(fetched);
        Ok(())
    }

    fn begin_start(&self) -> Result<Option<bool>> {
        let mut core = self.core();
        match core.state {
            SynchronizerState::Created => {
                core.state = SynchronizerState::NoChannel;
                Ok(Some(core.current.is_none()))
            }
            // Abort raced with open.
            SynchronizerState::Closed => Ok(None),
            state => Err(BinderError::invalid_state("ChannelSynchronizer", state)),
        }
    }

    fn finish_start(&self, fetched: Option<Arc<C>>) {
        let mut stray = None;
        {
            let mut core = self.core();
            if let Some(channel) = fetched {
                if core.state == SynchronizerState::NoChannel && core.current.is_none() {
                    core.current = Some(channel);
                } else {
                    stray = Some(channel);
                }
            }
            if core.state == SynchronizerState::NoChannel
                && core.current.is_some()
                && !self.settings.must_open_channel
            {
                core.state = SynchronizerState::ChannelOpened;
                self.arm_current(&mut core);
                self.metrics.inc_channels_opened();
            }
        }
        if let Some(channel) = stray {
            channel.abort();
        }
        if let Some(channel) = self.current_channel() {
            if channel.state() == CommunicationState::Faulted {
                self.on_channel_faulted(&channel);
            }
        }
    }

    /// Moves to `Closed` (`close`) or `Faulted` and stops watching the
    /// current channel, which is returned to the caller. Once stopped the
    /// channel is still returned, so an abort that follows a close reaches
    /// the instance the close is draining.
    pub(crate) fn stop_synchronizing(&self, close: bool) -> Option<Arc<C>> {
        let mut core = self.core();
        if core.is_active() {
            core.state = if close {
                SynchronizerState::Closed
            } else {
                SynchronizerState::Faulted
            };
            core.unsubscribe();
            debug!(binder = %self.binder_id, state = ?core.state, "synchronizer stopped");
        }
        core.current.clone()
    }

    /// Resolves every queued waiter with the terminal outcome.
    pub(crate) fn unblock_waiters(&self) {
        let (leaders, followers, close) = {
            let mut core = self.core();
            (
                std::mem::take(&mut core.leaders),
                std::mem::take(&mut core.followers),
                core.state == SynchronizerState::Closed,
            )
        };
        for waiter in leaders.into_iter().chain(followers) {
            let resolution = if close {
                Resolution::Closed
            } else {
                Resolution::Faulted
            };
            // Terminal resolutions need no undo.
            let _ = waiter.resolve(resolution);
        }
    }

    /// Installs a channel accepted by a server. Only valid in `NoChannel` or
    /// `ChannelOpening` on a fault tolerant binder. Returns `false` once the
    /// synchronizer is terminal.
    pub fn set_channel(&self, channel: Arc<C>) -> Result<bool> {
        let mut core = self.core();
        if core.is_active()
            && !matches!(
                core.state,
                SynchronizerState::NoChannel | SynchronizerState::ChannelOpening
            )
        {
            return Err(BinderError::invalid_state("ChannelSynchronizer", core.state));
        }
        if !core.tolerate_faults {
            return Err(BinderError::InvalidState {
                object: "ChannelSynchronizer",
                state: "not tolerating faults".to_string(),
            });
        }
        if !core.is_active() {
            return Ok(false);
        }
        core.unsubscribe();
        core.current = Some(channel);
        Ok(true)
    }

    /// Aborts the current channel on behalf of a server that lost its peer.
    ///
    /// An idle channel is retired at once; a busy one is marked `aborting`
    /// and retired when its last holder releases it.
    pub fn abort_current_channel(&self) -> Result<()> {
        let channel = {
            let mut core = self.core();
            if !core.tolerate_faults {
                return Err(BinderError::InvalidState {
                    object: "ChannelSynchronizer",
                    state: "not tolerating faults".to_string(),
                });
            }
            match core.state {
                SynchronizerState::ChannelOpening => {
                    core.aborting = true;
                    core.current.clone()
                }
                SynchronizerState::ChannelOpened if core.count == 0 => {
                    core.unsubscribe();
                    core.state = SynchronizerState::NoChannel;
                    core.current.take()
                }
                SynchronizerState::ChannelOpened => {
                    core.aborting = true;
                    core.state = SynchronizerState::ChannelClosing;
                    core.current.clone()
                }
                _ => None,
            }
        };
        if let Some(channel) = channel {
            info!(binder = %self.binder_id, "aborting current channel");
            channel.abort();
        }
        Ok(())
    }

    /// Client negotiation helper: make sure a channel exists without waiting.
    ///
    /// Returns `true` when a channel is opened or ready to be opened by the
    /// next acquisition.
    pub fn ensure_channel(&self) -> Result<bool> {
        {
            let core = self.core();
            match core.state {
                SynchronizerState::Closed | SynchronizerState::Faulted => return Ok(false),
                SynchronizerState::ChannelOpened => return Ok(true),
                SynchronizerState::NoChannel => {}
                state => return Err(BinderError::invalid_state("ChannelSynchronizer", state)),
            }
            if core.tolerate_faults && core.current_if_created().is_some() {
                return Ok(true);
            }
            if !core.tolerate_faults {
                drop(core);
                warn!(binder = %self.binder_id, "ensure_channel without a channel, faulting binder");
                if let Some(host) = self.host() {
                    host.fault();
                }
                return Ok(false);
            }
        }

        let Some(channel) = self.source.try_get_channel(Duration::ZERO)? else {
            return Ok(false);
        };
        let mut core = self.core();
        if core.state == SynchronizerState::NoChannel && core.current_if_created().is_none() {
            core.unsubscribe();
            core.current = Some(channel);
            return Ok(true);
        }
        let usable = core.state == SynchronizerState::ChannelOpened || core.current_if_created().is_some();
        drop(core);
        channel.abort();
        Ok(usable)
    }

    /// Registers interest in the count reaching zero. `None` when nothing is
    /// in flight.
    pub(crate) fn drain_signal(&self) -> Option<Arc<DrainSignal>> {
        let mut core = self.core();
        if core.count == 0 {
            return None;
        }
        Some(Arc::clone(core.drain.get_or_insert_with(|| Arc::new(DrainSignal::new()))))
    }

    /// Blocks until every outstanding acquisition is released or the
    /// deadline expires. Returns `false` on expiry.
    pub fn wait_for_pending_operations(&self, timeout: Duration) -> bool {
        match self.drain_signal() {
            Some(signal) => signal.wait(Deadline::new(timeout)),
            None => true,
        }
    }

    /// Suspending form of [`ChannelSynchronizer::wait_for_pending_operations`].
    pub async fn wait_for_pending_operations_async(&self, timeout: Duration) -> bool {
        match self.drain_signal() {
            Some(signal) => signal.wait_async(Deadline::new(timeout)).await,
            None => true,
        }
    }
}

impl<C: Channel> std::fmt::Debug for ChannelSynchronizer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core();
        f.debug_struct("ChannelSynchronizer")
            .field("binder", &self.binder_id)
            .field("state", &core.state)
            .field("count", &core.count)
            .field("aborting", &core.aborting)
            .field("tolerate_faults", &core.tolerate_faults)
            .field("leaders", &core.leaders.len())
            .field("followers", &core.followers.len())
            .finish()
    }
}

/// A background close failed: tear the channel down and report the error.
fn close_failed<C: Channel>(channel: &C, host: &Weak<dyn SynchronizerHost<C>>, error: BinderError) {
    channel.abort();
    if let Some(host) = host.upgrade() {
        host.report_exception(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, Harness};
    use proptest::prelude::*;
    use std::thread;
    use std::time::Instant;

    fn deadline() -> Deadline {
        Deadline::new(Duration::from_secs(5))
    }

    fn lease(sync: &ChannelSynchronizer<crate::testing::TestChannel>) -> ChannelLease<'_, crate::testing::TestChannel> {
        match sync.acquire(true, true, deadline(), MaskingMode::NONE) {
            Ok(Acquired::Channel(lease)) => lease,
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_start_moves_to_no_channel_with_created_channel() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let sync = harness.sync();
        assert_eq!(sync.state(), SynchronizerState::NoChannel);
        assert_eq!(harness.source.created(), 1);
        assert!(sync.ensure_channel().unwrap());
        assert_eq!(harness.source.created(), 1);
        assert!(!sync.connected());
    }

    #[test]
    fn test_start_without_open_is_immediately_opened() {
        let harness = Harness::new(TolerateFaultsMode::Always, false);
        assert_eq!(harness.sync().state(), SynchronizerState::ChannelOpened);
        assert!(harness.sync().connected());
    }

    #[test]
    fn test_tolerated_fault_with_holders_retires_after_last_release() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let sync = harness.sync();
        let leases: Vec<_> = (0..3).map(|_| lease(sync)).collect();
        assert_eq!(sync.active_count(), 3);

        harness.source.channel(0).fault();
        assert_eq!(sync.state(), SynchronizerState::ChannelClosing);
        assert_eq!(harness.lost.load(Ordering::SeqCst), 0);

        let mut leases = leases.into_iter();
        for held in leases.by_ref().take(2) {
            held.release();
        }
        assert_eq!(sync.state(), SynchronizerState::ChannelClosing);
        drop(leases);

        assert_eq!(sync.state(), SynchronizerState::NoChannel);
        assert_eq!(sync.active_count(), 0);
        assert_eq!(harness.lost.load(Ordering::SeqCst), 1);
        assert_eq!(harness.faults.load(Ordering::SeqCst), 0);
        assert!(sync.current_channel().is_none());

        let replacement = lease(sync);
        assert!(!Arc::ptr_eq(replacement.channel(), &harness.source.channel(0)));
        assert_eq!(harness.source.total_opens(), 2);
    }

    #[test]
    fn test_idle_tolerated_fault_resets_immediately() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let sync = harness.sync();
        drop(lease(sync));
        harness.source.channel(0).fault();
        assert_eq!(sync.state(), SynchronizerState::NoChannel);
        assert_eq!(harness.lost.load(Ordering::SeqCst), 1);
        assert_eq!(sync.metrics().snapshot().tolerated_faults, 1);
    }

    #[test]
    fn test_untolerated_fault_faults_binder() {
        let harness = Harness::new(TolerateFaultsMode::Never, true);
        let sync = harness.sync();
        let held = lease(sync);
        assert!(!sync.tolerate_faults());
        harness.source.channel(0).fault();
        assert_eq!(harness.faults.load(Ordering::SeqCst), 1);
        assert_eq!(sync.state(), SynchronizerState::Faulted);
        drop(held);

        let refused = sync.acquire(true, true, deadline(), MaskingMode::NONE);
        assert!(matches!(refused, Err(BinderError::Faulted)));
        let masked = sync.acquire(true, true, deadline(), MaskingMode::ALL).unwrap();
        assert!(matches!(masked, Acquired::NoChannel));
    }

    #[test]
    fn test_untolerated_missing_channel_faults_output_only() {
        let harness = Harness::new(TolerateFaultsMode::Never, true);
        let sync = harness.sync();
        drop(lease(sync));
        retire_via_eof(sync);
        assert_eq!(sync.state(), SynchronizerState::NoChannel);

        let input = sync.acquire(true, false, deadline(), MaskingMode::ALL).unwrap();
        assert!(matches!(input, Acquired::NoChannel));
        assert_eq!(harness.faults.load(Ordering::SeqCst), 0);

        let output = sync.acquire(true, true, deadline(), MaskingMode::NONE).unwrap();
        assert!(matches!(output, Acquired::NoChannel));
        assert_eq!(harness.faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_eof_closes_healthy_channel_on_release() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let sync = harness.sync();
        let held = lease(sync);
        sync.on_read_eof();
        assert_eq!(sync.state(), SynchronizerState::ChannelClosing);
        held.release();
        assert_eq!(sync.state(), SynchronizerState::NoChannel);
        assert!(eventually(Duration::from_secs(2), || {
            harness.source.stats.closes.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(harness.source.stats.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(harness.lost.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_release_hands_over_before_slow_close_finishes() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        harness.source.set_close_delay(Duration::from_millis(800));
        let held = lease(harness.sync());
        harness.sync().on_read_eof();

        let next = {
            let harness = Arc::clone(&harness);
            thread::spawn(move || {
                let replacement = lease(harness.sync());
                let fresh = !Arc::ptr_eq(replacement.channel(), &harness.source.channel(0));
                (fresh, Instant::now())
            })
        };
        while harness.sync().queued_waiters().0 == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let released_at = Instant::now();
        held.release();
        assert!(released_at.elapsed() < Duration::from_millis(400));

        let (fresh, acquired_at) = next.join().unwrap();
        assert!(fresh);
        assert!(acquired_at.duration_since(released_at) < Duration::from_millis(400));
        assert_eq!(harness.source.stats.closes.load(Ordering::SeqCst), 0);
        assert!(eventually(Duration::from_secs(3), || {
            harness.source.stats.closes.load(Ordering::SeqCst) == 1
        }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_suspending_release_hands_over_before_slow_close_finishes() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        harness.source.set_close_delay(Duration::from_millis(800));
        let held = match harness
            .sync()
            .acquire_async(true, true, deadline(), MaskingMode::NONE)
            .await
        {
            Ok(Acquired::Channel(lease)) => lease,
            other => panic!("unexpected {:?}", other.map(|_| ())),
        };
        harness.sync().on_read_eof();

        let next = {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move {
                let acquired = harness
                    .sync()
                    .acquire_async(true, true, deadline(), MaskingMode::NONE)
                    .await;
                (matches!(acquired, Ok(Acquired::Channel(_))), Instant::now())
            })
        };
        while harness.sync().queued_waiters().0 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let released_at = Instant::now();
        held.release();
        assert!(released_at.elapsed() < Duration::from_millis(400));

        let (granted, acquired_at) = next.await.unwrap();
        assert!(granted);
        assert!(acquired_at.duration_since(released_at) < Duration::from_millis(400));
        let closes = || harness.source.stats.closes.load(Ordering::SeqCst);
        for _ in 0..300 {
            if closes() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(closes(), 1);
        assert_eq!(harness.source.stats.aborts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retired_channel_left_alone_when_not_owned() {
        let harness = Harness::not_owning(TolerateFaultsMode::Always);
        let sync = harness.sync();
        retire_via_eof(sync);
        assert_eq!(sync.state(), SynchronizerState::NoChannel);
        assert_eq!(sync.metrics().snapshot().channels_retired, 1);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(harness.source.channel(0).state(), CommunicationState::Opened);
        assert_eq!(harness.source.stats.closes.load(Ordering::SeqCst), 0);
        assert_eq!(harness.source.stats.aborts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_release_without_acquire_keeps_count_at_zero() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let sync = harness.sync();
        sync.return_channel(false);
        assert_eq!(sync.active_count(), 0);
    }

    #[test]
    fn test_drain_waits_for_last_release() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let sync = harness.sync();
        assert!(sync.wait_for_pending_operations(Duration::ZERO));

        let first = lease(sync);
        let second = lease(sync);
        let waiter = {
            let harness = Arc::clone(&harness);
            thread::spawn(move || harness.sync().wait_for_pending_operations(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        first.release();
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        second.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_drain_times_out_while_held() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let sync = harness.sync();
        let _held = lease(sync);
        assert!(!sync.wait_for_pending_operations(Duration::from_millis(20)));
    }

    #[test]
    fn test_abort_current_channel_idle_and_busy() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let sync = harness.sync();
        drop(lease(sync));
        sync.abort_current_channel().unwrap();
        assert_eq!(sync.state(), SynchronizerState::NoChannel);
        assert_eq!(harness.source.channel(0).state(), CommunicationState::Closed);

        let held = lease(sync);
        sync.abort_current_channel().unwrap();
        assert!(sync.aborting());
        assert_eq!(sync.state(), SynchronizerState::ChannelClosing);
        assert!(held.release());
        assert!(!sync.aborting());
        assert_eq!(sync.state(), SynchronizerState::NoChannel);
    }

    #[test]
    fn test_set_channel_rejected_while_opened() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let sync = harness.sync();
        drop(lease(sync));
        let extra = Arc::new(crate::testing::TestChannel::new(Arc::clone(&harness.source.stats)));
        assert!(sync.set_channel(extra).is_err());
    }

    #[test]
    fn test_stop_unblocks_queued_waiters_with_closed() {
        let harness = Harness::new(TolerateFaultsMode::Always, true);
        let follower = {
            let harness = Arc::clone(&harness);
            thread::spawn(move || {
                harness
                    .sync()
                    .acquire(false, false, Deadline::infinite(), MaskingMode::NONE)
                    .map(|_| ())
            })
        };
        while harness.sync().queued_waiters().1 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(harness.sync().stop_synchronizing(true).is_some());
        harness.sync().unblock_waiters();
        assert!(matches!(follower.join().unwrap(), Err(BinderError::Closed)));
    }

    /// Retires the idle current channel the way a read of end of stream does.
    fn retire_via_eof(sync: &ChannelSynchronizer<crate::testing::TestChannel>) {
        let held = lease(sync);
        sync.on_read_eof();
        held.release();
    }

    proptest! {
        #[test]
        fn prop_count_tracks_acquires_minus_releases(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
            let harness = Harness::new(TolerateFaultsMode::Always, true);
            let sync = harness.sync();
            let mut held = Vec::new();
            for acquire in ops {
                if acquire {
                    held.push(lease(sync));
                } else if let Some(lease) = held.pop() {
                    lease.release();
                }
                prop_assert_eq!(sync.active_count(), held.len());
            }
            drop(held);
            prop_assert_eq!(sync.active_count(), 0);
            let snap = sync.metrics().snapshot();
            prop_assert_eq!(snap.acquisitions, snap.releases);
        }
    }
}
