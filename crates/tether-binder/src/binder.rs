//! The reliable binder: the public face of a shared channel.
//!
//! A [`ReliableBinder`] owns one [`ChannelSynchronizer`] and layers the
//! binder lifecycle (`Created -> Opening -> Opened -> Closing -> Closed`, with
//! `Faulted` as the other terminal state), per-call exception masking and the
//! lifecycle events on top of it. Messaging operations acquire the shared
//! channel, run the transport call, and always release the channel again
//! before masking is applied to whatever went wrong.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelSource, CommunicationState, Inbound, Receive};
use crate::config::{BinderConfig, CloseShape};
use crate::context::BinderRequestContext;
use crate::deadline::Deadline;
use crate::error::{BinderError, ErrorClass, Result};
use crate::events::{BinderEvent, EventBus};
use crate::lock;
use crate::masking::MaskingMode;
use crate::metrics::{BinderMetrics, MetricsSnapshot};
use crate::session;
use crate::synchronizer::{
    Acquired, ChannelSynchronizer, SynchronizerHost, SynchronizerSettings,
};

/// State shared by every clone of a binder. Also the synchronizer's host.
struct Shared<C: Channel> {
    id: Uuid,
    state: Mutex<CommunicationState>,
    aborted: AtomicBool,
    config: BinderConfig,
    synchronizer: ChannelSynchronizer<C>,
    events: EventBus,
    metrics: Arc<BinderMetrics>,
}

impl<C: Channel> Shared<C> {
    fn state(&self) -> CommunicationState {
        *lock(&self.state)
    }

    /// The error for a binder in a terminal state, or `None` when `mask`
    /// hides it.
    fn terminal_error(&self, state: CommunicationState, mask: MaskingMode) -> Option<BinderError> {
        if state == CommunicationState::Faulted {
            self.faulted_error(mask)
        } else {
            self.closed_error(mask)
        }
    }

    fn raise_exception(&self, error: BinderError) {
        self.events.publish(BinderEvent::Exception(Arc::new(error)));
    }

    /// Applies masking to `error`. `Ok(())` means the error was swallowed (and
    /// possibly rerouted to the exception event).
    fn handle(&self, error: BinderError, mask: MaskingMode, auto_aborted: bool) -> Result<()> {
        let tolerated = self.synchronizer.tolerate_faults()
            && (matches!(error, BinderError::Faulted)
                || (auto_aborted && matches!(error, BinderError::Aborted)));

        let (masked, raise) = if tolerated {
            (true, false)
        } else {
            match error.class() {
                ErrorClass::Handleable => (mask.masks_handled(), false),
                ErrorClass::Unhandled => (mask.masks_unhandled(), mask.masks_unhandled()),
                ErrorClass::Fatal => (false, false),
            }
        };

        if !masked {
            return Err(error);
        }
        self.metrics.inc_masked_exceptions();
        debug!(binder = %self.id, error = %error, raise, "exception masked");
        if raise {
            self.raise_exception(error);
        }
        Ok(())
    }
}

impl<C: Channel> SynchronizerHost<C> for Shared<C> {
    fn synchronizer(&self) -> &ChannelSynchronizer<C> {
        &self.synchronizer
    }

    fn fault(&self) {
        {
            let mut state = lock(&self.state);
            match *state {
                CommunicationState::Created => {
                    warn!(binder = %self.id, "fault reported before the binder was opened");
                    return;
                }
                CommunicationState::Faulted | CommunicationState::Closed => return,
                _ => {}
            }
            *state = CommunicationState::Faulted;
            self.synchronizer.stop_synchronizing(false);
        }

        self.synchronizer.unblock_waiters();
        self.metrics.inc_binder_faults();
        warn!(binder = %self.id, "binder faulted");
        self.events.publish(BinderEvent::Faulted);
    }

    fn connection_lost(&self) {
        self.events.publish(BinderEvent::ConnectionLost);
    }

    fn closed_error(&self, mask: MaskingMode) -> Option<BinderError> {
        if mask.masks_handled() {
            None
        } else if self.aborted.load(Ordering::SeqCst) {
            Some(BinderError::Aborted)
        } else {
            Some(BinderError::Closed)
        }
    }

    fn faulted_error(&self, mask: MaskingMode) -> Option<BinderError> {
        (!mask.masks_handled()).then_some(BinderError::Faulted)
    }

    fn report_exception(&self, error: BinderError) {
        if let Err(error) = self.handle(error, MaskingMode::ALL, false) {
            error!(binder = %self.id, error = %error, "background channel close failed");
            self.raise_exception(error);
        }
    }
}

enum CloseStep<C> {
    /// Nothing left to do: already closing, or the close became an abort.
    Done,
    /// Continue the close, shutting this channel down when present.
    Proceed(Option<Arc<C>>),
}

/// Many concurrent operations over one lazily created, transparently
/// replaced channel.
///
/// Cloning is cheap; every clone drives the same binder.
pub struct ReliableBinder<C: Channel> {
    shared: Arc<Shared<C>>,
}

impl<C: Channel> Clone for ReliableBinder<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Channel> std::fmt::Debug for ReliableBinder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableBinder")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .field("synchronizer", &self.shared.synchronizer)
            .finish_non_exhaustive()
    }
}

impl<C: Channel> ReliableBinder<C> {
    /// Creates a binder that obtains its channels from `source`.
    pub fn new(source: Arc<dyn ChannelSource<C>>, config: BinderConfig) -> Result<Self> {
        Self::build(None, source, config)
    }

    /// Creates a binder around an existing channel. Replacements, if any, come
    /// from `source`.
    pub fn with_channel(
        channel: Arc<C>,
        source: Arc<dyn ChannelSource<C>>,
        config: BinderConfig,
    ) -> Result<Self> {
        Self::build(Some(channel), source, config)
    }

    fn build(
        channel: Option<Arc<C>>,
        source: Arc<dyn ChannelSource<C>>,
        config: BinderConfig,
    ) -> Result<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        let metrics = Arc::new(BinderMetrics::new());
        let settings = SynchronizerSettings {
            fault_mode: config.tolerate_faults,
            must_open_channel: config.must_open_channel,
            must_close_channel: config.must_close_channel,
            close_timeout: config.close_timeout(),
        };

        let shared = Arc::new_cyclic(|weak: &Weak<Shared<C>>| {
            let host: Weak<dyn SynchronizerHost<C>> = weak.clone();
            Shared {
                id,
                state: Mutex::new(CommunicationState::Created),
                aborted: AtomicBool::new(false),
                synchronizer: ChannelSynchronizer::new(
                    channel,
                    source,
                    settings,
                    Arc::clone(&metrics),
                    host,
                    id,
                ),
                config,
                events: EventBus::new(),
                metrics,
            }
        });
        debug!(binder = %id, "binder created");
        Ok(Self { shared })
    }

    /// Unique id used in log records.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Configuration the binder was built with.
    pub fn config(&self) -> &BinderConfig {
        &self.shared.config
    }

    /// Masking applied by operations that do not pass their own mode.
    pub fn default_masking_mode(&self) -> MaskingMode {
        self.shared.config.masking_mode
    }

    /// Binder lifecycle state.
    pub fn state(&self) -> CommunicationState {
        self.shared.state()
    }

    /// The synchronizer that owns the shared channel.
    pub fn synchronizer(&self) -> &ChannelSynchronizer<C> {
        &self.shared.synchronizer
    }

    /// True while a channel is opening or opened.
    pub fn connected(&self) -> bool {
        self.synchronizer().connected()
    }

    /// Whether faults of the current channel instance are absorbed.
    pub fn tolerate_faults(&self) -> bool {
        self.synchronizer().tolerate_faults()
    }

    /// The channel instance operations currently share, if any.
    pub fn current_channel(&self) -> Option<Arc<C>> {
        self.synchronizer().current_channel()
    }

    /// Number of operations currently holding the channel.
    pub fn active_operations(&self) -> usize {
        self.synchronizer().active_count()
    }

    /// Subscribes to `Faulted`, `ConnectionLost` and `Exception` events.
    pub fn subscribe(&self) -> UnboundedReceiver<BinderEvent> {
        self.shared.events.subscribe()
    }

    /// Point-in-time copy of the binder counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Installs a channel accepted by a server. See
    /// [`ChannelSynchronizer::set_channel`].
    pub fn set_channel(&self, channel: Arc<C>) -> Result<bool> {
        self.synchronizer().set_channel(channel)
    }

    /// See [`ChannelSynchronizer::abort_current_channel`].
    pub fn abort_current_channel(&self) -> Result<()> {
        self.synchronizer().abort_current_channel()
    }

    /// See [`ChannelSynchronizer::ensure_channel`].
    pub fn ensure_channel(&self) -> Result<bool> {
        self.synchronizer().ensure_channel()
    }

    // ---- open ----

    /// Opens the binder. Channel creation is deferred to the first operation
    /// unless channels arrive already open.
    pub fn open(&self) -> Result<()> {
        if !self.on_opening()? {
            return Ok(());
        }
        if let Err(e) = self.synchronizer().start_synchronizing() {
            return self.on_open_failed(e);
        }
        self.on_opened();
        Ok(())
    }

    /// Suspending form of [`ReliableBinder::open`].
    pub async fn open_async(&self) -> Result<()> {
        if !self.on_opening()? {
            return Ok(());
        }
        if let Err(e) = self.synchronizer().start_synchronizing_async().await {
            return self.on_open_failed(e);
        }
        self.on_opened();
        Ok(())
    }

    fn on_opening(&self) -> Result<bool> {
        let mask = self.default_masking_mode();
        let mut state = lock(&self.shared.state);
        match *state {
            CommunicationState::Created => {
                *state = CommunicationState::Opening;
                Ok(true)
            }
            CommunicationState::Opening | CommunicationState::Opened => {
                if mask.masks_unhandled() {
                    Ok(false)
                } else {
                    Err(BinderError::invalid_state("ReliableBinder", *state))
                }
            }
            terminal => match self.shared.terminal_error(terminal, mask) {
                Some(e) => Err(e),
                None => Ok(false),
            },
        }
    }

    fn on_open_failed(&self, error: BinderError) -> Result<()> {
        warn!(binder = %self.id(), error = %error, "binder open failed");
        self.shared.fault();
        if self.default_masking_mode() == MaskingMode::NONE {
            return Err(error);
        }
        self.shared.raise_exception(error);
        Ok(())
    }

    fn on_opened(&self) {
        let mut state = lock(&self.shared.state);
        if *state == CommunicationState::Opening {
            *state = CommunicationState::Opened;
            info!(binder = %self.shared.id, "binder opened");
        }
    }

    // ---- close / abort ----

    /// Closes the binder with the default masking mode.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        self.close_masked(timeout, self.default_masking_mode())
    }

    /// Closes the binder. In-flight operations finish first; the current
    /// channel is then closed according to the configured [`CloseShape`].
    /// Failures abort the binder and are subject to `mask`.
    pub fn close_masked(&self, timeout: Duration, mask: MaskingMode) -> Result<()> {
        let deadline = Deadline::new(timeout);
        let channel = match self.close_core() {
            CloseStep::Done => return Ok(()),
            CloseStep::Proceed(channel) => channel,
        };
        let result = match channel {
            Some(channel) => self.close_channel(&channel, deadline),
            None => Ok(()),
        };
        self.finish_close(result, mask)
    }

    /// Closes the binder with the default masking mode.
    pub async fn close_async(&self, timeout: Duration) -> Result<()> {
        self.close_masked_async(timeout, self.default_masking_mode())
            .await
    }

    /// Suspending form of [`ReliableBinder::close_masked`].
    pub async fn close_masked_async(&self, timeout: Duration, mask: MaskingMode) -> Result<()> {
        let deadline = Deadline::new(timeout);
        let channel = match self.close_core() {
            CloseStep::Done => return Ok(()),
            CloseStep::Proceed(channel) => channel,
        };
        let result = match channel {
            Some(channel) => self.close_channel_async(&channel, deadline).await,
            None => Ok(()),
        };
        self.finish_close(result, mask)
    }

    fn close_core(&self) -> CloseStep<C> {
        let mut abort = true;
        let mut abort_channel = None;
        let mut channel = None;
        {
            let mut state = lock(&self.shared.state);
            match *state {
                CommunicationState::Closing | CommunicationState::Closed => return CloseStep::Done,
                CommunicationState::Opened => {
                    *state = CommunicationState::Closing;
                    abort = false;
                    let current = self
                        .synchronizer()
                        .stop_synchronizing(true)
                        .filter(|_| self.shared.config.must_close_channel);
                    if let Some(current) = current {
                        match current.state() {
                            CommunicationState::Created
                            | CommunicationState::Opening
                            | CommunicationState::Faulted => abort_channel = Some(current),
                            CommunicationState::Closing | CommunicationState::Closed => {}
                            CommunicationState::Opened => channel = Some(current),
                        }
                    }
                }
                _ => {}
            }
        }

        self.synchronizer().unblock_waiters();
        if abort {
            self.abort();
            return CloseStep::Done;
        }
        if let Some(stale) = abort_channel {
            debug!(binder = %self.id(), state = ?stale.state(), "aborting unusable channel on close");
            stale.abort();
        }
        CloseStep::Proceed(channel)
    }

    fn close_channel(&self, channel: &C, deadline: Deadline) -> Result<()> {
        match self.shared.config.close_shape {
            CloseShape::Plain => {
                if !self.wait_for_pending_operations(deadline.remaining()) {
                    return Err(deadline.timeout_error("close"));
                }
                channel.close(deadline.remaining())
            }
            CloseShape::DuplexSession => {
                session::close_duplex_session(self, channel, deadline.remaining())
            }
            CloseShape::ReplySession => {
                session::close_reply_session(self, channel, deadline.remaining())
            }
        }
    }

    async fn close_channel_async(&self, channel: &C, deadline: Deadline) -> Result<()> {
        match self.shared.config.close_shape {
            CloseShape::Plain => {
                if !self
                    .wait_for_pending_operations_async(deadline.remaining())
                    .await
                {
                    return Err(deadline.timeout_error("close"));
                }
                channel.close_async(deadline.remaining()).await
            }
            CloseShape::DuplexSession => {
                session::close_duplex_session_async(self, channel, deadline.remaining()).await
            }
            CloseShape::ReplySession => {
                session::close_reply_session_async(self, channel, deadline.remaining()).await
            }
        }
    }

    fn finish_close(&self, result: Result<()>, mask: MaskingMode) -> Result<()> {
        match result {
            Ok(()) => {
                self.transition_to_closed();
                info!(binder = %self.id(), "binder closed");
                Ok(())
            }
            Err(e) => {
                warn!(binder = %self.id(), error = %e, "close failed, aborting binder");
                self.abort();
                self.shared.handle(e, mask, false)
            }
        }
    }

    /// Tears the binder down at once: queued operations are released with
    /// the closed outcome and the current channel is aborted. Idempotent and
    /// never fails.
    pub fn abort(&self) {
        let channel = {
            let mut state = lock(&self.shared.state);
            self.shared.aborted.store(true, Ordering::SeqCst);
            if *state == CommunicationState::Closed {
                return;
            }
            *state = CommunicationState::Closing;
            self.synchronizer()
                .stop_synchronizing(true)
                .filter(|_| self.shared.config.must_close_channel)
        };

        self.synchronizer().unblock_waiters();
        if let Some(channel) = channel {
            channel.abort();
        }
        self.transition_to_closed();
        info!(binder = %self.id(), "binder aborted");
    }

    fn transition_to_closed(&self) {
        let mut state = lock(&self.shared.state);
        match *state {
            CommunicationState::Closing
            | CommunicationState::Closed
            | CommunicationState::Faulted => *state = CommunicationState::Closed,
            other => warn!(binder = %self.shared.id, state = ?other, "closed transition from a live state"),
        }
    }

    // ---- send ----

    /// Sends with the default masking mode.
    pub fn send(&self, message: &C::Message, timeout: Duration) -> Result<()> {
        self.send_masked(message, timeout, self.default_masking_mode())
    }

    /// Sends `message` over the shared channel, opening one if needed.
    ///
    /// A send that fails because a tolerated fault took the channel down is
    /// retried on the replacement channel while the deadline allows.
    pub fn send_masked(&self, message: &C::Message, timeout: Duration, mask: MaskingMode) -> Result<()> {
        if !self.validate_output(mask)? {
            return Ok(());
        }
        let deadline = Deadline::new(timeout);
        loop {
            let lease = match self.synchronizer().acquire(true, true, deadline, mask) {
                Ok(Acquired::Channel(lease)) => lease,
                Ok(Acquired::NoChannel) => return Ok(()),
                Ok(Acquired::TimedOut) => return Self::send_timed_out(deadline, mask),
                Err(e) => return self.shared.handle(e, mask, false),
            };
            let channel = Arc::clone(lease.channel());
            let result = channel.send(message, deadline.remaining());
            let auto_aborted = lease.release();
            match result {
                Ok(()) => return Ok(()),
                Err(e) if self.should_retry(&e, &channel, deadline) => {
                    debug!(binder = %self.id(), error = %e, "send failed on a faulted channel, retrying");
                }
                Err(e) => return self.shared.handle(e, mask, auto_aborted),
            }
        }
    }

    /// Sends with the default masking mode.
    pub async fn send_async(&self, message: &C::Message, timeout: Duration) -> Result<()> {
        self.send_masked_async(message, timeout, self.default_masking_mode())
            .await
    }

    /// Suspending form of [`ReliableBinder::send_masked`].
    pub async fn send_masked_async(
        &self,
        message: &C::Message,
        timeout: Duration,
        mask: MaskingMode,
    ) -> Result<()> {
        if !self.validate_output(mask)? {
            return Ok(());
        }
        let deadline = Deadline::new(timeout);
        loop {
            let lease = match self.synchronizer().acquire_async(true, true, deadline, mask).await {
                Ok(Acquired::Channel(lease)) => lease,
                Ok(Acquired::NoChannel) => return Ok(()),
                Ok(Acquired::TimedOut) => return Self::send_timed_out(deadline, mask),
                Err(e) => return self.shared.handle(e, mask, false),
            };
            let channel = Arc::clone(lease.channel());
            let result = channel.send_async(message, deadline.remaining()).await;
            let auto_aborted = lease.release();
            match result {
                Ok(()) => return Ok(()),
                Err(e) if self.should_retry(&e, &channel, deadline) => {
                    debug!(binder = %self.id(), error = %e, "send failed on a faulted channel, retrying");
                }
                Err(e) => return self.shared.handle(e, mask, auto_aborted),
            }
        }
    }

    fn send_timed_out(deadline: Deadline, mask: MaskingMode) -> Result<()> {
        if mask.masks_handled() {
            Ok(())
        } else {
            Err(deadline.timeout_error("send"))
        }
    }

    /// A handleable failure on a channel that is no longer open is retried
    /// when the binder absorbs channel faults.
    fn should_retry(&self, error: &BinderError, channel: &C, deadline: Deadline) -> bool {
        error.is_handleable()
            && self.tolerate_faults()
            && channel.state() != CommunicationState::Opened
            && self.state() == CommunicationState::Opened
            && !deadline.is_expired()
    }

    // ---- receive ----

    /// Receives with the default masking mode.
    pub fn try_receive(&self, timeout: Duration) -> Result<Receive<BinderRequestContext<C>>> {
        self.try_receive_masked(timeout, self.default_masking_mode())
    }

    /// Receives the next inbound message or request.
    ///
    /// `Eof` means no item will arrive: the binder is closing, closed or
    /// faulted, or it has no channel and is not allowed to create one. A
    /// channel that reaches end of stream is retired and the receive moves on
    /// to its replacement.
    pub fn try_receive_masked(
        &self,
        timeout: Duration,
        mask: MaskingMode,
    ) -> Result<Receive<BinderRequestContext<C>>> {
        if !self.validate_input()? {
            return Ok(Receive::Eof);
        }
        let deadline = Deadline::new(timeout);
        let can_get_channel = self.shared.config.can_get_channel_for_receive;
        loop {
            let acquired = self
                .synchronizer()
                .acquire(can_get_channel, false, deadline, MaskingMode::ALL);
            let lease = match acquired {
                Ok(Acquired::Channel(lease)) => lease,
                Ok(Acquired::NoChannel) => return Ok(Receive::Eof),
                Ok(Acquired::TimedOut) => return Ok(Receive::TimedOut),
                Err(e) => {
                    self.shared.handle(e, mask, false)?;
                    if deadline.is_expired() {
                        return Ok(Receive::TimedOut);
                    }
                    continue;
                }
            };
            let received = lease.try_receive(deadline.remaining());
            if matches!(received, Ok(Receive::Eof)) {
                self.synchronizer().on_read_eof();
            }
            let auto_aborted = lease.release();
            if let Some(done) = self.settle_receive(received, mask, auto_aborted)? {
                return Ok(done);
            }
            if deadline.is_expired() {
                return Ok(Receive::TimedOut);
            }
        }
    }

    /// Receives with the default masking mode.
    pub async fn try_receive_async(&self, timeout: Duration) -> Result<Receive<BinderRequestContext<C>>> {
        self.try_receive_masked_async(timeout, self.default_masking_mode())
            .await
    }

    /// Suspending form of [`ReliableBinder::try_receive_masked`].
    pub async fn try_receive_masked_async(
        &self,
        timeout: Duration,
        mask: MaskingMode,
    ) -> Result<Receive<BinderRequestContext<C>>> {
        if !self.validate_input()? {
            return Ok(Receive::Eof);
        }
        let deadline = Deadline::new(timeout);
        let can_get_channel = self.shared.config.can_get_channel_for_receive;
        loop {
            let acquired = self
                .synchronizer()
                .acquire_async(can_get_channel, false, deadline, MaskingMode::ALL)
                .await;
            let lease = match acquired {
                Ok(Acquired::Channel(lease)) => lease,
                Ok(Acquired::NoChannel) => return Ok(Receive::Eof),
                Ok(Acquired::TimedOut) => return Ok(Receive::TimedOut),
                Err(e) => {
                    self.shared.handle(e, mask, false)?;
                    if deadline.is_expired() {
                        return Ok(Receive::TimedOut);
                    }
                    continue;
                }
            };
            let received = lease.try_receive_async(deadline.remaining()).await;
            if matches!(received, Ok(Receive::Eof)) {
                self.synchronizer().on_read_eof();
            }
            let auto_aborted = lease.release();
            if let Some(done) = self.settle_receive(received, mask, auto_aborted)? {
                return Ok(done);
            }
            if deadline.is_expired() {
                return Ok(Receive::TimedOut);
            }
        }
    }

    /// `Some` finishes the receive; `None` loops for another channel.
    fn settle_receive(
        &self,
        received: Result<Receive<Inbound<C::Message, C::Request>>>,
        mask: MaskingMode,
        auto_aborted: bool,
    ) -> Result<Option<Receive<BinderRequestContext<C>>>> {
        match received {
            Ok(Receive::Item(inbound)) => Ok(Some(Receive::Item(self.wrap_inbound(inbound)))),
            Ok(Receive::TimedOut) => Ok(Some(Receive::TimedOut)),
            Ok(Receive::Eof) => {
                debug!(binder = %self.id(), "channel reached end of stream, retrying on a new channel");
                Ok(None)
            }
            Err(e) => {
                self.shared.handle(e, mask, auto_aborted)?;
                Ok(None)
            }
        }
    }

    fn wrap_inbound(&self, inbound: Inbound<C::Message, C::Request>) -> BinderRequestContext<C> {
        match inbound {
            Inbound::Message(message) => BinderRequestContext::from_message(self.clone(), message),
            Inbound::Request(request) => self.wrap_request_context(request),
        }
    }

    // ---- validation ----

    /// `Ok(true)` when the binder is open. Closed or faulted binders report
    /// their error unless `mask` hides it.
    fn validate_output(&self, mask: MaskingMode) -> Result<bool> {
        match self.state() {
            CommunicationState::Opened => Ok(true),
            state @ (CommunicationState::Created | CommunicationState::Opening) => {
                Err(BinderError::invalid_state("ReliableBinder", state))
            }
            terminal => match self.shared.terminal_error(terminal, mask) {
                Some(e) => Err(e),
                None => Ok(false),
            },
        }
    }

    fn validate_input(&self) -> Result<bool> {
        match self.state() {
            CommunicationState::Opened => Ok(true),
            state @ (CommunicationState::Created | CommunicationState::Opening) => {
                Err(BinderError::invalid_state("ReliableBinder", state))
            }
            _ => Ok(false),
        }
    }

    // ---- draining, masking, request contexts ----

    /// Waits until no operation holds the channel. Returns `false` when the
    /// timeout expires first.
    pub fn wait_for_pending_operations(&self, timeout: Duration) -> bool {
        self.synchronizer().wait_for_pending_operations(timeout)
    }

    /// Suspending form of [`ReliableBinder::wait_for_pending_operations`].
    pub async fn wait_for_pending_operations_async(&self, timeout: Duration) -> bool {
        self.synchronizer()
            .wait_for_pending_operations_async(timeout)
            .await
    }

    /// Runs `error` through masking with [`MaskingMode::ALL`].
    pub fn handle_exception(&self, error: BinderError) -> Result<()> {
        self.shared.handle(error, MaskingMode::ALL, false)
    }

    pub(crate) fn handle_masked(&self, error: BinderError, mask: MaskingMode) -> Result<()> {
        self.shared.handle(error, mask, false)
    }

    /// Communication and timeout class errors.
    pub fn is_handleable(&self, error: &BinderError) -> bool {
        error.is_handleable()
    }

    /// Routes replies on `request` through this binder's masking. Returned
    /// unwrapped when the binder neither tolerates faults nor masks.
    pub fn wrap_request_context(&self, request: C::Request) -> BinderRequestContext<C> {
        if !self.tolerate_faults() && self.default_masking_mode() == MaskingMode::NONE {
            BinderRequestContext::passthrough(self.clone(), request)
        } else {
            BinderRequestContext::wrapped(self.clone(), request)
        }
    }
}
