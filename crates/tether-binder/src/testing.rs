//! In-crate test doubles: a counting channel, its source, and a minimal host
//! that owns a synchronizer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::channel::{
    Channel, ChannelSource, CommunicationState, FaultNotifier, Inbound, NoRequest, Receive,
};
use crate::error::{BinderError, Result};
use crate::lock;
use crate::masking::{MaskingMode, TolerateFaultsMode};
use crate::metrics::BinderMetrics;
use crate::synchronizer::{ChannelSynchronizer, SynchronizerHost, SynchronizerSettings};

#[derive(Debug, Default)]
pub(crate) struct SourceStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub aborts: AtomicUsize,
    pub sends: AtomicUsize,
    fail_opens: AtomicUsize,
    open_delay_ms: AtomicU64,
    close_delay_ms: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct TestChannel {
    state: Mutex<CommunicationState>,
    notifier: FaultNotifier,
    inbox: Mutex<VecDeque<u32>>,
    stats: Arc<SourceStats>,
}

impl TestChannel {
    pub(crate) fn new(stats: Arc<SourceStats>) -> Self {
        Self {
            state: Mutex::new(CommunicationState::Created),
            notifier: FaultNotifier::new(),
            inbox: Mutex::new(VecDeque::new()),
            stats,
        }
    }

    pub(crate) fn fault(&self) {
        *lock(&self.state) = CommunicationState::Faulted;
        self.notifier.fire();
    }

    pub(crate) fn push_inbound(&self, message: u32) {
        lock(&self.inbox).push_back(message);
    }

    fn begin_open(&self) -> Result<Duration> {
        let mut state = lock(&self.state);
        if *state != CommunicationState::Created {
            return Err(BinderError::invalid_state("TestChannel", *state));
        }
        *state = CommunicationState::Opening;
        Ok(Duration::from_millis(self.stats.open_delay_ms.load(Ordering::SeqCst)))
    }

    fn finish_open(&self) -> Result<()> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .stats
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let mut state = lock(&self.state);
        if fail {
            *state = CommunicationState::Faulted;
            return Err(BinderError::communication("open refused"));
        }
        if *state != CommunicationState::Opening {
            return Err(BinderError::Aborted);
        }
        *state = CommunicationState::Opened;
        Ok(())
    }

    fn close_delay(&self) -> Duration {
        Duration::from_millis(self.stats.close_delay_ms.load(Ordering::SeqCst))
    }

    fn do_close(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state == CommunicationState::Opened {
            *state = CommunicationState::Closed;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn do_send(&self) -> Result<()> {
        if *lock(&self.state) != CommunicationState::Opened {
            return Err(BinderError::communication("channel not open"));
        }
        self.stats.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn do_receive(&self) -> Result<Receive<Inbound<u32, NoRequest<u32>>>> {
        if let Some(message) = lock(&self.inbox).pop_front() {
            return Ok(Receive::Item(Inbound::Message(message)));
        }
        match *lock(&self.state) {
            CommunicationState::Opened => Ok(Receive::TimedOut),
            _ => Ok(Receive::Eof),
        }
    }
}

#[async_trait]
impl Channel for TestChannel {
    type Message = u32;
    type Request = NoRequest<u32>;

    fn state(&self) -> CommunicationState {
        *lock(&self.state)
    }

    fn fault_notifier(&self) -> &FaultNotifier {
        &self.notifier
    }

    fn open(&self, _timeout: Duration) -> Result<()> {
        let delay = self.begin_open()?;
        std::thread::sleep(delay);
        self.finish_open()
    }

    async fn open_async(&self, _timeout: Duration) -> Result<()> {
        let delay = self.begin_open()?;
        tokio::time::sleep(delay).await;
        self.finish_open()
    }

    fn close(&self, _timeout: Duration) -> Result<()> {
        std::thread::sleep(self.close_delay());
        self.do_close()
    }

    async fn close_async(&self, _timeout: Duration) -> Result<()> {
        tokio::time::sleep(self.close_delay()).await;
        self.do_close()
    }

    fn abort(&self) {
        let mut state = lock(&self.state);
        if *state != CommunicationState::Closed {
            *state = CommunicationState::Closed;
            self.stats.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn send(&self, _message: &u32, _timeout: Duration) -> Result<()> {
        self.do_send()
    }

    async fn send_async(&self, _message: &u32, _timeout: Duration) -> Result<()> {
        self.do_send()
    }

    fn try_receive(&self, _timeout: Duration) -> Result<Receive<Inbound<u32, NoRequest<u32>>>> {
        self.do_receive()
    }

    async fn try_receive_async(
        &self,
        _timeout: Duration,
    ) -> Result<Receive<Inbound<u32, NoRequest<u32>>>> {
        self.do_receive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct TestSource {
    pub stats: Arc<SourceStats>,
    channels: Mutex<Vec<Arc<TestChannel>>>,
    exhausted: AtomicBool,
}

impl TestSource {
    pub(crate) fn created(&self) -> usize {
        lock(&self.channels).len()
    }

    pub(crate) fn channel(&self, index: usize) -> Arc<TestChannel> {
        Arc::clone(&lock(&self.channels)[index])
    }

    pub(crate) fn total_opens(&self) -> usize {
        self.stats.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next_opens(&self, n: usize) {
        self.stats.fail_opens.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.stats
            .open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_close_delay(&self, delay: Duration) {
        self.stats
            .close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::SeqCst);
    }

    fn next(&self) -> Option<Arc<TestChannel>> {
        if self.exhausted.load(Ordering::SeqCst) {
            return None;
        }
        let channel = Arc::new(TestChannel::new(Arc::clone(&self.stats)));
        lock(&self.channels).push(Arc::clone(&channel));
        Some(channel)
    }
}

#[async_trait]
impl ChannelSource<TestChannel> for TestSource {
    fn try_get_channel(&self, _timeout: Duration) -> Result<Option<Arc<TestChannel>>> {
        Ok(self.next())
    }

    async fn try_get_channel_async(&self, _timeout: Duration) -> Result<Option<Arc<TestChannel>>> {
        Ok(self.next())
    }
}

/// Owns a synchronizer and records the callbacks it makes.
pub(crate) struct Harness {
    sync: ChannelSynchronizer<TestChannel>,
    pub source: Arc<TestSource>,
    pub faults: AtomicUsize,
    pub lost: AtomicUsize,
    pub reported: AtomicUsize,
}

impl Harness {
    pub(crate) fn unstarted(mode: TolerateFaultsMode, must_open_channel: bool) -> Arc<Self> {
        Self::build(SynchronizerSettings {
            fault_mode: mode,
            must_open_channel,
            must_close_channel: true,
            close_timeout: Duration::from_secs(1),
        })
    }

    /// Started harness whose retired channels belong to someone else.
    pub(crate) fn not_owning(mode: TolerateFaultsMode) -> Arc<Self> {
        let harness = Self::build(SynchronizerSettings {
            fault_mode: mode,
            must_open_channel: true,
            must_close_channel: false,
            close_timeout: Duration::from_secs(1),
        });
        harness
            .sync
            .start_synchronizing()
            .expect("start synchronizing");
        harness
    }

    fn build(settings: SynchronizerSettings) -> Arc<Self> {
        let source = Arc::new(TestSource::default());
        Arc::new_cyclic(|weak: &Weak<Harness>| {
            let host: Weak<dyn SynchronizerHost<TestChannel>> = weak.clone();
            let dyn_source: Arc<dyn ChannelSource<TestChannel>> = source.clone();
            Harness {
                sync: ChannelSynchronizer::new(
                    None,
                    dyn_source,
                    settings,
                    Arc::new(BinderMetrics::new()),
                    host,
                    Uuid::new_v4(),
                ),
                source,
                faults: AtomicUsize::new(0),
                lost: AtomicUsize::new(0),
                reported: AtomicUsize::new(0),
            }
        })
    }

    pub(crate) fn new(mode: TolerateFaultsMode, must_open_channel: bool) -> Arc<Self> {
        let harness = Self::unstarted(mode, must_open_channel);
        harness
            .sync
            .start_synchronizing()
            .expect("start synchronizing");
        harness
    }

    pub(crate) fn sync(&self) -> &ChannelSynchronizer<TestChannel> {
        &self.sync
    }
}

/// Polls `check` for up to `timeout`.
pub(crate) fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while !check() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}

impl SynchronizerHost<TestChannel> for Harness {
    fn synchronizer(&self) -> &ChannelSynchronizer<TestChannel> {
        &self.sync
    }

    fn fault(&self) {
        self.faults.fetch_add(1, Ordering::SeqCst);
        self.sync.stop_synchronizing(false);
        self.sync.unblock_waiters();
    }

    fn connection_lost(&self) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }

    fn closed_error(&self, mask: MaskingMode) -> Option<BinderError> {
        (!mask.masks_handled()).then_some(BinderError::Closed)
    }

    fn faulted_error(&self, mask: MaskingMode) -> Option<BinderError> {
        (!mask.masks_handled()).then_some(BinderError::Faulted)
    }

    fn report_exception(&self, _error: BinderError) {
        self.reported.fetch_add(1, Ordering::SeqCst);
    }
}
