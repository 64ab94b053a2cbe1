//! Scriptable in-memory channel and channel source.
//!
//! Every channel handed out by a [`MockSource`] shares the source's
//! [`MockStats`], [`MockPlan`] and send [`Gate`], so a test can hold sends in
//! flight, inject faults and count transport calls across channel
//! replacements.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tether_binder::{
    BinderError, Channel, ChannelSource, CommunicationState, FaultNotifier, Inbound, Receive,
    RequestContext, Result,
};
use tokio::sync::Notify;
use tracing::trace;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A latch that holds sends until it is opened. Works for parked threads and
/// suspended tasks alike.
#[derive(Debug)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
    notify: Notify,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            cond: Condvar::new(),
            notify: Notify::new(),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        *guard(&self.open) = true;
        self.cond.notify_all();
        self.notify.notify_waiters();
    }

    pub fn close(&self) {
        *guard(&self.open) = false;
    }

    pub fn is_open(&self) -> bool {
        *guard(&self.open)
    }

    /// Callers currently held at the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Rouses every waiter without opening the gate, so each rechecks its
    /// interrupt condition.
    pub fn wake(&self) {
        let _open = guard(&self.open);
        self.cond.notify_all();
        self.notify.notify_waiters();
    }

    pub fn wait(&self) {
        self.wait_unless(|| false);
    }

    /// Parks until the gate opens or `interrupted` holds. Returns `true` when
    /// the gate opened.
    pub fn wait_unless(&self, interrupted: impl Fn() -> bool) -> bool {
        let mut open = guard(&self.open);
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let opened = loop {
            if *open {
                break true;
            }
            if interrupted() {
                break false;
            }
            open = self.cond.wait(open).unwrap_or_else(PoisonError::into_inner);
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        opened
    }

    pub async fn wait_async(&self) {
        self.wait_unless_async(|| false).await;
    }

    /// Suspending form of [`Gate::wait_unless`].
    pub async fn wait_unless_async(&self, interrupted: impl Fn() -> bool) -> bool {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let opened = loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_open() {
                break true;
            }
            if interrupted() {
                break false;
            }
            notified.await;
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        opened
    }
}

/// Transport call counters shared by all channels of one source.
#[derive(Debug, Default)]
pub struct MockStats {
    pub created: AtomicUsize,
    pub opens: AtomicUsize,
    pub open_failures: AtomicUsize,
    pub sends: AtomicUsize,
    pub send_failures: AtomicUsize,
    pub receives: AtomicUsize,
    pub closes: AtomicUsize,
    pub aborts: AtomicUsize,
    pub faults: AtomicUsize,
}

impl MockStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Behaviour knobs read by channels at call time.
#[derive(Debug, Default)]
pub struct MockPlan {
    open_delay_ms: AtomicU64,
    fail_opens: AtomicUsize,
    fail_sends_after_fault: AtomicBool,
    abort_interrupts_sends: AtomicBool,
    security_session: AtomicBool,
}

impl MockPlan {
    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    fn open_delay(&self) -> Duration {
        Duration::from_millis(self.open_delay_ms.load(Ordering::SeqCst))
    }

    /// The next `n` channel opens fail with a communication error.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    fn take_open_failure(&self) -> bool {
        self.fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Sends that were in flight when their channel faulted fail instead of
    /// completing.
    pub fn set_fail_sends_after_fault(&self, fail: bool) {
        self.fail_sends_after_fault.store(fail, Ordering::SeqCst);
    }

    /// Sends held at the gate fail with [`BinderError::Aborted`] once their
    /// channel is aborted. Off by default, so held sends on a faulted and
    /// aborted channel still complete.
    pub fn set_abort_interrupts_sends(&self, interrupt: bool) {
        self.abort_interrupts_sends.store(interrupt, Ordering::SeqCst);
    }

    pub fn set_security_session(&self, secure: bool) {
        self.security_session.store(secure, Ordering::SeqCst);
    }
}

/// A request received on a [`MockChannel`].
#[derive(Debug)]
pub struct MockRequest {
    message: Bytes,
    replies: Arc<AtomicUsize>,
    aborted: Arc<AtomicBool>,
    fail_reply: bool,
}

impl MockRequest {
    pub fn new(message: Bytes, fail_reply: bool) -> Self {
        Self {
            message,
            replies: Arc::new(AtomicUsize::new(0)),
            aborted: Arc::new(AtomicBool::new(false)),
            fail_reply,
        }
    }

    /// Counter of successful replies, readable after the request moved.
    pub fn replies(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.replies)
    }

    pub fn aborted(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }

    fn do_reply(&self) -> Result<()> {
        if self.fail_reply {
            return Err(BinderError::communication("reply lost"));
        }
        self.replies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RequestContext for MockRequest {
    type Message = Bytes;

    fn request_message(&self) -> Option<&Bytes> {
        Some(&self.message)
    }

    fn reply(&mut self, _message: Option<Bytes>, _timeout: Duration) -> Result<()> {
        self.do_reply()
    }

    async fn reply_async(&mut self, _message: Option<Bytes>, _timeout: Duration) -> Result<()> {
        self.do_reply()
    }

    fn close(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// In-memory channel.
#[derive(Debug)]
pub struct MockChannel {
    id: usize,
    state: Mutex<CommunicationState>,
    notifier: FaultNotifier,
    inbox: Mutex<VecDeque<Inbound<Bytes, MockRequest>>>,
    eof: AtomicBool,
    aborted: AtomicBool,
    sends: AtomicUsize,
    output_closed: AtomicBool,
    gate: Arc<Gate>,
    plan: Arc<MockPlan>,
    stats: Arc<MockStats>,
}

impl MockChannel {
    fn new(id: usize, gate: Arc<Gate>, plan: Arc<MockPlan>, stats: Arc<MockStats>) -> Self {
        Self {
            id,
            state: Mutex::new(CommunicationState::Created),
            notifier: FaultNotifier::new(),
            inbox: Mutex::new(VecDeque::new()),
            eof: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            sends: AtomicUsize::new(0),
            output_closed: AtomicBool::new(false),
            gate,
            plan,
            stats,
        }
    }

    /// Position in the source's creation order.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Sends completed on this instance.
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn output_closed(&self) -> bool {
        self.output_closed.load(Ordering::SeqCst)
    }

    /// True once [`Channel::abort`] tore this instance down.
    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Faults an opened channel and notifies its subscribers. Returns `false`
    /// when the channel was not open.
    pub fn fault(&self) -> bool {
        {
            let mut state = guard(&self.state);
            if *state != CommunicationState::Opened {
                return false;
            }
            *state = CommunicationState::Faulted;
        }
        self.stats.faults.fetch_add(1, Ordering::SeqCst);
        trace!(channel = self.id, "mock channel faulted");
        self.notifier.fire();
        true
    }

    pub fn push_message(&self, message: Bytes) {
        guard(&self.inbox).push_back(Inbound::Message(message));
    }

    pub fn push_request(&self, request: MockRequest) {
        guard(&self.inbox).push_back(Inbound::Request(request));
    }

    /// The peer ended the stream: once the inbox is empty, receives see EOF.
    pub fn end_stream(&self) {
        self.eof.store(true, Ordering::SeqCst);
    }

    fn begin_open(&self) -> Result<Duration> {
        let mut state = guard(&self.state);
        if *state != CommunicationState::Created {
            return Err(BinderError::invalid_state("MockChannel", *state));
        }
        *state = CommunicationState::Opening;
        Ok(self.plan.open_delay())
    }

    fn finish_open(&self) -> Result<()> {
        let mut state = guard(&self.state);
        if self.plan.take_open_failure() {
            *state = CommunicationState::Faulted;
            self.stats.open_failures.fetch_add(1, Ordering::SeqCst);
            return Err(BinderError::communication("connection refused"));
        }
        if *state != CommunicationState::Opening {
            return Err(BinderError::Aborted);
        }
        *state = CommunicationState::Opened;
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_sendable(&self) -> Result<()> {
        let state = *guard(&self.state);
        if state != CommunicationState::Opened {
            self.stats.send_failures.fetch_add(1, Ordering::SeqCst);
            return Err(BinderError::communication(format!("channel {} is {:?}", self.id, state)));
        }
        Ok(())
    }

    fn send_interrupted(&self) -> bool {
        self.plan.abort_interrupts_sends.load(Ordering::SeqCst) && self.was_aborted()
    }

    fn finish_send(&self, opened: bool) -> Result<()> {
        if !opened {
            self.stats.send_failures.fetch_add(1, Ordering::SeqCst);
            return Err(BinderError::Aborted);
        }
        if self.plan.fail_sends_after_fault.load(Ordering::SeqCst) {
            self.check_sendable()?;
        }
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.stats.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn do_close(&self) {
        let mut state = guard(&self.state);
        if *state == CommunicationState::Opened {
            *state = CommunicationState::Closed;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn do_receive(&self) -> Receive<Inbound<Bytes, MockRequest>> {
        self.stats.receives.fetch_add(1, Ordering::SeqCst);
        if let Some(item) = guard(&self.inbox).pop_front() {
            return Receive::Item(item);
        }
        if self.eof.load(Ordering::SeqCst) || self.state() != CommunicationState::Opened {
            return Receive::Eof;
        }
        Receive::TimedOut
    }
}

#[async_trait]
impl Channel for MockChannel {
    type Message = Bytes;
    type Request = MockRequest;

    fn state(&self) -> CommunicationState {
        *guard(&self.state)
    }

    fn fault_notifier(&self) -> &FaultNotifier {
        &self.notifier
    }

    fn has_security_session(&self) -> bool {
        self.plan.security_session.load(Ordering::SeqCst)
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
        self.do_close();
        Ok(())
    }

    async fn close_async(&self, _timeout: Duration) -> Result<()> {
        self.do_close();
        Ok(())
    }

    fn abort(&self) {
        {
            let mut state = guard(&self.state);
            if *state == CommunicationState::Closed {
                return;
            }
            *state = CommunicationState::Closed;
            self.aborted.store(true, Ordering::SeqCst);
            self.stats.aborts.fetch_add(1, Ordering::SeqCst);
        }
        trace!(channel = self.id, "mock channel aborted");
        self.gate.wake();
    }

    fn send(&self, _message: &Bytes, _timeout: Duration) -> Result<()> {
        self.check_sendable()?;
        let opened = self.gate.wait_unless(|| self.send_interrupted());
        self.finish_send(opened)
    }

    async fn send_async(&self, _message: &Bytes, _timeout: Duration) -> Result<()> {
        self.check_sendable()?;
        let opened = self.gate.wait_unless_async(|| self.send_interrupted()).await;
        self.finish_send(opened)
    }

    fn try_receive(&self, _timeout: Duration) -> Result<Receive<Inbound<Bytes, MockRequest>>> {
        Ok(self.do_receive())
    }

    async fn try_receive_async(
        &self,
        _timeout: Duration,
    ) -> Result<Receive<Inbound<Bytes, MockRequest>>> {
        Ok(self.do_receive())
    }

    fn close_output_session(&self, _timeout: Duration) -> Result<()> {
        self.output_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_output_session_async(&self, _timeout: Duration) -> Result<()> {
        self.output_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Creates a fresh [`MockChannel`] per request.
#[derive(Debug)]
pub struct MockSource {
    stats: Arc<MockStats>,
    plan: Arc<MockPlan>,
    gate: Arc<Gate>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    exhausted: AtomicBool,
}

impl Default for MockSource {
    fn default() -> Self {
        Self {
            stats: Arc::new(MockStats::default()),
            plan: Arc::new(MockPlan::default()),
            gate: Arc::new(Gate::new(true)),
            channels: Mutex::new(Vec::new()),
            exhausted: AtomicBool::new(false),
        }
    }
}

impl MockSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self) -> &MockStats {
        &self.stats
    }

    pub fn plan(&self) -> &MockPlan {
        &self.plan
    }

    /// The gate every send waits on. Open by default.
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn created(&self) -> usize {
        guard(&self.channels).len()
    }

    pub fn channel(&self, index: usize) -> Option<Arc<MockChannel>> {
        guard(&self.channels).get(index).cloned()
    }

    pub fn latest(&self) -> Option<Arc<MockChannel>> {
        guard(&self.channels).last().cloned()
    }

    /// While exhausted, channel requests report a timeout.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::SeqCst);
    }

    fn next_channel(&self) -> Option<Arc<MockChannel>> {
        if self.exhausted.load(Ordering::SeqCst) {
            return None;
        }
        let mut channels = guard(&self.channels);
        let channel = Arc::new(MockChannel::new(
            channels.len(),
            Arc::clone(&self.gate),
            Arc::clone(&self.plan),
            Arc::clone(&self.stats),
        ));
        channels.push(Arc::clone(&channel));
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        trace!(channel = channel.id, "mock channel created");
        Some(channel)
    }
}

#[async_trait]
impl ChannelSource<MockChannel> for MockSource {
    fn try_get_channel(&self, _timeout: Duration) -> Result<Option<Arc<MockChannel>>> {
        Ok(self.next_channel())
    }

    async fn try_get_channel_async(&self, _timeout: Duration) -> Result<Option<Arc<MockChannel>>> {
        Ok(self.next_channel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_releases_parked_thread() {
        let gate = Arc::new(Gate::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        gate.open();
        waiter.join().unwrap();
    }

    #[tokio::test]
    async fn test_gate_releases_task() {
        let gate = Arc::new(Gate::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_async().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.open();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_abort_interrupts_held_send() {
        let source = MockSource::new();
        source.plan().set_abort_interrupts_sends(true);
        let channel = source.next_channel().unwrap();
        channel.open(Duration::from_secs(1)).unwrap();
        source.gate().close();
        let sender = {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || channel.send(&Bytes::from_static(b"x"), Duration::from_secs(1)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!sender.is_finished());

        channel.abort();
        assert!(matches!(sender.join().unwrap(), Err(BinderError::Aborted)));
        assert!(channel.was_aborted());
        assert!(!source.gate().is_open());
        assert_eq!(channel.sends(), 0);
    }

    #[test]
    fn test_fault_only_from_opened() {
        let source = MockSource::new();
        let channel = source.next_channel().unwrap();
        assert!(!channel.fault());
        channel.open(Duration::from_secs(1)).unwrap();
        assert!(channel.fault());
        assert_eq!(channel.state(), CommunicationState::Faulted);
        assert_eq!(MockStats::get(&source.stats().faults), 1);
    }

    #[test]
    fn test_receive_sees_eof_after_inbox_drains() {
        let source = MockSource::new();
        let channel = source.next_channel().unwrap();
        channel.open(Duration::from_secs(1)).unwrap();
        channel.push_message(Bytes::from_static(b"a"));
        channel.end_stream();
        assert!(matches!(channel.do_receive(), Receive::Item(Inbound::Message(_))));
        assert!(matches!(channel.do_receive(), Receive::Eof));
    }
}
