//! The channel collaborator contract.
//!
//! The binder never performs network I/O itself. It only requires that a
//! channel can be opened, closed and aborted within a deadline, that it
//! reports faults through a [`FaultNotifier`], and that it offers the
//! transport operations of its shape (send, receive, or both). Every
//! operation comes in a blocking and a suspending form so that both binder
//! drivers can use the same channel.

use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BinderError, Result};
use crate::lock;

/// Lifecycle of a communication object: the binder itself and every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationState {
    /// Constructed, not yet opened.
    Created,
    /// Open in progress.
    Opening,
    /// Ready for use.
    Opened,
    /// Close in progress.
    Closing,
    /// Closed or aborted.
    Closed,
    /// Failed; only abort is meaningful.
    Faulted,
}

/// Outcome of a receive attempt.
#[derive(Debug)]
pub enum Receive<T> {
    /// An inbound item arrived.
    Item(T),
    /// The source is exhausted: the channel closed or faulted underneath the
    /// reader, or the binder has no channel to read from.
    Eof,
    /// Nothing arrived before the deadline.
    TimedOut,
}

impl<T> Receive<T> {
    /// Returns the item, if any.
    pub fn into_item(self) -> Option<T> {
        match self {
            Receive::Item(item) => Some(item),
            Receive::Eof | Receive::TimedOut => None,
        }
    }

    /// True for [`Receive::TimedOut`].
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Receive::TimedOut)
    }
}

/// An item read from a channel: a bare message (duplex/input shapes) or a
/// request that expects a reply (reply shapes).
#[derive(Debug)]
pub enum Inbound<M, R> {
    /// A one-way message.
    Message(M),
    /// A request with its reply context.
    Request(R),
}

/// Callback registered with a [`FaultNotifier`].
pub type FaultHandler = Arc<dyn Fn() + Send + Sync>;

/// Registry of fault callbacks owned by a channel.
///
/// A channel calls [`FaultNotifier::fire`] when it transitions to
/// [`CommunicationState::Faulted`]. Handlers run outside the registry lock,
/// so a handler may unsubscribe itself.
#[derive(Default)]
pub struct FaultNotifier {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, FaultHandler)>>,
}

impl std::fmt::Debug for FaultNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl FaultNotifier {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`; the returned id removes it again.
    pub fn subscribe(&self, handler: FaultHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers).push((id, handler));
        id
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Invokes every registered handler.
    pub fn fire(&self) {
        let handlers: Vec<FaultHandler> = lock(&self.handlers)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler();
        }
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.handlers).len()
    }
}

/// Reply side of a received request.
#[async_trait]
pub trait RequestContext: Send + 'static {
    /// Message type carried by requests and replies.
    type Message: Send + Sync + 'static;

    /// The request that was received.
    fn request_message(&self) -> Option<&Self::Message>;

    /// Sends the reply (`None` acknowledges without a body).
    fn reply(&mut self, message: Option<Self::Message>, timeout: Duration) -> Result<()>;

    /// Suspending form of [`RequestContext::reply`].
    async fn reply_async(&mut self, message: Option<Self::Message>, timeout: Duration) -> Result<()>;

    /// Completes the exchange without a further reply.
    ///
    /// Suspending session drains call this from inside a task, so an
    /// implementation must return without blocking on the network; queue the
    /// close and let the transport finish it.
    fn close(&mut self, timeout: Duration) -> Result<()>;

    /// Tears the exchange down immediately.
    fn abort(&mut self);
}

/// Request type for channel shapes that never receive requests.
pub struct NoRequest<M> {
    never: Infallible,
    _message: PhantomData<fn() -> M>,
}

impl<M> std::fmt::Debug for NoRequest<M> {
    fn fmt(&self, _f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.never {}
    }
}

#[async_trait]
impl<M: Send + Sync + 'static> RequestContext for NoRequest<M> {
    type Message = M;

    fn request_message(&self) -> Option<&M> {
        match self.never {}
    }

    fn reply(&mut self, _message: Option<M>, _timeout: Duration) -> Result<()> {
        match self.never {}
    }

    async fn reply_async(&mut self, _message: Option<M>, _timeout: Duration) -> Result<()> {
        match self.never {}
    }

    fn close(&mut self, _timeout: Duration) -> Result<()> {
        match self.never {}
    }

    fn abort(&mut self) {
        match self.never {}
    }
}

/// A transport channel instance shared by the binder's operations.
///
/// Instances are held behind `Arc` and used concurrently; internal thread
/// safety is the implementor's responsibility. Only the binder retires an
/// instance (close when healthy, abort otherwise).
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Message type sent and received over this channel.
    type Message: Send + Sync + 'static;
    /// Reply context for request shapes; [`NoRequest`] otherwise.
    type Request: RequestContext<Message = Self::Message>;

    /// Current lifecycle state.
    fn state(&self) -> CommunicationState;

    /// Registry fired when the channel faults.
    fn fault_notifier(&self) -> &FaultNotifier;

    /// True when the channel carries a security session; consulted by
    /// [`TolerateFaultsMode::IfNotSecuritySession`](crate::masking::TolerateFaultsMode).
    fn has_security_session(&self) -> bool {
        false
    }

    /// Opens the channel.
    fn open(&self, timeout: Duration) -> Result<()>;

    /// Suspending form of [`Channel::open`].
    async fn open_async(&self, timeout: Duration) -> Result<()>;

    /// Closes the channel gracefully.
    fn close(&self, timeout: Duration) -> Result<()>;

    /// Suspending form of [`Channel::close`].
    async fn close_async(&self, timeout: Duration) -> Result<()>;

    /// Tears the channel down immediately. Must not fail.
    fn abort(&self);

    /// Sends a message.
    fn send(&self, _message: &Self::Message, _timeout: Duration) -> Result<()> {
        Err(BinderError::Unsupported { operation: "send" })
    }

    /// Suspending form of [`Channel::send`].
    async fn send_async(&self, _message: &Self::Message, _timeout: Duration) -> Result<()> {
        Err(BinderError::Unsupported { operation: "send" })
    }

    /// Receives the next inbound item.
    fn try_receive(&self, _timeout: Duration) -> Result<Receive<Inbound<Self::Message, Self::Request>>> {
        Err(BinderError::Unsupported {
            operation: "receive",
        })
    }

    /// Suspending form of [`Channel::try_receive`].
    async fn try_receive_async(
        &self,
        _timeout: Duration,
    ) -> Result<Receive<Inbound<Self::Message, Self::Request>>> {
        Err(BinderError::Unsupported {
            operation: "receive",
        })
    }

    /// Signals that this side will send nothing more (session shapes).
    fn close_output_session(&self, _timeout: Duration) -> Result<()> {
        Err(BinderError::Unsupported {
            operation: "close output session",
        })
    }

    /// Suspending form of [`Channel::close_output_session`].
    async fn close_output_session_async(&self, _timeout: Duration) -> Result<()> {
        Err(BinderError::Unsupported {
            operation: "close output session",
        })
    }
}

/// Where a leader obtains a fresh channel instance: a client creates one from
/// its factory, a server accepts the next inbound one.
#[async_trait]
pub trait ChannelSource<C: Channel>: Send + Sync + 'static {
    /// Returns a new, unopened channel, or `None` when the deadline expired.
    fn try_get_channel(&self, timeout: Duration) -> Result<Option<Arc<C>>>;

    /// Suspending form of [`ChannelSource::try_get_channel`].
    async fn try_get_channel_async(&self, timeout: Duration) -> Result<Option<Arc<C>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fault_notifier_fires_all() {
        let notifier = FaultNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            notifier.subscribe(Arc::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        notifier.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fault_notifier_unsubscribe() {
        let notifier = FaultNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let id = notifier.subscribe(Arc::new(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let notifier = Arc::new(FaultNotifier::new());
        let slot = Arc::new(AtomicU64::new(u64::MAX));
        let weak = Arc::downgrade(&notifier);
        let slot_clone = Arc::clone(&slot);
        let id = notifier.subscribe(Arc::new(move || {
            if let Some(notifier) = weak.upgrade() {
                notifier.unsubscribe(slot_clone.load(Ordering::SeqCst));
            }
        }));
        slot.store(id, Ordering::SeqCst);
        notifier.fire();
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn test_receive_helpers() {
        let item: Receive<u32> = Receive::Item(7);
        assert_eq!(item.into_item(), Some(7));
        assert!(Receive::<u32>::TimedOut.is_timed_out());
        assert_eq!(Receive::<u32>::Eof.into_item(), None);
    }
}
