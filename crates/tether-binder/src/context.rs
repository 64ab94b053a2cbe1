//! Inbound items handed out by [`ReliableBinder::try_receive`].
//!
//! A received message or request is wrapped so that replying to it, closing
//! it or aborting it goes through the binder's masking instead of failing
//! straight into the caller.

use std::time::Duration;

use async_trait::async_trait;

use crate::binder::ReliableBinder;
use crate::channel::{Channel, RequestContext};
use crate::error::{BinderError, Result};
use crate::masking::MaskingMode;

enum Kind<C: Channel> {
    /// A one-way message. Replies are sent through the binder.
    Message(Option<C::Message>),
    /// A request whose failures are masked by the binder.
    Wrapped(C::Request),
    /// A request returned as is: the binder neither tolerates faults nor
    /// masks.
    Passthrough(C::Request),
}

/// A received item bound to the binder that received it.
pub struct BinderRequestContext<C: Channel> {
    binder: ReliableBinder<C>,
    mask: MaskingMode,
    kind: Kind<C>,
}

impl<C: Channel> std::fmt::Debug for BinderRequestContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            Kind::Message(_) => "message",
            Kind::Wrapped(_) => "wrapped",
            Kind::Passthrough(_) => "passthrough",
        };
        f.debug_struct("BinderRequestContext")
            .field("binder", &self.binder.id())
            .field("kind", &kind)
            .field("mask", &self.mask)
            .finish()
    }
}

impl<C: Channel> BinderRequestContext<C> {
    pub(crate) fn from_message(binder: ReliableBinder<C>, message: C::Message) -> Self {
        Self::new(binder, Kind::Message(Some(message)))
    }

    pub(crate) fn wrapped(binder: ReliableBinder<C>, request: C::Request) -> Self {
        Self::new(binder, Kind::Wrapped(request))
    }

    pub(crate) fn passthrough(binder: ReliableBinder<C>, request: C::Request) -> Self {
        Self::new(binder, Kind::Passthrough(request))
    }

    fn new(binder: ReliableBinder<C>, kind: Kind<C>) -> Self {
        let mask = binder.default_masking_mode();
        Self { binder, mask, kind }
    }

    /// The received message, if any.
    pub fn request_message(&self) -> Option<&C::Message> {
        match &self.kind {
            Kind::Message(message) => message.as_ref(),
            Kind::Wrapped(request) | Kind::Passthrough(request) => request.request_message(),
        }
    }

    /// Takes the message out of a one-way item. Requests return `None`.
    pub fn into_message(self) -> Option<C::Message> {
        match self.kind {
            Kind::Message(message) => message,
            Kind::Wrapped(_) | Kind::Passthrough(_) => None,
        }
    }

    /// True when this wraps a request that expects a reply.
    pub fn is_request(&self) -> bool {
        !matches!(self.kind, Kind::Message(_))
    }

    /// Masking applied to replies on this request.
    pub fn masking_mode(&self) -> MaskingMode {
        self.mask
    }

    /// Overrides the masking used by this context. Only binders whose default
    /// masking mode is `ALL` allow it.
    pub fn set_masking_mode(&mut self, mask: MaskingMode) -> Result<()> {
        if self.binder.default_masking_mode() != MaskingMode::ALL {
            return Err(BinderError::Unsupported {
                operation: "set_masking_mode",
            });
        }
        self.mask = mask;
        Ok(())
    }

    /// Replies with the binder's default send timeout.
    pub fn reply_default(&mut self, message: Option<C::Message>) -> Result<()> {
        let timeout = self.binder.config().send_timeout();
        self.reply(message, timeout)
    }

    /// Closes with the binder's default close timeout.
    pub fn close_default(&mut self) -> Result<()> {
        let timeout = self.binder.config().close_timeout();
        self.close(timeout)
    }

    /// Masks a failure of the wrapped request and aborts it when masked.
    /// Failures on an already closed request are ignored.
    fn settle_wrapped(binder: &ReliableBinder<C>, mask: MaskingMode, request: &mut C::Request, error: BinderError) -> Result<()> {
        if matches!(error, BinderError::Closed) {
            return Ok(());
        }
        binder.handle_masked(error, mask)?;
        request.abort();
        Ok(())
    }
}

#[async_trait]
impl<C: Channel> RequestContext for BinderRequestContext<C> {
    type Message = C::Message;

    fn request_message(&self) -> Option<&C::Message> {
        BinderRequestContext::request_message(self)
    }

    fn reply(&mut self, message: Option<C::Message>, timeout: Duration) -> Result<()> {
        match &mut self.kind {
            Kind::Message(_) => match message {
                Some(message) => self.binder.send_masked(&message, timeout, self.mask),
                None => Ok(()),
            },
            Kind::Wrapped(request) => match request.reply(message, timeout) {
                Ok(()) => Ok(()),
                Err(e) => Self::settle_wrapped(&self.binder, self.mask, request, e),
            },
            Kind::Passthrough(request) => request.reply(message, timeout),
        }
    }

    async fn reply_async(&mut self, message: Option<C::Message>, timeout: Duration) -> Result<()> {
        match &mut self.kind {
            Kind::Message(_) => match message {
                Some(message) => {
                    self.binder
                        .send_masked_async(&message, timeout, self.mask)
                        .await
                }
                None => Ok(()),
            },
            Kind::Wrapped(request) => match request.reply_async(message, timeout).await {
                Ok(()) => Ok(()),
                Err(e) => Self::settle_wrapped(&self.binder, self.mask, request, e),
            },
            Kind::Passthrough(request) => request.reply_async(message, timeout).await,
        }
    }

    fn close(&mut self, timeout: Duration) -> Result<()> {
        match &mut self.kind {
            Kind::Message(_) => Ok(()),
            Kind::Wrapped(request) => match request.close(timeout) {
                Ok(()) => Ok(()),
                Err(e) => Self::settle_wrapped(&self.binder, self.mask, request, e),
            },
            Kind::Passthrough(request) => request.close(timeout),
        }
    }

    /// Never fails.
    fn abort(&mut self) {
        match &mut self.kind {
            Kind::Message(_) => {}
            Kind::Wrapped(request) | Kind::Passthrough(request) => request.abort(),
        }
    }
}
