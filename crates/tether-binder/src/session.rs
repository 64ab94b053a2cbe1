//! Graceful shutdown of session-shaped channels.
//!
//! A session channel is not closed outright: the local side finishes its
//! output, waits for the binder's in-flight operations, and then drains what
//! the peer still has in flight until the peer ends the session. Channels
//! that cannot be drained in time are aborted.

use std::time::Duration;

use tracing::debug;

use crate::binder::ReliableBinder;
use crate::channel::{Channel, CommunicationState, Inbound, Receive, RequestContext};
use crate::deadline::Deadline;
use crate::error::{BinderError, Result};

/// Whether a drain step saw the end of the session.
enum Drained {
    Eof,
    More,
}

/// Closes the output half of a duplex session, then drains inbound messages
/// until the peer closes its half and closes the channel.
pub fn close_duplex_session<C: Channel>(
    binder: &ReliableBinder<C>,
    channel: &C,
    timeout: Duration,
) -> Result<()> {
    let deadline = Deadline::new(timeout);
    channel.close_output_session(deadline.remaining())?;
    wait_for_pending(binder, deadline)?;
    drain_session(binder, channel, deadline)
}

/// Drains and closes every inbound request, then closes the channel once the
/// peer ends the session.
pub fn close_reply_session<C: Channel>(
    binder: &ReliableBinder<C>,
    channel: &C,
    timeout: Duration,
) -> Result<()> {
    let deadline = Deadline::new(timeout);
    wait_for_pending(binder, deadline)?;
    drain_session(binder, channel, deadline)
}

/// Suspending form of [`close_duplex_session`]. Shares the non-blocking
/// request close contract of [`close_reply_session_async`].
pub async fn close_duplex_session_async<C: Channel>(
    binder: &ReliableBinder<C>,
    channel: &C,
    timeout: Duration,
) -> Result<()> {
    let deadline = Deadline::new(timeout);
    channel.close_output_session_async(deadline.remaining()).await?;
    wait_for_pending_async(binder, deadline).await?;
    drain_session_async(binder, channel, deadline).await
}

/// Suspending form of [`close_reply_session`]. Late requests are closed
/// with [`RequestContext::close`](crate::RequestContext::close) on the
/// calling task, which must not block.
pub async fn close_reply_session_async<C: Channel>(
    binder: &ReliableBinder<C>,
    channel: &C,
    timeout: Duration,
) -> Result<()> {
    let deadline = Deadline::new(timeout);
    wait_for_pending_async(binder, deadline).await?;
    drain_session_async(binder, channel, deadline).await
}

fn wait_for_pending<C: Channel>(binder: &ReliableBinder<C>, deadline: Deadline) -> Result<()> {
    if binder.wait_for_pending_operations(deadline.remaining()) {
        Ok(())
    } else {
        Err(deadline.timeout_error("close session"))
    }
}

async fn wait_for_pending_async<C: Channel>(binder: &ReliableBinder<C>, deadline: Deadline) -> Result<()> {
    if binder
        .wait_for_pending_operations_async(deadline.remaining())
        .await
    {
        Ok(())
    } else {
        Err(deadline.timeout_error("close session"))
    }
}

fn drain_session<C: Channel>(binder: &ReliableBinder<C>, channel: &C, deadline: Deadline) -> Result<()> {
    let mut iteration = deadline.remaining();
    let mut last = iteration.is_zero();
    loop {
        let received = channel.try_receive(iteration);
        if let Drained::Eof = absorb(binder, channel, received, |request| {
            request.close(deadline.remaining())
        })? {
            return channel.close(deadline.remaining());
        }
        if last || channel.state() != CommunicationState::Opened {
            break;
        }
        iteration = deadline.remaining();
        last = iteration.is_zero();
    }
    debug!(binder = %binder.id(), "session did not drain, aborting channel");
    channel.abort();
    Ok(())
}

/// Request closes run inline on the task; see
/// [`RequestContext::close`](crate::RequestContext::close).
async fn drain_session_async<C: Channel>(
    binder: &ReliableBinder<C>,
    channel: &C,
    deadline: Deadline,
) -> Result<()> {
    let mut iteration = deadline.remaining();
    let mut last = iteration.is_zero();
    loop {
        let received = channel.try_receive_async(iteration).await;
        if let Drained::Eof = absorb(binder, channel, received, |request| {
            request.close(deadline.remaining())
        })? {
            return channel.close_async(deadline.remaining()).await;
        }
        if last || channel.state() != CommunicationState::Opened {
            break;
        }
        iteration = deadline.remaining();
        last = iteration.is_zero();
    }
    debug!(binder = %binder.id(), "session did not drain, aborting channel");
    channel.abort();
    Ok(())
}

/// Consumes one drain step. Late messages are discarded and late requests
/// closed through `close_request`. A receive failure is tolerated only when
/// the binder masks handleable errors by default; otherwise the channel is
/// aborted and the failure returned.
fn absorb<C, F>(
    binder: &ReliableBinder<C>,
    channel: &C,
    received: Result<Receive<Inbound<C::Message, C::Request>>>,
    close_request: F,
) -> Result<Drained>
where
    C: Channel,
    F: FnOnce(&mut C::Request) -> Result<()>,
{
    match received {
        Ok(Receive::Eof) => Ok(Drained::Eof),
        Ok(Receive::TimedOut) => Ok(Drained::More),
        Ok(Receive::Item(Inbound::Message(_))) => Ok(Drained::More),
        Ok(Receive::Item(Inbound::Request(mut request))) => {
            close_request(&mut request)?;
            Ok(Drained::More)
        }
        Err(e) if tolerated(binder, &e) => {
            debug!(binder = %binder.id(), error = %e, "receive failed while draining session");
            Ok(Drained::More)
        }
        Err(e) => {
            channel.abort();
            Err(e)
        }
    }
}

fn tolerated<C: Channel>(binder: &ReliableBinder<C>, error: &BinderError) -> bool {
    binder.default_masking_mode().masks_handled() && binder.is_handleable(error)
}
