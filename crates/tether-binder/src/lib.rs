#![warn(missing_docs)]

//! Tether binder: many concurrent operations sharing one lazily created
//! transport channel, with transparent replacement of faulted channels,
//! per-call exception masking and drain-aware shutdown.

pub mod binder;
pub mod channel;
pub mod config;
pub mod context;
pub mod deadline;
pub mod drain;
pub mod error;
pub mod events;
pub mod masking;
pub mod metrics;
pub mod session;
pub mod synchronizer;
mod waiter;

#[cfg(test)]
pub(crate) mod testing;

pub use binder::ReliableBinder;
pub use channel::{
    Channel, ChannelSource, CommunicationState, FaultHandler, FaultNotifier, Inbound, NoRequest,
    Receive, RequestContext,
};
pub use config::{BinderConfig, CloseShape};
pub use context::BinderRequestContext;
pub use deadline::Deadline;
pub use error::{BinderError, ErrorClass, Result};
pub use events::{BinderEvent, EventBus};
pub use masking::{MaskingMode, TolerateFaultsMode};
pub use metrics::{BinderMetrics, MetricsSnapshot};
pub use synchronizer::{Acquired, ChannelLease, ChannelSynchronizer, SynchronizerState};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
