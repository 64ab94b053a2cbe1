//! Runs binder operations through either execution model.
//!
//! The binder offers every operation twice: a blocking form that parks the
//! calling thread and a suspending form. Scenario tests are written once
//! against [`Driver`] and executed under both.

use std::time::Duration;

use bytes::Bytes;
use tether_binder::{BinderError, BinderRequestContext, MaskingMode, Receive, Result};
use tokio::task::JoinError;

use crate::harness::MockBinder;
use crate::mock::MockChannel;

/// Execution model used to call into a binder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// Blocking calls, each on its own `spawn_blocking` thread.
    Blocking,
    /// Suspending calls awaited on the runtime.
    Suspending,
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    result.unwrap_or_else(|e| {
        Err(BinderError::Fatal {
            reason: format!("driver task failed: {}", e),
        })
    })
}

impl Driver {
    /// Both execution models.
    pub const ALL: [Driver; 2] = [Driver::Blocking, Driver::Suspending];

    pub async fn open(self, binder: &MockBinder) -> Result<()> {
        match self {
            Driver::Blocking => {
                let binder = binder.clone();
                joined(tokio::task::spawn_blocking(move || binder.open()).await)
            }
            Driver::Suspending => binder.open_async().await,
        }
    }

    pub async fn send(self, binder: &MockBinder, payload: Bytes, timeout: Duration) -> Result<()> {
        self.send_masked(binder, payload, timeout, binder.default_masking_mode())
            .await
    }

    pub async fn send_masked(
        self,
        binder: &MockBinder,
        payload: Bytes,
        timeout: Duration,
        mask: MaskingMode,
    ) -> Result<()> {
        match self {
            Driver::Blocking => {
                let binder = binder.clone();
                joined(
                    tokio::task::spawn_blocking(move || binder.send_masked(&payload, timeout, mask))
                        .await,
                )
            }
            Driver::Suspending => binder.send_masked_async(&payload, timeout, mask).await,
        }
    }

    pub async fn try_receive(
        self,
        binder: &MockBinder,
        timeout: Duration,
    ) -> Result<Receive<BinderRequestContext<MockChannel>>> {
        match self {
            Driver::Blocking => {
                let binder = binder.clone();
                joined(tokio::task::spawn_blocking(move || binder.try_receive(timeout)).await)
            }
            Driver::Suspending => binder.try_receive_async(timeout).await,
        }
    }

    pub async fn close(self, binder: &MockBinder, timeout: Duration) -> Result<()> {
        match self {
            Driver::Blocking => {
                let binder = binder.clone();
                joined(tokio::task::spawn_blocking(move || binder.close(timeout)).await)
            }
            Driver::Suspending => binder.close_async(timeout).await,
        }
    }

    /// True when the in-flight count reached zero within `timeout`.
    pub async fn wait_for_pending(self, binder: &MockBinder, timeout: Duration) -> bool {
        match self {
            Driver::Blocking => {
                let binder = binder.clone();
                tokio::task::spawn_blocking(move || binder.wait_for_pending_operations(timeout))
                    .await
                    .unwrap_or(false)
            }
            Driver::Suspending => binder.wait_for_pending_operations_async(timeout).await,
        }
    }
}
