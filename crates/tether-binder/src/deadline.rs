//! Deadline budgets for multi-step operations.
//!
//! A binder operation waits for a channel, perhaps opens it, and then runs the
//! transport call. Every one of those steps draws from the same [`Deadline`],
//! so the caller's original timeout bounds the whole sequence.

use std::time::{Duration, Instant};

use crate::error::{BinderError, Result};

/// A monotonic time budget started at construction.
///
/// `Duration::MAX` (or any timeout that overflows `Instant`) is an infinite
/// budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    timeout: Duration,
    expiry: Option<Instant>,
}

impl Deadline {
    /// Starts a budget of `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            expiry: Instant::now().checked_add(timeout),
        }
    }

    /// A budget that never expires.
    pub fn infinite() -> Self {
        Self {
            timeout: Duration::MAX,
            expiry: None,
        }
    }

    /// The timeout this budget was created with.
    pub fn original_timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns `true` when the budget can never expire.
    pub fn is_infinite(&self) -> bool {
        self.expiry.is_none()
    }

    /// Remaining time, saturating at zero; `Duration::MAX` when infinite.
    pub fn remaining(&self) -> Duration {
        match self.expiry {
            Some(expiry) => expiry.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Returns `true` once no time is left.
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => Instant::now() >= expiry,
            None => false,
        }
    }

    /// The timeout error for `operation` measured against the original budget.
    pub fn timeout_error(&self, operation: &'static str) -> BinderError {
        BinderError::timeout(operation, self.timeout)
    }

    /// Fails with a timeout error once the budget is spent.
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.is_expired() {
            return Err(self.timeout_error(operation));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[test]
    fn test_deadline_new() {
        let deadline = Deadline::new(Duration::from_secs(5));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() > Duration::from_secs(4));
        assert_eq!(deadline.original_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_deadline_zero_is_expired() {
        let deadline = Deadline::new(Duration::ZERO);
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_deadline_max_is_infinite() {
        let deadline = Deadline::new(Duration::MAX);
        assert!(deadline.is_infinite());
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::MAX);
        assert!(Deadline::infinite().check("send").is_ok());
    }

    #[tokio::test]
    async fn test_deadline_remaining_shrinks() {
        let deadline = Deadline::new(Duration::from_millis(200));
        let first = deadline.remaining();
        sleep(Duration::from_millis(20)).await;
        let second = deadline.remaining();
        assert!(second < first);
    }

    #[test]
    fn test_check_expired_reports_original_timeout() {
        let deadline = Deadline::new(Duration::ZERO);
        match deadline.check("open") {
            Err(BinderError::Timeout { operation, timeout_ms }) => {
                assert_eq!(operation, "open");
                assert_eq!(timeout_ms, 0);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
