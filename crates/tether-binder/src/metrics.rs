//! Binder lifecycle counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Point-in-time copy of [`BinderMetrics`].
pub struct MetricsSnapshot {
    /// Channel instances that reached the opened state.
    pub channels_opened: u64,
    /// Channel instances closed or aborted by the synchronizer.
    pub channels_retired: u64,
    /// Leader attempts that failed to obtain or open a channel.
    pub open_failures: u64,
    /// Successful channel acquisitions.
    pub acquisitions: u64,
    /// Channel releases.
    pub releases: u64,
    /// Channel faults absorbed by the fault tolerance policy.
    pub tolerated_faults: u64,
    /// Times the binder itself faulted.
    pub binder_faults: u64,
    /// Errors swallowed or rerouted by a masking mode.
    pub masked_exceptions: u64,
    /// Queued waiters whose deadline expired.
    pub waiter_timeouts: u64,
}

/// Thread-safe counters shared by a binder and its synchronizer.
#[derive(Default)]
pub struct BinderMetrics {
    channels_opened: AtomicU64,
    channels_retired: AtomicU64,
    open_failures: AtomicU64,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    tolerated_faults: AtomicU64,
    binder_faults: AtomicU64,
    masked_exceptions: AtomicU64,
    waiter_timeouts: AtomicU64,
}

impl std::fmt::Debug for BinderMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinderMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl BinderMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_channels_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_channels_retired(&self) {
        self.channels_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_open_failures(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_acquisitions(&self, n: u64) {
        self.acquisitions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc_releases(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_tolerated_faults(&self) {
        self.tolerated_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_binder_faults(&self) {
        self.binder_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_masked_exceptions(&self) {
        self.masked_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_waiter_timeouts(&self) {
        self.waiter_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_retired: self.channels_retired.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            tolerated_faults: self.tolerated_faults.load(Ordering::Relaxed),
            binder_faults: self.binder_faults.load(Ordering::Relaxed),
            masked_exceptions: self.masked_exceptions.load(Ordering::Relaxed),
            waiter_timeouts: self.waiter_timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        assert_eq!(BinderMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = BinderMetrics::new();
        metrics.add_acquisitions(5);
        metrics.inc_releases();
        metrics.inc_releases();
        metrics.inc_channels_opened();
        metrics.inc_tolerated_faults();
        let snap = metrics.snapshot();
        assert_eq!(snap.acquisitions, 5);
        assert_eq!(snap.releases, 2);
        assert_eq!(snap.channels_opened, 1);
        assert_eq!(snap.tolerated_faults, 1);
        assert_eq!(snap.binder_faults, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = BinderMetrics::new();
        metrics.inc_masked_exceptions();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"masked_exceptions\":1"));
    }
}
