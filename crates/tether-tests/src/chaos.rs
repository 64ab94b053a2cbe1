//! Randomized fault injection against the channels of a [`MockSource`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::mock::MockSource;

/// Faults the newest channel of a source with a fixed probability per tick.
/// Seeded so a failing run can be replayed.
#[derive(Debug)]
pub struct FaultInjector {
    rng: Mutex<StdRng>,
    probability: f64,
    injected: AtomicUsize,
    stopped: AtomicBool,
}

impl FaultInjector {
    pub fn seeded(seed: u64, probability: f64) -> Arc<Self> {
        Arc::new(Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            probability: probability.clamp(0.0, 1.0),
            injected: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    /// Faults that actually moved an opened channel to `Faulted`.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    /// One roll of the dice. Returns `true` when a channel was faulted.
    pub fn tick(&self, source: &MockSource) -> bool {
        let roll = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(self.probability);
        if !roll {
            return false;
        }
        let Some(channel) = source.latest() else {
            return false;
        };
        if channel.fault() {
            self.injected.fetch_add(1, Ordering::SeqCst);
            debug!(channel = channel.id(), "injected channel fault");
            true
        } else {
            false
        }
    }

    /// Ticks every `interval` until [`FaultInjector::stop`].
    pub fn spawn(self: &Arc<Self>, source: Arc<MockSource>, interval: Duration) -> JoinHandle<()> {
        let injector = Arc::clone(self);
        tokio::spawn(async move {
            while !injector.stopped.load(Ordering::SeqCst) {
                injector.tick(&source);
                tokio::time::sleep(interval).await;
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_binder::{Channel, ChannelSource};

    #[test]
    fn test_zero_probability_never_faults() {
        let source = MockSource::new();
        let injector = FaultInjector::seeded(7, 0.0);
        for _ in 0..100 {
            assert!(!injector.tick(&source));
        }
        assert_eq!(injector.injected(), 0);
    }

    #[test]
    fn test_certain_fault_only_hits_opened_channels() {
        let source = MockSource::new();
        let injector = FaultInjector::seeded(7, 1.0);
        assert!(!injector.tick(&source));

        let channel = source.try_get_channel(Duration::ZERO).unwrap().unwrap();
        assert!(!injector.tick(&source));
        channel.open(Duration::from_secs(1)).unwrap();
        assert!(injector.tick(&source));
        assert!(!injector.tick(&source));
        assert_eq!(injector.injected(), 1);
    }
}
