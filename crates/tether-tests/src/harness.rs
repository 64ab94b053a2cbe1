//! Scenario fixture: a binder over a [`MockSource`] plus its event stream.

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use tether_binder::{BinderConfig, BinderEvent, MetricsSnapshot, ReliableBinder};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::mock::{MockChannel, MockSource, MockStats};

/// Binder type exercised by every scenario.
pub type MockBinder = ReliableBinder<MockChannel>;

/// Installs a test-writer subscriber once per process. `RUST_LOG` selects
/// the verbosity.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::from_default_env())
            .try_init();
    });
}

/// Transport and binder counters captured at one point of a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub created: usize,
    pub opens: usize,
    pub open_failures: usize,
    pub sends: usize,
    pub closes: usize,
    pub aborts: usize,
    pub faults: usize,
    pub active_operations: usize,
    pub metrics: MetricsSnapshot,
}

impl ScenarioReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub struct Fixture {
    pub source: Arc<MockSource>,
    pub binder: MockBinder,
    pub events: UnboundedReceiver<BinderEvent>,
}

impl Fixture {
    pub fn new(config: BinderConfig) -> anyhow::Result<Self> {
        init_tracing();
        let source = MockSource::new();
        let binder = ReliableBinder::new(source.clone(), config).context("building binder")?;
        let events = binder.subscribe();
        Ok(Self {
            source,
            binder,
            events,
        })
    }

    /// A fixture with the default configuration, already opened.
    pub fn opened() -> anyhow::Result<Self> {
        let fixture = Self::new(BinderConfig::default())?;
        fixture.binder.open().context("opening binder")?;
        Ok(fixture)
    }

    /// Events published so far, without waiting.
    pub fn drain_events(&mut self) -> Vec<BinderEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn report(&self) -> ScenarioReport {
        let stats = self.source.stats();
        ScenarioReport {
            created: MockStats::get(&stats.created),
            opens: MockStats::get(&stats.opens),
            open_failures: MockStats::get(&stats.open_failures),
            sends: MockStats::get(&stats.sends),
            closes: MockStats::get(&stats.closes),
            aborts: MockStats::get(&stats.aborts),
            faults: MockStats::get(&stats.faults),
            active_operations: self.binder.active_operations(),
            metrics: self.binder.metrics(),
        }
    }

    /// Polls until `active` operations hold the channel or `timeout` passes.
    pub async fn await_active(&self, active: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        while self.binder.active_operations() != active {
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "expected {} active operations, report {}",
                    active,
                    self.report().to_json()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }
}

/// Polls `check` until it holds or `timeout` passes. Retirement of a channel
/// by a suspending caller completes on a spawned task, so tests observe it
/// eventually rather than on return.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
