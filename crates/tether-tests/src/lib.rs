//! Tether Test & Validation Infrastructure
//!
//! Scriptable mock transports, a driver that runs each binder operation in
//! either execution model, randomized fault injection, and the scenario and
//! property suites built on them.

pub mod chaos;
pub mod driver;
pub mod harness;
pub mod mock;
pub mod proptest_binder;

pub use chaos::FaultInjector;
pub use driver::Driver;
pub use harness::{eventually, init_tracing, Fixture, MockBinder, ScenarioReport};
pub use mock::{Gate, MockChannel, MockPlan, MockRequest, MockSource, MockStats};
pub use proptest_binder::{apply, binder_op_strategy, BinderOp};
