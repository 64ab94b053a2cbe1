//! Property-based tests: random operation sequences against one binder.

use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tether_binder::Result;

use crate::harness::Fixture;

/// One step of a generated sequence.
#[derive(Debug, Clone)]
pub enum BinderOp {
    Send(u8),
    Receive,
    /// Deliver a message to the newest channel.
    Push(u8),
    /// The peer ends the stream of the newest channel.
    EndStream,
    /// Fault the newest channel if it is open.
    Fault,
}

pub fn binder_op_strategy() -> impl Strategy<Value = BinderOp> {
    prop_oneof![
        4 => any::<u8>().prop_map(BinderOp::Send),
        2 => Just(BinderOp::Receive),
        2 => any::<u8>().prop_map(BinderOp::Push),
        1 => Just(BinderOp::EndStream),
        2 => Just(BinderOp::Fault),
    ]
}

/// Applies `op` with blocking calls.
pub fn apply(fixture: &Fixture, op: &BinderOp, timeout: Duration) -> Result<()> {
    match op {
        BinderOp::Send(byte) => fixture.binder.send(&Bytes::from(vec![*byte]), timeout),
        BinderOp::Receive => fixture.binder.try_receive(timeout).map(|_| ()),
        BinderOp::Push(byte) => {
            if let Some(channel) = fixture.source.latest() {
                channel.push_message(Bytes::from(vec![*byte]));
            }
            Ok(())
        }
        BinderOp::EndStream => {
            if let Some(channel) = fixture.source.latest() {
                channel.end_stream();
            }
            Ok(())
        }
        BinderOp::Fault => {
            if let Some(channel) = fixture.source.latest() {
                channel.fault();
            }
            Ok(())
        }
    }
}
