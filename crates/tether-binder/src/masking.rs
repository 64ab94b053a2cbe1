//! Per-call exception masking and per-channel fault tolerance policies.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Bit flags deciding what happens to an error caught by a binder operation.
///
/// - `NONE`: every error is returned to the caller.
/// - `HANDLED`: handleable (communication/timeout) errors are swallowed; the
///   operation reports "no result" instead.
/// - `UNHANDLED`: non-handleable errors are published on the exception event
///   instead of being returned.
/// - `ALL`: both bits.
///
/// Fatal errors (protocol violations, programming errors) are never masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaskingMode(u8);

impl MaskingMode {
    /// Nothing is masked.
    pub const NONE: MaskingMode = MaskingMode(0x0);
    /// Handleable errors are swallowed.
    pub const HANDLED: MaskingMode = MaskingMode(0x1);
    /// Non-handleable errors are rerouted to the exception event.
    pub const UNHANDLED: MaskingMode = MaskingMode(0x2);
    /// Both bits set.
    pub const ALL: MaskingMode = MaskingMode(0x3);

    /// Returns the raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Builds a mode from raw bits, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL.0 == 0 {
            Some(MaskingMode(bits))
        } else {
            None
        }
    }

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: MaskingMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when the `HANDLED` bit is set.
    pub fn masks_handled(self) -> bool {
        self.contains(Self::HANDLED)
    }

    /// True when the `UNHANDLED` bit is set.
    pub fn masks_unhandled(self) -> bool {
        self.contains(Self::UNHANDLED)
    }
}

impl BitOr for MaskingMode {
    type Output = MaskingMode;

    fn bitor(self, rhs: MaskingMode) -> MaskingMode {
        MaskingMode(self.0 | rhs.0)
    }
}

/// Whether a fault of the underlying channel is absorbed (the channel is
/// transparently replaced) or escalated to fault the whole binder.
///
/// Evaluated once per channel instance, when that instance becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TolerateFaultsMode {
    /// Every channel fault faults the binder.
    Never,
    /// Faults are tolerated unless the channel carries a security session.
    IfNotSecuritySession,
    /// Faults are always tolerated.
    #[default]
    Always,
}
