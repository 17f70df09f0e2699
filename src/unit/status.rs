//! Lifecycle status, capability flags and stable unit handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Lifecycle status
// ============================================================================

/// Lifecycle state of a unit.
///
/// Ordered so that `Idle < Ready < Streaming`; stepping toward a target
/// moves one state at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnitStatus {
    /// No resources held, no format bound.
    #[default]
    Idle,
    /// Format bound and resources acquired.
    Ready,
    /// Producing or consuming frames.
    Streaming,
}

impl UnitStatus {
    /// Lowercase name, used in logs and errors.
    pub const fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Idle => "idle",
            UnitStatus::Ready => "ready",
            UnitStatus::Streaming => "streaming",
        }
    }

    /// Returns true if a format is bound in this state.
    #[inline]
    pub const fn has_format(&self) -> bool {
        !matches!(self, UnitStatus::Idle)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusChange {
    /// Unit that changed.
    pub unit: UnitHandle,
    /// Previous status.
    pub from: UnitStatus,
    /// New status.
    pub to: UnitStatus,
}

impl StatusChange {
    /// Returns true for the Idle to Ready transition that re-binds a format.
    #[inline]
    pub fn is_reinit(&self) -> bool {
        self.from == UnitStatus::Idle && self.to == UnitStatus::Ready
    }
}

// ============================================================================
// Capability flags
// ============================================================================

/// How a unit signals that it can produce a frame, plus rendering capability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct UnitFlags(u32);

impl UnitFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Unit exposes a pollable descriptor.
    pub const DESCRIPTOR_EVENT: Self = Self(1 << 0);
    /// Unit exposes an absolute next-event time.
    pub const TIMER_EVENT: Self = Self(1 << 1);
    /// Unit can draw itself with a graphics collaborator.
    pub const RENDERS_GRAPHICS: Self = Self(1 << 2);

    /// Check if a flag is set.
    #[inline]
    pub const fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Set a flag.
    #[inline]
    pub const fn insert(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    /// Clear a flag.
    #[inline]
    pub const fn remove(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }

    /// Combine flags using bitwise OR.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Raw bit pattern.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from a raw bit pattern, dropping unknown bits.
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0b111)
    }
}

impl std::ops::BitOr for UnitFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Process-unique, stable identity of a unit instance.
///
/// Input edges are stored as handles and resolved through the owning chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitHandle(u64);

impl UnitHandle {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
