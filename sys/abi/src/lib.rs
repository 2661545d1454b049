// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and drivers.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Names a particular incarnation of a thread.
///
/// A `ThreadId` combines a slot index in the kernel's thread table with a
/// generation number. The generation is bumped when a slot is released and
/// reused, so a stale `ThreadId` held across a thread's death can be told
/// apart from the slot's new occupant.
///
/// The index is in the lower `ThreadId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ThreadId(pub u16);

impl ThreadId {
    /// Number of bits in a `ThreadId` used to represent the slot index. This
    /// must currently be 15 or smaller.
    pub const INDEX_BITS: u32 = 10;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `ThreadId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ThreadId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        const MASK: u16 = 0xFFFF << ThreadId::INDEX_BITS >> ThreadId::INDEX_BITS;
        Generation(self.0.wrapping_add(1) & MASK as u8)
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Indicates priority of a thread.
///
/// Numerically lower priorities are more important, so Priority 0 is the most
/// likely to be scheduled, followed by 1, and so forth. `Priority::IDLE` is
/// reserved for the kernel's idle thread.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically greater /
/// less important, or more important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Least important priority, held only by the idle thread.
    pub const IDLE: Self = Self(u8::MAX);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Scheduler state of a thread slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum SchedState {
    /// Slot is unused and may be handed out by thread creation.
    #[default]
    Free,
    /// Thread could be scheduled on the CPU.
    Ready,
    /// Thread is the one currently on the CPU.
    Running,
    /// Thread is parked in a device wait slot until an interrupt resumes it
    /// or its timeout expires.
    Suspended,
    /// Thread is waiting for its timer and nothing else.
    Sleeping,
    /// Thread has exited; the slot can be released.
    Final,
}

impl SchedState {
    /// Checks whether a thread in this state is blocked and may be made ready
    /// by a wakeup or by its timer.
    pub fn is_waiting(self) -> bool {
        matches!(self, SchedState::Suspended | SchedState::Sleeping)
    }
}

/// Result code deposited in a thread by whoever makes it ready.
///
/// The meaning of non-negative values is defined per blocking call site; the
/// negative values below are reserved by the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ReadyMsg(pub i32);

impl ReadyMsg {
    /// Normal wakeup.
    pub const OK: Self = Self(0);
    /// Wakeup caused by a timeout condition.
    pub const TIMEOUT: Self = Self(-1);
    /// Wakeup caused by a reset or failure of the awaited operation.
    pub const RESET: Self = Self(-2);
}

impl Default for ReadyMsg {
    fn default() -> Self {
        Self::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_packs_index_and_generation() {
        let id = ThreadId::for_index_and_gen(5, Generation::from(3));
        assert_eq!(id.index(), 5);
        assert_eq!(id.generation(), Generation::from(3));
    }

    #[test]
    fn generation_wraps_within_its_field() {
        let mut g = Generation::ZERO;
        for _ in 0..64 {
            g = g.next();
        }
        assert_eq!(g, Generation::ZERO);
    }

    #[test]
    fn priority_compares_by_importance() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority(1).is_more_important_than(Priority(1)));
        assert!(Priority(7).is_more_important_than(Priority::IDLE));
    }
}
