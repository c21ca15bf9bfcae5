// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application code.
//!
//! Everything here is deliberately small and `Copy`: these are the types
//! that cross the boundary between kernel internals, the public object API,
//! and host-side tooling.

#![no_std]

use serde::{Deserialize, Serialize};

/// Names a particular incarnation of a thread.
///
/// A `ThreadId` combines two fields, a table index (stable for the life of
/// the thread slot) and a generation number. The generation is incremented
/// whenever a slot is recycled for a new thread, so a stale handle held
/// after `join`/`detach` reclaims the slot can be detected instead of
/// silently naming an unrelated thread.
///
/// The index is in the lower `ThreadId::INDEX_BITS` bits, the generation in
/// the remaining top bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ThreadId(pub u16);

impl ThreadId {
    /// Number of bits of a `ThreadId` used for the table index. Thread
    /// tables larger than `1 << INDEX_BITS` slots are not representable.
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

/// Type used to track slot-reuse generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
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

/// Scheduling priority of a thread.
///
/// Priorities are small numbers; numerically *larger* values are more
/// important. `Priority::NONE` (zero) is reserved for threads that are not
/// schedulable at all (not yet started, or terminated).
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means more important
/// or less. Use `is_more_important_than`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Reserved for unschedulable threads.
    pub const NONE: Self = Self(0);
    /// The idle thread, and nothing else, runs here.
    pub const IDLE: Self = Self(1);
    pub const LOW: Self = Self(2);
    pub const BELOW_NORMAL: Self = Self(3);
    /// Default for application threads.
    pub const NORMAL: Self = Self(4);
    pub const ABOVE_NORMAL: Self = Self(5);
    pub const HIGH: Self = Self(6);
    /// Highest schedulable level; the timer servicing thread runs here.
    pub const REALTIME: Self = Self(7);

    /// Number of distinct priority levels, `NONE` included. The dispatcher
    /// sizes its per-level bookkeeping from this.
    pub const LEVELS: usize = 8;

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Checks whether this value names a real, schedulable level.
    pub fn is_schedulable(self) -> bool {
        self != Self::NONE && (self.0 as usize) < Self::LEVELS
    }
}

/// Current position of a thread in its lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum ThreadState {
    /// Slot exists but the thread has not been admitted to the scheduler.
    /// This is also the state of an unused table slot.
    #[default]
    Inactive,
    /// On the ready set, waiting for the dispatcher to pick it.
    Ready,
    /// Currently executing. At most one thread is in this state.
    Running,
    /// Parked on a wait queue, the delay queue, or both; or explicitly
    /// suspended.
    Suspended,
    /// Finished. The exit value is retained until joined or detached.
    Terminated,
}

/// The outcome tag delivered to a thread when a wait ends.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub enum WakeReason {
    /// The condition the thread was waiting for arrived.
    #[default]
    Ok,
    /// The wait's deadline expired first.
    Timeout,
    /// The thread was interrupted (cancelled) while waiting.
    Interrupted,
}

/// Result codes used throughout the kernel and the object API.
///
/// `Ok` outcomes are expressed through `Result::Ok`; this enum only carries
/// the failure kinds, so `Result<(), Kind>` reads the way the taxonomy is
/// written.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Kind {
    /// Non-blocking variant could not proceed.
    WouldBlock,
    /// Timed variant's deadline expired.
    Timeout,
    /// Cancelled or signal-interrupted wait.
    Interrupted,
    /// Mutex self-lock in non-recursive mode, or self-join.
    Deadlock,
    /// Unlocking a mutex not held by the caller.
    NotOwner,
    /// Operation illegal in the current context (e.g. blocking from an
    /// ISR, or while holding the scheduler lock with no one else runnable).
    NotPermitted,
    /// Malformed argument: dead handle, misaligned pointer, stack too
    /// small, priority out of range.
    Invalid,
    /// Construction failed for lack of a free slot or stack memory.
    NoMemory,
    /// Semaphore post beyond its maximum, or counter wrap.
    Overflow,
    /// Robust mutex abandoned by a dead owner and never made consistent.
    NotRecoverable,
    /// First acquisition after a robust mutex's owner died; recoverable
    /// via `consistent`.
    OwnerDead,
}

impl Kind {
    /// Maps the kind onto the POSIX `errno` value a C-facing shim would
    /// report for it.
    pub fn errno(self) -> i32 {
        match self {
            Kind::WouldBlock => 11,      // EAGAIN
            Kind::Timeout => 110,        // ETIMEDOUT
            Kind::Interrupted => 4,      // EINTR
            Kind::Deadlock => 35,        // EDEADLK
            Kind::NotOwner => 1,         // EPERM
            Kind::NotPermitted => 1,     // EPERM
            Kind::Invalid => 22,         // EINVAL
            Kind::NoMemory => 12,        // ENOMEM
            Kind::Overflow => 75,        // EOVERFLOW
            Kind::NotRecoverable => 131, // ENOTRECOVERABLE
            Kind::OwnerDead => 130,      // EOWNERDEAD
        }
    }
}

impl core::fmt::Display for Kind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Kind::WouldBlock => "operation would block",
            Kind::Timeout => "timed out",
            Kind::Interrupted => "interrupted",
            Kind::Deadlock => "deadlock detected",
            Kind::NotOwner => "caller does not own the object",
            Kind::NotPermitted => "not permitted in this context",
            Kind::Invalid => "invalid argument",
            Kind::NoMemory => "out of memory",
            Kind::Overflow => "counter overflow",
            Kind::NotRecoverable => "state not recoverable",
            Kind::OwnerDead => "previous owner died",
        };
        f.write_str(s)
    }
}

/// Kernel result alias; the payload rides in `Ok`.
pub type Result<T> = core::result::Result<T, Kind>;

impl From<WakeReason> for Result<()> {
    /// Maps the end of a wait to the operation outcome: an `Ok` wake means
    /// the operation completed, the other reasons carry their own kinds.
    fn from(w: WakeReason) -> Self {
        match w {
            WakeReason::Ok => Ok(()),
            WakeReason::Timeout => Err(Kind::Timeout),
            WakeReason::Interrupted => Err(Kind::Interrupted),
        }
    }
}

bitflags::bitflags! {
    /// Boolean thread attributes.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
    #[repr(transparent)]
    pub struct ThreadFlags: u32 {
        /// No one will join this thread; its slot is reclaimed the moment
        /// it terminates.
        const DETACHED = 1 << 0;
        /// An interrupt (cancellation) has been requested and not yet
        /// consumed.
        const INTERRUPTED = 1 << 1;
        /// Thread was created by the kernel itself (idle, timer service);
        /// such threads may not be cancelled or joined by applications.
        const KERNEL = 1 << 2;
        /// The stack-base sentinel was found clobbered; the overflow hook
        /// has fired for this thread.
        const STACK_SMASHED = 1 << 3;
    }
}

/// Mask of per-thread signal bits available to applications. The top byte
/// is reserved for kernel protocols (`SIG_JOIN` and future use).
pub const SIG_USER_MASK: u32 = 0x00FF_FFFF;

/// Reserved signal bit raised on a terminating thread's join event; the
/// joiner waits for it.
pub const SIG_JOIN: u32 = 1 << 31;

/// Mask of event-flag bits available to applications; the top byte of each
/// group is reserved for system use.
pub const EVENT_USER_MASK: u32 = 0x00FF_FFFF;

/// How a signal or event-flag wait condition is evaluated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WaitMode {
    /// Satisfied when any requested bit is set.
    Any,
    /// Satisfied only when all requested bits are set.
    All,
}

impl WaitMode {
    /// Evaluates the condition for a desired mask against the currently
    /// raised bits.
    pub fn is_satisfied(self, raised: u32, desired: u32) -> bool {
        match self {
            WaitMode::Any => raised & desired != 0,
            WaitMode::All => raised & desired == desired,
        }
    }
}
