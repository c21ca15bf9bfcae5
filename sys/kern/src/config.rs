// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time kernel configuration.
//!
//! These constants are the embedder-editable knobs. Boot-time parameters
//! (entry point, hooks, externally supplied stacks) travel in
//! [`crate::startup::KernelDescriptor`] instead.

use abi::{Priority, ThreadId};
use static_assertions::const_assert;

/// Capacity of the thread table, kernel threads (idle, timer service)
/// included. Thread creation fails with `NoMemory` once every slot is in
/// use.
pub const MAX_THREADS: usize = 16;

/// Capacity of the software-timer table.
pub const MAX_TIMERS: usize = 8;

/// Tick source frequency, in Hz. One tick is the basic unit of every
/// timeout and delay.
pub const TICK_HZ: u32 = 1000;

/// Enables tick-driven preemption. With this off, context switches happen
/// only at explicit suspension points (yield, blocking calls).
pub const PREEMPTION: bool = true;

/// Enables round-robin rotation among equal-priority threads on each tick.
/// Off by default: within a priority level, scheduling is strictly FIFO.
pub const TIME_SLICING: bool = false;

/// Pattern used to fill fresh stacks, and the sentinel checked at the
/// stack base for overflow detection.
pub const STACK_FILL_MAGIC: u32 = 0xEFBE_ADDE;

/// Smallest stack we will accept for a new thread, in 8-byte words. Below
/// this even the initial exception frame doesn't reliably fit.
pub const MIN_STACK_WORDS: usize = 32;

/// Stack of the implicit main thread, in 8-byte words.
pub const MAIN_STACK_WORDS: usize = 512;

/// Idle thread stack, in 8-byte words.
pub const IDLE_STACK_WORDS: usize = 64;

/// Timer-service thread stack, in 8-byte words. Timer callbacks run on
/// this stack; size it for the worst callback.
pub const TIMER_STACK_WORDS: usize = 256;

/// Interrupt priority (in ARM NVIC encoding, lower value = more urgent)
/// above which interrupts stay enabled inside kernel critical sections.
/// Handlers running above this threshold must not call into the kernel.
pub const CRITICAL_SECTION_THRESHOLD: u8 = 0x40;

/// Priority of the timer-service thread.
pub const TIMER_THREAD_PRIORITY: Priority = Priority::REALTIME;

// The table must be indexable by the id type, and the id type reserves
// value space for generations.
const_assert!(MAX_THREADS <= ThreadId::INDEX_MASK as usize);
const_assert!(MAX_THREADS >= 3); // idle + timer service + main
const_assert!(MAX_TIMERS <= u8::MAX as usize);
const_assert!(IDLE_STACK_WORDS >= MIN_STACK_WORDS);
const_assert!(TIMER_STACK_WORDS >= MIN_STACK_WORDS);
const_assert!(MAIN_STACK_WORDS >= MIN_STACK_WORDS);
