// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core scheduling containers, separated from the kernel so they can be
//! built and tested on the host.
//!
//! Everything in this crate is pure data-structure logic: no interrupts, no
//! globals, no architecture types. The kernel stores *indexes* in these
//! containers (thread table slots, message slots) rather than references,
//! which keeps the cyclic thread/queue/owner relationships out of the
//! ownership system entirely -- a container never keeps anything alive.
//!
//! All containers are fixed-capacity arrays parameterized by a const
//! generic, because the kernel bounds everything at compile time and cannot
//! allocate. Insertion is O(n) by shifting; for the table sizes involved
//! (tens of entries) that beats any pointer-chasing scheme on the small
//! cores we target, and it keeps the code entirely safe.

// Allow std-y things to be used in test. Note that this attribute is a bit
// of a trap for the programmer, because rust-analyzer by default seems to
// build things with test set. This means it's easy to introduce code
// incompatible with no_std without your editor hassling you about it.
// Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

mod deadline;
mod pqueue;
mod ring;

pub use deadline::DeadlineQueue;
pub use pqueue::{Full, PrioQueue};
pub use ring::MsgRing;
