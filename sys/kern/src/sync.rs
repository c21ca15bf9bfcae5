// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The synchronization-object layer.
//!
//! Every object here follows one construction: a state struct holding a
//! [`crate::wait::WaitList`] plus the object's own fields, kept in a
//! [`crate::lock::KCell`], with thin public wrappers that enter the kernel
//! critical section, run a state-machine step, and -- when the step parked
//! the caller -- collect the wake reason once the thread runs again.
//!
//! Operations documented as "blocks" take `&'static self`: a thread's
//! borrow of the object spans its whole wait, which both matches how these
//! objects are used (shared, long-lived) and is what makes the wait-queue
//! back-pointers sound. Non-parking operations (`try_*`, posts, getters)
//! take `&self` and the posting flavors are interrupt-safe.

pub mod condvar;
pub mod evflags;
pub mod mempool;
pub mod mqueue;
pub mod mutex;
pub mod semaphore;

pub use condvar::Condvar;
pub use evflags::EventFlags;
pub use mempool::Pool;
pub use mqueue::MsgQueue;
pub use mutex::{Mutex, MutexKind, Protocol, Robustness};
pub use semaphore::Semaphore;
