// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Critical sections and the cooperative scheduler lock.
//!
//! Two layered mechanisms protect kernel state:
//!
//! - The **interrupt critical section**, entered exclusively through the
//!   `critical-section` crate (the port supplies the implementation; see
//!   `arch`). It masks kernel-managed interrupts, nests, and its RAII
//!   closure form guarantees release on every exit path.
//! - The **scheduler lock**, which is cooperative: it prevents the
//!   dispatcher from switching threads while leaving interrupts running.
//!   Switch requests accumulated while locked are honored at unlock.

use core::cell::{RefCell, RefMut};
use core::marker::PhantomData;

use critical_section::CriticalSection;

use crate::arch;
use crate::startup::with_kernel;

/// Interior-mutability cell for synchronization-object state.
///
/// Access requires a critical-section token, which the object wrappers get
/// from `with_kernel`; the `RefCell` turns any accidental reentrant borrow
/// into a loud panic instead of aliasing.
pub(crate) struct KCell<T> {
    inner: critical_section::Mutex<RefCell<T>>,
}

impl<T> KCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: critical_section::Mutex::new(RefCell::new(value)),
        }
    }

    pub fn borrow_mut<'cs>(
        &'cs self,
        cs: CriticalSection<'cs>,
    ) -> RefMut<'cs, T> {
        self.inner.borrow_ref_mut(cs)
    }
}

/// RAII witness of the scheduler being locked by the current thread.
///
/// While at least one of these exists, the dispatcher will not switch away
/// from the current thread; interrupts (and their wakeups) still run, and
/// any switch they request is performed when the last guard drops.
///
/// The guard is deliberately `!Send`: a lock taken by one thread must be
/// released on that thread.
pub struct SchedulerLock {
    _not_send: PhantomData<*const ()>,
}

/// Suspends dispatching until the returned guard (and any nested guards)
/// are dropped.
pub fn scheduler_lock() -> SchedulerLock {
    with_kernel(|k, _| {
        k.sched_lock += 1;
    });
    SchedulerLock {
        _not_send: PhantomData,
    }
}

/// Checks whether the scheduler is currently locked.
pub fn is_scheduler_locked() -> bool {
    with_kernel(|k, _| k.sched_lock > 0)
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        with_kernel(|k, _| {
            uassert!(k.sched_lock > 0);
            k.sched_lock -= 1;
            if k.sched_lock == 0 && k.defer_switch {
                k.defer_switch = false;
                arch::pend_switch();
            }
        });
    }
}
