// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The wait-queue primitive that every blocking object is built on.
//!
//! A [`WaitList`] is a priority-ordered set of parked threads, embedded in
//! each synchronization object. Threads enter it through [`WaitList::park`]
//! and leave through wake-one/wake-all, cancellation, or a timeout
//! delivered by the tick handler. Wakes are delivered in
//! priority-descending order, FIFO among equals.
//!
//! # The back-pointer
//!
//! A parked thread records the address of the list it sits in, so that
//! paths which find the thread first (timeout, cancellation, priority
//! change) can find the list second. That address stays valid for the whole
//! wait because the blocking API takes `&'static self` on the owning
//! object: the object can neither move nor drop while any thread is inside
//! a call on it. All reads and writes through the pointer happen inside the
//! kernel critical section.

use core::ptr::NonNull;

use abi::{Kind, Priority, WakeReason};

use crate::arch;
use crate::config;
use crate::sched::Kernel;
use crate::startup::with_kernel;

/// Outcome of the in-critical-section phase of a blocking call: either the
/// operation finished immediately, or the caller has been parked and must
/// collect its wake reason after it is resumed.
#[derive(Debug)]
pub(crate) enum Progress<T> {
    Done(T),
    Parked,
}

/// How long a blocking call is prepared to wait.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Deadline {
    /// Do not park; report `WouldBlock` instead.
    Poll,
    /// Park until woken.
    Forever,
    /// Park with a timeout, in ticks from now.
    After(u64),
}

impl Deadline {
    /// Maps a user-supplied tick count onto a deadline; zero is reserved
    /// for the polling variants.
    pub(crate) fn after(ticks: u64) -> Self {
        if ticks == 0 {
            Deadline::Poll
        } else {
            Deadline::After(ticks)
        }
    }

    /// Resolves to an absolute deadline for the delay queue.
    pub(crate) fn resolve(self, now: u64) -> Option<u64> {
        match self {
            Deadline::After(t) => Some(now + t),
            _ => None,
        }
    }

    pub(crate) fn is_poll(self) -> bool {
        matches!(self, Deadline::Poll)
    }
}

/// A priority-ordered list of parked threads with a count; see module docs.
pub(crate) struct WaitList {
    q: kerncore::PrioQueue<{ config::MAX_THREADS }>,
}

impl WaitList {
    pub const fn new() -> Self {
        Self {
            q: kerncore::PrioQueue::new(),
        }
    }

    /// Parks the running thread on this list, recording the back-pointer
    /// and an optional wake-up deadline, and requests a switch.
    ///
    /// Callers must have verified blocking is legal (see
    /// [`Kernel::begin_block`]).
    pub fn park(&mut self, k: &mut Kernel, deadline: Option<u64>) {
        let cur = k.current;
        let prio = k.threads[cur].priority.0;
        uassert!(self.q.insert(cur as u16, prio).is_ok());
        k.park_current(deadline);
        k.threads[cur].set_wait_queue(NonNull::from(&mut *self));
    }

    /// Removes the head (highest priority, longest waiting) and readies it
    /// with `reason`. Returns the thread index woken, if any.
    pub fn wake_one(
        &mut self,
        k: &mut Kernel,
        reason: WakeReason,
    ) -> Option<usize> {
        let (id, _) = self.q.pop()?;
        let idx = id as usize;
        k.threads[idx].clear_wait_queue();
        k.ready_thread(idx, reason);
        Some(idx)
    }

    /// Readies every member with `reason`; returns how many were woken.
    pub fn wake_all(&mut self, k: &mut Kernel, reason: WakeReason) -> usize {
        let mut n = 0;
        while self.wake_one(k, reason).is_some() {
            n += 1;
        }
        n
    }

    /// Peeks at the priority of the head waiter; used by priority
    /// inheritance.
    pub fn top_priority(&self) -> Option<Priority> {
        self.q.peek().map(|(_, p)| Priority(p))
    }

    pub fn waiters(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Copies the queued thread indexes, in wake order, into `out`.
    /// Returns the count. Used by event flags, which must re-evaluate each
    /// waiter's condition while waking some of them.
    pub fn snapshot(&self, out: &mut [u16; config::MAX_THREADS]) -> usize {
        let mut n = 0;
        for id in self.q.ids() {
            out[n] = id;
            n += 1;
        }
        n
    }

    /// Unlinks a parked thread from the list it recorded, on behalf of a
    /// path that reached the thread without going through the list
    /// (timeout, cancellation).
    ///
    /// # Safety
    ///
    /// `list` must be a pointer installed by [`WaitList::park`] for a
    /// thread that is still parked, and the caller must be inside the
    /// kernel critical section with no other live borrow of the list. The
    /// `&'static self` discipline on blocking calls keeps the pointee
    /// alive and in place.
    pub unsafe fn remove_parked(mut list: NonNull<WaitList>, idx: usize) {
        // Safety: per contract above.
        let list = unsafe { list.as_mut() };
        uassert!(list.q.remove(idx as u16));
    }

    /// Repositions a parked thread after a priority change, keeping the
    /// list ordered. New position is behind its new equals.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::remove_parked`].
    pub unsafe fn reprioritize_parked(
        mut list: NonNull<WaitList>,
        idx: usize,
        new: Priority,
    ) {
        // Safety: per contract above.
        let list = unsafe { list.as_mut() };
        uassert!(list.q.reprioritize(idx as u16, new.0));
    }
}

impl Kernel {
    /// Validates that the running thread may block right now: not in an
    /// interrupt handler, not holding the scheduler lock, and not already
    /// flagged for interruption (in which case the pending interruption is
    /// consumed and reported).
    pub(crate) fn begin_block(&mut self) -> abi::Result<()> {
        debug_assert!(!arch::in_isr(), "blocking call in interrupt context");
        if arch::in_isr() {
            return Err(Kind::NotPermitted);
        }
        if self.sched_lock > 0 {
            // Blocking with the dispatcher pinned cannot make progress;
            // report it rather than deadlocking the core.
            return Err(Kind::NotPermitted);
        }
        if self.take_interrupt(self.current) {
            return Err(Kind::Interrupted);
        }
        Ok(())
    }
}

/// Reads back the wake reason after a park, once the thread is running
/// again.
pub(crate) fn finish_block() -> WakeReason {
    with_kernel(|k, _| k.threads[k.current].wake_reason)
}

/// Maps the end of a park onto the conventional result: `Ok` for a
/// condition wake, errors for timeout and interruption.
pub(crate) fn block_result() -> abi::Result<()> {
    finish_block().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::testing::ready_kernel;
    use abi::ThreadState;

    /// Parks the current thread of `k` on `list` and dispatches the next.
    fn park_current(
        k: &mut Kernel,
        list: &mut WaitList,
        deadline: Option<u64>,
    ) -> usize {
        let parked = k.current;
        list.park(k, deadline);
        k.reschedule();
        parked
    }

    #[test]
    fn wake_order_is_priority_then_fifo() {
        let (mut k, _) = ready_kernel(&[
            ("n1", Priority::NORMAL),
            ("n2", Priority::NORMAL),
            ("hi", Priority::HIGH),
            ("idle", Priority::IDLE),
        ]);
        let mut list = WaitList::new();
        // hi runs first (highest), then n1, then n2.
        let hi = park_current(&mut k, &mut list, None);
        let n1 = park_current(&mut k, &mut list, None);
        let n2 = park_current(&mut k, &mut list, None);
        assert_eq!(list.waiters(), 3);
        assert_eq!(list.top_priority(), Some(Priority::HIGH));

        assert_eq!(list.wake_one(&mut k, WakeReason::Ok), Some(hi));
        assert_eq!(list.wake_one(&mut k, WakeReason::Ok), Some(n1));
        assert_eq!(list.wake_one(&mut k, WakeReason::Ok), Some(n2));
        assert_eq!(list.wake_one(&mut k, WakeReason::Ok), None);
    }

    #[test]
    fn woken_threads_are_ready_with_reason() {
        let (mut k, _) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut list = WaitList::new();
        let a = park_current(&mut k, &mut list, None);
        assert_eq!(k.threads[a].state, ThreadState::Suspended);

        let n = list.wake_all(&mut k, WakeReason::Interrupted);
        assert_eq!(n, 1);
        assert_eq!(k.threads[a].state, ThreadState::Ready);
        assert_eq!(k.threads[a].wake_reason, WakeReason::Interrupted);
        assert!(list.is_empty());
    }

    #[test]
    fn cancel_path_unlinks_via_back_pointer() {
        let (mut k, _) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut list = WaitList::new();
        let a = park_current(&mut k, &mut list, None);
        // `wake` reaches the thread first and the list through the
        // recorded pointer.
        assert!(k.wake(a, WakeReason::Interrupted));
        assert!(list.is_empty());
        assert_eq!(k.threads[a].wake_reason, WakeReason::Interrupted);
    }

    #[test]
    fn timed_park_registers_and_clears_deadline() {
        let (mut k, _) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut list = WaitList::new();
        let a = park_current(&mut k, &mut list, Some(40));
        assert!(k.delay.contains(a as u16));
        // A normal wake must cancel the timeout registration.
        assert_eq!(list.wake_one(&mut k, WakeReason::Ok), Some(a));
        assert!(!k.delay.contains(a as u16));
    }

    #[test]
    fn begin_block_reports_scheduler_lock() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        k.sched_lock = 1;
        assert_eq!(k.begin_block(), Err(Kind::NotPermitted));
        k.sched_lock = 0;
        assert_eq!(k.begin_block(), Ok(()));
    }

    #[test]
    fn begin_block_consumes_pending_interrupt() {
        let (mut k, a) = ready_kernel(&[("a", Priority::NORMAL)]);
        k.threads[a].flags |= abi::ThreadFlags::INTERRUPTED;
        assert_eq!(k.begin_block(), Err(Kind::Interrupted));
        // Consumed: the next attempt proceeds.
        assert_eq!(k.begin_block(), Ok(()));
    }
}
