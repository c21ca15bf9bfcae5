// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting and binary semaphores.
//!
//! `post` never queues a token past a waiter: when the wait queue is
//! non-empty the token is handed straight to the head waiter, which keeps
//! the count-vs-waiters invariant trivial (`count > 0` implies no
//! waiters).

use abi::{Kind, WakeReason};

use crate::lock::KCell;
use crate::sched::Kernel;
use crate::startup::with_kernel;
use crate::wait::{self, Deadline, Progress, WaitList};

pub(crate) struct SemState {
    count: u32,
    initial: u32,
    max: u32,
    queue: WaitList,
}

impl SemState {
    pub(crate) const fn new(initial: u32, max: u32) -> Self {
        assert!(max >= 1);
        assert!(initial <= max);
        Self {
            count: initial,
            initial,
            max,
            queue: WaitList::new(),
        }
    }

    /// Releases one token: hands it to the top waiter if there is one,
    /// otherwise increments the count, failing with `Overflow` at `max`.
    pub(crate) fn post(&mut self, k: &mut Kernel) -> abi::Result<()> {
        if self.queue.wake_one(k, WakeReason::Ok).is_some() {
            return Ok(());
        }
        if self.count >= self.max {
            return Err(Kind::Overflow);
        }
        self.count += 1;
        Ok(())
    }

    /// Acquires one token, or parks the caller per `deadline`.
    pub(crate) fn take(
        &mut self,
        k: &mut Kernel,
        deadline: Deadline,
    ) -> abi::Result<Progress<()>> {
        if self.count > 0 {
            self.count -= 1;
            return Ok(Progress::Done(()));
        }
        if deadline.is_poll() {
            return Err(Kind::WouldBlock);
        }
        k.begin_block()?;
        let until = deadline.resolve(k.ticks);
        self.queue.park(k, until);
        Ok(Progress::Parked)
    }

    /// Like `take` with an absolute deadline; used by the timer service.
    pub(crate) fn take_until(
        &mut self,
        k: &mut Kernel,
        deadline: u64,
    ) -> abi::Result<Progress<()>> {
        if self.count > 0 {
            self.count -= 1;
            return Ok(Progress::Done(()));
        }
        if deadline <= k.ticks {
            return Err(Kind::Timeout);
        }
        k.begin_block()?;
        self.queue.park(k, Some(deadline));
        Ok(Progress::Parked)
    }

    /// The classic semaphore "value": the count, or the waiter population
    /// negated when threads are parked.
    pub(crate) fn value(&self) -> isize {
        if self.queue.is_empty() {
            self.count as isize
        } else {
            -(self.queue.waiters() as isize)
        }
    }

    pub(crate) fn initial(&self) -> u32 {
        self.initial
    }
}

/// A counting (or, with `max == 1`, binary) semaphore.
pub struct Semaphore {
    state: KCell<SemState>,
}

impl Semaphore {
    pub const fn new(initial: u32, max: u32) -> Self {
        Self {
            state: KCell::new(SemState::new(initial, max)),
        }
    }

    /// A semaphore that only counts to one.
    pub const fn binary(initial: u32) -> Self {
        Self::new(initial, 1)
    }

    /// A semaphore with no practical upper bound.
    pub const fn counting(initial: u32) -> Self {
        Self::new(initial, u32::MAX)
    }

    /// Releases one token, waking the most important waiter if any.
    /// Interrupt-safe; fails with `Overflow` at the maximum.
    pub fn post(&self) -> abi::Result<()> {
        with_kernel(|k, cs| self.state.borrow_mut(cs).post(k))
    }

    /// Acquires a token without blocking; `WouldBlock` if none is
    /// available. Interrupt-safe.
    pub fn try_wait(&self) -> abi::Result<()> {
        match with_kernel(|k, cs| {
            self.state.borrow_mut(cs).take(k, Deadline::Poll)
        })? {
            Progress::Done(()) => Ok(()),
            // Poll never parks.
            Progress::Parked => Err(Kind::WouldBlock),
        }
    }

    /// Acquires a token, blocking as long as it takes.
    pub fn wait(&'static self) -> abi::Result<()> {
        self.wait_inner(Deadline::Forever)
    }

    /// Acquires a token, blocking for at most `ticks`. Zero ticks is the
    /// polling form.
    pub fn timed_wait(&'static self, ticks: u64) -> abi::Result<()> {
        self.wait_inner(Deadline::after(ticks))
    }

    fn wait_inner(&'static self, deadline: Deadline) -> abi::Result<()> {
        match with_kernel(|k, cs| self.state.borrow_mut(cs).take(k, deadline))?
        {
            Progress::Done(()) => Ok(()),
            Progress::Parked => wait::block_result(),
        }
    }

    /// Blocks until a token arrives or the absolute tick `deadline`
    /// passes. Kernel-internal; the timer service sleeps this way.
    pub(crate) fn wait_until(&'static self, deadline: u64) -> abi::Result<()> {
        match with_kernel(|k, cs| {
            self.state.borrow_mut(cs).take_until(k, deadline)
        })? {
            Progress::Done(()) => Ok(()),
            Progress::Parked => wait::block_result(),
        }
    }

    /// Current value: the token count, or minus the number of waiters.
    pub fn value(&self) -> isize {
        with_kernel(|_, cs| self.state.borrow_mut(cs).value())
    }

    /// The count this semaphore was created with.
    pub fn initial(&self) -> u32 {
        with_kernel(|_, cs| self.state.borrow_mut(cs).initial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::thread::testing::ready_kernel;
    use abi::{Priority, ThreadState};

    fn poll(s: &mut SemState, k: &mut Kernel) -> abi::Result<()> {
        match s.take(k, Deadline::Poll)? {
            Progress::Done(()) => Ok(()),
            Progress::Parked => unreachable!(),
        }
    }

    #[test]
    fn post_then_wait_completes_immediately() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut s = SemState::new(0, u32::MAX);
        s.post(&mut k).unwrap();
        assert!(matches!(
            s.take(&mut k, Deadline::Forever),
            Ok(Progress::Done(()))
        ));
    }

    #[test]
    fn conservation_of_tokens() {
        // count == initial + posts - successful takes, bounded by max.
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut s = SemState::new(2, 5);
        for _ in 0..3 {
            s.post(&mut k).unwrap();
        }
        assert_eq!(s.value(), 5);
        for _ in 0..4 {
            poll(&mut s, &mut k).unwrap();
        }
        assert_eq!(s.value(), 2 + 3 - 4);
    }

    #[test]
    fn post_at_max_overflows() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut s = SemState::new(1, 1);
        assert_eq!(s.post(&mut k), Err(Kind::Overflow));
        // The failed post changed nothing.
        assert_eq!(s.value(), 1);
    }

    #[test]
    fn empty_try_wait_would_block() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut s = SemState::new(0, 1);
        assert_eq!(poll(&mut s, &mut k), Err(Kind::WouldBlock));
    }

    #[test]
    fn post_hands_token_to_waiter() {
        let (mut k, waiter) = ready_kernel(&[
            ("w", Priority::NORMAL),
            ("poster", Priority::LOW),
        ]);
        let mut s = SemState::new(0, 1);
        assert!(matches!(
            s.take(&mut k, Deadline::Forever),
            Ok(Progress::Parked)
        ));
        k.reschedule();
        assert_eq!(s.value(), -1);

        // The (lower-priority) poster releases; the waiter gets the token
        // directly and the count stays at zero.
        s.post(&mut k).unwrap();
        assert_eq!(k.threads[waiter].state, ThreadState::Ready);
        assert_eq!(k.threads[waiter].wake_reason, WakeReason::Ok);
        assert_eq!(s.value(), 0);
        // And preemption was requested, since the waiter outranks us.
        assert!(arch::take_pending_switch());
    }

    #[test]
    fn isr_post_wakes_like_thread_post() {
        // Scenario: binary semaphore at zero, a thread parked in wait, a
        // simulated ISR posts. The thread must be runnable afterwards with
        // a switch requested so it runs on ISR exit.
        let (mut k, waiter) = ready_kernel(&[
            ("w", Priority::HIGH),
            ("bg", Priority::LOW),
        ]);
        let mut s = SemState::new(0, 1);
        assert!(matches!(
            s.take(&mut k, Deadline::Forever),
            Ok(Progress::Parked)
        ));
        k.reschedule();
        arch::take_pending_switch();

        arch::simulate_isr(true);
        s.post(&mut k).unwrap();
        arch::simulate_isr(false);

        assert_eq!(k.threads[waiter].state, ThreadState::Ready);
        assert!(arch::take_pending_switch());
        k.reschedule();
        assert_eq!(k.current, waiter);
    }

    #[test]
    fn timed_wait_expires_in_window() {
        // timed_wait(10) with no post: not woken before 10 ticks, woken
        // with Timeout at 10.
        let (mut k, waiter) = ready_kernel(&[
            ("w", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut s = SemState::new(0, 1);
        assert!(matches!(
            s.take(&mut k, Deadline::After(10)),
            Ok(Progress::Parked)
        ));
        k.reschedule();
        for _ in 0..9 {
            k.tick();
            assert_eq!(k.threads[waiter].state, ThreadState::Suspended);
        }
        k.tick();
        assert_eq!(k.threads[waiter].state, ThreadState::Ready);
        assert_eq!(k.threads[waiter].wake_reason, WakeReason::Timeout);
        // The timeout removed the waiter; a later post queues a token
        // instead of waking anyone.
        s.post(&mut k).unwrap();
        assert_eq!(s.value(), 1);
    }

    #[test]
    fn zero_tick_timed_wait_is_polling() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut s = SemState::new(0, 1);
        assert!(matches!(
            s.take(&mut k, Deadline::after(0)),
            Err(Kind::WouldBlock)
        ));
        // With a token available the polling form succeeds outright.
        s.post(&mut k).unwrap();
        assert!(matches!(
            s.take(&mut k, Deadline::after(0)),
            Ok(Progress::Done(()))
        ));
    }

    #[test]
    fn wake_order_is_priority_then_fifo() {
        let (mut k, hi) = ready_kernel(&[
            ("hi", Priority::HIGH),
            ("n1", Priority::NORMAL),
            ("n2", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut s = SemState::new(0, u32::MAX);
        // hi parks first; then n1; then n2.
        let mut park = |k: &mut Kernel, s: &mut SemState| {
            let who = k.current;
            assert!(matches!(
                s.take(k, Deadline::Forever),
                Ok(Progress::Parked)
            ));
            k.reschedule();
            who
        };
        assert_eq!(park(&mut k, &mut s), hi);
        let n1 = park(&mut k, &mut s);
        let n2 = park(&mut k, &mut s);

        let order: Vec<usize> = (0..3)
            .map(|_| {
                s.post(&mut k).unwrap();
                // Find who just became ready.
                k.ready.pop().map(|(id, _)| id as usize).unwrap()
            })
            .collect();
        assert_eq!(order, vec![hi, n1, n2]);
    }
}
