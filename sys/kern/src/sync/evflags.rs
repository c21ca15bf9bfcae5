// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event flag groups: a shared bitmask threads can wait on.
//!
//! Each waiter records what it wants (mask), how the condition combines
//! (`Any`/`All`), and whether satisfied bits are consumed on its behalf.
//! A raise walks the waiters in wake order, so with clear-on-wake the
//! most important waiter consumes first and later waiters see what's
//! left.
//!
//! The top byte of the group is reserved for system use; application
//! masks live in [`abi::EVENT_USER_MASK`].

use abi::{Kind, WaitMode, WakeReason, EVENT_USER_MASK};

use crate::config;
use crate::lock::KCell;
use crate::sched::Kernel;
use crate::startup::with_kernel;
use crate::wait::{self, Deadline, Progress, WaitList};

pub(crate) struct FlagsState {
    flags: u32,
    queue: WaitList,
}

impl FlagsState {
    pub(crate) const fn new() -> Self {
        Self {
            flags: 0,
            queue: WaitList::new(),
        }
    }

    /// ORs `bits` into the group and completes every wait whose condition
    /// now holds, consuming bits for clear-on-wake waiters as it goes.
    /// Returns the resulting flags.
    pub(crate) fn raise(
        &mut self,
        k: &mut Kernel,
        bits: u32,
    ) -> abi::Result<u32> {
        if bits == 0 || bits & !EVENT_USER_MASK != 0 {
            return Err(Kind::Invalid);
        }
        self.flags |= bits;

        // Waking mutates the queue, so walk a snapshot. Each waiter is
        // re-evaluated against the *current* flags: an earlier waiter's
        // clear-on-wake can withdraw a later waiter's bits.
        let mut ids = [0u16; config::MAX_THREADS];
        let n = self.queue.snapshot(&mut ids);
        for &id in &ids[..n] {
            let idx = id as usize;
            let (mask, mode, clear) = {
                let t = &k.threads[idx];
                (t.want_mask, t.want_mode, t.want_clear)
            };
            if mode.is_satisfied(self.flags, mask) {
                let observed = self.flags;
                if clear {
                    self.flags &= !mask;
                }
                k.threads[idx].wait_result = observed;
                // Unlinks from our queue through the back-pointer.
                uassert!(k.wake(idx, WakeReason::Ok));
            }
        }
        Ok(self.flags)
    }

    /// Completes immediately if the condition already holds; otherwise
    /// parks per `deadline`, recording the condition for `raise`.
    pub(crate) fn wait_step(
        &mut self,
        k: &mut Kernel,
        mask: u32,
        mode: WaitMode,
        clear: bool,
        deadline: Deadline,
    ) -> abi::Result<Progress<u32>> {
        if mask == 0 || mask & !EVENT_USER_MASK != 0 {
            return Err(Kind::Invalid);
        }
        if mode.is_satisfied(self.flags, mask) {
            let observed = self.flags;
            if clear {
                self.flags &= !mask;
            }
            return Ok(Progress::Done(observed));
        }
        if deadline.is_poll() {
            return Err(Kind::WouldBlock);
        }
        k.begin_block()?;
        let until = deadline.resolve(k.ticks);
        {
            let t = &mut k.threads[k.current];
            t.want_mask = mask;
            t.want_mode = mode;
            t.want_clear = clear;
        }
        self.queue.park(k, until);
        Ok(Progress::Parked)
    }

    /// ANDs out `bits`; returns the value before clearing.
    pub(crate) fn clear(&mut self, bits: u32) -> abi::Result<u32> {
        if bits & !EVENT_USER_MASK != 0 {
            return Err(Kind::Invalid);
        }
        let old = self.flags;
        self.flags &= !bits;
        Ok(old)
    }

    pub(crate) fn get(&self) -> u32 {
        self.flags
    }

    pub(crate) fn waiters(&self) -> usize {
        self.queue.waiters()
    }
}

/// A group of event flags.
pub struct EventFlags {
    state: KCell<FlagsState>,
}

impl EventFlags {
    pub const fn new() -> Self {
        Self {
            state: KCell::new(FlagsState::new()),
        }
    }

    /// Raises `bits` and wakes every satisfied waiter. Interrupt-safe.
    /// Returns the flags after the raise (and any consumption).
    pub fn raise(&self, bits: u32) -> abi::Result<u32> {
        with_kernel(|k, cs| self.state.borrow_mut(cs).raise(k, bits))
    }

    /// Clears `bits`; returns the value they had before.
    pub fn clear(&self, bits: u32) -> abi::Result<u32> {
        with_kernel(|_, cs| self.state.borrow_mut(cs).clear(bits))
    }

    /// Reads the current flags without waiting.
    pub fn get(&self) -> u32 {
        with_kernel(|_, cs| self.state.borrow_mut(cs).get())
    }

    /// Blocks until the flags satisfy `mask` under `mode`; `clear`
    /// consumes the requested bits. Returns the flags observed when the
    /// condition held.
    pub fn wait(
        &'static self,
        mask: u32,
        mode: WaitMode,
        clear: bool,
    ) -> abi::Result<u32> {
        self.wait_inner(mask, mode, clear, Deadline::Forever)
    }

    /// Non-blocking form of [`Self::wait`].
    pub fn try_wait(
        &self,
        mask: u32,
        mode: WaitMode,
        clear: bool,
    ) -> abi::Result<u32> {
        match with_kernel(|k, cs| {
            self.state
                .borrow_mut(cs)
                .wait_step(k, mask, mode, clear, Deadline::Poll)
        })? {
            Progress::Done(bits) => Ok(bits),
            Progress::Parked => Err(Kind::WouldBlock),
        }
    }

    /// Timed form of [`Self::wait`]. Zero ticks is the polling form.
    pub fn timed_wait(
        &'static self,
        mask: u32,
        mode: WaitMode,
        clear: bool,
        ticks: u64,
    ) -> abi::Result<u32> {
        self.wait_inner(mask, mode, clear, Deadline::after(ticks))
    }

    fn wait_inner(
        &'static self,
        mask: u32,
        mode: WaitMode,
        clear: bool,
        deadline: Deadline,
    ) -> abi::Result<u32> {
        match with_kernel(|k, cs| {
            self.state
                .borrow_mut(cs)
                .wait_step(k, mask, mode, clear, deadline)
        })? {
            Progress::Done(bits) => Ok(bits),
            Progress::Parked => {
                wait::block_result()?;
                Ok(with_kernel(|k, _| k.threads[k.current].wait_result))
            }
        }
    }

    /// Number of threads currently waiting on the group.
    pub fn waiters(&self) -> usize {
        with_kernel(|_, cs| self.state.borrow_mut(cs).waiters())
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::testing::ready_kernel;
    use abi::{Priority, ThreadState};

    fn park_waiting(
        k: &mut Kernel,
        f: &mut FlagsState,
        mask: u32,
        mode: WaitMode,
        clear: bool,
    ) -> usize {
        let who = k.current;
        assert!(matches!(
            f.wait_step(k, mask, mode, clear, Deadline::Forever),
            Ok(Progress::Parked)
        ));
        k.reschedule();
        who
    }

    #[test]
    fn raise_validates_reserved_bits() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut f = FlagsState::new();
        assert_eq!(f.raise(&mut k, 0), Err(Kind::Invalid));
        assert_eq!(f.raise(&mut k, 1 << 31), Err(Kind::Invalid));
        assert_eq!(f.raise(&mut k, 0b1010), Ok(0b1010));
    }

    #[test]
    fn satisfied_wait_completes_inline() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut f = FlagsState::new();
        f.raise(&mut k, 0b110).unwrap();
        match f.wait_step(&mut k, 0b100, WaitMode::Any, true, Deadline::Forever)
        {
            Ok(Progress::Done(seen)) => assert_eq!(seen, 0b110),
            _ => panic!("expected immediate completion"),
        }
        // Clear-on-wake consumed only the requested bit.
        assert_eq!(f.get(), 0b010);
    }

    #[test]
    fn all_mode_waits_for_every_bit() {
        let (mut k, waiter) = ready_kernel(&[
            ("w", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut f = FlagsState::new();
        park_waiting(&mut k, &mut f, 0b11, WaitMode::All, false);
        f.raise(&mut k, 0b01).unwrap();
        assert_eq!(k.threads[waiter].state, ThreadState::Suspended);
        f.raise(&mut k, 0b10).unwrap();
        assert_eq!(k.threads[waiter].state, ThreadState::Ready);
        assert_eq!(k.threads[waiter].wait_result, 0b11);
        // No clear requested: the group keeps the bits.
        assert_eq!(f.get(), 0b11);
    }

    #[test]
    fn clear_on_wake_consumes_in_wake_order() {
        // Two waiters on the same bit, the first (higher priority) with
        // clear-on-wake: only it is satisfied by one raise.
        let (mut k, first) = ready_kernel(&[
            ("hi", Priority::HIGH),
            ("lo", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut f = FlagsState::new();
        park_waiting(&mut k, &mut f, 0b1, WaitMode::Any, true);
        let second = park_waiting(&mut k, &mut f, 0b1, WaitMode::Any, true);

        f.raise(&mut k, 0b1).unwrap();
        assert_eq!(k.threads[first].state, ThreadState::Ready);
        assert_eq!(k.threads[second].state, ThreadState::Suspended);
        assert_eq!(f.get(), 0);
        assert_eq!(f.waiters(), 1);

        // A second raise reaches the survivor.
        f.raise(&mut k, 0b1).unwrap();
        assert_eq!(k.threads[second].state, ThreadState::Ready);
    }

    #[test]
    fn broadcast_without_clear_wakes_everyone() {
        let (mut k, w1) = ready_kernel(&[
            ("w1", Priority::NORMAL),
            ("w2", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut f = FlagsState::new();
        park_waiting(&mut k, &mut f, 0b1, WaitMode::Any, false);
        let w2 = park_waiting(&mut k, &mut f, 0b1, WaitMode::Any, false);
        f.raise(&mut k, 0b1).unwrap();
        assert_eq!(k.threads[w1].state, ThreadState::Ready);
        assert_eq!(k.threads[w2].state, ThreadState::Ready);
        assert_eq!(f.waiters(), 0);
    }

    #[test]
    fn clear_returns_prior_value() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut f = FlagsState::new();
        f.raise(&mut k, 0b1100).unwrap();
        assert_eq!(f.clear(0b0100), Ok(0b1100));
        assert_eq!(f.get(), 0b1000);
        assert_eq!(f.clear(1 << 24), Err(Kind::Invalid));
    }

    #[test]
    fn timed_event_wait_can_expire() {
        let (mut k, waiter) = ready_kernel(&[
            ("w", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut f = FlagsState::new();
        let who = k.current;
        assert!(matches!(
            f.wait_step(
                &mut k,
                0b1,
                WaitMode::Any,
                false,
                Deadline::After(2)
            ),
            Ok(Progress::Parked)
        ));
        assert_eq!(who, waiter);
        k.reschedule();
        k.tick();
        k.tick();
        assert_eq!(k.threads[waiter].state, ThreadState::Ready);
        assert_eq!(k.threads[waiter].wake_reason, WakeReason::Timeout);
        assert_eq!(f.waiters(), 0);
    }
}
