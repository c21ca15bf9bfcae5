// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time: the tick clock, the delay queue, and sleeping.
//!
//! The tick is the basic unit of every timeout and delay; it is maintained
//! as a single 64-bit count that, at the configured `TICK_HZ`, will not
//! wrap within the life of any hardware we care about. A seconds counter
//! is derived from it for wall-clock style uses.

use abi::{Kind, ThreadFlags, ThreadId, ThreadState, WakeReason};

use crate::arch;
use crate::config;
use crate::sched::Kernel;
use crate::startup::with_kernel;
use crate::wait;

/// Reads the current tick count.
pub fn now() -> u64 {
    with_kernel(|k, _| k.ticks)
}

/// Reads the derived real-time clock, in whole seconds since boot.
pub fn rtc_secs() -> u64 {
    with_kernel(|k, _| k.rtc_secs)
}

/// Reads the clock with sub-tick resolution: `(ticks, residual cycles)`.
///
/// The two values are captured inside one critical section, and the race
/// where the tick interrupt is pending but not yet handled is resolved by
/// crediting the pending tick (the hardware counter has already reloaded
/// and describes the next tick period).
pub fn now_hires() -> (u64, u32) {
    with_kernel(|k, _| {
        let (cycles, pending) = arch::tick_residue();
        let ticks = if pending { k.ticks + 1 } else { k.ticks };
        (ticks, cycles)
    })
}

/// Suspends the calling thread for at least `ticks` ticks (clamped to a
/// minimum of one). Returns `Ok` on normal expiry or an explicit wake,
/// `Err(Interrupted)` if the thread was cancelled while sleeping.
pub fn sleep_for(ticks: u64) -> abi::Result<()> {
    let ticks = ticks.max(1);
    with_kernel(|k, _| -> abi::Result<()> {
        k.begin_block()?;
        let deadline = k.ticks + ticks;
        k.park_current(Some(deadline));
        Ok(())
    })?;
    sleep_outcome()
}

/// Like [`sleep_for`], but with an absolute deadline on the tick clock. A
/// deadline at or before the current time returns immediately.
pub fn sleep_until(deadline: u64) -> abi::Result<()> {
    let parked = with_kernel(|k, _| -> abi::Result<bool> {
        if deadline <= k.ticks {
            return Ok(false);
        }
        k.begin_block()?;
        k.park_current(Some(deadline));
        Ok(true)
    })?;
    if !parked {
        return Ok(());
    }
    sleep_outcome()
}

/// For a sleeper, deadline expiry is the expected outcome, and an explicit
/// `resume` is also success; only interruption is an error.
fn sleep_outcome() -> abi::Result<()> {
    match wait::finish_block() {
        WakeReason::Timeout | WakeReason::Ok => Ok(()),
        WakeReason::Interrupted => Err(Kind::Interrupted),
    }
}

/// Tick interrupt body, called from the architecture's timer ISR.
#[allow(dead_code)] // referenced from the vector table on real targets
pub(crate) fn systick() {
    with_kernel(|k, _| k.tick());
}

impl Kernel {
    /// Advances time by one tick and performs everything the tick owns:
    /// the real-time clock, timed wakeups, stack sentinel checks, and
    /// (when enabled) round-robin rotation.
    pub(crate) fn tick(&mut self) {
        self.ticks += 1;
        self.subsec_ticks += 1;
        if self.subsec_ticks == config::TICK_HZ {
            self.subsec_ticks = 0;
            self.rtc_secs += 1;
        }

        // Charge the whole tick to whoever it interrupted.
        if self.threads[self.current].state == ThreadState::Running {
            self.threads[self.current].ticks_consumed += 1;
        }

        // Wake every sleeper whose deadline has arrived. `wake` handles
        // removal from any wait queue the thread is also parked on, and
        // requests preemption if the sleeper outranks the running thread.
        while let Some((id, _)) = self.delay.pop_expired(self.ticks) {
            self.wake(id as usize, WakeReason::Timeout);
        }

        self.check_stack_sentinels();

        if config::TIME_SLICING {
            self.rotate_time_slice();
        }
    }

    /// Round-robin step: if a ready thread shares the running thread's
    /// priority, rotate the running thread behind it.
    pub(crate) fn rotate_time_slice(&mut self) {
        if self.threads[self.current].state != ThreadState::Running {
            return;
        }
        if let Some((_, hp)) = self.ready.peek() {
            if hp == self.threads[self.current].priority.0 {
                self.yield_current();
            }
        }
    }

    /// Verifies the fill-magic sentinel at the base of every live thread
    /// stack, reporting the first clobber per thread through the overflow
    /// hook (or dying, if the embedder installed none).
    fn check_stack_sentinels(&mut self) {
        for idx in 0..config::MAX_THREADS {
            let t = &mut self.threads[idx];
            if matches!(
                t.state,
                ThreadState::Inactive | ThreadState::Terminated
            ) || t.flags.contains(ThreadFlags::STACK_SMASHED)
            {
                continue;
            }
            if !t.stack_sentinel_intact() {
                t.flags |= ThreadFlags::STACK_SMASHED;
                let name = t.name;
                let id = ThreadId::for_index_and_gen(idx, t.generation());
                match self.overflow_hook {
                    Some(hook) => hook(id, name),
                    None => crate::fail::die("stack overflow"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::testing::ready_kernel;
    use abi::Priority;

    #[test]
    fn ticks_and_rtc_advance() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        for _ in 0..config::TICK_HZ + 2 {
            k.tick();
        }
        assert_eq!(k.ticks, u64::from(config::TICK_HZ) + 2);
        assert_eq!(k.rtc_secs, 1);
        assert_eq!(k.subsec_ticks, 2);
    }

    #[test]
    fn sleeper_wakes_in_deadline_window() {
        // A 10-tick sleep must not wake before tick 10 and must wake at
        // tick 10.
        let (mut k, a) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let deadline = k.ticks + 10;
        k.park_current(Some(deadline));
        k.reschedule();
        for _ in 0..9 {
            k.tick();
            assert_eq!(k.threads[a].state, ThreadState::Suspended);
        }
        k.tick();
        assert_eq!(k.threads[a].state, ThreadState::Ready);
        assert_eq!(k.threads[a].wake_reason, WakeReason::Timeout);
    }

    #[test]
    fn earliest_deadline_wakes_first() {
        let (mut k, a) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("b", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        k.park_current(Some(k.ticks + 5));
        k.reschedule();
        let b = k.current;
        k.park_current(Some(k.ticks + 3));
        k.reschedule();

        for _ in 0..3 {
            k.tick();
        }
        assert_eq!(k.threads[b].state, ThreadState::Ready);
        assert_eq!(k.threads[a].state, ThreadState::Suspended);
        for _ in 0..2 {
            k.tick();
        }
        assert_eq!(k.threads[a].state, ThreadState::Ready);
    }

    #[test]
    fn timed_wake_preempts_lower_priority_runner() {
        let (mut k, a) = ready_kernel(&[
            ("hi", Priority::HIGH),
            ("lo", Priority::LOW),
        ]);
        k.park_current(Some(k.ticks + 1));
        k.reschedule();
        arch::take_pending_switch();

        k.tick();
        assert_eq!(k.threads[a].state, ThreadState::Ready);
        assert!(arch::take_pending_switch());
        k.reschedule();
        assert_eq!(k.current, a);
    }

    #[test]
    fn ticks_are_charged_to_the_running_thread() {
        let (mut k, a) = ready_kernel(&[("a", Priority::NORMAL)]);
        for _ in 0..5 {
            k.tick();
        }
        assert_eq!(k.threads[a].ticks_consumed, 5);
    }

    #[test]
    fn time_slice_rotation_moves_to_equal_peer() {
        let (mut k, a) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("b", Priority::NORMAL),
        ]);
        k.rotate_time_slice();
        k.reschedule();
        assert_ne!(k.current, a);
        // No equal peer ready: rotation keeps the incumbent.
        let b = k.current;
        k.threads[a].state = ThreadState::Suspended;
        k.ready.remove(a as u16);
        k.rotate_time_slice();
        k.reschedule();
        assert_eq!(k.current, b);
    }

    #[test]
    fn smashed_sentinel_fires_hook_once() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        let (mut k, a) = ready_kernel(&[("a", Priority::NORMAL)]);
        k.overflow_hook = Some(|_, _| {
            FIRED.fetch_add(1, Ordering::Relaxed);
        });
        k.threads[a].clobber_stack_sentinel_for_test();
        k.tick();
        k.tick();
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);
        assert!(k.threads[a].flags.contains(ThreadFlags::STACK_SMASHED));
    }
}
