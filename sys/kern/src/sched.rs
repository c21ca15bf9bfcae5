// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ready set and dispatcher, and the kernel state they live in.
//!
//! All mutable kernel state sits in one [`Kernel`] value so the scheduling
//! logic is an ordinary state machine over plain data: operations mutate
//! thread states and queues and *request* a switch; the actual switch is
//! always deferred to the pendable exception, which calls
//! [`Kernel::reschedule`]. That split is what lets the whole scheduler run
//! under test on the host, with the test harness standing in for the
//! exception.
//!
//! Selection rule: highest priority ready thread wins; within a priority
//! level, strictly FIFO. The running thread is *not* kept in the ready set.

use abi::{Kind, Priority, ThreadFlags, ThreadId, ThreadState, WakeReason};
use kerncore::{DeadlineQueue, PrioQueue};

use crate::arch;
use crate::config;
use crate::thread::Thread;
use crate::timer::TimerTable;
use crate::wait::WaitList;

/// The kernel singleton's contents. One instance lives for the life of the
/// system (see `startup`); tests build their own.
pub(crate) struct Kernel {
    /// The thread table. Slot state `Inactive` doubles as "free".
    pub threads: [Thread; config::MAX_THREADS],
    /// Ready threads, by descending priority, FIFO within a level. Does
    /// not contain the running thread.
    pub ready: PrioQueue<{ config::MAX_THREADS }>,
    /// Threads waiting on a deadline, soonest first.
    pub delay: DeadlineQueue<{ config::MAX_THREADS }>,
    /// Software-timer table; serviced by the timer thread.
    pub timers: TimerTable,
    /// Index of the running thread.
    pub current: usize,
    /// Monotonic tick count.
    pub ticks: u64,
    /// Wall-clock seconds, advanced every `TICK_HZ` ticks.
    pub rtc_secs: u64,
    /// Ticks into the current second.
    pub subsec_ticks: u32,
    /// Scheduler-lock nesting depth.
    pub sched_lock: u32,
    /// A switch was requested while the scheduler was locked; honored at
    /// unlock.
    pub defer_switch: bool,
    /// Set once the first thread has been dispatched.
    pub started: bool,
    /// Total context switches.
    pub switches: u64,
    /// Application entry point, stashed for the main thread's shim.
    pub main: Option<fn() -> i32>,
    /// Application hook run by the idle thread whenever it is selected.
    pub idle_hook: Option<fn()>,
    /// Application hook invoked (from the tick handler) when a thread's
    /// stack sentinel is found clobbered. Without one, the kernel dies.
    pub overflow_hook: Option<fn(ThreadId, &'static str)>,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            threads: [const { Thread::empty() }; config::MAX_THREADS],
            ready: PrioQueue::new(),
            delay: DeadlineQueue::new(),
            timers: TimerTable::new(),
            current: 0,
            ticks: 0,
            rtc_secs: 0,
            subsec_ticks: 0,
            sched_lock: 0,
            defer_switch: false,
            started: false,
            switches: 0,
            main: None,
            idle_hook: None,
            overflow_hook: None,
        }
    }

    /// Produces a current `ThreadId` (i.e. one with the correct generation)
    /// for the running thread.
    pub fn current_id(&self) -> ThreadId {
        ThreadId::for_index_and_gen(
            self.current,
            self.threads[self.current].generation(),
        )
    }

    /// Checks a user-provided `ThreadId` against the table.
    ///
    /// On success, returns an index that can be used to dereference the
    /// table without panicking. Stale generations (the slot has been
    /// recycled) and empty slots report `Invalid`.
    pub fn check_id(&self, id: ThreadId) -> abi::Result<usize> {
        let idx = id.index();
        if idx >= config::MAX_THREADS {
            return Err(Kind::Invalid);
        }
        let t = &self.threads[idx];
        if t.state == ThreadState::Inactive || t.generation() != id.generation()
        {
            return Err(Kind::Invalid);
        }
        Ok(idx)
    }

    /// Dispatcher entry point, called from the pendable context-switch
    /// exception (or from tests standing in for it).
    ///
    /// If the scheduler is locked this does nothing except note that a
    /// switch is owed; the unlock path re-pends the exception.
    pub fn reschedule(&mut self) {
        if self.sched_lock > 0 {
            self.defer_switch = true;
            return;
        }
        let cur = self.current;
        if self.threads[cur].state == ThreadState::Running {
            // The running thread is still viable; only displace it for
            // strictly more important work. (A yielding thread has already
            // put itself back in the ready set and is not `Running` here.)
            match self.ready.peek() {
                Some((_, hp))
                    if Priority(hp)
                        .is_more_important_than(self.threads[cur].priority) =>
                {
                    let p = self.threads[cur].priority.0;
                    self.threads[cur].state = ThreadState::Ready;
                    uassert!(self.ready.insert(cur as u16, p).is_ok());
                }
                _ => return,
            }
        }
        let next = match self.ready.pop() {
            Some((id, _)) => id as usize,
            // The idle thread is always runnable; an empty ready set here
            // means the table is corrupt.
            None => crate::fail::die("nothing runnable"),
        };
        self.threads[next].state = ThreadState::Running;
        self.current = next;
        if next != cur {
            self.switches = self.switches.wrapping_add(1);
            self.threads[next].record_switch();
        }
        // Safety: the stored pointer aliases the thread table, but it is
        // only consumed by the context-switch assembly after this borrow of
        // `self` has ended.
        unsafe { arch::set_current_thread(&self.threads[next]) };
    }

    /// Moves the running thread to the back of its priority's FIFO and
    /// requests a switch, which will pick up whoever is now at the front
    /// (possibly the same thread, if it is alone at its level).
    pub fn yield_current(&mut self) {
        let cur = self.current;
        if self.threads[cur].state != ThreadState::Running {
            return;
        }
        let p = self.threads[cur].priority.0;
        self.threads[cur].state = ThreadState::Ready;
        uassert!(self.ready.insert(cur as u16, p).is_ok());
        arch::pend_switch();
    }

    /// Transitions the running thread to `Suspended`, optionally
    /// registering a wake-up deadline, and requests a switch. The caller is
    /// responsible for any wait-queue membership.
    pub fn park_current(&mut self, deadline: Option<u64>) {
        let cur = self.current;
        uassert!(self.threads[cur].state == ThreadState::Running);
        self.threads[cur].state = ThreadState::Suspended;
        if let Some(d) = deadline {
            uassert!(self.delay.insert(cur as u16, d).is_ok());
        }
        arch::pend_switch();
    }

    /// Makes a suspended thread ready: clears its timed-wake registration
    /// and wait bookkeeping, delivers the wake reason, admits it to the
    /// ready set, and requests preemption if it now outranks the running
    /// thread.
    ///
    /// Does *not* remove the thread from a wait queue; use [`Self::wake`]
    /// when the thread may be enqueued somewhere.
    pub fn ready_thread(&mut self, idx: usize, reason: WakeReason) {
        self.delay.remove(idx as u16);
        let t = &mut self.threads[idx];
        t.end_wait(reason);
        let p = t.priority.0;
        t.state = ThreadState::Ready;
        uassert!(self.ready.insert(idx as u16, p).is_ok());
        self.maybe_preempt(idx);
    }

    /// Fully wakes a suspended thread, wherever it is parked: removes it
    /// from its wait queue (if any) and the delay queue, then readies it.
    /// Returns `false` if the thread was not suspended.
    pub fn wake(&mut self, idx: usize, reason: WakeReason) -> bool {
        if self.threads[idx].state != ThreadState::Suspended {
            return false;
        }
        if let Some(q) = self.threads[idx].clear_wait_queue() {
            // Safety: the pointer was installed by `WaitList::park` while
            // the parked thread's blocking wrapper holds a `&'static`
            // borrow of the object containing the list, so the list is
            // still where it was; we are inside the kernel critical
            // section, so no other borrow of it is live.
            unsafe { WaitList::remove_parked(q, idx) };
        }
        self.ready_thread(idx, reason);
        true
    }

    /// Requests a context switch if thread `idx` (typically just woken)
    /// should displace the running thread.
    pub fn maybe_preempt(&mut self, idx: usize) {
        if !config::PREEMPTION || !self.started {
            return;
        }
        let cur = &self.threads[self.current];
        if cur.state != ThreadState::Running
            || self.threads[idx].priority.is_more_important_than(cur.priority)
        {
            arch::pend_switch();
        }
    }

    /// Changes a thread's effective priority, repositioning it in whatever
    /// scheduling structure it currently occupies.
    pub fn set_effective_priority(&mut self, idx: usize, new: Priority) {
        let old = self.threads[idx].priority;
        if old == new {
            return;
        }
        self.threads[idx].priority = new;
        match self.threads[idx].state {
            ThreadState::Ready => {
                self.ready.reprioritize(idx as u16, new.0);
                self.maybe_preempt(idx);
            }
            ThreadState::Suspended => {
                if let Some(q) = self.threads[idx].wait_queue() {
                    // Safety: same argument as in `wake`.
                    unsafe { WaitList::reprioritize_parked(q, idx, new) };
                }
            }
            ThreadState::Running => {
                // A demotion may make a ready thread the winner.
                if let Some((_, hp)) = self.ready.peek() {
                    if Priority(hp).is_more_important_than(new) {
                        arch::pend_switch();
                    }
                }
            }
            _ => {}
        }
    }

    /// Consumes a pending interruption request against thread `idx`,
    /// returning whether one was present. Blocking operations call this on
    /// the current thread before parking.
    pub fn take_interrupt(&mut self, idx: usize) -> bool {
        let t = &mut self.threads[idx];
        if t.flags.contains(ThreadFlags::INTERRUPTED) {
            t.flags.remove(ThreadFlags::INTERRUPTED);
            true
        } else {
            false
        }
    }

    /// Counts table slots currently in `state`.
    pub fn count_in_state(&self, state: ThreadState) -> usize {
        self.threads.iter().filter(|t| t.state == state).count()
    }
}

/// Returns the more important of two priorities.
pub(crate) fn prio_max(a: Priority, b: Priority) -> Priority {
    if b.is_more_important_than(a) {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::testing::{ready_kernel, spawn};

    #[test]
    fn highest_priority_ready_thread_runs() {
        let (mut k, first) = ready_kernel(&[("a", Priority::LOW)]);
        assert_eq!(k.current, first);
        let hi = spawn(&mut k, "b", Priority::HIGH);
        assert!(arch::take_pending_switch());
        k.reschedule();
        assert_eq!(k.current, hi);
        assert_eq!(k.threads[first].state, ThreadState::Ready);
    }

    #[test]
    fn equal_priority_wake_does_not_preempt() {
        let (mut k, first) = ready_kernel(&[("a", Priority::NORMAL)]);
        let _peer = spawn(&mut k, "b", Priority::NORMAL);
        // Spawning an equal still pends in some paths; drain the flag and
        // confirm the dispatcher keeps the incumbent.
        arch::take_pending_switch();
        k.reschedule();
        assert_eq!(k.current, first);
    }

    #[test]
    fn preemption_counter_stops_while_preempted() {
        // Scenario: a low thread runs; a high thread becomes ready; the low
        // thread must not be selected again until the high one leaves.
        let (mut k, low) = ready_kernel(&[("low", Priority::LOW)]);
        let high = spawn(&mut k, "high", Priority::HIGH);
        k.reschedule();
        assert_eq!(k.current, high);
        // While `high` runs, reschedule never hands the CPU back to `low`.
        for _ in 0..3 {
            k.reschedule();
            assert_eq!(k.current, high);
        }
        // `high` terminates; `low` resumes.
        k.threads[high].state = ThreadState::Terminated;
        k.reschedule();
        assert_eq!(k.current, low);
    }

    #[test]
    fn yield_rotates_fifo_within_priority() {
        let (mut k, a) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("b", Priority::NORMAL),
            ("c", Priority::NORMAL),
        ]);
        let mut order = vec![k.current];
        for _ in 0..8 {
            k.yield_current();
            assert!(arch::take_pending_switch());
            k.reschedule();
            order.push(k.current);
        }
        // Insertion order was a, b, c; rotation must repeat it.
        assert_eq!(order[0], a);
        assert_eq!(&order[..3], &order[3..6]);
        assert_eq!(&order[..3], &order[6..9]);
    }

    #[test]
    fn yield_alone_at_level_is_a_noop_switch() {
        let (mut k, only) = ready_kernel(&[("solo", Priority::NORMAL)]);
        let before = k.switches;
        k.yield_current();
        k.reschedule();
        assert_eq!(k.current, only);
        assert_eq!(k.switches, before);
    }

    #[test]
    fn scheduler_lock_defers_switching() {
        let (mut k, low) = ready_kernel(&[("low", Priority::LOW)]);
        k.sched_lock = 1;
        let hi = spawn(&mut k, "hi", Priority::HIGH);
        k.reschedule();
        // Locked: still on the low thread, switch owed.
        assert_eq!(k.current, low);
        assert!(k.defer_switch);
        k.sched_lock = 0;
        k.reschedule();
        assert_eq!(k.current, hi);
    }

    #[test]
    fn park_and_wake_round_trip() {
        let (mut k, a) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("b", Priority::LOW),
        ]);
        k.park_current(None);
        k.reschedule();
        assert_ne!(k.current, a);
        assert_eq!(k.threads[a].state, ThreadState::Suspended);

        assert!(k.wake(a, WakeReason::Ok));
        // Woken thread outranks the running low thread.
        assert!(arch::take_pending_switch());
        k.reschedule();
        assert_eq!(k.current, a);
        assert_eq!(k.threads[a].wake_reason, WakeReason::Ok);
    }

    #[test]
    fn wake_of_non_suspended_thread_is_rejected() {
        let (mut k, a) = ready_kernel(&[("a", Priority::NORMAL)]);
        assert!(!k.wake(a, WakeReason::Ok));
    }

    #[test]
    fn park_with_deadline_registers_timed_wake() {
        let (mut k, a) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        k.park_current(Some(25));
        k.reschedule();
        assert!(k.delay.contains(a as u16));
        // An explicit wake cancels the deadline.
        assert!(k.wake(a, WakeReason::Ok));
        assert!(!k.delay.contains(a as u16));
    }

    #[test]
    fn effective_priority_change_repositions_ready_thread() {
        let (mut k, _) = ready_kernel(&[
            ("run", Priority::HIGH),
            ("x", Priority::LOW),
            ("y", Priority::NORMAL),
        ]);
        // Ready set currently: y (NORMAL) before x (LOW). Spawn order puts
        // x at table index 1.
        let x = 1;
        k.set_effective_priority(x, Priority::ABOVE_NORMAL);
        let (head, _) = k.ready.peek().unwrap();
        assert_eq!(head as usize, x);
    }

    #[test]
    fn check_id_rejects_stale_generation() {
        let (mut k, a) = ready_kernel(&[("a", Priority::NORMAL)]);
        let id = k.current_id();
        assert_eq!(k.check_id(id), Ok(a));
        k.threads[a].bump_generation();
        assert_eq!(k.check_id(id), Err(Kind::Invalid));
    }
}
