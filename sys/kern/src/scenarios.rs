// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-object scheduling scenarios.
//!
//! Per-module tests pin down each object in isolation; the tests here walk
//! multi-object sequences the way running firmware would, with the test
//! body standing in for the context-switch exception, and check the global
//! invariants after every step.

use abi::{Kind, Priority, ThreadState, WakeReason};

use crate::arch;
use crate::sched::Kernel;
use crate::sync::mutex::{MutexKind, MutexState, Protocol, Robustness};
use crate::sync::semaphore::SemState;
use crate::thread::testing::ready_kernel;
use crate::wait::{Deadline, Progress};

/// Global consistency checks, applied after every settled step: the
/// running thread's priority dominates the ready set; queue membership
/// matches thread state; delay entries belong to suspended threads.
fn check_invariants(k: &Kernel) {
    let cur = &k.threads[k.current];
    if cur.state == ThreadState::Running {
        if let Some((_, hp)) = k.ready.peek() {
            assert!(
                !Priority(hp).is_more_important_than(cur.priority),
                "ready thread outranks the running thread"
            );
        }
    }
    for (idx, t) in k.threads.iter().enumerate() {
        match t.state {
            ThreadState::Ready => {
                assert!(k.ready.contains(idx as u16), "ready but not queued");
                assert!(t.wait_queue().is_none());
            }
            ThreadState::Running => {
                assert_eq!(idx, k.current);
                assert!(!k.ready.contains(idx as u16));
                assert!(t.wait_queue().is_none());
                assert!(!k.delay.contains(idx as u16));
            }
            _ => {
                assert!(!k.ready.contains(idx as u16));
            }
        }
        if k.delay.contains(idx as u16) {
            assert_eq!(t.state, ThreadState::Suspended);
        }
    }
}

/// Runs the deferred switch if one is pending; returns whether it ran.
fn dispatch(k: &mut Kernel) -> bool {
    if arch::take_pending_switch() {
        k.reschedule();
        true
    } else {
        false
    }
}

#[test]
fn priority_inversion_is_bounded_by_inheritance() {
    // Classic three-thread inversion: low holds an inherit mutex, high
    // blocks on it, and a mid thread stands ready. Without inheritance mid
    // would starve low (and therefore high); with it, low runs at high's
    // priority until it unlocks.
    let (mut k, _) = ready_kernel(&[
        ("high", Priority::HIGH),
        ("mid", Priority::NORMAL),
        ("low", Priority::LOW),
    ]);
    let high = k.current;
    // Park high and mid so low can take the lock first.
    k.park_current(None);
    k.reschedule();
    let mid = k.current;
    k.park_current(None);
    k.reschedule();
    let low = k.current;

    let mut m = MutexState::new(
        MutexKind::Normal,
        Protocol::Inherit,
        Robustness::Stalled,
        Priority::HIGH,
    );
    assert!(matches!(
        m.lock_step(&mut k, Deadline::Forever),
        Ok(Progress::Done(false))
    ));
    check_invariants(&k);

    // Everyone wakes; high contends on the mutex.
    k.wake(mid, WakeReason::Ok);
    k.wake(high, WakeReason::Ok);
    dispatch(&mut k);
    assert_eq!(k.current, high);
    assert!(matches!(
        m.lock_step(&mut k, Deadline::Forever),
        Ok(Progress::Parked)
    ));
    dispatch(&mut k);

    // The load-bearing assertion: low, boosted, beats mid to the CPU.
    assert_eq!(k.current, low);
    assert_eq!(k.threads[low].priority, Priority::HIGH);
    check_invariants(&k);

    // Low releases: ownership and the CPU go to high; low drops back.
    m.unlock_step(&mut k).unwrap();
    assert_eq!(m.owner().map(|o| o.index()), Some(high));
    assert_eq!(k.threads[low].priority, Priority::LOW);
    dispatch(&mut k);
    assert_eq!(k.current, high);

    // High finishes with the mutex; mid finally runs after high parks.
    m.unlock_step(&mut k).unwrap();
    k.park_current(None);
    k.reschedule();
    assert_eq!(k.current, mid);
    check_invariants(&k);
}

#[test]
fn ceiling_protocol_excludes_mid_preemption() {
    // With the ceiling protocol the boost applies on acquisition, before
    // any contention exists.
    let (mut k, mid) = ready_kernel(&[
        ("worker", Priority::LOW),
        ("mid", Priority::NORMAL),
    ]);
    // mid is dispatched first; park it so the worker can run and lock.
    k.park_current(None);
    k.reschedule();
    let worker = k.current;

    let mut m = MutexState::new(
        MutexKind::Normal,
        Protocol::Protect,
        Robustness::Stalled,
        Priority::ABOVE_NORMAL,
    );
    assert!(matches!(
        m.lock_step(&mut k, Deadline::Forever),
        Ok(Progress::Done(false))
    ));
    assert_eq!(k.threads[worker].priority, Priority::ABOVE_NORMAL);

    // mid wakes but cannot displace the boosted worker.
    k.wake(mid, WakeReason::Ok);
    dispatch(&mut k);
    assert_eq!(k.current, worker);
    check_invariants(&k);

    m.unlock_step(&mut k).unwrap();
    // Boost gone; mid preempts.
    dispatch(&mut k);
    assert_eq!(k.current, mid);
}

#[test]
fn producer_consumer_through_semaphore() {
    // One producer, two consumers at different priorities; each post is
    // consumed by exactly one thread, most important first.
    let (mut k, hi) = ready_kernel(&[
        ("hi", Priority::HIGH),
        ("lo", Priority::NORMAL),
        ("producer", Priority::LOW),
    ]);
    let mut items = SemState::new(0, u32::MAX);

    assert!(matches!(
        items.take(&mut k, Deadline::Forever),
        Ok(Progress::Parked)
    ));
    k.reschedule();
    let lo = k.current;
    assert!(matches!(
        items.take(&mut k, Deadline::Forever),
        Ok(Progress::Parked)
    ));
    k.reschedule();

    // Producer posts twice; both consumers come back, hi first.
    items.post(&mut k).unwrap();
    assert_eq!(k.threads[hi].state, ThreadState::Ready);
    assert_eq!(k.threads[lo].state, ThreadState::Suspended);
    items.post(&mut k).unwrap();
    assert_eq!(k.threads[lo].state, ThreadState::Ready);
    assert_eq!(items.value(), 0);
    dispatch(&mut k);
    assert_eq!(k.current, hi);
    check_invariants(&k);
}

#[test]
fn cancellation_interrupts_a_parked_wait_only() {
    let (mut k, waiter) = ready_kernel(&[
        ("w", Priority::NORMAL),
        ("idle", Priority::IDLE),
    ]);
    let mut sem = SemState::new(0, 1);
    assert!(matches!(
        sem.take(&mut k, Deadline::Forever),
        Ok(Progress::Parked)
    ));
    k.reschedule();

    // Cancellation: flag plus wake-with-interrupted, consumed by the wake.
    k.threads[waiter].flags |= abi::ThreadFlags::INTERRUPTED;
    assert!(k.wake(waiter, WakeReason::Interrupted));
    k.threads[waiter].flags.remove(abi::ThreadFlags::INTERRUPTED);
    assert_eq!(k.threads[waiter].wake_reason, WakeReason::Interrupted);
    dispatch(&mut k);
    assert_eq!(k.current, waiter);
    // The semaphore was left untouched by the aborted wait.
    assert_eq!(sem.value(), 0);
    sem.post(&mut k).unwrap();
    assert_eq!(sem.value(), 1);
    check_invariants(&k);
}

#[test]
fn sleeper_resumed_early_reports_ok() {
    let (mut k, a) = ready_kernel(&[
        ("a", Priority::NORMAL),
        ("idle", Priority::IDLE),
    ]);
    let deadline = k.ticks + 100;
    k.park_current(Some(deadline));
    k.reschedule();

    // Explicit resume long before the deadline.
    k.tick();
    assert!(k.wake(a, WakeReason::Ok));
    assert_eq!(k.threads[a].wake_reason, WakeReason::Ok);
    assert!(!k.delay.contains(a as u16));
    dispatch(&mut k);
    assert_eq!(k.current, a);
    // The stale deadline must not fire later.
    for _ in 0..100 {
        k.tick();
    }
    assert_eq!(k.current, a);
    check_invariants(&k);
}

#[test]
fn priority_change_repositions_a_parked_waiter() {
    // Two NORMAL waiters; promoting the second must reorder the wakes.
    let (mut k, w1) = ready_kernel(&[
        ("w1", Priority::NORMAL),
        ("w2", Priority::NORMAL),
        ("idle", Priority::IDLE),
    ]);
    let mut sem = SemState::new(0, u32::MAX);
    assert!(matches!(
        sem.take(&mut k, Deadline::Forever),
        Ok(Progress::Parked)
    ));
    k.reschedule();
    let w2 = k.current;
    assert!(matches!(
        sem.take(&mut k, Deadline::Forever),
        Ok(Progress::Parked)
    ));
    k.reschedule();

    k.set_effective_priority(w2, Priority::HIGH);
    sem.post(&mut k).unwrap();
    assert_eq!(k.threads[w2].state, ThreadState::Ready);
    assert_eq!(k.threads[w1].state, ThreadState::Suspended);
    dispatch(&mut k);
    assert_eq!(k.current, w2);
    check_invariants(&k);
}

#[test]
fn scheduler_lock_defers_but_delivers() {
    // A wake arriving under the scheduler lock readies the thread but the
    // incumbent keeps the CPU until unlock.
    let (mut k, hi) = ready_kernel(&[
        ("hi", Priority::HIGH),
        ("lo", Priority::LOW),
    ]);
    k.park_current(None);
    k.reschedule();
    let lo = k.current;

    k.sched_lock = 1;
    k.wake(hi, WakeReason::Ok);
    dispatch(&mut k);
    assert_eq!(k.current, lo);
    assert!(k.defer_switch);

    // Unlock honors the deferred request.
    k.sched_lock = 0;
    k.defer_switch = false;
    arch::pend_switch();
    dispatch(&mut k);
    assert_eq!(k.current, hi);
    check_invariants(&k);
}

#[test]
fn timer_service_schedule_drives_fires_in_order() {
    // Timers armed out of order fire in deadline order; a periodic timer
    // keeps its cadence while a one-shot disappears.
    let (mut k, _) = ready_kernel(&[("svc", Priority::REALTIME)]);
    fn nothing(_: usize) {}
    let one = k.timers.allocate(nothing, 1, false).unwrap();
    let per = k.timers.allocate(nothing, 2, true).unwrap();
    k.timers.start(per, k.ticks, 4);
    k.timers.start(one, k.ticks, 2);

    let mut out = [(nothing as crate::timer::TimerFn, 0usize);
        crate::config::MAX_TIMERS];

    // Advance to the one-shot's deadline.
    k.tick();
    k.tick();
    let n = k.timers.collect_due(k.ticks, &mut out);
    assert_eq!(n, 1);
    assert_eq!(out[0].1, 1);

    // Advance to the periodic deadline; it fires and re-arms.
    k.tick();
    k.tick();
    let n = k.timers.collect_due(k.ticks, &mut out);
    assert_eq!(n, 1);
    assert_eq!(out[0].1, 2);
    assert_eq!(k.timers.next_deadline(), Some(k.ticks + 4));
    check_invariants(&k);
}

#[test]
fn exhausted_table_recovers_after_exit() {
    // Fill the table, retire one thread, and verify the slot cycles with a
    // fresh generation.
    use crate::thread::testing::spawn;
    let (mut k, first) = ready_kernel(&[("a", Priority::NORMAL)]);
    while k.count_in_state(ThreadState::Inactive) > 0 {
        spawn(&mut k, "filler", Priority::LOW);
    }
    let old_id = k.current_id();

    k.threads[first].flags |= abi::ThreadFlags::DETACHED;
    k.terminate_current(0);
    k.reschedule();
    let reused = spawn(&mut k, "fresh", Priority::NORMAL);
    assert_eq!(reused, first);
    dispatch(&mut k);
    // The stale id no longer resolves.
    assert_eq!(k.check_id(old_id), Err(Kind::Invalid));
    check_invariants(&k);
}

#[test]
fn interrupt_wake_reschedules_on_isr_exit() {
    // A wake from simulated interrupt context requests a switch which the
    // "exception" then performs; thread-mode state is consistent before
    // and after.
    let (mut k, hi) = ready_kernel(&[
        ("hi", Priority::HIGH),
        ("bg", Priority::LOW),
    ]);
    let mut sem = SemState::new(0, 1);
    assert!(matches!(
        sem.take(&mut k, Deadline::Forever),
        Ok(Progress::Parked)
    ));
    k.reschedule();
    arch::take_pending_switch();
    let bg = k.current;

    arch::simulate_isr(true);
    sem.post(&mut k).unwrap();
    arch::simulate_isr(false);

    assert!(dispatch(&mut k));
    assert_eq!(k.current, hi);
    assert_eq!(k.threads[bg].state, ThreadState::Ready);
    check_invariants(&k);
}
