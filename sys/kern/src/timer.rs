// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software timers.
//!
//! Timer records live in a fixed kernel table; the public [`Timer`] is a
//! handle on a table slot. Callbacks are *not* run from the tick
//! interrupt: a dedicated kernel thread (the timer service, created at
//! startup at `config::TIMER_THREAD_PRIORITY`) sleeps on a semaphore
//! until the earliest deadline and fires expired callbacks on its own
//! stack.
//!
//! The service's sleep deadline *is* the head timer's deadline, so tick
//! expiry wakes it through the ordinary delay queue; the semaphore only
//! needs a post when an insertion creates a new, earlier head.

use abi::Kind;
use kerncore::DeadlineQueue;

use crate::config;
use crate::startup::with_kernel;
use crate::sync::Semaphore;

/// Timer callback: a plain function taking the opaque argument given at
/// creation. Runs on the timer service thread.
pub type TimerFn = fn(usize);

/// Whether a timer re-arms itself after firing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerKind {
    OneShot,
    Periodic,
}

#[derive(Copy, Clone)]
struct TimerSlot {
    used: bool,
    active: bool,
    periodic: bool,
    /// Ticks between firings (also the initial delay).
    period: u64,
    /// Absolute deadline of the pending firing.
    deadline: u64,
    func: Option<TimerFn>,
    arg: usize,
}

impl TimerSlot {
    const EMPTY: Self = Self {
        used: false,
        active: false,
        periodic: false,
        period: 0,
        deadline: 0,
        func: None,
        arg: 0,
    };
}

/// The kernel-owned timer table: slots plus the firing schedule.
pub(crate) struct TimerTable {
    slots: [TimerSlot; config::MAX_TIMERS],
    schedule: DeadlineQueue<{ config::MAX_TIMERS }>,
}

impl TimerTable {
    pub const fn new() -> Self {
        Self {
            slots: [TimerSlot::EMPTY; config::MAX_TIMERS],
            schedule: DeadlineQueue::new(),
        }
    }

    pub(crate) fn allocate(
        &mut self,
        func: TimerFn,
        arg: usize,
        periodic: bool,
    ) -> Option<u8> {
        let i = self.slots.iter().position(|s| !s.used)?;
        self.slots[i] = TimerSlot {
            used: true,
            active: false,
            periodic,
            period: 0,
            deadline: 0,
            func: Some(func),
            arg,
        };
        Some(i as u8)
    }

    pub(crate) fn release(&mut self, i: u8) {
        self.schedule.remove(i as u16);
        self.slots[i as usize] = TimerSlot::EMPTY;
    }

    /// (Re)arms slot `i` to fire `ticks` from `now` (clamped to one tick
    /// minimum); an already-active timer is reset. Returns whether the
    /// schedule's head became earlier, in which case the service must be
    /// nudged.
    pub(crate) fn start(&mut self, i: u8, now: u64, ticks: u64) -> bool {
        let ticks = ticks.max(1);
        let old_head = self.schedule.next_deadline();
        self.schedule.remove(i as u16);
        let s = &mut self.slots[i as usize];
        s.period = ticks;
        s.deadline = now + ticks;
        s.active = true;
        let deadline = s.deadline;
        uassert!(self.schedule.insert(i as u16, deadline).is_ok());
        match old_head {
            None => true,
            Some(h) => deadline < h,
        }
    }

    /// Deactivates slot `i`; stopping an inactive timer is fine.
    pub(crate) fn stop(&mut self, i: u8) {
        self.schedule.remove(i as u16);
        self.slots[i as usize].active = false;
    }

    pub(crate) fn is_active(&self, i: u8) -> bool {
        self.slots[i as usize].active
    }

    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.schedule.next_deadline()
    }

    /// Removes every timer due at `now`, collecting its callback into
    /// `out` and re-arming periodic ones at `deadline + period`. Returns
    /// the number collected (overflow beyond `out` drops the firing but
    /// keeps the schedule sound).
    pub(crate) fn collect_due(
        &mut self,
        now: u64,
        out: &mut [(TimerFn, usize); config::MAX_TIMERS],
    ) -> usize {
        let mut n = 0;
        while let Some((id, deadline)) = self.schedule.pop_expired(now) {
            let s = &mut self.slots[id as usize];
            if let Some(f) = s.func {
                if n < out.len() {
                    out[n] = (f, s.arg);
                    n += 1;
                }
            }
            if s.periodic {
                // Next firing measured from the deadline, not from now:
                // the period does not drift under service latency.
                s.deadline = deadline + s.period;
                let d = s.deadline;
                uassert!(self.schedule.insert(id, d).is_ok());
            } else {
                s.active = false;
            }
        }
        n
    }
}

/// Wakes the timer service when a new head deadline appears.
static SERVICE_SEM: Semaphore = Semaphore::binary(0);

/// The timer service thread body.
pub(crate) fn service_main(_arg: usize) -> i32 {
    fn nothing(_: usize) {}
    let mut due: [(TimerFn, usize); config::MAX_TIMERS] =
        [(nothing as TimerFn, 0); config::MAX_TIMERS];
    loop {
        let n = with_kernel(|k, _| {
            let now = k.ticks;
            k.timers.collect_due(now, &mut due)
        });
        // Fire outside the critical section, on this stack.
        for &(f, arg) in &due[..n] {
            f(arg);
        }
        let next = with_kernel(|k, _| k.timers.next_deadline());
        let _ = match next {
            Some(deadline) => SERVICE_SEM.wait_until(deadline),
            None => SERVICE_SEM.wait(),
        };
    }
}

/// A software timer handle.
///
/// Dropping the handle stops the timer and releases its slot.
pub struct Timer {
    slot: u8,
}

impl Timer {
    /// Claims a timer slot. Fails with `NoMemory` when the table is full.
    pub fn new(
        func: TimerFn,
        arg: usize,
        kind: TimerKind,
    ) -> abi::Result<Timer> {
        with_kernel(|k, _| {
            k.timers
                .allocate(func, arg, kind == TimerKind::Periodic)
                .map(|slot| Timer { slot })
                .ok_or(Kind::NoMemory)
        })
    }

    /// Arms the timer to fire in `ticks` (minimum one); for periodic
    /// timers this also becomes the period. An active timer is reset to
    /// the new deadline.
    pub fn start(&self, ticks: u64) -> abi::Result<()> {
        let head_changed = with_kernel(|k, _| {
            let now = k.ticks;
            k.timers.start(self.slot, now, ticks)
        });
        if head_changed {
            // Nudge the service out of its sleep so it recomputes the
            // head deadline. Overflow just means it is already pending.
            let _ = SERVICE_SEM.post();
        }
        Ok(())
    }

    /// Disarms the timer. Stopping an inactive timer succeeds.
    pub fn stop(&self) -> abi::Result<()> {
        with_kernel(|k, _| k.timers.stop(self.slot));
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        with_kernel(|k, _| k.timers.is_active(self.slot))
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        with_kernel(|k, _| k.timers.release(self.slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb(_: usize) {}

    fn due_buf() -> [(TimerFn, usize); config::MAX_TIMERS] {
        [(cb as TimerFn, 0); config::MAX_TIMERS]
    }

    #[test]
    fn table_allocates_and_exhausts() {
        let mut t = TimerTable::new();
        for _ in 0..config::MAX_TIMERS {
            assert!(t.allocate(cb, 0, false).is_some());
        }
        assert!(t.allocate(cb, 0, false).is_none());
        t.release(0);
        assert_eq!(t.allocate(cb, 0, false), Some(0));
    }

    #[test]
    fn one_shot_fires_once_and_deactivates() {
        let mut t = TimerTable::new();
        let i = t.allocate(cb, 7, false).unwrap();
        t.start(i, 100, 10);
        assert!(t.is_active(i));
        assert_eq!(t.next_deadline(), Some(110));

        let mut out = due_buf();
        assert_eq!(t.collect_due(109, &mut out), 0);
        assert_eq!(t.collect_due(110, &mut out), 1);
        assert_eq!(out[0].1, 7);
        assert!(!t.is_active(i));
        assert_eq!(t.next_deadline(), None);
    }

    #[test]
    fn periodic_reschedules_from_deadline() {
        let mut t = TimerTable::new();
        let i = t.allocate(cb, 0, true).unwrap();
        t.start(i, 0, 10);
        let mut out = due_buf();
        // Serviced late (tick 13): the next firing is still at 20.
        assert_eq!(t.collect_due(13, &mut out), 1);
        assert_eq!(t.next_deadline(), Some(20));
        assert!(t.is_active(i));
    }

    #[test]
    fn start_resets_an_active_timer() {
        let mut t = TimerTable::new();
        let i = t.allocate(cb, 0, false).unwrap();
        t.start(i, 0, 10);
        t.start(i, 5, 10);
        assert_eq!(t.next_deadline(), Some(15));
        // Only one schedule entry exists.
        let mut out = due_buf();
        assert_eq!(t.collect_due(1000, &mut out), 1);
    }

    #[test]
    fn start_reports_new_earlier_head() {
        let mut t = TimerTable::new();
        let a = t.allocate(cb, 0, false).unwrap();
        let b = t.allocate(cb, 0, false).unwrap();
        assert!(t.start(a, 0, 50));
        // Later deadline: no nudge needed.
        assert!(!t.start(b, 0, 80));
        // Earlier deadline: nudge.
        assert!(t.start(b, 0, 20));
    }

    #[test]
    fn stop_is_idempotent_and_unschedules() {
        let mut t = TimerTable::new();
        let i = t.allocate(cb, 0, true).unwrap();
        t.start(i, 0, 10);
        t.stop(i);
        assert!(!t.is_active(i));
        assert_eq!(t.next_deadline(), None);
        t.stop(i);
        let mut out = due_buf();
        assert_eq!(t.collect_due(1000, &mut out), 0);
    }

    #[test]
    fn zero_tick_start_clamps_to_one() {
        let mut t = TimerTable::new();
        let i = t.allocate(cb, 0, false).unwrap();
        t.start(i, 42, 0);
        assert_eq!(t.next_deadline(), Some(43));
    }
}
