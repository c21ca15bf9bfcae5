// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutexes: normal/recursive, with optional priority protocols and
//! robustness.
//!
//! Ownership transfers directly on unlock: the most important waiter is
//! made owner *before* the dispatcher runs, so there is no window where a
//! mid-priority thread can steal a mutex released toward a high-priority
//! waiter.
//!
//! # Priority protocols
//!
//! `Inherit` boosts the owner to a waiter's priority at the moment the
//! waiter enqueues, single-hop: the boost does not propagate through a
//! second mutex the owner may itself be waiting on, and a parked waiter's
//! later priority change is not re-propagated (it is re-evaluated at the
//! next unlock). `Protect` raises the owner to the mutex ceiling for the
//! whole hold. Either way the owner's effective priority is recomputed
//! from its remaining held mutexes at unlock.
//!
//! # Robustness
//!
//! Each thread keeps an intrusive list of the mutexes it holds (threaded
//! through [`MutexState::next_owned`]); when a thread terminates, the exit
//! path walks the list. A `Robust` mutex is then marked inconsistent and
//! handed to its top waiter, whose lock call reports `OwnerDead` (while
//! granting ownership); `consistent` repairs the state, and unlocking
//! without repairing poisons the mutex as `NotRecoverable`. A `Stalled`
//! mutex stays owned by the dead thread forever.

use core::ptr::NonNull;

use abi::{Kind, Priority, ThreadId, WakeReason};

use crate::lock::KCell;
use crate::sched::{prio_max, Kernel};
use crate::startup::with_kernel;
use crate::wait::{self, Deadline, Progress, WaitList};

/// Whether re-locking by the owner counts up or deadlocks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MutexKind {
    Normal,
    Recursive,
}

/// Priority-inversion countermeasure applied while the mutex is held.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Protocol {
    None,
    /// Owner inherits the top waiter's priority (single hop).
    Inherit,
    /// Owner runs at the mutex's ceiling priority.
    Protect,
}

/// What happens when an owner terminates without unlocking.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Robustness {
    /// The mutex stays locked by the dead thread; waiters stall.
    Stalled,
    /// The next acquirer is told (`OwnerDead`) and may repair the state.
    Robust,
}

pub(crate) struct MutexState {
    owner: Option<ThreadId>,
    /// Recursion depth; zero exactly when unowned.
    count: u32,
    kind: MutexKind,
    protocol: Protocol,
    robustness: Robustness,
    ceiling: Priority,
    /// Owner died while holding; cleared by `consistent`.
    inconsistent: bool,
    /// Abandoned and then unlocked without repair; terminal.
    unrecoverable: bool,
    queue: WaitList,
    /// Link in the owning thread's held-mutex list.
    pub(crate) next_owned: Option<NonNull<MutexState>>,
}

// Safety: the intrusive link is only touched inside kernel critical
// sections, and the pointee is pinned by the `&'static` ownership API.
unsafe impl Send for MutexState {}

impl MutexState {
    pub(crate) const fn new(
        kind: MutexKind,
        protocol: Protocol,
        robustness: Robustness,
        ceiling: Priority,
    ) -> Self {
        Self {
            owner: None,
            count: 0,
            kind,
            protocol,
            robustness,
            ceiling,
            inconsistent: false,
            unrecoverable: false,
            queue: WaitList::new(),
            next_owned: None,
        }
    }

    /// Takes the mutex or parks the caller. `Done(true)` reports an
    /// acquisition of an abandoned mutex (ownership *is* granted).
    pub(crate) fn lock_step(
        &mut self,
        k: &mut Kernel,
        deadline: Deadline,
    ) -> abi::Result<Progress<bool>> {
        if self.unrecoverable {
            return Err(Kind::NotRecoverable);
        }
        let cur = k.current;
        let my_id = k.current_id();
        match self.owner {
            None => {
                self.grant(k, cur);
                Ok(Progress::Done(self.inconsistent))
            }
            Some(o) if o == my_id => match self.kind {
                MutexKind::Recursive => {
                    self.count += 1;
                    Ok(Progress::Done(false))
                }
                MutexKind::Normal => Err(Kind::Deadlock),
            },
            Some(o) => {
                let owner_live = k.check_id(o).is_ok();
                if !owner_live && self.robustness == Robustness::Robust {
                    // The exit walk normally hands abandoned mutexes over;
                    // this path catches an owner that died without running
                    // it (e.g. slot recycled between checks).
                    self.inconsistent = true;
                    self.grant(k, cur);
                    return Ok(Progress::Done(true));
                }
                if deadline.is_poll() {
                    return Err(Kind::WouldBlock);
                }
                k.begin_block()?;
                let until = deadline.resolve(k.ticks);
                self.queue.park(k, until);
                if owner_live && self.protocol == Protocol::Inherit {
                    let mine = k.threads[cur].priority;
                    let oidx = o.index();
                    if mine.is_more_important_than(k.threads[oidx].priority) {
                        k.set_effective_priority(oidx, mine);
                    }
                }
                Ok(Progress::Parked)
            }
        }
    }

    /// Releases one level of ownership; at zero, restores the caller's
    /// priority and hands the mutex to the top waiter (if any).
    pub(crate) fn unlock_step(&mut self, k: &mut Kernel) -> abi::Result<()> {
        if self.owner != Some(k.current_id()) {
            return Err(Kind::NotOwner);
        }
        if self.count > 1 {
            self.count -= 1;
            return Ok(());
        }
        let cur = k.current;
        self.count = 0;
        self.owner = None;
        unregister_owned(k, cur, self);
        let eff = effective_priority(k, cur);
        k.set_effective_priority(cur, eff);

        if self.inconsistent {
            // Abandoned, acquired, and released without `consistent`:
            // poison. Waiters are released to observe the poisoning.
            self.unrecoverable = true;
            self.queue.wake_all(k, WakeReason::Ok);
            return Ok(());
        }
        self.hand_off(k);
        Ok(())
    }

    /// Declares the state protected by an abandoned mutex repaired.
    pub(crate) fn consistent_step(&mut self, k: &mut Kernel) -> abi::Result<()> {
        if self.owner != Some(k.current_id()) {
            return Err(Kind::NotOwner);
        }
        if !self.inconsistent {
            return Err(Kind::Invalid);
        }
        self.inconsistent = false;
        Ok(())
    }

    /// Makes the running thread the owner, applying the ceiling protocol.
    fn grant(&mut self, k: &mut Kernel, idx: usize) {
        self.owner = Some(ThreadId::for_index_and_gen(
            idx,
            k.threads[idx].generation(),
        ));
        self.count = 1;
        register_owned(k, idx, self);
        if self.protocol == Protocol::Protect {
            let eff = prio_max(k.threads[idx].priority, self.ceiling);
            k.set_effective_priority(idx, eff);
        }
    }

    /// Transfers ownership to the top waiter, if any.
    fn hand_off(&mut self, k: &mut Kernel) {
        let Some(w) = self.queue.wake_one(k, WakeReason::Ok) else {
            return;
        };
        self.owner = Some(ThreadId::for_index_and_gen(
            w,
            k.threads[w].generation(),
        ));
        self.count = 1;
        register_owned(k, w, self);
        match self.protocol {
            Protocol::Protect => {
                let eff = prio_max(k.threads[w].priority, self.ceiling);
                k.set_effective_priority(w, eff);
            }
            Protocol::Inherit => {
                // Remaining waiters keep boosting the new owner.
                if let Some(top) = self.queue.top_priority() {
                    let eff = prio_max(k.threads[w].priority, top);
                    k.set_effective_priority(w, eff);
                }
            }
            Protocol::None => {}
        }
    }

    pub(crate) fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    pub(crate) fn recursion_depth(&self) -> u32 {
        self.count
    }

    pub(crate) fn ceiling(&self) -> Priority {
        self.ceiling
    }

    pub(crate) fn set_ceiling_step(
        &mut self,
        new: Priority,
    ) -> abi::Result<Priority> {
        if self.protocol != Protocol::Protect || !new.is_schedulable() {
            return Err(Kind::Invalid);
        }
        let old = self.ceiling;
        self.ceiling = new;
        Ok(old)
    }

    pub(crate) fn waiters(&self) -> usize {
        self.queue.waiters()
    }

    pub(crate) fn attributes(&self) -> (MutexKind, Protocol, Robustness) {
        (self.kind, self.protocol, self.robustness)
    }

    pub(crate) fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    pub(crate) fn is_unrecoverable(&self) -> bool {
        self.unrecoverable
    }
}

/// Pushes `m` onto thread `idx`'s held-mutex list.
fn register_owned(k: &mut Kernel, idx: usize, m: &mut MutexState) {
    m.next_owned = k.threads[idx].owned.replace(NonNull::from(&mut *m));
}

/// Unlinks `m` from thread `idx`'s held-mutex list.
fn unregister_owned(k: &mut Kernel, idx: usize, m: &mut MutexState) {
    let target = NonNull::from(&mut *m);
    if k.threads[idx].owned == Some(target) {
        k.threads[idx].owned = m.next_owned.take();
        return;
    }
    let mut link = k.threads[idx].owned;
    while let Some(mut p) = link {
        // Safety: list nodes are MutexStates pinned by the `&'static`
        // ownership API; we're inside the critical section, and `p` is
        // never `target`, so it does not alias `m`.
        let node = unsafe { p.as_mut() };
        if node.next_owned == Some(target) {
            node.next_owned = m.next_owned.take();
            return;
        }
        link = node.next_owned;
    }
    // Owner list disagrees with the mutex: table corrupt.
    uassert!(false);
}

/// Computes thread `idx`'s effective priority from its base priority and
/// every boost contributed by a mutex it holds.
pub(crate) fn effective_priority(k: &Kernel, idx: usize) -> Priority {
    let mut eff = k.threads[idx].base_priority;
    let mut link = k.threads[idx].owned;
    while let Some(p) = link {
        // Safety: held-mutex list nodes are pinned (see above); shared
        // read inside the critical section.
        let node = unsafe { p.as_ref() };
        match node.protocol {
            Protocol::Protect => eff = prio_max(eff, node.ceiling),
            Protocol::Inherit => {
                if let Some(top) = node.queue.top_priority() {
                    eff = prio_max(eff, top);
                }
            }
            Protocol::None => {}
        }
        link = node.next_owned;
    }
    eff
}

/// Called by the thread exit path: walks the dying thread's held mutexes,
/// abandoning robust ones to their waiters and leaving stalled ones
/// stalled.
pub(crate) fn abandon_owned(k: &mut Kernel, idx: usize) {
    let mut link = k.threads[idx].owned.take();
    while let Some(mut p) = link {
        // Safety: list nodes pinned, critical section held; each node is
        // visited once and unlinked as we go.
        let m = unsafe { p.as_mut() };
        link = m.next_owned.take();
        m.count = 0;
        m.owner = None;
        match m.robustness {
            Robustness::Robust => {
                m.inconsistent = true;
                m.hand_off(k);
            }
            Robustness::Stalled => {
                // Keep it dead-owned: waiters stall, unlockers get
                // NotOwner. The dead id can never match again.
                m.owner = Some(ThreadId::for_index_and_gen(
                    idx,
                    k.threads[idx].generation(),
                ));
                m.count = 1;
            }
        }
    }
}

/// A mutual-exclusion lock with configurable recursion, priority protocol,
/// and robustness.
pub struct Mutex {
    state: KCell<MutexState>,
}

impl Mutex {
    /// A plain mutex: no protocol, stalling, of the given kind.
    pub const fn new(kind: MutexKind) -> Self {
        Self::with(kind, Protocol::None, Robustness::Stalled, Priority::HIGH)
    }

    /// A priority-inheritance mutex.
    pub const fn inherit(kind: MutexKind) -> Self {
        Self::with(kind, Protocol::Inherit, Robustness::Stalled, Priority::HIGH)
    }

    /// A priority-ceiling mutex; the owner runs at `ceiling` while
    /// holding it.
    pub const fn protect(kind: MutexKind, ceiling: Priority) -> Self {
        Self::with(kind, Protocol::Protect, Robustness::Stalled, ceiling)
    }

    /// A robust mutex: owner death is reported to the next acquirer.
    pub const fn robust(kind: MutexKind, protocol: Protocol) -> Self {
        Self::with(kind, protocol, Robustness::Robust, Priority::HIGH)
    }

    const fn with(
        kind: MutexKind,
        protocol: Protocol,
        robustness: Robustness,
        ceiling: Priority,
    ) -> Self {
        Self {
            state: KCell::new(MutexState::new(
                kind, protocol, robustness, ceiling,
            )),
        }
    }

    pub(crate) fn state_cell(&self) -> &KCell<MutexState> {
        &self.state
    }

    /// Acquires the mutex, blocking as long as it takes. `Err(OwnerDead)`
    /// reports a successful acquisition of an abandoned robust mutex: the
    /// caller owns it and should repair and [`Self::consistent`].
    pub fn lock(&'static self) -> abi::Result<()> {
        self.lock_inner(Deadline::Forever)
    }

    /// Acquires the mutex only if that is possible immediately.
    pub fn try_lock(&'static self) -> abi::Result<()> {
        self.lock_inner(Deadline::Poll)
    }

    /// Acquires the mutex, blocking for at most `ticks`. Zero ticks is
    /// the polling form.
    pub fn timed_lock(&'static self, ticks: u64) -> abi::Result<()> {
        self.lock_inner(Deadline::after(ticks))
    }

    fn lock_inner(&'static self, deadline: Deadline) -> abi::Result<()> {
        let progress = with_kernel(|k, cs| {
            self.state.borrow_mut(cs).lock_step(k, deadline)
        })?;
        match progress {
            Progress::Done(false) => Ok(()),
            Progress::Done(true) => Err(Kind::OwnerDead),
            Progress::Parked => match wait::finish_block() {
                WakeReason::Ok => with_kernel(|k, cs| {
                    let s = self.state.borrow_mut(cs);
                    if s.unrecoverable {
                        // Woken by the poisoning unlock, not a transfer.
                        Err(Kind::NotRecoverable)
                    } else if s.inconsistent
                        && s.owner == Some(k.current_id())
                    {
                        Err(Kind::OwnerDead)
                    } else {
                        Ok(())
                    }
                }),
                WakeReason::Timeout => Err(Kind::Timeout),
                WakeReason::Interrupted => Err(Kind::Interrupted),
            },
        }
    }

    /// Releases one level of ownership. Fails with `NotOwner` for anyone
    /// but the owner.
    pub fn unlock(&'static self) -> abi::Result<()> {
        with_kernel(|k, cs| self.state.borrow_mut(cs).unlock_step(k))
    }

    /// Repairs an abandoned robust mutex; caller must hold it.
    pub fn consistent(&'static self) -> abi::Result<()> {
        with_kernel(|k, cs| self.state.borrow_mut(cs).consistent_step(k))
    }

    /// Reads the ceiling priority (meaningful for `Protect`).
    pub fn ceiling(&self) -> Priority {
        with_kernel(|_, cs| self.state.borrow_mut(cs).ceiling())
    }

    /// Replaces the ceiling priority, returning the old one. Fails with
    /// `Invalid` on non-`Protect` mutexes or unschedulable ceilings.
    pub fn set_ceiling(&self, new: Priority) -> abi::Result<Priority> {
        with_kernel(|_, cs| self.state.borrow_mut(cs).set_ceiling_step(new))
    }

    /// Current owner, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        with_kernel(|_, cs| self.state.borrow_mut(cs).owner())
    }

    /// The kind, protocol, and robustness this mutex was built with.
    pub fn attributes(&self) -> (MutexKind, Protocol, Robustness) {
        with_kernel(|_, cs| self.state.borrow_mut(cs).attributes())
    }

    /// Number of threads blocked in `lock`.
    pub fn waiters(&self) -> usize {
        with_kernel(|_, cs| self.state.borrow_mut(cs).waiters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::testing::ready_kernel;
    use abi::ThreadState;

    fn plain(kind: MutexKind) -> MutexState {
        MutexState::new(kind, Protocol::None, Robustness::Stalled, Priority::HIGH)
    }

    fn lock_now(m: &mut MutexState, k: &mut Kernel) {
        assert!(matches!(
            m.lock_step(k, Deadline::Forever),
            Ok(Progress::Done(false))
        ));
    }

    #[test]
    fn lock_unlock_round_trip() {
        let (mut k, me) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut m = plain(MutexKind::Normal);
        lock_now(&mut m, &mut k);
        assert_eq!(m.owner().map(|o| o.index()), Some(me));
        assert!(k.threads[me].owned.is_some());
        m.unlock_step(&mut k).unwrap();
        assert_eq!(m.owner(), None);
        assert!(k.threads[me].owned.is_none());
    }

    #[test]
    fn normal_self_lock_deadlocks() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut m = plain(MutexKind::Normal);
        lock_now(&mut m, &mut k);
        assert_eq!(
            m.lock_step(&mut k, Deadline::Forever).unwrap_err(),
            Kind::Deadlock
        );
    }

    #[test]
    fn unlock_by_stranger_fails() {
        let (mut k, _) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("b", Priority::NORMAL),
        ]);
        let mut m = plain(MutexKind::Normal);
        lock_now(&mut m, &mut k);
        // Switch to b and try to unlock a's mutex.
        k.yield_current();
        k.reschedule();
        assert_eq!(m.unlock_step(&mut k).unwrap_err(), Kind::NotOwner);
    }

    #[test]
    fn recursive_lock_nests_five_deep_and_transfers() {
        // Five nested locks, five unlocks; a blocked second thread must
        // then own the mutex.
        let (mut k, a) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("b", Priority::NORMAL),
        ]);
        let mut m = plain(MutexKind::Recursive);
        lock_now(&mut m, &mut k);
        for _ in 0..4 {
            assert!(matches!(
                m.lock_step(&mut k, Deadline::Forever),
                Ok(Progress::Done(false))
            ));
        }
        // b arrives and parks.
        k.yield_current();
        k.reschedule();
        let b = k.current;
        assert_ne!(a, b);
        assert!(matches!(
            m.lock_step(&mut k, Deadline::Forever),
            Ok(Progress::Parked)
        ));
        k.reschedule();
        assert_eq!(k.current, a);

        // Unlocks 1..=4 keep ownership; the 5th transfers it to b.
        for _ in 0..4 {
            m.unlock_step(&mut k).unwrap();
            assert_eq!(m.owner().map(|o| o.index()), Some(a));
        }
        m.unlock_step(&mut k).unwrap();
        assert_eq!(m.owner().map(|o| o.index()), Some(b));
        assert_eq!(k.threads[b].state, ThreadState::Ready);
        assert!(k.threads[b].owned.is_some());
    }

    #[test]
    fn try_lock_on_owned_mutex_would_block() {
        let (mut k, _) = ready_kernel(&[
            ("a", Priority::NORMAL),
            ("b", Priority::NORMAL),
        ]);
        let mut m = plain(MutexKind::Normal);
        lock_now(&mut m, &mut k);
        k.yield_current();
        k.reschedule();
        assert_eq!(
            m.lock_step(&mut k, Deadline::Poll).unwrap_err(),
            Kind::WouldBlock
        );
    }

    #[test]
    fn inherit_boosts_owner_single_hop() {
        let (mut k, low) = ready_kernel(&[
            ("low", Priority::LOW),
            ("high", Priority::HIGH),
        ]);
        // `high` is dispatched first; park it so `low` can take the lock,
        // then wake it to contend.
        let high = k.current;
        k.park_current(None);
        k.reschedule();
        assert_eq!(k.current, low);

        let mut m = MutexState::new(
            MutexKind::Normal,
            Protocol::Inherit,
            Robustness::Stalled,
            Priority::HIGH,
        );
        lock_now(&mut m, &mut k);

        // high wakes and contends.
        k.wake(high, WakeReason::Ok);
        k.reschedule();
        assert_eq!(k.current, high);
        assert!(matches!(
            m.lock_step(&mut k, Deadline::Forever),
            Ok(Progress::Parked)
        ));
        // Owner inherited the waiter's priority.
        assert_eq!(k.threads[low].priority, Priority::HIGH);
        assert_eq!(k.threads[low].base_priority, Priority::LOW);
        k.reschedule();
        assert_eq!(k.current, low);

        // Unlock: boost drops, ownership moves to high.
        m.unlock_step(&mut k).unwrap();
        assert_eq!(k.threads[low].priority, Priority::LOW);
        assert_eq!(m.owner().map(|o| o.index()), Some(high));
    }

    #[test]
    fn protect_applies_ceiling_for_the_hold() {
        let (mut k, me) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut m = MutexState::new(
            MutexKind::Normal,
            Protocol::Protect,
            Robustness::Stalled,
            Priority::REALTIME,
        );
        lock_now(&mut m, &mut k);
        assert_eq!(k.threads[me].priority, Priority::REALTIME);
        m.unlock_step(&mut k).unwrap();
        assert_eq!(k.threads[me].priority, Priority::NORMAL);
    }

    #[test]
    fn ceiling_is_adjustable_only_for_protect() {
        let (_k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let mut m = plain(MutexKind::Normal);
        assert_eq!(
            m.set_ceiling_step(Priority::HIGH).unwrap_err(),
            Kind::Invalid
        );
        let mut p = MutexState::new(
            MutexKind::Normal,
            Protocol::Protect,
            Robustness::Stalled,
            Priority::HIGH,
        );
        assert_eq!(p.set_ceiling_step(Priority::REALTIME), Ok(Priority::HIGH));
        assert_eq!(p.ceiling(), Priority::REALTIME);
    }

    #[test]
    fn robust_abandonment_hands_over_inconsistent() {
        let (mut k, owner) = ready_kernel(&[
            ("owner", Priority::NORMAL),
            ("waiter", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut m = MutexState::new(
            MutexKind::Normal,
            Protocol::None,
            Robustness::Robust,
            Priority::HIGH,
        );
        lock_now(&mut m, &mut k);

        // waiter parks on the mutex.
        k.yield_current();
        k.reschedule();
        let waiter = k.current;
        assert!(matches!(
            m.lock_step(&mut k, Deadline::Forever),
            Ok(Progress::Parked)
        ));
        k.reschedule();
        assert_eq!(k.current, owner);

        // Owner dies without unlocking.
        k.terminate_current(-1);
        assert!(m.is_inconsistent());
        assert_eq!(m.owner().map(|o| o.index()), Some(waiter));
        assert_eq!(k.threads[waiter].state, ThreadState::Ready);

        // The new owner repairs it; later unlock behaves normally.
        k.reschedule();
        assert_eq!(k.current, waiter);
        m.consistent_step(&mut k).unwrap();
        assert!(!m.is_inconsistent());
        m.unlock_step(&mut k).unwrap();
        assert!(!m.is_unrecoverable());
    }

    #[test]
    fn unlocking_unrepaired_mutex_poisons_it() {
        let (mut k, owner) = ready_kernel(&[
            ("owner", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let _ = owner;
        let mut m = MutexState::new(
            MutexKind::Normal,
            Protocol::None,
            Robustness::Robust,
            Priority::HIGH,
        );
        lock_now(&mut m, &mut k);
        m.inconsistent = true; // as the exit walk would leave it
        m.unlock_step(&mut k).unwrap();
        assert!(m.is_unrecoverable());
        assert_eq!(
            m.lock_step(&mut k, Deadline::Forever).unwrap_err(),
            Kind::NotRecoverable
        );
    }

    #[test]
    fn stalled_abandonment_keeps_mutex_dead_owned() {
        let (mut k, owner) = ready_kernel(&[
            ("owner", Priority::NORMAL),
            ("other", Priority::NORMAL),
        ]);
        let mut m = plain(MutexKind::Normal);
        lock_now(&mut m, &mut k);
        k.terminate_current(-1);
        // Still owned by the (dead) generation; a stranger can't unlock.
        assert_eq!(m.owner().map(|o| o.index()), Some(owner));
        k.reschedule();
        assert_eq!(m.unlock_step(&mut k).unwrap_err(), Kind::NotOwner);
    }

    #[test]
    fn timed_lock_times_out_and_unlink_is_clean() {
        let (mut k, _) = ready_kernel(&[
            ("owner", Priority::NORMAL),
            ("waiter", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut m = plain(MutexKind::Normal);
        lock_now(&mut m, &mut k);
        k.yield_current();
        k.reschedule();
        let waiter = k.current;
        assert!(matches!(
            m.lock_step(&mut k, Deadline::After(3)),
            Ok(Progress::Parked)
        ));
        k.reschedule();
        for _ in 0..3 {
            k.tick();
        }
        assert_eq!(k.threads[waiter].state, ThreadState::Ready);
        assert_eq!(k.threads[waiter].wake_reason, WakeReason::Timeout);
        assert_eq!(m.waiters(), 0);
        // Later unlock hands to nobody.
        m.unlock_step(&mut k).unwrap();
        assert_eq!(m.owner(), None);
    }
}
