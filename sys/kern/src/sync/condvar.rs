// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Condition variables.
//!
//! `wait` is atomic with respect to the mutex release: the caller is
//! enqueued *and* the mutex unlocked inside one critical section, so a
//! signal arriving immediately after the release cannot be lost. On any
//! wake -- condition, timeout, or interruption -- the mutex is reacquired
//! before the call returns.
//!
//! A condition variable binds to the first mutex it is used with and
//! rejects others (`Invalid`) until it goes idle; once no one is waiting,
//! the next `wait` may rebind it.

use abi::{Kind, WakeReason};

use crate::lock::KCell;
use crate::startup::with_kernel;
use crate::sync::mutex::Mutex;
use crate::wait::{self, Deadline, WaitList};

pub(crate) struct CondState {
    queue: WaitList,
    /// Address of the associated mutex; identity only, never
    /// dereferenced.
    bound: Option<usize>,
}

/// A condition variable, used with a [`Mutex`].
pub struct Condvar {
    state: KCell<CondState>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            state: KCell::new(CondState {
                queue: WaitList::new(),
                bound: None,
            }),
        }
    }

    /// Atomically releases `mutex` and blocks until signalled, then
    /// reacquires `mutex` before returning.
    ///
    /// Fails with `NotOwner` if the caller does not hold the mutex, with
    /// `NotPermitted` if it holds it recursively, and with `Invalid` if
    /// the condvar is bound to a different mutex.
    pub fn wait(
        &'static self,
        mutex: &'static Mutex,
    ) -> abi::Result<()> {
        self.wait_inner(mutex, Deadline::Forever)
    }

    /// Like [`Self::wait`] with a timeout. On expiry the mutex is still
    /// reacquired, then `Timeout` is returned. A zero tick count is
    /// clamped to one (there is no polling form of a condition wait).
    pub fn timed_wait(
        &'static self,
        mutex: &'static Mutex,
        ticks: u64,
    ) -> abi::Result<()> {
        self.wait_inner(mutex, Deadline::After(ticks.max(1)))
    }

    fn wait_inner(
        &'static self,
        mutex: &'static Mutex,
        deadline: Deadline,
    ) -> abi::Result<()> {
        with_kernel(|k, cs| -> abi::Result<()> {
            let mut cv = self.state.borrow_mut(cs);
            let mut ms = mutex.state_cell().borrow_mut(cs);

            if ms.owner() != Some(k.current_id()) {
                return Err(Kind::NotOwner);
            }
            if ms.recursion_depth() > 1 {
                // A single release step can't fully surrender a recursive
                // hold.
                return Err(Kind::NotPermitted);
            }

            // Identity check against the bound mutex; idle condvars
            // rebind.
            let mptr = mutex as *const Mutex as usize;
            if cv.queue.is_empty() {
                cv.bound = Some(mptr);
            } else if cv.bound != Some(mptr) {
                return Err(Kind::Invalid);
            }

            k.begin_block()?;
            cv.queue.park(k, deadline.resolve(k.ticks));
            // Release the mutex with full unlock semantics (priority
            // restore, hand-off). Ownership and depth were verified, so
            // this cannot fail.
            let released = ms.unlock_step(k);
            uassert!(released.is_ok());
            Ok(())
        })?;

        // Parked; collect the verdict once resumed, then reacquire.
        let reason = wait::finish_block();
        mutex.lock()?;
        match reason {
            WakeReason::Ok => Ok(()),
            WakeReason::Timeout => Err(Kind::Timeout),
            WakeReason::Interrupted => Err(Kind::Interrupted),
        }
    }

    /// Wakes the most important waiter, if any. Holding the associated
    /// mutex is not required, but wake ordering is only predictable when
    /// the caller does hold it.
    pub fn signal(&self) -> abi::Result<()> {
        with_kernel(|k, cs| {
            self.state.borrow_mut(cs).queue.wake_one(k, WakeReason::Ok);
            Ok(())
        })
    }

    /// Wakes every waiter. They reacquire the mutex one at a time, in
    /// scheduling order.
    pub fn broadcast(&self) -> abi::Result<()> {
        with_kernel(|k, cs| {
            self.state.borrow_mut(cs).queue.wake_all(k, WakeReason::Ok);
            Ok(())
        })
    }

    /// Number of threads currently waiting.
    pub fn waiters(&self) -> usize {
        with_kernel(|_, cs| self.state.borrow_mut(cs).queue.waiters())
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Kernel;
    use crate::sync::mutex::{MutexKind, MutexState, Protocol, Robustness};
    use crate::thread::testing::ready_kernel;
    use crate::wait::Progress;
    use abi::{Priority, ThreadState};

    fn plain_mutex() -> MutexState {
        MutexState::new(
            MutexKind::Normal,
            Protocol::None,
            Robustness::Stalled,
            Priority::HIGH,
        )
    }

    /// The state-level body of `wait_inner`: enqueue then release.
    fn cv_wait(
        cv: &mut CondState,
        m: &mut MutexState,
        k: &mut Kernel,
        deadline: Option<u64>,
    ) {
        cv.queue.park(k, deadline);
        m.unlock_step(k).unwrap();
        k.reschedule();
    }

    fn fresh_cv() -> CondState {
        CondState {
            queue: WaitList::new(),
            bound: None,
        }
    }

    #[test]
    fn wait_releases_mutex_and_signal_wakes_one() {
        let (mut k, consumer) = ready_kernel(&[
            ("consumer", Priority::NORMAL),
            ("producer", Priority::NORMAL),
        ]);
        let mut cv = fresh_cv();
        let mut m = plain_mutex();

        // Consumer holds the mutex and waits.
        assert!(matches!(
            m.lock_step(&mut k, Deadline::Forever),
            Ok(Progress::Done(false))
        ));
        cv_wait(&mut cv, &mut m, &mut k, None);
        let producer = k.current;
        assert_ne!(producer, consumer);
        // The wait released the lock: the producer can take it at once.
        assert!(matches!(
            m.lock_step(&mut k, Deadline::Forever),
            Ok(Progress::Done(false))
        ));

        // Producer signals (holding the mutex), then unlocks.
        cv.queue.wake_one(&mut k, WakeReason::Ok);
        assert_eq!(k.threads[consumer].state, ThreadState::Ready);
        assert_eq!(k.threads[consumer].wake_reason, WakeReason::Ok);
        m.unlock_step(&mut k).unwrap();
        // Consumer reacquires on resume (wrapper-level `mutex.lock()`).
        k.reschedule();
    }

    #[test]
    fn signal_wakes_exactly_one_broadcast_wakes_all() {
        let (mut k, _) = ready_kernel(&[
            ("w1", Priority::NORMAL),
            ("w2", Priority::NORMAL),
            ("w3", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut cv = fresh_cv();
        let mut m = plain_mutex();
        let mut parked = vec![];
        for _ in 0..3 {
            assert!(matches!(
                m.lock_step(&mut k, Deadline::Forever),
                Ok(Progress::Done(false))
            ));
            parked.push(k.current);
            cv_wait(&mut cv, &mut m, &mut k, None);
        }
        assert_eq!(cv.queue.waiters(), 3);

        cv.queue.wake_one(&mut k, WakeReason::Ok);
        assert_eq!(cv.queue.waiters(), 2);
        assert_eq!(k.threads[parked[0]].state, ThreadState::Ready);
        assert_eq!(k.threads[parked[1]].state, ThreadState::Suspended);

        cv.queue.wake_all(&mut k, WakeReason::Ok);
        assert_eq!(cv.queue.waiters(), 0);
        for &w in &parked {
            assert_eq!(k.threads[w].state, ThreadState::Ready);
        }
    }

    #[test]
    fn timed_wait_expiry_leaves_queue_clean() {
        let (mut k, waiter) = ready_kernel(&[
            ("w", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let mut cv = fresh_cv();
        let mut m = plain_mutex();
        assert!(matches!(
            m.lock_step(&mut k, Deadline::Forever),
            Ok(Progress::Done(false))
        ));
        let deadline = k.ticks + 4;
        cv_wait(&mut cv, &mut m, &mut k, Some(deadline));
        for _ in 0..4 {
            k.tick();
        }
        assert_eq!(k.threads[waiter].state, ThreadState::Ready);
        assert_eq!(k.threads[waiter].wake_reason, WakeReason::Timeout);
        assert_eq!(cv.queue.waiters(), 0);
    }
}
