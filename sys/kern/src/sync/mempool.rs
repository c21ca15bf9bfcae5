// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-block memory pools.
//!
//! The free list is threaded through the unallocated blocks themselves:
//! the first machine word of each free block points at the next. Blocks
//! are handed out from the head and returned at the tail, so allocation
//! is FIFO over frees (fairness over cache warmth).
//!
//! Per the kernel's error policy, returning a pointer that is not a block
//! of this pool is an invariant violation and fatal, not a recoverable
//! error.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use abi::{Kind, WakeReason};

use crate::lock::KCell;
use crate::sched::Kernel;
use crate::startup::with_kernel;
use crate::wait::{self, Deadline, Progress, WaitList};

pub(crate) struct PoolState {
    head: *mut u8,
    tail: *mut u8,
    free: usize,
    seeded: bool,
    queue: WaitList,
}

// Safety: the raw pointers reference the pool's own storage and are only
// touched inside kernel critical sections.
unsafe impl Send for PoolState {}

impl PoolState {
    const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
            free: 0,
            seeded: false,
            queue: WaitList::new(),
        }
    }

    /// Links every block of `base` into the free list, in address order.
    fn seed(&mut self, base: *mut u8, block: usize, blocks: usize) {
        // Safety: `base` spans `block * blocks` bytes of storage owned by
        // the pool; each write targets the first word of a distinct
        // block, and alignment is asserted at construction.
        unsafe {
            for i in 0..blocks {
                let b = base.add(i * block) as *mut *mut u8;
                let next = if i + 1 < blocks {
                    base.add((i + 1) * block)
                } else {
                    core::ptr::null_mut()
                };
                b.write(next);
            }
        }
        self.head = base;
        // Safety: in-bounds offset of the last block.
        self.tail = unsafe { base.add((blocks - 1) * block) };
        self.free = blocks;
        self.seeded = true;
    }

    /// Pops the head free block, or reports `WouldBlock` when exhausted.
    fn pop(&mut self) -> abi::Result<NonNull<u8>> {
        let p = self.head;
        if p.is_null() {
            return Err(Kind::WouldBlock);
        }
        // Safety: `p` is a free block; its first word is the next link,
        // written by `seed` or `push`.
        self.head = unsafe { (p as *mut *mut u8).read() };
        if self.head.is_null() {
            self.tail = core::ptr::null_mut();
        }
        self.free -= 1;
        // Safety: free-list members are never null.
        Ok(unsafe { NonNull::new_unchecked(p) })
    }

    /// Appends a returned block at the tail and feeds one waiter.
    fn push(&mut self, k: &mut Kernel, p: *mut u8) {
        // Safety: `p` was validated as a block boundary by the caller.
        unsafe {
            (p as *mut *mut u8).write(core::ptr::null_mut());
            if self.tail.is_null() {
                self.head = p;
            } else {
                (self.tail as *mut *mut u8).write(p);
            }
        }
        self.tail = p;
        self.free += 1;
        self.queue.wake_one(k, WakeReason::Ok);
    }
}

/// A pool of `BLOCKS` fixed blocks of `BLOCK` bytes, with its own backing
/// storage.
pub struct Pool<const BLOCK: usize, const BLOCKS: usize> {
    storage: UnsafeCell<Storage<BLOCK, BLOCKS>>,
    state: KCell<PoolState>,
}

/// Backing bytes, aligned so every block can hold the free-list word.
#[repr(C, align(8))]
struct Storage<const BLOCK: usize, const BLOCKS: usize>([[u8; BLOCK]; BLOCKS]);

// Safety: all access to `storage` is mediated by `state`, which is only
// reachable inside kernel critical sections.
unsafe impl<const BLOCK: usize, const BLOCKS: usize> Sync
    for Pool<BLOCK, BLOCKS>
{
}

impl<const BLOCK: usize, const BLOCKS: usize> Pool<BLOCK, BLOCKS> {
    pub const fn new() -> Self {
        assert!(BLOCKS > 0);
        // The free list lives in the blocks, so a block must hold (and
        // align) a pointer.
        assert!(BLOCK >= core::mem::size_of::<*mut u8>());
        assert!(BLOCK % core::mem::size_of::<*mut u8>() == 0);
        Self {
            storage: UnsafeCell::new(Storage([[0; BLOCK]; BLOCKS])),
            state: KCell::new(PoolState::new()),
        }
    }

    fn base(&self) -> *mut u8 {
        self.storage.get() as *mut u8
    }

    /// Takes a block without blocking; `WouldBlock` when the pool is
    /// exhausted. Interrupt-safe.
    pub fn try_alloc(&self) -> abi::Result<NonNull<u8>> {
        with_kernel(|_, cs| {
            let mut st = self.state.borrow_mut(cs);
            if !st.seeded {
                st.seed(self.base(), BLOCK, BLOCKS);
            }
            st.pop()
        })
    }

    /// Takes a block, blocking until one is freed.
    pub fn alloc(&'static self) -> abi::Result<NonNull<u8>> {
        self.alloc_inner(Deadline::Forever)
    }

    /// Timed allocation; zero ticks is the polling form.
    pub fn timed_alloc(&'static self, ticks: u64) -> abi::Result<NonNull<u8>> {
        self.alloc_inner(Deadline::after(ticks))
    }

    fn alloc_inner(&'static self, deadline: Deadline) -> abi::Result<NonNull<u8>> {
        let until = match deadline {
            Deadline::Poll => return self.try_alloc(),
            Deadline::Forever => None,
            Deadline::After(t) => Some(with_kernel(|k, _| k.ticks + t)),
        };
        loop {
            let progress = with_kernel(|k, cs| {
                let mut st = self.state.borrow_mut(cs);
                if !st.seeded {
                    st.seed(self.base(), BLOCK, BLOCKS);
                }
                match st.pop() {
                    Ok(p) => Ok(Progress::Done(p)),
                    Err(Kind::WouldBlock) => {
                        k.begin_block()?;
                        if let Some(d) = until {
                            if d <= k.ticks {
                                return Err(Kind::Timeout);
                            }
                        }
                        st.queue.park(k, until);
                        Ok(Progress::Parked)
                    }
                    Err(e) => Err(e),
                }
            })?;
            match progress {
                Progress::Done(p) => return Ok(p),
                Progress::Parked => wait::block_result()?,
            }
        }
    }

    /// Returns a block to the pool and feeds the most important waiter.
    ///
    /// A pointer outside the pool, or not on a block boundary, is fatal.
    pub fn free(&self, ptr: NonNull<u8>) {
        with_kernel(|k, cs| {
            let p = ptr.as_ptr();
            let offset = (p as usize).wrapping_sub(self.base() as usize);
            uassert!(offset < BLOCK * BLOCKS);
            uassert_eq!(offset % BLOCK, 0);
            let mut st = self.state.borrow_mut(cs);
            uassert!(st.seeded);
            st.push(k, p);
        });
    }

    pub const fn block_size(&self) -> usize {
        BLOCK
    }

    pub const fn capacity(&self) -> usize {
        BLOCKS
    }

    /// Blocks currently free. A pool that has never allocated reports
    /// full capacity.
    pub fn free_blocks(&self) -> usize {
        with_kernel(|_, cs| {
            let st = self.state.borrow_mut(cs);
            if st.seeded {
                st.free
            } else {
                BLOCKS
            }
        })
    }

    /// Threads blocked in `alloc` waiting for a block.
    pub fn waiters(&self) -> usize {
        with_kernel(|_, cs| self.state.borrow_mut(cs).queue.waiters())
    }
}

impl<const BLOCK: usize, const BLOCKS: usize> Default for Pool<BLOCK, BLOCKS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::testing::ready_kernel;
    use abi::{Priority, ThreadState};

    const BLOCK: usize = 16;
    const BLOCKS: usize = 4;

    fn leaked_storage() -> *mut u8 {
        let mem = Box::leak(vec![0u64; BLOCK * BLOCKS / 8].into_boxed_slice());
        mem.as_mut_ptr() as *mut u8
    }

    #[test]
    fn blocks_are_distinct_and_on_boundaries() {
        let base = leaked_storage();
        let mut st = PoolState::new();
        st.seed(base, BLOCK, BLOCKS);
        let mut seen = vec![];
        for _ in 0..BLOCKS {
            let p = st.pop().unwrap().as_ptr();
            let off = p as usize - base as usize;
            assert_eq!(off % BLOCK, 0);
            assert!(!seen.contains(&p));
            seen.push(p);
        }
        assert_eq!(st.pop().unwrap_err(), Kind::WouldBlock);
    }

    #[test]
    fn frees_are_fifo() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let base = leaked_storage();
        let mut st = PoolState::new();
        st.seed(base, BLOCK, BLOCKS);
        let a = st.pop().unwrap().as_ptr();
        let b = st.pop().unwrap().as_ptr();
        // Drain the rest so order is fully determined by our frees.
        while st.pop().is_ok() {}

        st.push(&mut k, b);
        st.push(&mut k, a);
        assert_eq!(st.pop().unwrap().as_ptr(), b);
        assert_eq!(st.pop().unwrap().as_ptr(), a);
    }

    #[test]
    fn free_count_tracks_population() {
        let (mut k, _) = ready_kernel(&[("a", Priority::NORMAL)]);
        let base = leaked_storage();
        let mut st = PoolState::new();
        st.seed(base, BLOCK, BLOCKS);
        assert_eq!(st.free, BLOCKS);
        let p = st.pop().unwrap();
        assert_eq!(st.free, BLOCKS - 1);
        st.push(&mut k, p.as_ptr());
        assert_eq!(st.free, BLOCKS);
    }

    #[test]
    fn exhausted_pool_parks_and_free_feeds_waiter() {
        let (mut k, waiter) = ready_kernel(&[
            ("w", Priority::NORMAL),
            ("idle", Priority::IDLE),
        ]);
        let base = leaked_storage();
        let mut st = PoolState::new();
        st.seed(base, BLOCK, BLOCKS);
        let mut held = vec![];
        for _ in 0..BLOCKS {
            held.push(st.pop().unwrap());
        }
        assert_eq!(st.pop().unwrap_err(), Kind::WouldBlock);

        st.queue.park(&mut k, None);
        k.reschedule();
        assert_eq!(k.threads[waiter].state, ThreadState::Suspended);

        st.push(&mut k, held.pop().unwrap().as_ptr());
        assert_eq!(k.threads[waiter].state, ThreadState::Ready);
        assert_eq!(k.threads[waiter].wake_reason, WakeReason::Ok);
        // The woken waiter's retry finds the block.
        assert!(st.pop().is_ok());
    }
}
