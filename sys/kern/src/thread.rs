// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threads: the control block, the lifecycle, and per-thread signal flags.
//!
//! Thread control blocks live in the fixed kernel table; applications hold
//! [`ThreadId`]s (index + generation) and go through the free functions in
//! this module. A slot is recycled -- and its generation bumped, so stale
//! ids are caught -- when a terminated thread is joined, or immediately at
//! termination for detached threads.
//!
//! The lifecycle:
//!
//! ```text
//! inactive --spawn--> ready
//! ready --dispatch--> running
//! running --yield/preempt--> ready
//! running --wait--> suspended
//! suspended --wake--> ready
//! running --exit/cancel--> terminated
//! ```

use core::ptr::NonNull;

use abi::{
    Kind, Priority, ThreadFlags, ThreadId, ThreadState, WaitMode, WakeReason,
    SIG_JOIN, SIG_USER_MASK,
};

use crate::arch;
use crate::config;
use crate::sched::Kernel;
use crate::startup::with_kernel;
use crate::sync::mutex::MutexState;
use crate::wait::{self, Deadline, Progress, WaitList};

/// Thread entry point: receives the opaque argument passed at spawn,
/// returns the thread's exit code.
pub type Entry = fn(usize) -> i32;

/// The stack fill pattern, doubled up to the stack's word size. The word
/// at the very base of the stack serves as the overflow sentinel.
const STACK_FILL: u64 =
    (config::STACK_FILL_MAGIC as u64) << 32 | config::STACK_FILL_MAGIC as u64;

/// A stack region donated to the kernel for a thread's exclusive use.
///
/// The `u64` element type gives the 8-byte alignment the ARM procedure
/// call standard requires, by construction.
pub struct Stack {
    base: *mut u64,
    words: usize,
}

impl Stack {
    pub fn new(region: &'static mut [u64]) -> Self {
        Self {
            base: region.as_mut_ptr(),
            words: region.len(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.words * 8
    }
}

// Safety: a Stack is a unique handle to a 'static region; handing it to
// another thread hands over the region wholesale.
unsafe impl Send for Stack {}

/// Internal representation of a thread.
///
/// `repr(C)` with `save` first: the context-switch assembly finds the
/// saved-state area at offset zero of whatever `CURRENT_THREAD_PTR` points
/// to.
#[repr(C)]
pub struct Thread {
    /// Saved machine state. NOTE: it is critical that this field appear
    /// first!
    pub(crate) save: arch::SavedState,
    /// Diagnostic name; also handed to the stack-overflow hook.
    pub(crate) name: &'static str,
    pub(crate) state: ThreadState,
    /// Priority assigned by the application.
    pub(crate) base_priority: Priority,
    /// Effective priority: the base, possibly boosted by mutex protocols.
    pub(crate) priority: Priority,
    pub(crate) flags: ThreadFlags,
    /// Outcome tag of the most recent wait.
    pub(crate) wake_reason: WakeReason,
    /// Slot-recycling count; low bits become the id generation.
    pub(crate) generation: u32,
    pub(crate) entry: Option<Entry>,
    pub(crate) arg: usize,
    pub(crate) exit_code: i32,
    /// Thread waiting in `join` on us, if any. At most one.
    pub(crate) joiner: Option<u16>,
    pub(crate) stack_base: *mut u64,
    pub(crate) stack_words: usize,
    /// The wait queue this thread is parked on, if any. See the module
    /// docs in `wait` for the validity argument.
    pub(crate) wait_queue: Option<NonNull<WaitList>>,
    /// Per-thread signal bits (top byte reserved for the kernel).
    pub(crate) sig_bits: u32,
    /// Set while parked waiting for signal or event-flag delivery (a wait
    /// with no queue membership, in the signal case).
    pub(crate) sig_waiting: bool,
    /// Condition of the wait in progress: desired bits, mode, and whether
    /// satisfied bits are consumed on wake.
    pub(crate) want_mask: u32,
    pub(crate) want_mode: WaitMode,
    pub(crate) want_clear: bool,
    /// Bits observed by the wait that just completed.
    pub(crate) wait_result: u32,
    /// Head of the list of mutexes this thread currently owns, threaded
    /// through `MutexState::next_owned`.
    pub(crate) owned: Option<NonNull<MutexState>>,
    /// Times this thread has been switched in.
    pub(crate) switches: u32,
    /// Whole ticks during which this thread was the running thread.
    pub(crate) ticks_consumed: u64,
}

impl Thread {
    /// An unused table slot.
    pub(crate) const fn empty() -> Self {
        Thread {
            save: arch::SavedState::new(),
            name: "",
            state: ThreadState::Inactive,
            base_priority: Priority::NONE,
            priority: Priority::NONE,
            flags: ThreadFlags::empty(),
            wake_reason: WakeReason::Ok,
            generation: 0,
            entry: None,
            arg: 0,
            exit_code: 0,
            joiner: None,
            stack_base: core::ptr::null_mut(),
            stack_words: 0,
            wait_queue: None,
            sig_bits: 0,
            sig_waiting: false,
            want_mask: 0,
            want_mode: WaitMode::Any,
            want_clear: false,
            wait_result: 0,
            owned: None,
            switches: 0,
            ticks_consumed: 0,
        }
    }

    /// Returns this thread's current generation number.
    pub(crate) fn generation(&self) -> abi::Generation {
        const MASK: u8 = ((1u32 << (16 - ThreadId::INDEX_BITS)) - 1) as u8;
        abi::Generation::from(self.generation as u8 & MASK)
    }

    pub(crate) fn bump_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    pub(crate) fn record_switch(&mut self) {
        self.switches = self.switches.wrapping_add(1);
    }

    /// Clears transient wait bookkeeping and records the outcome tag.
    pub(crate) fn end_wait(&mut self, reason: WakeReason) {
        self.sig_waiting = false;
        self.wake_reason = reason;
    }

    pub(crate) fn set_wait_queue(&mut self, q: NonNull<WaitList>) {
        self.wait_queue = Some(q);
    }

    pub(crate) fn clear_wait_queue(&mut self) -> Option<NonNull<WaitList>> {
        self.wait_queue.take()
    }

    pub(crate) fn wait_queue(&self) -> Option<NonNull<WaitList>> {
        self.wait_queue
    }

    pub(crate) fn stack_region(&self) -> (*mut u64, usize) {
        (self.stack_base, self.stack_words)
    }

    /// Writes the fill pattern over the whole stack region.
    fn fill_stack(&mut self) {
        // Safety: the region was donated via `Stack` and belongs
        // exclusively to this slot; the thread has not started yet.
        unsafe {
            for i in 0..self.stack_words {
                self.stack_base.add(i).write(STACK_FILL);
            }
        }
    }

    /// Checks the overflow sentinel: the word at the stack base must still
    /// hold the fill pattern.
    pub(crate) fn stack_sentinel_intact(&self) -> bool {
        if self.stack_base.is_null() {
            return true;
        }
        // Safety: the base pointer is within the region this slot owns.
        unsafe { core::ptr::read_volatile(self.stack_base) == STACK_FILL }
    }

    /// Counts bytes between the stack base and the deepest point the
    /// thread has ever touched, by scanning for intact fill words.
    fn stack_untouched_bytes(&self) -> usize {
        let mut n = 0;
        // Safety: in-bounds reads of the owned region.
        unsafe {
            while n < self.stack_words
                && self.stack_base.add(n).read() == STACK_FILL
            {
                n += 1;
            }
        }
        n * 8
    }

    pub(crate) fn save(&self) -> &arch::SavedState {
        &self.save
    }

    pub(crate) fn save_mut(&mut self) -> &mut arch::SavedState {
        &mut self.save
    }

    #[cfg(test)]
    pub(crate) fn clobber_stack_sentinel_for_test(&mut self) {
        unsafe { self.stack_base.write(0) };
    }
}

/// First code executed by every new thread, entered through the synthetic
/// exception frame built by `arch::init_frame`. Runs the entry function
/// and turns its return into an explicit exit.
#[cfg_attr(not(target_arch = "arm"), allow(dead_code))] // entered via frame
pub(crate) extern "C" fn thread_trampoline() -> ! {
    let (entry, arg) = with_kernel(|k, _| {
        let t = &k.threads[k.current];
        (t.entry, t.arg)
    });
    let code = match entry {
        Some(f) => f(arg),
        None => 0,
    };
    exit(code)
}

impl Kernel {
    /// Admits a new thread: claims a free slot, prepares the stack and
    /// initial frame, and places it on the ready set.
    pub(crate) fn spawn_thread(
        &mut self,
        name: &'static str,
        priority: Priority,
        stack: Stack,
        entry: Option<Entry>,
        arg: usize,
        flags: ThreadFlags,
    ) -> abi::Result<ThreadId> {
        if !priority.is_schedulable() {
            return Err(Kind::Invalid);
        }
        if stack.words < config::MIN_STACK_WORDS {
            return Err(Kind::Invalid);
        }
        let idx = self
            .threads
            .iter()
            .position(|t| t.state == ThreadState::Inactive)
            .ok_or(Kind::NoMemory)?;

        let t = &mut self.threads[idx];
        t.name = name;
        t.base_priority = priority;
        t.priority = priority;
        t.flags = flags;
        t.wake_reason = WakeReason::Ok;
        t.entry = entry;
        t.arg = arg;
        t.exit_code = 0;
        t.joiner = None;
        t.stack_base = stack.base;
        t.stack_words = stack.words;
        t.wait_queue = None;
        t.sig_bits = 0;
        t.sig_waiting = false;
        t.wait_result = 0;
        t.owned = None;
        t.fill_stack();
        arch::init_frame(t);
        t.state = ThreadState::Ready;
        let p = t.priority.0;
        let id = ThreadId::for_index_and_gen(idx, t.generation());
        uassert!(self.ready.insert(idx as u16, p).is_ok());
        self.maybe_preempt(idx);
        Ok(id)
    }

    /// Returns a slot to the free pool, invalidating outstanding ids.
    pub(crate) fn release_slot(&mut self, idx: usize) {
        let t = &mut self.threads[idx];
        t.state = ThreadState::Inactive;
        t.bump_generation();
        t.name = "";
        t.entry = None;
        t.joiner = None;
        t.stack_base = core::ptr::null_mut();
        t.stack_words = 0;
        t.sig_bits = 0;
        t.flags = ThreadFlags::empty();
    }

    /// Ends the running thread: final stack check, mutex abandonment,
    /// joiner notification, and (for detached threads) immediate slot
    /// reclamation. The caller must follow with a switch.
    pub(crate) fn terminate_current(&mut self, code: i32) {
        let cur = self.current;

        // Last chance to catch a quiet overflow before the stack becomes
        // unowned.
        if !self.threads[cur].stack_sentinel_intact()
            && !self.threads[cur].flags.contains(ThreadFlags::STACK_SMASHED)
        {
            self.threads[cur].flags |= ThreadFlags::STACK_SMASHED;
            let id = ThreadId::for_index_and_gen(
                cur,
                self.threads[cur].generation(),
            );
            let name = self.threads[cur].name;
            match self.overflow_hook {
                Some(hook) => hook(id, name),
                None => crate::fail::die("stack overflow"),
            }
        }

        crate::sync::mutex::abandon_owned(self, cur);

        let t = &mut self.threads[cur];
        t.state = ThreadState::Terminated;
        t.exit_code = code;
        let joiner = t.joiner;
        let detached = t.flags.contains(ThreadFlags::DETACHED);

        if let Some(j) = joiner {
            self.deliver_signals(j as usize, SIG_JOIN);
        }
        if detached {
            self.release_slot(cur);
        }
        arch::pend_switch();
    }

    /// ORs signal bits into a thread's mask and completes its signal wait
    /// if the bits it asked for are now present.
    pub(crate) fn deliver_signals(&mut self, idx: usize, mask: u32) {
        let satisfied = {
            let t = &mut self.threads[idx];
            t.sig_bits |= mask;
            if t.sig_waiting
                && t.want_mode.is_satisfied(t.sig_bits, t.want_mask)
            {
                let observed = t.sig_bits;
                if t.want_clear {
                    t.sig_bits &= !t.want_mask;
                }
                t.wait_result = observed;
                true
            } else {
                false
            }
        };
        if satisfied {
            self.wake(idx, WakeReason::Ok);
        }
    }
}

/// Creates a thread and admits it to the scheduler. May preempt the caller
/// immediately if the new thread is more important. Callable from thread
/// context only.
pub fn spawn(
    name: &'static str,
    priority: Priority,
    stack: Stack,
    entry: Entry,
    arg: usize,
) -> abi::Result<ThreadId> {
    if arch::in_isr() {
        return Err(Kind::NotPermitted);
    }
    with_kernel(|k, _| {
        k.spawn_thread(
            name,
            priority,
            stack,
            Some(entry),
            arg,
            ThreadFlags::empty(),
        )
    })
}

/// Returns the id of the calling thread.
pub fn current() -> ThreadId {
    with_kernel(|k, _| k.current_id())
}

/// Returns a thread's diagnostic name.
pub fn name_of(id: ThreadId) -> abi::Result<&'static str> {
    with_kernel(|k, _| k.check_id(id).map(|idx| k.threads[idx].name))
}

/// Places the caller at the back of its priority's FIFO and lets the
/// dispatcher re-pick. A no-op from interrupt context.
pub fn yield_now() {
    if arch::in_isr() {
        return;
    }
    with_kernel(|k, _| k.yield_current());
}

/// Terminates the calling thread with `code`. The exit value is retained
/// for a joiner unless the thread is detached.
pub fn exit(code: i32) -> ! {
    debug_assert!(!arch::in_isr(), "thread exit from interrupt context");
    with_kernel(|k, _| k.terminate_current(code));
    // The pended switch fires as soon as the critical section above ends;
    // we never get here. Satisfy the type system (and a failing switch)
    // with an idle spin.
    loop {
        arch::wait_for_interrupt();
    }
}

/// Blocks until `id` terminates and returns its exit code, releasing its
/// slot. Fails with `Deadlock` for self-join, `Invalid` for detached or
/// kernel threads, and `Invalid` if another thread already holds the join
/// claim.
pub fn join(id: ThreadId) -> abi::Result<i32> {
    let progress = with_kernel(|k, _| -> abi::Result<Progress<i32>> {
        let idx = k.check_id(id)?;
        if idx == k.current {
            return Err(Kind::Deadlock);
        }
        let t = &k.threads[idx];
        if t.flags.contains(ThreadFlags::DETACHED)
            || t.flags.contains(ThreadFlags::KERNEL)
        {
            return Err(Kind::Invalid);
        }
        if t.state == ThreadState::Terminated {
            let code = t.exit_code;
            k.release_slot(idx);
            return Ok(Progress::Done(code));
        }
        if t.joiner.is_some() {
            return Err(Kind::Invalid);
        }
        k.begin_block()?;
        let cur = k.current;
        k.threads[idx].joiner = Some(cur as u16);
        let me = &mut k.threads[cur];
        me.sig_bits &= !SIG_JOIN;
        me.want_mask = SIG_JOIN;
        me.want_mode = WaitMode::All;
        me.want_clear = true;
        me.sig_waiting = true;
        k.park_current(None);
        Ok(Progress::Parked)
    })?;

    match progress {
        Progress::Done(code) => Ok(code),
        Progress::Parked => match wait::finish_block() {
            WakeReason::Ok => with_kernel(|k, _| {
                let idx = k.check_id(id)?;
                let code = k.threads[idx].exit_code;
                k.release_slot(idx);
                Ok(code)
            }),
            reason => {
                // Interrupted (or, impossibly, timed out): withdraw the
                // join claim so someone else may take it.
                with_kernel(|k, _| {
                    if let Ok(idx) = k.check_id(id) {
                        let cur = k.current as u16;
                        if k.threads[idx].joiner == Some(cur) {
                            k.threads[idx].joiner = None;
                        }
                    }
                });
                Err(match reason {
                    WakeReason::Timeout => Kind::Timeout,
                    _ => Kind::Interrupted,
                })
            }
        },
    }
}

/// Promises that no one will join `id`; a terminated detached thread's
/// slot is reclaimed immediately.
pub fn detach(id: ThreadId) -> abi::Result<()> {
    with_kernel(|k, _| {
        let idx = k.check_id(id)?;
        let t = &mut k.threads[idx];
        if t.flags.contains(ThreadFlags::DETACHED)
            || t.flags.contains(ThreadFlags::KERNEL)
            || t.joiner.is_some()
        {
            return Err(Kind::Invalid);
        }
        t.flags |= ThreadFlags::DETACHED;
        if t.state == ThreadState::Terminated {
            k.release_slot(idx);
        }
        Ok(())
    })
}

/// Requests asynchronous interruption of `id`: a wait in progress ends
/// with `Interrupted`, and otherwise the next attempt to block reports it.
/// The target is expected to observe the error and unwind to `exit`; the
/// kernel does not force-unwind.
pub fn cancel(id: ThreadId) -> abi::Result<()> {
    with_kernel(|k, _| {
        let idx = k.check_id(id)?;
        if k.threads[idx].flags.contains(ThreadFlags::KERNEL) {
            return Err(Kind::Invalid);
        }
        k.threads[idx].flags |= ThreadFlags::INTERRUPTED;
        if k.threads[idx].state == ThreadState::Suspended
            && k.wake(idx, WakeReason::Interrupted)
        {
            // The interruption was delivered into the wait; consume it.
            k.threads[idx].flags.remove(ThreadFlags::INTERRUPTED);
        }
        Ok(())
    })
}

/// Reads a thread's assigned (base) priority.
pub fn priority(id: ThreadId) -> abi::Result<Priority> {
    with_kernel(|k, _| k.check_id(id).map(|idx| k.threads[idx].base_priority))
}

/// Updates a thread's assigned priority. The effective priority (which a
/// mutex protocol may be boosting) is recomputed, and the thread is
/// repositioned in whatever queue it occupies; the change may cause an
/// immediate reschedule.
pub fn set_priority(id: ThreadId, priority: Priority) -> abi::Result<()> {
    if !priority.is_schedulable() {
        return Err(Kind::Invalid);
    }
    with_kernel(|k, _| {
        let idx = k.check_id(id)?;
        k.threads[idx].base_priority = priority;
        let eff = crate::sync::mutex::effective_priority(k, idx);
        k.set_effective_priority(idx, eff);
        Ok(())
    })
}

/// Suspends the calling thread until another thread calls [`resume`] (or
/// it is cancelled).
pub fn suspend() -> abi::Result<()> {
    with_kernel(|k, _| -> abi::Result<()> {
        k.begin_block()?;
        k.park_current(None);
        Ok(())
    })?;
    wait::block_result()
}

/// Wakes a suspended thread with reason `ok`, wherever it is parked; this
/// is the "awakened explicitly" case of the sleep and wait contracts. A
/// thread that is not suspended is left alone.
pub fn resume(id: ThreadId) -> abi::Result<()> {
    with_kernel(|k, _| {
        let idx = k.check_id(id)?;
        k.wake(idx, WakeReason::Ok);
        Ok(())
    })
}

/// Raises signal bits on a thread (ISR-safe); returns the resulting mask.
/// Bits outside [`SIG_USER_MASK`] are rejected.
pub fn raise_signals(id: ThreadId, mask: u32) -> abi::Result<u32> {
    if mask == 0 || mask & !SIG_USER_MASK != 0 {
        return Err(Kind::Invalid);
    }
    with_kernel(|k, _| {
        let idx = k.check_id(id)?;
        k.deliver_signals(idx, mask);
        Ok(k.threads[idx].sig_bits)
    })
}

/// Waits until the calling thread's signal mask satisfies `mask` under
/// `mode`; `clear` consumes the requested bits on completion. Returns the
/// bits observed at the moment the condition held.
pub fn wait_signals(
    mask: u32,
    mode: WaitMode,
    clear: bool,
) -> abi::Result<u32> {
    wait_signals_inner(mask, mode, clear, Deadline::Forever)
}

/// Non-blocking form of [`wait_signals`]; fails with `WouldBlock` when the
/// condition does not already hold.
pub fn try_wait_signals(
    mask: u32,
    mode: WaitMode,
    clear: bool,
) -> abi::Result<u32> {
    wait_signals_inner(mask, mode, clear, Deadline::Poll)
}

/// Timed form of [`wait_signals`]. A zero tick count is the polling form.
pub fn timed_wait_signals(
    mask: u32,
    mode: WaitMode,
    clear: bool,
    ticks: u64,
) -> abi::Result<u32> {
    wait_signals_inner(mask, mode, clear, Deadline::after(ticks))
}

fn wait_signals_inner(
    mask: u32,
    mode: WaitMode,
    clear: bool,
    deadline: Deadline,
) -> abi::Result<u32> {
    if mask == 0 || mask & !SIG_USER_MASK != 0 {
        return Err(Kind::Invalid);
    }
    let progress = with_kernel(|k, _| -> abi::Result<Progress<u32>> {
        let cur = k.current;
        let t = &mut k.threads[cur];
        if mode.is_satisfied(t.sig_bits, mask) {
            let observed = t.sig_bits;
            if clear {
                t.sig_bits &= !mask;
            }
            return Ok(Progress::Done(observed));
        }
        if deadline.is_poll() {
            return Err(Kind::WouldBlock);
        }
        k.begin_block()?;
        let until = deadline.resolve(k.ticks);
        let t = &mut k.threads[cur];
        t.want_mask = mask;
        t.want_mode = mode;
        t.want_clear = clear;
        t.sig_waiting = true;
        k.park_current(until);
        Ok(Progress::Parked)
    })?;
    match progress {
        Progress::Done(bits) => Ok(bits),
        Progress::Parked => {
            wait::block_result()?;
            Ok(with_kernel(|k, _| k.threads[k.current].wait_result))
        }
    }
}

/// Number of context switches into `id` so far.
pub fn switch_count(id: ThreadId) -> abi::Result<u32> {
    with_kernel(|k, _| k.check_id(id).map(|idx| k.threads[idx].switches))
}

/// Whole ticks during which `id` was the running thread. Tick-granular
/// (the tick handler charges whoever it lands on), so short bursts
/// between ticks are invisible.
pub fn cpu_ticks(id: ThreadId) -> abi::Result<u64> {
    with_kernel(|k, _| k.check_id(id).map(|idx| k.threads[idx].ticks_consumed))
}

/// Bytes at the shallow end of `id`'s stack that have never been written,
/// judged by the fill pattern. A crude high-water mark.
pub fn stack_headroom(id: ThreadId) -> abi::Result<usize> {
    with_kernel(|k, _| {
        k.check_id(id).map(|idx| k.threads[idx].stack_untouched_bytes())
    })
}

/// Counts live (non-free, non-terminated) threads.
pub fn live_count() -> usize {
    with_kernel(|k, _| {
        config::MAX_THREADS
            - k.count_in_state(ThreadState::Inactive)
            - k.count_in_state(ThreadState::Terminated)
    })
}
