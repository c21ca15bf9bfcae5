// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup, and the home of the kernel singleton.
//!
//! The embedder does basic hardware setup (clocks, vector table) in its own
//! `main`-equivalent, fills in a [`KernelDescriptor`], and calls
//! [`start_kernel`]. The kernel creates its two service threads (idle and
//! timers) plus the application's main thread, then dispatches the most
//! important of them and never returns.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::{Priority, ThreadFlags, ThreadId};
use critical_section::CriticalSection;

use crate::arch;
use crate::config;
use crate::sched::Kernel;
use crate::thread::Stack;

/// The kernel singleton.
///
/// Wrapped so it can be a `static` despite `Kernel` containing raw
/// pointers. All access funnels through [`with_kernel`].
struct KernelCell(UnsafeCell<Kernel>);

// Safety: single core; `with_kernel` serializes access behind the
// critical section and a reentry check.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new()));

/// Guards against reentrant `with_kernel`, which would alias the `&mut`.
static KERNEL_BORROWED: AtomicBool = AtomicBool::new(false);

/// Runs `f` with exclusive access to the kernel singleton, inside a
/// critical section. This is the only way kernel state is ever touched.
///
/// The critical-section token is passed along so callers can also borrow
/// synchronization-object cells within the same section.
pub(crate) fn with_kernel<R>(
    f: impl FnOnce(&mut Kernel, CriticalSection<'_>) -> R,
) -> R {
    critical_section::with(|cs| {
        uassert!(!KERNEL_BORROWED.swap(true, Ordering::Acquire));
        // Safety: the flag above guarantees we are the only borrower, and
        // `cs` keeps interrupt paths (which also use this accessor) from
        // running concurrently.
        let k = unsafe { &mut *KERNEL.0.get() };
        let r = f(k, cs);
        KERNEL_BORROWED.store(false, Ordering::Release);
        r
    })
}

/// Boot-time kernel parameters. Compile-time knobs live in [`config`].
pub struct KernelDescriptor {
    /// Application entry point, run on the main thread. Its return value
    /// becomes the main thread's exit code.
    pub main: fn() -> i32,
    /// Stack for the main thread; `None` uses the kernel's internal
    /// region of `config::MAIN_STACK_WORDS`.
    pub main_stack: Option<Stack>,
    /// Stack for the idle thread; `None` uses the internal region.
    pub idle_stack: Option<Stack>,
    /// Stack for the timer-service thread; `None` uses the internal
    /// region.
    pub timer_stack: Option<Stack>,
    /// Run by the idle thread, with interrupts enabled, whenever it is
    /// scheduled.
    pub idle_hook: Option<fn()>,
    /// Invoked from the tick handler when a thread's stack sentinel is
    /// found clobbered. Keep it short; it runs in interrupt context. If
    /// absent, a clobbered sentinel is fatal.
    pub overflow_hook: Option<fn(ThreadId, &'static str)>,
}

/// Backing storage for the stacks the kernel supplies itself when the
/// descriptor doesn't.
struct StackCell<const N: usize>(UnsafeCell<[u64; N]>);

// Safety: each cell is handed out exactly once, during `start_kernel`.
unsafe impl<const N: usize> Sync for StackCell<N> {}

static MAIN_STACK: StackCell<{ config::MAIN_STACK_WORDS }> =
    StackCell(UnsafeCell::new([0; config::MAIN_STACK_WORDS]));
static IDLE_STACK: StackCell<{ config::IDLE_STACK_WORDS }> =
    StackCell(UnsafeCell::new([0; config::IDLE_STACK_WORDS]));
static TIMER_STACK: StackCell<{ config::TIMER_STACK_WORDS }> =
    StackCell(UnsafeCell::new([0; config::TIMER_STACK_WORDS]));

/// Claims an internal stack region.
///
/// # Safety
///
/// Each cell may be claimed at most once; `start_kernel`'s single-call
/// contract guarantees it.
unsafe fn claim<const N: usize>(cell: &'static StackCell<N>) -> Stack {
    Stack::new(unsafe { &mut *cell.0.get() })
}

/// Shim giving the application `main` the shape of a thread entry.
fn main_shim(_arg: usize) -> i32 {
    let f = with_kernel(|k, _| k.main);
    match f {
        Some(f) => f(),
        None => 0,
    }
}

/// The main kernel entry point.
///
/// `tick_divisor` is the platform-specific count of timer input cycles per
/// kernel tick (on ARM M-profile, CPU cycles per tick; a tick is typically
/// a millisecond -- see `config::TICK_HZ`).
///
/// # Safety
///
/// This can be called exactly once per boot, from thread-mode startup code
/// running on the main stack, before any other kernel API.
pub unsafe fn start_kernel(
    desc: KernelDescriptor,
    tick_divisor: u32,
) -> ! {
    klog!("starting: clocks");
    // Safety: single startup call, per our own contract.
    unsafe {
        arch::set_clock_freq(tick_divisor);
    }

    let KernelDescriptor {
        main,
        main_stack,
        idle_stack,
        timer_stack,
        idle_hook,
        overflow_hook,
    } = desc;

    // Safety: first and only claim of each internal region.
    let main_stack =
        main_stack.unwrap_or_else(|| unsafe { claim(&MAIN_STACK) });
    let idle_stack =
        idle_stack.unwrap_or_else(|| unsafe { claim(&IDLE_STACK) });
    let timer_stack =
        timer_stack.unwrap_or_else(|| unsafe { claim(&TIMER_STACK) });

    klog!("starting: threads");
    let first = with_kernel(|k, _| {
        uassert!(!k.started);
        k.main = Some(main);
        k.idle_hook = idle_hook;
        k.overflow_hook = overflow_hook;

        let r = k.spawn_thread(
            "idle",
            Priority::IDLE,
            idle_stack,
            Some(crate::idle::idle_main),
            0,
            ThreadFlags::KERNEL,
        );
        uassert!(r.is_ok());
        let r = k.spawn_thread(
            "timers",
            config::TIMER_THREAD_PRIORITY,
            timer_stack,
            Some(crate::timer::service_main),
            0,
            ThreadFlags::KERNEL,
        );
        uassert!(r.is_ok());
        let r = k.spawn_thread(
            "main",
            Priority::NORMAL,
            main_stack,
            Some(main_shim),
            0,
            ThreadFlags::empty(),
        );
        uassert!(r.is_ok());

        k.started = true;
        // Dispatch: slot 0 (idle) is nominally current but not Running,
        // so this selects the most important ready thread.
        k.reschedule();
        k.current
    });

    klog!("starting: dispatch");
    // Safety: the kernel is quiescent here -- interrupts are not yet
    // ticking and no thread has run -- so reading the table outside
    // `with_kernel` cannot race; the reference is consumed by the
    // first-dispatch assembly.
    let thread = unsafe { &(*KERNEL.0.get()).threads[first] };
    arch::start_first_thread(tick_divisor, thread)
}
