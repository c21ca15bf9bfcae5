// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv{6,7,8}-M.
//!
//! # ARM-M timer
//!
//! We use the system tick timer as the kernel clock. Its counter is small
//! and only counts down, so at each SysTick interrupt we advance the 64-bit
//! tick count held by the kernel. This means we take regular interrupts to
//! maintain time, but need no SoC-specific timer support.
//!
//! # Notes on ARM-M interrupts
//!
//! This port uses three exception vectors:
//!
//! - `SVCall` is used exactly once, to bounce from kernel startup into the
//!   first thread. Threads call kernel services as ordinary (privileged)
//!   function calls, so there is no syscall path through here.
//! - `SysTick` maintains the tick count and runs timed wakeups.
//! - `PendSV` performs deferred context switches.
//!
//! The split between wake-up decisions and the actual switch matters for
//! interrupt latency. On exception entry the processor stacks only a small
//! frame; the callee-save registers stay live. Code that wants to resume a
//! *different* thread must spill all of that state somewhere predictable --
//! the thread's control block -- and reload it for the incoming thread.
//! That is relatively costly, so we only do it in an exception that we know
//! is switching: any ISR (SysTick included) that wakes a more important
//! thread just pokes the `PendSV` pending bit, and `PendSV` -- configured
//! at the lowest exception priority -- tail-chains after the ISR stack
//! unwinds and does the full save/restore around the scheduler. This is the
//! standard Cortex-M deferred-switch pattern.
//!
//! `PendSV` and `SysTick` both sit below the kernel's critical-section
//! threshold, so neither can fire while kernel state is being mutated; a
//! switch requested inside a critical section lands immediately after the
//! section ends.

use core::arch::global_asm;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use zerocopy::{FromBytes, FromZeros};

use crate::config;
use crate::thread::Thread;

/// Log things from kernel context. This macro is made visible to the rest
/// of the kernel by a chain of `#[macro_use]` attributes, but its
/// implementation is very architecture-specific at the moment.
///
/// There are two ways to log: via semihosting (the "klog-semihosting"
/// feature) or via the ARM Instrumentation Trace Macrocell ("klog-itm").
/// If neither feature is enabled, klog! is stubbed out.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        if !($cond1 == $cond2) {
            panic!("Assertion failed!");
        }
    };
}

/// On ARMvx-M we have to use a global to record the current thread pointer,
/// since we don't have a scratch register.
#[no_mangle]
static CURRENT_THREAD_PTR: AtomicPtr<Thread> =
    AtomicPtr::new(core::ptr::null_mut());

/// To allow our clock frequency to be easily determined from a debugger, we
/// store it in memory.
#[no_mangle]
static CLOCK_FREQ_KHZ: AtomicU32 = AtomicU32::new(0);

/// ARMvx-M volatile registers that must be saved across context switches,
/// plus the per-thread interrupt-mask state required by the port contract.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous, in this order!
    // The context-switch assembly walks this struct directly.
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
    /// Saved interrupt-mask state (BASEPRI on v7/v8-M, PRIMASK on v6-M),
    /// so the critical-section nesting a thread was preempted with is
    /// reinstated when it next runs.
    mask: u32,
    reserved: u32,

    // gosh it would sure be nice if cfg_if were legal here
    #[cfg(any(armv7m, armv8m))]
    s16: u32,
    #[cfg(any(armv7m, armv8m))]
    s17: u32,
    #[cfg(any(armv7m, armv8m))]
    s18: u32,
    #[cfg(any(armv7m, armv8m))]
    s19: u32,
    #[cfg(any(armv7m, armv8m))]
    s20: u32,
    #[cfg(any(armv7m, armv8m))]
    s21: u32,
    #[cfg(any(armv7m, armv8m))]
    s22: u32,
    #[cfg(any(armv7m, armv8m))]
    s23: u32,
    #[cfg(any(armv7m, armv8m))]
    s24: u32,
    #[cfg(any(armv7m, armv8m))]
    s25: u32,
    #[cfg(any(armv7m, armv8m))]
    s26: u32,
    #[cfg(any(armv7m, armv8m))]
    s27: u32,
    #[cfg(any(armv7m, armv8m))]
    s28: u32,
    #[cfg(any(armv7m, armv8m))]
    s29: u32,
    #[cfg(any(armv7m, armv8m))]
    s30: u32,
    #[cfg(any(armv7m, armv8m))]
    s31: u32,
    // NOTE: the above fields must be kept contiguous!
}

impl SavedState {
    /// All-zero state, spelled out because `Default::default` is not
    /// `const` and the thread table is built in a `const` context.
    pub const fn new() -> Self {
        Self {
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            psp: 0,
            exc_return: 0,
            mask: 0,
            reserved: 0,
            #[cfg(any(armv7m, armv8m))]
            s16: 0,
            #[cfg(any(armv7m, armv8m))]
            s17: 0,
            #[cfg(any(armv7m, armv8m))]
            s18: 0,
            #[cfg(any(armv7m, armv8m))]
            s19: 0,
            #[cfg(any(armv7m, armv8m))]
            s20: 0,
            #[cfg(any(armv7m, armv8m))]
            s21: 0,
            #[cfg(any(armv7m, armv8m))]
            s22: 0,
            #[cfg(any(armv7m, armv8m))]
            s23: 0,
            #[cfg(any(armv7m, armv8m))]
            s24: 0,
            #[cfg(any(armv7m, armv8m))]
            s25: 0,
            #[cfg(any(armv7m, armv8m))]
            s26: 0,
            #[cfg(any(armv7m, armv8m))]
            s27: 0,
            #[cfg(any(armv7m, armv8m))]
            s28: 0,
            #[cfg(any(armv7m, armv8m))]
            s29: 0,
            #[cfg(any(armv7m, armv8m))]
            s30: 0,
            #[cfg(any(armv7m, armv8m))]
            s31: 0,
        }
    }
}

/// Stuff placed on the stack at exception entry whether or not an FPU is
/// present.
#[derive(Debug, FromBytes, Default)]
#[repr(C)]
pub struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

cfg_if::cfg_if! {
    if #[cfg(any(armv7m, armv8m))] {
        /// Extended version for FPU.
        #[derive(Debug, FromBytes, Default)]
        #[repr(C)]
        pub struct ExtendedExceptionFrame {
            base: BaseExceptionFrame,
            fpu_regs: [u32; 16],
            fpscr: u32,
            reserved: u32,
        }
    } else if #[cfg(armv6m)] {
        /// Wee version for non-FPU.
        #[derive(Debug, FromBytes, Default)]
        #[repr(C)]
        pub struct ExtendedExceptionFrame {
            base: BaseExceptionFrame,
        }
    } else {
        compile_error!("unknown M-profile");
    }
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// EXC_RETURN value used to enter threads: thread mode, process stack,
/// standard frame. We assume TrustZone has not been enabled.
const EXC_RETURN_CONST: u32 = 0xFFFFFFED;

// Because debuggers need to know the clock frequency to set the SWO clock
// scaler that enables ITM, and because ITM is particularly useful when
// debugging boot failures, this should be set as early in boot as it can
// be.
pub unsafe fn set_clock_freq(tick_divisor: u32) {
    CLOCK_FREQ_KHZ.store(tick_divisor, Ordering::Relaxed);
}

/// Kernel interrupt-masking through the `critical-section` crate.
///
/// On v7/v8-M we raise `BASEPRI` to the configured threshold instead of
/// setting `PRIMASK`, so interrupts configured *above* the threshold (lower
/// numeric value) keep running inside kernel critical sections. Such
/// handlers must not call into the kernel. v6-M has no `BASEPRI`, so there
/// the threshold degenerates to PRIMASK and every interrupt is held off.
struct KernelCriticalSection;
critical_section::set_impl!(KernelCriticalSection);

#[cfg(any(armv7m, armv8m))]
unsafe impl critical_section::Impl for KernelCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let prior = cortex_m::register::basepri::read();
        cortex_m::register::basepri_max::write(
            config::CRITICAL_SECTION_THRESHOLD,
        );
        core::sync::atomic::compiler_fence(Ordering::SeqCst);
        prior
    }

    unsafe fn release(prior: critical_section::RawRestoreState) {
        core::sync::atomic::compiler_fence(Ordering::SeqCst);
        cortex_m::register::basepri::write(prior);
    }
}

#[cfg(armv6m)]
unsafe impl critical_section::Impl for KernelCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let was_active = !cortex_m::register::primask::read().is_active();
        cortex_m::interrupt::disable();
        was_active as u8
    }

    unsafe fn release(was_active: critical_section::RawRestoreState) {
        if was_active != 0 {
            cortex_m::interrupt::enable();
        }
    }
}

/// Records the address of `thread` as the current thread.
///
/// # Safety
///
/// This records a pointer that aliases `thread`. As long as you don't read
/// that pointer while you have access to `thread`, and as long as the
/// `thread` being stored is actually in the thread table, you'll be okay.
pub unsafe fn set_current_thread(thread: &Thread) {
    CURRENT_THREAD_PTR.store(thread as *const _ as *mut _, Ordering::Relaxed);
}

/// Requests a context switch by pending `PendSV`. The switch happens when
/// execution next drops below the critical-section threshold.
pub fn pend_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Checks whether we are executing in an interrupt handler.
pub fn in_isr() -> bool {
    !matches!(
        cortex_m::peripheral::SCB::vect_active(),
        cortex_m::peripheral::scb::VectActive::ThreadMode
    )
}

/// Parks the core until the next interrupt; used by the idle thread.
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Reads the sub-tick position of the hardware timer.
///
/// Returns `(cycles, tick_pending)`: cycles elapsed inside the current
/// tick, and whether a timer reload has occurred that the `SysTick` handler
/// has not yet folded into the tick count. Callers combine this with the
/// tick count inside a single critical section; when `tick_pending` is
/// set, the counter value belongs to the *next* tick.
pub fn tick_residue() -> (u32, bool) {
    // Safety: reading SYST/SCB registers has no side effects.
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };

    let reload = syst.rvr.read();
    let mut current = syst.cvr.read();
    const PENDSTSET: u32 = 1 << 26;
    let pending = scb.icsr.read() & PENDSTSET != 0;
    if pending {
        // The reload may have happened after our first read; re-read so the
        // residue and the pending flag describe the same instant.
        current = syst.cvr.read();
    }
    (reload.wrapping_sub(current), pending)
}

/// Builds the synthetic exception frame that makes the first dispatch of a
/// new thread "return" into the thread entry trampoline with interrupts
/// enabled and the process stack selected.
pub fn init_frame(thread: &mut Thread) {
    let (base, words) = thread.stack_region();
    let top = base as usize + words * 8;

    // Modern ARMvX-M machines require 8-byte stack alignment; the stack is
    // an array of u64 so this holds by construction, but the thread table
    // being corrupt would break it. Check.
    uassert!(top & 0x7 == 0);

    let frame_size = core::mem::size_of::<ExtendedExceptionFrame>();
    uassert!(words * 8 > frame_size);
    let frame_addr = top - frame_size;

    let mut frame = ExtendedExceptionFrame::new_zeroed();
    frame.base.pc = crate::thread::thread_trampoline as usize as u32 | 1;
    frame.base.xpsr = INITIAL_PSR;
    frame.base.lr = 0xFFFF_FFFF; // trap if the trampoline ever returns

    // Safety: frame_addr lies within the stack region this thread owns, is
    // 8-aligned, and no other code is using that memory yet.
    unsafe {
        core::ptr::write(frame_addr as *mut ExtendedExceptionFrame, frame);
    }

    let save = thread.save_mut();
    *save = SavedState::default();
    save.psp = frame_addr as u32;
    save.exc_return = EXC_RETURN_CONST;
}

/// Starts the tick source and dispatches the first thread. Never returns.
pub fn start_first_thread(tick_divisor: u32, thread: &Thread) -> ! {
    // Set exception priorities to keep the kernel non-preemptive: all
    // kernel entry points (SVCall, PendSV, SysTick) share the lowest
    // priority level, fault handlers stay above them so we can detect
    // faults in the kernel.
    //
    // Safety: we're purely lowering priorities from their defaults, so this
    // can't cause surprise preemption; the register writes are `unsafe` in
    // the `cortex_m` API only.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        cfg_if::cfg_if! {
            if #[cfg(armv7m)] {
                scb.shcsr.modify(|x| x | 0b111 << 16);
            } else if #[cfg(armv8m)] {
                scb.shcsr.modify(|x| x | 0b1111 << 16);
            } else if #[cfg(armv6m)] {
                // This facility is missing.
            } else {
                compile_error!("missing fault setup for ARM profile");
            }
        }

        cfg_if::cfg_if! {
            if #[cfg(armv6m)] {
                // ARMv6 has 4 priority levels and no configurable fault
                // priorities. SVCall, SysTick, PendSV all to 3 (lowest
                // configurable).
                scb.shpr[0].modify(|x| x | 0b11 << 30);
                scb.shpr[1].modify(|x| x | 0b11 << 22 | 0b11 << 30);
            } else if #[cfg(any(armv7m, armv8m))] {
                // Faults to 0 (highest configurable).
                scb.shpr[0].write(0x00);
                scb.shpr[1].write(0x00);
                scb.shpr[2].write(0x00);
                // SVCall, SysTick, PendSV to 0xFF (lowest configurable).
                scb.shpr[7].write(0xFF);
                scb.shpr[10].write(0xFF);
                scb.shpr[11].write(0xFF);
            } else {
                compile_error!("missing exception priorities for ARM profile");
            }
        }

        // Default every external interrupt to the lowest priority, which is
        // numerically above the critical-section threshold: out of the box,
        // no vendor interrupt can preempt a kernel critical section. The
        // embedder may selectively raise handlers that do not call into the
        // kernel.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        cfg_if::cfg_if! {
            if #[cfg(armv6m)] {
                // On ARMv6 the 8 IPR registers are 32 bits wide and only
                // bits [7:6] of each byte are implemented; writes to other
                // bits are ignored. See ARMv6-M ARM B3.4.7.
                for i in 0..8 {
                    nvic.ipr[i].write(0xFFFF_FFFF);
                }
            } else if #[cfg(any(armv7m, armv8m))] {
                // Interrupt count lives in the ICTR, in blocks of 32.
                let icb = &*cortex_m::peripheral::ICB::PTR;
                let irq_block_count = (icb.ictr.read() as usize & 0xF) + 1;
                for i in 0..irq_block_count * 32 {
                    nvic.ipr[i].write(0xFFu8);
                }
            } else {
                compile_error!("missing IRQ priorities for ARM profile");
            }
        }
    }

    // Configure the tick timer.
    //
    // Safety: this, too, is safe in practice but unsafe in API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(tick_divisor - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt.
        syst.csr.modify(|v| v | 0b111);
    }

    CURRENT_THREAD_PTR
        .store(thread as *const _ as *mut _, Ordering::Relaxed);

    // Safety: setting the Process (thread) stack pointer has no effect
    // while this code runs on the Main (kernel) stack.
    unsafe {
        cortex_m::register::psp::write(thread.save().psp);
    }

    // Flip into Handler mode by trapping, so the exception return machinery
    // can select the process stack and "resume" the first thread through
    // the synthetic frame built by `init_frame`. The SVC entry sequence
    // below detects this one startup use and branches accordingly. Threads
    // stay privileged: kernel services are plain function calls.
    cfg_if::cfg_if! {
        if #[cfg(armv6m)] {
            unsafe {
                core::arch::asm!("
                    @ restore the callee-save registers
                    ldm r0!, {{r4-r7}}
                    ldm r0, {{r0-r3}}
                    mov r11, r3
                    mov r10, r2
                    mov r9, r1
                    mov r8, r0
                    @ Trap into the kernel.
                    svc #0xFF
                    @ noreturn generates a UDF here in case that should
                    @ return.
                    ",
                    in("r0") &thread.save().r4,
                    options(noreturn),
                )
            }
        } else if #[cfg(any(armv7m, armv8m))] {
            unsafe {
                core::arch::asm!("
                    @ Restore callee-save registers.
                    ldm {thread}, {{r4-r11}}
                    @ Trap into the kernel.
                    svc #0xFF
                    @ noreturn generates a UDF here in case that should
                    @ return.
                    ",
                    thread = in(reg) &thread.save().r4,
                    options(noreturn),
                )
            }
        } else {
            compile_error!("missing first-thread bootstrap for ARM profile");
        }
    }
}

// Handler that gets linked into the vector table for the Supervisor Call
// (SVC) instruction. (Name is dictated by the `cortex_m` crate.)
//
// The kernel has no syscalls, so the only legitimate SVC is the one issued
// by `start_first_thread` from the Main stack; we detect that case by
// inspecting LR and treat any other SVC as a programming error.
cfg_if::cfg_if! {
    if #[cfg(armv6m)] {
        global_asm!{"
            .section .text.SVCall
            .globl SVCall
            .type SVCall,function
            SVCall:
                @ Inspect LR to figure out the caller's mode.
                mov r0, lr
                ldr r1, =0xFFFFFFF3
                bics r0, r0, r1
                @ Thread mode + main stack means kernel startup.
                cmp r0, #0x8
                beq 1f
                @ Anything else should not happen; fault loudly.
                udf #0xFF

            1:  @ Starting the first thread: manufacture an EXC_RETURN that
                @ selects thread mode on the process stack. Privilege is
                @ retained.
                ldr r0, ={exc_return}
                mov lr, r0
                bx lr
        ",
        exc_return = const EXC_RETURN_CONST,
        }
    } else if #[cfg(any(armv7m, armv8m))] {
        global_asm!{"
            .section .text.SVCall
            .globl SVCall
            .type SVCall,function
            SVCall:
                @ Inspect LR to figure out the caller's mode.
                mov r0, lr
                mov r1, #0xFFFFFFF3
                bic r0, r1
                @ Thread mode + main stack means kernel startup.
                cmp r0, #0x8
                beq 1f
                @ Anything else should not happen; fault loudly.
                udf #0xFF

            1:  @ Starting the first thread: manufacture an EXC_RETURN that
                @ selects thread mode on the process stack. Privilege is
                @ retained.
                mov lr, {exc_return}
                bx lr
            ",
            exc_return = const EXC_RETURN_CONST,
        }
    } else {
        compile_error!("missing SVCall impl for ARM profile.");
    }
}

// PendSV: the deferred context-switch exception.
//
// Saves the outgoing thread's callee-save registers, stack pointer,
// EXC_RETURN, and interrupt-mask state into its control block (whose
// `SavedState` must be the first field, see `Thread`), asks the scheduler
// for the next thread, and restores symmetrically -- possibly for a
// different thread.
cfg_if::cfg_if! {
    if #[cfg(armv6m)] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                @ Get a pointer to the current thread's save area.
                ldr r0, =CURRENT_THREAD_PTR
                ldr r1, [r0]
                @ Store the low callee-saves.
                stm r1!, {{r4-r7}}
                @ Move the high registers down where v6-M stm can see them.
                mov r4, r8
                mov r5, r9
                mov r6, r10
                mov r7, r11
                stm r1!, {{r4-r7}}
                @ PSP, EXC_RETURN, PRIMASK.
                mrs r4, PSP
                mov r5, lr
                mrs r6, PRIMASK
                movs r7, #0
                stm r1!, {{r4-r7}}

                bl pendsv_entry

                @ We're returning into *some* thread, maybe not the same one.
                ldr r0, =CURRENT_THREAD_PTR
                ldr r0, [r0]
                @ Restore the high registers and mask state first.
                movs r1, r0
                adds r1, r1, #(4 * 4)
                ldm r1!, {{r4-r7}}
                mov r11, r7
                mov r10, r6
                mov r9, r5
                mov r8, r4
                ldm r1!, {{r4-r7}}
                msr PSP, r4
                mov lr, r5
                msr PRIMASK, r6
                @ Now the low callee-saves.
                ldm r0!, {{r4-r7}}

                bx lr
            ",
        }
    } else if #[cfg(any(armv7m, armv8m))] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                @ Get a pointer to the current thread's save area.
                movw r0, #:lower16:CURRENT_THREAD_PTR
                movt r0, #:upper16:CURRENT_THREAD_PTR
                ldr r1, [r0]
                @ Fetch the process stack pointer; keeping it in r12 makes
                @ the register order in the stm below line up with the
                @ SavedState layout.
                mrs r12, PSP
                @ Callee-saves, PSP, EXC_RETURN.
                stm r1!, {{r4-r12, lr}}
                @ Interrupt-mask state plus the reserved pad word.
                mrs r2, BASEPRI
                movs r3, #0
                stm r1!, {{r2, r3}}
                @ FPU callee-saves.
                vstm r1, {{s16-s31}}

                bl pendsv_entry

                @ We're returning into *some* thread, maybe not the same one.
                movw r0, #:lower16:CURRENT_THREAD_PTR
                movt r0, #:upper16:CURRENT_THREAD_PTR
                ldr r0, [r0]
                ldm r0!, {{r4-r12, lr}}
                ldm r0!, {{r2, r3}}
                msr BASEPRI, r2
                vldm r0, {{s16-s31}}
                msr PSP, r12

                bx lr
            ",
        }
    } else {
        compile_error!("missing PendSV impl for ARM profile.");
    }
}

/// The Rust side of the PendSV handler, after all volatile registers have
/// been saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    crate::startup::with_kernel(|k, _| k.reschedule());
}

/// Handler that gets linked into the vector table for the System Tick Timer
/// overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::time::systick();
}
