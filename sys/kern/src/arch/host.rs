// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-in "architecture" for compiling and testing the portable kernel
//! on a development host.
//!
//! There is no context switching here: a reschedule request is recorded in
//! a flag that tests inspect and then act on by calling
//! [`crate::sched::Kernel::reschedule`] themselves, playing the role of
//! the pendable exception. The flags are thread-local so concurrently
//! running tests stay independent.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        assert_eq!($cond1, $cond2)
    };
}

/// No registers to save off-target.
#[derive(Debug, Default)]
pub struct SavedState {}

impl SavedState {
    pub const fn new() -> Self {
        Self {}
    }
}

std::thread_local! {
    static PENDING_SWITCH: Cell<bool> = const { Cell::new(false) };
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
}

static CLOCK_FREQ_KHZ: AtomicU32 = AtomicU32::new(0);

/// Records a deferred context-switch request.
pub fn pend_switch() {
    PENDING_SWITCH.with(|p| p.set(true));
}

/// Consumes and returns the recorded context-switch request. Test-only
/// analog of the pendable exception being taken.
pub fn take_pending_switch() -> bool {
    PENDING_SWITCH.with(|p| p.replace(false))
}

pub fn in_isr() -> bool {
    IN_ISR.with(|p| p.get())
}

/// Makes `in_isr` report `interrupt` until called again. Lets tests walk
/// the interrupt-context code paths.
pub fn simulate_isr(interrupt: bool) {
    IN_ISR.with(|p| p.set(interrupt));
}

pub unsafe fn set_clock_freq(khz: u32) {
    CLOCK_FREQ_KHZ.store(khz, Ordering::Relaxed);
}

pub unsafe fn set_current_thread(_t: &crate::thread::Thread) {}

pub fn init_frame(_t: &mut crate::thread::Thread) {}

pub fn wait_for_interrupt() {}

/// Sub-tick position of the (nonexistent) hardware timer: no residue, no
/// pending reload.
pub fn tick_residue() -> (u32, bool) {
    (0, false)
}

pub fn start_first_thread(
    _tick_divisor: u32,
    _t: &crate::thread::Thread,
) -> ! {
    panic!("context switching is not simulated on the host");
}
