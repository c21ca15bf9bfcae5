// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel deaths such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is zero (false) from
//!   boot, and set to one (true) if the kernel reaches [`die`] -- either
//!   explicitly or through `panic!`. Any other value means memory was
//!   corrupted on the way down.
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine
//!   writes as much of the failure reason into this buffer (as UTF-8) as
//!   fits, truncating the rest. For printing, trim trailing NUL bytes.
//!
//! Kernel invariant violations are fatal by policy: they are never
//! surfaced as recoverable result codes.

#[cfg(target_os = "none")]
use core::{
    fmt::{Display, Write},
    sync::atomic::Ordering,
};

#[cfg(target_os = "none")]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // We'd love an AtomicBool here but we have to support ARMv6-M.
    //
    // Safety: this is the only site that touches the flag, and it runs at
    // most once meaningfully; a second arrival means a recursive panic,
    // which we pin in place below rather than making things worse.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        loop {
            // Platform-independent NOP
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only the single successful flag-setter gets here, so the
    // mutable reference is exclusive.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` for the debugger and halts. The kernel's terminal state.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut sink = Epitaph { dest: buf };
    write!(sink, "{msg}").ok();

    loop {
        // Platform-independent NOP
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(target_os = "none")]
struct Epitaph {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl Write for Epitaph {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}

/// Host stand-in: a kernel death is an ordinary test failure.
#[cfg(not(target_os = "none"))]
pub fn die(msg: impl core::fmt::Display) -> ! {
    panic!("kernel died: {msg}");
}
