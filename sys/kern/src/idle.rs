// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The idle thread.
//!
//! Runs at the lowest priority and is always runnable, which is what lets
//! the dispatcher assume the ready set is never empty. Each time it is
//! selected it runs the application idle hook (if any) with interrupts
//! enabled, then parks the core until the next interrupt.

use crate::arch;
use crate::startup::with_kernel;

pub(crate) fn idle_main(_arg: usize) -> i32 {
    // The hook is installed before any thread runs and never changes, so
    // one read suffices.
    let hook = with_kernel(|k, _| k.idle_hook);
    loop {
        if let Some(hook) = hook {
            hook();
        }
        arch::wait_for_interrupt();
    }
}
