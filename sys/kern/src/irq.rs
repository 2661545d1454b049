// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt handler prologue and epilogue.
//!
//! Every handler that uses I-class operations runs its body inside `isr`.
//! Interrupt handlers never switch threads themselves. If the body made a
//! thread more important than the interrupted one ready, the epilogue pends
//! the deferred reschedule trap, which switches once the last nested handler
//! has returned.
//!
//! Handlers configured above the kernel level must not use `isr` or touch
//! the kernel at all.

use crate::arch;
use crate::gate;
use crate::sched::Kernel;

/// Runs `body` as the body of an interrupt handler.
pub fn isr<R>(kernel: &Kernel, body: impl FnOnce() -> R) -> R {
    crate::profiling::event_isr_enter();
    let r = body();
    let cs = gate::lock_from_isr();
    if kernel.is_resched_required_i(&cs) {
        arch::pend_reschedule();
    }
    cs.unlock();
    crate::profiling::event_isr_exit();
    r
}

/// The kernel tick handler: advances time and wakes expired timeouts.
pub fn systick(kernel: &Kernel) {
    crate::profiling::event_timer_isr_enter();
    isr(kernel, || {
        let cs = gate::lock_from_isr();
        kernel.tick_i(&cs);
    });
    crate::profiling::event_timer_isr_exit();
}
