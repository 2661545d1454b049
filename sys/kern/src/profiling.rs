// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of kernel events: how long
//! interrupt handlers run, how often the deferred reschedule trap fires, and
//! which thread is on the CPU when.
//!
//! The kernel does not assume any particular way of getting this information
//! out. A board that wants profiling populates an `EventsTable` and hands it
//! to `configure_events_table` before starting the kernel. A typical
//! implementation toggles GPIOs watched by a logic analyzer; keep the hooks
//! fast, since they run inside the gate and inside interrupt handlers.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks that must be provided by the board setup code if it wants to enable
/// kernel profiling.
///
/// If you provide an `EventsTable`, you have to provide every hook. To omit
/// one, use a closure that does nothing:
///
/// ```ignore
///   isr_enter: || (),
/// ```
pub struct EventsTable {
    /// Called on entry to any handler wrapped in `irq::isr`.
    pub isr_enter: fn(),
    /// Called on exit from any handler wrapped in `irq::isr`.
    pub isr_exit: fn(),
    /// Called on entry to the kernel's tick handler.
    pub timer_isr_enter: fn(),
    /// Called on exit from the kernel's tick handler.
    pub timer_isr_exit: fn(),
    /// Called on entry to the deferred reschedule trap.
    pub reschedule_enter: fn(),
    /// Called on exit from the deferred reschedule trap.
    pub reschedule_exit: fn(),
    /// Called whenever the current thread changes, with the index of the new
    /// thread in the thread table.
    pub context_switch: fn(usize),
}

/// Supplies the kernel with an events table.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Written by `configure_events_table`; null until then.
///
/// All accesses use `Relaxed` ordering: this is written once at startup and
/// read many times.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only write this pointer from a valid `&'static`.
        unsafe { Some(&*p) }
    }
}

/// Signals entry to an ISR. This is `pub` in case you write a handler that
/// doesn't go through `irq::isr` but you'd like it in the statistics.
pub fn event_isr_enter() {
    if let Some(t) = table() {
        (t.isr_enter)()
    }
}

/// Signals exit from an ISR. See `event_isr_enter`.
pub fn event_isr_exit() {
    if let Some(t) = table() {
        (t.isr_exit)()
    }
}

pub(crate) fn event_timer_isr_enter() {
    if let Some(t) = table() {
        (t.timer_isr_enter)()
    }
}

pub(crate) fn event_timer_isr_exit() {
    if let Some(t) = table() {
        (t.timer_isr_exit)()
    }
}

pub(crate) fn event_reschedule_enter() {
    if let Some(t) = table() {
        (t.reschedule_enter)()
    }
}

pub(crate) fn event_reschedule_exit() {
    if let Some(t) = table() {
        (t.reschedule_exit)()
    }
}

pub(crate) fn event_context_switch(idx: usize) {
    if let Some(t) = table() {
        (t.context_switch)(idx)
    }
}
