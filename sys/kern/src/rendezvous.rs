// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-waiter rendezvous between a thread and an interrupt handler.
//!
//! A driver owns a `WaitSlot`. To wait for its hardware, a thread starts the
//! operation, takes the gate, checks whether it already finished, and if not
//! calls `Kernel::suspend_s`, which records the thread in the slot and puts
//! it to sleep in one step with the gate held. The driver's interrupt handler
//! calls `Kernel::resume_i`, which empties the slot and makes the thread
//! ready with a result code.
//!
//! Because the check and the sleep happen under one gate hold, an interrupt
//! that fires between starting the hardware and taking the gate is seen by
//! the check, and one that fires after is held off until the thread is
//! recorded in the slot. Either way the completion isn't lost.

use abi::{ReadyMsg, SchedState, ThreadId};

use crate::gate::{GateCell, Held, SysLock};
use crate::sched::Kernel;

/// A claim on a suspended thread, held by the slot it waits in.
///
/// Not `Clone`: there's exactly one, and resuming the thread consumes it.
#[derive(Debug, Eq, PartialEq)]
pub struct ThreadRef(ThreadId);

impl ThreadRef {
    pub fn id(&self) -> ThreadId {
        self.0
    }
}

/// Holds at most one waiting thread.
pub struct WaitSlot(GateCell<Option<ThreadRef>>);

impl WaitSlot {
    pub const fn new() -> Self {
        Self(GateCell::new(None))
    }

    pub fn is_empty(&self, cs: &impl Held) -> bool {
        self.0.borrow_mut(cs).is_none()
    }

    /// Records `r`, or hands it back if the slot is occupied.
    pub(crate) fn try_register(
        &self,
        cs: &impl Held,
        r: ThreadRef,
    ) -> Result<(), ThreadRef> {
        let mut slot = self.0.borrow_mut(cs);
        if slot.is_some() {
            return Err(r);
        }
        *slot = Some(r);
        Ok(())
    }

    fn register(&self, cs: &impl Held, r: ThreadRef) {
        if self.try_register(cs, r).is_err() {
            crate::fail::die("wait slot already occupied");
        }
    }

    pub(crate) fn take(&self, cs: &impl Held) -> Option<ThreadRef> {
        self.0.borrow_mut(cs).take()
    }

    /// Empties the slot if it still names `id`.
    fn forget(&self, cs: &impl Held, id: ThreadId) {
        let mut slot = self.0.borrow_mut(cs);
        if slot.as_ref().map(ThreadRef::id) == Some(id) {
            *slot = None;
        }
    }
}

impl Default for WaitSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Suspends the calling thread in `slot` until `resume_i` is called on
    /// it, or until `timeout` ticks pass. Returns the code passed to
    /// `resume_i`, or `ReadyMsg::TIMEOUT`.
    ///
    /// `Some(0)` returns `ReadyMsg::TIMEOUT` immediately without touching the
    /// slot. After a timeout the slot is empty again.
    ///
    /// Registering in a slot that already holds a thread is fatal.
    pub fn suspend_s(
        &self,
        cs: &SysLock,
        slot: &WaitSlot,
        timeout: Option<u32>,
    ) -> ReadyMsg {
        if timeout == Some(0) {
            return ReadyMsg::TIMEOUT;
        }
        let me = self.current_s(cs);
        slot.register(cs, ThreadRef(me));
        let msg =
            self.go_to_sleep_timeout_s(cs, SchedState::Suspended, timeout);
        if msg == ReadyMsg::TIMEOUT {
            slot.forget(cs, me);
        }
        msg
    }

    /// Makes the thread waiting in `slot` ready with `msg`, emptying the
    /// slot. Returns `false` if there was nobody to resume.
    ///
    /// Doesn't switch; from an interrupt handler, `irq::isr` takes care of
    /// that on the way out.
    pub fn resume_i(
        &self,
        cs: &impl Held,
        slot: &WaitSlot,
        msg: ReadyMsg,
    ) -> bool {
        match slot.take(cs) {
            Some(r) => self.state(cs).ready_if_suspended(r.0, msg),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{self, fake};
    use crate::gate;
    use crate::startup::KERNEL_PRIORITY;
    use abi::Priority;
    use core::cell::Cell;
    use proptest::prelude::*;
    use std::rc::Rc;

    const LINE: u32 = 5;

    extern "C" fn parked(_: usize) {}

    fn boot() -> (&'static Kernel, &'static WaitSlot) {
        fake::power_on();
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new()));
        kernel
            .create_thread(fake::leak_stack(512), Priority(3), parked, 0)
            .unwrap();
        kernel.start(fake::leak_stack(256), 1);
        (kernel, Box::leak(Box::new(WaitSlot::new())))
    }

    /// Installs a device interrupt that resumes `slot` with `msg` and
    /// reports whether anybody was there.
    fn install_device(
        kernel: &'static Kernel,
        slot: &'static WaitSlot,
        msg: ReadyMsg,
    ) -> Rc<Cell<Option<bool>>> {
        let result = Rc::new(Cell::new(None));
        let r = result.clone();
        fake::attach(LINE, move || {
            crate::irq::isr(kernel, || {
                let cs = gate::lock_from_isr();
                r.set(Some(kernel.resume_i(&cs, slot, msg)));
            })
        });
        arch::enable_irq(LINE, KERNEL_PRIORITY + 2);
        result
    }

    #[test]
    fn interrupt_resumes_the_suspended_thread() {
        let (kernel, slot) = boot();
        let result = install_device(kernel, slot, ReadyMsg(7));
        fake::set_idle_hook(|| fake::pend_irq(LINE));

        let msg = gate::with(|cs| {
            let msg = kernel.suspend_s(cs, slot, None);
            assert!(slot.is_empty(cs));
            msg
        });
        assert_eq!(msg, ReadyMsg(7));
        assert_eq!(result.get(), Some(true));
    }

    #[test]
    fn resume_on_an_empty_slot_does_nothing() {
        let (kernel, slot) = boot();
        let result = install_device(kernel, slot, ReadyMsg::OK);
        let before = fake::context_switches();
        fake::pend_irq(LINE);
        assert_eq!(result.get(), Some(false));
        assert_eq!(fake::context_switches(), before);
    }

    #[test]
    fn timeout_leaves_the_slot_empty() {
        let (kernel, slot) = boot();
        let result = install_device(kernel, slot, ReadyMsg::OK);

        let msg = gate::with(|cs| {
            let msg = kernel.suspend_s(cs, slot, Some(3));
            assert!(slot.is_empty(cs));
            msg
        });
        assert_eq!(msg, ReadyMsg::TIMEOUT);

        // The completion finally shows up; nobody is waiting any more.
        fake::pend_irq(LINE);
        assert_eq!(result.get(), Some(false));
    }

    #[test]
    fn zero_timeout_does_not_register() {
        let (kernel, slot) = boot();
        let before = fake::context_switches();
        gate::with(|cs| {
            assert_eq!(kernel.suspend_s(cs, slot, Some(0)), ReadyMsg::TIMEOUT);
            assert!(slot.is_empty(cs));
        });
        assert_eq!(fake::context_switches(), before);
    }

    #[test]
    fn completion_before_the_gate_is_not_lost() {
        // The device finishes while the thread is between starting it and
        // taking the gate. The driver's status check sees it, so the thread
        // never sleeps.
        let (kernel, slot) = boot();
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        fake::attach(LINE, move || {
            crate::irq::isr(kernel, || {
                d.set(true);
                let cs = gate::lock_from_isr();
                kernel.resume_i(&cs, slot, ReadyMsg::OK);
            })
        });
        arch::enable_irq(LINE, KERNEL_PRIORITY + 2);

        fake::pend_irq(LINE);
        let before = fake::context_switches();
        let msg = gate::with(|cs| {
            if done.get() {
                ReadyMsg::OK
            } else {
                kernel.suspend_s(cs, slot, None)
            }
        });
        assert_eq!(msg, ReadyMsg::OK);
        assert_eq!(fake::context_switches(), before);
    }

    #[test]
    fn resume_ignores_a_thread_that_is_not_suspended() {
        let (kernel, slot) = boot();
        gate::with(|cs| {
            let me = kernel.current_s(cs);
            slot.try_register(cs, ThreadRef(me)).unwrap();
            assert!(!kernel.resume_i(cs, slot, ReadyMsg::OK));
            assert!(slot.is_empty(cs));
            assert_eq!(kernel.state_of(cs, me), Some(SchedState::Running));
        });
    }

    #[test]
    #[should_panic(expected = "wait slot already occupied")]
    fn second_waiter_dies() {
        let (kernel, slot) = boot();
        gate::with(|cs| {
            let me = kernel.current_s(cs);
            slot.register(cs, ThreadRef(me));
            slot.register(cs, ThreadRef(me));
        });
    }

    proptest! {
        #[test]
        fn slot_holds_at_most_one_claim(
            ops in prop::collection::vec(prop::option::of(0usize..8), 1..40),
        ) {
            fake::power_on();
            let slot = WaitSlot::new();
            let mut model: Option<usize> = None;
            gate::with(|cs| {
                for op in ops {
                    match op {
                        Some(i) => {
                            let r = ThreadRef(ThreadId::for_index_and_gen(
                                i,
                                abi::Generation::ZERO,
                            ));
                            let accepted = slot.try_register(cs, r).is_ok();
                            assert_eq!(accepted, model.is_none());
                            if accepted {
                                model = Some(i);
                            }
                        }
                        None => {
                            let got = slot.take(cs).map(|r| r.id().index());
                            assert_eq!(got, model.take());
                        }
                    }
                }
            });
        }
    }
}
