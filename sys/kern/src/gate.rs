// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The critical-section gate.
//!
//! The gate is a single, process-wide interrupt priority threshold. Taking it
//! raises the threshold to the kernel level, which keeps every interrupt
//! handler that is allowed to call I-class operations from running, while
//! handlers configured above the kernel level still preempt freely. (Those
//! must never touch kernel state.)
//!
//! There are two ways in:
//!
//! - `lock` from thread context. The threshold goes from "user" (nothing
//!   masked) to "kernel" and back again on release.
//! - `lock_from_isr` from inside a handler. The previous threshold is
//!   remembered and restored exactly, so a handler never opens up interrupts
//!   that were masked when it was entered.
//!
//! Each returns a token whose lifetime is the locked region. Dropping the
//! token releases the gate. I-class operations take `&impl Held`; operations
//! that may switch threads take `&SysLock` specifically, so they can't be
//! reached from a handler.
//!
//! The gate does not nest. Taking it while it's already held from the same
//! context is a programming error and halts the system.
//!
//! Underneath the gate there are three raw masking states, for startup code
//! and the odd sequence that must not be interrupted at all: `disable` masks
//! everything maskable, `suspend` leaves only the kernel level masked, and
//! `enable` unmasks everything. They hand out no token and know nothing of
//! the gate's bookkeeping, so they must not be mixed with a held gate.

use core::cell::{RefCell, RefMut};
use core::marker::PhantomData;

use crate::arch;

/// Proof that the current thread holds the gate.
///
/// Not `Send`: the gate belongs to whatever is running on the CPU.
pub struct SysLock {
    _not_send: PhantomData<*mut ()>,
}

/// Proof that the current interrupt handler holds the gate.
pub struct IsrLock {
    prev: u32,
    _not_send: PhantomData<*mut ()>,
}

/// Takes the gate from thread context.
pub fn lock() -> SysLock {
    arch::lock();
    SysLock {
        _not_send: PhantomData,
    }
}

/// Takes the gate from inside an interrupt handler.
pub fn lock_from_isr() -> IsrLock {
    let prev = arch::lock_from_isr();
    IsrLock {
        prev,
        _not_send: PhantomData,
    }
}

/// Masks every maskable interrupt, including those above the kernel level.
pub fn disable() {
    arch::disable();
}

/// Masks interrupts at and below the kernel level, and unmasks the rest.
pub fn suspend() {
    arch::suspend();
}

/// Unmasks every interrupt.
pub fn enable() {
    arch::enable();
}

/// Runs `body` with the gate held from thread context.
pub fn with<R>(body: impl FnOnce(&SysLock) -> R) -> R {
    let cs = lock();
    body(&cs)
}

impl SysLock {
    /// Releases the gate. Equivalent to dropping the token.
    pub fn unlock(self) {}
}

impl Drop for SysLock {
    fn drop(&mut self) {
        arch::unlock();
    }
}

impl IsrLock {
    /// Releases the gate. Equivalent to dropping the token.
    pub fn unlock(self) {}
}

impl Drop for IsrLock {
    fn drop(&mut self) {
        arch::unlock_from_isr(self.prev);
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::SysLock {}
    impl Sealed for super::IsrLock {}
}

/// Implemented by both gate tokens.
pub trait Held: sealed::Sealed {}

impl Held for SysLock {}
impl Held for IsrLock {}

/// Data shared between threads and interrupt handlers, reachable only while
/// the gate is held.
pub struct GateCell<T>(RefCell<T>);

// Safety: every access goes through `borrow_mut`, which demands a gate token,
// and the gate admits one holder at a time on a single core.
unsafe impl<T: Send> Sync for GateCell<T> {}

impl<T> GateCell<T> {
    pub const fn new(value: T) -> Self {
        Self(RefCell::new(value))
    }

    /// Borrows the contents for as long as the gate token lives.
    ///
    /// Borrowing twice at once means kernel code re-entered itself, which is
    /// fatal.
    pub fn borrow_mut<'a, H: Held>(&'a self, _cs: &'a H) -> RefMut<'a, T> {
        match self.0.try_borrow_mut() {
            Ok(r) => r,
            Err(_) => crate::fail::die("gate cell borrowed twice"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake;
    use crate::startup::{BASEPRI_KERNEL, BASEPRI_USER, KERNEL_PRIORITY};
    use core::cell::Cell;
    use proptest::prelude::*;

    thread_local! {
        static INSIDE: Cell<bool> = const { Cell::new(false) };
        static FAST_RAN_INSIDE: Cell<usize> = const { Cell::new(0) };
    }

    /// Claims the region guarded by the gate, failing on overlap.
    fn enter() {
        INSIDE.with(|i| {
            assert!(!i.get(), "two holders inside the gate");
            i.set(true);
        });
    }

    fn leave() {
        INSIDE.with(|i| i.set(false));
    }

    const KERNEL_LINES: [u32; 3] = [3, 4, 5];
    const FAST_LINE: u32 = 9;

    fn install_handlers() {
        for (i, &n) in KERNEL_LINES.iter().enumerate() {
            fake::attach(n, move || {
                let cs = lock_from_isr();
                enter();
                // Asking for a more urgent line from inside the gate must not
                // deliver it until we're out again.
                if let Some(&next) = KERNEL_LINES.get(i + 1) {
                    fake::pend_irq(next);
                }
                leave();
                drop(cs);
            });
            arch::enable_irq(n, KERNEL_PRIORITY + 3 - i as u8);
        }
        fake::attach(FAST_LINE, || {
            if INSIDE.with(|i| i.get()) {
                FAST_RAN_INSIDE.with(|c| c.set(c.get() + 1));
            }
        });
        arch::enable_irq(FAST_LINE, KERNEL_PRIORITY - 1);
    }

    #[derive(Copy, Clone, Debug)]
    enum Action {
        Lock,
        Unlock,
        Pend(u32),
    }

    fn action() -> impl Strategy<Value = Action> {
        prop_oneof![
            Just(Action::Lock),
            Just(Action::Unlock),
            prop::sample::select(KERNEL_LINES.to_vec()).prop_map(Action::Pend),
            Just(Action::Pend(FAST_LINE)),
        ]
    }

    proptest! {
        #[test]
        fn holders_never_overlap(
            actions in prop::collection::vec(action(), 1..64),
        ) {
            fake::power_on();
            install_handlers();
            FAST_RAN_INSIDE.with(|c| c.set(0));

            let mut held: Option<SysLock> = None;
            let mut fast_pends_while_held = 0;
            for a in actions {
                match a {
                    Action::Lock => {
                        if held.is_none() {
                            let cs = lock();
                            enter();
                            held = Some(cs);
                        }
                    }
                    Action::Unlock => {
                        if let Some(cs) = held.take() {
                            leave();
                            drop(cs);
                        }
                    }
                    Action::Pend(n) => {
                        if n == FAST_LINE && held.is_some() {
                            fast_pends_while_held += 1;
                        }
                        fake::pend_irq(n);
                    }
                }
            }
            if let Some(cs) = held.take() {
                leave();
                drop(cs);
            }

            for n in KERNEL_LINES {
                prop_assert!(!fake::is_pending(n));
            }
            prop_assert!(!fake::is_pending(FAST_LINE));
            // Handlers above the kernel level are not held off by the gate.
            prop_assert_eq!(
                FAST_RAN_INSIDE.with(|c| c.get()),
                fast_pends_while_held
            );
        }
    }

    #[test]
    fn disable_holds_off_even_fast_interrupts() {
        fake::power_on();
        let hits = std::rc::Rc::new(Cell::new(0));
        let h = hits.clone();
        fake::attach(FAST_LINE, move || h.set(h.get() + 1));
        arch::enable_irq(FAST_LINE, KERNEL_PRIORITY - 1);

        disable();
        fake::pend_irq(FAST_LINE);
        assert_eq!(hits.get(), 0);
        assert!(fake::is_pending(FAST_LINE));

        enable();
        assert_eq!(hits.get(), 1);
        assert!(!fake::is_pending(FAST_LINE));
        assert_eq!(fake::basepri(), BASEPRI_USER);
    }

    #[test]
    fn suspend_masks_only_the_kernel_level() {
        fake::power_on();
        let ran = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        for n in [KERNEL_LINES[0], FAST_LINE] {
            let r = ran.clone();
            fake::attach(n, move || r.borrow_mut().push(n));
        }
        arch::enable_irq(KERNEL_LINES[0], KERNEL_PRIORITY + 1);
        arch::enable_irq(FAST_LINE, KERNEL_PRIORITY - 1);

        disable();
        fake::pend_irq(KERNEL_LINES[0]);
        fake::pend_irq(FAST_LINE);
        assert!(ran.borrow().is_empty());

        suspend();
        assert_eq!(*ran.borrow(), [FAST_LINE]);
        assert!(fake::is_pending(KERNEL_LINES[0]));
        assert_eq!(fake::basepri(), BASEPRI_KERNEL);

        enable();
        assert_eq!(*ran.borrow(), [FAST_LINE, KERNEL_LINES[0]]);
    }

    #[test]
    #[should_panic(expected = "gate")]
    fn nested_thread_lock_dies() {
        fake::power_on();
        let _a = lock();
        let _b = lock();
    }

    #[test]
    #[should_panic(expected = "outside an interrupt")]
    fn isr_lock_from_thread_dies() {
        fake::power_on();
        let _cs = lock_from_isr();
    }

    #[test]
    fn isr_lock_restores_previous_threshold() {
        fake::power_on();
        let seen = std::rc::Rc::new(Cell::new(None));
        let s = seen.clone();
        fake::attach(3, move || {
            let before = fake::basepri();
            let cs = lock_from_isr();
            drop(cs);
            s.set(Some((before, fake::basepri())));
        });
        arch::enable_irq(3, KERNEL_PRIORITY + 1);
        fake::pend_irq(3);
        let (before, after) = seen.get().expect("handler ran");
        assert_eq!(before, after);
    }

    #[test]
    fn gate_cell_borrows_under_either_token() {
        fake::power_on();
        let cell = GateCell::new(0u32);
        with(|cs| *cell.borrow_mut(cs) += 1);

        let cell = std::rc::Rc::new(cell);
        let c = cell.clone();
        fake::attach(4, move || {
            let cs = lock_from_isr();
            *c.borrow_mut(&cs) += 10;
        });
        arch::enable_irq(4, KERNEL_PRIORITY + 2);
        fake::pend_irq(4);

        assert_eq!(with(|cs| *cell.borrow_mut(cs)), 11);
    }
}
