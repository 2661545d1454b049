// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # Exceptions
//!
//! Three system exceptions do the kernel's work:
//!
//! - `SVCall` is the synchronous context switch. A thread that has decided to
//!   give up the CPU (it went to sleep, or readied something more important)
//!   executes `SVC` with the thread to resume in `r0` and itself in `r1`.
//! - `PendSV` is the deferred context switch. Interrupt handlers never switch
//!   directly; if they make a more important thread ready, their exit path
//!   pends `PendSV`, which runs once every handler has returned.
//! - `SysTick` drives the kernel clock.
//!
//! Both switch paths save and restore the same state: the callee-save
//! registers, the process stack pointer, the `EXC_RETURN` value, and BASEPRI.
//! The hardware has already stacked the rest onto the thread's own stack.
//! Carrying BASEPRI along is what lets a thread sleep with the gate held and
//! find it still held when it wakes up, while the thread that runs in the
//! meantime gets whatever threshold it had.
//!
//! # Priorities
//!
//! With `N = PRIORITY_BITS` implemented bits and the kernel level `K`:
//!
//! - interrupts at levels `< K` are never masked by the gate and must not
//!   touch kernel state;
//! - interrupts at levels `>= K` are masked while the gate is held, and may
//!   use I-class operations;
//! - `SVCall` sits at `K - 1`, so a thread can trap while holding the gate;
//! - `SysTick` sits at `K`;
//! - `PendSV` sits at the lowest level, so it only runs once no handler is
//!   active and the gate is open.

use core::arch::{asm, global_asm};
use core::sync::atomic::{compiler_fence, AtomicPtr, Ordering};

use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::{NVIC, SCB, SYST};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::sched::Kernel;
use crate::startup::{
    BASEPRI_KERNEL, BASEPRI_USER, PENDSV_PRIORITY, PRIORITY_BITS,
    SVCALL_PRIORITY, WFI_IDLE,
};
use crate::task::{ArchState, Thread, ThreadEntry};

/// Return to Thread mode on the process stack, no floating point state.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Thumb bit.
const INITIAL_PSR: u32 = 1 << 24;

/// Thread whose state `PendSV` saves on entry. Kept in a global because
/// there's no scratch register to carry it in.
#[no_mangle]
static CURRENT_THREAD: AtomicPtr<Thread> =
    AtomicPtr::new(core::ptr::null_mut());

static KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// ARMv7-M state saved by the trap handlers.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    // NOTE: the trap handlers access these with a single `stm`/`ldm` of
    // {r2, r4-r12, lr}; keep them contiguous and in this order.
    basepri: u32,
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
}

impl SavedState {
    pub const EMPTY: Self = Self {
        basepri: 0,
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
    };
}

impl ArchState for SavedState {
    fn stack_pointer(&self) -> usize {
        self.psp as usize
    }
}

/// Stuff placed on the stack at exception entry.
#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

pub const FRAME_SIZE: usize = core::mem::size_of::<ExceptionFrame>();

/// `Kernel::start` never returns on hardware.
pub enum Started {}

pub fn kernel() -> &'static Kernel {
    let k = KERNEL.load(Ordering::Relaxed);
    if k.is_null() {
        crate::fail::die("kernel not started");
    }
    // Safety: only ever set from a `&'static Kernel` in `start_first_thread`.
    unsafe { &*k }
}

/// Writes the initial exception frame for a new thread at the top of `stack`
/// so that the first exception return into it lands in `entry(arg)`.
pub fn setup_context(
    save: &mut SavedState,
    stack: &mut [usize],
    entry: ThreadEntry,
    arg: usize,
) {
    let words = FRAME_SIZE / core::mem::size_of::<usize>();
    uassert!(stack.len() >= words);
    let split = stack.len() - words;
    let frame = match ExceptionFrame::mut_from_bytes(
        stack[split..].as_mut_bytes(),
    ) {
        Ok(frame) => frame,
        Err(_) => crate::fail::die("misaligned thread stack"),
    };
    *frame = ExceptionFrame {
        r0: arg as u32,
        pc: entry as usize as u32 | 1,
        lr: crate::sched::thread_exit as usize as u32,
        xpsr: INITIAL_PSR,
        ..ExceptionFrame::default()
    };
    *save = SavedState {
        basepri: BASEPRI_USER,
        psp: frame as *const ExceptionFrame as u32,
        exc_return: EXC_RETURN_THREAD_PSP,
        ..SavedState::EMPTY
    };
}

/// Performs the synchronous context switch.
///
/// # Safety
///
/// Both pointers must refer to distinct threads in the kernel's table,
/// `suspend` must be the running thread, and nothing may hold a reference
/// into the table.
pub unsafe fn switch(resume: *mut Thread, suspend: *mut Thread) {
    CURRENT_THREAD.store(resume, Ordering::Relaxed);
    // Safety: SVCall saves everything this thread will need to resume here,
    // including r0-r3 and lr, which the hardware stacks.
    unsafe {
        asm!(
            "svc #0",
            in("r0") resume,
            in("r1") suspend,
        );
    }
}

/// Nothing to do: on hardware, `switch` returns only once this thread has
/// been switched back in.
pub fn wait_for_resume(_me: *const Thread, _idle: *const Thread) {}

// Thread mode on MSP means this is the startup trap from
// `start_first_thread`; `r0` in its stacked frame is the first thread.
// Otherwise it's `switch`, with resume/suspend in the stacked r0/r1. The
// stacked copies are read rather than the live registers because a late
// arriving interrupt may have run in between.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        tst lr, #4
        beq 1f

        mrs r12, PSP
        ldr r0, [r12]
        ldr r1, [r12, #4]
        mrs r2, BASEPRI
        stm r1, {{r2, r4-r12, lr}}
        ldm r0, {{r2, r4-r12, lr}}
        msr BASEPRI, r2
        msr PSP, r12
        bx lr

    1:  @ starting up the first thread.
        ldr r0, [sp]
        ldm r0, {{r2, r4-r12, lr}}
        msr BASEPRI, r2
        msr PSP, r12
        bx lr
    ",
}

global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        movw r0, #:lower16:CURRENT_THREAD
        movt r0, #:upper16:CURRENT_THREAD
        ldr r1, [r0]
        mrs r2, BASEPRI
        mrs r12, PSP
        stm r1, {{r2, r4-r12, lr}}

        bl pendsv_entry

        @ r0 is the thread to resume, maybe the same one.
        ldm r0, {{r2, r4-r12, lr}}
        msr BASEPRI, r2
        msr PSP, r12
        bx lr
    ",
}

/// The Rust side of the PendSV handler, after the interrupted thread's state
/// has been saved.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() -> *mut Thread {
    uassert!(!CURRENT_THREAD.load(Ordering::Relaxed).is_null());
    let next = kernel().pendsv_select();
    CURRENT_THREAD.store(next, Ordering::Relaxed);
    next
}

/// Handler that gets linked into the vector table for the System Tick Timer.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::irq::systick(kernel());
}

/// Sets up exception priorities and the tick timer, then traps into `first`.
pub fn start_first_thread(
    kernel: &'static Kernel,
    first: *mut Thread,
    tick_divisor: u32,
) -> Started {
    KERNEL.store(kernel as *const Kernel as *mut Kernel, Ordering::Relaxed);
    CURRENT_THREAD.store(first, Ordering::Relaxed);

    // Safety: nothing is running yet that could be surprised by new
    // priorities, and these registers only configure exception delivery.
    unsafe {
        let scb = &*SCB::PTR;
        // MemManage, BusFault, UsageFault on, and most urgent.
        scb.shcsr.modify(|x| x | 0b111 << 16);
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        scb.shpr[7].write(SVCALL_PRIORITY);
        scb.shpr[10].write(PENDSV_PRIORITY);
        scb.shpr[11].write(BASEPRI_KERNEL as u8);

        let syst = &*SYST::PTR;
        syst.rvr.write(tick_divisor - 1);
        syst.cvr.write(0);
        syst.csr.modify(|v| v | 0b111);
    }

    // Safety: SVCall recognizes a trap from the main stack as startup and
    // returns into `first` on the process stack. We never come back.
    unsafe {
        asm!(
            "svc #0xFF",
            in("r0") first,
            options(noreturn),
        )
    }
}

pub fn lock() {
    uassert!(
        u32::from(cortex_m::register::basepri::read()) != BASEPRI_KERNEL,
        "gate locked twice"
    );
    // Safety: raising the threshold only masks more.
    unsafe { cortex_m::register::basepri::write(BASEPRI_KERNEL as u8) };
    compiler_fence(Ordering::SeqCst);
}

pub fn unlock() {
    compiler_fence(Ordering::SeqCst);
    // Safety: anything unmasked here was pended while we held the gate and
    // is allowed to run now.
    unsafe { cortex_m::register::basepri::write(BASEPRI_USER as u8) };
}

pub fn lock_from_isr() -> u32 {
    uassert!(
        SCB::vect_active() != VectActive::ThreadMode,
        "interrupt gate taken outside an interrupt"
    );
    let prev = cortex_m::register::basepri::read();
    uassert!(u32::from(prev) != BASEPRI_KERNEL, "gate locked twice");
    // Safety: see `lock`.
    unsafe { cortex_m::register::basepri::write(BASEPRI_KERNEL as u8) };
    compiler_fence(Ordering::SeqCst);
    u32::from(prev)
}

pub fn unlock_from_isr(prev: u32) {
    compiler_fence(Ordering::SeqCst);
    // Safety: restores what the handler was entered with.
    unsafe { cortex_m::register::basepri::write(prev as u8) };
}

pub fn disable() {
    cortex_m::interrupt::disable();
    compiler_fence(Ordering::SeqCst);
}

pub fn suspend() {
    compiler_fence(Ordering::SeqCst);
    // Safety: leaves exactly the gate's masking in place.
    unsafe {
        cortex_m::register::basepri::write(BASEPRI_KERNEL as u8);
        cortex_m::interrupt::enable();
    }
}

pub fn enable() {
    compiler_fence(Ordering::SeqCst);
    // Safety: called from thread context outside the gate, where nothing
    // needs to stay masked.
    unsafe {
        cortex_m::register::basepri::write(BASEPRI_USER as u8);
        cortex_m::interrupt::enable();
    }
}

pub fn pend_reschedule() {
    SCB::set_pendsv();
}

/// Sets interrupt line `n` to priority `level` and enables it.
pub fn enable_irq(n: u32, level: u8) {
    // Safety: the NVIC is only configured through these two functions, by
    // drivers that own the line.
    unsafe {
        let nvic = &*NVIC::PTR;
        nvic.ipr[n as usize].write(level << (8 - PRIORITY_BITS));
        nvic.iser[(n / 32) as usize].write(1 << (n % 32));
    }
}

pub fn disable_irq(n: u32) {
    // Safety: see `enable_irq`.
    unsafe {
        let nvic = &*NVIC::PTR;
        nvic.icer[(n / 32) as usize].write(1 << (n % 32));
    }
}

pub fn current_stack_pointer() -> usize {
    cortex_m::register::psp::read() as usize
}

pub fn idle() {
    if WFI_IDLE {
        cortex_m::asm::wfi();
    }
}

struct PrimaskSection;
critical_section::set_impl!(PrimaskSection);

// Safety: single core, so masking everything excludes everyone.
unsafe impl critical_section::Impl for PrimaskSection {
    unsafe fn acquire() -> bool {
        let was_enabled = cortex_m::register::primask::read().is_active();
        cortex_m::interrupt::disable();
        was_enabled
    }

    unsafe fn release(was_enabled: bool) {
        if was_enabled {
            // Safety: interrupts were enabled when `acquire` ran.
            unsafe { cortex_m::interrupt::enable() };
        }
    }
}
