// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host simulation of the ARMv7-M trap model.
//!
//! This stands in for `arm_m` when the kernel is built for anything other than
//! bare-metal ARM, so the scheduler and drivers can be tested on the host. It
//! models one CPU per host thread:
//!
//! - a register file (r0-r12, sp, lr, pc), BASEPRI and PRIMASK;
//! - exception entry and exit, with a real eight-word exception frame pushed
//!   into and popped out of the thread's stack memory;
//! - numbered interrupt lines with NVIC-style priorities, masking by BASEPRI
//!   and by the priority of whatever exception is active, and nesting;
//! - the deferred reschedule trap (PendSV) at the lowest priority;
//! - a tick source that fires whenever the simulated CPU is idle.
//!
//! There's only one flow of host control, and it belongs to whichever
//! simulated thread the test is playing. When that thread blocks, the
//! simulator runs the idle thread on its behalf: it delivers pending
//! interrupts, calls the idle hook (which tests use to play the part of the
//! hardware), and advances time, until the blocked thread is put back on the
//! CPU. If some other thread gets the CPU instead, there's no host code to run
//! for it, and the simulator panics.

use std::cell::RefCell;
use std::rc::Rc;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::sched::Kernel;
use crate::startup::{
    BASEPRI_KERNEL, BASEPRI_USER, PENDSV_PRIORITY, PRIORITY_BITS,
    SVCALL_PRIORITY,
};
use crate::task::{ArchState, Thread, ThreadEntry};

/// How many rounds of idle work `wait_for_resume` does before concluding the
/// blocked thread will never run again.
pub const IDLE_STEP_LIMIT: usize = 10_000;

/// Thumb bit, as on hardware.
const INITIAL_PSR: usize = 1 << 24;

const SYSTICK_PRIORITY: u8 = BASEPRI_KERNEL as u8;

/// The simulated register file.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    pub r: [usize; 13],
    pub sp: usize,
    pub lr: usize,
    pub pc: usize,
}

/// Registers the trap handler saves by hand; the rest are in the exception
/// frame on the thread's stack.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct SavedState {
    basepri: u32,
    r4_r11: [usize; 8],
    sp: usize,
}

impl SavedState {
    pub const EMPTY: Self = Self {
        basepri: 0,
        r4_r11: [0; 8],
        sp: 0,
    };
}

impl ArchState for SavedState {
    fn stack_pointer(&self) -> usize {
        self.sp
    }
}

/// Stuff placed on the stack at exception entry.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: usize,
    pub r1: usize,
    pub r2: usize,
    pub r3: usize,
    pub r12: usize,
    pub lr: usize,
    pub pc: usize,
    pub xpsr: usize,
}

pub const FRAME_SIZE: usize = core::mem::size_of::<ExceptionFrame>();

/// Returned by `Kernel::start`. The simulator hands control back to the
/// caller, which is now the first thread.
pub struct Started(());

struct Line {
    priority: u8,
    enabled: bool,
    pending: bool,
    handler: Option<Rc<dyn Fn()>>,
}

impl Line {
    const RESET: Self = Self {
        priority: 0,
        enabled: false,
        pending: false,
        handler: None,
    };
}

struct Cpu {
    regs: Registers,
    basepri: u32,
    /// Set by `disable`: nothing maskable is taken.
    primask: bool,
    /// Priorities of the exceptions being handled, innermost last.
    active: Vec<u8>,
    pendsv: bool,
    current: *mut Thread,
    kernel: Option<&'static Kernel>,
    lines: Vec<Line>,
    idle_hook: Option<Box<dyn FnMut()>>,
    switches: usize,
}

impl Cpu {
    fn new() -> Self {
        Self {
            regs: Registers::default(),
            basepri: BASEPRI_USER,
            primask: false,
            active: Vec::new(),
            pendsv: false,
            current: core::ptr::null_mut(),
            kernel: None,
            lines: Vec::new(),
            idle_hook: None,
            switches: 0,
        }
    }

    fn line(&mut self, n: u32) -> &mut Line {
        let n = n as usize;
        if self.lines.len() <= n {
            self.lines.resize_with(n + 1, || Line::RESET);
        }
        &mut self.lines[n]
    }

    /// Checks whether an exception at `priority` would be taken right now.
    fn may_take(&self, priority: u8) -> bool {
        let unmasked = self.basepri == 0 || u32::from(priority) < self.basepri;
        let preempts = self.active.last().map_or(true, |&a| priority < a);
        !self.primask && unmasked && preempts
    }

    /// Claims the most urgent interrupt that can be taken now, if any.
    fn take_deliverable(&mut self) -> Option<(u8, Rc<dyn Fn()>)> {
        let n = (0..self.lines.len())
            .filter(|&n| {
                let l = &self.lines[n];
                l.enabled
                    && l.pending
                    && l.handler.is_some()
                    && self.may_take(l.priority)
            })
            .min_by_key(|&n| (self.lines[n].priority, n))?;
        let line = &mut self.lines[n];
        line.pending = false;
        let handler = line.handler.clone()?;
        Some((line.priority, handler))
    }
}

thread_local! {
    static CPU: RefCell<Cpu> = RefCell::new(Cpu::new());
}

fn with_cpu<R>(body: impl FnOnce(&mut Cpu) -> R) -> R {
    CPU.with(|c| body(&mut c.borrow_mut()))
}

fn priority_mask(level: u8) -> u8 {
    level << (8 - PRIORITY_BITS)
}

/// Resets the simulated CPU to its power-on state: no kernel, no interrupt
/// lines, nothing masked.
pub fn power_on() {
    with_cpu(|c| *c = Cpu::new());
}

/// Installs the handler for interrupt line `n`. The line still has to be
/// enabled with `enable_irq`.
pub fn attach(n: u32, handler: impl Fn() + 'static) {
    with_cpu(|c| c.line(n).handler = Some(Rc::new(handler)));
}

/// Asserts interrupt line `n`, as the hardware would. If it can be taken right
/// now, its handler runs before this returns.
pub fn pend_irq(n: u32) {
    with_cpu(|c| c.line(n).pending = true);
    preemption_point();
}

pub fn is_pending(n: u32) -> bool {
    with_cpu(|c| c.line(n).pending)
}

/// Sets the function called each time the simulated idle thread runs.
pub fn set_idle_hook(hook: impl FnMut() + 'static) {
    with_cpu(|c| c.idle_hook = Some(Box::new(hook)));
}

pub fn basepri() -> u32 {
    with_cpu(|c| c.basepri)
}

pub fn registers() -> Registers {
    with_cpu(|c| c.regs)
}

pub fn set_registers(regs: Registers) {
    with_cpu(|c| c.regs = regs);
}

/// Number of context switches performed so far, by either trap.
pub fn context_switches() -> usize {
    with_cpu(|c| c.switches)
}

/// Allocates a thread stack that lives for the rest of the test.
pub fn leak_stack(words: usize) -> &'static mut [usize] {
    Box::leak(vec![0usize; words].into_boxed_slice())
}

/// Takes every exception that is pending and not masked, most urgent first,
/// including the deferred reschedule trap. Called wherever hardware would
/// notice a change in masking: gate release, interrupt return, and so on.
pub fn preemption_point() {
    loop {
        if let Some((priority, handler)) = with_cpu(Cpu::take_deliverable) {
            run_exception(priority, || handler());
            continue;
        }
        if with_cpu(|c| c.pendsv && c.may_take(PENDSV_PRIORITY)) {
            run_pendsv();
            continue;
        }
        break;
    }
}

fn run_exception(priority: u8, body: impl FnOnce()) {
    let basepri = with_cpu(|c| {
        c.active.push(priority);
        c.basepri
    });
    body();
    with_cpu(|c| {
        uassert!(c.basepri == basepri, "interrupt returned holding the gate");
        c.active.pop();
    });
}

fn run_pendsv() {
    let (kernel, current) = with_cpu(|c| {
        c.pendsv = false;
        c.active.push(PENDSV_PRIORITY);
        (c.kernel, c.current)
    });
    let Some(kernel) = kernel else {
        crate::fail::die("reschedule trap before kernel start");
    };
    // Safety: `current` was installed by `start_first_thread` or a previous
    // switch and points into the kernel's thread table, which nobody has
    // borrowed while an exception is being taken.
    let next = unsafe {
        save_context(current);
        let next = kernel.pendsv_select();
        restore_context(next);
        next
    };
    with_cpu(|c| {
        c.active.pop();
        if next != current {
            c.switches += 1;
        }
    });
}

fn run_idle_hook() {
    let hook = with_cpu(|c| c.idle_hook.take());
    if let Some(mut hook) = hook {
        hook();
        with_cpu(|c| {
            if c.idle_hook.is_none() {
                c.idle_hook = Some(hook);
            }
        });
    }
}

fn deliver_tick() {
    let Some(kernel) = with_cpu(|c| c.kernel) else {
        return;
    };
    if !with_cpu(|c| c.may_take(SYSTICK_PRIORITY)) {
        return;
    }
    run_exception(SYSTICK_PRIORITY, || crate::irq::systick(kernel));
    preemption_point();
}

/// Exception entry plus the handler's register save: pushes the hardware
/// frame onto `t`'s stack and records the rest in its `SavedState`.
unsafe fn save_context(t: *mut Thread) {
    // Safety: caller guarantees `t` is a live, unborrowed thread.
    let thread = unsafe { &mut *t };
    let (sp, frame, basepri, r4_r11) = with_cpu(|c| {
        let regs = &c.regs;
        let frame = ExceptionFrame {
            r0: regs.r[0],
            r1: regs.r[1],
            r2: regs.r[2],
            r3: regs.r[3],
            r12: regs.r[12],
            lr: regs.lr,
            pc: regs.pc,
            xpsr: INITIAL_PSR,
        };
        let mut r4_r11 = [0; 8];
        r4_r11.copy_from_slice(&regs.r[4..12]);
        (regs.sp.wrapping_sub(FRAME_SIZE), frame, c.basepri, r4_r11)
    });
    if sp < thread.stack_base() || sp + FRAME_SIZE > thread.stack_top() {
        crate::fail::die("simulated stack overflow");
    }
    // Safety: just checked that the frame lands inside the thread's stack.
    unsafe { core::ptr::write_unaligned(sp as *mut ExceptionFrame, frame) };
    let save = thread.save_mut();
    save.basepri = basepri;
    save.r4_r11 = r4_r11;
    save.sp = sp;
}

/// The handler's register restore plus exception return into `t`.
unsafe fn restore_context(t: *mut Thread) {
    // Safety: caller guarantees `t` is a live, unborrowed thread.
    let thread = unsafe { &*t };
    let save = *thread.save();
    let top = thread.stack_top();
    if save.sp < thread.stack_base() || save.sp + FRAME_SIZE > top {
        crate::fail::die("corrupt saved stack pointer");
    }
    // Safety: just checked that the frame lies inside the thread's stack.
    let frame =
        unsafe { core::ptr::read_unaligned(save.sp as *const ExceptionFrame) };
    with_cpu(|c| {
        let regs = &mut c.regs;
        regs.r[0] = frame.r0;
        regs.r[1] = frame.r1;
        regs.r[2] = frame.r2;
        regs.r[3] = frame.r3;
        regs.r[4..12].copy_from_slice(&save.r4_r11);
        regs.r[12] = frame.r12;
        regs.lr = frame.lr;
        regs.pc = frame.pc;
        regs.sp = save.sp + FRAME_SIZE;
        c.basepri = save.basepri;
        c.current = t;
    });
}

/// Writes the initial exception frame for a new thread at the top of `stack`
/// so that the first switch into it "returns" into `entry(arg)`.
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
        r0: arg,
        pc: entry as usize,
        lr: crate::sched::thread_exit as usize,
        xpsr: INITIAL_PSR,
        ..ExceptionFrame::default()
    };
    *save = SavedState {
        basepri: BASEPRI_USER,
        r4_r11: [0; 8],
        sp: frame as *const ExceptionFrame as usize,
    };
}

/// Performs the context-switch trap: `suspend`'s registers go into its
/// `SavedState` and stack, `resume`'s come out of its.
///
/// # Safety
///
/// Both pointers must refer to distinct threads in the kernel's table, and
/// nothing may hold a reference into the table for the duration.
pub unsafe fn switch(resume: *mut Thread, suspend: *mut Thread) {
    with_cpu(|c| {
        uassert!(c.active.is_empty(), "context switch from an interrupt");
        c.active.push(SVCALL_PRIORITY);
    });
    // Safety: passed through from our caller.
    unsafe {
        save_context(suspend);
        restore_context(resume);
    }
    with_cpu(|c| {
        c.active.pop();
        c.switches += 1;
    });
}

/// Enters `first` without saving anything, the way the startup trap does.
pub fn start_first_thread(
    kernel: &'static Kernel,
    first: *mut Thread,
    _tick_divisor: u32,
) -> Started {
    with_cpu(|c| c.kernel = Some(kernel));
    // Safety: `first` comes from the kernel's table and isn't borrowed.
    unsafe { restore_context(first) };
    Started(())
}

/// Runs the simulated idle thread until `me` is back on the CPU.
pub fn wait_for_resume(me: *const Thread, idle: *const Thread) {
    let steps: [fn(); 3] = [preemption_point, run_idle_hook, deliver_tick];
    for _ in 0..IDLE_STEP_LIMIT {
        for step in steps {
            let current = with_cpu(|c| c.current as *const Thread);
            if current == me {
                return;
            }
            if current != idle {
                panic!(
                    "simulated thread at {current:p} was scheduled, \
                     but has no host body"
                );
            }
            step();
        }
    }
    panic!(
        "simulated CPU idled for {IDLE_STEP_LIMIT} rounds without resuming \
         the blocked thread"
    );
}

pub fn lock() {
    with_cpu(|c| {
        uassert!(c.active.is_empty(), "thread gate taken in an interrupt");
        uassert!(c.basepri != BASEPRI_KERNEL, "gate locked twice");
        c.basepri = BASEPRI_KERNEL;
    });
}

pub fn unlock() {
    with_cpu(|c| {
        uassert!(c.basepri == BASEPRI_KERNEL, "gate released while not held");
        c.basepri = BASEPRI_USER;
    });
    preemption_point();
}

pub fn lock_from_isr() -> u32 {
    with_cpu(|c| {
        let Some(&level) = c.active.last() else {
            crate::fail::die("interrupt gate taken outside an interrupt");
        };
        uassert!(
            u32::from(level) >= BASEPRI_KERNEL,
            "interrupt above the kernel level took the gate"
        );
        uassert!(c.basepri != BASEPRI_KERNEL, "gate locked twice");
        let prev = c.basepri;
        c.basepri = BASEPRI_KERNEL;
        prev
    })
}

pub fn unlock_from_isr(prev: u32) {
    with_cpu(|c| {
        uassert_eq!(c.basepri, BASEPRI_KERNEL);
        c.basepri = prev;
    });
    preemption_point();
}

pub fn disable() {
    with_cpu(|c| c.primask = true);
}

pub fn suspend() {
    with_cpu(|c| {
        c.basepri = BASEPRI_KERNEL;
        c.primask = false;
    });
    preemption_point();
}

pub fn enable() {
    with_cpu(|c| {
        c.basepri = BASEPRI_USER;
        c.primask = false;
    });
    preemption_point();
}

pub fn pend_reschedule() {
    with_cpu(|c| c.pendsv = true);
    preemption_point();
}

pub fn enable_irq(n: u32, level: u8) {
    with_cpu(|c| {
        let line = c.line(n);
        line.priority = priority_mask(level);
        line.enabled = true;
    });
    preemption_point();
}

pub fn disable_irq(n: u32) {
    with_cpu(|c| c.line(n).enabled = false);
}

pub fn current_stack_pointer() -> usize {
    with_cpu(|c| c.regs.sp)
}

pub fn kernel() -> &'static Kernel {
    match with_cpu(|c| c.kernel) {
        Some(k) => k,
        None => crate::fail::die("kernel not started"),
    }
}

pub fn idle() {
    run_idle_hook();
    deliver_tick();
}
