// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of threads.

use abi::{Generation, Priority, ReadyMsg, SchedState};

use crate::startup::INT_REQUIRED_STACK;
use crate::time::Timestamp;

/// Function a new thread starts in, with its argument in the first argument
/// register. Returning from it ends the thread.
pub type ThreadEntry = extern "C" fn(arg: usize);

/// Smallest stack a thread can be created with: its initial exception frame
/// plus room for one nested interrupt.
pub const MIN_STACK_BYTES: usize = crate::arch::FRAME_SIZE + INT_REQUIRED_STACK;

/// Internal representation of a thread.
///
/// The fields of this struct are private to this module so that state
/// transitions go through the methods below.
#[repr(C)] // so location of SavedState is predictable
#[derive(Debug)]
pub struct Thread {
    /// Saved machine state while the thread is off the CPU.
    save: crate::arch::SavedState,
    // NOTE: it is critical that the above field appear first! The trap
    // handlers treat a `*mut Thread` as a `*mut SavedState`.
    priority: Priority,
    state: SchedState,
    /// Bumped when the slot is released, so stale `ThreadId`s can be spotted.
    generation: Generation,
    /// Result code deposited by whoever last made this thread ready.
    ready_msg: ReadyMsg,
    /// Order in which this thread last became ready; smaller runs first among
    /// equal priorities.
    ready_seq: u64,
    /// Time at which a waiting thread is woken with `ReadyMsg::TIMEOUT`.
    deadline: Option<Timestamp>,
    stack_base: usize,
    stack_top: usize,
}

static_assertions::const_assert_eq!(core::mem::offset_of!(Thread, save), 0);

/// Reasons thread creation can be refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateError {
    /// Every slot in the thread table is in use.
    TableFull,
    /// The stack is smaller than `MIN_STACK_BYTES`.
    StackTooSmall,
    /// The top of the stack is not 8-byte aligned.
    StackMisaligned,
    /// `Priority::IDLE` belongs to the idle thread.
    ReservedPriority,
}

impl Thread {
    /// An unused slot.
    pub const EMPTY: Self = Self {
        save: crate::arch::SavedState::EMPTY,
        priority: Priority::IDLE,
        state: SchedState::Free,
        generation: Generation::ZERO,
        ready_msg: ReadyMsg::OK,
        ready_seq: 0,
        deadline: None,
        stack_base: 0,
        stack_top: 0,
    };

    /// Prepares this slot to run `entry(arg)` on `stack`. The thread is left
    /// `Free`; the caller decides when it becomes ready.
    ///
    /// The stack is only borrowed long enough to write the initial frame.
    /// From then on the thread owns it through its saved stack pointer.
    pub(crate) fn init(
        &mut self,
        stack: &'static mut [usize],
        priority: Priority,
        entry: ThreadEntry,
        arg: usize,
    ) -> Result<(), CreateError> {
        let len = core::mem::size_of_val(stack);
        if len < MIN_STACK_BYTES {
            return Err(CreateError::StackTooSmall);
        }
        let base = stack.as_ptr() as usize;
        let top = base + len;
        if top & 0x7 != 0 {
            return Err(CreateError::StackMisaligned);
        }

        crate::arch::setup_context(&mut self.save, stack, entry, arg);
        self.priority = priority;
        self.ready_msg = ReadyMsg::OK;
        self.deadline = None;
        self.stack_base = base;
        self.stack_top = top;
        Ok(())
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> SchedState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn ready_msg(&self) -> ReadyMsg {
        self.ready_msg
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    /// Lowest address of this thread's stack.
    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    /// One past the highest address of this thread's stack.
    pub fn stack_top(&self) -> usize {
        self.stack_top
    }

    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }

    /// Checks whether `sp` leaves room below it for a nested interrupt frame.
    pub fn has_room_below(&self, sp: usize) -> bool {
        sp >= self.stack_base + INT_REQUIRED_STACK && sp <= self.stack_top
    }

    pub(crate) fn set_state(&mut self, state: SchedState) {
        self.state = state;
    }

    pub(crate) fn set_deadline(&mut self, deadline: Option<Timestamp>) {
        self.deadline = deadline;
    }

    /// Makes this thread ready, depositing `msg` for it to find when it runs.
    /// `seq` orders it behind every thread already ready.
    pub(crate) fn make_ready(&mut self, msg: ReadyMsg, seq: u64) {
        self.ready_msg = msg;
        self.deadline = None;
        self.state = SchedState::Ready;
        self.ready_seq = seq;
    }

    /// Returns the slot to the free pool with a new generation.
    pub(crate) fn release(&mut self) {
        let generation = self.generation.next();
        *self = Self::EMPTY;
        self.generation = generation;
    }
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to thread state for the rest of the
/// kernel.
pub trait ArchState: Default {
    /// Stack pointer the thread will resume with, pointing at its stacked
    /// exception frame.
    fn stack_pointer(&self) -> usize;
}

/// Processes all thread timers at `current_time`.
///
/// Waiting threads whose deadline has passed become ready with
/// `ReadyMsg::TIMEOUT`, stamped in table order starting from `*seq`. Returns
/// `true` if any thread was woken.
pub fn process_timers(
    threads: &mut [Thread],
    current_time: Timestamp,
    seq: &mut u64,
) -> bool {
    let mut woke = false;
    for thread in threads.iter_mut() {
        if let Some(deadline) = thread.deadline {
            if deadline <= current_time {
                thread.deadline = None;
                if thread.state.is_waiting() {
                    thread.make_ready(ReadyMsg::TIMEOUT, *seq);
                    *seq += 1;
                    woke = true;
                }
            }
        }
    }
    woke
}

/// Selects the thread to run next: the most important ready thread, and among
/// those, the one that has been ready longest.
///
/// The idle thread is always ready when it isn't running, so this only comes
/// back empty when asked while the idle thread itself is on the CPU and
/// nothing else is ready.
pub fn select(threads: &[Thread]) -> Option<usize> {
    priority_scan(threads, |t| t.state == SchedState::Ready)
}

/// Scans the thread table for a prioritized candidate.
///
/// Of the threads satisfying `pred`, returns the index of the most important
/// one. Ties go to the smallest `ready_seq`, which gives FIFO order within a
/// priority.
pub fn priority_scan(
    threads: &[Thread],
    pred: impl Fn(&Thread) -> bool,
) -> Option<usize> {
    let mut choice: Option<(usize, &Thread)> = None;
    for (pos, t) in threads.iter().enumerate() {
        if !pred(t) {
            continue;
        }

        if let Some((_, best)) = choice {
            let same = t.priority == best.priority;
            let better = t.priority.is_more_important_than(best.priority)
                || (same && t.ready_seq < best.ready_seq);
            if !better {
                continue;
            }
        }

        choice = Some((pos, t));
    }

    choice.map(|(pos, _)| pos)
}
