// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler context object.
//!
//! All scheduler state lives in one `Kernel`, which the application places in
//! a `static` and starts exactly once. Nothing here is ambient: drivers hold
//! a `&Kernel` and every state transition takes a gate token, so the compiler
//! checks that transitions only happen with interrupts at the kernel level
//! masked.
//!
//! Slot 0 of the thread table is the idle thread. It is created by
//! `Kernel::start`, is always ready when not running, and is the only thread
//! at `Priority::IDLE`.

use abi::{Priority, ReadyMsg, SchedState, ThreadId};

use crate::arch;
use crate::gate::{self, GateCell, Held, SysLock};
use crate::startup::MAX_THREADS;
use crate::task::{self, ArchState, CreateError, Thread, ThreadEntry};
use crate::time::Timestamp;

/// Index of the idle thread in the thread table.
pub(crate) const IDLE: usize = 0;

pub struct Kernel {
    state: GateCell<KernelState>,
}

pub(crate) struct KernelState {
    threads: [Thread; MAX_THREADS],
    /// Index of the running thread. Meaningless until `started`.
    current: usize,
    /// Next ready-order stamp.
    next_seq: u64,
    now: Timestamp,
    started: bool,
}

/// Pointers handed to the context-switch trap. The `KernelState` borrow they
/// came from has been dropped by the time they're used.
struct Switch {
    resume: *mut Thread,
    suspend: *mut Thread,
    idle: *const Thread,
    resume_index: usize,
}

impl KernelState {
    fn stamp(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Maps `id` to a table index, refusing stale or free slots.
    fn index_of(&self, id: ThreadId) -> Option<usize> {
        let t = self.threads.get(id.index())?;
        if t.generation() != id.generation() || t.state() == SchedState::Free {
            None
        } else {
            Some(id.index())
        }
    }

    /// Like `index_of`, but a bad id is a kernel-fatal programming error.
    fn checked_index(&self, id: ThreadId) -> usize {
        match self.index_of(id) {
            Some(i) => i,
            None => crate::fail::die("stale thread id"),
        }
    }

    fn id_of(&self, index: usize) -> ThreadId {
        ThreadId::for_index_and_gen(index, self.threads[index].generation())
    }

    pub(crate) fn make_ready(&mut self, index: usize, msg: ReadyMsg) {
        uassert!(self.threads[index].state().is_waiting());
        let seq = self.stamp();
        self.threads[index].make_ready(msg, seq);
    }

    /// Checks whether a ready thread should preempt the running one.
    fn resched_required(&self) -> bool {
        if !self.started {
            return false;
        }
        match task::select(&self.threads) {
            Some(best) => self.threads[best]
                .priority()
                .is_more_important_than(self.threads[self.current].priority()),
            None => false,
        }
    }

    /// Takes the running thread off the CPU, leaving it in whatever state the
    /// caller already set (or `Ready` behind its peers if it's still
    /// `Running`), and puts the best ready thread on.
    fn switch_out(&mut self) -> Switch {
        let prev = self.current;
        if self.threads[prev].state() == SchedState::Running {
            let seq = self.stamp();
            self.threads[prev].make_ready(ReadyMsg::OK, seq);
        }
        let next = match task::select(&self.threads) {
            Some(next) => next,
            None => crate::fail::die("no thread to run"),
        };
        uassert!(next != prev);
        self.threads[next].set_state(SchedState::Running);
        self.current = next;

        let idle = &self.threads[IDLE] as *const Thread;
        // `next != prev`, so the split puts each in its own half.
        let (low, high) = self.threads.split_at_mut(next.max(prev));
        let (resume, suspend) = if next < prev {
            (&mut low[next] as *mut Thread, &mut high[0] as *mut Thread)
        } else {
            (&mut high[0] as *mut Thread, &mut low[prev] as *mut Thread)
        };
        Switch {
            resume,
            suspend,
            idle,
            resume_index: next,
        }
    }

    /// Makes `id` ready with `msg` if it is still parked in a wait slot.
    ///
    /// A thread whose timeout already fired is `Ready` (or running) with
    /// `ReadyMsg::TIMEOUT` and is left alone.
    pub(crate) fn ready_if_suspended(
        &mut self,
        id: ThreadId,
        msg: ReadyMsg,
    ) -> bool {
        let index = self.checked_index(id);
        if self.threads[index].state() != SchedState::Suspended {
            return false;
        }
        self.make_ready(index, msg);
        true
    }

    /// Installs the idle thread on `idle_stack`, marks the kernel started
    /// and puts the most important ready thread on the CPU.
    pub(crate) fn launch(
        &mut self,
        idle_stack: &'static mut [usize],
    ) -> *mut Thread {
        uassert!(!self.started);
        let idle = &mut self.threads[IDLE];
        if idle.init(idle_stack, Priority::IDLE, idle_main, 0).is_err() {
            crate::fail::die("idle stack unusable");
        }
        let seq = self.stamp();
        self.threads[IDLE].make_ready(ReadyMsg::OK, seq);

        let first = match task::select(&self.threads) {
            Some(first) => first,
            None => crate::fail::die("no thread to run"),
        };
        self.threads[first].set_state(SchedState::Running);
        self.current = first;
        self.started = true;
        crate::profiling::event_context_switch(first);
        &mut self.threads[first] as *mut Thread
    }
}

impl Kernel {
    pub const fn new() -> Self {
        const EMPTY: Thread = Thread::EMPTY;
        Self {
            state: GateCell::new(KernelState {
                threads: [EMPTY; MAX_THREADS],
                current: IDLE,
                next_seq: 0,
                now: Timestamp::ZERO,
                started: false,
            }),
        }
    }

    pub(crate) fn state<'a, H: Held>(
        &'a self,
        cs: &'a H,
    ) -> core::cell::RefMut<'a, KernelState> {
        self.state.borrow_mut(cs)
    }

    /// Creates a thread that will run `entry(arg)` on `stack`, and makes it
    /// ready.
    ///
    /// Before `start`, this only fills in the table. Once the kernel is
    /// running, a new thread more important than the caller preempts it
    /// immediately.
    pub fn create_thread(
        &self,
        stack: &'static mut [usize],
        priority: Priority,
        entry: ThreadEntry,
        arg: usize,
    ) -> Result<ThreadId, CreateError> {
        if priority == Priority::IDLE {
            return Err(CreateError::ReservedPriority);
        }
        let cs = gate::lock();
        let (id, started) = {
            let mut st = self.state(&cs);
            let index = (IDLE + 1..MAX_THREADS)
                .find(|&i| st.threads[i].state() == SchedState::Free)
                .ok_or(CreateError::TableFull)?;
            st.threads[index].init(stack, priority, entry, arg)?;
            let seq = st.stamp();
            st.threads[index].make_ready(ReadyMsg::OK, seq);
            (st.id_of(index), st.started)
        };
        if started {
            self.reschedule_s(&cs);
        }
        Ok(id)
    }

    /// Makes a waiting thread ready, depositing `msg` as its wake code.
    ///
    /// Doesn't switch; an interrupt handler's exit path or a following
    /// `reschedule_s` does that.
    pub fn ready_i(&self, cs: &impl Held, id: ThreadId, msg: ReadyMsg) {
        let mut st = self.state(cs);
        let index = st.checked_index(id);
        st.make_ready(index, msg);
    }

    /// Checks whether a ready thread is strictly more important than the one
    /// running.
    pub fn is_resched_required_i(&self, cs: &impl Held) -> bool {
        self.state(cs).resched_required()
    }

    /// Switches to a more important ready thread, if there is one. The
    /// calling thread stays ready and picks up again when it is once more the
    /// best choice.
    pub fn reschedule_s(&self, cs: &SysLock) {
        let switch = {
            let mut st = self.state(cs);
            if !st.resched_required() {
                return;
            }
            st.switch_out()
        };
        self.perform(switch, true);
    }

    /// `ready_i` followed by `reschedule_s`.
    pub fn wakeup_s(&self, cs: &SysLock, id: ThreadId, msg: ReadyMsg) {
        self.ready_i(cs, id, msg);
        self.reschedule_s(cs);
    }

    /// Puts the calling thread to sleep in `state` until someone makes it
    /// ready, and returns the code they left.
    ///
    /// The gate stays held across the sleep as far as the caller can tell:
    /// the switch happens with it taken, the next thread runs with its own
    /// threshold, and the threshold comes back when this thread is resumed.
    pub fn go_to_sleep_s(&self, cs: &SysLock, state: SchedState) -> ReadyMsg {
        uassert!(state.is_waiting());
        let (me, switch) = {
            let mut st = self.state(cs);
            let me = st.current;
            st.threads[me].set_state(state);
            (me, st.switch_out())
        };
        self.perform(switch, true);
        self.state(cs).threads[me].ready_msg()
    }

    /// `go_to_sleep_s` with a time limit. `None` waits forever; `Some(0)`
    /// returns `ReadyMsg::TIMEOUT` at once without leaving the CPU.
    pub fn go_to_sleep_timeout_s(
        &self,
        cs: &SysLock,
        state: SchedState,
        timeout: Option<u32>,
    ) -> ReadyMsg {
        match timeout {
            Some(0) => return ReadyMsg::TIMEOUT,
            Some(ticks) => {
                let mut st = self.state(cs);
                let deadline = st.now.after(ticks);
                let me = st.current;
                st.threads[me].set_deadline(Some(deadline));
            }
            None => (),
        }
        self.go_to_sleep_s(cs, state)
    }

    /// Blocks the calling thread for `ticks` timer ticks.
    pub fn sleep(&self, ticks: u32) {
        let cs = gate::lock();
        self.go_to_sleep_timeout_s(&cs, SchedState::Sleeping, Some(ticks));
    }

    /// Ends the calling thread. It becomes `Final` and never runs again; its
    /// slot can then be reclaimed with `release`.
    ///
    /// On hardware this does not return. The host simulator returns, with
    /// the caller now standing in for whichever thread took over. Either way
    /// the gate token belonged to the exited thread and is consumed.
    pub fn exit_s(&self, cs: SysLock) {
        let switch = {
            let mut st = self.state(&cs);
            let me = st.current;
            uassert!(me != IDLE);
            st.threads[me].set_state(SchedState::Final);
            st.switch_out()
        };
        self.perform(switch, false);
        core::mem::forget(cs);
    }

    /// Reclaims the slot of a thread that has exited. Its `ThreadId` goes
    /// stale and the slot can be handed out again.
    pub fn release(&self, id: ThreadId) {
        let cs = gate::lock();
        let mut st = self.state(&cs);
        let index = st.checked_index(id);
        uassert!(st.threads[index].state() == SchedState::Final);
        st.threads[index].release();
    }

    /// Advances time by one tick and wakes every thread whose timeout has
    /// expired.
    pub fn tick_i(&self, cs: &impl Held) {
        let mut st = self.state(cs);
        st.now = st.now.after(1);
        let now = st.now;
        let mut seq = st.next_seq;
        task::process_timers(&mut st.threads, now, &mut seq);
        st.next_seq = seq;
    }

    /// Identifies the running thread.
    pub fn current_s(&self, cs: &impl Held) -> ThreadId {
        let st = self.state(cs);
        st.id_of(st.current)
    }

    /// Reads the scheduler state of `id`, or `None` if the id is stale.
    pub fn state_of(&self, cs: &impl Held, id: ThreadId) -> Option<SchedState> {
        let st = self.state(cs);
        st.index_of(id).map(|i| st.threads[i].state())
    }

    pub fn now_s(&self, cs: &impl Held) -> Timestamp {
        self.state(cs).now
    }

    /// Body of the deferred reschedule trap. The trap has already saved the
    /// interrupted thread's context; this picks the thread to restore.
    pub(crate) fn pendsv_select(&self) -> *mut Thread {
        crate::profiling::event_reschedule_enter();
        let cs = gate::lock_from_isr();
        let mut st = self.state(&cs);
        if st.resched_required() {
            let switch = st.switch_out();
            // Safety: both point into the table we hold borrowed.
            #[cfg(feature = "stack-check")]
            unsafe {
                let (suspend, resume) = (&*switch.suspend, &*switch.resume);
                check_stack(suspend, suspend.save().stack_pointer());
                check_stack(resume, resume.save().stack_pointer());
            }
            crate::profiling::event_context_switch(switch.resume_index);
        }
        let current = st.current;
        let next = &mut st.threads[current] as *mut Thread;
        drop(st);
        drop(cs);
        crate::profiling::event_reschedule_exit();
        next
    }

    /// Runs the context-switch trap for `switch`. If `park`, the caller is a
    /// thread that expects to be resumed later and this returns only then.
    fn perform(&self, switch: Switch, park: bool) {
        // Safety: `switch` came from `switch_out`, so both pointers are
        // distinct entries of our thread table, and nothing has the table
        // borrowed right now.
        unsafe {
            #[cfg(feature = "stack-check")]
            {
                let sp = arch::current_stack_pointer();
                check_stack(
                    &*switch.suspend,
                    sp.wrapping_sub(arch::FRAME_SIZE),
                );
                check_stack(
                    &*switch.resume,
                    (*switch.resume).save().stack_pointer(),
                );
            }
            crate::profiling::event_context_switch(switch.resume_index);
            arch::switch(switch.resume, switch.suspend);
        }
        if park {
            arch::wait_for_resume(switch.suspend, switch.idle);
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Halts if `sp` would leave `thread` without room for a nested interrupt.
#[cfg(feature = "stack-check")]
fn check_stack(thread: &Thread, sp: usize) {
    if !thread.has_room_below(sp) {
        crate::fail::die("stack overflow");
    }
}

/// Where threads go when their entry function returns.
pub(crate) extern "C" fn thread_exit() {
    let kernel = arch::kernel();
    kernel.exit_s(gate::lock());
    crate::fail::die("exited thread resumed");
}

/// Body of the idle thread.
pub(crate) extern "C" fn idle_main(_arg: usize) {
    loop {
        arch::idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake;

    extern "C" fn parked(_: usize) {}

    fn boot(priority: u8) -> (&'static Kernel, ThreadId) {
        fake::power_on();
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new()));
        let me = kernel
            .create_thread(fake::leak_stack(512), Priority(priority), parked, 0)
            .unwrap();
        kernel.start(fake::leak_stack(256), 1);
        (kernel, me)
    }

    #[test]
    fn start_runs_the_most_important_thread() {
        fake::power_on();
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new()));
        let low = kernel
            .create_thread(fake::leak_stack(256), Priority(4), parked, 0)
            .unwrap();
        let high = kernel
            .create_thread(fake::leak_stack(256), Priority(2), parked, 0)
            .unwrap();
        kernel.start(fake::leak_stack(256), 1);

        gate::with(|cs| {
            assert_eq!(kernel.current_s(cs), high);
            assert_eq!(kernel.state_of(cs, high), Some(SchedState::Running));
            assert_eq!(kernel.state_of(cs, low), Some(SchedState::Ready));
        });
    }

    #[test]
    fn sleep_wakes_after_the_requested_ticks() {
        let (kernel, me) = boot(3);
        kernel.sleep(3);
        gate::with(|cs| {
            assert_eq!(kernel.current_s(cs), me);
            assert_eq!(u64::from(kernel.now_s(cs)), 3);
        });
    }

    #[test]
    fn zero_timeout_returns_without_sleeping() {
        let (kernel, _me) = boot(3);
        let before = fake::context_switches();
        let msg = gate::with(|cs| {
            kernel.go_to_sleep_timeout_s(cs, SchedState::Suspended, Some(0))
        });
        assert_eq!(msg, ReadyMsg::TIMEOUT);
        assert_eq!(fake::context_switches(), before);
    }

    #[test]
    fn timeout_reports_timeout_code() {
        let (kernel, _me) = boot(3);
        let msg = gate::with(|cs| {
            kernel.go_to_sleep_timeout_s(cs, SchedState::Suspended, Some(2))
        });
        assert_eq!(msg, ReadyMsg::TIMEOUT);
    }

    #[test]
    fn less_important_thread_does_not_preempt() {
        let (kernel, me) = boot(2);
        let other = kernel
            .create_thread(fake::leak_stack(256), Priority(5), parked, 0)
            .unwrap();
        gate::with(|cs| {
            assert!(!kernel.is_resched_required_i(cs));
            kernel.reschedule_s(cs);
            assert_eq!(kernel.current_s(cs), me);
            assert_eq!(kernel.state_of(cs, other), Some(SchedState::Ready));
        });
    }

    /// Parks a fresh priority-5 thread as if it had gone to sleep with a
    /// timeout.
    fn sleeper(kernel: &Kernel) -> ThreadId {
        let id = kernel
            .create_thread(fake::leak_stack(256), Priority(5), parked, 0)
            .unwrap();
        gate::with(|cs| {
            let mut st = kernel.state(cs);
            let deadline = st.now.after(10);
            let t = &mut st.threads[id.index()];
            t.set_state(SchedState::Sleeping);
            t.set_deadline(Some(deadline));
        });
        id
    }

    #[test]
    fn wakeup_readies_a_sleeper_without_preempting_the_caller() {
        let (kernel, me) = boot(2);
        let other = sleeper(kernel);
        let before = fake::context_switches();

        gate::with(|cs| {
            kernel.wakeup_s(cs, other, ReadyMsg(7));
            assert_eq!(kernel.current_s(cs), me);
            assert_eq!(kernel.state_of(cs, other), Some(SchedState::Ready));
            let st = kernel.state(cs);
            let woken = &st.threads[other.index()];
            assert_eq!(woken.ready_msg(), ReadyMsg(7));
            assert_eq!(woken.deadline(), None);
        });
        assert_eq!(fake::context_switches(), before);
    }

    #[test]
    #[should_panic(expected = "state().is_waiting()")]
    fn waking_a_thread_that_is_not_waiting_dies() {
        let (kernel, _me) = boot(2);
        let other = kernel
            .create_thread(fake::leak_stack(256), Priority(5), parked, 0)
            .unwrap();
        gate::with(|cs| kernel.wakeup_s(cs, other, ReadyMsg::OK));
    }

    #[test]
    fn released_thread_slot_gets_new_generation() {
        let (kernel, me) = boot(2);
        kernel.exit_s(gate::lock());
        gate::with(|cs| {
            assert_eq!(kernel.state_of(cs, me), Some(SchedState::Final));
            assert_eq!(kernel.current_s(cs).index(), IDLE);
        });

        kernel.release(me);
        gate::with(|cs| {
            assert_eq!(kernel.state_of(cs, me), None);
            let st = kernel.state(cs);
            let slot = &st.threads[me.index()];
            assert_eq!(slot.state(), SchedState::Free);
            assert_eq!(slot.generation(), me.generation().next());
        });
    }

    #[test]
    fn create_rejects_bad_requests() {
        fake::power_on();
        let kernel = Kernel::new();
        assert_eq!(
            kernel.create_thread(fake::leak_stack(4), Priority(1), parked, 0),
            Err(CreateError::StackTooSmall)
        );
        assert_eq!(
            kernel.create_thread(
                fake::leak_stack(256),
                Priority::IDLE,
                parked,
                0
            ),
            Err(CreateError::ReservedPriority)
        );
        for _ in 1..MAX_THREADS {
            kernel
                .create_thread(fake::leak_stack(64), Priority(1), parked, 0)
                .unwrap();
        }
        assert_eq!(
            kernel.create_thread(fake::leak_stack(64), Priority(1), parked, 0),
            Err(CreateError::TableFull)
        );
    }

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn switching_out_with_an_exhausted_stack_dies() {
        let (kernel, _me) = boot(2);
        let mut regs = fake::registers();
        let base = gate::with(|cs| {
            let st = kernel.state(cs);
            st.threads[st.current].stack_base()
        });
        regs.sp = base + crate::arch::FRAME_SIZE;
        fake::set_registers(regs);
        kernel.sleep(1);
    }

    #[test]
    #[should_panic(expected = "stale thread id")]
    fn readying_a_stale_thread_dies() {
        let (kernel, me) = boot(2);
        let bogus =
            ThreadId::for_index_and_gen(me.index(), me.generation().next());
        gate::with(|cs| kernel.ready_i(cs, bogus, ReadyMsg::OK));
    }
}
