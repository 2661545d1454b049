// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Preemptive, priority-based kernel core.
//!
//! This crate holds the scheduler and everything that has to be ordered
//! precisely against interrupts:
//!
//! - `gate`: the interrupt-priority-threshold critical section, with separate
//!   thread and interrupt-handler entry points.
//! - `task` and `sched`: thread control blocks, the ready scheduler, timers.
//! - `arch`: the trap-based context switch. Everything that knows about
//!   register or stack layout lives there, and nowhere else.
//! - `irq`: the wrapper every kernel-aware interrupt handler runs inside.
//! - `rendezvous`: the single-slot sleep/wake handoff drivers use to turn an
//!   interrupt-driven completion into a blocking call.
//!
//! # Naming
//!
//! Operations whose names end in `_i` are I-class: they may only be called
//! with the gate held, from either thread or interrupt context, and they never
//! block. Operations ending in `_s` require the gate to have been taken from
//! thread context and may switch threads. The gate token types enforce this
//! at compile time.
//!
//! # Host builds
//!
//! On anything other than a bare-metal ARM target, `arch` is a simulator of
//! the Cortex-M trap model (see `arch::fake`) so the whole kernel, and drivers
//! built on it, can be exercised by ordinary `cargo test`.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod fail;

pub mod arch;
pub mod gate;
pub mod irq;
pub mod profiling;
pub mod rendezvous;
pub mod sched;
pub mod startup;
pub mod task;
pub mod time;

pub use abi::{Priority, ReadyMsg, SchedState, ThreadId};
pub use sched::Kernel;
