// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and build-time configuration.
//!
//! The constants below are generated by `build.rs` from `kernel.toml` (or the
//! file named by `KERN_CONFIG`).

use crate::arch;
use crate::gate;
use crate::sched::Kernel;

include!(concat!(env!("OUT_DIR"), "/consts.rs"));

impl Kernel {
    /// Starts the scheduler.
    ///
    /// Creates the idle thread on `idle_stack`, hands the kernel to the
    /// architecture layer (tick handler, deferred reschedule trap) and enters
    /// the most important thread created so far. `tick_divisor` is the number
    /// of CPU cycles per kernel tick.
    ///
    /// On hardware `arch::Started` is uninhabited: this never returns, and
    /// the calling context is abandoned. The host simulator returns, with the
    /// caller now running as the first thread.
    ///
    /// # Panics
    ///
    /// Dies if called twice or if the idle stack is unusable.
    pub fn start(
        &'static self,
        idle_stack: &'static mut [usize],
        tick_divisor: u32,
    ) -> arch::Started {
        let first = {
            let cs = gate::lock();
            let mut st = self.state(&cs);
            st.launch(idle_stack)
        };
        arch::start_first_thread(self, first, tick_divisor)
    }
}
