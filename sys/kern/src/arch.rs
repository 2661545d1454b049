// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names:
//!
//! - `SavedState`, `FRAME_SIZE`, `Started`
//! - `setup_context`, `switch`, `start_first_thread`, `wait_for_resume`
//! - `lock`, `unlock`, `lock_from_isr`, `unlock_from_isr`
//! - `disable`, `suspend`, `enable`
//! - `pend_reschedule`, `enable_irq`, `disable_irq`, `idle`
//! - `current_stack_pointer`, `kernel`

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
