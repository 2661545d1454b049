// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be found by
//! tooling.
//!
//! Kernel state corruption (a blown stack, a nested gate, a second thread
//! registering on a busy wait slot) is never reported as a value. It ends up
//! in `die`, which on hardware:
//!
//! - sets `kern::fail::KERNEL_HAS_FAILED` to `true`, and
//! - writes as much of the failure reason as fits into
//!   `kern::fail::KERNEL_EPITAPH` (UTF-8, NUL padded),
//!
//! and then spins with interrupts masked. A debugger can read both symbols.
//!
//! In host builds `die` panics instead, so simulator tests can observe it.

use core::fmt::Display;

/// Asserts a kernel invariant, sending failures to `die`.
///
/// Unlike `assert!` this doesn't drag the formatting machinery into the
/// kernel for the message.
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            $crate::fail::die(concat!(
                "assertion failed: ",
                stringify!($cond)
            ));
        }
    };
    ($cond:expr, $msg:expr) => {
        if !$cond {
            $crate::fail::die($msg);
        }
    };
}

macro_rules! uassert_eq {
    ($a:expr, $b:expr) => {
        if $a != $b {
            $crate::fail::die(concat!(
                "assertion failed: ",
                stringify!($a),
                " == ",
                stringify!($b)
            ));
        }
    };
}

#[cfg(target_os = "none")]
mod epitaph {
    use core::fmt::{Display, Write};
    use core::sync::atomic::Ordering;

    /// Flag that gets set to `true` by all failure reporting functions,
    /// giving tools a one-stop-shop for doing kernel triage.
    #[used]
    #[no_mangle]
    static mut KERNEL_HAS_FAILED: bool = false;

    const EPITAPH_LEN: usize = 128;

    /// Records up to `EPITAPH_LEN` bytes of description of the event that
    /// caused the kernel to fail, padded with NULs.
    #[used]
    #[no_mangle]
    static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

    fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
        cortex_m::interrupt::disable();

        // Safety: interrupts are off and we're on the way down, so nothing
        // else can be looking at these.
        let previous_fail = unsafe {
            core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
        };
        if previous_fail {
            // Recursive failure. Panicking again would only make it worse.
            loop {
                core::sync::atomic::fence(Ordering::SeqCst);
            }
        }

        // Safety: only one execution of this function gets past the flag.
        unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
    }

    #[inline(never)]
    pub(super) fn die_impl(msg: &dyn Display) -> ! {
        let buf = begin_epitaph();
        let mut writer = Eulogist { dest: buf };
        write!(writer, "{msg}").ok();

        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    struct Eulogist {
        dest: &'static mut [u8],
    }

    impl Write for Eulogist {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let s = s.as_bytes();
            let n = s.len().min(self.dest.len());
            let (dest, leftovers) = {
                let taken = core::mem::take(&mut self.dest);
                taken.split_at_mut(n)
            };
            dest.copy_from_slice(&s[..n]);
            self.dest = leftovers;
            Ok(())
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
        die_impl(info)
    }
}

/// Halts the system, recording `msg`. Never returns.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    #[cfg(target_os = "none")]
    {
        epitaph::die_impl(&msg)
    }
    #[cfg(not(target_os = "none"))]
    {
        panic!("kernel died: {msg}")
    }
}
