// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing drivers and kernel code.
//!
//! A static ring buffer records the last `N` events of interest, each tagged
//! with the source line that recorded it. It's meant to be read out with a
//! debugger after the fact, which makes it usable from interrupt handlers and
//! from code running with the kernel gate held, where nothing else is.
//!
//! ## Constraints
//!
//! The payload type must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! Recording takes a `critical_section`, so something in the final image has
//! to provide an implementation. The kernel does, on hardware.
//!
//! ## Creating a ring buffer
//!
//! ```ignore
//! ringbuf!(Trace, 16, Trace::None);
//!
//! ringbuf_entry!(Trace::CmdSent(18));
//! ```
//!
//! or, with a name:
//!
//! ```ignore
//! ringbuf!(SDC_RINGBUF, Trace, 16, Trace::None);
//!
//! ringbuf_entry!(SDC_RINGBUF, Trace::CmdSent(18));
//! ```
//!
//! Recording a payload identical to the most recent one from the same line
//! bumps that entry's `count` instead of using a new slot, so a polling loop
//! doesn't flush out everything interesting.
//!
//! ## Inspecting a ring buffer via GDB
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print drv_stm32f1_sdc::__RINGBUF
//! ```

#![cfg_attr(not(test), no_std)]

use core::cell::RefCell;

#[doc(hidden)]
pub use critical_section;

/// Storage type behind every `ringbuf!`.
pub type StaticRingbuf<T, const N: usize> =
    critical_section::Mutex<RefCell<Ringbuf<T, N>>>;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// If you omit the name, it defaults to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::StaticRingbuf<$t, $n> =
            $crate::critical_section::Mutex::new(::core::cell::RefCell::new(
                $crate::Ringbuf::new($init),
            ));
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a ringbuffer declared with `ringbuf!`.
///
/// `ringbuf_entry!(NAME, expr)` inserts `expr` into the ringbuffer called
/// `NAME`; `ringbuf_entry!(expr)` uses `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload outside the critical section, and without
        // letting it see the buffer binding.
        let (p, buf) = ($payload, &$buf);
        $crate::critical_section::with(|cs| {
            $crate::Ringbuf::entry(
                &mut *buf.borrow_ref_mut(cs),
                line!() as u16,
                p,
            );
        });
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// A single entry. `count` is how many times in a row this payload was
/// recorded from this line; `generation` how many times the slot has been
/// reused.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size. Normally declared through
/// `ringbuf!`.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // Treat "nothing recorded yet" as an out-of-range index so the first
        // entry lands in slot 0 and never merges with the initializer.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // No remainder: most targets lack a hardware divider, and this also
        // turns usize::MAX into 0.
        let ndx = match last.wrapping_add(1) {
            n if n >= self.buffer.len() => 0,
            n => n,
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Entries recorded so far, oldest first. Slots never written have a
    /// zero count.
    pub fn entries(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last + 1,
            None => self.buffer.len(),
        };
        self.buffer[start.min(N)..]
            .iter()
            .chain(self.buffer[..start.min(N)].iter())
            .filter(|e| e.count != 0)
    }

    /// The most recently recorded payload, if any.
    pub fn last_payload(&self) -> Option<T> {
        self.last.and_then(|i| self.buffer.get(i)).map(|e| e.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn repeats_are_counted_in_place() {
        let mut rb = Ringbuf::<u8, 4>::new(0);
        rb.entry(10, 1);
        rb.entry(10, 1);
        rb.entry(11, 1);
        let got: Vec<_> =
            rb.entries().map(|e| (e.line, e.payload, e.count)).collect();
        assert_eq!(got, [(10, 1, 2), (11, 1, 1)]);
        assert_eq!(rb.last_payload(), Some(1));
    }

    #[test]
    fn slot_survives_generation_wraparound() {
        let mut rb = Ringbuf::<u8, 2>::new(0);
        rb.buffer[0].generation = u16::MAX;
        rb.entry(10, 1);
        assert_eq!(rb.buffer[0].generation, 0);
        let got: Vec<_> = rb.entries().map(|e| (e.line, e.payload)).collect();
        assert_eq!(got, [(10, 1)]);
    }

    ringbuf!(u32, 8, 0);

    #[test]
    fn macro_records_through_the_static() {
        ringbuf_entry!(7);
        ringbuf_entry!(9);
        critical_section::with(|cs| {
            let rb = __RINGBUF.borrow_ref(cs);
            assert_eq!(rb.last_payload(), Some(9));
            let payloads: Vec<_> = rb.entries().map(|e| e.payload).collect();
            assert!(payloads.ends_with(&[7, 9]));
        });
    }

    proptest! {
        #[test]
        fn keeps_the_newest_distinct_entries(
            payloads in prop::collection::vec(0u8..4, 0..40),
        ) {
            let mut rb = Ringbuf::<u8, 5>::new(0);
            let mut model: Vec<(u8, u32)> = Vec::new();
            for &p in &payloads {
                rb.entry(1, p);
                match model.last_mut() {
                    Some((last, count)) if *last == p => *count += 1,
                    _ => model.push((p, 1)),
                }
            }
            let keep = model.len().saturating_sub(5);
            let got: Vec<_> =
                rb.entries().map(|e| (e.payload, e.count)).collect();
            prop_assert_eq!(got, model[keep..].to_vec());
        }
    }
}
