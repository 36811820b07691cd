// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static ring buffers for tracing the monitor.
//!
//! The monitor has nowhere to print to, so what it has done is recorded in
//! ring buffers that live in RAM and are read back with a debugger (or, in
//! tests, through [`Ringbuf::iter`]).
//!
//! ## Constraints
//!
//! The payload type must implement `Copy` and `PartialEq`. Entries with the
//! same source line and payload as the newest entry are folded into it by
//! bumping its `count`, so a hot loop doesn't wipe the history.
//!
//! Recording never blocks. If the buffer is already being written (by code
//! this context preempted, or by another thread in a host test) the new entry
//! is dropped.
//!
//! ## Usage
//!
//! ```
//! ringbuf!(Trace, 16, Trace::None);
//!
//! ringbuf_entry!(Trace::Delivered { from, to });
//! ```
//!
//! A name can be given to hold more than one buffer per module:
//!
//! ```
//! ringbuf!(SWITCH_RINGBUF, (u8, u8), 32, (0, 0));
//!
//! ringbuf_entry!(SWITCH_RINGBUF, (src, dst));
//! ```
//!
//! To inspect a buffer from GDB, print the static, e.g.
//! `print kern::monitor::__RINGBUF`. Turn `print pretty on` first; the
//! newest entry is the one at index `last`.

#![cfg_attr(not(test), no_std)]

/// Re-export so that code generated by the macros can always find it.
pub use static_cell::StaticCell;

/// Declares a ring buffer in the current module.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a static named `NAME` of type
/// `StaticCell<Ringbuf<Type, N>>`, with every entry initialized to `expr`.
/// Without a name, the static is called `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::StaticCell<$crate::Ringbuf<$t, $n>> =
            $crate::StaticCell::new($crate::Ringbuf::new($init));
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

/// Records an entry in a ring buffer declared with [`ringbuf!`].
///
/// `ringbuf_entry!(NAME, expr)` records `expr` in `NAME`; without a name,
/// `__RINGBUF` is used.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both in a tuple so neither can see the other's binding.
        let (p, buf) = ($payload, &$buf);
        if let Some(mut rb) = $crate::StaticCell::try_borrow_mut(buf) {
            $crate::Ringbuf::entry(&mut *rb, line!() as u16, p);
        }
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

/// Records an entry in a ring buffer declared at the root of this crate.
#[cfg(not(feature = "disabled"))]
#[allow(clippy::crate_in_macro_def)]
#[macro_export]
macro_rules! ringbuf_entry_root {
    ($buf:ident, $payload:expr) => {
        $crate::ringbuf_entry!(crate::$buf, $payload);
    };
    ($payload:expr) => {
        $crate::ringbuf_entry!(crate::__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry_root {
    ($buf:ident, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// One entry. `generation` counts how many times the slot has been reused.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of `N` entries; see [`ringbuf!`].
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
        // A fresh buffer has no `last`; treating that as out of range makes
        // the first entry land in slot 0 without folding into anything.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // No hardware divide on some targets, so no `%` here.
        let ndx = match last.wrapping_add(1) {
            n if n >= N => 0,
            n => n,
        };

        let Some(ent) = self.buffer.get_mut(ndx) else {
            // N == 0: nowhere to record anything.
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// Recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let split = self.last.map_or(0, |l| l + 1);
        let (newer, older) = self.buffer.split_at(split.min(N));
        older
            .iter()
            .chain(newer.iter())
            .filter(|e| e.generation != 0)
    }
}
