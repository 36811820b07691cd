// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording monitor failures such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is false at boot and set
//!   to true when the monitor reaches `die` (explicitly, or through a
//!   `panic!`).
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. `die` writes as much
//!   of the failure reason into it (as UTF-8) as fits; trailing NULs are
//!   padding.
//!
//! On the host there's no debugger to leave an epitaph for, so `die` panics
//! with the message instead. That is what lets tests observe monitor
//! invariant failures with `#[should_panic]`.

use core::fmt::Display;

#[cfg(target_os = "none")]
mod epitaph {
    use core::fmt::{Display, Write};
    use core::sync::atomic::{fence, Ordering};

    #[used]
    static mut KERNEL_HAS_FAILED: bool = false;

    const EPITAPH_LEN: usize = 128;

    #[used]
    static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

    fn begin() -> &'static mut [u8; EPITAPH_LEN] {
        // Safety: the monitor is single-core and `die` runs with nothing
        // else making progress. The flag keeps a nested failure from getting
        // a second &mut to the epitaph.
        let flag = core::ptr::addr_of_mut!(KERNEL_HAS_FAILED);
        let previous_fail = unsafe { core::ptr::replace(flag, true) };
        if previous_fail {
            // Failed while failing. Panicking would only recurse.
            halt();
        }
        // Safety: only the first caller gets past the flag above.
        unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
    }

    pub(super) fn write(msg: &dyn Display) {
        let mut writer = Eulogist { dest: begin() };
        write!(writer, "{msg}").ok();
    }

    pub(super) fn halt() -> ! {
        loop {
            fence(Ordering::SeqCst);
        }
    }

    struct Eulogist {
        dest: &'static mut [u8],
    }

    impl Write for Eulogist {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let s = s.as_bytes();
            let n = s.len().min(self.dest.len());
            let taken = core::mem::take(&mut self.dest);
            let (dest, leftovers) = taken.split_at_mut(n);
            dest.copy_from_slice(&s[..n]);
            self.dest = leftovers;
            Ok(())
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
        super::die(info)
    }
}

/// Stops the monitor, recording `msg` for whoever comes looking.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    #[cfg(target_os = "none")]
    {
        epitaph::write(msg);
        epitaph::halt()
    }
    #[cfg(not(target_os = "none"))]
    {
        panic!("monitor died: {msg}")
    }
}
