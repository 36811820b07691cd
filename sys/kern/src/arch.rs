// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! The portable parts of the monitor talk to the hardware only through the
//! [`Platform`] trait. Which implementation is available depends on the
//! target:
//!
//! - on `arm`, [`arm_m::CortexM`] drives the real process stack pointer and
//!   hands MPU reprogramming to a board-supplied hook;
//! - everywhere else, [`fake::FakePlatform`] records what it was asked to do,
//!   so the monitor can be exercised by host tests.

use abi::{BoxId, FaultInfo};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod fake;
        pub use fake::*;
    }
}

/// Hardware operations the context-switch kernel depends on.
pub trait Platform {
    /// Makes `dst` the box whose memory is accessible to unprivileged code.
    /// Calling this with `src == dst` must be harmless.
    fn domain_switch(&mut self, src: BoxId, dst: BoxId);

    /// Installs `sp` as the process stack pointer used on exception return.
    fn set_process_sp(&mut self, sp: usize);

    /// Reads the word at `addr` with the rights of the running box.
    fn unprivileged_read(&self, addr: usize) -> Result<u32, FaultInfo>;

    /// Reads the word at `addr` with monitor rights.
    ///
    /// # Safety
    ///
    /// `addr` must be word aligned and readable by the monitor.
    unsafe fn read_word(&self, addr: usize) -> u32;

    /// Writes the word at `addr` with monitor rights.
    ///
    /// # Safety
    ///
    /// `addr` must be word aligned, writable by the monitor, and not alias
    /// anything the monitor holds a reference to.
    unsafe fn write_word(&mut self, addr: usize, value: u32);
}
