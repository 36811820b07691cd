// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-M / ARMv8-M support.
//!
//! # Unprivileged reads
//!
//! `unprivileged_read` uses `ldrt`, which performs the load with the rights
//! of thread-mode code. If the box can't read the address, the load takes a
//! MemManage fault; the fault handler (outside this crate) recognizes a
//! faulting `ldrt` issued by the monitor and kills the box that supplied the
//! address, so by the time this returns the word was readable.
//!
//! # Memory protection
//!
//! Region arithmetic differs between MPU flavors and vendor protection
//! units, so it is left to the board: `CortexM` calls the hook it was built
//! with whenever the active box changes.

use core::arch::asm;

use abi::{BoxId, FaultInfo};

use super::Platform;

/// Board hook that reprograms memory protection from `src` to `dst`.
pub type MpuSwitch = fn(src: BoxId, dst: BoxId);

pub struct CortexM {
    mpu_switch: MpuSwitch,
}

impl CortexM {
    /// # Safety
    ///
    /// Only one `CortexM` may exist, and it must only be used from handler
    /// mode, since it writes the process stack pointer.
    pub const unsafe fn new(mpu_switch: MpuSwitch) -> Self {
        Self { mpu_switch }
    }
}

impl Platform for CortexM {
    fn domain_switch(&mut self, src: BoxId, dst: BoxId) {
        (self.mpu_switch)(src, dst);
    }

    fn set_process_sp(&mut self, sp: usize) {
        // Safety: we're in handler mode (see `new`), so the new PSP only takes
        // effect on exception return.
        unsafe { cortex_m::register::psp::write(sp as u32) }
    }

    fn unprivileged_read(&self, addr: usize) -> Result<u32, FaultInfo> {
        let value: u32;
        // Safety: `ldrt` can't touch anything the box couldn't; a bad address
        // faults into the box's fault path (see module docs).
        unsafe {
            asm!(
                "ldrt {v}, [{a}]",
                v = out(reg) value,
                a = in(reg) addr,
                options(nostack, readonly, preserves_flags),
            );
        }
        Ok(value)
    }

    unsafe fn read_word(&self, addr: usize) -> u32 {
        core::ptr::read_volatile(addr as *const u32)
    }

    unsafe fn write_word(&mut self, addr: usize, value: u32) {
        core::ptr::write_volatile(addr as *mut u32, value)
    }
}
