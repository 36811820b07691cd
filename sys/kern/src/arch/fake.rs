// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the hardware, used to run the monitor in tests.
//!
//! Memory is the host's own: "addresses" are pointers into whatever the test
//! allocated, and the fake only pretends to enforce per-box read rights for
//! checked reads.

use core::ops::Range;

use abi::{BoxId, FaultInfo, FaultSource};

use super::Platform;

const MAX_READABLE: usize = 32;

#[derive(Debug, Default)]
pub struct FakePlatform {
    active: Option<BoxId>,
    psp: usize,
    switches: usize,
    last_switch: Option<(BoxId, BoxId)>,
    readable: heapless::Vec<(BoxId, Range<usize>), MAX_READABLE>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets `id` do checked reads of `range` while it is the active box.
    pub fn allow_read(&mut self, id: BoxId, range: Range<usize>) {
        if self.readable.push((id, range)).is_err() {
            panic!("too many readable ranges for the fake platform");
        }
    }

    /// Box whose memory protection is currently loaded.
    pub fn active(&self) -> Option<BoxId> {
        self.active
    }

    pub fn psp(&self) -> usize {
        self.psp
    }

    /// Number of times protection has been reprogrammed.
    pub fn switch_count(&self) -> usize {
        self.switches
    }

    pub fn last_switch(&self) -> Option<(BoxId, BoxId)> {
        self.last_switch
    }

    fn readable_by(&self, id: BoxId, addr: usize) -> bool {
        let Some(end) = addr.checked_add(4) else {
            return false;
        };
        self.readable
            .iter()
            .any(|(b, r)| *b == id && r.start <= addr && end <= r.end)
    }
}

impl Platform for FakePlatform {
    fn domain_switch(&mut self, src: BoxId, dst: BoxId) {
        self.active = Some(dst);
        self.switches += 1;
        self.last_switch = Some((src, dst));
    }

    fn set_process_sp(&mut self, sp: usize) {
        self.psp = sp;
    }

    fn unprivileged_read(&self, addr: usize) -> Result<u32, FaultInfo> {
        let allowed = addr % 4 == 0
            && self.active.is_some_and(|id| self.readable_by(id, addr));
        if !allowed {
            return Err(FaultInfo::MemoryAccess {
                address: Some(addr),
                source: FaultSource::Monitor,
            });
        }
        // Safety: the test registered this range as readable memory.
        Ok(unsafe { self.read_word(addr) })
    }

    unsafe fn read_word(&self, addr: usize) -> u32 {
        core::ptr::read_volatile(addr as *const u32)
    }

    unsafe fn write_word(&mut self, addr: usize, value: u32) {
        core::ptr::write_volatile(addr as *mut u32, value)
    }
}
