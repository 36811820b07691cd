// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small system of boxes in host memory.
//!
//! Everything a box owns (index, stack, data) is leaked so it can be handed
//! to the monitor as `'static` memory, and described to it as the box's
//! regions. Gateways live in a leaked [`Flash`] that the memory map treats
//! as flash.

#![allow(dead_code)]

use std::cell::Cell;
use std::ops::Range;
use std::time::Instant;

use kern::arch::FakePlatform;
use kern::{BoxDesc, MemoryMap, Monitor};
use userlib::{
    BoxConfig, BoxId, BoxIndex, Clock, RegionAttributes, RegionDesc,
    RpcGateway, RpcTarget, Runtime, SecureGateway,
};
use zerocopy::FromZeros;

pub const STACK_BYTES: usize = 2048;
pub const DATA_BYTES: usize = 1024;

pub struct StdClock(Instant);

impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}

/// Stands in for the stub every RPC gateway branches to.
pub extern "C" fn caller_stub() {}

/// Stands in for the code a secure gateway call returns into.
pub extern "C" fn return_thunk() {}

#[repr(C)]
pub struct Flash {
    pub rpc: [RpcGateway; 4],
    pub secure: [SecureGateway; 4],
}

impl Flash {
    pub fn new() -> Self {
        Self {
            rpc: [RpcGateway::new_zeroed(); 4],
            secure: [SecureGateway::new_zeroed(); 4],
        }
    }
}

fn leak_words(bytes: usize) -> Range<usize> {
    let words = vec![0u64; bytes / 8].into_boxed_slice();
    let base = Box::into_raw(words) as *mut u64 as usize;
    base..base + bytes
}

pub struct Builder {
    configs: Vec<&'static BoxConfig>,
    exports: Vec<(usize, Range<usize>)>,
    public: Vec<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            configs: vec![],
            exports: vec![],
            public: vec![caller_stub as usize, return_thunk as usize],
        }
    }

    pub fn add_box(&mut self, config: BoxConfig) -> BoxId {
        self.configs.push(Box::leak(Box::new(config)));
        BoxId(self.configs.len() as u8 - 1)
    }

    pub fn config(&self, id: BoxId) -> &'static BoxConfig {
        self.configs[id.index()]
    }

    /// Makes `fns` servable by box `id`: public code, with a list the box
    /// can read.
    pub fn export(
        &mut self,
        id: BoxId,
        fns: &[RpcTarget],
    ) -> &'static [RpcTarget] {
        let list: &'static [RpcTarget] =
            Box::leak(fns.to_vec().into_boxed_slice());
        let base = list.as_ptr() as usize;
        let bytes = std::mem::size_of_val(list);
        self.exports.push((id.index(), base..base + bytes));
        self.public.extend(fns.iter().map(|f| *f as usize));
        list
    }

    /// Adds a function to public code without exporting it over RPC.
    pub fn public(&mut self, addr: usize) {
        self.public.push(addr);
    }

    pub fn build(self, flash: Flash) -> World {
        let flash: &'static Flash = Box::leak(Box::new(flash));
        let flash_base = flash as *const Flash as usize;
        let map = MemoryMap {
            flash: flash_base..flash_base + std::mem::size_of::<Flash>(),
            public_code: self.public_range(),
        };

        let mut platform = FakePlatform::new();
        let mut boxes = vec![];
        let mut descs = vec![];
        for (i, config) in self.configs.iter().enumerate() {
            let index: &'static BoxIndex =
                Box::leak(Box::new(BoxIndex::new(config)));
            let stack = leak_words(STACK_BYTES);
            let data = leak_words(DATA_BYTES);
            platform.allow_read(BoxId(i as u8), stack.clone());

            let rw = RegionAttributes::READ | RegionAttributes::WRITE;
            let index_base = index as *const BoxIndex as usize;
            let mut regions = vec![
                region(index_base..index_base + size_of_index(), rw),
                region(stack.clone(), rw),
                region(data.clone(), rw),
            ];
            for (_, r) in self.exports.iter().filter(|(b, _)| *b == i) {
                regions.push(region(r.clone(), RegionAttributes::READ));
            }
            regions.sort_by_key(|r| r.base);

            descs.push(BoxDesc {
                config,
                index,
                stack_top: stack.end,
                regions: Box::leak(regions.into_boxed_slice()),
            });
            boxes.push(TestBox {
                config,
                index,
                stack,
                next: Cell::new(data.start),
                data,
            });
        }

        let monitor =
            Monitor::new(platform, map, return_thunk as usize, &descs);
        World {
            monitor,
            boxes,
            flash,
        }
    }

    fn public_range(&self) -> Range<usize> {
        let lo = self.public.iter().copied().min().unwrap_or(0);
        let hi = self.public.iter().copied().max().unwrap_or(0);
        lo..hi + 4
    }
}

fn size_of_index() -> usize {
    std::mem::size_of::<BoxIndex>()
}

fn region(r: Range<usize>, attributes: RegionAttributes) -> RegionDesc {
    RegionDesc {
        base: r.start,
        size: r.end - r.start,
        attributes,
    }
}

pub struct TestBox {
    pub config: &'static BoxConfig,
    pub index: &'static BoxIndex,
    pub stack: Range<usize>,
    pub data: Range<usize>,
    next: Cell<usize>,
}

impl TestBox {
    /// Moves `value` into the box's data region.
    pub fn place<T>(&self, value: T) -> &'static T {
        let align = std::mem::align_of::<T>();
        let at = (self.next.get() + align - 1) & !(align - 1);
        let end = at + std::mem::size_of::<T>();
        assert!(end <= self.data.end, "box data region full");
        self.next.set(end);
        // Safety: the region is leaked, aligned above, and never handed out
        // twice.
        unsafe {
            std::ptr::write(at as *mut T, value);
            &*(at as *const T)
        }
    }

    pub fn runtime(&self) -> Runtime<'static, StdClock> {
        Runtime::new(self.index, StdClock(Instant::now()))
    }
}

pub struct World {
    pub monitor: Monitor<FakePlatform>,
    pub boxes: Vec<TestBox>,
    pub flash: &'static Flash,
}

impl World {
    pub fn of(&self, id: BoxId) -> &TestBox {
        &self.boxes[id.index()]
    }

    pub fn rpc_gateway(&self, i: usize) -> &'static RpcGateway {
        &self.flash.rpc[i]
    }

    pub fn secure_gateway(&self, i: usize) -> usize {
        &self.flash.secure[i] as *const SecureGateway as usize
    }
}

/// Writes an exception frame into box memory at `sp`.
pub fn write_frame(sp: usize, words: [u32; 8]) {
    for (i, w) in words.into_iter().enumerate() {
        // Safety: tests only pass addresses inside leaked box stacks.
        unsafe { std::ptr::write_volatile((sp + i * 4) as *mut u32, w) };
    }
}

pub fn word(addr: usize) -> u32 {
    // Safety: as for `write_frame`.
    unsafe { std::ptr::read_volatile(addr as *const u32) }
}
