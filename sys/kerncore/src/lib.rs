// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and algorithms shared by the monitor and by box code.
//!
//! The records in here live in box memory. Box code manipulates them through
//! the methods defined here; the monitor reaches the same records after
//! checking (with [`can_access`]) that they lie inside the box that claims to
//! own them. Nothing in this crate knows which side of the privilege boundary
//! it is running on.

// Allow std-y things to be used in test. Beware: rust-analyzer builds with
// test set, so it won't complain about things that break no_std.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

use core::cmp::Ordering;

use abi::RegionDesc;

pub mod index;
pub mod ipc;
pub mod pool;
pub mod rpc;
pub mod sema;
pub mod token;

pub use index::BoxIndex;
pub use pool::{PoolError, PoolQueue, SlotInit, SlotPool};
pub use sema::{Clock, Semaphore, SemaphoreError};

/// Mutual exclusion usable from interrupt context. `try_lock` never spins.
///
/// Locks live in box memory, next to what they guard. A ticket lock's state
/// is two counters, so whatever a box writes there leaves it either free or
/// held, never invalid.
pub type Spinlock<T> = spin::mutex::TicketMutex<T>;
pub type SpinlockGuard<'a, T> = spin::mutex::TicketMutexGuard<'a, T>;

/// Describes types that act as "slices" (in the very abstract sense) handed
/// to the monitor by a box.
///
/// This is just a base-length pair --- taken by itself, it doesn't let you
/// actually _access_ the memory.
///
/// # Invariants
///
/// `s.is_empty()` implies `s.base_addr() == s.end_addr()`, and vice versa.
///
/// `s.base_addr() <= s.end_addr()` must hold.
pub trait UserSlice {
    /// Checks whether the slice spans zero bytes. Empty slices are opted out of
    /// access checking.
    fn is_empty(&self) -> bool;

    /// The address of the first byte included in this slice.
    fn base_addr(&self) -> usize;

    /// The address of the first byte _not_ included in this slice, past the
    /// end.
    fn end_addr(&self) -> usize;
}

impl<T: UserSlice> UserSlice for &T {
    #[inline(always)]
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Describes types that indicate region permissions.
///
/// # Invariants
///
/// `r.contains(x)` implies `r.base_addr() <= x < r.end_addr()` and vice versa.
pub trait MemoryRegion {
    fn contains(&self, addr: usize) -> bool;
    fn base_addr(&self) -> usize;
    fn end_addr(&self) -> usize;
}

impl<T: MemoryRegion> MemoryRegion for &T {
    #[inline(always)]
    fn contains(&self, addr: usize) -> bool {
        (**self).contains(addr)
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

impl MemoryRegion for RegionDesc {
    #[inline(always)]
    fn contains(&self, addr: usize) -> bool {
        RegionDesc::contains(self, addr)
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        self.base
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        RegionDesc::end_addr(self)
    }
}

/// An address range named by a box, usually a pointer it stored somewhere
/// plus the size of what it claims is there.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Span {
    base: usize,
    end: usize,
}

impl Span {
    /// Returns `None` if the range would wrap the address space.
    pub fn new(base: usize, len: usize) -> Option<Self> {
        let end = base.checked_add(len)?;
        Some(Self { base, end })
    }

    /// Span covering the object behind `ptr`.
    pub fn of<T>(ptr: *const T) -> Option<Self> {
        Self::new(ptr as usize, core::mem::size_of::<T>())
    }
}

impl UserSlice for Span {
    fn is_empty(&self) -> bool {
        self.base == self.end
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.end
    }
}

/// Compares a memory region to an address for use in binary-searching a region
/// table.
///
/// This returns the status of the region relative to the address, not vice
/// versa.
#[inline(always)]
fn region_compare(region: &impl MemoryRegion, addr: usize) -> Ordering {
    if addr < region.base_addr() {
        Ordering::Greater
    } else if addr >= region.end_addr() {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Determines whether a box can access some memory.
///
/// The memory is described by `slice` and consists of a single contiguous
/// range. The box's rights are described by `table`. Not all regions confer
/// the same rights, so `region_ok` decides which regions count.
///
/// # Preconditions
///
/// `table` must be sorted by region base address, and the regions in the table
/// must not overlap.
///
/// # Returns
///
/// `true` if `slice` is completely covered by one or more contiguous regions
/// in `table` that meet the `region_ok` condition, `false` otherwise.
#[must_use]
#[inline(always)]
pub fn can_access<S, R>(
    slice: S,
    table: &[R],
    region_ok: impl Fn(&R) -> bool,
) -> bool
where
    S: UserSlice,
    R: MemoryRegion,
{
    if slice.is_empty() {
        // Empty slices confer no authority, and a literal like `&[]` tends to
        // have a base address nobody owns.
        return true;
    }

    // The slice may span several regions, since region boundaries land in
    // unpredictable places, but the regions it spans must be contiguous.
    let mut scan_addr = slice.base_addr();
    let end_addr = slice.end_addr();

    let Ok(index) =
        table.binary_search_by(|reg| region_compare(reg, scan_addr))
    else {
        // No region contained the start address.
        return false;
    };

    let first_region = &table[index];
    if !region_ok(first_region) {
        return false;
    }
    scan_addr = first_region.end_addr();
    if scan_addr >= end_addr {
        return true;
    }

    for region in &table[index + 1..] {
        if !region.contains(scan_addr) || !region_ok(region) {
            // A hole, or a region we're not allowed to use.
            break;
        }
        if end_addr <= region.end_addr() {
            return true;
        }
        scan_addr = region.end_addr();
    }

    false
}
