// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! Semaphores are the only way one box wakes another: the monitor posts them
//! while draining queues, and box code pends on them. Pending is a poll loop
//! driven by a [`Clock`], so that the same code works on the target (where
//! `relax` can yield to the monitor) and in host tests.

use core::sync::atomic::{AtomicU32, Ordering};

use abi::Timeout;

/// Source of time, and of somewhere to spend it, for blocking operations.
pub trait Clock {
    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;

    /// Called between polls of a blocking operation.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SemaphoreError {
    Timeout,
    /// Posting would take the count past its maximum.
    Overflow,
}

#[derive(Debug)]
pub struct Semaphore {
    count: AtomicU32,
    max: u32,
}

impl Semaphore {
    pub const fn new(count: u32, max: u32) -> Self {
        Self {
            count: AtomicU32::new(count),
            max,
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Takes one unit if one is available. Never blocks.
    pub fn try_pend(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                c.checked_sub(1)
            })
            .is_ok()
    }

    /// Takes one unit, polling `clock` until one shows up or `timeout`
    /// expires. `Timeout::Ms(0)` makes exactly one attempt.
    pub fn pend(
        &self,
        timeout: Timeout,
        clock: &impl Clock,
    ) -> Result<(), SemaphoreError> {
        if self.try_pend() {
            return Ok(());
        }
        let deadline = match timeout {
            Timeout::Ms(0) => return Err(SemaphoreError::Timeout),
            Timeout::Ms(ms) => Some(clock.now_ms().saturating_add(ms.into())),
            Timeout::Forever => None,
        };
        loop {
            clock.relax();
            if self.try_pend() {
                return Ok(());
            }
            if deadline.is_some_and(|d| clock.now_ms() >= d) {
                return Err(SemaphoreError::Timeout);
            }
        }
    }

    pub fn post(&self) -> Result<(), SemaphoreError> {
        let max = self.max;
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < max).then_some(c + 1)
            })
            .map(drop)
            .map_err(|_| SemaphoreError::Overflow)
    }

    /// Discards any units left over from a previous user of the object.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }
}
