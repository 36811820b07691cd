// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Box-side support library.
//!
//! Code running in a box talks to other boxes by writing records into its
//! own [`BoxIndex`] and waiting for the monitor to move them. This crate
//! wraps that in calls that look like ordinary function calls and
//! message-passing primitives.
//!
//! All calls go through a [`Runtime`], which pairs the box's index with the
//! [`Clock`] used by blocking operations.

#![cfg_attr(not(test), no_std)]

pub use abi::*;
pub use kerncore::{BoxIndex, Clock};

pub mod ipc;
pub mod rpc;

pub use ipc::IpcBuffer;

/// Cleanup that failed on an error path. The caller already gets an error;
/// these only matter to whoever is debugging the box.
#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    FreeFailed(Slot, kerncore::PoolError),
    RequeueFailed(Slot, kerncore::PoolError),
}

ringbuf::ringbuf!(Trace, 16, Trace::None);

/// Handle on the communication structures of the running box.
pub struct Runtime<'a, C> {
    index: &'a BoxIndex,
    clock: C,
}

impl<'a, C: Clock> Runtime<'a, C> {
    pub fn new(index: &'a BoxIndex, clock: C) -> Self {
        Self { index, clock }
    }

    /// Id of the box the monitor last switched to through this index.
    pub fn box_id(&self) -> BoxId {
        self.index.box_id_self()
    }

    pub fn index(&self) -> &'a BoxIndex {
        self.index
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}
