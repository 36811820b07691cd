// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-box index: everything the monitor needs to find in a box.

use core::sync::atomic::{AtomicU8, Ordering};

use abi::{BoxConfig, BoxId};

use crate::ipc::IpcChannel;
use crate::rpc::RpcChannel;

/// Root of a box's communication structures, placed in the box's own memory.
///
/// The monitor is given the address of each box's index at boot, and checks
/// once, then, that it lies in memory the box can read and write. The box can
/// rewrite any of it afterwards, so everything in here is atomics or plain
/// integers decoded on use: no bit pattern the box leaves behind is invalid.
#[repr(C)]
pub struct BoxIndex {
    /// Written by the monitor each time the box is switched in.
    box_id_self: AtomicU8,
    rpc: RpcChannel,
    ipc: IpcChannel,
}

impl BoxIndex {
    pub const fn new(config: &BoxConfig) -> Self {
        Self {
            box_id_self: AtomicU8::new(BoxId::PUBLIC.0),
            rpc: RpcChannel::new(config),
            ipc: IpcChannel::new(config),
        }
    }

    pub fn box_id_self(&self) -> BoxId {
        BoxId(self.box_id_self.load(Ordering::Acquire))
    }

    pub fn set_box_id_self(&self, id: BoxId) {
        self.box_id_self.store(id.0, Ordering::Release);
    }

    pub fn rpc(&self) -> &RpcChannel {
        &self.rpc
    }

    pub fn ipc(&self) -> &IpcChannel {
        &self.ipc
    }
}
