// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security monitor core.
//!
//! This is the privileged part of the system: it owns the context-switch
//! state machine, and it moves RPC calls, RPC results and IPC messages
//! between boxes that cannot see each other's memory.
//!
//! The code outside of the `arch` module is portable. On the host, `arch`
//! resolves to a fake platform, which is how the whole monitor gets tested
//! with `cargo test`.
//!
//! # Design principles
//!
//! 1. Static configuration. The number of boxes, and the capacity of every
//!    pool, is fixed before the first switch.
//! 2. Nothing a box writes is trusted. Records are read out of box memory
//!    after the monitor has checked that the box could have written them.
//! 3. A box that breaks the protocol only loses its own messages. The
//!    monitor dies only when its own state is inconsistent.

#![cfg_attr(target_os = "none", no_std)]

pub mod arch;
pub mod context;
pub mod fail;
pub mod monitor;
pub mod secure_gateway;

pub use context::{Context, CurrentState, PreviousState};
pub use monitor::{BoxDesc, MemoryMap, Monitor, Violation};
pub use secure_gateway::GatewayFault;
