// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPC records and the per-box channel that holds them.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use abi::{BoxConfig, BoxId, IpcDesc, IpcIoState, IPC_SLOTS};

use crate::pool::{PoolQueue, SlotInit, SlotPool};
use crate::token::Tokens;
use crate::Spinlock;

/// One queued send or receive. Both fields are addresses in the owning box.
#[derive(Debug)]
#[repr(C)]
pub struct IpcIo {
    desc: AtomicUsize,
    msg: AtomicUsize,
    state: AtomicU8,
}

impl SlotInit for IpcIo {
    const EMPTY: Self = Self {
        desc: AtomicUsize::new(0),
        msg: AtomicUsize::new(0),
        state: AtomicU8::new(IpcIoState::Idle as u8),
    };
}

impl IpcIo {
    pub fn prepare(&self, desc: &IpcDesc, msg: usize, state: IpcIoState) {
        self.desc
            .store(desc as *const IpcDesc as usize, Ordering::Release);
        self.msg.store(msg, Ordering::Release);
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn desc(&self) -> usize {
        self.desc.load(Ordering::Acquire)
    }

    pub fn msg(&self) -> usize {
        self.msg.load(Ordering::Acquire)
    }

    pub fn state(&self) -> Result<IpcIoState, u8> {
        IpcIoState::try_from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: IpcIoState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

pub type IoPool = SlotPool<IpcIo, IPC_SLOTS>;

#[repr(C)]
pub struct IpcChannel {
    tokens: Spinlock<Tokens>,
    send: IoPool,
    recv: IoPool,
}

impl IpcChannel {
    pub const fn new(config: &BoxConfig) -> Self {
        let n = config.ipc_slots as usize;
        Self {
            tokens: Spinlock::new(Tokens::new()),
            send: SlotPool::new(n, false),
            recv: SlotPool::new(n, false),
        }
    }

    pub fn tokens(&self) -> &Spinlock<Tokens> {
        &self.tokens
    }

    pub fn send(&self) -> &IoPool {
        &self.send
    }

    pub fn recv(&self) -> &IoPool {
        &self.recv
    }

    pub fn send_queue(&self) -> PoolQueue<'_, IpcIo, IPC_SLOTS, 1> {
        self.send.queue(0)
    }

    pub fn recv_queue(&self) -> PoolQueue<'_, IpcIo, IPC_SLOTS, 1> {
        self.recv.queue(0)
    }
}

/// Decides whether a queued receive accepts a message from `sender`
/// described by `send`.
pub fn recv_matches(
    sender: BoxId,
    send: &IpcDesc,
    recv_state: Result<IpcIoState, u8>,
    recv: &IpcDesc,
) -> bool {
    let filter = recv.box_id();
    recv_state == Ok(IpcIoState::ReadyToRecv)
        && (filter == sender || filter == BoxId::ANY)
        && recv.port() == send.port()
        && send.len() <= recv.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    const READY: Result<IpcIoState, u8> = Ok(IpcIoState::ReadyToRecv);

    #[test]
    fn wildcard_and_exact_senders_match() {
        let send = IpcDesc::new(BoxId(1), 7, 16);
        let from = |id, len| IpcDesc::new(id, 7, len);
        assert!(recv_matches(BoxId(2), &send, READY, &from(BoxId::ANY, 16)));
        assert!(recv_matches(BoxId(2), &send, READY, &from(BoxId(2), 32)));
        assert!(!recv_matches(BoxId(2), &send, READY, &from(BoxId(3), 16)));
    }

    #[test]
    fn port_length_and_state_must_agree() {
        let send = IpcDesc::new(BoxId(1), 7, 16);
        let any = |port, len| IpcDesc::new(BoxId::ANY, port, len);
        assert!(!recv_matches(BoxId(2), &send, READY, &any(8, 16)));
        assert!(!recv_matches(BoxId(2), &send, READY, &any(7, 15)));
        assert!(!recv_matches(
            BoxId(2),
            &send,
            Ok(IpcIoState::ReadyToSend),
            &any(7, 16)
        ));
        assert!(!recv_matches(BoxId(2), &send, Err(9), &any(7, 16)));
    }

    #[test]
    fn io_records_what_it_was_given() {
        let desc = IpcDesc::new(BoxId(1), 7, 16);
        let io = IpcIo::EMPTY;
        assert_eq!(io.state(), Ok(IpcIoState::Idle));
        io.prepare(&desc, 0x2000_0000, IpcIoState::ReadyToSend);
        assert_eq!(io.desc(), &desc as *const IpcDesc as usize);
        assert_eq!(io.msg(), 0x2000_0000);
        assert_eq!(io.state(), Ok(IpcIoState::ReadyToSend));
    }
}
