// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RPC records and the per-box channel that holds them.
//!
//! A call travels as an [`RpcMessage`]. The caller fills one in its outgoing
//! pool and queues it. The monitor copies it into a slot of the callee's
//! incoming pool and queues that on the callee's *todo* queue. When the
//! callee has run the target it moves its slot to the *done* queue, and the
//! monitor copies the result back into the caller's slot, which has stayed
//! allocated (but unqueued) the whole time.

use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use abi::{
    BoxConfig, BoxId, Cookie, RpcMessageState, RpcTarget, MAX_CALL_ARGS,
    RPC_FN_GROUP_SLOTS, RPC_INCOMING_SLOTS, RPC_OUTGOING_SLOTS,
};

use crate::pool::{PoolQueue, SlotInit, SlotPool};
use crate::sema::Semaphore;

#[derive(Debug)]
#[repr(C)]
pub struct RpcMessage {
    args: [AtomicU32; MAX_CALL_ARGS],
    /// Address of the [`abi::RpcGateway`] the call goes through.
    gateway: AtomicUsize,
    /// Cookie a waiter may still claim. Claimed cookies read as invalid.
    wait_cookie: AtomicU32,
    /// Cookie linking a callee's copy back to the caller's slot.
    match_cookie: AtomicU32,
    state: AtomicU8,
    /// Callee, in the caller's copy; caller, in the callee's copy.
    other_box: AtomicU8,
    result: AtomicU32,
    semaphore: Semaphore,
}

impl SlotInit for RpcMessage {
    const EMPTY: Self = Self {
        args: [const { AtomicU32::new(0) }; MAX_CALL_ARGS],
        gateway: AtomicUsize::new(0),
        wait_cookie: AtomicU32::new(Cookie::INVALID.0),
        match_cookie: AtomicU32::new(Cookie::INVALID.0),
        state: AtomicU8::new(RpcMessageState::Idle as u8),
        other_box: AtomicU8::new(0),
        result: AtomicU32::new(0),
        semaphore: Semaphore::new(0, 1),
    };
}

impl RpcMessage {
    pub fn args(&self) -> [u32; MAX_CALL_ARGS] {
        core::array::from_fn(|i| self.args[i].load(Ordering::Acquire))
    }

    pub fn set_args(&self, args: [u32; MAX_CALL_ARGS]) {
        for (a, v) in self.args.iter().zip(args) {
            a.store(v, Ordering::Release);
        }
    }

    pub fn gateway(&self) -> usize {
        self.gateway.load(Ordering::Acquire)
    }

    pub fn set_gateway(&self, gateway: usize) {
        self.gateway.store(gateway, Ordering::Release);
    }

    pub fn wait_cookie(&self) -> Cookie {
        Cookie(self.wait_cookie.load(Ordering::Acquire))
    }

    pub fn set_wait_cookie(&self, cookie: Cookie) {
        self.wait_cookie.store(cookie.0, Ordering::Release);
    }

    /// Claims the right to wait on `cookie`. Only one claim can succeed.
    pub fn claim_wait_cookie(&self, cookie: Cookie) -> bool {
        cookie != Cookie::INVALID
            && self
                .wait_cookie
                .compare_exchange(
                    cookie.0,
                    Cookie::INVALID.0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    pub fn match_cookie(&self) -> Cookie {
        Cookie(self.match_cookie.load(Ordering::Acquire))
    }

    pub fn set_match_cookie(&self, cookie: Cookie) {
        self.match_cookie.store(cookie.0, Ordering::Release);
    }

    /// Current state, or the raw byte if it doesn't decode.
    pub fn state(&self) -> Result<RpcMessageState, u8> {
        RpcMessageState::try_from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: RpcMessageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn other_box(&self) -> BoxId {
        BoxId(self.other_box.load(Ordering::Acquire))
    }

    pub fn set_other_box(&self, id: BoxId) {
        self.other_box.store(id.0, Ordering::Release);
    }

    pub fn result(&self) -> u32 {
        self.result.load(Ordering::Acquire)
    }

    pub fn set_result(&self, result: u32) {
        self.result.store(result, Ordering::Release);
    }

    /// Posted by the monitor when the result has arrived.
    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }
}

/// A set of exported functions some thread of the box is serving.
#[derive(Debug)]
#[repr(C)]
pub struct FnGroup {
    fn_ptr: AtomicUsize,
    fn_count: AtomicUsize,
    semaphore: Semaphore,
}

impl SlotInit for FnGroup {
    const EMPTY: Self = Self {
        fn_ptr: AtomicUsize::new(0),
        fn_count: AtomicUsize::new(0),
        semaphore: Semaphore::new(0, RPC_INCOMING_SLOTS as u32),
    };
}

impl FnGroup {
    pub fn set(&self, list: &'static [RpcTarget]) {
        self.fn_ptr.store(list.as_ptr() as usize, Ordering::Release);
        self.fn_count.store(list.len(), Ordering::Release);
    }

    /// Groups are identified by the address and length of their list, not
    /// its contents.
    pub fn matches(&self, list: &[RpcTarget]) -> bool {
        self.list() == (list.as_ptr() as usize, list.len())
    }

    /// Address and length of the function list, as stored by the box.
    pub fn list(&self) -> (usize, usize) {
        (
            self.fn_ptr.load(Ordering::Acquire),
            self.fn_count.load(Ordering::Acquire),
        )
    }

    /// Posted by the monitor for each call delivered to the group.
    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }
}

/// Queue of the incoming pool holding calls waiting to be served.
pub const TODO: usize = 0;
/// Queue of the incoming pool holding served calls waiting for collection.
pub const DONE: usize = 1;

pub type OutgoingPool = SlotPool<RpcMessage, RPC_OUTGOING_SLOTS>;
pub type IncomingPool = SlotPool<RpcMessage, RPC_INCOMING_SLOTS, 2>;
pub type FnGroupPool = SlotPool<FnGroup, RPC_FN_GROUP_SLOTS>;

#[repr(C)]
pub struct RpcChannel {
    counter: AtomicU32,
    outgoing: OutgoingPool,
    incoming: IncomingPool,
    fn_groups: FnGroupPool,
}

impl RpcChannel {
    pub const fn new(config: &BoxConfig) -> Self {
        Self {
            counter: AtomicU32::new(0),
            outgoing: SlotPool::new(
                config.rpc_outgoing_slots as usize,
                true,
            ),
            incoming: SlotPool::new(
                config.rpc_incoming_slots as usize,
                false,
            ),
            fn_groups: SlotPool::new(config.rpc_fn_groups as usize, false),
        }
    }

    pub fn outgoing(&self) -> &OutgoingPool {
        &self.outgoing
    }

    /// Calls waiting to leave the box.
    pub fn outgoing_queue(
        &self,
    ) -> PoolQueue<'_, RpcMessage, RPC_OUTGOING_SLOTS, 1> {
        self.outgoing.queue(0)
    }

    pub fn incoming(&self) -> &IncomingPool {
        &self.incoming
    }

    pub fn todo(&self) -> PoolQueue<'_, RpcMessage, RPC_INCOMING_SLOTS, 2> {
        self.incoming.queue(TODO)
    }

    pub fn done(&self) -> PoolQueue<'_, RpcMessage, RPC_INCOMING_SLOTS, 2> {
        self.incoming.queue(DONE)
    }

    pub fn fn_groups(&self) -> &FnGroupPool {
        &self.fn_groups
    }

    /// Groups that have been created, in creation order.
    pub fn fn_group_queue(
        &self,
    ) -> PoolQueue<'_, FnGroup, RPC_FN_GROUP_SLOTS, 1> {
        self.fn_groups.queue(0)
    }

    /// Advances the per-box counter and returns its new value, never zero.
    pub fn next_counter(&self) -> u32 {
        loop {
            let c = self
                .counter
                .fetch_add(Cookie::COUNTER_INCREMENT, Ordering::AcqRel)
                .wrapping_add(Cookie::COUNTER_INCREMENT);
            if c != 0 {
                return c;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::Slot;

    const CONFIG: BoxConfig = BoxConfig::new(4, 2, 3, 1);

    #[test]
    fn channel_uses_configured_capacities() {
        let ch = RpcChannel::new(&CONFIG);
        assert_eq!(ch.outgoing().capacity(), 4);
        assert!(ch.outgoing().is_blocking());
        assert_eq!(ch.incoming().capacity(), 2);
        assert!(!ch.incoming().is_blocking());
        assert_eq!(ch.fn_groups().capacity(), 3);
    }

    #[test]
    fn counter_skips_zero() {
        let ch = RpcChannel::new(&CONFIG);
        let last = 0u32.wrapping_sub(Cookie::COUNTER_INCREMENT);
        ch.counter.store(last, Ordering::Relaxed);
        assert_eq!(ch.next_counter(), Cookie::COUNTER_INCREMENT);
        assert_eq!(ch.next_counter(), 2 * Cookie::COUNTER_INCREMENT);
    }

    #[test]
    fn wait_cookie_can_be_claimed_once() {
        let msg = RpcMessage::EMPTY;
        let cookie = Cookie::build(Cookie::COUNTER_INCREMENT, Slot(1));
        msg.set_wait_cookie(cookie);
        assert!(!msg.claim_wait_cookie(Cookie(cookie.0 + 1)));
        assert!(msg.claim_wait_cookie(cookie));
        assert!(!msg.claim_wait_cookie(cookie));
        assert!(!msg.claim_wait_cookie(Cookie::INVALID));
    }

    #[test]
    fn message_fields_round_trip() {
        let msg = RpcMessage::EMPTY;
        assert_eq!(msg.state(), Ok(RpcMessageState::Idle));
        msg.set_args([1, 2, 3, 4]);
        msg.set_state(RpcMessageState::Sent);
        msg.set_other_box(BoxId(3));
        assert_eq!(msg.args(), [1, 2, 3, 4]);
        assert_eq!(msg.state(), Ok(RpcMessageState::Sent));
        assert_eq!(msg.other_box(), BoxId(3));
        msg.state.store(0x77, Ordering::Relaxed);
        assert_eq!(msg.state(), Err(0x77));
    }

    extern "C" fn zero(_: u32, _: u32, _: u32, _: u32) -> u32 {
        0
    }

    static SET_A: [RpcTarget; 1] = [zero];
    static SET_B: [RpcTarget; 1] = [zero];

    #[test]
    fn groups_match_by_identity() {
        let g = FnGroup::EMPTY;
        g.set(&SET_A);
        assert!(g.matches(&SET_A));
        assert!(!g.matches(&SET_B));
        assert!(!g.matches(&SET_A[..0]));
    }
}
