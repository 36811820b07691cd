// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote procedure calls.
//!
//! A call is a message in the caller's outgoing pool naming a gateway. The
//! monitor copies it into the callee's incoming pool, where a thread running
//! [`Runtime::serve`] picks it up, runs the function and queues the result.
//! The monitor then copies the result back and wakes the caller.
//!
//! Every call is identified by a [`Cookie`] combining its slot with a counter,
//! so a result can't be confused with one for an earlier use of the slot.

use abi::{
    BoxId, Cookie, RpcError, RpcGateway, RpcMessageState, RpcTarget, Slot,
    Timeout, MAX_CALL_ARGS,
};
use kerncore::rpc::{FnGroup, RpcMessage};
use kerncore::{Clock, PoolError};
use zerocopy::FromBytes;

use crate::{Runtime, Trace};
use ringbuf::ringbuf_entry_root;

impl<C: Clock> Runtime<'_, C> {
    /// Calls the function behind `gateway` and waits for its result.
    ///
    /// This can't fail: it waits as long as it takes for a free slot and
    /// then for the result.
    pub fn send_sync(
        &self,
        args: [u32; MAX_CALL_ARGS],
        gateway: &'static RpcGateway,
    ) -> u32 {
        let cookie = loop {
            if let Ok(c) = self.send(args, gateway, Timeout::Forever) {
                break c;
            }
            self.clock.relax();
        };
        loop {
            if let Ok(result) = self.wait(cookie, Timeout::Forever) {
                return result;
            }
            self.clock.relax();
        }
    }

    /// Queues a call to the function behind `gateway` without waiting.
    /// Collect the result with [`Runtime::wait`].
    pub fn send_async(
        &self,
        args: [u32; MAX_CALL_ARGS],
        gateway: &'static RpcGateway,
    ) -> Result<Cookie, RpcError> {
        self.send(args, gateway, Timeout::Ms(0))
    }

    fn send(
        &self,
        args: [u32; MAX_CALL_ARGS],
        gateway: &'static RpcGateway,
        timeout: Timeout,
    ) -> Result<Cookie, RpcError> {
        let rpc = self.index.rpc();
        let pool = rpc.outgoing();
        let slot = pool.allocate(timeout, &self.clock).map_err(|e| match e {
            PoolError::Timeout if timeout != Timeout::Ms(0) => {
                RpcError::Timeout
            }
            _ => RpcError::OutOfStructures,
        })?;
        let Some(msg) = pool.item(slot) else {
            return Err(RpcError::OutOfStructures);
        };

        let cookie = Cookie::build(rpc.next_counter(), slot);
        msg.set_args(args);
        msg.set_gateway(gateway as *const RpcGateway as usize);
        msg.set_result(0);
        msg.semaphore().reset();
        msg.set_match_cookie(cookie);
        msg.set_wait_cookie(cookie);
        msg.set_state(RpcMessageState::ReadyToSend);

        if rpc.outgoing_queue().enqueue(slot).is_err() {
            msg.set_state(RpcMessageState::Idle);
            if let Err(e) = pool.free(slot) {
                ringbuf_entry_root!(Trace::FreeFailed(slot, e));
            }
            return Err(RpcError::OutOfStructures);
        }
        Ok(cookie)
    }

    /// Waits up to `timeout` for the result of the call behind `cookie`.
    ///
    /// Only one thread can wait on a cookie at a time, and a result can be
    /// collected only once. If the wait times out the cookie stays valid.
    pub fn wait(
        &self,
        cookie: Cookie,
        timeout: Timeout,
    ) -> Result<u32, RpcError> {
        let pool = self.index.rpc().outgoing();
        let msg = pool.item(cookie.slot()).ok_or(RpcError::InvalidCookie)?;
        if !msg.claim_wait_cookie(cookie) {
            return Err(RpcError::InvalidCookie);
        }

        if msg.semaphore().pend(timeout, &self.clock).is_err() {
            msg.set_wait_cookie(cookie);
            return Err(RpcError::Timeout);
        }

        let result = msg.result();
        msg.set_state(RpcMessageState::Idle);
        pool.free(cookie.slot())
            .map_err(|_| RpcError::InvalidCookie)?;
        Ok(result)
    }

    /// Serves one call to any function in `fns`, waiting up to `timeout` for
    /// one to arrive. Returns the id of the calling box.
    ///
    /// Threads serving the same list (by address) share a wakeup; pass the
    /// same `static` everywhere a set is served.
    pub fn serve(
        &self,
        fns: &'static [RpcTarget],
        timeout: Timeout,
    ) -> Result<BoxId, RpcError> {
        let group = self.fn_group(fns)?;
        let deadline = match timeout {
            Timeout::Ms(ms) => {
                Some(self.clock.now_ms().saturating_add(ms.into()))
            }
            Timeout::Forever => None,
        };
        loop {
            if let Some(caller) = self.serve_one(fns) {
                // Take the wakeup posted for this call, if there was one, so
                // the next serve doesn't wake up to an empty queue.
                group.semaphore().try_pend();
                return Ok(caller);
            }
            // A wakeup can outlive its call (another thread of the group
            // served it), so one that finds nothing just means pend again.
            let left = match deadline {
                Some(d) => {
                    let ms = d.saturating_sub(self.clock.now_ms());
                    Timeout::Ms(u32::try_from(ms).unwrap_or(u32::MAX))
                }
                None => Timeout::Forever,
            };
            group
                .semaphore()
                .pend(left, &self.clock)
                .map_err(|_| RpcError::Timeout)?;
        }
    }

    /// Finds the group for `fns`, registering it the first time.
    fn fn_group(
        &self,
        fns: &'static [RpcTarget],
    ) -> Result<&FnGroup, RpcError> {
        let rpc = self.index.rpc();
        let queue = rpc.fn_group_queue();
        let pool = rpc.fn_groups();
        if let Ok(slot) = queue.find_first(|_, g| g.matches(fns)) {
            return pool.item(slot).ok_or(RpcError::OutOfStructures);
        }

        let slot = pool
            .allocate(Timeout::Ms(0), &self.clock)
            .map_err(|_| RpcError::OutOfStructures)?;
        let group = pool.item(slot).ok_or(RpcError::OutOfStructures)?;
        group.set(fns);
        group.semaphore().reset();
        if queue.enqueue(slot).is_err() {
            if let Err(e) = pool.free(slot) {
                ringbuf_entry_root!(Trace::FreeFailed(slot, e));
            }
            return Err(RpcError::OutOfStructures);
        }
        Ok(group)
    }

    /// Runs the oldest delivered call to a function in `fns`, if any.
    fn serve_one(&self, fns: &'static [RpcTarget]) -> Option<BoxId> {
        let rpc = self.index.rpc();
        let todo = rpc.todo();
        let served = |msg: &RpcMessage| {
            if msg.state() != Ok(RpcMessageState::Sent) {
                return None;
            }
            let target = gateway_target(msg.gateway())?;
            fns.iter().copied().find(|f| *f as usize == target)
        };

        let slot = todo.find_first(|_, m| served(m).is_some()).ok()?;
        todo.dequeue(slot).ok()?;
        let msg = rpc.incoming().item(slot)?;
        let Some(f) = served(msg) else {
            // Rewritten under us; give it back for someone else.
            if let Err(e) = todo.enqueue(slot) {
                ringbuf_entry_root!(Trace::RequeueFailed(slot, e));
            }
            return None;
        };

        let [a, b, c, d] = msg.args();
        msg.set_result(f(a, b, c, d));
        msg.set_state(RpcMessageState::Done);
        let caller = msg.other_box();
        self.finish(slot);
        Some(caller)
    }

    fn finish(&self, slot: Slot) {
        let rpc = self.index.rpc();
        if rpc.done().enqueue(slot).is_err() {
            // The monitor will never see this result; at least keep the slot.
            if let Err(e) = rpc.incoming().free(slot) {
                ringbuf_entry_root!(Trace::FreeFailed(slot, e));
            }
        }
    }
}

/// Exported function named by the gateway at `addr`. Only delivered calls are
/// looked at, and the monitor checked their gateways on the way in.
fn gateway_target(addr: usize) -> Option<usize> {
    if addr == 0 {
        return None;
    }
    // Safety: the monitor only delivers calls through gateways it found in
    // flash, which every box can read.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            addr as *const u8,
            core::mem::size_of::<RpcGateway>(),
        )
    };
    RpcGateway::read_from_bytes(bytes).ok().map(|gw| gw.target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{runtime, StdClock};
    use abi::BoxConfig;

    extern "C" fn add(a: u32, b: u32, c: u32, d: u32) -> u32 {
        a + b + c + d
    }

    static GATEWAY_CFG: BoxConfig = BoxConfig::new(2, 2, 2, 2);
    static FNS: [RpcTarget; 1] = [add];

    fn gateway() -> &'static RpcGateway {
        Box::leak(Box::new(RpcGateway::new(&GATEWAY_CFG, add, 0x100)))
    }

    #[test]
    fn send_async_queues_a_ready_message() {
        let rt = runtime(BoxConfig::new(2, 1, 1, 1));
        let gw = gateway();
        let cookie = rt.send_async([1, 2, 3, 4], gw).unwrap();

        let rpc = rt.index().rpc();
        assert_eq!(rpc.outgoing_queue().slots().as_slice(), &[cookie.slot()]);
        let msg = rpc.outgoing().item(cookie.slot()).unwrap();
        assert_eq!(msg.state(), Ok(RpcMessageState::ReadyToSend));
        assert_eq!(msg.args(), [1, 2, 3, 4]);
        assert_eq!(msg.gateway(), gw as *const RpcGateway as usize);
        assert_eq!(msg.match_cookie(), cookie);
    }

    #[test]
    fn cookies_differ_for_the_same_slot() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 1));
        let gw = gateway();
        let first = rt.send_async([0; 4], gw).unwrap();

        // Pretend the call completed, and collect it.
        let rpc = rt.index().rpc();
        rpc.outgoing_queue().dequeue(first.slot()).unwrap();
        let msg = rpc.outgoing().item(first.slot()).unwrap();
        msg.semaphore().post().unwrap();
        rt.wait(first, Timeout::Ms(0)).unwrap();

        let second = rt.send_async([0; 4], gw).unwrap();
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);
    }

    #[test]
    fn send_async_reports_exhaustion() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 1));
        let gw = gateway();
        rt.send_async([0; 4], gw).unwrap();
        assert_eq!(
            rt.send_async([0; 4], gw),
            Err(RpcError::OutOfStructures)
        );
    }

    #[test]
    fn wait_times_out_and_can_be_retried() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 1));
        let cookie = rt.send_async([0; 4], gateway()).unwrap();
        assert_eq!(rt.wait(cookie, Timeout::Ms(0)), Err(RpcError::Timeout));
        assert_eq!(rt.wait(cookie, Timeout::Ms(1)), Err(RpcError::Timeout));

        let rpc = rt.index().rpc();
        let msg = rpc.outgoing().item(cookie.slot()).unwrap();
        rpc.outgoing_queue().dequeue(cookie.slot()).unwrap();
        msg.set_result(99);
        msg.semaphore().post().unwrap();
        assert_eq!(rt.wait(cookie, Timeout::Ms(0)), Ok(99));
        assert_eq!(
            rt.wait(cookie, Timeout::Ms(0)),
            Err(RpcError::InvalidCookie)
        );
    }

    #[test]
    fn wait_rejects_forged_cookies() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 1));
        let cookie = rt.send_async([0; 4], gateway()).unwrap();
        let forged = Cookie(cookie.0 ^ 0x100);
        assert_eq!(
            rt.wait(forged, Timeout::Ms(0)),
            Err(RpcError::InvalidCookie)
        );
        assert_eq!(
            rt.wait(Cookie::INVALID, Timeout::Ms(0)),
            Err(RpcError::InvalidCookie)
        );
        assert_eq!(
            rt.wait(Cookie::build(0x100, Slot(7)), Timeout::Ms(0)),
            Err(RpcError::InvalidCookie)
        );
    }

    #[test]
    fn serve_runs_a_delivered_call() {
        let rt = runtime(BoxConfig::new(1, 2, 1, 1));
        let rpc = rt.index().rpc();

        // Deliver a call the way the monitor would.
        let slot = rpc.incoming().try_allocate().unwrap();
        let msg = rpc.incoming().item(slot).unwrap();
        msg.set_args([1, 2, 3, 36]);
        msg.set_gateway(gateway() as *const RpcGateway as usize);
        msg.set_other_box(BoxId(3));
        msg.set_state(RpcMessageState::Sent);
        rpc.todo().enqueue(slot).unwrap();

        assert_eq!(rt.serve(&FNS, Timeout::Ms(0)), Ok(BoxId(3)));
        assert_eq!(msg.state(), Ok(RpcMessageState::Done));
        assert_eq!(msg.result(), 42);
        assert_eq!(rpc.done().slots().as_slice(), &[slot]);
        assert!(rpc.todo().is_empty());
    }

    /// Queues a call to `add` on the todo queue and posts the group, the way
    /// the monitor would.
    fn deliver(rt: &Runtime<'_, StdClock>, args: [u32; 4]) -> Slot {
        let rpc = rt.index().rpc();
        let slot = rpc.incoming().try_allocate().unwrap();
        let msg = rpc.incoming().item(slot).unwrap();
        msg.set_args(args);
        msg.set_gateway(gateway() as *const RpcGateway as usize);
        msg.set_other_box(BoxId(3));
        msg.set_state(RpcMessageState::Sent);
        rpc.todo().enqueue(slot).unwrap();
        if let Ok(g) = rpc.fn_group_queue().find_first(|_, g| g.matches(&FNS))
        {
            let group = rpc.fn_groups().item(g).unwrap();
            group.semaphore().post().unwrap();
        }
        slot
    }

    #[test]
    fn serving_a_call_consumes_its_wakeup() {
        let rt = runtime(BoxConfig::new(1, 2, 1, 1));
        assert_eq!(rt.serve(&FNS, Timeout::Ms(0)), Err(RpcError::Timeout));
        let group = rt.fn_group(&FNS).unwrap();

        deliver(&rt, [1, 2, 3, 36]);
        assert_eq!(group.semaphore().count(), 1);
        assert_eq!(rt.serve(&FNS, Timeout::Ms(0)), Ok(BoxId(3)));
        assert_eq!(group.semaphore().count(), 0);
        assert_eq!(rt.serve(&FNS, Timeout::Ms(5)), Err(RpcError::Timeout));
    }

    #[test]
    fn serve_forever_outlasts_a_stale_wakeup() {
        let rt = runtime(BoxConfig::new(1, 2, 1, 1));
        assert_eq!(rt.serve(&FNS, Timeout::Ms(0)), Err(RpcError::Timeout));
        // A wakeup for a call some other thread of the group already served.
        rt.fn_group(&FNS).unwrap().semaphore().post().unwrap();

        std::thread::scope(|s| {
            let server = s.spawn(|| rt.serve(&FNS, Timeout::Forever));
            std::thread::sleep(std::time::Duration::from_millis(20));
            let slot = deliver(&rt, [1, 2, 3, 36]);
            assert_eq!(server.join().unwrap(), Ok(BoxId(3)));
            let msg = rt.index().rpc().incoming().item(slot).unwrap();
            assert_eq!(msg.result(), 42);
        });
    }

    #[test]
    fn serve_times_out_and_registers_its_group_once() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 1));
        assert_eq!(rt.serve(&FNS, Timeout::Ms(0)), Err(RpcError::Timeout));
        assert_eq!(rt.serve(&FNS, Timeout::Ms(1)), Err(RpcError::Timeout));
        let groups = rt.index().rpc().fn_group_queue().slots();
        assert_eq!(groups.len(), 1);

        // A different list needs a group of its own, and there's only one.
        static OTHER: [RpcTarget; 1] = [add];
        assert_eq!(
            rt.serve(&OTHER, Timeout::Ms(0)),
            Err(RpcError::OutOfStructures)
        );
    }
}
