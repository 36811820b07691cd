// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous message passing.
//!
//! Sends and receives are queued with a descriptor naming the peer box and a
//! port, and return a token: one bit of a per-box bitmap. The monitor pairs
//! each send with the first matching receive, copies the payload, and sets
//! the tokens of both sides. A box collects completed tokens with the
//! `wait_*` and `poll_*` calls.
//!
//! Buffers and descriptors are read and written by the monitor long after
//! the call that queued them returns, which is why they must be `'static`.

use core::cell::UnsafeCell;

use abi::{IpcDesc, IpcError, IpcIoState, Timeout, TokenSet, INVALID_TOKEN};
use kerncore::token::WaitFor;
use kerncore::Clock;

use crate::{Runtime, Trace};
use ringbuf::ringbuf_entry_root;

/// Memory a receive can be delivered into.
#[repr(C)]
pub struct IpcBuffer<const N: usize>(UnsafeCell<[u8; N]>);

// Safety: the contents are only ever copied in and out as bytes, and
// `read` is documented as racing with an outstanding receive.
unsafe impl<const N: usize> Sync for IpcBuffer<N> {}

impl<const N: usize> IpcBuffer<N> {
    pub const fn new() -> Self {
        Self(UnsafeCell::new([0; N]))
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn addr(&self) -> usize {
        self.0.get() as usize
    }

    /// Copies the first `dst.len()` bytes (at most `N`) out of the buffer.
    ///
    /// Call this after the receive's token completes; before that, the
    /// monitor may be writing to it.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(N);
        let src = self.0.get() as *const u8;
        for (i, d) in dst[..n].iter_mut().enumerate() {
            // Safety: in bounds, and volatile since the monitor writes
            // behind the compiler's back.
            *d = unsafe { core::ptr::read_volatile(src.add(i)) };
        }
        n
    }
}

impl<const N: usize> Default for IpcBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Runtime<'_, C> {
    /// Queues `msg` for delivery to the box and port named by `desc`.
    /// `desc.len()` bytes are sent.
    pub fn ipc_send(
        &self,
        desc: &'static IpcDesc,
        msg: &'static [u8],
    ) -> Result<TokenSet, IpcError> {
        self.queue_io(desc, msg.as_ptr() as usize, msg.len(), true)
    }

    /// Queues a receive of up to `desc.len()` bytes into `buf`, from the box
    /// named by `desc` (or any box, with [`abi::BoxId::ANY`]).
    ///
    /// When the token completes, the monitor has rewritten `desc` with the
    /// sender's id and the length received.
    pub fn ipc_recv<const N: usize>(
        &self,
        desc: &'static IpcDesc,
        buf: &'static IpcBuffer<N>,
    ) -> Result<TokenSet, IpcError> {
        self.queue_io(desc, buf.addr(), N, false)
    }

    fn queue_io(
        &self,
        desc: &'static IpcDesc,
        addr: usize,
        capacity: usize,
        send: bool,
    ) -> Result<TokenSet, IpcError> {
        if desc.len() > capacity {
            return Err(IpcError::InvalidParameters);
        }
        let ipc = self.index.ipc();
        let token = ipc.tokens().lock().allocate();
        if token == INVALID_TOKEN {
            return Err(IpcError::OutOfStructures);
        }

        let (queue, state) = if send {
            (ipc.send_queue(), IpcIoState::ReadyToSend)
        } else {
            (ipc.recv_queue(), IpcIoState::ReadyToRecv)
        };
        let pool = queue.pool();
        let queued = pool
            .allocate(Timeout::Ms(0), &self.clock)
            .ok()
            .and_then(|slot| {
                let io = pool.item(slot)?;
                desc.set_token(token);
                io.prepare(desc, addr, state);
                if queue.enqueue(slot).is_err() {
                    io.set_state(IpcIoState::Idle);
                    if let Err(e) = pool.free(slot) {
                        ringbuf_entry_root!(Trace::FreeFailed(slot, e));
                    }
                    return None;
                }
                Some(())
            });
        if queued.is_none() {
            ipc.tokens().lock().release(token);
            return Err(IpcError::OutOfStructures);
        }
        Ok(token)
    }

    /// Collects whichever of `tokens` have completed, as soon as at least one
    /// has. An empty set is satisfied immediately.
    pub fn ipc_wait_any(
        &self,
        tokens: TokenSet,
        timeout: Timeout,
    ) -> Result<TokenSet, IpcError> {
        self.ipc_wait(tokens, WaitFor::Any, timeout)
    }

    /// Collects `tokens` once all of them have completed.
    pub fn ipc_wait_all(
        &self,
        tokens: TokenSet,
        timeout: Timeout,
    ) -> Result<TokenSet, IpcError> {
        self.ipc_wait(tokens, WaitFor::All, timeout)
    }

    pub fn ipc_poll_any(
        &self,
        tokens: TokenSet,
    ) -> Result<Option<TokenSet>, IpcError> {
        self.index.ipc().tokens().lock().poll(tokens, WaitFor::Any)
    }

    pub fn ipc_poll_all(
        &self,
        tokens: TokenSet,
    ) -> Result<Option<TokenSet>, IpcError> {
        self.index.ipc().tokens().lock().poll(tokens, WaitFor::All)
    }

    /// Polls until the wait is satisfied. `Timeout::Ms(0)` makes a single
    /// attempt; any other timeout waits until it's satisfied, with no
    /// deadline.
    fn ipc_wait(
        &self,
        tokens: TokenSet,
        how: WaitFor,
        timeout: Timeout,
    ) -> Result<TokenSet, IpcError> {
        loop {
            // The lock is only held for one step, so the monitor can deliver
            // between polls.
            let step = self.index.ipc().tokens().lock().poll(tokens, how)?;
            if let Some(done) = step {
                return Ok(done);
            }
            if timeout == Timeout::Ms(0) {
                return Err(IpcError::Timeout);
            }
            self.clock.relax();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::runtime;
    use abi::{BoxConfig, BoxId};

    fn desc(box_id: BoxId, port: u32, len: usize) -> &'static IpcDesc {
        Box::leak(Box::new(IpcDesc::new(box_id, port, len)))
    }

    fn buffer<const N: usize>() -> &'static IpcBuffer<N> {
        Box::leak(Box::new(IpcBuffer::new()))
    }

    #[test]
    fn send_and_recv_take_distinct_tokens() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 4));
        let d = desc(BoxId(2), 7, 4);
        let t0 = rt.ipc_send(d, b"ping").unwrap();
        let r = desc(BoxId::ANY, 7, 16);
        let t1 = rt.ipc_recv(r, buffer::<16>()).unwrap();
        assert_eq!((t0, t1), (1, 2));
        assert_eq!(d.token(), 1);
        assert_eq!(r.token(), 2);

        let ipc = rt.index().ipc();
        let slots = ipc.send_queue().slots();
        let io = ipc.send().item(slots[0]).unwrap();
        assert_eq!(io.state(), Ok(IpcIoState::ReadyToSend));
        assert_eq!(io.desc(), d as *const IpcDesc as usize);
        assert_eq!(ipc.recv_queue().slots().len(), 1);
    }

    #[test]
    fn descriptor_must_fit_its_buffer() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 4));
        assert_eq!(
            rt.ipc_send(desc(BoxId(1), 0, 5), b"four"),
            Err(IpcError::InvalidParameters)
        );
        assert_eq!(
            rt.ipc_recv(desc(BoxId(1), 0, 9), buffer::<8>()),
            Err(IpcError::InvalidParameters)
        );
        assert_eq!(rt.index().ipc().tokens().lock().allocated(), 0);
    }

    #[test]
    fn slot_exhaustion_gives_the_token_back() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 1));
        rt.ipc_send(desc(BoxId(1), 0, 1), b"a").unwrap();
        assert_eq!(
            rt.ipc_send(desc(BoxId(1), 0, 1), b"b"),
            Err(IpcError::OutOfStructures)
        );
        assert_eq!(rt.index().ipc().tokens().lock().allocated(), 1);
    }

    #[test]
    fn waits_collect_completed_tokens_once() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 4));
        let a = rt.ipc_send(desc(BoxId(1), 0, 1), b"a").unwrap();
        let b = rt.ipc_send(desc(BoxId(1), 0, 1), b"b").unwrap();

        assert_eq!(rt.ipc_poll_any(a | b), Ok(None));
        assert_eq!(
            rt.ipc_wait_any(a | b, Timeout::Ms(0)),
            Err(IpcError::Timeout)
        );

        rt.index().ipc().tokens().lock().complete(b);
        assert_eq!(
            rt.ipc_wait_all(a | b, Timeout::Ms(0)),
            Err(IpcError::Timeout)
        );
        assert_eq!(rt.ipc_wait_any(a | b, Timeout::Ms(0)), Ok(b));
        assert_eq!(
            rt.ipc_wait_any(b, Timeout::Ms(0)),
            Err(IpcError::InvalidParameters)
        );
        assert_eq!(rt.ipc_wait_any(0, Timeout::Ms(0)), Ok(0));
    }

    #[test]
    fn nonzero_timeout_polls_until_completion() {
        let rt = runtime(BoxConfig::new(1, 1, 1, 4));
        let t = rt.ipc_send(desc(BoxId(1), 0, 1), b"a").unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| rt.ipc_wait_any(t, Timeout::Ms(1)));
            // Well past the 1ms a deadline would have allowed.
            std::thread::sleep(std::time::Duration::from_millis(30));
            assert!(!waiter.is_finished());
            rt.index().ipc().tokens().lock().complete(t);
            assert_eq!(waiter.join().unwrap(), Ok(t));
        });
    }

    #[test]
    fn buffer_reads_are_bounded() {
        let buf = IpcBuffer::<4>::new();
        let mut out = [0xAAu8; 8];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(out, [0, 0, 0, 0, 0xAA, 0xAA, 0xAA, 0xAA]);
        assert_eq!(buf.capacity(), 4);
    }
}
