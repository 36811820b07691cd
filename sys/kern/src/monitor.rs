// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The drain loop: moving calls and messages between boxes.
//!
//! Boxes never write into each other. A box that wants to talk to another
//! queues a record in its own memory, and every time the monitor is entered
//! (thread switch, interrupt return, idle) it *drains* those queues: it
//! checks each record against what the sending box is allowed to touch, and
//! copies it into the structures of the receiving box.
//!
//! Everything a box hands over is treated as hostile. Addresses are checked
//! against the box's region table before they're dereferenced, slot indices
//! are range checked by the pools, and anything malformed is dropped and
//! recorded as a [`Violation`]. A misbehaving box can lose its own messages
//! but not corrupt anyone else's.
//!
//! # Locking
//!
//! The first touch of any box's pool in an operation uses a `try_` variant:
//! if the box was interrupted while holding the lock, the monitor backs off
//! and comes back on the next drain. Once a `try_` operation has succeeded,
//! follow-up operations on the same pool use the spinning variants; the box
//! cannot run again until the drain returns, so the lock stays available.

use core::mem::{align_of, size_of};
use core::ops::Range;

use abi::{
    BoxConfig, BoxId, Cookie, IpcDesc, IpcIoState, RegionAttributes,
    RegionDesc, RpcGateway, RpcMessageState, Slot, SlotState, SwitchKind,
    IPC_SLOTS, MAX_BOXES,
};
use kerncore::ipc::{recv_matches, IpcIo};
use kerncore::rpc::{FnGroup, RpcMessage};
use kerncore::{can_access, BoxIndex, PoolError, PoolQueue, Span};
use zerocopy::FromBytes;

use crate::arch::Platform;
use crate::context::{Context, CurrentState};
use crate::fail;

/// Fixed parts of the address space the monitor checks gateways against.
#[derive(Clone, Debug)]
pub struct MemoryMap {
    /// Where gateway records may live.
    pub flash: Range<usize>,
    /// Code that every box may branch to: exported functions and calling
    /// stubs.
    pub public_code: Range<usize>,
}

impl MemoryMap {
    pub(crate) fn in_flash(&self, addr: usize, len: usize) -> bool {
        addr.checked_add(len).is_some_and(|end| {
            self.flash.start <= addr && end <= self.flash.end
        })
    }

    pub(crate) fn is_public_code(&self, addr: usize) -> bool {
        // Thumb function pointers have bit 0 set.
        self.public_code.contains(&(addr & !1))
    }
}

/// Boot-time description of a box.
#[derive(Copy, Clone)]
pub struct BoxDesc {
    pub config: &'static BoxConfig,
    /// Communication structures. Placed by the build in memory the box owns.
    pub index: &'static BoxIndex,
    /// Initial stack pointer.
    pub stack_top: usize,
    /// What the box may access, sorted by base address.
    pub regions: &'static [RegionDesc],
}

/// Ways a box can break the communication protocol. Each one costs the box
/// the operation involved, and nothing else.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Violation {
    /// A queue operation failed in a way a well-behaved box can't cause.
    Queue(PoolError),
    /// A record was queued in a state that doesn't allow it.
    BadState(u8),
    /// An RPC gateway address that doesn't hold a valid gateway.
    BadGateway(usize),
    /// A record names a box that doesn't exist.
    UnknownBox(u8),
    /// A record points at memory the box can't access.
    BadAddress(usize),
    /// A returned result doesn't match the call waiting for it.
    CookieMismatch(Cookie),
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    CallDelivered { from: BoxId, to: BoxId, slot: u8 },
    CallBackpressure { from: BoxId, to: BoxId },
    ResultReturned { from: BoxId, to: BoxId, cookie: Cookie },
    IpcDelivered { from: BoxId, to: BoxId, port: u32 },
    Violation(BoxId, Violation),
}

ringbuf::ringbuf!(Trace, 64, Trace::None);

// Gateway records are laid down in flash as whole words.
static_assertions::const_assert_eq!(size_of::<RpcGateway>() % 4, 0);

/// What became of a record taken off an outgoing queue.
enum Outcome {
    Delivered,
    /// Can't be delivered right now; goes back on the queue.
    Retry,
    /// Dropped for good.
    Dropped(Violation),
}

pub struct Monitor<P> {
    context: Context<P>,
    boxes: heapless::Vec<BoxDesc, MAX_BOXES>,
    map: MemoryMap,
    /// Code a secure gateway callee returns into.
    return_thunk: usize,
    violations: u32,
}

impl<P: Platform> Monitor<P> {
    /// Sets up the monitor for `boxes`, box 0 first.
    ///
    /// Bad box configuration is a build problem, not something to recover
    /// from, so this dies on it.
    pub fn new(
        platform: P,
        map: MemoryMap,
        return_thunk: usize,
        boxes: &[BoxDesc],
    ) -> Self {
        let mut context = Context::new(platform);
        let mut table = heapless::Vec::new();
        for desc in boxes {
            if !desc.config.is_valid() {
                fail::die("box configuration is invalid");
            }
            if !desc.regions.windows(2).all(|w| w[0].base <= w[1].base) {
                fail::die("box regions are not sorted");
            }
            let rw = RegionAttributes::READ | RegionAttributes::WRITE;
            let index_ok = Span::of(desc.index as *const BoxIndex)
                .is_some_and(|s| can_access(s, desc.regions, |r| plain(r, rw)));
            if !index_ok {
                fail::die("box index is outside box memory");
            }

            let base = desc.regions.first().map_or(0, |r| r.base);
            let end = desc.regions.iter().map(|r| r.end_addr()).max();
            let state = CurrentState {
                sp: desc.stack_top,
                base,
                size: end.unwrap_or(base) - base,
            };
            context.add_box(state, Some(desc.index));
            if table.push(*desc).is_err() {
                fail::die("too many boxes");
            }
        }
        Self {
            context,
            boxes: table,
            map,
            return_thunk,
            violations: 0,
        }
    }

    pub fn context(&self) -> &Context<P> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context<P> {
        &mut self.context
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    pub(crate) fn return_thunk(&self) -> usize {
        self.return_thunk
    }

    /// Number of protocol violations seen since boot.
    pub fn violations(&self) -> u32 {
        self.violations
    }

    fn desc(&self, id: BoxId) -> &BoxDesc {
        match self.boxes.get(id.index()) {
            Some(d) => d,
            None => fail::die("drain of unknown box"),
        }
    }

    /// Finds the box whose configuration record lives at `config`.
    pub(crate) fn box_by_config(&self, config: usize) -> Option<BoxId> {
        self.boxes
            .iter()
            .position(|d| d.config as *const BoxConfig as usize == config)
            .map(|i| BoxId(i as u8))
    }

    fn violation(&mut self, id: BoxId, v: Violation) {
        self.violations = self.violations.wrapping_add(1);
        ringbuf::ringbuf_entry!(Trace::Violation(id, v));
        if cfg!(feature = "paranoid") {
            panic!("box {} violated protocol: {v:?}", id.0);
        }
    }

    /// Checks that box `id` can access all of `addr..addr + len` with at
    /// least the rights in `attrs`. Device memory never qualifies.
    pub fn range_is_accessible(
        &self,
        id: BoxId,
        addr: usize,
        len: usize,
        attrs: RegionAttributes,
    ) -> bool {
        let Some(desc) = self.boxes.get(id.index()) else {
            return false;
        };
        Span::new(addr, len)
            .is_some_and(|s| can_access(s, desc.regions, |r| plain(r, attrs)))
    }

    /// Returns the `T` at `addr`, if box `id` can access all of it with
    /// `attrs` and it's suitably aligned.
    fn object<T>(
        &self,
        id: BoxId,
        addr: usize,
        attrs: RegionAttributes,
    ) -> Option<&'static T> {
        let ok = addr != 0
            && addr % align_of::<T>() == 0
            && self.range_is_accessible(id, addr, size_of::<T>(), attrs);
        // Safety: the box can access every byte of it and it's aligned. The
        // only `T` looked up this way is `IpcDesc`, which is all atomics, so
        // any bit pattern the box left there is a valid one.
        ok.then(|| unsafe { &*(addr as *const T) })
    }

    /// Copies a `T` out of flash. Records in flash are built in, but the
    /// address comes from a box, so the whole record has to be in range.
    pub(crate) fn flash_record<T: FromBytes>(&self, addr: usize) -> Option<T> {
        if !self.map.in_flash(addr, size_of::<T>()) {
            return None;
        }
        // Safety: the monitor can read all of flash.
        let bytes = unsafe {
            core::slice::from_raw_parts(addr as *const u8, size_of::<T>())
        };
        T::read_from_bytes(bytes).ok()
    }

    /// Drains everything box `id` has queued.
    pub fn drain(&mut self, id: BoxId) {
        self.drain_message_queue(id);
        self.drain_result_queue(id);
        self.drain_ipc(id);
    }

    pub fn drain_all(&mut self) {
        for i in 0..self.boxes.len() {
            self.drain(BoxId(i as u8));
        }
    }

    /// Switches to the thread `next` on behalf of the scheduler, draining the
    /// box being left first.
    pub fn thread_switch(&mut self, next: BoxId, next_sp: usize) {
        let kind = match self.context.active() {
            Some(current) => {
                self.drain(current);
                SwitchKind::UnboundThread
            }
            None => SwitchKind::UnboundFirst,
        };
        self.context.switch_in(kind, next, 0, next_sp);
        self.context.platform_mut().set_process_sp(next_sp);
    }

    /// Takes records off a queue one at a time until it's empty or busy, or
    /// until the first record put back comes around again.
    ///
    /// Only a record that went back on the queue can end a pass: delivered
    /// and dropped records are gone, so waiting to see one again would never
    /// end.
    fn drain_queue(
        &mut self,
        id: BoxId,
        dequeue: impl Fn() -> Result<Slot, PoolError>,
        mut handle: impl FnMut(&mut Self, Slot) -> Outcome,
        put_back: impl Fn(Slot) -> Result<(), PoolError>,
    ) {
        let mut first_retry = None;
        loop {
            let slot = match dequeue() {
                Ok(s) => s,
                Err(PoolError::Empty | PoolError::Busy) => return,
                Err(e) => {
                    self.violation(id, Violation::Queue(e));
                    return;
                }
            };

            if first_retry == Some(slot) {
                // Everything left has been tried once this pass.
                if let Err(e) = put_back(slot) {
                    self.violation(id, Violation::Queue(e));
                }
                return;
            }

            match handle(self, slot) {
                Outcome::Delivered => (),
                Outcome::Retry => {
                    if let Err(e) = put_back(slot) {
                        self.violation(id, Violation::Queue(e));
                        return;
                    }
                    first_retry.get_or_insert(slot);
                }
                Outcome::Dropped(v) => self.violation(id, v),
            }
        }
    }

    /// Delivers the RPC calls queued by box `src`.
    pub fn drain_message_queue(&mut self, src: BoxId) {
        let index = self.desc(src).index;
        let queue = index.rpc().outgoing_queue();
        self.drain_queue(
            src,
            || queue.try_dequeue_first(),
            |m, slot| m.deliver_call(src, slot),
            |slot| queue.enqueue(slot),
        );
    }

    /// Reads and checks the gateway a call goes through, returning the
    /// destination box and the target function.
    fn check_gateway(
        &self,
        addr: usize,
    ) -> Result<(BoxId, usize), Violation> {
        let bad = Violation::BadGateway(addr);
        let gw: RpcGateway = self.flash_record(addr).ok_or(bad)?;
        if gw.ldr_pc != RpcGateway::LDR_PC
            || gw.magic != abi::RPC_GATEWAY_MAGIC
            || !self.map.is_public_code(gw.target)
            || !self.map.is_public_code(gw.caller)
        {
            return Err(bad);
        }
        let dst = self.box_by_config(gw.box_ptr).ok_or(bad)?;
        Ok((dst, gw.target))
    }

    fn deliver_call(&mut self, src: BoxId, slot: Slot) -> Outcome {
        let caller = self.desc(src).index.rpc();
        let Some(msg) = caller.outgoing().item(slot) else {
            return Outcome::Dropped(Violation::Queue(PoolError::OutOfRange));
        };
        match msg.state() {
            Ok(RpcMessageState::ReadyToSend) => (),
            Ok(s) => return Outcome::Dropped(Violation::BadState(s as u8)),
            Err(raw) => return Outcome::Dropped(Violation::BadState(raw)),
        }
        let (dst, target) = match self.check_gateway(msg.gateway()) {
            Ok(found) => found,
            Err(v) => return Outcome::Dropped(v),
        };

        let callee = self.desc(dst).index.rpc();
        let incoming = match callee.incoming().try_allocate() {
            Ok(s) => s,
            Err(PoolError::Exhausted | PoolError::Busy) => {
                ringbuf::ringbuf_entry!(Trace::CallBackpressure {
                    from: src,
                    to: dst
                });
                return Outcome::Retry;
            }
            Err(e) => return Outcome::Dropped(Violation::Queue(e)),
        };
        let Some(copy) = callee.incoming().item(incoming) else {
            return Outcome::Dropped(Violation::Queue(PoolError::Corrupt));
        };

        copy.set_args(msg.args());
        copy.set_gateway(msg.gateway());
        copy.set_match_cookie(msg.match_cookie());
        copy.set_wait_cookie(Cookie::INVALID);
        copy.set_other_box(src);
        copy.set_result(0);
        copy.set_state(RpcMessageState::Sent);
        msg.set_other_box(dst);
        msg.set_state(RpcMessageState::Sent);

        if let Err(e) = callee.todo().enqueue(incoming) {
            // Nothing we can do for the caller: its message is already
            // marked sent. Don't leak the callee's slot too.
            if let Err(e) = callee.incoming().free(incoming) {
                self.violation(dst, Violation::Queue(e));
            }
            return Outcome::Dropped(Violation::Queue(e));
        }
        ringbuf::ringbuf_entry!(Trace::CallDelivered {
            from: src,
            to: dst,
            slot: incoming.0
        });

        self.wake_fn_group(dst, target);
        Outcome::Delivered
    }

    /// Posts the semaphore of the first function group in box `dst` that
    /// serves `target`. If nobody is serving it yet, whoever starts will find
    /// the call by scanning.
    fn wake_fn_group(&self, dst: BoxId, target: usize) {
        let groups = self.desc(dst).index.rpc().fn_group_queue();
        let found = groups.try_find_first(|_, g| self.serves(dst, g, target));
        if let Ok(slot) = found {
            if let Some(group) = groups.pool().item(slot) {
                // Saturated means the group is already awake with more
                // calls than slots; one more post would add nothing.
                let _ = group.semaphore().post();
            }
        }
    }

    fn serves(&self, id: BoxId, group: &FnGroup, target: usize) -> bool {
        let (ptr, count) = group.list();
        let Some(len) = count.checked_mul(size_of::<usize>()) else {
            return false;
        };
        let readable = ptr % align_of::<usize>() == 0
            && (self.map.in_flash(ptr, len)
                || self.range_is_accessible(
                    id,
                    ptr,
                    len,
                    RegionAttributes::READ,
                ));
        if !readable {
            return false;
        }
        // Safety: checked above.
        let list =
            unsafe { core::slice::from_raw_parts(ptr as *const usize, count) };
        list.contains(&target)
    }

    /// Returns the results box `callee` has finished with to their callers.
    pub fn drain_result_queue(&mut self, callee: BoxId) {
        let rpc = self.desc(callee).index.rpc();
        let done = rpc.done();
        loop {
            let slot = match done.try_dequeue_first() {
                Ok(s) => s,
                Err(PoolError::Empty | PoolError::Busy) => return,
                Err(e) => {
                    self.violation(callee, Violation::Queue(e));
                    return;
                }
            };
            let Some(msg) = rpc.incoming().item(slot) else {
                // The pool handed out a slot it doesn't have a record for.
                self.violation(callee, Violation::Queue(PoolError::Corrupt));
                if let Err(e) = rpc.incoming().free(slot) {
                    self.violation(callee, Violation::Queue(e));
                }
                continue;
            };

            match self.return_result(callee, msg) {
                Outcome::Retry => {
                    // The caller's pool is busy; keep the result for later.
                    if let Err(e) = done.enqueue(slot) {
                        self.violation(callee, Violation::Queue(e));
                    }
                    return;
                }
                Outcome::Dropped(v) => self.violation(callee, v),
                Outcome::Delivered => (),
            }

            msg.set_state(RpcMessageState::Idle);
            if let Err(e) = rpc.incoming().free(slot) {
                self.violation(callee, Violation::Queue(e));
            }
        }
    }

    fn return_result(&mut self, callee: BoxId, msg: &RpcMessage) -> Outcome {
        let caller = msg.other_box();
        let Some(desc) = self.boxes.get(caller.index()) else {
            return Outcome::Dropped(Violation::UnknownBox(caller.0));
        };
        let outgoing = desc.index.rpc().outgoing();
        let cookie = msg.match_cookie();
        match outgoing.try_state(cookie.slot()) {
            Ok(SlotState::Dequeued) => (),
            Err(PoolError::Busy) => return Outcome::Retry,
            Ok(_) | Err(_) => {
                return Outcome::Dropped(Violation::CookieMismatch(cookie))
            }
        }
        let Some(call) = outgoing.item(cookie.slot()) else {
            return Outcome::Dropped(Violation::CookieMismatch(cookie));
        };
        if call.state() != Ok(RpcMessageState::Sent)
            || call.other_box() != callee
            || call.match_cookie() != cookie
        {
            return Outcome::Dropped(Violation::CookieMismatch(cookie));
        }

        call.set_result(msg.result());
        call.set_state(RpcMessageState::Done);
        if call.semaphore().post().is_err() {
            fail::die("RPC result semaphore overflow");
        }
        ringbuf::ringbuf_entry!(Trace::ResultReturned {
            from: callee,
            to: caller,
            cookie
        });
        Outcome::Delivered
    }

    /// Puts a receive taken off `dst`'s queue back where it was.
    fn requeue_recv(
        &mut self,
        dst: BoxId,
        queue: &PoolQueue<'_, IpcIo, IPC_SLOTS, 1>,
        slot: Slot,
    ) {
        if let Err(e) = queue.enqueue(slot) {
            self.violation(dst, Violation::Queue(e));
        }
    }

    /// Delivers the IPC sends queued by box `src` to matching receives.
    pub fn drain_ipc(&mut self, src: BoxId) {
        let ipc = self.desc(src).index.ipc();
        let queue = ipc.send_queue();
        self.drain_queue(
            src,
            || queue.try_dequeue_first(),
            |m, slot| m.deliver_io(src, slot),
            |slot| queue.enqueue(slot),
        );
    }

    /// Checks an IO record's descriptor and buffer, returning the
    /// descriptor. The buffer must allow `buf_attrs`.
    fn check_io(
        &self,
        id: BoxId,
        io: &IpcIo,
        buf_attrs: RegionAttributes,
    ) -> Result<&'static IpcDesc, Violation> {
        // Receive descriptors are written back, send descriptors only read.
        let desc_attrs = RegionAttributes::READ | buf_attrs;
        let desc: &IpcDesc = self
            .object(id, io.desc(), desc_attrs)
            .ok_or(Violation::BadAddress(io.desc()))?;
        if !self.range_is_accessible(id, io.msg(), desc.len(), buf_attrs) {
            return Err(Violation::BadAddress(io.msg()));
        }
        Ok(desc)
    }

    fn deliver_io(&mut self, src: BoxId, slot: Slot) -> Outcome {
        let send_ipc = self.desc(src).index.ipc();
        let Some(send_io) = send_ipc.send().item(slot) else {
            return Outcome::Dropped(Violation::Queue(PoolError::OutOfRange));
        };
        let send_desc =
            match self.check_io(src, send_io, RegionAttributes::READ) {
                Ok(d) => d,
                Err(v) => return Outcome::Dropped(v),
            };
        match send_io.state() {
            Ok(IpcIoState::ReadyToSend) => (),
            _ => return Outcome::Retry,
        }

        let dst = send_desc.box_id();
        let Some(dst_desc) = self.boxes.get(dst.index()) else {
            return Outcome::Dropped(Violation::UnknownBox(dst.0));
        };
        let recv_ipc = dst_desc.index.ipc();
        let recv_queue = recv_ipc.recv_queue();

        // The predicate runs under the receiver's pool lock, so it only
        // reads descriptors it has checked.
        let found = recv_queue.try_find_first(|_, io| {
            self.check_io(dst, io, RegionAttributes::WRITE)
                .is_ok_and(|d| recv_matches(src, send_desc, io.state(), d))
        });
        let Ok(recv_slot) = found else {
            return Outcome::Retry;
        };
        if recv_queue.dequeue(recv_slot).is_err() {
            return Outcome::Retry;
        }
        let Some(recv_io) = recv_ipc.recv().item(recv_slot) else {
            return Outcome::Retry;
        };
        // Re-read: the receiving box can rewrite its records at any time.
        let checked = self.check_io(dst, recv_io, RegionAttributes::WRITE);
        let recv_desc = match checked {
            Ok(d) if recv_matches(src, send_desc, recv_io.state(), d) => d,
            _ => {
                self.requeue_recv(dst, &recv_queue, recv_slot);
                return Outcome::Retry;
            }
        };

        let len = send_desc.len();
        {
            // Both token locks are held across the copy, so a box never sees
            // a completed token for a half-copied message.
            let Some(mut send_tokens) = send_ipc.tokens().try_lock() else {
                self.requeue_recv(dst, &recv_queue, recv_slot);
                return Outcome::Retry;
            };
            let same_box = core::ptr::eq(send_ipc, recv_ipc);
            let mut recv_tokens = None;
            if !same_box {
                match recv_ipc.tokens().try_lock() {
                    Some(t) => recv_tokens = Some(t),
                    None => {
                        drop(send_tokens);
                        self.requeue_recv(dst, &recv_queue, recv_slot);
                        return Outcome::Retry;
                    }
                }
            }

            // Safety: both ranges were checked against their owners' regions,
            // and `copy` tolerates overlap.
            unsafe {
                core::ptr::copy(
                    send_io.msg() as *const u8,
                    recv_io.msg() as *mut u8,
                    len,
                );
            }
            send_tokens.complete(send_desc.token());
            recv_desc.set_box_id(src);
            recv_desc.set_len(len);
            match recv_tokens.as_mut() {
                Some(t) => t.complete(recv_desc.token()),
                None => send_tokens.complete(recv_desc.token()),
            }
        }
        ringbuf::ringbuf_entry!(Trace::IpcDelivered {
            from: src,
            to: dst,
            port: send_desc.port()
        });

        send_io.set_state(IpcIoState::Idle);
        recv_io.set_state(IpcIoState::Idle);
        if let Err(e) = send_ipc.send().free(slot) {
            self.violation(src, Violation::Queue(e));
        }
        if let Err(e) = recv_ipc.recv().free(recv_slot) {
            self.violation(dst, Violation::Queue(e));
        }
        Outcome::Delivered
    }
}

/// Region filter for buffers the monitor reads or writes on a box's behalf.
fn plain(region: &RegionDesc, attrs: RegionAttributes) -> bool {
    region.attributes.contains(attrs)
        && !region.attributes.contains(RegionAttributes::DEVICE)
}
