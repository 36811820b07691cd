// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monitor ABI definitions, shared between the monitor and box code.
//!
//! Everything in here describes memory that is looked at from both sides of
//! the privilege boundary: the box writes it with its own rights, and the
//! monitor reads it back (after checking where it lives) with its own. As a
//! result, every record is `#[repr(C)]`, and anything that both sides may
//! touch concurrently is made of atomics.

#![no_std]

use core::mem::offset_of;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum number of boxes a monitor can be configured with, including the
/// public box 0.
pub const MAX_BOXES: usize = 8;

/// Depth of the previous-state stack. Nested box initialization, interrupts
/// and gateways all share it.
pub const CONTEXT_MAX_DEPTH: usize = 16;

/// Build-time maximum slot counts. A box may configure fewer at runtime, see
/// [`BoxConfig`].
pub const RPC_OUTGOING_SLOTS: usize = 8;
pub const RPC_INCOMING_SLOTS: usize = 8;
pub const RPC_FN_GROUP_SLOTS: usize = 8;
pub const IPC_SLOTS: usize = 8;

/// Number of argument registers that can cross a gateway.
pub const MAX_CALL_ARGS: usize = 4;

/// Magic number at the start of a [`BoxConfig`], to reassure the monitor that
/// it is not reading uninitialized Flash.
pub const BOX_CONFIG_MAGIC: u32 = 0xB0C5_C0F6;

/// Magic number carried by every [`RpcGateway`].
pub const RPC_GATEWAY_MAGIC: u32 = 0xC0DE_2B0C;

/// Magic number carried by every [`SecureGateway`].
pub const SECURE_GATEWAY_MAGIC: u32 = 0x5EC6_A7E0;

static_assertions::const_assert!(MAX_BOXES < BoxId::ANY.0 as usize);
static_assertions::const_assert!(RPC_OUTGOING_SLOTS < Slot::INVALID.0 as usize);
static_assertions::const_assert!(RPC_INCOMING_SLOTS < Slot::INVALID.0 as usize);
static_assertions::const_assert!(RPC_FN_GROUP_SLOTS < Slot::INVALID.0 as usize);
static_assertions::const_assert!(IPC_SLOTS < Slot::INVALID.0 as usize);

/// Names a box.
///
/// Box 0 is the public box, which owns the unpartitioned parts of the
/// application. It can make calls, but it cannot be the target of a secure
/// gateway.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BoxId(pub u8);

impl BoxId {
    pub const PUBLIC: Self = Self(0);

    /// Wildcard accepted in IPC receive descriptors.
    pub const ANY: Self = Self(0xFF);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Index of a record in a slot pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Slot(pub u8);

impl Slot {
    pub const INVALID: Self = Self(0xFF);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Management state of a pool slot. Every slot is in exactly one of these.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SlotState {
    /// On the free list.
    Free,
    /// Allocated and owned by whoever allocated it, not linked anywhere.
    Dequeued,
    /// Linked into one of the pool's queues.
    Queued,
}

/// Completion handle for an asynchronous RPC.
///
/// The low 8 bits carry the outgoing slot; the remaining bits come from a
/// per-box counter advanced for every message, so that a cookie for a reused
/// slot never matches an older one. Zero is never handed out.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Cookie(pub u32);

impl Cookie {
    pub const INVALID: Self = Self(0);

    /// Amount the per-box counter advances by for each message.
    pub const COUNTER_INCREMENT: u32 = 1 << 8;

    pub fn build(counter: u32, slot: Slot) -> Self {
        Self((counter & !0xFF) | u32::from(slot.0))
    }

    pub fn slot(self) -> Slot {
        Slot(self.0 as u8)
    }

    pub fn counter(self) -> u32 {
        self.0 & !0xFF
    }
}

/// Lifecycle of an RPC message.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RpcMessageState {
    Idle = 0,
    ReadyToSend = 1,
    Sent = 2,
    Done = 3,
}

/// We're using an explicit `TryFrom` impl instead of `FromPrimitive` because
/// the message state is read back out of an atomic in box memory.
impl TryFrom<u8> for RpcMessageState {
    type Error = u8;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Idle),
            1 => Ok(Self::ReadyToSend),
            2 => Ok(Self::Sent),
            3 => Ok(Self::Done),
            _ => Err(x),
        }
    }
}

/// State of an IPC IO record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum IpcIoState {
    Idle = 0,
    ReadyToSend = 1,
    ReadyToRecv = 2,
}

impl TryFrom<u8> for IpcIoState {
    type Error = u8;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Idle),
            1 => Ok(Self::ReadyToSend),
            2 => Ok(Self::ReadyToRecv),
            _ => Err(x),
        }
    }
}

/// Reason for a context switch.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SwitchKind {
    /// Call through a secure gateway.
    Gateway,
    /// Delivery of an interrupt to the box that owns it.
    Isr,
    /// Call into the debug box.
    Debug,
    /// Resume a box's own thread of execution, on behalf of the scheduler.
    UnboundThread,
    /// The very first switch after boot, when no box is active yet.
    UnboundFirst,
}

impl SwitchKind {
    /// Bound switches are tied to a function call and are undone by a
    /// matching switch-out. Unbound switches are never undone.
    pub fn is_bound(self) -> bool {
        matches!(self, Self::Gateway | Self::Isr | Self::Debug)
    }
}

/// How long a blocking operation may wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Timeout {
    /// Wait at most this many milliseconds. `Ms(0)` is a single attempt.
    Ms(u32),
    Forever,
}

/// Token bitmap. Each outstanding IPC operation owns one bit.
pub type TokenSet = u32;

/// Returned when all 32 tokens are taken.
pub const INVALID_TOKEN: TokenSet = 0;

/// Per-box build-time configuration, stored in Flash next to the box image.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BoxConfig {
    pub magic: u32,
    pub rpc_outgoing_slots: u8,
    pub rpc_incoming_slots: u8,
    pub rpc_fn_groups: u8,
    pub ipc_slots: u8,
}

impl BoxConfig {
    pub const fn new(
        rpc_outgoing_slots: u8,
        rpc_incoming_slots: u8,
        rpc_fn_groups: u8,
        ipc_slots: u8,
    ) -> Self {
        Self {
            magic: BOX_CONFIG_MAGIC,
            rpc_outgoing_slots,
            rpc_incoming_slots,
            rpc_fn_groups,
            ipc_slots,
        }
    }

    /// Checks the magic and that every capacity is nonzero and fits the
    /// build-time maximum.
    pub fn is_valid(&self) -> bool {
        fn fits(n: u8, max: usize) -> bool {
            n != 0 && usize::from(n) <= max
        }
        self.magic == BOX_CONFIG_MAGIC
            && fits(self.rpc_outgoing_slots, RPC_OUTGOING_SLOTS)
            && fits(self.rpc_incoming_slots, RPC_INCOMING_SLOTS)
            && fits(self.rpc_fn_groups, RPC_FN_GROUP_SLOTS)
            && fits(self.ipc_slots, IPC_SLOTS)
    }
}

/// Signature of a function exported through an RPC gateway.
pub type RpcTarget = extern "C" fn(u32, u32, u32, u32) -> u32;

/// RPC gateway record.
///
/// Gateways are emitted into Flash by the build, one per exported function
/// per call site. The first word is a `ldr pc, [pc, #imm]` that jumps to
/// `caller`, so a gateway is also a valid branch target; the monitor only
/// ever verifies the record, it never trusts one it has not checked.
///
/// All address fields are plain integers so that an arbitrary bit pattern is
/// a valid (if wrong) gateway.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct RpcGateway {
    pub ldr_pc: u32,
    pub magic: u32,
    /// Address of the destination box's [`BoxConfig`].
    pub box_ptr: usize,
    /// Address of the exported function, an [`RpcTarget`].
    pub target: usize,
    /// Address of the calling stub that `ldr_pc` branches to.
    pub caller: usize,
}

impl RpcGateway {
    /// `ldr pc, [pc, #(offset_of(caller) - 4)]`, Thumb-2 encoding with the
    /// halfwords in memory order.
    pub const LDR_PC: u32 =
        0xF000_F8DF | (((offset_of!(RpcGateway, caller) - 4) as u32) << 16);

    pub fn new(
        config: &'static BoxConfig,
        target: RpcTarget,
        caller: usize,
    ) -> Self {
        Self {
            ldr_pc: Self::LDR_PC,
            magic: RPC_GATEWAY_MAGIC,
            box_ptr: config as *const BoxConfig as usize,
            target: target as usize,
            caller,
        }
    }
}

#[cfg(target_pointer_width = "32")]
static_assertions::const_assert_eq!(RpcGateway::LDR_PC, 0xF00C_F8DF);

/// Register-level gateway, entered with an `svc` rather than through the
/// message queues.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct SecureGateway {
    /// `svc` opcode; the low bits carry the argument count.
    pub svc_opcode: u16,
    /// Branch over the record, never executed by the monitor.
    pub branch: u16,
    pub magic: u32,
    pub dst_fn: usize,
    /// Address of the destination box's [`BoxConfig`].
    pub dst_box_cfg_ptr: usize,
}

impl SecureGateway {
    /// `svc` opcode with the secure gateway id and no argument count.
    pub const SVC_OPCODE: u16 = 0xDF80;
    pub const SVC_NARGS_MASK: u16 = 0x0007;
    /// Thumb `b` over the rest of the record.
    pub const BRANCH: u16 = 0xE004;

    pub fn new(config: &'static BoxConfig, dst_fn: usize, nargs: u8) -> Self {
        Self {
            svc_opcode: Self::SVC_OPCODE
                | (u16::from(nargs) & Self::SVC_NARGS_MASK),
            branch: Self::BRANCH,
            magic: SECURE_GATEWAY_MAGIC,
            dst_fn,
            dst_box_cfg_ptr: config as *const BoxConfig as usize,
        }
    }

    pub fn nargs(&self) -> usize {
        usize::from(self.svc_opcode & Self::SVC_NARGS_MASK)
    }

    pub fn has_valid_opcode(&self) -> bool {
        self.svc_opcode & !Self::SVC_NARGS_MASK == Self::SVC_OPCODE
    }
}

/// Hardware exception frame, as stacked on exception entry.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

impl ExceptionFrame {
    pub const WORDS: usize = core::mem::size_of::<Self>() / 4;
    pub const BYTES: usize = core::mem::size_of::<Self>();

    /// Stacked xPSR bit recording that the hardware inserted an alignment
    /// word above the frame.
    pub const XPSR_ALIGN_SHIFT: u32 = 9;

    /// Word offsets of the fields the monitor writes individually.
    pub const R12_WORD: usize = offset_of!(ExceptionFrame, r12) / 4;
    pub const LR_WORD: usize = offset_of!(ExceptionFrame, lr) / 4;
    pub const PC_WORD: usize = offset_of!(ExceptionFrame, pc) / 4;
    pub const XPSR_WORD: usize = offset_of!(ExceptionFrame, xpsr) / 4;
}

static_assertions::const_assert_eq!(ExceptionFrame::WORDS, 8);

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read by the box that includes it.
        const READ = 1 << 0;
        /// Region can be written by the box that includes it.
        const WRITE = 1 << 1;
        /// Region can contain executable code.
        const EXECUTE = 1 << 2;
        /// Region contains memory mapped registers; the monitor will not
        /// copy messages in or out of it.
        const DEVICE = 1 << 3;
    }
}

/// Description of one memory region a box is allowed to touch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionDesc {
    pub base: usize,
    pub size: usize,
    pub attributes: RegionAttributes,
}

impl RegionDesc {
    pub fn end_addr(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end_addr()
    }
}

/// A record describing a fault taken by a box.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// The box has violated memory access rules, either while running or in
    /// something it asked the monitor to read on its behalf.
    MemoryAccess {
        address: Option<usize>,
        source: FaultSource,
    },
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the monitor to do something bad on its behalf.
    Monitor,
}

/// Errors returned to RPC callers and servers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum RpcError {
    /// No free slot, or no room to register another function group.
    OutOfStructures = -1,
    Timeout = -2,
    /// The cookie was never issued, is being waited on by someone else, or
    /// its result has already been consumed.
    InvalidCookie = -3,
}

impl From<RpcError> for i32 {
    fn from(e: RpcError) -> Self {
        e as i32
    }
}

impl TryFrom<i32> for RpcError {
    type Error = i32;

    fn try_from(x: i32) -> Result<Self, Self::Error> {
        match x {
            -1 => Ok(Self::OutOfStructures),
            -2 => Ok(Self::Timeout),
            -3 => Ok(Self::InvalidCookie),
            _ => Err(x),
        }
    }
}

/// Errors returned by the box-side IPC calls.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum IpcError {
    /// No token or no slot left.
    OutOfStructures = -1,
    Timeout = -2,
    /// Waiting on a token that is not allocated, or a descriptor that does
    /// not fit its buffer.
    InvalidParameters = -4,
}

impl From<IpcError> for i32 {
    fn from(e: IpcError) -> Self {
        e as i32
    }
}

impl TryFrom<i32> for IpcError {
    type Error = i32;

    fn try_from(x: i32) -> Result<Self, Self::Error> {
        match x {
            -1 => Ok(Self::OutOfStructures),
            -2 => Ok(Self::Timeout),
            -4 => Ok(Self::InvalidParameters),
            _ => Err(x),
        }
    }
}

/// IPC descriptor.
///
/// The box fills in `box_id`, `port` and `len` before sending or receiving.
/// `token` is written when the operation is queued. On a completed receive
/// the monitor overwrites `box_id` with the sender and `len` with the number
/// of bytes delivered.
#[derive(Debug)]
#[repr(C)]
pub struct IpcDesc {
    box_id: AtomicU8,
    port: AtomicU32,
    len: AtomicUsize,
    token: AtomicU32,
}

impl IpcDesc {
    pub const fn new(box_id: BoxId, port: u32, len: usize) -> Self {
        Self {
            box_id: AtomicU8::new(box_id.0),
            port: AtomicU32::new(port),
            len: AtomicUsize::new(len),
            token: AtomicU32::new(INVALID_TOKEN),
        }
    }

    pub fn box_id(&self) -> BoxId {
        BoxId(self.box_id.load(Ordering::Acquire))
    }

    pub fn set_box_id(&self, id: BoxId) {
        self.box_id.store(id.0, Ordering::Release);
    }

    pub fn port(&self) -> u32 {
        self.port.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_len(&self, len: usize) {
        self.len.store(len, Ordering::Release);
    }

    pub fn token(&self) -> TokenSet {
        self.token.load(Ordering::Acquire)
    }

    pub fn set_token(&self, token: TokenSet) {
        self.token.store(token, Ordering::Release);
    }
}
