// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The context-switch state machine.
//!
//! A context switch changes which box is *active*: whose memory the MPU
//! exposes, and whose stack the process stack pointer points into. Switches
//! come in two flavors.
//!
//! - **Bound** switches (gateways, interrupts, debug calls) are tied to a
//!   function call into the destination box. The state of the source box is
//!   pushed on a stack when the call starts and popped by a matching
//!   `switch_out` when it returns, so these nest.
//! - **Unbound** switches (thread switches, and the very first switch after
//!   boot) just move the active box. Nothing is recorded, nothing is undone,
//!   and the caller is responsible for the stack pointer.
//!
//! Gateway calls also need an exception frame in the destination box, so the
//! hardware "returns" into the target function. That is what the `*_frame`
//! operations are for.

use abi::{
    BoxId, ExceptionFrame, FaultInfo, SwitchKind, CONTEXT_MAX_DEPTH,
    MAX_BOXES, MAX_CALL_ARGS,
};
use kerncore::BoxIndex;

use crate::arch::Platform;
use crate::fail;

/// What the monitor knows about a box's stack and memory.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CurrentState {
    /// Saved stack pointer. Only meaningful while the box is not active.
    pub sp: usize,
    /// Start of the box's private memory.
    pub base: usize,
    pub size: usize,
}

/// A record on the previous-state stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PreviousState {
    pub src: BoxId,
    pub kind: SwitchKind,
    pub src_sp: usize,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    In(SwitchKind, BoxId, BoxId),
    Out(SwitchKind, BoxId, BoxId),
}

ringbuf::ringbuf!(Trace, 32, Trace::None);

pub struct Context<P> {
    platform: P,
    active: Option<BoxId>,
    current: [CurrentState; MAX_BOXES],
    indices: [Option<&'static BoxIndex>; MAX_BOXES],
    box_count: usize,
    previous: heapless::Vec<PreviousState, CONTEXT_MAX_DEPTH>,
}

impl<P: Platform> Context<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            active: None,
            current: [CurrentState::default(); MAX_BOXES],
            indices: [None; MAX_BOXES],
            box_count: 0,
            previous: heapless::Vec::new(),
        }
    }

    /// Registers the next box, whose id is returned. Box 0 must be
    /// registered first.
    pub fn add_box(
        &mut self,
        state: CurrentState,
        index: Option<&'static BoxIndex>,
    ) -> BoxId {
        let i = self.box_count;
        if i >= MAX_BOXES {
            fail::die("too many boxes");
        }
        self.current[i] = state;
        self.indices[i] = index;
        self.box_count += 1;
        BoxId(i as u8)
    }

    pub fn box_count(&self) -> usize {
        self.box_count
    }

    pub fn is_valid(&self, id: BoxId) -> bool {
        id.index() < self.box_count
    }

    pub fn active(&self) -> Option<BoxId> {
        self.active
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    fn slot(&self, id: BoxId) -> usize {
        if !self.is_valid(id) {
            fail::die(InvalidBox(id));
        }
        id.index()
    }

    pub fn box_state(&self, id: BoxId) -> CurrentState {
        self.current[self.slot(id)]
    }

    /// The record a `switch_out` would pop, if any.
    pub fn previous_state(&self) -> Option<&PreviousState> {
        self.previous.last()
    }

    fn push(&mut self, kind: SwitchKind, src: BoxId, src_sp: usize) {
        let state = PreviousState { src, kind, src_sp };
        if self.previous.push(state).is_err() {
            fail::die("context state stack overflow");
        }
        let i = self.slot(src);
        self.current[i].sp = src_sp;
    }

    fn pop(&mut self) -> PreviousState {
        match self.previous.pop() {
            Some(state) => state,
            None => fail::die("context state stack underflow"),
        }
    }

    fn activate(&mut self, src: BoxId, dst: BoxId) {
        self.active = Some(dst);
        if let Some(index) = self.indices[self.slot(dst)] {
            index.set_box_id_self(dst);
        }
        self.platform.domain_switch(src, dst);
    }

    /// Switches from the active box to `dst`.
    ///
    /// For bound kinds, `src_sp` is saved as the source box's stack pointer
    /// and `dst_sp` becomes the process stack pointer. Unbound kinds ignore
    /// both.
    pub fn switch_in(
        &mut self,
        kind: SwitchKind,
        dst: BoxId,
        src_sp: usize,
        dst_sp: usize,
    ) {
        let src = match self.active {
            Some(id) if self.is_valid(id) => id,
            // Nothing is active before the first switch.
            _ if kind == SwitchKind::UnboundFirst => dst,
            _ => fail::die("context switch with no active box"),
        };
        if !self.is_valid(dst) {
            fail::die(InvalidBox(dst));
        }

        // Interrupts may well be delivered to the box that is running.
        if src != dst || kind == SwitchKind::UnboundFirst {
            self.activate(src, dst);
        }
        ringbuf::ringbuf_entry!(Trace::In(kind, src, dst));

        if kind.is_bound() {
            self.push(kind, src, src_sp);
            self.platform.set_process_sp(dst_sp);
        }
    }

    /// Undoes the most recent bound switch, returning to the box it came
    /// from. Unbound switches can't be undone.
    pub fn switch_out(&mut self, kind: SwitchKind) -> PreviousState {
        if !kind.is_bound() {
            fail::die("unbound context switches have no switch-out");
        }
        let Some(dst) = self.active else {
            fail::die("context switch-out with no active box");
        };

        let previous = self.pop();
        if previous.src != dst {
            self.activate(dst, previous.src);
        }
        ringbuf::ringbuf_entry!(Trace::Out(kind, dst, previous.src));

        self.platform.set_process_sp(previous.src_sp);
        previous
    }

    /// Builds an exception frame on `dst`'s stack that will "return" into
    /// `dst_fn` with the first `nargs` argument registers of the frame at
    /// `src_sp`, and come back to `return_fn`. Returns the new stack pointer.
    ///
    /// Argument registers past `nargs` are left as they were on the
    /// destination stack, so nothing from the source leaks through them.
    pub fn forge_exception_frame(
        &mut self,
        src_sp: usize,
        dst: BoxId,
        dst_fn: usize,
        return_fn: usize,
        xpsr: u32,
        nargs: usize,
    ) -> usize {
        if nargs > MAX_CALL_ARGS {
            fail::die("too many gateway arguments");
        }
        let top = self.current[self.slot(dst)].sp;

        // The hardware keeps frames 8-byte aligned, padding with a word
        // above the frame when needed, and notes that in the stacked xPSR.
        let align = usize::from(top & 4 != 0);
        let Some(sp) = top.checked_sub(ExceptionFrame::BYTES + align * 4)
        else {
            fail::die("destination stack underflows address space");
        };

        let word = |i: usize| sp + i * 4;
        // Safety: the destination sp belongs to a configured box, and the
        // source frame was validated by the caller.
        unsafe {
            for i in 0..nargs {
                let arg = self.platform.read_word(src_sp + i * 4);
                self.platform.write_word(word(i), arg);
            }
            self.platform.write_word(word(ExceptionFrame::R12_WORD), 0);
            self.platform.write_word(
                word(ExceptionFrame::LR_WORD),
                return_fn as u32 | 1,
            );
            self.platform
                .write_word(word(ExceptionFrame::PC_WORD), dst_fn as u32 | 1);
            self.platform.write_word(
                word(ExceptionFrame::XPSR_WORD),
                xpsr | ((align as u32) << ExceptionFrame::XPSR_ALIGN_SHIFT),
            );
        }
        sp
    }

    /// Pops the exception frame at `sp` off `id`'s stack, along with its
    /// alignment word if it has one.
    pub fn discard_exception_frame(&mut self, id: BoxId, sp: usize) {
        let i = self.slot(id);
        // Safety: the frame was either forged by us or validated.
        let xpsr = unsafe {
            self.platform.read_word(sp + ExceptionFrame::XPSR_WORD * 4)
        };
        let align = (xpsr >> ExceptionFrame::XPSR_ALIGN_SHIFT) as usize & 1;
        self.current[i].sp = sp + ExceptionFrame::BYTES + align * 4;
    }

    /// Checks that the active box can read the whole exception frame at
    /// `sp`, including the alignment word above it if `sp` isn't 8-byte
    /// aligned.
    pub fn validate_exception_frame(
        &self,
        sp: usize,
    ) -> Result<usize, FaultInfo> {
        let words = ExceptionFrame::WORDS + usize::from(sp & 4 != 0);
        for i in 0..words {
            let addr = sp.checked_add(i * 4).ok_or(
                FaultInfo::MemoryAccess {
                    address: Some(sp),
                    source: abi::FaultSource::Monitor,
                },
            )?;
            self.platform.unprivileged_read(addr)?;
        }
        Ok(sp)
    }
}

struct InvalidBox(BoxId);

impl core::fmt::Display for InvalidBox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "box id {} out of range", self.0 .0)
    }
}
