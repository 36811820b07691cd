// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register-level calls into another box.
//!
//! A secure gateway is a record in flash that starts with an `svc`
//! instruction. Executing it traps into the monitor with the caller's
//! exception frame on its stack; the monitor checks the record, builds a
//! frame on the destination box's stack that "returns" into the exported
//! function, and switches to that box. The function returns into a thunk
//! that issues the matching exit `svc`, and the monitor hands `r0` back to
//! the caller.
//!
//! Nothing here decodes instructions or touches exception registers: the
//! architecture layer finds the gateway address and argument count and calls
//! in with the stack pointer it was given.

use abi::{
    BoxId, ExceptionFrame, FaultInfo, SecureGateway, SwitchKind,
    MAX_CALL_ARGS, SECURE_GATEWAY_MAGIC,
};

use crate::arch::Platform;
use crate::fail;
use crate::monitor::Monitor;

/// Reasons a gateway call is refused. The architecture layer treats all of
/// them as a fault in the calling box.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GatewayFault {
    TooManyArgs(usize),
    /// The caller's exception frame isn't readable by the caller.
    Frame(FaultInfo),
    /// No valid gateway record at this address.
    BadGateway(usize),
    /// The destination is the public box, or the box making the call.
    BadDestination(BoxId),
    /// Exit without a gateway call in progress.
    NotInGateway,
}

impl From<FaultInfo> for GatewayFault {
    fn from(f: FaultInfo) -> Self {
        Self::Frame(f)
    }
}

impl<P: Platform> Monitor<P> {
    /// Enters the call described by the gateway at `gateway`, made from the
    /// exception frame at `svc_sp` with `nargs` arguments. Returns the stack
    /// pointer to resume the destination box with.
    pub fn secure_gateway_in(
        &mut self,
        svc_sp: usize,
        gateway: usize,
        nargs: usize,
    ) -> Result<usize, GatewayFault> {
        if nargs > MAX_CALL_ARGS {
            return Err(GatewayFault::TooManyArgs(nargs));
        }
        let src_sp = self.context().validate_exception_frame(svc_sp)?;

        let bad = GatewayFault::BadGateway(gateway);
        let gw: SecureGateway = self.flash_record(gateway).ok_or(bad)?;
        if !gw.has_valid_opcode()
            || gw.nargs() != nargs
            || gw.magic != SECURE_GATEWAY_MAGIC
            || !self.map().is_public_code(gw.dst_fn)
        {
            return Err(bad);
        }
        let dst = self.box_by_config(gw.dst_box_cfg_ptr).ok_or(bad)?;
        if dst == BoxId::PUBLIC || self.context().active() == Some(dst) {
            return Err(GatewayFault::BadDestination(dst));
        }

        // Safety: the frame was validated above.
        let xpsr = unsafe {
            self.context()
                .platform()
                .read_word(src_sp + ExceptionFrame::XPSR_WORD * 4)
        };
        // The alignment bit describes the caller's stack, not ours.
        let xpsr = xpsr & !(1 << ExceptionFrame::XPSR_ALIGN_SHIFT);

        let thunk = self.return_thunk();
        let context = self.context_mut();
        let dst_sp = context
            .forge_exception_frame(src_sp, dst, gw.dst_fn, thunk, xpsr, nargs);
        context.switch_in(SwitchKind::Gateway, dst, src_sp, dst_sp);
        Ok(dst_sp)
    }

    /// Returns from a gateway call. `svc_sp` is the frame of the exit `svc`
    /// in the destination box, whose `r0` is the call's result. Returns the
    /// stack pointer to resume the caller with.
    pub fn secure_gateway_out(
        &mut self,
        svc_sp: usize,
    ) -> Result<usize, GatewayFault> {
        let dst_sp = self.context().validate_exception_frame(svc_sp)?;
        match self.context().previous_state() {
            Some(p) if p.kind == SwitchKind::Gateway => (),
            _ => return Err(GatewayFault::NotInGateway),
        }
        let Some(dst) = self.context().active() else {
            fail::die("gateway exit with no active box");
        };

        let context = self.context_mut();
        // Safety: the frame was validated above.
        let r0 = unsafe { context.platform().read_word(dst_sp) };
        context.discard_exception_frame(dst, dst_sp);
        let previous = context.switch_out(SwitchKind::Gateway);
        // Safety: the caller's frame was validated on the way in, and only
        // the caller could have moved it since.
        unsafe { context.platform_mut().write_word(previous.src_sp, r0) };
        Ok(previous.src_sp)
    }
}
