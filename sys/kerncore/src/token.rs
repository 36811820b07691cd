// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPC completion tokens.
//!
//! Each box has 32 tokens. A token is handed out when a send or receive is
//! queued, set in `completed` by the monitor when the operation finishes, and
//! returned to the pool when the box collects the completion.

use abi::{IpcError, TokenSet, INVALID_TOKEN};

/// How a set of tokens is waited on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitFor {
    /// At least one token has completed. Waiting on the empty set succeeds.
    Any,
    /// Every token has completed.
    All,
}

impl WaitFor {
    pub fn is_met(self, wait: TokenSet, completed: TokenSet) -> bool {
        match self {
            WaitFor::Any => wait == 0 || completed & wait != 0,
            WaitFor::All => completed & wait == wait,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Tokens {
    allocated: TokenSet,
    completed: TokenSet,
}

impl Tokens {
    pub const fn new() -> Self {
        Self {
            allocated: 0,
            completed: 0,
        }
    }

    pub fn allocated(&self) -> TokenSet {
        self.allocated
    }

    pub fn completed(&self) -> TokenSet {
        self.completed
    }

    /// Takes the lowest free token, or returns [`INVALID_TOKEN`] if all are
    /// in use.
    pub fn allocate(&mut self) -> TokenSet {
        let token = !self.allocated & self.allocated.wrapping_add(1);
        self.allocated |= token;
        token
    }

    /// Returns a token that was allocated but never used.
    pub fn release(&mut self, token: TokenSet) {
        self.allocated &= !token;
        self.completed &= !token;
    }

    pub fn complete(&mut self, token: TokenSet) {
        self.completed |= token;
    }

    /// One non-blocking step of a wait.
    ///
    /// Returns the tokens collected, which are cleared from both sets, or
    /// `None` if the condition doesn't hold yet. Waiting on a token that
    /// isn't allocated is an error.
    pub fn poll(
        &mut self,
        wait: TokenSet,
        how: WaitFor,
    ) -> Result<Option<TokenSet>, IpcError> {
        if wait & self.allocated != wait {
            return Err(IpcError::InvalidParameters);
        }
        if !how.is_met(wait, self.completed) {
            return Ok(None);
        }
        let done = self.completed & wait;
        self.release(done);
        Ok(Some(done))
    }
}

static_assertions::const_assert_eq!(INVALID_TOKEN, 0);
