// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DATA0/DATA1 and ping-pong bank bookkeeping.
//!
//! Two independent bits of state per endpoint direction:
//!
//! - The **data toggle**: the PID the next buffer we hand to the hardware
//!   should carry. It flips once per buffer queued, which is once per packet
//!   that will eventually complete.
//!
//! - The **bank toggle**: which of the (up to two) physical buffer banks the
//!   hardware will complete next. The hardware keeps its own copy of this and
//!   advances it on every completed transaction; ours advances when firmware
//!   retires a completed buffer. As long as every completion is retired
//!   exactly once, the two stay in step.
//!
//! Nothing in here knows about transfers. It's purely "what did we promise
//! the hardware", so it can be tested without any.

use crate::config::MAX_ENDPOINTS;
use crate::setup::Direction;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DataToggle {
    #[default]
    Data0,
    Data1,
}

impl DataToggle {
    pub const fn from_bit(data1: bool) -> Self {
        if data1 {
            Self::Data1
        } else {
            Self::Data0
        }
    }

    pub const fn is_data1(self) -> bool {
        matches!(self, Self::Data1)
    }

    pub const fn flipped(self) -> Self {
        match self {
            Self::Data0 => Self::Data1,
            Self::Data1 => Self::Data0,
        }
    }
}

/// What the tracker hands back when a bank is claimed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    /// Physical bank the buffer goes into.
    pub bank: u8,
    /// PID to stamp on it.
    pub toggle: DataToggle,
}

/// Bookkeeping for one endpoint in one direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferState {
    data_toggle: DataToggle,
    bank_toggle: u8,
    queued: u8,
    banks: u8,
}

impl BufferState {
    /// State for an endpoint with `banks` physical buffers. Zero banks means
    /// unconfigured: nothing can ever be queued.
    pub const fn new(banks: u8) -> Self {
        Self {
            data_toggle: DataToggle::Data0,
            bank_toggle: 0,
            queued: 0,
            banks,
        }
    }

    pub const fn banks(&self) -> u8 {
        self.banks
    }

    pub const fn queued(&self) -> u8 {
        self.queued
    }

    pub const fn data_toggle(&self) -> DataToggle {
        self.data_toggle
    }

    /// Bank the hardware will complete next.
    pub const fn front_bank(&self) -> u8 {
        self.bank_toggle
    }

    pub const fn is_full(&self) -> bool {
        self.queued >= self.banks
    }

    /// Claims the bank behind everything already queued, stamps it with the
    /// current data toggle and advances the toggle. `None` if every bank is
    /// already queued; state is left untouched in that case.
    pub fn claim(&mut self) -> Option<Claim> {
        if self.is_full() {
            return None;
        }
        let bank = (self.bank_toggle + self.queued) % self.banks;
        let toggle = self.data_toggle;
        self.data_toggle = toggle.flipped();
        self.queued += 1;
        Some(Claim { bank, toggle })
    }

    /// Retires the buffer at the front of the queue. `false` if the queue was
    /// empty.
    pub fn retire(&mut self) -> bool {
        if self.queued == 0 {
            return false;
        }
        self.bank_toggle = (self.bank_toggle + 1) % self.banks;
        self.queued -= 1;
        true
    }

    pub fn set_data_toggle(&mut self, toggle: DataToggle) {
        self.data_toggle = toggle;
    }

    /// Back to DATA0, bank 0, nothing queued. The bank count survives.
    pub fn reset(&mut self) {
        *self = Self::new(self.banks);
    }
}

/// Buffer state for every endpoint and direction on the device.
#[derive(Debug)]
pub struct Tracker {
    states: [[BufferState; 2]; MAX_ENDPOINTS],
}

impl Tracker {
    pub const fn new() -> Self {
        Self {
            states: [[BufferState::new(0); 2]; MAX_ENDPOINTS],
        }
    }

    pub fn state(&self, ep: u8, dir: Direction) -> Option<&BufferState> {
        self.states.get(usize::from(ep)).map(|s| &s[dir.index()])
    }

    pub fn state_mut(&mut self, ep: u8, dir: Direction) -> Option<&mut BufferState> {
        self.states.get_mut(usize::from(ep)).map(|s| &mut s[dir.index()])
    }

    /// Sets the bank count for one direction of an endpoint, resetting it.
    pub fn set_banks(&mut self, ep: u8, dir: Direction, banks: u8) {
        if let Some(s) = self.state_mut(ep, dir) {
            *s = BufferState::new(banks);
        }
    }

    /// Bus reset: every toggle and bank back to its initial value.
    pub fn reset_all(&mut self) {
        for s in self.states.iter_mut().flatten() {
            s.reset();
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
