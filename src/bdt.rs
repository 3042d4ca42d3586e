// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffer descriptors: the word that hands one buffer bank to the hardware.
//!
//! The packing follows the RP2040 buffer control register, where each of an
//! endpoint's two banks gets a 16-bit half:
//!
//! ```text
//!  15   14   13   12    11    10    9..0
//! FULL LAST PID RESET STALL AVAIL  LENGTH
//! ```
//!
//! Other parts have different layouts (the Kinetis BDT packs ownership and
//! DATA0/1 into a 32-bit word with the byte count up top) but carry the same
//! information, so backends translate from this type rather than the engine
//! learning every format.

use crate::tracker::DataToggle;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferDescriptor(u16);

impl BufferDescriptor {
    const LENGTH_MASK: u16 = 0x3FF;
    const AVAILABLE: u16 = 1 << 10;
    const STALL: u16 = 1 << 11;
    const RESET: u16 = 1 << 12;
    const PID: u16 = 1 << 13;
    const LAST: u16 = 1 << 14;
    const FULL: u16 = 1 << 15;

    /// Largest byte count the length field can carry.
    pub const MAX_LENGTH: u16 = Self::LENGTH_MASK;

    /// A descriptor handing `length` bytes of outgoing data to the hardware,
    /// to be sent with the given DATA PID.
    pub const fn transmit(length: u16, toggle: DataToggle) -> Self {
        Self(Self::FULL | Self::AVAILABLE | Self::pid_bits(toggle) | (length & Self::LENGTH_MASK))
    }

    /// A descriptor handing an empty buffer of up to `length` bytes to the
    /// hardware, expecting a packet with the given DATA PID.
    pub const fn receive(length: u16, toggle: DataToggle) -> Self {
        Self(Self::AVAILABLE | Self::pid_bits(toggle) | (length & Self::LENGTH_MASK))
    }

    /// A descriptor the hardware doesn't own.
    pub const fn idle() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    const fn pid_bits(toggle: DataToggle) -> u16 {
        match toggle {
            DataToggle::Data0 => 0,
            DataToggle::Data1 => Self::PID,
        }
    }

    /// Byte count: the size offered before completion, the size moved after.
    pub const fn length(self) -> u16 {
        self.0 & Self::LENGTH_MASK
    }

    /// Whether the hardware currently owns this bank.
    pub const fn is_available(self) -> bool {
        self.0 & Self::AVAILABLE != 0
    }

    /// Whether the bank holds data: outgoing data not yet sent, or incoming
    /// data not yet collected.
    pub const fn is_full(self) -> bool {
        self.0 & Self::FULL != 0
    }

    pub const fn is_stalled(self) -> bool {
        self.0 & Self::STALL != 0
    }

    pub const fn is_last(self) -> bool {
        self.0 & Self::LAST != 0
    }

    pub const fn data_toggle(self) -> DataToggle {
        if self.0 & Self::PID != 0 {
            DataToggle::Data1
        } else {
            DataToggle::Data0
        }
    }

    /// Same descriptor with the hardware's ownership taken back.
    pub const fn disowned(self) -> Self {
        Self(self.0 & !Self::AVAILABLE)
    }

    pub const fn with_stall(self, stall: bool) -> Self {
        if stall {
            Self(self.0 | Self::STALL)
        } else {
            Self(self.0 & !Self::STALL)
        }
    }

    /// Marks this as the final buffer of a transfer, for hardware that cares.
    pub const fn with_last(self) -> Self {
        Self(self.0 | Self::LAST)
    }

    /// Asks the hardware to reset its bank selector back to bank 0.
    pub const fn with_reset(self) -> Self {
        Self(self.0 | Self::RESET)
    }
}
