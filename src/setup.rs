// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SETUP packets and the request vocabulary they carry.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In endpoint addresses and in `request_type`, OUT
/// is a clear top bit and IN is `0x80`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Direction {
    Out = 0,
    In = 0x80,
}

impl Direction {
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }

    /// Slot of this direction in per-endpoint `[_; 2]` tables.
    pub const fn index(self) -> usize {
        match self {
            Self::Out => 0,
            Self::In => 1,
        }
    }
}

/// Bits 6..5 of `request_type`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Bits 4..0 of `request_type`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Assembles a `request_type` byte.
pub const fn request_type(dir: Direction, kind: RequestKind, recipient: Recipient) -> u8 {
    dir as u8 | (kind as u8) << 5 | recipient as u8
}

/// Layout of an 8-byte USB SETUP packet.
///
/// This is a copy, never a view into endpoint memory: the hardware is free to
/// reuse the buffer the packet arrived in as soon as the next transaction
/// starts.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Direction, kind and recipient; see [`request_type`].
    request_type: u8,
    /// Request code. Standard codes are in [`StandardRequest`], ours are in
    /// [`VendorRequest`].
    request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    value: U16<LittleEndian>,
    /// Second argument; for endpoint requests, the endpoint address.
    index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    length: U16<LittleEndian>,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value: U16::new(value),
            index: U16::new(index),
            length: U16::new(length),
        }
    }

    /// Reinterprets raw packet bytes. Returns `None` if `raw` isn't exactly
    /// eight bytes.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        LayoutVerified::<_, SetupPacket>::new(raw).map(|lv| *lv.into_ref())
    }

    pub fn request_type(&self) -> u8 {
        self.request_type
    }

    pub fn request(&self) -> u8 {
        self.request
    }

    pub fn value(&self) -> u16 {
        self.value.get()
    }

    pub fn index(&self) -> u16 {
        self.index.get()
    }

    pub fn length(&self) -> u16 {
        self.length.get()
    }

    pub fn direction(&self) -> Direction {
        Direction::of_endpoint_addr(self.request_type)
    }

    pub fn kind(&self) -> RequestKind {
        // Two bits, all four values are variants.
        match (self.request_type >> 5) & 0b11 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::from_u8(self.request_type & 0x1F)
    }

    /// Endpoint number named by `index`, for endpoint-recipient requests.
    pub fn endpoint_number(&self) -> u8 {
        (self.index.get() & 0xF) as u8
    }
}

/// Standard request codes (USB 2.0 table 9-4).
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    /// Notifies the device that it's being moved to a different address on the
    /// bus. Always an OUT, and the new address only takes effect once the
    /// status stage has been sent from the old one.
    SetAddress = 0x05,
    /// Asks the device to send a certain descriptor back to the host. Always
    /// an IN.
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    /// Configures a device by choosing one of the options listed in its
    /// descriptors. Always an OUT.
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// Vendor requests understood by the display.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum VendorRequest {
    /// Frame data over EP0. Superseded by the EP1 bulk stream but still
    /// accepted.
    PushFrame = 1,
    /// Length-prefixed TLV list of display properties.
    DisplayProperties = 2,
    /// `index` is the EEPROM offset, `length` the byte count.
    EepromWrite = 3,
    EepromRead = 4,
    /// Most recent frame draw time against the USB frame counter.
    FrameDrawStatus = 5,
    /// `value` is a signed millisecond correction for the frame timer.
    FrameDrawSync = 6,
}

/// Feature selectors for SET_FEATURE/CLEAR_FEATURE.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Feature {
    EndpointHalt = 0,
    RemoteWakeup = 1,
    TestMode = 2,
}
