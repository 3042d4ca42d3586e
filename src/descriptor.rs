// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB descriptor layouts.
//!
//! These only describe the wire format. What a given device puts in them is
//! the business of whoever implements
//! [`DeviceBackend`](crate::requests::DeviceBackend).

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use zerocopy::{AsBytes, U16};

/// Types of USB descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
}

/// Types of transfer, as encoded in the bottom two bits of
/// `EndpointDescriptor::attributes`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct DeviceDescriptor {
    /// Must be 18.
    pub length: u8,
    pub descriptor_type: DescriptorType,
    /// USB version in BCD, `0x0110` for 1.1.
    pub bcd_usb: U16<LittleEndian>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Packet size of endpoint 0.
    pub max_packet_size0: u8,
    pub vendor: U16<LittleEndian>,
    pub product: U16<LittleEndian>,
    pub bcd_device: U16<LittleEndian>,
    /// String descriptor indices; 0 for none.
    pub manufacturer_s: u8,
    pub product_s: u8,
    pub serial_s: u8,
    pub num_configurations: u8,
}

/// Description of a single available device configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct ConfigurationDescriptor {
    /// Must be 9.
    pub length: u8,
    pub descriptor_type: DescriptorType,
    /// Total length of this descriptor plus every interface and endpoint
    /// descriptor sent along with it.
    pub total_length: U16<LittleEndian>,
    pub num_interfaces: u8,
    /// Number to use when requesting this configuration via a
    /// `SetConfiguration` request.
    pub configuration_value: u8,
    pub configuration_s: u8,
    /// Bit 7 must be set; bit 6 is self-powered, bit 5 remote wakeup.
    pub attributes: u8,
    /// In units of 2 mA.
    pub max_power: u8,
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct InterfaceDescriptor {
    /// Must be 9.
    pub length: u8,
    pub descriptor_type: DescriptorType,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_s: u8,
}

/// Describes an endpoint within an interface.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct EndpointDescriptor {
    /// Must be 7.
    pub length: u8,
    pub descriptor_type: DescriptorType,
    /// Bottom four bits are the endpoint number, top bit is set for IN.
    pub endpoint_address: u8,
    /// Bottom two bits are a [`TransferType`].
    pub attributes: u8,
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval in frames, for interrupt endpoints.
    pub interval: u8,
}

/// Writes a string descriptor for `s` into `out`, truncating if `out` is too
/// short. Returns the number of bytes written.
///
/// The length byte always reports the full descriptor, even when truncated,
/// because that's what a host asking for a prefix expects to see.
pub fn encode_string(s: &str, out: &mut [u8]) -> usize {
    let full = string_length(s);
    let mut used = 0;
    let mut put = |b: u8| {
        if let Some(slot) = out.get_mut(used) {
            *slot = b;
            used += 1;
        }
    };
    put(full as u8);
    put(DescriptorType::String as u8);
    for unit in s.encode_utf16() {
        for b in unit.to_le_bytes() {
            put(b);
        }
    }
    used
}

/// Length of the string descriptor [`encode_string`] would produce.
pub fn string_length(s: &str) -> usize {
    2 + 2 * s.encode_utf16().count()
}
