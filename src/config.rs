// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stack sizing and the device's endpoint configurations.

use crate::descriptor::TransferType;
use crate::error::EndpointError;
use crate::setup::Direction;

/// Endpoints 0 through `MAX_ENDPOINTS - 1` are usable.
pub const MAX_ENDPOINTS: usize = 4;

/// Packet size of the default control endpoint. 64 is the most USB 1.1
/// full-speed allows.
pub const EP0_MAX_PACKET: u16 = 64;

/// Granularity of the data-stage buffer pool.
pub const POOL_BLOCK_SIZE: usize = 64;
/// Number of blocks in the data-stage buffer pool.
pub const POOL_BLOCKS: usize = 16;

/// Which way(s) an endpoint moves data. Only control endpoints may be
/// bidirectional.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointDirection {
    Out,
    In,
    Bidirectional,
}

impl EndpointDirection {
    pub const fn has(self, dir: Direction) -> bool {
        matches!(
            (self, dir),
            (Self::Bidirectional, _) | (Self::Out, Direction::Out) | (Self::In, Direction::In)
        )
    }
}

/// What to do with an endpoint once it has been (re)configured or had its
/// halt cleared.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Initializer {
    /// Queue a receive buffer in every free OUT bank.
    FillReceiveBanks,
    /// Leave the banks empty; the request handler queues buffers itself.
    Manual,
}

/// Everything the stack needs to bring up one endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub number: u8,
    pub transfer_type: TransferType,
    pub direction: EndpointDirection,
    pub max_packet_size: u16,
    pub init: Initializer,
}

impl EndpointConfig {
    pub const fn control(number: u8, max_packet_size: u16) -> Self {
        Self {
            number,
            transfer_type: TransferType::Control,
            direction: EndpointDirection::Bidirectional,
            max_packet_size,
            init: Initializer::FillReceiveBanks,
        }
    }

    pub const fn bulk_out(number: u8, max_packet_size: u16) -> Self {
        Self {
            number,
            transfer_type: TransferType::Bulk,
            direction: EndpointDirection::Out,
            max_packet_size,
            init: Initializer::FillReceiveBanks,
        }
    }

    /// Number of buffer banks to track, given what the hardware offers.
    /// Isochronous endpoints don't do data toggle sync, so they don't get to
    /// ping-pong either.
    pub const fn bank_count(&self, hardware_banks: u8) -> u8 {
        match self.transfer_type {
            TransferType::Isochronous => 1,
            _ => hardware_banks,
        }
    }

    pub fn validate(&self) -> Result<(), EndpointError> {
        if usize::from(self.number) >= MAX_ENDPOINTS {
            return Err(EndpointError::InvalidEndpoint(self.number));
        }
        let control = self.transfer_type == TransferType::Control;
        let bidir = self.direction == EndpointDirection::Bidirectional;
        if control != bidir || self.max_packet_size == 0 || self.max_packet_size > 1023 {
            return Err(EndpointError::InvalidConfiguration(self.number));
        }
        Ok(())
    }
}

/// One selectable device configuration: the endpoints it brings up.
#[derive(Debug)]
pub struct Configuration {
    pub endpoints: &'static [EndpointConfig],
}

/// Configuration 0 is the unconfigured default state: just the control
/// endpoint. Configuration 1 adds the bulk frame stream on EP1 OUT.
pub static DEVICE_CONFIGURATIONS: [Configuration; 2] = [
    Configuration {
        endpoints: &[EndpointConfig::control(0, EP0_MAX_PACKET)],
    },
    Configuration {
        endpoints: &[
            EndpointConfig::control(0, EP0_MAX_PACKET),
            EndpointConfig::bulk_out(FRAME_ENDPOINT, 64),
        ],
    },
];

/// Endpoint carrying the bulk frame stream in configuration 1.
pub const FRAME_ENDPOINT: u8 = 1;
