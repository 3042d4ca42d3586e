// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording stand-in for a USB peripheral.

use crate::bdt::BufferDescriptor;
use crate::config::{EndpointConfig, MAX_ENDPOINTS};
use crate::hal::UsbHardware;
use crate::setup::Direction;

/// One `arm` call, as the hardware saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Armed {
    pub ep: u8,
    pub dir: Direction,
    pub bank: u8,
    pub desc: BufferDescriptor,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MockHardware<const BANKS: u8> {
    pub armed: Vec<Armed>,
    pub disarmed: Vec<(u8, Direction, u8)>,
    pub enabled: [Option<EndpointConfig>; MAX_ENDPOINTS],
    pub stalled: [bool; MAX_ENDPOINTS],
    pub stall_log: Vec<(u8, bool)>,
    pub address: u8,
    pub address_log: Vec<u8>,
}

impl<const BANKS: u8> MockHardware<BANKS> {
    pub fn new() -> Self {
        Self {
            armed: Vec::new(),
            disarmed: Vec::new(),
            enabled: [None; MAX_ENDPOINTS],
            stalled: [false; MAX_ENDPOINTS],
            stall_log: Vec::new(),
            address: 0,
            address_log: Vec::new(),
        }
    }

    /// Arm calls for one endpoint direction, oldest first.
    pub fn armed_on(&self, ep: u8, dir: Direction) -> Vec<&Armed> {
        self.armed.iter().filter(|a| a.ep == ep && a.dir == dir).collect()
    }

    pub fn clear_log(&mut self) {
        self.armed.clear();
        self.disarmed.clear();
        self.stall_log.clear();
    }
}

impl<const BANKS: u8> UsbHardware for MockHardware<BANKS> {
    const BANK_COUNT: u8 = BANKS;

    fn enable_endpoint(&mut self, config: &EndpointConfig) -> bool {
        match self.enabled.get_mut(usize::from(config.number)) {
            Some(slot) => {
                *slot = Some(*config);
                true
            }
            None => false,
        }
    }

    fn disable_endpoint(&mut self, ep: u8) {
        if let Some(slot) = self.enabled.get_mut(usize::from(ep)) {
            *slot = None;
        }
    }

    fn arm(
        &mut self,
        ep: u8,
        dir: Direction,
        bank: u8,
        desc: BufferDescriptor,
        payload: Option<&[u8]>,
    ) {
        self.armed.push(Armed {
            ep,
            dir,
            bank,
            desc,
            payload: payload.map(|p| p.to_vec()).unwrap_or_default(),
        });
    }

    fn disarm(&mut self, ep: u8, dir: Direction, bank: u8) {
        self.disarmed.push((ep, dir, bank));
    }

    fn set_stall(&mut self, ep: u8, stall: bool) {
        self.stalled[usize::from(ep)] = stall;
        self.stall_log.push((ep, stall));
    }

    fn is_stalled(&self, ep: u8) -> bool {
        self.stalled.get(usize::from(ep)).copied().unwrap_or(false)
    }

    fn set_address(&mut self, address: u8) {
        self.address = address;
        self.address_log.push(address);
    }
}
