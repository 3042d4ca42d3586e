// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The narrow waist between the protocol engine and a USB peripheral.
//!
//! Everything the engine ever asks of the hardware goes through
//! [`UsbHardware`]. Reading completion status and copying received bytes out
//! of endpoint memory happen on the other side, in whatever turns register
//! state into [`Event`](crate::driver::Event)s, so they don't appear here.

use crate::bdt::BufferDescriptor;
use crate::config::EndpointConfig;
use crate::setup::Direction;

pub trait UsbHardware {
    /// Physical buffer banks per endpoint direction: 1, or 2 for ping-pong.
    const BANK_COUNT: u8;

    /// Enables an endpoint as described. Returns `false` if the hardware
    /// can't do it (no such endpoint, out of endpoint memory).
    fn enable_endpoint(&mut self, config: &EndpointConfig) -> bool;

    /// Disables an endpoint and takes back all of its banks.
    fn disable_endpoint(&mut self, ep: u8);

    /// Hands `bank` of endpoint `ep` in direction `dir` to the hardware.
    ///
    /// For IN, `payload` is copied into endpoint memory before the
    /// descriptor is written, so the caller may reuse it immediately. `None`
    /// sends whatever endpoint memory already holds; for OUT, the packet
    /// always lands in endpoint memory and `payload` is ignored.
    fn arm(
        &mut self,
        ep: u8,
        dir: Direction,
        bank: u8,
        desc: BufferDescriptor,
        payload: Option<&[u8]>,
    );

    /// Takes `bank` back from the hardware before it completes.
    ///
    /// Only sound while the endpoint is halted (stalled, or suspended by an
    /// incoming SETUP); on a live endpoint the hardware may be halfway
    /// through the transaction.
    fn disarm(&mut self, ep: u8, dir: Direction, bank: u8);

    /// Makes endpoint `ep` answer the next token with STALL, or stop doing so.
    fn set_stall(&mut self, ep: u8, stall: bool);

    fn is_stalled(&self, ep: u8) -> bool;

    /// Switches the device to a new bus address. Takes effect immediately, so
    /// only call this after the status stage of SET_ADDRESS has completed.
    fn set_address(&mut self, address: u8);
}
