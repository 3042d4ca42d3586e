// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB device stack for an LED display controller.
//!
//! The interesting part of this crate is the control-transfer engine: the
//! state machine that walks every request on endpoint 0 from its SETUP packet
//! through the data and status stages, and the buffer/toggle bookkeeping that
//! keeps firmware and hardware agreeing on which bank and which DATA0/DATA1
//! PID comes next.
//!
//! Everything here is meant to run from the USB interrupt (or a polling loop
//! standing in for one). Nothing blocks, nothing allocates from a global heap,
//! and every failure ends in the one error signal USB gives a device: a stall.
//!
//! Reading order, bottom up:
//!
//! - [`bdt`]: the bit-packed buffer control word the hardware reads.
//! - [`tracker`]: per endpoint/direction toggle and bank bookkeeping.
//! - [`queue`]: pushing and retiring buffers on top of the tracker.
//! - [`pool`]: where data-stage buffers come from.
//! - [`control`]: the control transfer state machine.
//! - [`driver`]: the dispatch loop feeding hardware events into all of the
//!   above.
//! - [`requests`]: what this particular device answers to.
//! - [`frame`]: display frames put together from pushes or the bulk stream.
//!
//! The hardware itself sits behind [`hal::UsbHardware`]. The RP2040
//! implementation lives in `rp2040` and is only built with the `rp2040`
//! feature, so the rest can be tested on a host.

#![cfg_attr(not(test), no_std)]

pub mod bdt;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod frame;
pub mod hal;
pub mod pool;
pub mod queue;
pub mod requests;
pub mod setup;
pub mod tracker;

#[cfg(feature = "rp2040")]
pub mod rp2040;

#[cfg(test)]
mod mock;
