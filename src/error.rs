// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors from endpoint and buffer queue operations.
//!
//! Control transfers don't use these to report failure to the host; that's
//! what a stall is for. These are for the firmware's own benefit.

use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// Endpoint number is past the end of the hardware's endpoint table.
    #[error("endpoint number {0} is out of range")]
    InvalidEndpoint(u8),
    /// Endpoint exists but hasn't been configured (or was deconfigured).
    #[error("endpoint {0} is not configured")]
    NotConfigured(u8),
    /// Every bank of the endpoint is already owned by the hardware.
    #[error("no free buffer bank on endpoint address {0:#04x}")]
    NoCapacity(u8),
    /// Nothing is queued on the endpoint, so there is nothing to retire.
    #[error("no buffer queued on endpoint address {0:#04x}")]
    QueueEmpty(u8),
    /// The endpoint configuration asks for something the stack can't do,
    /// like a unidirectional control endpoint.
    #[error("unsupported configuration for endpoint {0}")]
    InvalidConfiguration(u8),
}
