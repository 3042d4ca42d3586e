// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event dispatch.
//!
//! Whatever watches the USB peripheral (an interrupt handler, or a polling
//! loop standing in for one) turns register state into [`Event`]s and hands
//! them to [`Driver::handle`] one at a time, in the order they happened on
//! the wire. A SETUP must be delivered before any other completion from the
//! same transaction.
//!
//! The driver owns the endpoint queue, the data-stage pool and the control
//! transfer, and is the only thing that moves the transfer from stage to
//! stage in response to the bus. What the device actually answers is up to
//! the [`RequestHandler`].

use log::{debug, trace, warn};

use crate::config::Configuration;
use crate::control::{Bus, ControlTransfer, ExtraZlp, RequestHandler, Stage};
use crate::hal::UsbHardware;
use crate::pool::BufferPool;
use crate::queue::EndpointQueue;
use crate::setup::{Direction, SetupPacket};
use crate::tracker::DataToggle;

/// Something that happened on the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event<'a> {
    /// A SETUP packet arrived on endpoint 0.
    Setup([u8; SetupPacket::SIZE]),
    /// The hardware finished sending a buffer of `length` bytes.
    InComplete { endpoint: u8, length: u16 },
    /// The hardware received a packet into the front OUT buffer. `data1` is
    /// the PID it carried.
    OutComplete {
        endpoint: u8,
        data: &'a [u8],
        data1: bool,
    },
    BusReset,
    Suspend,
    Resume,
    /// Start-of-frame token with its 11-bit frame number.
    StartOfFrame(u16),
}

pub struct Driver<H: UsbHardware, R: RequestHandler<H>> {
    hw: H,
    endpoints: EndpointQueue,
    pool: BufferPool,
    transfer: ControlTransfer<R::Hook>,
    handler: R,
    configurations: &'static [Configuration],
}

impl<H: UsbHardware, R: RequestHandler<H>> Driver<H, R> {
    pub fn new(hw: H, handler: R, configurations: &'static [Configuration]) -> Self {
        Self {
            hw,
            endpoints: EndpointQueue::new(),
            pool: BufferPool::new(),
            transfer: ControlTransfer::idle(),
            handler,
            configurations,
        }
    }

    /// Brings up configuration 0 (the control endpoint alone) so the device
    /// can be enumerated.
    pub fn start(&mut self) -> bool {
        let (_, _, mut bus) = self.parts();
        bus.load_configuration(0)
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn handler(&self) -> &R {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut R {
        &mut self.handler
    }

    pub fn transfer(&self) -> &ControlTransfer<R::Hook> {
        &self.transfer
    }

    pub fn endpoints(&self) -> &EndpointQueue {
        &self.endpoints
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn parts(&mut self) -> (&mut ControlTransfer<R::Hook>, &mut R, Bus<'_, H>) {
        (
            &mut self.transfer,
            &mut self.handler,
            Bus {
                hw: &mut self.hw,
                endpoints: &mut self.endpoints,
                pool: &mut self.pool,
                configurations: self.configurations,
            },
        )
    }

    pub fn handle(&mut self, event: Event<'_>) {
        match event {
            Event::Setup(raw) => self.setup(&raw),
            Event::InComplete { endpoint: 0, length } => self.control_in(length),
            Event::OutComplete {
                endpoint: 0,
                data,
                data1,
            } => self.control_out(data, data1),
            Event::InComplete { endpoint, length } => {
                trace!("ep{endpoint} IN complete, {length}B");
                if let Err(e) = self.endpoints.pop(endpoint, Direction::In) {
                    warn!("IN completion without a buffer: {e}");
                }
            }
            Event::OutComplete { endpoint, data, .. } => self.data_out(endpoint, data),
            Event::BusReset => self.bus_reset(),
            Event::Suspend => {
                debug!("suspend");
                self.handler.suspend();
            }
            Event::Resume => {
                debug!("resume");
                self.handler.resume();
            }
            Event::StartOfFrame(frame) => self.handler.start_of_frame(frame),
        }
    }

    fn setup(&mut self, raw: &[u8]) {
        // Copied out before anything else touches the hardware.
        let Some(request) = SetupPacket::parse(raw) else {
            return;
        };
        trace!("SETUP {request:?}");
        let (xfer, handler, mut bus) = self.parts();

        if !matches!(xfer.stage(), Stage::Idle | Stage::Stall) {
            xfer.cancel(handler, &mut bus);
        }
        // The control endpoint is halted by the SETUP, so anything still
        // queued can be taken back.
        bus.endpoints.dequeue_all(bus.hw, 0, Direction::In);
        bus.endpoints.dequeue_all(bus.hw, 0, Direction::Out);
        if bus.hw.is_stalled(0) {
            bus.hw.set_stall(0, false);
        }

        *xfer = ControlTransfer::new(request);
        handler.setup(xfer, &mut bus);

        // The first packet after SETUP is always DATA1, whichever way it goes.
        for dir in [Direction::In, Direction::Out] {
            set_ep0_toggle(&mut bus, dir, DataToggle::Data1);
        }

        match xfer.stage() {
            Stage::DataIn if request.length() == 0 => {
                // No data stage at all, so the status stage is ours to send.
                xfer.release_data(bus.pool);
                xfer.set_stage(Stage::HandshakeOut);
                push_status_in(&mut bus);
            }
            Stage::DataIn => {
                xfer.plan_extra_zlp(bus.endpoints.max_packet_size(0));
                if xfer.is_data_complete() {
                    xfer.mark_data_done(0, handler, &mut bus);
                } else {
                    queue_control_in(xfer, &mut bus);
                }
            }
            Stage::DataOut => {
                if xfer.is_data_complete() {
                    xfer.mark_data_done(0, handler, &mut bus);
                    if xfer.stage() == Stage::HandshakeOut {
                        push_status_in(&mut bus);
                    }
                }
            }
            Stage::HandshakeOut => push_status_in(&mut bus),
            stage => {
                debug!("request {:#04x} not handled ({stage:?}), stalling", request.request());
                xfer.cancel(handler, &mut bus);
                bus.hw.set_stall(0, true);
            }
        }

        bus.endpoints.fill(bus.hw, 0);
    }

    fn control_in(&mut self, length: u16) {
        let (xfer, handler, mut bus) = self.parts();
        if let Err(e) = bus.endpoints.pop(0, Direction::In) {
            warn!("{e}");
        }
        match xfer.stage() {
            Stage::DataIn => {
                if length == 0
                    && xfer.extra_zlp() == ExtraZlp::Queued
                    && xfer.data_done() == xfer.data_length()
                {
                    xfer.set_extra_zlp(ExtraZlp::Sent);
                }
                xfer.mark_data_done(length, handler, &mut bus);
                if xfer.stage() == Stage::DataIn {
                    queue_control_in(xfer, &mut bus);
                }
            }
            Stage::HandshakeOut => xfer.complete_handshake(handler, &mut bus),
            // Leftovers from an aborted transfer.
            Stage::Idle | Stage::Stall | Stage::HandshakeIn => (),
            stage => {
                debug!("IN complete in {stage:?}, stalling");
                xfer.cancel(handler, &mut bus);
                bus.hw.set_stall(0, true);
            }
        }
    }

    fn control_out(&mut self, data: &[u8], data1: bool) {
        let (xfer, handler, mut bus) = self.parts();
        if let Err(e) = bus.endpoints.pop(0, Direction::Out) {
            warn!("{e}");
        }
        match xfer.stage() {
            Stage::DataOut => {
                let done = usize::from(xfer.data_done());
                let left = usize::from(xfer.data_length()) - done;
                let size = data.len().min(left);
                if let Some(buf) = xfer.data() {
                    bus.pool.bytes_mut(buf)[done..done + size].copy_from_slice(&data[..size]);
                }
                xfer.mark_data_done(size as u16, handler, &mut bus);

                if xfer.stage() == Stage::HandshakeOut {
                    set_ep0_toggle(&mut bus, Direction::In, DataToggle::Data1);
                    push_status_in(&mut bus);
                }
            }
            Stage::HandshakeIn if data.is_empty() && data1 => {
                xfer.complete_handshake(handler, &mut bus);
                set_ep0_toggle(&mut bus, Direction::Out, DataToggle::Data0);
            }
            Stage::DataIn if data.is_empty() && data1 => {
                xfer.end_data_in_early(handler, &mut bus);
                set_ep0_toggle(&mut bus, Direction::Out, DataToggle::Data0);
            }
            Stage::Idle | Stage::Stall => (),
            stage => {
                debug!("OUT complete in {stage:?}, stalling");
                xfer.cancel(handler, &mut bus);
                bus.hw.set_stall(0, true);
            }
        }
        bus.endpoints.fill(bus.hw, 0);
    }

    fn data_out(&mut self, ep: u8, data: &[u8]) {
        let (_, handler, mut bus) = self.parts();
        if let Err(e) = bus.endpoints.pop(ep, Direction::Out) {
            warn!("OUT completion without a buffer: {e}");
            return;
        }
        if handler.endpoint_out(ep, data, &mut bus) {
            bus.endpoints.fill(bus.hw, ep);
        } else {
            debug!("ep{ep} rejected {} bytes, stalling", data.len());
            bus.endpoints.stall(bus.hw, ep);
        }
    }

    fn bus_reset(&mut self) {
        debug!("bus reset");
        let (xfer, handler, mut bus) = self.parts();
        if !matches!(xfer.stage(), Stage::Idle | Stage::Stall) {
            xfer.cancel(handler, &mut bus);
        }
        *xfer = ControlTransfer::idle();
        bus.endpoints.deconfigure_all(bus.hw);
        bus.endpoints.reset();
        bus.hw.set_address(0);
        handler.bus_reset(&mut bus);
        if !bus.load_configuration(0) {
            warn!("can't load default configuration after reset");
        }
    }
}

/// Queues as much of the IN data stage as there are free banks for, and the
/// extra ZLP after it if one is owed.
fn queue_control_in<K, H>(xfer: &mut ControlTransfer<K>, bus: &mut Bus<'_, H>)
where
    K: Copy + core::fmt::Debug,
    H: UsbHardware,
{
    loop {
        let pending = xfer.unqueued();
        if !pending.is_empty() {
            let payload = xfer.data().map(|d| &bus.pool.bytes(d)[pending.clone()]);
            let want = pending.len() as u16;
            match bus.endpoints.push(bus.hw, 0, Direction::In, payload, want) {
                Ok(n) => xfer.mark_queued(n),
                Err(_) => break,
            }
        } else if xfer.extra_zlp() == ExtraZlp::Owed {
            if bus.endpoints.push(bus.hw, 0, Direction::In, None, 0).is_err() {
                break;
            }
            xfer.set_extra_zlp(ExtraZlp::Queued);
        } else {
            break;
        }
    }
}

fn set_ep0_toggle<H: UsbHardware>(bus: &mut Bus<'_, H>, dir: Direction, toggle: DataToggle) {
    // Only fails if EP0 itself didn't come up.
    if let Err(e) = bus.endpoints.set_data_toggle(0, dir, toggle) {
        warn!("EP0 toggle: {e}");
    }
}

fn push_status_in<H: UsbHardware>(bus: &mut Bus<'_, H>) {
    if let Err(e) = bus.endpoints.push(bus.hw, 0, Direction::In, None, 0) {
        warn!("no room for status ZLP: {e}");
    }
}
