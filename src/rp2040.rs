// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RP2040 USB controller, driven directly through its registers.
//!
//! The controller keeps its per-endpoint state in a 4 KiB dual-port RAM
//! (DPRAM) at `USBCTRL_DPRAM`. The first 256 bytes are control registers:
//! the SETUP packet, one `ep_control` word per non-zero endpoint direction,
//! and one `ep_buffer_control` word per endpoint direction, EP0 included.
//! The rest is packet memory, which we carve up ourselves:
//!
//! - `0x100`: EP0's buffer. Fixed by the hardware, and shared by EP0 IN and
//!   EP0 OUT, which works out because a control transfer only ever moves data
//!   one way at a time.
//! - `0x180` onwards: one 64-byte buffer per direction of endpoints 1 and up,
//!   in `ep_control` order.
//!
//! We only use buffer 0 of each direction, so [`UsbHardware::BANK_COUNT`] is
//! 1. The low 16 bits of `ep_buffer_control` are exactly
//! [`BufferDescriptor`], so arming is a single register write.
//!
//! # A note on `unsafe`
//!
//! Same two kinds as anywhere else on this chip: packet memory accessed
//! through raw pointers, which gets a safety comment; and register writes
//! that `rp2040_pac` marks unsafe for no reason we can see, which doesn't.

use log::{debug, trace};

use crate::bdt::BufferDescriptor;
use crate::config::{EndpointConfig, MAX_ENDPOINTS};
use crate::control::RequestHandler;
use crate::driver::{Driver, Event};
use crate::hal::UsbHardware;
use crate::setup::{Direction, SetupPacket};
use crate::tracker::DataToggle;

/// Offset of EP0's buffer in DPRAM.
const EP0_BUFFER: usize = 0x100;
/// Offset of the first buffer we hand out to other endpoints.
const EP_BUFFERS: usize = 0x180;
/// Every buffer is this big; it's also the largest packet we support.
const BUFFER_SIZE: usize = 64;

/// The controller lists IN before OUT for each endpoint, both in its
/// register arrays and in `buff_status`.
const fn hw_slot(dir: Direction) -> usize {
    match dir {
        Direction::In => 0,
        Direction::Out => 1,
    }
}

/// Index into `ep_buffer_control` for an endpoint direction.
const fn buffer_control_index(ep: u8, dir: Direction) -> usize {
    ep as usize * 2 + hw_slot(dir)
}

/// Index into `ep_control`. Only valid for `ep > 0`; EP0's setup is fixed.
const fn endpoint_control_index(ep: u8, dir: Direction) -> usize {
    (ep as usize - 1) * 2 + hw_slot(dir)
}

/// DPRAM offset of an endpoint direction's packet buffer.
const fn buffer_offset(ep: u8, dir: Direction) -> usize {
    if ep == 0 {
        EP0_BUFFER
    } else {
        EP_BUFFERS + endpoint_control_index(ep, dir) * BUFFER_SIZE
    }
}

pub struct Rp2040Usb {
    regs: rp2040_pac::USBCTRL_REGS,
    dpram: rp2040_pac::USBCTRL_DPRAM,
    /// Endpoints we've told to stall, one bit each.
    stalled: u16,
}

impl Rp2040Usb {
    /// Takes the controller out of reset and sets it up as a full-speed
    /// device. It stays invisible to the host until [`Self::connect`].
    ///
    /// `clk_usb` must already be running at 48 MHz.
    pub fn new(
        regs: rp2040_pac::USBCTRL_REGS,
        dpram: rp2040_pac::USBCTRL_DPRAM,
        resets: &rp2040_pac::RESETS,
    ) -> Self {
        resets.reset.modify(|_, w| w.usbctrl().set_bit());
        resets.reset.modify(|_, w| w.usbctrl().clear_bit());
        while !resets.reset_done.read().usbctrl().bit() {}

        // Clear the control portion of DPRAM. The datasheet doesn't promise
        // it comes out of reset zeroed.
        dpram.setup_packet_low.write(|w| unsafe { w.bits(0) });
        dpram.setup_packet_high.write(|w| unsafe { w.bits(0) });
        for epc in &dpram.ep_control {
            epc.write(|w| unsafe { w.bits(0) });
        }
        for epb in &dpram.ep_buffer_control {
            epb.write(|w| unsafe { w.bits(0) });
        }

        // Onboard PHY. `softcon` is undocumented but the SDK sets it too.
        regs.usb_muxing.write(|w| w.to_phy().set_bit().softcon().set_bit());

        // Not every board wires up VBUS detect, so pretend we always see it.
        regs.usb_pwr.write(|w| w.vbus_detect().set_bit()
            .vbus_detect_override_en().set_bit()
        );

        regs.main_ctrl.write(|w| w
            .controller_en().set_bit()
            .host_ndevice().clear_bit()
        );

        // Report every EP0 buffer in `buff_status`, not just every other one.
        regs.sie_ctrl.write(|w| w.ep0_int_1buf().set_bit());

        // These only latch bits in `ints`; we never take the interrupt
        // itself, we poll.
        regs.inte.write(|w| w
            .buff_status().set_bit()
            .bus_reset().set_bit()
            .setup_req().set_bit()
            .dev_suspend().set_bit()
            .dev_resume_from_host().set_bit()
            .dev_sof().set_bit()
        );

        Self {
            regs,
            dpram,
            stalled: 0,
        }
    }

    /// Enables the pullup on DP. This is where the host notices us.
    pub fn connect(&mut self) {
        self.regs.sie_ctrl.modify(|_, w| w.pullup_en().set_bit());
    }

    pub fn disconnect(&mut self) {
        self.regs.sie_ctrl.modify(|_, w| w.pullup_en().clear_bit());
    }

    fn buffer_ptr(&self, ep: u8, dir: Direction) -> *mut u8 {
        let base = rp2040_pac::USBCTRL_DPRAM::ptr() as *mut u8;
        // Offsets stay inside the 4 KiB DPRAM for every endpoint number
        // below MAX_ENDPOINTS.
        base.wrapping_add(buffer_offset(ep, dir))
    }

    fn write_buffer_control(&self, ep: u8, dir: Direction, desc: BufferDescriptor) {
        self.dpram.ep_buffer_control[buffer_control_index(ep, dir)]
            .write(|w| unsafe { w.bits(u32::from(desc.raw())) });
    }

    fn read_buffer_control(&self, ep: u8, dir: Direction) -> BufferDescriptor {
        let bits = self.dpram.ep_buffer_control[buffer_control_index(ep, dir)]
            .read()
            .bits();
        BufferDescriptor::from_raw(bits as u16)
    }

    /// Turns whatever the controller has flagged into the next [`Event`], or
    /// `None` if nothing is pending. Received packets are copied out of
    /// DPRAM into `scratch` before the event is returned, so the endpoint
    /// can be rearmed while the event is being handled.
    pub fn next_event<'a>(&mut self, scratch: &'a mut [u8; BUFFER_SIZE]) -> Option<Event<'a>> {
        let ints = self.regs.ints.read();

        if ints.setup_req().bit() {
            // Write-one-to-clear.
            self.regs.sie_status.write(|w| w.setup_rec().set_bit());
            let mut packet = [0; SetupPacket::SIZE];
            packet[..4].copy_from_slice(&self.dpram.setup_packet_low.read().bits().to_le_bytes());
            packet[4..].copy_from_slice(&self.dpram.setup_packet_high.read().bits().to_le_bytes());
            return Some(Event::Setup(packet));
        }

        let bufbits = self.regs.buff_status.read().bits();
        if bufbits != 0 {
            // Lowest set bit first. Even bits are IN, odd bits are OUT.
            let bit = bufbits.trailing_zeros();
            self.regs.buff_status.write(|w| unsafe { w.bits(1 << bit) });
            let ep = (bit >> 1) as u8;
            let dir = if bit & 1 == 0 { Direction::In } else { Direction::Out };
            let desc = self.read_buffer_control(ep, dir);
            trace!("buffer done: bit {bit} bc {:#06x}", desc.raw());
            if dir == Direction::In {
                return Some(Event::InComplete {
                    endpoint: ep,
                    length: desc.length(),
                });
            }
            let len = usize::from(desc.length()).min(BUFFER_SIZE);
            // Safety: the hardware has handed this buffer back to us (that's
            // what the buff_status bit means) and nothing rearms it until
            // this event is handled, so we aren't racing the SIE. The buffer
            // lies within DPRAM and is BUFFER_SIZE bytes long.
            unsafe {
                scratch
                    .as_mut_ptr()
                    .copy_from_nonoverlapping(self.buffer_ptr(ep, Direction::Out), len);
            }
            return Some(Event::OutComplete {
                endpoint: ep,
                data: &scratch[..len],
                data1: desc.data_toggle() == DataToggle::Data1,
            });
        }

        if ints.bus_reset().bit() {
            self.regs.sie_status.write(|w| w.bus_reset().set_bit());
            self.stalled = 0;
            return Some(Event::BusReset);
        }
        if ints.dev_suspend().bit() {
            self.regs.sie_status.write(|w| w.suspended().set_bit());
            return Some(Event::Suspend);
        }
        if ints.dev_resume_from_host().bit() {
            self.regs.sie_status.write(|w| w.resume().set_bit());
            return Some(Event::Resume);
        }
        if ints.dev_sof().bit() {
            // Reading the frame number clears the flag.
            let frame = self.regs.sof_rd.read().count().bits();
            return Some(Event::StartOfFrame(frame));
        }
        None
    }
}

impl UsbHardware for Rp2040Usb {
    const BANK_COUNT: u8 = 1;

    fn enable_endpoint(&mut self, config: &EndpointConfig) -> bool {
        if usize::from(config.max_packet_size) > BUFFER_SIZE
            || usize::from(config.number) >= MAX_ENDPOINTS
        {
            return false;
        }
        // EP0 is always on; there's nothing to set up.
        if config.number == 0 {
            return true;
        }
        for dir in [Direction::In, Direction::Out] {
            if !config.direction.has(dir) {
                continue;
            }
            let offset = buffer_offset(config.number, dir) as u16;
            self.dpram.ep_control[endpoint_control_index(config.number, dir)].write(|w| unsafe {
                w.enable().set_bit()
                    .interrupt_per_buff().set_bit()
                    .endpoint_type().bits(config.transfer_type as u8)
                    .buffer_address().bits(offset)
            });
        }
        debug!("ep{} enabled", config.number);
        true
    }

    fn disable_endpoint(&mut self, ep: u8) {
        for dir in [Direction::In, Direction::Out] {
            self.write_buffer_control(ep, dir, BufferDescriptor::idle());
            if ep != 0 {
                self.dpram.ep_control[endpoint_control_index(ep, dir)]
                    .write(|w| unsafe { w.bits(0) });
            }
        }
        self.stalled &= !(1 << ep);
    }

    fn arm(
        &mut self,
        ep: u8,
        dir: Direction,
        _bank: u8,
        desc: BufferDescriptor,
        payload: Option<&[u8]>,
    ) {
        if let (Direction::In, Some(payload)) = (dir, payload) {
            let len = payload.len().min(BUFFER_SIZE);
            // Safety: the endpoint isn't armed (the queue only arms banks it
            // owns), so the SIE isn't reading this buffer. The buffer lies
            // within DPRAM and is BUFFER_SIZE bytes long.
            unsafe {
                self.buffer_ptr(ep, dir)
                    .copy_from_nonoverlapping(payload.as_ptr(), len);
            }
        }
        // STALL lives in the same word, so rearming mustn't clear it.
        let desc = desc.with_stall(self.is_stalled(ep));
        // The datasheet wants everything but AVAILABLE written first, and a
        // few cycles before AVAILABLE follows when clk_sys outruns clk_usb.
        self.write_buffer_control(ep, dir, desc.disowned());
        cortex_m::asm::delay(12);
        self.write_buffer_control(ep, dir, desc);
    }

    fn disarm(&mut self, ep: u8, dir: Direction, _bank: u8) {
        self.write_buffer_control(ep, dir, BufferDescriptor::idle());
    }

    fn set_stall(&mut self, ep: u8, stall: bool) {
        if ep == 0 {
            // EP0 only stalls if the stall is also armed here, and the
            // hardware disarms it by itself on the next SETUP.
            self.regs.ep_stall_arm.write(|w| w
                .ep0_in().bit(stall)
                .ep0_out().bit(stall)
            );
        }
        for dir in [Direction::In, Direction::Out] {
            let desc = self.read_buffer_control(ep, dir);
            self.write_buffer_control(ep, dir, desc.with_stall(stall));
        }
        if stall {
            self.stalled |= 1 << ep;
        } else {
            self.stalled &= !(1 << ep);
        }
    }

    fn is_stalled(&self, ep: u8) -> bool {
        self.stalled & (1 << ep) != 0
    }

    fn set_address(&mut self, address: u8) {
        debug!("address {address}");
        self.regs.addr_endp.write(|w| unsafe { w.address().bits(address) });
    }
}

/// Feeds every event the controller has pending into `driver`.
pub fn poll<R: RequestHandler<Rp2040Usb>>(driver: &mut Driver<Rp2040Usb, R>) {
    let mut scratch = [0; BUFFER_SIZE];
    while let Some(event) = driver.hw_mut().next_event(&mut scratch) {
        driver.handle(event);
    }
}
