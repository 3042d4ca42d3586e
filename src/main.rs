// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! LED display controller firmware for RP2040.
//!
//! This is the board end of the stack: it brings up clocks and the USB
//! controller, describes one particular display to the host, and then spins
//! in a loop feeding USB events into the control-transfer engine. All of the
//! protocol lives in the library. What's here is the part that changes from
//! board to board.
//!
//! - No HALs.
//! - No interrupts. The USB controller's interrupt flags are polled.
//! - No SDK setup code preparing clocks or configuring peripherals behind your
//!   back.
//!
//! The display itself is an IceTop-style station map: 81 stations, one
//! WS2811 LED each, three bytes per LED. Frames arrive either pushed through
//! endpoint 0 (vendor request `PUSH_FRAME`) or streamed over bulk EP1 OUT in
//! configuration 1. A complete frame goes live at the next display frame
//! boundary, which we derive from the 1 ms USB start-of-frame tick, so the
//! host can line its own clock up with ours through `FRAME_DRAW_STATUS` and
//! the frame timer corrections.
//!
//! There's no LED output driver here yet. Frames are double-buffered and
//! timed exactly as they'd be shown, and the activity pins below tell you
//! what the USB side is doing.
//!
//! # A note on `unsafe`
//!
//! Nearly all of the `unsafe` in this file is inside register `write` or
//! `modify` operations, because `rp2040_pac` marks a lot of API as unsafe
//! when it isn't. Those don't get explanatory comments. The packet memory
//! handling, which is legit unsafe, lives in the library's `rp2040` module.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use zerocopy::{AsBytes, U16};

use panic_halt as _;

use led_display_usb::config::{DEVICE_CONFIGURATIONS, EP0_MAX_PACKET, FRAME_ENDPOINT};
use led_display_usb::descriptor::{
    encode_string, string_length, ConfigurationDescriptor, DescriptorType, DeviceDescriptor,
    EndpointDescriptor, InterfaceDescriptor, TransferType,
};
use led_display_usb::driver::Driver;
use led_display_usb::frame::FrameBuffers;
use led_display_usb::requests::{
    DeviceBackend, DeviceState, DisplayProperty, DisplayRequests, FramePhase, MS_PER_FRAME,
};
use led_display_usb::rp2040::{self, Rp2040Usb};
use led_display_usb::setup::Direction;

// Debug pins. Look at these with a logic analyzer or a row of LEDs to see
// what's going on.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-pico")] {
        const LED_PIN: u8 = 25; // any USB activity
        const CONFIGURED_PIN: u8 = 0; // host has selected configuration 1
        const FRAME_PIN: u8 = 1; // toggles on every display frame
    } else if #[cfg(feature = "target-feather")] {
        const LED_PIN: u8 = 13; // any USB activity
        const CONFIGURED_PIN: u8 = 0; // host has selected configuration 1
        const FRAME_PIN: u8 = 1; // toggles on every display frame
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

#[entry]
fn main() -> ! {
    let p = rp2040_pac::Peripherals::take().unwrap();

    //////////////////////////////////////////////////////////////////////////
    // Diagnostic pins.
    //
    // Note: the p.SIO peripheral is always available, without needing to take
    // it out of RESET.

    p.RESETS.reset.modify(|_, w| w.io_bank0().clear_bit());
    while !p.RESETS.reset_done.read().io_bank0().bit() {}

    for pin in [LED_PIN, CONFIGURED_PIN, FRAME_PIN] {
        p.IO_BANK0.gpio[pin as usize].gpio_ctrl.write(|w| w.funcsel().sio());
        p.SIO.gpio_oe_set.write(|w| unsafe { w.bits(1 << pin) });
    }

    //////////////////////////////////////////////////////////////////////////
    // Clock configuration. Switch over to the crystal oscillator, enable the
    // PLLs, boost clk_sys to 132 MHz and give USB its 48 MHz.
    //
    // XOSC and CLOCKS do not need to be taken out of RESET.

    p.XOSC.ctrl.write(|w| unsafe { w.bits(0xfab_aa0) });
    while !p.XOSC.status.read().stable().bit() {}
    // Glitchless switch of clk_ref (and so clk_sys) over to XOSC.
    p.CLOCKS.clk_ref_ctrl.write(|w| w.src().xosc_clksrc());
    while p.CLOCKS.clk_ref_selected.read().bits() != (1 << 2) {}
    // ROSC off. We're now running at a crystal-governed 12MHz.
    p.ROSC.ctrl.write(|w| unsafe { w.bits(0xd1e_fa4) });

    // PLL_SYS: REFDIV 1, FBDIV 132 => VCO 1584 MHz, / (6 * 2) => 132 MHz.
    p.RESETS.reset.modify(|_, w| w.pll_sys().clear_bit());
    while !p.RESETS.reset_done.read().pll_sys().bit() {}
    p.PLL_SYS.cs.write(|w| unsafe { w.refdiv().bits(1) });
    p.PLL_SYS.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(132) });
    p.PLL_SYS.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
    while !p.PLL_SYS.cs.read().lock().bit() {}
    p.PLL_SYS.prim.write(|w| unsafe { w.postdiv1().bits(6).postdiv2().bits(2) });
    p.PLL_SYS.pwr.modify(|_, w| w.postdivpd().clear_bit());

    p.CLOCKS.clk_sys_ctrl.write(|w| w.auxsrc().clksrc_pll_sys());
    p.CLOCKS.clk_sys_ctrl.modify(|_, w| w.src().clksrc_clk_sys_aux());
    while p.CLOCKS.clk_sys_selected.read().bits() != (1 << 1) {}

    // clk_peri tracks clk_sys. USB doesn't care but the LED output will.
    p.CLOCKS.clk_peri_ctrl.write(|w| w.auxsrc().clk_sys().enable().set_bit());

    // PLL_USB: REFDIV 1, FBDIV 100 => VCO 1200 MHz, / (5 * 5) => 48 MHz.
    p.RESETS.reset.modify(|_, w| w.pll_usb().clear_bit());
    while !p.RESETS.reset_done.read().pll_usb().bit() {}
    p.PLL_USB.cs.write(|w| unsafe { w.refdiv().bits(1) });
    p.PLL_USB.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(100) });
    p.PLL_USB.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
    while !p.PLL_USB.cs.read().lock().bit() {}
    p.PLL_USB.prim.write(|w| unsafe { w.postdiv1().bits(5).postdiv2().bits(5) });
    p.PLL_USB.pwr.modify(|_, w| w.postdivpd().clear_bit());

    p.CLOCKS.clk_usb_ctrl.write(|w| w.auxsrc().clksrc_pll_usb().enable().set_bit());

    //////////////////////////////////////////////////////////////////////////
    // USB.

    let usb = Rp2040Usb::new(p.USBCTRL_REGS, p.USBCTRL_DPRAM, &p.RESETS);
    let mut driver = Driver::new(usb, DisplayRequests::new(Board::new()), &DEVICE_CONFIGURATIONS);
    if !driver.start() {
        // The control endpoint alone can't fail to come up unless the
        // configuration table is broken.
        panic!("EP0 setup failed");
    }
    driver.hw_mut().connect();

    //////////////////////////////////////////////////////////////////////////
    // Main loop.

    let mut frame_pin = false;
    loop {
        raise_pin(&p.SIO, LED_PIN);
        rp2040::poll(&mut driver);
        lower_pin(&p.SIO, LED_PIN);

        if driver.handler().state() == DeviceState::Configured {
            raise_pin(&p.SIO, CONFIGURED_PIN);
        } else {
            lower_pin(&p.SIO, CONFIGURED_PIN);
        }

        let odd = driver.handler().backend().display_frame() & 1 != 0;
        if odd != frame_pin {
            frame_pin = odd;
            if odd {
                raise_pin(&p.SIO, FRAME_PIN);
            } else {
                lower_pin(&p.SIO, FRAME_PIN);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////
// What this board tells the host about itself.

/// One byte per color per LED, one LED per station.
const STATIONS: u8 = 81;
const BYTES_PER_LED: usize = 3;
const FRAME_SIZE: usize = STATIONS as usize * BYTES_PER_LED;
/// Max packet size of the bulk frame stream.
const FRAME_PACKET: usize = 64;

const EEPROM_SIZE: usize = 256;

static DEVICE_DESCRIPTOR: DeviceDescriptor = DeviceDescriptor {
    length: core::mem::size_of::<DeviceDescriptor>() as u8,
    descriptor_type: DescriptorType::Device,
    bcd_usb: U16::from_bytes(u16::to_le_bytes(0x0110)),
    device_class: 0xFF, // vendor specific
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: EP0_MAX_PACKET as u8,
    vendor: U16::from_bytes(u16::to_le_bytes(0x1ce3)),
    product: U16::from_bytes(u16::to_le_bytes(0x0001)),
    bcd_device: U16::from_bytes(u16::to_le_bytes(0x0100)),
    manufacturer_s: 1,
    product_s: 2,
    serial_s: 3,
    num_configurations: 1,
};

static CONFIG_DESCRIPTOR: ConfigurationDescriptor = ConfigurationDescriptor {
    length: core::mem::size_of::<ConfigurationDescriptor>() as u8,
    descriptor_type: DescriptorType::Config,
    total_length: U16::from_bytes(u16::to_le_bytes(CONFIG_TOTAL as u16)),
    num_interfaces: 1,
    configuration_value: 1,
    configuration_s: 0,
    attributes: 0x80, // bus powered
    max_power: 50,    // 100 mA
};

static INTERFACE_DESCRIPTOR: InterfaceDescriptor = InterfaceDescriptor {
    length: core::mem::size_of::<InterfaceDescriptor>() as u8,
    descriptor_type: DescriptorType::Interface,
    interface_number: 0,
    alternate_setting: 0,
    num_endpoints: 1,
    interface_class: 0xFF,
    interface_subclass: 0,
    interface_protocol: 0,
    interface_s: 0,
};

static FRAME_EP_DESCRIPTOR: EndpointDescriptor = EndpointDescriptor {
    length: core::mem::size_of::<EndpointDescriptor>() as u8,
    descriptor_type: DescriptorType::Endpoint,
    endpoint_address: Direction::Out.endpoint(FRAME_ENDPOINT),
    attributes: TransferType::Bulk as u8,
    max_packet_size: U16::from_bytes(u16::to_le_bytes(FRAME_PACKET as u16)),
    interval: 0,
};

/// Configuration, interface and endpoint descriptors, sent back to back.
const CONFIG_TOTAL: usize = core::mem::size_of::<ConfigurationDescriptor>()
    + core::mem::size_of::<InterfaceDescriptor>()
    + core::mem::size_of::<EndpointDescriptor>();

/// US English, the only language we speak.
const LANGUAGES: [u8; 4] = [4, DescriptorType::String as u8, 0x09, 0x04];

const STRINGS: [&str; 3] = ["IceCube Collaboration", "IceTop LED display", "ICD-IT-001-0001"];

const INFORMATION_TYPE: u8 = 1;
const INFORMATION_RANGE: u8 = 2;
const LED_TYPE: u8 = 3;
const BUFFER_SIZE: u8 = 4;

const INFORMATION_IT_STATION: u8 = 0;
const LED_TYPE_WS2811: u8 = 1;

static FRAME_SIZE_LE: [u8; 2] = (FRAME_SIZE as u16).to_le_bytes();

static PROPERTIES: [DisplayProperty<'static>; 4] = [
    DisplayProperty {
        kind: INFORMATION_TYPE,
        data: &[INFORMATION_IT_STATION],
    },
    DisplayProperty {
        kind: INFORMATION_RANGE,
        data: &[1, STATIONS],
    },
    DisplayProperty {
        kind: LED_TYPE,
        data: &[LED_TYPE_WS2811],
    },
    DisplayProperty {
        kind: BUFFER_SIZE,
        data: &FRAME_SIZE_LE,
    },
];

/// Copies the first `out.len()` bytes of `parts`, laid end to end.
fn copy_chain(parts: &[&[u8]], out: &mut [u8]) {
    for (slot, b) in out.iter_mut().zip(parts.iter().flat_map(|p| p.iter())) {
        *slot = *b;
    }
}

struct Board {
    eeprom: [u8; EEPROM_SIZE],
    frames: FrameBuffers<FRAME_SIZE>,

    /// Milliseconds into the current display frame.
    ms: i32,
    display_frame: u16,
    last_usb_frame: u16,
    phase: Option<FramePhase>,
}

impl Board {
    fn new() -> Self {
        Self {
            eeprom: [0xFF; EEPROM_SIZE],
            frames: FrameBuffers::new(FRAME_PACKET),
            ms: 0,
            display_frame: 0,
            last_usb_frame: 0,
            phase: None,
        }
    }

    fn display_frame(&self) -> u16 {
        self.display_frame
    }

    fn draw(&mut self) {
        if self.frames.present() {
            self.phase = Some(FramePhase::new(self.display_frame, self.last_usb_frame));
        }
    }
}

impl DeviceBackend for Board {
    fn descriptor_length(&self, kind: DescriptorType, index: u8) -> Option<u16> {
        let len = match (kind, index) {
            (DescriptorType::Device, 0) => DEVICE_DESCRIPTOR.as_bytes().len(),
            (DescriptorType::Config, 0) => CONFIG_TOTAL,
            (DescriptorType::String, 0) => LANGUAGES.len(),
            (DescriptorType::String, i) => string_length(STRINGS.get(usize::from(i) - 1)?),
            _ => return None,
        };
        Some(len as u16)
    }

    fn write_descriptor(&self, kind: DescriptorType, index: u8, out: &mut [u8]) {
        match (kind, index) {
            (DescriptorType::Device, _) => copy_chain(&[DEVICE_DESCRIPTOR.as_bytes()], out),
            (DescriptorType::Config, _) => copy_chain(
                &[
                    CONFIG_DESCRIPTOR.as_bytes(),
                    INTERFACE_DESCRIPTOR.as_bytes(),
                    FRAME_EP_DESCRIPTOR.as_bytes(),
                ],
                out,
            ),
            (DescriptorType::String, 0) => copy_chain(&[&LANGUAGES], out),
            (DescriptorType::String, i) => {
                if let Some(s) = STRINGS.get(usize::from(i) - 1) {
                    encode_string(s, out);
                }
            }
            _ => (),
        }
    }

    fn display_properties(&self) -> &[DisplayProperty<'_>] {
        &PROPERTIES
    }

    fn eeprom_size(&self) -> u16 {
        EEPROM_SIZE as u16
    }

    fn eeprom_read(&self, offset: u16, out: &mut [u8]) {
        let start = usize::from(offset);
        out.copy_from_slice(&self.eeprom[start..start + out.len()]);
    }

    fn eeprom_write(&mut self, offset: u16, data: &[u8]) {
        let start = usize::from(offset);
        self.eeprom[start..start + data.len()].copy_from_slice(data);
    }

    fn frame_phase(&self) -> Option<FramePhase> {
        self.phase
    }

    fn correct_frame_phase(&mut self, ms: i8) {
        self.ms += i32::from(ms);
    }

    fn correct_frame_counter(&mut self, frames: i16) -> bool {
        self.display_frame = self.display_frame.wrapping_add(frames as u16);
        true
    }

    fn frame_remaining(&mut self) -> Option<usize> {
        self.frames.push_remaining()
    }

    fn frame_append(&mut self, data: &[u8]) {
        self.frames.push(data);
    }

    fn frame_abort(&mut self) {
        self.frames.abort_push();
    }

    fn stream_frame_data(&mut self, data: &[u8]) -> bool {
        self.frames.stream(data)
    }

    fn stream_reset(&mut self) {
        self.frames.stream_reset();
    }

    fn start_of_frame(&mut self, frame: u16) {
        self.last_usb_frame = frame;
        self.ms += 1;
        while self.ms >= MS_PER_FRAME {
            self.ms -= MS_PER_FRAME;
            self.display_frame = self.display_frame.wrapping_add(1);
            self.draw();
        }
        if self.ms < 0 {
            self.ms += MS_PER_FRAME;
        }
    }
}

////////////////////////////////////////////////////////////////////////////
// Assorted RP2040 support stuff.

/// Raise the GPIO pin with index `pin`.
///
/// The pin must already be configured as an SIO output.
#[inline(always)]
fn raise_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_set.write(|w| unsafe { w.bits(1 << pin) });
}

/// Lower the GPIO pin with index `pin`.
///
/// The pin must already be configured as an SIO output.
#[inline(always)]
fn lower_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_clr.write(|w| unsafe { w.bits(1 << pin) });
}

// The second stage bootloader goes in the first 256 bytes of flash; see
// `memory.x`.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-feather")] {
        // The Adafruit board uses a GigaDevices flash chip.
        #[link_section = ".boot_loader"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_GD25Q64CS;
    } else if #[cfg(feature = "target-pico")] {
        // The Pi Pico uses a Winbond W25Q080 chip.
        #[link_section = ".boot_loader"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;
    }
}
