// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What the display answers to on endpoint 0.
//!
//! [`DisplayRequests`] routes the standard requests needed for enumeration
//! and the display's vendor requests. The parts that aren't USB (descriptor
//! bytes, EEPROM, the frame queue, the frame timer) are behind
//! [`DeviceBackend`].

use byteorder::LittleEndian;
use log::{debug, info, trace};
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned, U16};

use crate::config::FRAME_ENDPOINT;
use crate::control::{Bus, ControlTransfer, RequestHandler, Stage};
use crate::descriptor::DescriptorType;
use crate::hal::UsbHardware;
use crate::setup::{
    request_type, Direction, Feature, Recipient, RequestKind, SetupPacket, StandardRequest,
    VendorRequest,
};

const IN_STD_DEVICE: u8 = request_type(Direction::In, RequestKind::Standard, Recipient::Device);
const IN_STD_INTERFACE: u8 =
    request_type(Direction::In, RequestKind::Standard, Recipient::Interface);
const IN_STD_ENDPOINT: u8 = request_type(Direction::In, RequestKind::Standard, Recipient::Endpoint);
const OUT_STD_DEVICE: u8 = request_type(Direction::Out, RequestKind::Standard, Recipient::Device);
const OUT_STD_ENDPOINT: u8 =
    request_type(Direction::Out, RequestKind::Standard, Recipient::Endpoint);
const IN_VENDOR_DEVICE: u8 = request_type(Direction::In, RequestKind::Vendor, Recipient::Device);
const OUT_VENDOR_DEVICE: u8 = request_type(Direction::Out, RequestKind::Vendor, Recipient::Device);

/// Display frame period. Frame timer corrections come in milliseconds and
/// are split into whole frames plus a phase.
pub const MS_PER_FRAME: i32 = 40;

/// One entry of the display properties TLV list.
#[derive(Copy, Clone, Debug)]
pub struct DisplayProperty<'a> {
    pub kind: u8,
    pub data: &'a [u8],
}

/// Answer to FRAME_DRAW_STATUS: the display frame counter at the moment of
/// the most recent draw, and the USB frame number seen then.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
pub struct FramePhase {
    pub display_frame_counter: U16<LittleEndian>,
    pub usb_frame_counter: U16<LittleEndian>,
}

impl FramePhase {
    /// USB frame counter reported when no draw has been timed yet.
    pub const UNKNOWN: u16 = 0xFFFF;

    pub fn new(display_frame_counter: u16, usb_frame_counter: u16) -> Self {
        Self {
            display_frame_counter: U16::new(display_frame_counter),
            usb_frame_counter: U16::new(usb_frame_counter),
        }
    }
}

/// The rest of the device, as seen from endpoint 0.
pub trait DeviceBackend {
    /// Full length of a descriptor, or `None` if there's no such descriptor.
    fn descriptor_length(&self, kind: DescriptorType, index: u8) -> Option<u16>;

    /// Writes the first `out.len()` bytes of a descriptor.
    fn write_descriptor(&self, kind: DescriptorType, index: u8, out: &mut [u8]);

    fn self_powered(&self) -> bool {
        false
    }

    fn display_properties(&self) -> &[DisplayProperty<'_>];

    fn eeprom_size(&self) -> u16;

    fn eeprom_read(&self, offset: u16, out: &mut [u8]);

    fn eeprom_write(&mut self, offset: u16, data: &[u8]);

    fn frame_phase(&self) -> Option<FramePhase>;

    /// Shifts the frame timer by `ms` milliseconds, `|ms| <= 20`.
    fn correct_frame_phase(&mut self, ms: i8);

    /// Shifts the display frame counter. `false` if it can't be done.
    fn correct_frame_counter(&mut self, frames: i16) -> bool;

    /// Bytes still missing from the frame being pushed over endpoint 0,
    /// starting a new frame if there isn't one. `None` if no frame buffer is
    /// available.
    fn frame_remaining(&mut self) -> Option<usize>;

    /// Appends to the frame being pushed. Once it's complete the backend
    /// queues it for display and the next push starts a new one.
    fn frame_append(&mut self, data: &[u8]);

    /// Throws away a partially pushed frame. Nothing to do if the last push
    /// completed one.
    fn frame_abort(&mut self);

    /// A packet of the bulk frame stream. `false` stalls the stream.
    fn stream_frame_data(&mut self, data: &[u8]) -> bool;

    /// Drops any half-received stream frame and starts over.
    fn stream_reset(&mut self) {}

    fn start_of_frame(&mut self, _frame: u16) {}
}

/// USB device states (USB 2.0 section 9.1).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Attached,
    Powered,
    Default,
    Addressed,
    Configured,
    Suspended,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Hook {
    SetAddress,
    SetConfiguration,
    EepromWrite,
    PushFrame,
}

pub struct DisplayRequests<B> {
    backend: B,
    state: DeviceState,
    address: u8,
    configuration: u8,
}

impl<B: DeviceBackend> DisplayRequests<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: DeviceState::Powered,
            address: 0,
            configuration: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    fn set_state(&mut self, state: DeviceState) {
        if state != self.state {
            info!("device state {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    /// State to come back to from suspend.
    fn awake_state(&self) -> DeviceState {
        if self.configuration > 0 {
            DeviceState::Configured
        } else if self.address != 0 {
            DeviceState::Addressed
        } else {
            DeviceState::Default
        }
    }

    fn standard<H: UsbHardware>(
        &mut self,
        req: SetupPacket,
        xfer: &mut ControlTransfer<Hook>,
        bus: &mut Bus<'_, H>,
    ) {
        let Some(code) = StandardRequest::from_u8(req.request()) else {
            return;
        };
        let rt = req.request_type();
        match code {
            StandardRequest::GetStatus => {
                let status = match rt {
                    IN_STD_DEVICE => Some(u16::from(self.backend.self_powered())),
                    IN_STD_INTERFACE => Some(0),
                    IN_STD_ENDPOINT => Some(u16::from(
                        bus.endpoints.is_stalled(bus.hw, req.endpoint_number()),
                    )),
                    _ => None,
                };
                let Some(buf) = xfer.begin_data_in(bus.pool, 2) else {
                    return;
                };
                match status {
                    Some(s) => buf.copy_from_slice(&s.to_le_bytes()),
                    None => xfer.cancel(self, bus),
                }
            }
            StandardRequest::SetAddress => {
                if rt == OUT_STD_DEVICE && req.index() == 0 && req.length() == 0 {
                    // Takes effect once the status stage has gone out.
                    xfer.set_stage(Stage::HandshakeOut);
                    xfer.set_on_handshake(Hook::SetAddress);
                }
            }
            StandardRequest::GetConfiguration => {
                if rt == IN_STD_DEVICE {
                    if let Some(buf) = xfer.begin_data_in(bus.pool, 1) {
                        buf[0] = self.configuration;
                    }
                }
            }
            StandardRequest::SetConfiguration => {
                if rt == OUT_STD_DEVICE && usize::from(req.value()) < bus.configurations.len() {
                    xfer.set_stage(Stage::HandshakeOut);
                    xfer.set_on_handshake(Hook::SetConfiguration);
                }
            }
            StandardRequest::GetDescriptor => {
                if rt != IN_STD_DEVICE {
                    return;
                }
                let Some(kind) = DescriptorType::from_u8((req.value() >> 8) as u8) else {
                    return;
                };
                let index = req.value() as u8;
                let Some(total) = self.backend.descriptor_length(kind, index) else {
                    debug!("no {kind:?} descriptor {index}");
                    return;
                };
                let length = req.length().min(total);
                if let Some(buf) = xfer.begin_data_in(bus.pool, length) {
                    self.backend.write_descriptor(kind, index, buf);
                }
            }
            StandardRequest::SetFeature => {
                if rt == OUT_STD_ENDPOINT
                    && Feature::from_u16(req.value()) == Some(Feature::EndpointHalt)
                    && bus.endpoints.stall(bus.hw, req.endpoint_number())
                {
                    xfer.set_stage(Stage::HandshakeOut);
                }
            }
            StandardRequest::ClearFeature => {
                if rt == OUT_STD_ENDPOINT
                    && Feature::from_u16(req.value()) == Some(Feature::EndpointHalt)
                {
                    let ep = req.endpoint_number();
                    if ep == FRAME_ENDPOINT && self.configuration > 0 {
                        self.backend.stream_reset();
                    }
                    if bus.endpoints.clear_stall(bus.hw, ep) {
                        xfer.set_stage(Stage::HandshakeOut);
                    }
                }
            }
            other => trace!("unsupported standard request {other:?}"),
        }
    }

    fn vendor<H: UsbHardware>(
        &mut self,
        req: SetupPacket,
        xfer: &mut ControlTransfer<Hook>,
        bus: &mut Bus<'_, H>,
    ) {
        let Some(code) = VendorRequest::from_u8(req.request()) else {
            return;
        };
        match (req.request_type(), code) {
            (OUT_VENDOR_DEVICE, VendorRequest::PushFrame) => {
                let Some(remaining) = self.backend.frame_remaining() else {
                    debug!("no frame buffer for PUSH_FRAME");
                    return;
                };
                let length = usize::from(req.length()).min(remaining) as u16;
                if xfer.begin_data_out(bus.pool, length) {
                    xfer.set_on_data(Hook::PushFrame);
                    xfer.set_on_cancel(Hook::PushFrame);
                }
            }
            (OUT_VENDOR_DEVICE, VendorRequest::EepromWrite) => {
                let end = u32::from(req.index()) + u32::from(req.length());
                if end <= u32::from(self.backend.eeprom_size())
                    && xfer.begin_data_out(bus.pool, req.length())
                {
                    xfer.set_on_handshake(Hook::EepromWrite);
                }
            }
            (OUT_VENDOR_DEVICE, VendorRequest::FrameDrawSync) => {
                let (frames, ms) = split_correction(req.value() as i16);
                self.backend.correct_frame_phase(ms);
                if self.backend.correct_frame_counter(frames) {
                    xfer.set_stage(Stage::HandshakeOut);
                } else {
                    xfer.set_stage(Stage::Stall);
                }
            }
            (IN_VENDOR_DEVICE, VendorRequest::DisplayProperties) => {
                let props = self.backend.display_properties();
                let total = 2 + props.iter().map(|p| 2 + p.data.len()).sum::<usize>();
                let length = usize::from(req.length()).min(total);
                if length < 2 {
                    return;
                }
                if let Some(buf) = xfer.begin_data_in(bus.pool, length as u16) {
                    write_properties(total as u16, props, buf);
                }
            }
            (IN_VENDOR_DEVICE, VendorRequest::EepromRead) => {
                let size = self.backend.eeprom_size();
                let length = req.length().min(size);
                let offset = req.index();
                if u32::from(offset) + u32::from(length) > u32::from(size) {
                    return;
                }
                if let Some(buf) = xfer.begin_data_in(bus.pool, length) {
                    self.backend.eeprom_read(offset, buf);
                }
            }
            (IN_VENDOR_DEVICE, VendorRequest::FrameDrawStatus) => {
                const SIZE: usize = core::mem::size_of::<FramePhase>();
                if usize::from(req.length()) != SIZE {
                    return;
                }
                let phase = self
                    .backend
                    .frame_phase()
                    .unwrap_or_else(|| FramePhase::new(0, FramePhase::UNKNOWN));
                if let Some(buf) = xfer.begin_data_in(bus.pool, SIZE as u16) {
                    buf.copy_from_slice(phase.as_bytes());
                }
            }
            (rt, code) => trace!("vendor request {code:?} with request type {rt:#04x}"),
        }
    }
}

/// Splits a signed millisecond correction into whole frames, rounded to the
/// nearest, and the leftover milliseconds.
fn split_correction(ms: i16) -> (i16, i8) {
    let ms = i32::from(ms);
    let frames = (ms + MS_PER_FRAME / 2).div_euclid(MS_PER_FRAME);
    (frames as i16, (ms - frames * MS_PER_FRAME) as i8)
}

/// Length-prefixed TLV list, cut off wherever `out` ends.
fn write_properties(total: u16, props: &[DisplayProperty<'_>], out: &mut [u8]) {
    let mut bytes = total
        .to_le_bytes()
        .into_iter()
        .chain(props.iter().flat_map(|p| {
            [p.kind, p.data.len() as u8]
                .into_iter()
                .chain(p.data.iter().copied())
        }));
    for slot in out.iter_mut() {
        match bytes.next() {
            Some(b) => *slot = b,
            None => break,
        }
    }
}

impl<B: DeviceBackend, H: UsbHardware> RequestHandler<H> for DisplayRequests<B> {
    type Hook = Hook;

    fn setup(&mut self, xfer: &mut ControlTransfer<Hook>, bus: &mut Bus<'_, H>) {
        let req = *xfer.request();
        match req.kind() {
            RequestKind::Standard => self.standard(req, xfer, bus),
            RequestKind::Vendor => self.vendor(req, xfer, bus),
            kind => trace!("ignoring {kind:?} request {:#04x}", req.request()),
        }
    }

    fn data(&mut self, hook: Hook, xfer: &mut ControlTransfer<Hook>, bus: &mut Bus<'_, H>) {
        if hook == Hook::PushFrame && xfer.is_data_complete() {
            if let Some(buf) = xfer.data() {
                self.backend.frame_append(bus.pool.bytes(buf));
            }
        }
    }

    fn handshake(&mut self, hook: Hook, xfer: &mut ControlTransfer<Hook>, bus: &mut Bus<'_, H>) {
        let req = *xfer.request();
        match hook {
            Hook::SetAddress => {
                let address = (req.value() & 0x7F) as u8;
                bus.hw.set_address(address);
                self.address = address;
                debug!("address {address}");
                if address != 0 {
                    self.set_state(DeviceState::Addressed);
                }
            }
            Hook::SetConfiguration => {
                let index = req.value() as u8;
                if bus.load_configuration(usize::from(index)) {
                    self.configuration = index;
                    if index == 0 {
                        self.set_state(DeviceState::Default);
                    } else {
                        self.backend.stream_reset();
                        self.set_state(DeviceState::Configured);
                    }
                }
            }
            Hook::EepromWrite => {
                if let Some(buf) = xfer.take_data() {
                    self.backend.eeprom_write(req.index(), bus.pool.bytes(&buf));
                    bus.pool.release(buf);
                }
            }
            Hook::PushFrame => (),
        }
    }

    fn cancel(&mut self, hook: Hook, _xfer: &mut ControlTransfer<Hook>, _bus: &mut Bus<'_, H>) {
        if hook == Hook::PushFrame {
            self.backend.frame_abort();
        }
    }

    fn endpoint_out(&mut self, ep: u8, data: &[u8], _bus: &mut Bus<'_, H>) -> bool {
        ep == FRAME_ENDPOINT
            && self.state == DeviceState::Configured
            && self.backend.stream_frame_data(data)
    }

    fn bus_reset(&mut self, _bus: &mut Bus<'_, H>) {
        self.address = 0;
        self.configuration = 0;
        self.backend.frame_abort();
        self.backend.stream_reset();
        self.set_state(DeviceState::Default);
    }

    fn suspend(&mut self) {
        self.set_state(DeviceState::Suspended);
    }

    fn resume(&mut self) {
        self.set_state(self.awake_state());
    }

    fn start_of_frame(&mut self, frame: u16) {
        self.backend.start_of_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, EndpointConfig, DEVICE_CONFIGURATIONS};
    use crate::driver::{Driver, Event};
    use crate::mock::MockHardware;
    use crate::pool::BufferPool;
    use crate::queue::EndpointQueue;
    use proptest::prelude::*;

    const FRAME_SIZE: usize = 12;

    struct Panel {
        device: Vec<u8>,
        eeprom: [u8; 256],
        eeprom_writes: usize,
        frame: Option<Vec<u8>>,
        frames: Vec<Vec<u8>>,
        aborts: usize,
        stream: Vec<u8>,
        accept_stream: bool,
        phase: Option<FramePhase>,
        corrections: Vec<(i16, i8)>,
        accept_counter: bool,
        pending_ms: i8,
    }

    impl Panel {
        fn new() -> Self {
            Self {
                device: (0..18).collect(),
                eeprom: [0xEE; 256],
                eeprom_writes: 0,
                frame: None,
                frames: Vec::new(),
                aborts: 0,
                stream: Vec::new(),
                accept_stream: true,
                phase: None,
                corrections: Vec::new(),
                accept_counter: true,
                pending_ms: 0,
            }
        }
    }

    const PROPS: [DisplayProperty<'static>; 1] = [DisplayProperty {
        kind: 7,
        data: &[1, 2, 3, 4],
    }];

    impl DeviceBackend for Panel {
        fn descriptor_length(&self, kind: DescriptorType, index: u8) -> Option<u16> {
            match (kind, index) {
                (DescriptorType::Device, 0) => Some(self.device.len() as u16),
                _ => None,
            }
        }

        fn write_descriptor(&self, _kind: DescriptorType, _index: u8, out: &mut [u8]) {
            let n = out.len();
            out.copy_from_slice(&self.device[..n]);
        }

        fn display_properties(&self) -> &[DisplayProperty<'_>] {
            &PROPS
        }

        fn eeprom_size(&self) -> u16 {
            self.eeprom.len() as u16
        }

        fn eeprom_read(&self, offset: u16, out: &mut [u8]) {
            let o = usize::from(offset);
            out.copy_from_slice(&self.eeprom[o..o + out.len()]);
        }

        fn eeprom_write(&mut self, offset: u16, data: &[u8]) {
            let o = usize::from(offset);
            self.eeprom[o..o + data.len()].copy_from_slice(data);
            self.eeprom_writes += 1;
        }

        fn frame_phase(&self) -> Option<FramePhase> {
            self.phase
        }

        fn correct_frame_phase(&mut self, ms: i8) {
            self.pending_ms = ms;
        }

        fn correct_frame_counter(&mut self, frames: i16) -> bool {
            self.corrections.push((frames, self.pending_ms));
            self.accept_counter
        }

        fn frame_remaining(&mut self) -> Option<usize> {
            let frame = self.frame.get_or_insert_with(Vec::new);
            Some(FRAME_SIZE - frame.len())
        }

        fn frame_append(&mut self, data: &[u8]) {
            if let Some(frame) = self.frame.as_mut() {
                frame.extend_from_slice(data);
                if frame.len() == FRAME_SIZE {
                    self.frames.extend(self.frame.take());
                }
            }
        }

        fn frame_abort(&mut self) {
            if self.frame.take().is_some() {
                self.aborts += 1;
            }
        }

        fn stream_frame_data(&mut self, data: &[u8]) -> bool {
            self.stream.extend_from_slice(data);
            self.accept_stream
        }

        fn stream_reset(&mut self) {
            self.stream.clear();
        }
    }

    static SMALL_EP0: [Configuration; 2] = [
        Configuration {
            endpoints: &[EndpointConfig::control(0, 8)],
        },
        Configuration {
            endpoints: &[
                EndpointConfig::control(0, 8),
                EndpointConfig::bulk_out(FRAME_ENDPOINT, 64),
            ],
        },
    ];

    type Device = Driver<MockHardware<1>, DisplayRequests<Panel>>;

    fn device() -> Device {
        let mut d = Driver::new(
            MockHardware::new(),
            DisplayRequests::new(Panel::new()),
            &SMALL_EP0,
        );
        assert!(d.start());
        d.hw_mut().clear_log();
        d
    }

    fn setup(rt: u8, request: u8, value: u16, index: u16, length: u16) -> Event<'static> {
        let mut raw = [0; 8];
        raw.copy_from_slice(SetupPacket::new(rt, request, value, index, length).as_bytes());
        Event::Setup(raw)
    }

    fn in_complete(length: u16) -> Event<'static> {
        Event::InComplete { endpoint: 0, length }
    }

    const STATUS_OUT: Event<'static> = Event::OutComplete {
        endpoint: 0,
        data: &[],
        data1: true,
    };

    /// Runs an IN request through to the end and returns what was sent.
    fn read(d: &mut Device, rt: u8, request: u8, value: u16, index: u16, length: u16) -> Option<Vec<u8>> {
        d.hw_mut().clear_log();
        d.handle(setup(rt, request, value, index, length));
        if d.transfer().stage() != Stage::DataIn {
            return None;
        }
        let mut sent = Vec::new();
        while d.transfer().stage() == Stage::DataIn {
            let (packet, len) = {
                let armed = d.hw().armed_on(0, Direction::In);
                let last = armed.last()?;
                (last.payload.clone(), last.desc.length())
            };
            sent.extend(packet);
            d.handle(in_complete(len));
        }
        assert_eq!(d.transfer().stage(), Stage::HandshakeIn);
        d.handle(STATUS_OUT);
        assert_eq!(d.transfer().stage(), Stage::Idle);
        Some(sent)
    }

    /// Runs an OUT request with `data` through to the end.
    fn write(d: &mut Device, rt: u8, request: u8, value: u16, index: u16, data: &[u8]) -> bool {
        d.handle(setup(rt, request, value, index, data.len() as u16));
        for chunk in data.chunks(8) {
            if d.transfer().stage() != Stage::DataOut {
                return false;
            }
            d.handle(Event::OutComplete { endpoint: 0, data: chunk, data1: true });
        }
        if d.transfer().stage() != Stage::HandshakeOut {
            return false;
        }
        d.handle(in_complete(0));
        d.transfer().stage() == Stage::Idle
    }

    #[test]
    fn set_address_applies_after_status_stage() {
        let mut d = device();
        d.handle(setup(OUT_STD_DEVICE, StandardRequest::SetAddress as u8, 5, 0, 0));
        assert_eq!(d.transfer().stage(), Stage::HandshakeOut);
        assert!(d.hw().address_log.is_empty());
        assert_eq!(d.handler().address(), 0);

        d.handle(in_complete(0));
        assert_eq!(d.hw().address_log, vec![5]);
        assert_eq!(d.handler().state(), DeviceState::Addressed);
        assert_eq!(d.transfer().stage(), Stage::Idle);
    }

    #[test]
    fn set_address_with_wrong_shape_stalls() {
        let mut d = device();
        d.handle(setup(OUT_STD_DEVICE, StandardRequest::SetAddress as u8, 5, 1, 0));
        assert_eq!(d.transfer().stage(), Stage::Stall);
        assert!(d.hw().stalled[0]);
        assert!(d.hw().address_log.is_empty());
    }

    #[test]
    fn short_properties_end_with_zlp() {
        // Header (2) plus one 4 byte item (2 + 4) is exactly one 8 byte packet.
        let mut d = device();
        let sent = read(&mut d, IN_VENDOR_DEVICE, VendorRequest::DisplayProperties as u8, 0, 0, 10);
        assert_eq!(sent, Some(vec![8, 0, 7, 4, 1, 2, 3, 4]));
        let armed = d.hw().armed_on(0, Direction::In);
        assert_eq!(armed.len(), 2);
        assert_eq!(armed[1].desc.length(), 0);
        assert_eq!(d.pool().outstanding(), 0);
    }

    #[test]
    fn truncated_properties() {
        let mut d = device();
        let sent = read(&mut d, IN_VENDOR_DEVICE, VendorRequest::DisplayProperties as u8, 0, 0, 3);
        assert_eq!(sent, Some(vec![8, 0, 7]));
        let sent = read(&mut d, IN_VENDOR_DEVICE, VendorRequest::DisplayProperties as u8, 0, 0, 1);
        assert_eq!(sent, None);
        assert!(d.hw().stalled[0]);
    }

    #[test]
    fn stall_then_recover() {
        let mut hw = MockHardware::<1>::new();
        let mut endpoints = EndpointQueue::new();
        let mut pool = BufferPool::new();
        let mut bus = Bus {
            hw: &mut hw,
            endpoints: &mut endpoints,
            pool: &mut pool,
            configurations: &SMALL_EP0,
        };
        let mut handler = DisplayRequests::new(Panel::new());
        let mut xfer = ControlTransfer::new(SetupPacket::new(IN_VENDOR_DEVICE, 0x42, 0, 0, 4));
        handler.setup(&mut xfer, &mut bus);
        assert_eq!(xfer.stage(), Stage::Setup);

        let mut d = device();
        d.handle(setup(IN_VENDOR_DEVICE, 0x42, 0, 0, 4));
        assert!(d.hw().stalled[0]);
        d.handle(setup(IN_STD_DEVICE, StandardRequest::GetConfiguration as u8, 0, 0, 1));
        assert_eq!(d.transfer().stage(), Stage::DataIn);
        assert!(!d.hw().stalled[0]);
        assert_eq!(d.transfer().data_length(), 1);
        assert_eq!(d.pool().outstanding(), 1);
    }

    #[test]
    fn setup_cancels_partial_eeprom_write() {
        let mut d = device();
        d.handle(setup(OUT_VENDOR_DEVICE, VendorRequest::EepromWrite as u8, 0, 16, 100));
        assert_eq!(d.transfer().stage(), Stage::DataOut);
        for _ in 0..5 {
            d.handle(Event::OutComplete { endpoint: 0, data: &[0xAB; 8], data1: true });
        }
        assert_eq!(d.transfer().data_done(), 40);
        assert_eq!(d.pool().outstanding(), 1);

        let sent = read(&mut d, IN_STD_DEVICE, StandardRequest::GetConfiguration as u8, 0, 0, 1);
        assert_eq!(sent, Some(vec![0]));
        assert_eq!(d.pool().outstanding(), 0);
        assert_eq!(d.handler().backend().eeprom_writes, 0);
        assert!(d.handler().backend().eeprom[16..56].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn eeprom_round_trip_and_bounds() {
        let mut d = device();
        let data: Vec<u8> = (0..20).collect();
        assert!(write(&mut d, OUT_VENDOR_DEVICE, VendorRequest::EepromWrite as u8, 0, 100, &data));
        assert_eq!(d.handler().backend().eeprom_writes, 1);
        let back = read(&mut d, IN_VENDOR_DEVICE, VendorRequest::EepromRead as u8, 0, 100, 20);
        assert_eq!(back, Some(data));

        // Past the end.
        assert!(!write(&mut d, OUT_VENDOR_DEVICE, VendorRequest::EepromWrite as u8, 0, 250, &[0; 8]));
        assert_eq!(read(&mut d, IN_VENDOR_DEVICE, VendorRequest::EepromRead as u8, 0, 250, 8), None);
        assert_eq!(d.handler().backend().eeprom_writes, 1);
        assert_eq!(d.pool().outstanding(), 0);
    }

    #[test]
    fn configuration_lifecycle() {
        let mut d = device();
        assert!(write(&mut d, OUT_STD_DEVICE, StandardRequest::SetConfiguration as u8, 1, 0, &[]));
        assert_eq!(d.handler().state(), DeviceState::Configured);
        assert!(d.hw().enabled[1].is_some());
        let cfg = read(&mut d, IN_STD_DEVICE, StandardRequest::GetConfiguration as u8, 0, 0, 1);
        assert_eq!(cfg, Some(vec![1]));

        d.handle(setup(OUT_STD_DEVICE, StandardRequest::SetConfiguration as u8, 2, 0, 0));
        assert_eq!(d.transfer().stage(), Stage::Stall);

        assert!(write(&mut d, OUT_STD_DEVICE, StandardRequest::SetConfiguration as u8, 0, 0, &[]));
        assert_eq!(d.handler().state(), DeviceState::Default);
        assert!(d.hw().enabled[1].is_none());
    }

    #[test]
    fn endpoint_halt_features() {
        let mut d = device();
        assert!(write(&mut d, OUT_STD_DEVICE, StandardRequest::SetConfiguration as u8, 1, 0, &[]));

        let status = |d: &mut Device| {
            read(d, IN_STD_ENDPOINT, StandardRequest::GetStatus as u8, 0, 0x01, 2)
        };
        assert_eq!(status(&mut d), Some(vec![0, 0]));
        assert!(write(&mut d, OUT_STD_ENDPOINT, StandardRequest::SetFeature as u8, 0, 0x01, &[]));
        assert_eq!(status(&mut d), Some(vec![1, 0]));

        d.hw_mut().clear_log();
        assert!(write(&mut d, OUT_STD_ENDPOINT, StandardRequest::ClearFeature as u8, 0, 0x01, &[]));
        let rearmed = d.hw().armed_on(1, Direction::Out);
        assert_eq!(rearmed.len(), 1);
        assert_eq!(rearmed[0].desc.data_toggle(), crate::tracker::DataToggle::Data0);
        assert_eq!(status(&mut d), Some(vec![0, 0]));

        // Unconfigured endpoint.
        d.handle(setup(OUT_STD_ENDPOINT, StandardRequest::SetFeature as u8, 0, 0x03, 0));
        assert_eq!(d.transfer().stage(), Stage::Stall);
    }

    #[test]
    fn get_status_recipients() {
        let mut d = device();
        let dev = read(&mut d, IN_STD_DEVICE, StandardRequest::GetStatus as u8, 0, 0, 2);
        assert_eq!(dev, Some(vec![0, 0]));
        let other = request_type(Direction::In, RequestKind::Standard, Recipient::Other);
        assert_eq!(read(&mut d, other, StandardRequest::GetStatus as u8, 0, 0, 2), None);
        assert!(d.hw().stalled[0]);
        assert_eq!(d.pool().outstanding(), 0);
    }

    #[test]
    fn device_descriptor_is_clipped_to_request() {
        let mut d = device();
        let full = read(&mut d, IN_STD_DEVICE, StandardRequest::GetDescriptor as u8, 0x0100, 0, 64);
        assert_eq!(full, Some((0..18).collect()));
        let head = read(&mut d, IN_STD_DEVICE, StandardRequest::GetDescriptor as u8, 0x0100, 0, 8);
        assert_eq!(head, Some((0..8).collect()));
        let missing = read(&mut d, IN_STD_DEVICE, StandardRequest::GetDescriptor as u8, 0x0305, 0, 8);
        assert_eq!(missing, None);
    }

    #[test]
    fn zero_length_descriptor_read_is_acknowledged() {
        let mut d = device();
        d.handle(setup(IN_STD_DEVICE, StandardRequest::GetDescriptor as u8, 0x0100, 0, 0));
        assert_eq!(d.transfer().stage(), Stage::HandshakeOut);
        let armed = d.hw().armed_on(0, Direction::In);
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].desc.length(), 0);
        assert!(!d.hw().stalled[0]);

        d.handle(in_complete(0));
        assert_eq!(d.transfer().stage(), Stage::Idle);
        assert_eq!(d.pool().outstanding(), 0);
    }

    #[test]
    fn get_status_honors_a_short_request() {
        let mut d = device();
        let one = read(&mut d, IN_STD_DEVICE, StandardRequest::GetStatus as u8, 0, 0, 1);
        assert_eq!(one, Some(vec![0]));
        let config = read(&mut d, IN_STD_DEVICE, StandardRequest::GetConfiguration as u8, 0, 0, 0);
        assert_eq!(config, None);
        assert_eq!(d.transfer().stage(), Stage::HandshakeOut);
        d.handle(in_complete(0));
        assert_eq!(d.transfer().stage(), Stage::Idle);
        assert_eq!(d.pool().outstanding(), 0);
    }

    #[test]
    fn frame_draw_status() {
        let mut d = device();
        let unknown = read(&mut d, IN_VENDOR_DEVICE, VendorRequest::FrameDrawStatus as u8, 0, 0, 4);
        assert_eq!(unknown, Some(vec![0, 0, 0xFF, 0xFF]));

        d.handler_mut().backend_mut().phase = Some(FramePhase::new(0x1234, 0x0567));
        let known = read(&mut d, IN_VENDOR_DEVICE, VendorRequest::FrameDrawStatus as u8, 0, 0, 4);
        assert_eq!(known, Some(vec![0x34, 0x12, 0x67, 0x05]));

        assert_eq!(read(&mut d, IN_VENDOR_DEVICE, VendorRequest::FrameDrawStatus as u8, 0, 0, 3), None);
    }

    #[test]
    fn frame_draw_sync_splits_correction() {
        assert_eq!(split_correction(0), (0, 0));
        assert_eq!(split_correction(65), (2, -15));
        assert_eq!(split_correction(-30), (-1, 10));
        assert_eq!(split_correction(20), (1, -20));
        assert_eq!(split_correction(19), (0, 19));

        let mut d = device();
        assert!(write(&mut d, OUT_VENDOR_DEVICE, VendorRequest::FrameDrawSync as u8, 65, 0, &[]));
        assert_eq!(d.handler().backend().corrections, vec![(2, -15)]);

        d.handler_mut().backend_mut().accept_counter = false;
        d.handle(setup(OUT_VENDOR_DEVICE, VendorRequest::FrameDrawSync as u8, (-30i16) as u16, 0, 0));
        assert_eq!(d.transfer().stage(), Stage::Stall);
        assert!(d.hw().stalled[0]);
    }

    #[test]
    fn push_frame_in_pieces() {
        let mut d = device();
        assert!(write(&mut d, OUT_VENDOR_DEVICE, VendorRequest::PushFrame as u8, 0, 0, &[1; 8]));
        assert!(d.handler().backend().frames.is_empty());
        // Asking for more than is left of the frame gets clipped.
        d.handle(setup(OUT_VENDOR_DEVICE, VendorRequest::PushFrame as u8, 0, 0, 8));
        assert_eq!(d.transfer().data_length(), 4);
        d.handle(Event::OutComplete { endpoint: 0, data: &[2; 4], data1: true });
        d.handle(in_complete(0));
        assert_eq!(d.handler().backend().frames, vec![[1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2].to_vec()]);
        assert_eq!(d.pool().outstanding(), 0);
    }

    #[test]
    fn aborted_push_frame_drops_frame() {
        let mut d = device();
        d.handle(setup(OUT_VENDOR_DEVICE, VendorRequest::PushFrame as u8, 0, 0, 12));
        d.handle(Event::OutComplete { endpoint: 0, data: &[3; 8], data1: true });
        d.handle(Event::BusReset);
        assert_eq!(d.handler().backend().aborts, 1);
        assert!(d.handler().backend().frames.is_empty());
        assert_eq!(d.handler().state(), DeviceState::Default);
        assert_eq!(d.pool().outstanding(), 0);
    }

    #[test]
    fn bulk_frame_stream() {
        let mut d = device();
        d.handle(Event::OutComplete { endpoint: 1, data: &[1; 64], data1: false });
        assert!(d.handler().backend().stream.is_empty());

        assert!(write(&mut d, OUT_STD_DEVICE, StandardRequest::SetConfiguration as u8, 1, 0, &[]));
        d.hw_mut().clear_log();
        d.handle(Event::OutComplete { endpoint: 1, data: &[1; 64], data1: false });
        assert_eq!(d.handler().backend().stream.len(), 64);
        assert_eq!(d.hw().armed_on(1, Direction::Out).len(), 1);

        d.handler_mut().backend_mut().accept_stream = false;
        d.handle(Event::OutComplete { endpoint: 1, data: &[1; 64], data1: true });
        assert!(d.hw().stalled[1]);
    }

    #[test]
    fn suspend_and_resume() {
        let mut d = device();
        assert!(write(&mut d, OUT_STD_DEVICE, StandardRequest::SetAddress as u8, 9, 0, &[]));
        d.handle(Event::Suspend);
        assert_eq!(d.handler().state(), DeviceState::Suspended);
        d.handle(Event::Resume);
        assert_eq!(d.handler().state(), DeviceState::Addressed);

        assert!(write(&mut d, OUT_STD_DEVICE, StandardRequest::SetConfiguration as u8, 1, 0, &[]));
        d.handle(Event::Suspend);
        d.handle(Event::Resume);
        assert_eq!(d.handler().state(), DeviceState::Configured);
    }

    #[test]
    fn default_table_enumerates() {
        let mut d = Driver::new(
            MockHardware::<2>::new(),
            DisplayRequests::new(Panel::new()),
            &DEVICE_CONFIGURATIONS,
        );
        assert!(d.start());
        d.handle(setup(IN_STD_DEVICE, StandardRequest::GetDescriptor as u8, 0x0100, 0, 64));
        let armed = d.hw().armed_on(0, Direction::In);
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].payload, (0..18).collect::<Vec<u8>>());
    }

    #[derive(Clone, Debug)]
    enum Step {
        Setup(u8, u8, u16, u16, u16),
        In(u16),
        Out(usize, bool),
        Reset,
    }

    fn req(rt: u8, request: u8, value: u16, index: u16, length: u16) -> Step {
        Step::Setup(rt, request, value, index, length)
    }

    fn step() -> impl Strategy<Value = Step> {
        let setups = prop_oneof![
            Just(req(IN_STD_DEVICE, StandardRequest::GetConfiguration as u8, 0, 0, 1)),
            Just(req(IN_STD_DEVICE, StandardRequest::GetDescriptor as u8, 0x0100, 0, 64)),
            Just(req(OUT_STD_DEVICE, StandardRequest::SetAddress as u8, 3, 0, 0)),
            Just(req(OUT_VENDOR_DEVICE, VendorRequest::EepromWrite as u8, 0, 0, 20)),
            Just(req(OUT_VENDOR_DEVICE, VendorRequest::PushFrame as u8, 0, 0, 12)),
            Just(req(IN_VENDOR_DEVICE, VendorRequest::DisplayProperties as u8, 0, 0, 10)),
            Just(req(IN_VENDOR_DEVICE, 0x42, 0, 0, 0)),
        ];
        prop_oneof![
            setups,
            (0u16..=8).prop_map(Step::In),
            (0usize..=8, any::<bool>()).prop_map(|(n, d1)| Step::Out(n, d1)),
            Just(Step::Reset),
        ]
    }

    proptest! {
        #[test]
        fn data_buffers_never_leak(steps in proptest::collection::vec(step(), 0..60)) {
            let mut d = device();
            let payload = [0x5A; 8];
            for s in steps {
                match s {
                    Step::Setup(rt, r, v, i, l) => d.handle(setup(rt, r, v, i, l)),
                    Step::In(n) => d.handle(in_complete(n)),
                    Step::Out(n, data1) => d.handle(Event::OutComplete {
                        endpoint: 0,
                        data: &payload[..n],
                        data1,
                    }),
                    Step::Reset => d.handle(Event::BusReset),
                }
                prop_assert!(d.pool().outstanding() <= 1);
                if matches!(d.transfer().stage(), Stage::Idle | Stage::Stall | Stage::HandshakeIn) {
                    prop_assert_eq!(d.pool().outstanding(), 0);
                }
                for dir in [Direction::In, Direction::Out] {
                    let s = d.endpoints().state(0, dir).unwrap();
                    prop_assert!(s.queued() <= s.banks());
                }
            }
            d.handle(Event::BusReset);
            prop_assert_eq!(d.pool().outstanding(), 0);
        }
    }
}
