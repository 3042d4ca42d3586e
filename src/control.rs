// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control transfer state machine.
//!
//! A control transfer goes through up to three stages:
//!
//! ```text
//!           ┌──> DataIn ──> HandshakeIn ────────────────────┐
//! Setup ────┼──> DataOut ─> HandshakeOut ─> PostHandshake ─┴─> Idle
//!           └───────────────> HandshakeOut ─────────────────┘
//! ```
//!
//! plus `Stall`, which any stage can fall into and which lasts until the next
//! SETUP. The [`RequestHandler`] decides where a transfer goes from `Setup`;
//! the [`driver`](crate::driver) moves it along as tokens complete.
//!
//! Hooks are plain tags, not function pointers. A handler picks a `Hook`
//! value when it routes a request, and gets the same value back when the
//! transfer reaches the corresponding point, along with the transfer itself
//! and the [`Bus`].

use core::fmt::Debug;
use core::ops::Range;

use log::{debug, trace, warn};

use crate::config::{Configuration, MAX_ENDPOINTS};
use crate::hal::UsbHardware;
use crate::pool::{BufferPool, DataBuffer};
use crate::queue::EndpointQueue;
use crate::setup::SetupPacket;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// No transfer in progress.
    Idle,
    /// Request handler is looking at the SETUP packet.
    Setup,
    /// Endpoint 0 answers with STALL until the next SETUP.
    Stall,
    /// Device is sending the data stage.
    DataIn,
    /// Host is sending the data stage.
    DataOut,
    /// Waiting for the host's zero-length status packet.
    HandshakeIn,
    /// Waiting for our zero-length status packet to go out.
    HandshakeOut,
    /// Status stage done, handshake hook running.
    PostHandshake,
}

/// Progress of the zero-length packet that ends an IN data stage which is
/// shorter than requested but a whole number of packets long.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtraZlp {
    NotNeeded,
    Owed,
    Queued,
    Sent,
}

/// The one transfer in flight on the control endpoint.
#[derive(Debug)]
pub struct ControlTransfer<K> {
    stage: Stage,
    request: SetupPacket,
    data: Option<DataBuffer>,
    data_length: u16,
    data_done: u16,
    last_chunk: u16,
    /// Bytes handed to the hardware so far; runs ahead of `data_done`.
    queued: u16,
    zlp: ExtraZlp,
    on_data: Option<K>,
    on_handshake: Option<K>,
    on_cancel: Option<K>,
}

impl<K: Copy + Debug> ControlTransfer<K> {
    /// A fresh transfer for `request`, in `Setup`.
    pub fn new(request: SetupPacket) -> Self {
        Self {
            stage: Stage::Setup,
            request,
            data: None,
            data_length: 0,
            data_done: 0,
            last_chunk: 0,
            queued: 0,
            zlp: ExtraZlp::NotNeeded,
            on_data: None,
            on_handshake: None,
            on_cancel: None,
        }
    }

    pub fn idle() -> Self {
        Self {
            stage: Stage::Idle,
            ..Self::new(SetupPacket::new(0, 0, 0, 0, 0))
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn set_stage(&mut self, stage: Stage) {
        trace!("control stage {:?} -> {stage:?}", self.stage);
        self.stage = stage;
    }

    pub fn request(&self) -> &SetupPacket {
        &self.request
    }

    pub fn data(&self) -> Option<&DataBuffer> {
        self.data.as_ref()
    }

    /// Takes ownership of the data buffer away from the transfer.
    pub fn take_data(&mut self) -> Option<DataBuffer> {
        self.data.take()
    }

    pub fn data_length(&self) -> u16 {
        self.data_length
    }

    pub fn data_done(&self) -> u16 {
        self.data_done
    }

    /// Byte range of the data buffer filled or sent by the latest chunk.
    pub fn last_chunk(&self) -> Range<usize> {
        let end = usize::from(self.data_done);
        end - usize::from(self.last_chunk)..end
    }

    pub fn extra_zlp(&self) -> ExtraZlp {
        self.zlp
    }

    /// All data moved, and the extra ZLP too if one was owed.
    pub fn is_data_complete(&self) -> bool {
        self.data_done == self.data_length
            && matches!(self.zlp, ExtraZlp::NotNeeded | ExtraZlp::Sent)
    }

    pub fn set_on_data(&mut self, hook: K) {
        self.on_data = Some(hook);
    }

    pub fn set_on_handshake(&mut self, hook: K) {
        self.on_handshake = Some(hook);
    }

    pub fn set_on_cancel(&mut self, hook: K) {
        self.on_cancel = Some(hook);
    }

    fn begin_data(&mut self, pool: &mut BufferPool, length: u16, stage: Stage) -> bool {
        if let Some(old) = self.data.take() {
            warn!("control data stage set up twice, dropping the first buffer");
            pool.release(old);
        }
        match pool.alloc(usize::from(length)) {
            Some(buf) => {
                self.data = Some(buf);
                self.data_length = length;
                self.data_done = 0;
                self.queued = 0;
                self.set_stage(stage);
                true
            }
            None => {
                debug!("no pool memory for a {length} byte data stage");
                false
            }
        }
    }

    /// Allocates `length` bytes and routes the transfer to `DataIn`. Returns
    /// the buffer for the handler to fill, or `None` (stage untouched) if
    /// the pool is exhausted.
    ///
    /// The whole buffer is the handler's to fill, but no more than the
    /// host's `wLength` of it is ever sent.
    pub fn begin_data_in<'p>(
        &mut self,
        pool: &'p mut BufferPool,
        length: u16,
    ) -> Option<&'p mut [u8]> {
        if !self.begin_data(pool, length, Stage::DataIn) {
            return None;
        }
        self.data_length = length.min(self.request.length());
        let buf = self.data.as_ref()?;
        Some(pool.bytes_mut(buf))
    }

    /// Allocates `length` bytes to receive into and routes the transfer to
    /// `DataOut`. `false` (stage untouched) if the pool is exhausted.
    pub fn begin_data_out(&mut self, pool: &mut BufferPool, length: u16) -> bool {
        self.begin_data(pool, length, Stage::DataOut)
    }

    /// Gives the data buffer back to the pool, if the transfer still owns it.
    pub fn release_data(&mut self, pool: &mut BufferPool) {
        if let Some(buf) = self.data.take() {
            pool.release(buf);
        }
    }

    /// Decides whether the IN data stage must be terminated with an extra ZLP
    /// on an endpoint with packets of `max_packet` bytes.
    pub(crate) fn plan_extra_zlp(&mut self, max_packet: u16) {
        let short = self.data_length < self.request.length();
        let aligned = max_packet != 0 && self.data_length % max_packet == 0;
        self.zlp = if short && aligned {
            ExtraZlp::Owed
        } else {
            ExtraZlp::NotNeeded
        };
    }

    /// Bytes of the IN data stage not handed to the hardware yet.
    pub(crate) fn unqueued(&self) -> Range<usize> {
        usize::from(self.queued)..usize::from(self.data_length)
    }

    pub(crate) fn mark_queued(&mut self, length: u16) {
        self.queued = self.queued.saturating_add(length).min(self.data_length);
    }

    pub(crate) fn set_extra_zlp(&mut self, zlp: ExtraZlp) {
        self.zlp = zlp;
    }

    /// Accounts for `length` more bytes moved in the data stage. The data
    /// hook runs first; after it, a complete `DataIn` releases its buffer and
    /// heads for `HandshakeIn`, and a complete `DataOut` for `HandshakeOut`.
    pub fn mark_data_done<H, R>(&mut self, length: u16, handler: &mut R, bus: &mut Bus<'_, H>)
    where
        H: UsbHardware,
        R: RequestHandler<H, Hook = K> + ?Sized,
    {
        let left = self.data_length - self.data_done;
        self.last_chunk = length.min(left);
        self.data_done += self.last_chunk;

        if let Some(hook) = self.on_data {
            handler.data(hook, self, bus);
        }
        if self.is_data_complete() {
            match self.stage {
                Stage::DataIn => {
                    self.release_data(bus.pool);
                    self.set_stage(Stage::HandshakeIn);
                }
                Stage::DataOut => self.set_stage(Stage::HandshakeOut),
                _ => (),
            }
        }
    }

    /// Status stage is over. Runs the handshake hook, sweeps up any data the
    /// hook left behind, and goes `Idle`.
    pub fn complete_handshake<H, R>(&mut self, handler: &mut R, bus: &mut Bus<'_, H>)
    where
        H: UsbHardware,
        R: RequestHandler<H, Hook = K> + ?Sized,
    {
        if let Some(hook) = self.on_handshake.take() {
            if self.stage == Stage::HandshakeOut {
                self.set_stage(Stage::PostHandshake);
            }
            handler.handshake(hook, self, bus);
        }
        self.release_data(bus.pool);
        self.on_cancel = None;
        self.set_stage(Stage::Idle);
    }

    /// Aborts the transfer: runs the cancel hook, makes sure the data buffer
    /// is back in the pool, and leaves the transfer in `Stall`.
    pub fn cancel<H, R>(&mut self, handler: &mut R, bus: &mut Bus<'_, H>)
    where
        H: UsbHardware,
        R: RequestHandler<H, Hook = K> + ?Sized,
    {
        debug!("cancelling control transfer in {:?}", self.stage);
        if let Some(hook) = self.on_cancel.take() {
            handler.cancel(hook, self, bus);
        }
        self.release_data(bus.pool);
        self.on_data = None;
        self.on_handshake = None;
        self.set_stage(Stage::Stall);
    }

    /// The host started the status stage before taking all of the IN data.
    /// That's the host's prerogative; drop the rest and finish normally.
    pub fn end_data_in_early<H, R>(&mut self, handler: &mut R, bus: &mut Bus<'_, H>)
    where
        H: UsbHardware,
        R: RequestHandler<H, Hook = K> + ?Sized,
    {
        debug!(
            "host ended IN data stage at {}/{} bytes",
            self.data_done, self.data_length
        );
        if let Some(hook) = self.on_cancel.take() {
            handler.cancel(hook, self, bus);
        }
        self.release_data(bus.pool);
        self.set_stage(Stage::HandshakeIn);
        self.complete_handshake(handler, bus);
    }
}

/// Everything a request handler may touch besides the transfer itself.
pub struct Bus<'a, H> {
    pub hw: &'a mut H,
    pub endpoints: &'a mut EndpointQueue,
    pub pool: &'a mut BufferPool,
    pub configurations: &'static [Configuration],
}

impl<H: UsbHardware> Bus<'_, H> {
    /// Brings up the endpoints of configuration `index` and tears down any
    /// that it doesn't use. Endpoints already configured identically are
    /// left running.
    pub fn load_configuration(&mut self, index: usize) -> bool {
        let Some(config) = self.configurations.get(index) else {
            warn!("no configuration {index}");
            return false;
        };
        for ep in 0..MAX_ENDPOINTS as u8 {
            if !config.endpoints.iter().any(|c| c.number == ep) {
                self.endpoints.deconfigure(self.hw, ep);
            }
        }
        for ep in config.endpoints {
            if self.endpoints.config(ep.number) == Ok(ep) {
                continue;
            }
            if let Err(e) = self.endpoints.configure(self.hw, ep) {
                warn!("configuration {index}: {e}");
                return false;
            }
        }
        debug!("configuration {index} loaded");
        true
    }
}

/// What a device answers to, and what it does when its transfers progress.
///
/// `setup` must either route the transfer (to `DataIn` or `DataOut` with a
/// data buffer, or straight to `HandshakeOut`) or leave it in `Setup`, which
/// stalls the request. The remaining methods are called back with whatever
/// hook value `setup` registered.
pub trait RequestHandler<H: UsbHardware> {
    type Hook: Copy + Debug;

    fn setup(&mut self, xfer: &mut ControlTransfer<Self::Hook>, bus: &mut Bus<'_, H>);

    /// A chunk of the data stage moved; see [`ControlTransfer::last_chunk`].
    fn data(
        &mut self,
        _hook: Self::Hook,
        _xfer: &mut ControlTransfer<Self::Hook>,
        _bus: &mut Bus<'_, H>,
    ) {
    }

    /// The status stage has been acknowledged.
    fn handshake(
        &mut self,
        _hook: Self::Hook,
        _xfer: &mut ControlTransfer<Self::Hook>,
        _bus: &mut Bus<'_, H>,
    ) {
    }

    /// The transfer is being abandoned.
    fn cancel(
        &mut self,
        _hook: Self::Hook,
        _xfer: &mut ControlTransfer<Self::Hook>,
        _bus: &mut Bus<'_, H>,
    ) {
    }

    /// A packet arrived on data endpoint `ep`. Return `false` to stall it.
    fn endpoint_out(&mut self, _ep: u8, _data: &[u8], _bus: &mut Bus<'_, H>) -> bool {
        false
    }

    fn bus_reset(&mut self, _bus: &mut Bus<'_, H>) {}

    fn suspend(&mut self) {}

    fn resume(&mut self) {}

    fn start_of_frame(&mut self, _frame: u16) {}
}
