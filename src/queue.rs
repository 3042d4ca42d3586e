// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queueing buffers on endpoints.
//!
//! ```text
//!   push, dequeue ──> [ bank ][ bank ] ──> pop
//!                       back    front
//! ```
//!
//! `push` hands the next free bank to the hardware. `pop` is how firmware
//! acknowledges that the hardware finished the bank at the front. `dequeue`
//! does the same bookkeeping but actively takes the bank back, which is only
//! safe while the endpoint is halted.
//!
//! None of this is reentrant. Everything runs from one interrupt context.

use log::{debug, trace, warn};

use crate::bdt::BufferDescriptor;
use crate::config::{EndpointConfig, Initializer, MAX_ENDPOINTS};
use crate::error::EndpointError;
use crate::hal::UsbHardware;
use crate::setup::Direction;
use crate::tracker::{BufferState, DataToggle, Tracker};

#[derive(Debug)]
pub struct EndpointQueue {
    tracker: Tracker,
    configs: [Option<EndpointConfig>; MAX_ENDPOINTS],
}

impl EndpointQueue {
    pub const fn new() -> Self {
        Self {
            tracker: Tracker::new(),
            configs: [None; MAX_ENDPOINTS],
        }
    }

    /// Brings up an endpoint: enables it in hardware, resets its toggles and
    /// runs its initializer. Any previous configuration of the same endpoint
    /// number is torn down first.
    pub fn configure<H: UsbHardware>(
        &mut self,
        hw: &mut H,
        config: &EndpointConfig,
    ) -> Result<(), EndpointError> {
        config.validate()?;
        let ep = config.number;
        self.deconfigure(hw, ep);

        if !hw.enable_endpoint(config) {
            warn!("hardware refused endpoint {ep} configuration");
            return Err(EndpointError::InvalidConfiguration(ep));
        }
        let banks = config.bank_count(H::BANK_COUNT);
        for dir in [Direction::Out, Direction::In] {
            let n = if config.direction.has(dir) { banks } else { 0 };
            self.tracker.set_banks(ep, dir, n);
        }
        self.configs[usize::from(ep)] = Some(*config);
        debug!(
            "ep{ep} configured: {:?} {:?}, {} bytes, {banks} bank(s)",
            config.transfer_type, config.direction, config.max_packet_size
        );

        self.initialize(hw, ep)?;
        Ok(())
    }

    /// Runs the endpoint's initializer. Returns the number of buffers queued.
    pub fn initialize<H: UsbHardware>(
        &mut self,
        hw: &mut H,
        ep: u8,
    ) -> Result<u8, EndpointError> {
        let config = *self.config(ep)?;
        match config.init {
            Initializer::FillReceiveBanks if config.direction.has(Direction::Out) => {
                Ok(self.fill(hw, ep))
            }
            _ => Ok(0),
        }
    }

    pub fn deconfigure<H: UsbHardware>(&mut self, hw: &mut H, ep: u8) {
        let Some(slot) = self.configs.get_mut(usize::from(ep)) else {
            return;
        };
        if slot.take().is_some() {
            hw.disable_endpoint(ep);
            self.tracker.set_banks(ep, Direction::Out, 0);
            self.tracker.set_banks(ep, Direction::In, 0);
            debug!("ep{ep} deconfigured");
        }
    }

    /// Tears down every endpoint, control included.
    pub fn deconfigure_all<H: UsbHardware>(&mut self, hw: &mut H) {
        for ep in 0..MAX_ENDPOINTS as u8 {
            self.deconfigure(hw, ep);
        }
    }

    pub fn config(&self, ep: u8) -> Result<&EndpointConfig, EndpointError> {
        self.configs
            .get(usize::from(ep))
            .ok_or(EndpointError::InvalidEndpoint(ep))?
            .as_ref()
            .ok_or(EndpointError::NotConfigured(ep))
    }

    pub fn is_configured(&self, ep: u8) -> bool {
        self.config(ep).is_ok()
    }

    /// Max packet size, or 0 for an endpoint that isn't configured.
    pub fn max_packet_size(&self, ep: u8) -> u16 {
        self.config(ep).map_or(0, |c| c.max_packet_size)
    }

    pub fn state(&self, ep: u8, dir: Direction) -> Option<&BufferState> {
        self.tracker.state(ep, dir)
    }

    fn slot(
        &mut self,
        ep: u8,
        dir: Direction,
    ) -> Result<(EndpointConfig, &mut BufferState), EndpointError> {
        let config = *self.config(ep)?;
        if !config.direction.has(dir) {
            return Err(EndpointError::NotConfigured(ep));
        }
        let state = self
            .tracker
            .state_mut(ep, dir)
            .ok_or(EndpointError::InvalidEndpoint(ep))?;
        Ok((config, state))
    }

    /// Queues one buffer of up to `requested` bytes (clipped to the endpoint's
    /// packet size) and returns the size actually queued.
    ///
    /// For IN, `payload` supplies the bytes to send; `None` sends whatever is
    /// in endpoint memory. For OUT, the packet lands in endpoint memory.
    pub fn push<H: UsbHardware>(
        &mut self,
        hw: &mut H,
        ep: u8,
        dir: Direction,
        payload: Option<&[u8]>,
        requested: u16,
    ) -> Result<u16, EndpointError> {
        let addr = dir.endpoint(ep);
        let (config, state) = self.slot(ep, dir)?;
        let claim = state.claim().ok_or(EndpointError::NoCapacity(addr))?;

        let size = requested.min(config.max_packet_size);
        let desc = match dir {
            Direction::In => BufferDescriptor::transmit(size, claim.toggle),
            Direction::Out => BufferDescriptor::receive(size, claim.toggle),
        };
        let payload = payload.map(|p| p.get(..usize::from(size)).unwrap_or(p));
        hw.arm(ep, dir, claim.bank, desc, payload);
        trace!("push {addr:#04x} bank {} {:?} {size}B", claim.bank, claim.toggle);
        Ok(size)
    }

    /// Retires the buffer the hardware just completed.
    pub fn pop(&mut self, ep: u8, dir: Direction) -> Result<(), EndpointError> {
        let addr = dir.endpoint(ep);
        let (_, state) = self.slot(ep, dir)?;
        if state.retire() {
            Ok(())
        } else {
            Err(EndpointError::QueueEmpty(addr))
        }
    }

    /// Takes the front buffer back from the hardware. The endpoint must be
    /// halted; see [`UsbHardware::disarm`].
    pub fn dequeue<H: UsbHardware>(
        &mut self,
        hw: &mut H,
        ep: u8,
        dir: Direction,
    ) -> Result<(), EndpointError> {
        let addr = dir.endpoint(ep);
        let (_, state) = self.slot(ep, dir)?;
        let bank = state.front_bank();
        if !state.retire() {
            return Err(EndpointError::QueueEmpty(addr));
        }
        hw.disarm(ep, dir, bank);
        trace!("dequeue {addr:#04x} bank {bank}");
        Ok(())
    }

    /// Dequeues until nothing is left. Returns how many buffers that was.
    pub fn dequeue_all<H: UsbHardware>(&mut self, hw: &mut H, ep: u8, dir: Direction) -> u8 {
        let mut n = 0;
        while self.dequeue(hw, ep, dir).is_ok() {
            n += 1;
        }
        n
    }

    /// Queues full-size receive buffers into every free OUT bank. Returns the
    /// number queued.
    pub fn fill<H: UsbHardware>(&mut self, hw: &mut H, ep: u8) -> u8 {
        let size = self.max_packet_size(ep);
        let mut n = 0;
        while self.push(hw, ep, Direction::Out, None, size).is_ok() {
            n += 1;
        }
        n
    }

    pub fn set_data_toggle(
        &mut self,
        ep: u8,
        dir: Direction,
        toggle: DataToggle,
    ) -> Result<(), EndpointError> {
        let (_, state) = self.slot(ep, dir)?;
        state.set_data_toggle(toggle);
        Ok(())
    }

    /// Back to DATA0 in both directions. Anything still queued for OUT was
    /// stamped with the old toggle, so it's taken back first.
    pub fn reset_data_toggle<H: UsbHardware>(&mut self, hw: &mut H, ep: u8) {
        for dir in [Direction::Out, Direction::In] {
            if self.slot(ep, dir).is_ok() {
                if dir == Direction::Out {
                    self.dequeue_all(hw, ep, dir);
                }
                // Can't fail: the slot was just checked.
                let _ = self.set_data_toggle(ep, dir, DataToggle::Data0);
            }
        }
    }

    /// Stalls a configured endpoint. `false` if it isn't configured.
    pub fn stall<H: UsbHardware>(&mut self, hw: &mut H, ep: u8) -> bool {
        if !self.is_configured(ep) {
            return false;
        }
        hw.set_stall(ep, true);
        debug!("ep{ep} stalled");
        true
    }

    /// Clears a stall: toggles back to DATA0, initializer re-run, then the
    /// endpoint is released. `false` if it isn't configured.
    pub fn clear_stall<H: UsbHardware>(&mut self, hw: &mut H, ep: u8) -> bool {
        if !self.is_configured(ep) {
            return false;
        }
        self.reset_data_toggle(hw, ep);
        if let Err(e) = self.initialize(hw, ep) {
            warn!("ep{ep} re-init after clear stall failed: {e}");
        }
        hw.set_stall(ep, false);
        debug!("ep{ep} stall cleared");
        true
    }

    pub fn is_stalled<H: UsbHardware>(&self, hw: &H, ep: u8) -> bool {
        self.is_configured(ep) && hw.is_stalled(ep)
    }

    /// Bus reset: every toggle and bank counter back to its initial value.
    /// Configurations are left alone; the caller reloads the default one.
    pub fn reset(&mut self) {
        self.tracker.reset_all();
    }
}

impl Default for EndpointQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointDirection;
    use crate::mock::MockHardware;
    use proptest::prelude::*;

    fn bulk_in(number: u8) -> EndpointConfig {
        let mut c = EndpointConfig::bulk_out(number, 64);
        c.direction = EndpointDirection::In;
        c
    }

    #[test]
    fn configure_fills_receive_banks() {
        let mut hw = MockHardware::<2>::new();
        let mut q = EndpointQueue::new();
        q.configure(&mut hw, &EndpointConfig::bulk_out(1, 64)).unwrap();

        let armed = hw.armed_on(1, Direction::Out);
        assert_eq!(armed.len(), 2);
        assert_eq!(armed[0].bank, 0);
        assert_eq!(armed[0].desc, BufferDescriptor::receive(64, DataToggle::Data0));
        assert_eq!(armed[1].bank, 1);
        assert_eq!(armed[1].desc, BufferDescriptor::receive(64, DataToggle::Data1));
        assert_eq!(q.state(1, Direction::Out).unwrap().queued(), 2);
        // No IN side on a bulk OUT endpoint.
        assert_eq!(q.state(1, Direction::In).unwrap().banks(), 0);
    }

    #[test]
    fn manual_initializer_queues_nothing() {
        let mut hw = MockHardware::<1>::new();
        let mut q = EndpointQueue::new();
        let mut c = EndpointConfig::bulk_out(2, 32);
        c.init = Initializer::Manual;
        q.configure(&mut hw, &c).unwrap();
        assert!(hw.armed.is_empty());
        assert_eq!(q.max_packet_size(2), 32);
    }

    #[test]
    fn push_clips_to_packet_size_and_payload() {
        let mut hw = MockHardware::<1>::new();
        let mut q = EndpointQueue::new();
        q.configure(&mut hw, &bulk_in(2)).unwrap();

        let data = [7u8; 100];
        assert_eq!(q.push(&mut hw, 2, Direction::In, Some(&data), 100), Ok(64));
        let armed = hw.armed_on(2, Direction::In);
        assert_eq!(armed[0].payload.len(), 64);
        assert_eq!(armed[0].desc, BufferDescriptor::transmit(64, DataToggle::Data0));
    }

    #[test]
    fn push_when_full_fails_cleanly() {
        let mut hw = MockHardware::<1>::new();
        let mut q = EndpointQueue::new();
        q.configure(&mut hw, &bulk_in(2)).unwrap();
        q.push(&mut hw, 2, Direction::In, None, 0).unwrap();
        let before = *q.state(2, Direction::In).unwrap();
        assert_eq!(
            q.push(&mut hw, 2, Direction::In, None, 0),
            Err(EndpointError::NoCapacity(0x82))
        );
        assert_eq!(*q.state(2, Direction::In).unwrap(), before);
        assert_eq!(hw.armed.len(), 1);
    }

    #[test]
    fn pop_and_dequeue_on_empty() {
        let mut hw = MockHardware::<1>::new();
        let mut q = EndpointQueue::new();
        q.configure(&mut hw, &bulk_in(2)).unwrap();
        assert_eq!(q.pop(2, Direction::In), Err(EndpointError::QueueEmpty(0x82)));
        assert_eq!(
            q.dequeue(&mut hw, 2, Direction::In),
            Err(EndpointError::QueueEmpty(0x82))
        );
        assert!(hw.disarmed.is_empty());
    }

    #[test]
    fn operations_on_unconfigured_endpoints() {
        let mut hw = MockHardware::<1>::new();
        let mut q = EndpointQueue::new();
        assert_eq!(
            q.push(&mut hw, 1, Direction::Out, None, 8),
            Err(EndpointError::NotConfigured(1))
        );
        assert_eq!(q.pop(9, Direction::Out), Err(EndpointError::InvalidEndpoint(9)));
        assert!(!q.stall(&mut hw, 1));
        assert!(!q.clear_stall(&mut hw, 1));
        assert!(!q.is_stalled(&hw, 1));
    }

    #[test]
    fn dequeue_all_takes_back_front_first() {
        let mut hw = MockHardware::<2>::new();
        let mut q = EndpointQueue::new();
        q.configure(&mut hw, &EndpointConfig::bulk_out(1, 64)).unwrap();
        q.pop(1, Direction::Out).unwrap();
        q.fill(&mut hw, 1);
        // Front is now bank 1, then bank 0.
        assert_eq!(q.dequeue_all(&mut hw, 1, Direction::Out), 2);
        assert_eq!(hw.disarmed, vec![(1, Direction::Out, 1), (1, Direction::Out, 0)]);
        assert_eq!(q.state(1, Direction::Out).unwrap().queued(), 0);
    }

    #[test]
    fn clear_stall_resynchronizes() {
        let mut hw = MockHardware::<1>::new();
        let mut q = EndpointQueue::new();
        q.configure(&mut hw, &EndpointConfig::bulk_out(1, 64)).unwrap();
        // One packet through, so the next expected toggle is DATA1.
        q.pop(1, Direction::Out).unwrap();
        q.fill(&mut hw, 1);
        assert!(q.stall(&mut hw, 1));
        assert!(q.is_stalled(&hw, 1));

        hw.clear_log();
        assert!(q.clear_stall(&mut hw, 1));
        assert!(!q.is_stalled(&hw, 1));
        // One bank, so whatever was queued sat in bank 0.
        assert_eq!(hw.disarmed, vec![(1, Direction::Out, 0)]);
        let armed = hw.armed_on(1, Direction::Out);
        assert_eq!(armed.len(), 1);
        assert_eq!(armed[0].bank, 0);
        assert_eq!(armed[0].desc.data_toggle(), DataToggle::Data0);
        assert_eq!(q.state(1, Direction::Out).unwrap().queued(), 1);
    }

    #[test]
    fn reconfigure_tears_down_first() {
        let mut hw = MockHardware::<1>::new();
        let mut q = EndpointQueue::new();
        q.configure(&mut hw, &EndpointConfig::bulk_out(1, 64)).unwrap();
        q.configure(&mut hw, &bulk_in(1)).unwrap();
        assert_eq!(q.state(1, Direction::Out).unwrap().banks(), 0);
        assert_eq!(q.state(1, Direction::In).unwrap().banks(), 1);
        assert_eq!(hw.enabled[1].map(|c| c.direction), Some(EndpointDirection::In));
        q.deconfigure_all(&mut hw);
        assert!(hw.enabled.iter().all(Option::is_none));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Push(u16),
        Pop,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u16..200).prop_map(Op::Push), Just(Op::Pop)]
    }

    fn check_invariants<const B: u8>(ops: Vec<Op>) -> Result<(), TestCaseError> {
        let mut hw = MockHardware::<B>::new();
        let mut q = EndpointQueue::new();
        q.configure(&mut hw, &bulk_in(2)).unwrap();
        let mut pushes = 0usize;
        for op in ops {
            match op {
                Op::Push(n) => {
                    let full = q.state(2, Direction::In).unwrap().is_full();
                    match q.push(&mut hw, 2, Direction::In, None, n) {
                        Ok(size) => {
                            prop_assert!(!full);
                            prop_assert_eq!(size, n.min(64));
                            pushes += 1;
                        }
                        Err(e) => {
                            prop_assert!(full);
                            prop_assert_eq!(e, EndpointError::NoCapacity(0x82));
                        }
                    }
                }
                Op::Pop => {
                    let _ = q.pop(2, Direction::In);
                }
            }
            let s = q.state(2, Direction::In).unwrap();
            prop_assert!(s.queued() <= s.banks());
            prop_assert_eq!(s.data_toggle().is_data1(), pushes % 2 == 1);
        }
        // Every armed descriptor carried the parity of its own push.
        for (i, a) in hw.armed.iter().enumerate() {
            prop_assert_eq!(a.desc.data_toggle().is_data1(), i % 2 == 1);
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn single_bank_invariants(ops in proptest::collection::vec(op(), 0..100)) {
            check_invariants::<1>(ops)?;
        }

        #[test]
        fn ping_pong_invariants(ops in proptest::collection::vec(op(), 0..100)) {
            check_invariants::<2>(ops)?;
        }
    }
}
