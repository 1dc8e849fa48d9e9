//! USB 2.0 device layer
//!
//! Chapter-9 device framework on top of an opaque controller: enumeration
//! state, endpoint management, EP0 control transfers and dispatch of class
//! events to the registered interface driver. The controller itself (register
//! file + packet memory) stays behind [UsbController].

use crate::fmt::{debug, info, warn};
use num_enum::TryFromPrimitive;

pub mod controller;
pub mod descriptor;

use controller::{
    chep, cntr, istr, pma_read_bytes, pma_write_bytes, rxbd_rd, rxbd_wr, txbd_rd, txbd_wr,
    ChepUpdate, EpAddr, EpState, EpType, Reg, UsbController, BCDR_DPPU, DADDR_EF, RXBD_CONFIG,
};
use descriptor::{EP_OFFSETS, IF_COUNT, PACKET_SIZE, STRINGS, STR_COUNT};

/* Standard request codes (USB 2.0 table 9-4) */
const GET_STATUS: u8 = 0x00;
const CLEAR_FEATURE: u8 = 0x01;
const SET_FEATURE: u8 = 0x03;
const SET_ADDRESS: u8 = 0x05;
const GET_DESCRIPTOR: u8 = 0x06;
const SET_DESCRIPTOR: u8 = 0x07;
const GET_CONFIGURATION: u8 = 0x08;
const SET_CONFIGURATION: u8 = 0x09;
const GET_INTERFACE: u8 = 0x0A;
const SET_INTERFACE: u8 = 0x0B;

/* Descriptor types */
const DESC_DEVICE: u8 = 0x01;
const DESC_CONFIGURATION: u8 = 0x02;
const DESC_STRING: u8 = 0x03;
const DESC_DEVICE_QUALIFIER: u8 = 0x06;

/* Feature selectors */
const FEATURE_ENDPOINT_HALT: u16 = 0;
const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;
const FEATURE_TEST_MODE: u16 = 2;

/// Device enumeration state (USB 2.0 chapter 9.1)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    Powered,
    Default,
    Address,
    Configured,
}

/// Type field of bmRequestType
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Recipient field of bmRequestType; values above 3 are reserved and fail
/// the conversion.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// The 8-byte SETUP packet of a control transfer
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn parse(raw: &[u8; 8]) -> SetupPacket {
        SetupPacket {
            bm_request_type: raw[0],
            b_request: raw[1],
            w_value: u16::from_le_bytes([raw[2], raw[3]]),
            w_index: u16::from_le_bytes([raw[4], raw[5]]),
            w_length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn is_device_to_host(&self) -> bool {
        self.bm_request_type & 0x80 != 0
    }

    pub fn request_type(&self) -> RequestType {
        // Two bits, every value is covered
        RequestType::try_from_primitive((self.bm_request_type >> 5) & 0x03).unwrap()
    }

    pub fn recipient(&self) -> Result<Recipient, ()> {
        Recipient::try_from_primitive(self.bm_request_type & 0x1F).map_err(|_| ())
    }
}

/// Result of an interface `ctrl_req` invocation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CtrlOutcome {
    /// The caller should finish the transfer with a zero-length status packet
    Ack,
    /// The driver has already queued its response
    Handled,
    /// Reject the request
    Stall,
}

/// Which directions of an endpoint an interface wants serviced
#[derive(Debug, Copy, Clone, Default)]
pub struct EpConfig {
    pub rx: bool,
    pub tx: bool,
}

/// An interface driver: the class layer plugged on top of the device core.
///
/// `ep_rx` returns the state to re-arm the OUT half with ([EpState::Valid] to
/// keep receiving, [EpState::Nak] to hold off until the main loop caught up).
/// `ep_tx_complete` returns true when it queued another packet itself.
/// `ep_release` decides the post-Clear-Halt state of a halted endpoint.
pub trait UsbInterface<C: UsbController> {
    fn reset(&mut self, bus: &mut DeviceCore<C>);
    fn enable(&mut self, bus: &mut DeviceCore<C>, cfg_id: u8);
    fn periodic(&mut self, bus: &mut DeviceCore<C>);
    fn ctrl_req(
        &mut self,
        bus: &mut DeviceCore<C>,
        req: &SetupPacket,
        data: Option<&[u8]>,
    ) -> CtrlOutcome;
    fn ep_rx(&mut self, bus: &mut DeviceCore<C>, ep: u8, data: &[u8]) -> EpState;
    fn ep_tx_complete(&mut self, bus: &mut DeviceCore<C>, ep: u8) -> bool;
    fn ep_release(&mut self, ep: EpAddr) -> EpState;
}

/// Hooks of the optional custom application
pub trait AppHandler {
    fn reset(&mut self) {}
    fn periodic(&mut self) {}
}

/// Placeholder when no custom application is installed
#[derive(Default)]
pub struct NoApp;

impl AppHandler for NoApp {}

/// Endpoint plumbing and enumeration state, shared with interface drivers.
///
/// Interface callbacks receive `&mut DeviceCore` so they can transmit,
/// reconfigure endpoints or force endpoint states while the device owns them.
pub struct DeviceCore<C: UsbController> {
    ctrl: C,
    state: DeviceState,
    dev_addr: u8,
    addr_pending: bool,
    configuration: u8,
}

impl<C: UsbController> DeviceCore<C> {
    fn new(ctrl: C) -> DeviceCore<C> {
        DeviceCore {
            ctrl,
            state: DeviceState::Powered,
            dev_addr: 0,
            addr_pending: false,
            configuration: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Queue a packet for IN transfer on an endpoint.
    ///
    /// Data is copied into the endpoint's packet memory buffer and the TX half
    /// is marked VALID. An empty slice sends a zero-length packet (the status
    /// stage of control transfers).
    pub fn send(&mut self, ep: u8, data: &[u8]) {
        if ep > 7 || data.len() > PACKET_SIZE {
            return;
        }

        let offset = (txbd_rd(&self.ctrl, ep) & 0xFFFF) as u16;
        if !data.is_empty() {
            pma_write_bytes(&mut self.ctrl, offset, data);
        }
        txbd_wr(&mut self.ctrl, ep, ((data.len() as u32) << 16) | offset as u32);

        let cur = self.ctrl.reg_rd(Reg::Chep(ep));
        let mut upd = ChepUpdate::new(cur).stat_tx(EpState::Valid);
        if data.is_empty() {
            upd = upd.ack_tx();
        }
        self.ctrl.reg_wr(Reg::Chep(ep), upd.value());
    }

    /// Configure and activate an endpoint.
    ///
    /// Buffer offsets come from the static packet memory map; the directions
    /// enabled in `cfg` decide the initial states (RX enabled starts VALID,
    /// TX starts NAK until the first transmit). Both data toggles reset.
    pub fn ep_configure(&mut self, ep: u8, ty: EpType, cfg: EpConfig) {
        if ep == 0 || ep > 7 {
            return;
        }

        if cfg.tx {
            txbd_wr(&mut self.ctrl, ep, EP_OFFSETS[ep as usize][0] as u32);
        } else {
            txbd_wr(&mut self.ctrl, ep, 0);
        }
        if cfg.rx {
            rxbd_wr(&mut self.ctrl, ep, RXBD_CONFIG | EP_OFFSETS[ep as usize][1] as u32);
        } else {
            rxbd_wr(&mut self.ctrl, ep, 0);
        }

        let cur = self.ctrl.reg_rd(Reg::Chep(ep));
        let mut v = ((ty as u32) << chep::UTYPE_SHIFT) | ep as u32 | chep::VTRX | chep::VTTX;
        let rx_target = if cfg.rx { EpState::Valid } else { EpState::Disabled };
        let tx_target = if cfg.tx { EpState::Nak } else { EpState::Disabled };
        v |= ((cur & chep::STATRX_MASK) >> chep::STATRX_SHIFT ^ rx_target as u32)
            << chep::STATRX_SHIFT;
        v |= ((cur & chep::STATTX_MASK) >> chep::STATTX_SHIFT ^ tx_target as u32)
            << chep::STATTX_SHIFT;
        v |= cur & (chep::DTOGRX | chep::DTOGTX);
        self.ctrl.reg_wr(Reg::Chep(ep), v);

        debug!("usb: configure ep{=u8}", ep);
    }

    /// Force one direction of an endpoint to a new state.
    ///
    /// Leaving STALL also resets the data toggle of that half, except on EP0
    /// where toggles are implicit.
    pub fn ep_set_state(&mut self, addr: EpAddr, state: EpState) {
        let ep = addr.number();
        if ep > 7 {
            return;
        }

        let cur = self.ctrl.reg_rd(Reg::Chep(ep));
        let prev;
        let mut upd = ChepUpdate::new(cur);
        if addr.is_in() {
            prev = EpState::from_bits((cur & chep::STATTX_MASK) >> chep::STATTX_SHIFT);
            upd = upd.stat_tx(state);
            if prev == EpState::Stall && ep != 0 {
                upd = upd.clear_dtog_tx();
            }
        } else {
            prev = EpState::from_bits((cur & chep::STATRX_MASK) >> chep::STATRX_SHIFT);
            upd = upd.stat_rx(state);
            if prev == EpState::Stall && ep != 0 {
                upd = upd.clear_dtog_rx();
            }
        }
        if state != prev {
            self.ctrl.reg_wr(Reg::Chep(ep), upd.value());
        }
    }

    /// Current state of one direction of an endpoint
    pub fn ep_state(&self, addr: EpAddr) -> EpState {
        let cur = self.ctrl.reg_rd(Reg::Chep(addr.number()));
        if addr.is_in() {
            EpState::from_bits((cur & chep::STATTX_MASK) >> chep::STATTX_SHIFT)
        } else {
            EpState::from_bits((cur & chep::STATRX_MASK) >> chep::STATRX_SHIFT)
        }
    }

    /// Prepare and enable EP0 after power-up or bus reset
    fn ep0_config(&mut self) {
        txbd_wr(&mut self.ctrl, 0, EP_OFFSETS[0][0] as u32);
        rxbd_wr(&mut self.ctrl, 0, RXBD_CONFIG | EP_OFFSETS[0][1] as u32);

        let cur = self.ctrl.reg_rd(Reg::Chep(0));
        let mut v = (EpType::Control as u32) << chep::UTYPE_SHIFT;
        v |= ((cur & chep::STATRX_MASK) >> chep::STATRX_SHIFT ^ EpState::Valid as u32)
            << chep::STATRX_SHIFT;
        v |= ((cur & chep::STATTX_MASK) >> chep::STATTX_SHIFT ^ EpState::Nak as u32)
            << chep::STATTX_SHIFT;
        v |= cur & chep::DTOGRX;
        self.ctrl.reg_wr(Reg::Chep(0), v);
    }

    /// Reject the current EP0 request with a STALL handshake
    fn ep0_stall(&mut self) {
        let offset = txbd_rd(&self.ctrl, 0) & 0xFFFF;
        txbd_wr(&mut self.ctrl, 0, offset);

        let cur = self.ctrl.reg_rd(Reg::Chep(0));
        let upd = ChepUpdate::new(cur).ack_tx().stat_tx(EpState::Stall);
        self.ctrl.reg_wr(Reg::Chep(0), upd.value());
    }
}

/// The USB device: controller, enumeration machine and one interface driver.
pub struct UsbDevice<C, IF, A = NoApp>
where
    C: UsbController,
    IF: UsbInterface<C>,
    A: AppHandler,
{
    bus: DeviceCore<C>,
    interface: IF,
    app: A,
    setup: SetupPacket,
}

impl<C, IF> UsbDevice<C, IF, NoApp>
where
    C: UsbController,
    IF: UsbInterface<C>,
{
    pub fn new(ctrl: C, interface: IF) -> UsbDevice<C, IF, NoApp> {
        UsbDevice::with_app(ctrl, interface, NoApp)
    }
}

impl<C, IF, A> UsbDevice<C, IF, A>
where
    C: UsbController,
    IF: UsbInterface<C>,
    A: AppHandler,
{
    /// Builds a device with a custom application plugged into the reset and
    /// periodic paths.
    pub fn with_app(ctrl: C, interface: IF, app: A) -> UsbDevice<C, IF, A> {
        UsbDevice {
            bus: DeviceCore::new(ctrl),
            interface,
            app,
            setup: SetupPacket::default(),
        }
    }

    pub fn interface(&mut self) -> &mut IF {
        &mut self.interface
    }

    pub fn state(&self) -> DeviceState {
        self.bus.state
    }

    /// Bring the port up: address 0, EP0 armed, interrupts unmasked, pull-up
    /// connected.
    pub fn start(&mut self) {
        self.bus.state = DeviceState::Powered;
        self.bus.ctrl.reg_wr(Reg::Daddr, DADDR_EF);
        self.bus.ep0_config();

        self.bus.ctrl.reg_wr(Reg::Istr, 0);
        let v = cntr::RESETM | cntr::CTRM | cntr::ERRM | cntr::PMAOVRM;
        self.bus.ctrl.reg_wr(Reg::Cntr, v);

        self.bus.ctrl.reg_wr(Reg::Bcdr, BCDR_DPPU);
        info!("usb: started");
    }

    /// Main-loop hook: runs the interface driver's deferred work, then the
    /// custom application's.
    pub fn periodic(&mut self) {
        self.interface.periodic(&mut self.bus);
        self.app.periodic();
    }

    /// Interrupt service routine body. Short memory-mapped updates only; the
    /// heavy lifting is flagged for [UsbDevice::periodic].
    pub fn handle_interrupt(&mut self) {
        let v = self.bus.ctrl.reg_rd(Reg::Istr);
        let mut ack = istr::SOF;

        if v & istr::RESET != 0 {
            self.bus.state = DeviceState::Default;
            self.bus.dev_addr = 0;
            self.bus.addr_pending = false;
            self.bus.configuration = 0;
            self.bus.ctrl.reg_wr(Reg::Daddr, DADDR_EF);
            self.bus.ep0_config();
            self.interface.reset(&mut self.bus);
            self.app.reset();
            info!("usb: bus reset");
            ack = istr::RESET;
        } else if v & istr::CTR != 0 {
            let ep = (v & istr::EP_MASK) as u8;
            let out = v & istr::DIR != 0;
            if ep != 0 {
                if out {
                    self.ep_rx_event(ep);
                } else {
                    self.ep_tx_event(ep);
                }
            } else if out {
                self.ep0_rx();
            } else {
                self.ep0_tx_complete();
            }
            ack = istr::CTR;
        } else if v & istr::ERR != 0 {
            warn!("usb: error interrupt");
            ack = istr::ERR;
        } else if v & istr::PMAOVR != 0 {
            warn!("usb: packet memory overrun");
            ack = istr::PMAOVR;
        }
        // Interrupt flags are write-zero-to-clear
        self.bus.ctrl.reg_wr(Reg::Istr, !ack);
    }

    /// A packet arrived on a non-control endpoint
    fn ep_rx_event(&mut self, ep: u8) {
        let bd = rxbd_rd(&self.bus.ctrl, ep);
        let len = ((bd >> 16) & 0x3FF) as usize;
        let addr = (bd & 0xFFFF) as u16;

        let mut buf = [0u8; PACKET_SIZE];
        let n = len.min(PACKET_SIZE);
        pma_read_bytes(&self.bus.ctrl, addr, &mut buf[..n]);

        let rearm = self.interface.ep_rx(&mut self.bus, ep, &buf[..n]);

        rxbd_wr(&mut self.bus.ctrl, ep, bd & !(0x3FF << 16));
        let cur = self.bus.ctrl.reg_rd(Reg::Chep(ep));
        let upd = ChepUpdate::new(cur).ack_rx().stat_rx(rearm);
        self.bus.ctrl.reg_wr(Reg::Chep(ep), upd.value());
    }

    /// Transmission finished on a non-control endpoint
    fn ep_tx_event(&mut self, ep: u8) {
        let bd = txbd_rd(&self.bus.ctrl, ep);

        let cur = self.bus.ctrl.reg_rd(Reg::Chep(ep));
        let upd = ChepUpdate::new(cur).ack_tx();
        self.bus.ctrl.reg_wr(Reg::Chep(ep), upd.value());

        if !self.interface.ep_tx_complete(&mut self.bus, ep) {
            txbd_wr(&mut self.bus.ctrl, ep, bd & !(0x3FF << 16));
        }
    }

    /// EP0 reception: SETUP packet, OUT data stage, or status-stage ZLP
    fn ep0_rx(&mut self) {
        let chep = self.bus.ctrl.reg_rd(Reg::Chep(0));
        let bd = rxbd_rd(&self.bus.ctrl, 0);
        let len = ((bd >> 16) & 0x3FF) as usize;
        let rx_offset = EP_OFFSETS[0][1];

        if chep & chep::SETUP != 0 {
            if len >= 8 {
                let mut raw = [0u8; 8];
                pma_read_bytes(&self.bus.ctrl, rx_offset, &mut raw);
                self.setup = SetupPacket::parse(&raw);
                self.process_request(None);
            }
        } else if len == 0 {
            // Status-stage ZLP, nothing to do
        } else {
            let mut data = [0u8; PACKET_SIZE];
            let n = len.min(PACKET_SIZE);
            pma_read_bytes(&self.bus.ctrl, rx_offset, &mut data[..n]);
            self.process_request(Some(&data[..n]));
        }

        // Re-arm EP0 reception
        rxbd_wr(&mut self.bus.ctrl, 0, RXBD_CONFIG | rx_offset as u32);
        let cur = self.bus.ctrl.reg_rd(Reg::Chep(0));
        let upd = ChepUpdate::new(cur).ack_rx().stat_rx(EpState::Valid);
        self.bus.ctrl.reg_wr(Reg::Chep(0), upd.value());
    }

    /// EP0 transmission finished. The deferred device address is committed
    /// here, once the SET_ADDRESS status stage went out on address 0.
    fn ep0_tx_complete(&mut self) {
        if self.bus.state == DeviceState::Address && self.bus.addr_pending {
            self.bus.addr_pending = false;
            self.bus
                .ctrl
                .reg_wr(Reg::Daddr, DADDR_EF | self.bus.dev_addr as u32);
            info!("usb: address {=u8} committed", self.bus.dev_addr);

            rxbd_wr(&mut self.bus.ctrl, 0, RXBD_CONFIG | EP_OFFSETS[0][1] as u32);
            let cur = self.bus.ctrl.reg_rd(Reg::Chep(0));
            let upd = ChepUpdate::new(cur)
                .ack_tx()
                .ack_rx()
                .stat_rx(EpState::Valid);
            self.bus.ctrl.reg_wr(Reg::Chep(0), upd.value());
        } else {
            let cur = self.bus.ctrl.reg_rd(Reg::Chep(0));
            let upd = ChepUpdate::new(cur).ack_tx();
            self.bus.ctrl.reg_wr(Reg::Chep(0), upd.value());
        }
    }

    /// Decode and route a control request (chapter 9.3). Called with
    /// `data == None` for the SETUP stage and `Some` for an OUT data stage.
    fn process_request(&mut self, data: Option<&[u8]>) {
        let req = self.setup;

        match req.request_type() {
            RequestType::Standard if req.is_device_to_host() => match req.b_request {
                GET_STATUS => self.get_status(&req),
                GET_DESCRIPTOR => self.get_descriptor(&req),
                GET_CONFIGURATION => self.get_configuration(),
                GET_INTERFACE => self.get_interface(),
                _ => self.bus.ep0_stall(),
            },
            RequestType::Standard => match req.b_request {
                CLEAR_FEATURE => self.feature_clear(&req),
                SET_FEATURE => self.feature_set(&req),
                SET_ADDRESS => self.set_address(&req),
                SET_DESCRIPTOR => self.bus.ep0_stall(),
                SET_CONFIGURATION => self.set_configuration(&req),
                SET_INTERFACE => self.bus.send(0, &[]),
                _ => self.bus.ep0_stall(),
            },
            RequestType::Class | RequestType::Vendor
                if req.recipient() == Ok(Recipient::Interface) =>
            {
                if (req.w_index as u8) < IF_COUNT {
                    match self.interface.ctrl_req(&mut self.bus, &req, data) {
                        CtrlOutcome::Ack => self.bus.send(0, &[]),
                        CtrlOutcome::Handled => {}
                        CtrlOutcome::Stall => self.bus.ep0_stall(),
                    }
                } else {
                    self.bus.ep0_stall();
                }
            }
            _ => {
                debug!(
                    "usb: unsupported request type={=u8} req={=u8}",
                    req.bm_request_type, req.b_request
                );
                self.bus.ep0_stall();
            }
        }
    }

    fn get_status(&mut self, req: &SetupPacket) {
        let status: u16 = match req.recipient() {
            // Bit 1: remote wakeup, bit 0: self powered
            Ok(Recipient::Device) => 0,
            // Interface status is always zero (9.4.5)
            Ok(Recipient::Interface) => {
                if req.w_index >= IF_COUNT as u16 {
                    return self.bus.ep0_stall();
                }
                0
            }
            Ok(Recipient::Endpoint) => {
                let addr = EpAddr::from_raw(req.w_index as u8);
                if addr.number() > 7 {
                    return self.bus.ep0_stall();
                }
                (self.bus.ep_state(addr) == EpState::Stall) as u16
            }
            _ => return self.bus.ep0_stall(),
        };
        self.bus.send(0, &status.to_le_bytes());
    }

    fn get_descriptor(&mut self, req: &SetupPacket) {
        let desc_type = (req.w_value >> 8) as u8;
        let index = (req.w_value & 0xFF) as u8;

        match desc_type {
            DESC_DEVICE => self.bus.send(0, &descriptor::DEVICE),
            DESC_CONFIGURATION => {
                // The host commonly asks for 9 bytes first to learn the total
                // length, then re-requests the full assembly
                let len = descriptor::CONFIGURATION.len().min(req.w_length as usize);
                self.bus.send(0, &descriptor::CONFIGURATION[..len]);
            }
            DESC_DEVICE_QUALIFIER => self.bus.send(0, &descriptor::DEVICE_QUALIFIER),
            DESC_STRING => {
                if index < STR_COUNT {
                    self.bus.send(0, STRINGS[index as usize]);
                } else {
                    warn!("usb: unknown string descriptor {=u8}", index);
                    self.bus.ep0_stall();
                }
            }
            _ => {
                debug!("usb: unknown descriptor type {=u8}", desc_type);
                self.bus.ep0_stall();
            }
        }
    }

    fn get_configuration(&mut self) {
        let selected = if self.bus.state == DeviceState::Configured {
            self.bus.configuration
        } else {
            0
        };
        self.bus.send(0, &[selected]);
    }

    fn get_interface(&mut self) {
        // Alternate settings are not used, the selection is always zero
        self.bus.send(0, &[0]);
    }

    fn feature_clear(&mut self, req: &SetupPacket) {
        match (req.recipient(), req.w_value) {
            (Ok(Recipient::Device), FEATURE_DEVICE_REMOTE_WAKEUP)
            | (Ok(Recipient::Device), FEATURE_TEST_MODE) => {}
            (Ok(Recipient::Endpoint), FEATURE_ENDPOINT_HALT) => {
                let addr = EpAddr::from_raw(req.w_index as u8);
                let ep = addr.number();
                if (1..=7).contains(&ep) {
                    // The interface decides whether the released endpoint
                    // re-arms or stays NAKed until its state machine is ready
                    let state = self.interface.ep_release(addr);
                    self.bus.ep_set_state(addr, state);
                }
            }
            _ => return self.bus.ep0_stall(),
        }
        self.bus.send(0, &[]);
    }

    fn feature_set(&mut self, req: &SetupPacket) {
        match (req.recipient(), req.w_value) {
            (Ok(Recipient::Device), FEATURE_DEVICE_REMOTE_WAKEUP)
            | (Ok(Recipient::Device), FEATURE_TEST_MODE) => {}
            (Ok(Recipient::Endpoint), FEATURE_ENDPOINT_HALT) => {
                let addr = EpAddr::from_raw(req.w_index as u8);
                if (1..=7).contains(&addr.number()) {
                    self.bus.ep_set_state(addr, EpState::Stall);
                }
            }
            _ => return self.bus.ep0_stall(),
        }
        self.bus.send(0, &[]);
    }

    fn set_address(&mut self, req: &SetupPacket) {
        self.bus.dev_addr = (req.w_value & 0x7F) as u8;
        self.bus.addr_pending = true;
        self.bus.state = DeviceState::Address;
        info!("usb: set address {=u8}", self.bus.dev_addr);
        // The address is committed after this status stage is acknowledged
        self.bus.send(0, &[]);
    }

    fn set_configuration(&mut self, req: &SetupPacket) {
        self.bus.configuration = req.w_value as u8;
        self.bus.state = DeviceState::Configured;
        info!("usb: set configuration {=u8}", self.bus.configuration);
        let cfg = self.bus.configuration;
        self.interface.enable(&mut self.bus, cfg);
        self.bus.send(0, &[]);
    }
}
