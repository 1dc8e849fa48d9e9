//! Bulk Only Transport (BBB/BOT)
//!
//! Mass Storage interface driver: the CBW / data / CSW state machine over one
//! bulk-IN and one bulk-OUT endpoint. Interrupt context only moves packet
//! bytes and raises flags; the state machine itself advances from the
//! periodic hook of the main loop.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::device::controller::{EpAddr, EpState, EpType, UsbController};
use crate::device::descriptor::PACKET_SIZE;
use crate::device::{CtrlOutcome, DeviceCore, EpConfig, SetupPacket, UsbInterface};
use crate::fmt::{debug, info, trace, warn};
use crate::subclass::scsi::ScsiTarget;
use crate::subclass::{Flow, Lun};
use crate::transport::CommandStatus;

const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

/// Bulk IN endpoint: data and CSW towards the host
const BULK_IN_EP: u8 = 1;
/// Bulk OUT endpoint: CBW and data from the host
const BULK_OUT_EP: u8 = 2;

const CBW_SIGNATURE: u32 = 0x43425355;
const CSW_SIGNATURE: u32 = 0x53425355;

const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

/* rst_flag values */
const RESET_NONE: u8 = 0;
/// Class-specific Bulk-Only Mass Storage Reset, owes the host an EP0 ZLP
const RESET_CLASS: u8 = 1;
/// Bus reset, no acknowledge needed
const RESET_BUS: u8 = 2;

struct InvalidCbwError; // CBW failed validation (spec 6.2.1)

/// BOT session phase
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum BotState {
    /// Waiting for a command block
    Cbw,
    /// Device-to-host data phase
    DataIn,
    /// Host-to-device data phase
    DataOut,
    /// Status phase
    Csw,
    /// A bulk endpoint is stalled, waiting for the host to clear it
    Error,
}

/// Command Block Wrapper (31 bytes, little-endian)
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Cbw {
    tag: u32,
    data_length: u32,
    flags: u8,
    lun: u8,
    cb_len: u8,
    cb: [u8; 16],
}

impl Cbw {
    fn from_le_bytes(raw: &[u8]) -> Result<Cbw, InvalidCbwError> {
        if raw.len() < CBW_LEN {
            return Err(InvalidCbwError);
        }
        if u32::from_le_bytes(raw[..4].try_into().unwrap()) != CBW_SIGNATURE {
            return Err(InvalidCbwError);
        }
        let cb_len = raw[14];
        if !(1..=16).contains(&cb_len) {
            return Err(InvalidCbwError);
        }

        Ok(Cbw {
            tag: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            data_length: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            flags: raw[12],
            lun: raw[13] & 0x0F,
            cb_len,
            cb: raw[15..31].try_into().unwrap(),
        })
    }

    /// Direction bit of the flags field: set = device to host
    fn is_in(&self) -> bool {
        self.flags & 0x80 != 0
    }
}

/// Command Status Wrapper (13 bytes, little-endian)
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Csw {
    tag: u32,
    residue: u32,
    status: CommandStatus,
}

impl Csw {
    fn to_bytes(self) -> [u8; CSW_LEN] {
        let mut bytes = [0u8; CSW_LEN];
        bytes[..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.tag.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.residue.to_le_bytes());
        bytes[12] = self.status as u8;
        bytes
    }
}

fn raise(flag: &AtomicBool) {
    flag.store(true, Ordering::Release);
}

fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::Acquire)
}

/// Bulk Only Transport session over a SCSI target.
///
/// Implements [UsbInterface]: the USB core feeds it endpoint events from
/// interrupt context and drives the state machine through `periodic`. One
/// transaction is strictly CBW, optional data phase, CSW; the thirteen
/// host/device length mismatch cases resolve per the BBB error matrix.
pub struct BulkOnly<L: Lun, const N: usize = 1> {
    scsi: ScsiTarget<L, N>,
    state: BotState,
    cbw: Cbw,
    cbw_raw: [u8; 32],
    cbw_raw_len: usize,
    csw: Csw,
    csw_sent: bool,
    /// Length of the chunk currently moving through the staging buffer
    data_len: usize,
    /// Bytes of the current chunk already exchanged with the host
    data_offset: usize,
    /// The SCSI layer announced more chunks for this command
    more_data: bool,
    /// The IN payload was cut down to the host-declared length
    truncated: bool,
    rx_flag: AtomicBool,
    tx_flag: AtomicBool,
    err_flag: AtomicBool,
    rst_flag: AtomicU8,
}

impl<L: Lun, const N: usize> BulkOnly<L, N> {
    pub fn new(luns: [L; N]) -> BulkOnly<L, N> {
        BulkOnly {
            scsi: ScsiTarget::new(luns),
            state: BotState::Cbw,
            cbw: Cbw::default(),
            cbw_raw: [0; 32],
            cbw_raw_len: 0,
            csw: Csw::default(),
            csw_sent: false,
            data_len: 0,
            data_offset: 0,
            more_data: false,
            truncated: false,
            rx_flag: AtomicBool::new(false),
            tx_flag: AtomicBool::new(false),
            err_flag: AtomicBool::new(false),
            rst_flag: AtomicU8::new(RESET_NONE),
        }
    }

    pub fn scsi(&mut self) -> &mut ScsiTarget<L, N> {
        &mut self.scsi
    }

    fn enter_state(&mut self, state: BotState) {
        debug!("usb: bbb: enter state {}", state);
        self.state = state;
    }

    fn stall_in<C: UsbController>(bus: &mut DeviceCore<C>) {
        info!("usb: bbb: stall IN ep");
        bus.ep_set_state(EpAddr::in_(BULK_IN_EP), EpState::Stall);
    }

    fn stall_out<C: UsbController>(bus: &mut DeviceCore<C>) {
        info!("usb: bbb: stall OUT ep");
        bus.ep_set_state(EpAddr::out(BULK_OUT_EP), EpState::Stall);
    }

    /// Queue the next packet-sized fragment of the staged IN payload
    fn send_data_chunk<C: UsbController>(&mut self, bus: &mut DeviceCore<C>) {
        let chunk = (self.data_len - self.data_offset).min(PACKET_SIZE);
        let end = self.data_offset + chunk;
        bus.send(BULK_IN_EP, &self.scsi.response()[self.data_offset..end]);
        self.data_offset = end;
    }

    /// Wait for a CBW, then classify the transaction (BBB 6.7: the thirteen
    /// Hn/Hi/Ho versus Dn/Di/Do cases) and start the matching phase.
    fn fsm_cbw<C: UsbController>(&mut self, bus: &mut DeviceCore<C>) {
        if !take(&self.rx_flag) {
            return;
        }

        let cbw = match Cbw::from_le_bytes(&self.cbw_raw[..self.cbw_raw_len]) {
            Ok(cbw) => cbw,
            Err(InvalidCbwError) => {
                // Spec 6.6.1: stall both pipes, wait for Reset Recovery
                warn!("usb: bbb: invalid CBW");
                Self::stall_in(bus);
                Self::stall_out(bus);
                return;
            }
        };

        debug!(
            "usb: bbb: recv CBW tag={=u32:x} data_len={=u32}",
            cbw.tag, cbw.data_length
        );

        self.cbw = cbw;
        self.csw = Csw {
            tag: cbw.tag,
            residue: 0,
            status: CommandStatus::Passed,
        };
        self.csw_sent = false;
        self.more_data = false;
        self.truncated = false;
        self.data_len = 0;
        self.data_offset = 0;

        let host_len = cbw.data_length;
        let result = self
            .scsi
            .command(&self.cbw.cb[..self.cbw.cb_len as usize], self.cbw.lun);

        match result {
            Ok(Flow::Done) => {
                if host_len > 0 {
                    // Case 4 / 9: the host announced a data phase the command
                    // does not have. Stall the pipe it will use and report
                    // the whole length as residue.
                    self.csw.residue = host_len;
                    if cbw.is_in() {
                        Self::stall_in(bus);
                    } else {
                        Self::stall_out(bus);
                    }
                    self.enter_state(BotState::Error);
                } else {
                    self.enter_state(BotState::Csw);
                }
            }

            Ok(Flow::DataIn) | Ok(Flow::DataInMore) => {
                if host_len == 0 {
                    // Case 2 (Hn < Di): phase error, residue is ignored
                    self.csw.status = CommandStatus::PhaseError;
                    self.csw.residue = 0;
                    self.enter_state(BotState::Csw);
                } else if !cbw.is_in() {
                    // Case 10 (Ho <> Di): direction conflict
                    self.csw.status = CommandStatus::PhaseError;
                    self.csw.residue = host_len;
                    Self::stall_out(bus);
                    self.enter_state(BotState::Error);
                } else {
                    self.csw.residue = host_len;
                    self.more_data = matches!(result, Ok(Flow::DataInMore));
                    self.data_len = self.scsi.response().len();
                    if self.data_len > host_len as usize {
                        // Case 7 (Hi < Di): send no more than the host asked
                        self.data_len = host_len as usize;
                        self.truncated = true;
                    }
                    self.enter_state(BotState::DataIn);
                    self.send_data_chunk(bus);
                }
            }

            Ok(Flow::DataOutMore) | Ok(Flow::DataOutLast) => {
                if host_len == 0 {
                    // Case 3 (Hn < Do): phase error, residue is ignored
                    self.csw.status = CommandStatus::PhaseError;
                    self.csw.residue = 0;
                    self.enter_state(BotState::Csw);
                } else if cbw.is_in() {
                    // Case 8 (Hi <> Do): direction conflict
                    self.csw.status = CommandStatus::PhaseError;
                    self.csw.residue = host_len;
                    Self::stall_in(bus);
                    self.enter_state(BotState::Error);
                } else {
                    self.csw.residue = host_len;
                    self.data_len = self.scsi.io_mut().space().min(host_len as usize);
                    self.enter_state(BotState::DataOut);
                    bus.ep_set_state(EpAddr::out(BULK_OUT_EP), EpState::Valid);
                }
            }

            Err(_) => {
                self.csw.status = CommandStatus::Failed;
                if host_len == 0 {
                    self.enter_state(BotState::Csw);
                } else {
                    self.csw.residue = host_len;
                    if cbw.is_in() {
                        Self::stall_in(bus);
                    } else {
                        Self::stall_out(bus);
                    }
                    self.enter_state(BotState::Error);
                }
            }
        }
    }

    /// Device-to-host data phase: one SCSI chunk per pass, fragmented into
    /// packets by the TX-complete callback.
    fn fsm_data_in<C: UsbController>(&mut self, bus: &mut DeviceCore<C>) {
        if !take(&self.tx_flag) {
            return;
        }

        self.csw.residue = self.csw.residue.saturating_sub(self.data_offset as u32);
        trace!("usb: bbb: data residue {=u32}", self.csw.residue);

        if !self.more_data {
            if self.truncated {
                // Case 7 resolved by truncation: report the disagreement
                self.csw.status = CommandStatus::PhaseError;
                self.csw.residue = 0;
                self.enter_state(BotState::Csw);
            } else if self.csw.residue > 0 {
                // Case 5 (Hi > Di): terminate the short transfer with a
                // STALL, the CSW carries the residue
                Self::stall_in(bus);
                self.enter_state(BotState::Error);
            } else {
                self.enter_state(BotState::Csw);
            }
            return;
        }

        let result = self
            .scsi
            .command(&self.cbw.cb[..self.cbw.cb_len as usize], self.cbw.lun);
        match result {
            Ok(Flow::Done) => self.enter_state(BotState::Csw),
            Ok(Flow::DataIn) | Ok(Flow::DataInMore) => {
                if self.csw.residue == 0 {
                    // Host budget exhausted while the command still holds
                    // data (Hi < Di)
                    self.csw.status = CommandStatus::PhaseError;
                    self.enter_state(BotState::Csw);
                    return;
                }
                self.more_data = matches!(result, Ok(Flow::DataInMore));
                self.data_offset = 0;
                self.data_len = self.scsi.response().len();
                if self.data_len > self.csw.residue as usize {
                    self.data_len = self.csw.residue as usize;
                    self.truncated = true;
                }
                self.send_data_chunk(bus);
            }
            _ => {
                warn!("usb: bbb: SCSI error during data IN");
                self.csw.status = CommandStatus::Failed;
                Self::stall_in(bus);
                self.enter_state(BotState::Error);
            }
        }
    }

    /// Host-to-device data phase: each completed chunk is handed to the SCSI
    /// layer, which consumes it from the staging buffer.
    fn fsm_data_out<C: UsbController>(&mut self, bus: &mut DeviceCore<C>) {
        if !take(&self.rx_flag) {
            return;
        }

        self.csw.residue = self.csw.residue.saturating_sub(self.data_offset as u32);
        trace!("usb: bbb: data residue {=u32}", self.csw.residue);

        let result = self
            .scsi
            .command(&self.cbw.cb[..self.cbw.cb_len as usize], self.cbw.lun);
        match result {
            Ok(Flow::Done) => {
                if self.csw.residue > 0 {
                    // Case 11 (Ho > Do): the command is satisfied but the
                    // host keeps sending
                    Self::stall_out(bus);
                    self.enter_state(BotState::Error);
                } else {
                    self.enter_state(BotState::Csw);
                }
            }
            Ok(Flow::DataOutMore) | Ok(Flow::DataOutLast) => {
                if self.csw.residue == 0 {
                    // Case 13 (Ho < Do): host budget exhausted while the
                    // command expects more
                    self.csw.status = CommandStatus::PhaseError;
                    self.enter_state(BotState::Csw);
                } else {
                    self.data_len = self.scsi.io_mut().space().min(self.csw.residue as usize);
                    self.data_offset = 0;
                    bus.ep_set_state(EpAddr::out(BULK_OUT_EP), EpState::Valid);
                }
            }
            _ => {
                self.csw.status = CommandStatus::Failed;
                if self.csw.residue > 0 {
                    Self::stall_out(bus);
                    self.enter_state(BotState::Error);
                } else {
                    self.enter_state(BotState::Csw);
                }
            }
        }
    }

    /// Status phase: send the CSW once, then wait for its TX completion and
    /// re-arm the OUT pipe for the next command.
    fn fsm_csw<C: UsbController>(&mut self, bus: &mut DeviceCore<C>) {
        if !self.csw_sent {
            // The transaction ends here for the SCSI layer
            self.scsi.complete();
            info!(
                "usb: bbb: complete tag={=u32:x} status={} residue={=u32}",
                self.csw.tag, self.csw.status, self.csw.residue
            );
            bus.send(BULK_IN_EP, &self.csw.to_bytes());
            self.csw_sent = true;
        }

        if take(&self.tx_flag) {
            self.rx_flag.store(false, Ordering::Release);
            self.err_flag.store(false, Ordering::Release);
            self.csw_sent = false;
            self.enter_state(BotState::Cbw);
            bus.ep_set_state(EpAddr::out(BULK_OUT_EP), EpState::Valid);
        }
    }

    /// A data pipe was stalled mid-transaction; once the host cleared the
    /// halt the deferred CSW may go out.
    fn fsm_error(&mut self) {
        if !take(&self.err_flag) {
            return;
        }
        self.enter_state(BotState::Csw);
    }
}

impl<C, L, const N: usize> UsbInterface<C> for BulkOnly<L, N>
where
    C: UsbController,
    L: Lun,
{
    fn reset(&mut self, _bus: &mut DeviceCore<C>) {
        self.rst_flag.store(RESET_BUS, Ordering::Release);
        self.scsi.reset();
    }

    fn enable(&mut self, bus: &mut DeviceCore<C>, cfg_id: u8) {
        let _ = cfg_id;
        bus.ep_configure(BULK_OUT_EP, EpType::Bulk, EpConfig { rx: true, tx: false });
        bus.ep_configure(BULK_IN_EP, EpType::Bulk, EpConfig { rx: false, tx: true });
        info!("usb: bbb: enabled");
    }

    fn periodic(&mut self, bus: &mut DeviceCore<C>) {
        // Finish a pending reset before anything else
        let rst = self.rst_flag.swap(RESET_NONE, Ordering::Acquire);
        if rst != RESET_NONE {
            self.state = BotState::Cbw;
            self.csw_sent = false;
            self.more_data = false;
            self.truncated = false;
            self.data_len = 0;
            self.data_offset = 0;
            self.rx_flag.store(false, Ordering::Release);
            self.tx_flag.store(false, Ordering::Release);
            self.err_flag.store(false, Ordering::Release);
            self.scsi.complete();
            if rst == RESET_CLASS {
                // A stalled pipe is left for the host's Clear Halt sequence
                if bus.ep_state(EpAddr::out(BULK_OUT_EP)) != EpState::Stall {
                    bus.ep_set_state(EpAddr::out(BULK_OUT_EP), EpState::Valid);
                }
                // Acknowledge the reset request on EP0
                bus.send(0, &[]);
            }
            info!("usb: bbb: reset done");
        }

        match self.state {
            BotState::Cbw => self.fsm_cbw(bus),
            BotState::DataIn => self.fsm_data_in(bus),
            BotState::DataOut => self.fsm_data_out(bus),
            BotState::Csw => self.fsm_csw(bus),
            BotState::Error => self.fsm_error(),
        }
    }

    fn ctrl_req(
        &mut self,
        bus: &mut DeviceCore<C>,
        req: &SetupPacket,
        data: Option<&[u8]>,
    ) -> CtrlOutcome {
        // No class request of this interface carries an OUT data stage
        if data.is_some() {
            return CtrlOutcome::Handled;
        }

        match (req.bm_request_type, req.b_request) {
            // Spec. section 3.2
            (0xA1, CLASS_SPECIFIC_GET_MAX_LUN) => {
                let max_lun = self.scsi.lun_count().saturating_sub(1);
                debug!("usb: bbb: get max lun -> {=u8}", max_lun);
                bus.send(0, &[max_lun]);
                CtrlOutcome::Handled
            }
            // Spec. section 3.1, Reset Recovery. Completed from the periodic
            // hook to avoid racing the session state machine.
            (0x21, CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET) => {
                info!("usb: bbb: class reset");
                self.rst_flag.store(RESET_CLASS, Ordering::Release);
                CtrlOutcome::Handled
            }
            _ => CtrlOutcome::Stall,
        }
    }

    fn ep_rx(&mut self, _bus: &mut DeviceCore<C>, ep: u8, data: &[u8]) -> EpState {
        if ep != BULK_OUT_EP {
            return EpState::Valid;
        }
        trace!("usb: bbb: rx {=usize} bytes", data.len());

        if self.state == BotState::DataOut {
            let n = self.scsi.io_mut().extend(data);
            self.data_offset += n;
            if self.data_offset >= self.data_len {
                // Chunk complete, hold the pipe until the main loop ran
                raise(&self.rx_flag);
                EpState::Nak
            } else {
                EpState::Valid
            }
        } else {
            let n = data.len().min(self.cbw_raw.len());
            self.cbw_raw[..n].copy_from_slice(&data[..n]);
            self.cbw_raw_len = n;
            raise(&self.rx_flag);
            EpState::Nak
        }
    }

    fn ep_tx_complete(&mut self, bus: &mut DeviceCore<C>, ep: u8) -> bool {
        if ep != BULK_IN_EP {
            return false;
        }

        match self.state {
            BotState::DataIn => {
                if self.data_offset >= self.data_len {
                    raise(&self.tx_flag);
                    false
                } else {
                    self.send_data_chunk(bus);
                    true
                }
            }
            BotState::Csw => {
                raise(&self.tx_flag);
                false
            }
            _ => false,
        }
    }

    fn ep_release(&mut self, ep: EpAddr) -> EpState {
        debug!("usb: bbb: release ep{=u8}", ep.number());

        if matches!(self.state, BotState::Error | BotState::Csw) {
            raise(&self.err_flag);
        }

        if self.state == BotState::Cbw && !ep.is_in() && ep.number() == BULK_OUT_EP {
            EpState::Valid
        } else if self.state == BotState::Csw && ep.is_in() && self.csw_sent {
            // A queued CSW survives the recovery sequence
            EpState::Valid
        } else {
            EpState::Nak
        }
    }
}
