//! SCSI command set (SPC-4 / SBC-3 subset)
//!
//! Decodes the CDB carried by a CBW and produces response data plus the next
//! data-phase hint for the transport. Commands are grouped by CDB length
//! (byte 0, bits 7:5): group 0 is six bytes, groups 1 and 2 ten bytes,
//! groups 6 and 7 are vendor specific.

use crate::fmt::{debug, error, info, warn};
use crate::subclass::{
    CommandError, Flow, IoBuffer, Lun, MediumState, RequestSense, ASC_INVALID_COMMAND,
    ASC_INVALID_FIELD_IN_CDB, ASC_LUN_NOT_SUPPORTED, ASC_MEDIUM_NOT_PRESENT, ASC_NO_INDEX,
    ASC_WRITE_ERROR, ASC_WRITE_PROTECTED, BLOCK_SIZE, SENSE_KEY_DATA_PROTECT,
    SENSE_KEY_ILLEGAL_REQUEST, SENSE_KEY_MEDIUM_ERROR, SENSE_KEY_NOT_READY,
};
use num_enum::TryFromPrimitive;

#[cfg(feature = "rw-buffer")]
use crate::subclass::rw_buffer::{self, ECHO_BUFFER_LEN};

/* SPC */
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const START_STOP_UNIT: u8 = 0x1B;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;

/* SBC */
const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;

/* MMC */
const READ_FORMAT_CAPACITIES: u8 = 0x23;

/* Diagnostic */
#[cfg(feature = "rw-buffer")]
const WRITE_BUFFER: u8 = 0x3B;
#[cfg(feature = "rw-buffer")]
const READ_BUFFER: u8 = 0x3C;

/// Standard INQUIRY response (36 bytes): direct access block device,
/// removable, SPC-2 level
const INQUIRY_STD: [u8; 36] = [
    0x00, 0x80, 0x02, 0x02, 32, 0x01, 0x00, 0x00, //
    b'A', b'G', b'I', b'L', b'A', b'C', b'K', b' ', //
    b'C', b'o', b'w', b's', b't', b'i', b'c', b'k', //
    b'-', b'U', b'M', b'S', b' ', b' ', b' ', b' ', //
    b'd', b'e', b'v', b'0',
];

/// VPD page 0x00: supported pages (0x00, 0x80, 0x83)
const VPD_PAGE_LIST: [u8; 7] = [0x00, 0x00, 0x00, 3, 0x00, 0x80, 0x83];

/// VPD page 0x80: unit serial number
const VPD_SERIAL_NUMBER: [u8; 20] = [
    0x00, 0x80, 0x00, 16, //
    b'7', b'0', b'B', b'3', b'D', b'5', b'4', b'C', //
    b'E', b'8', b'0', b'1', b'0', b'0', b'0', b'0',
];

/// VPD page 0x83: device identification, T10 vendor id plus EUI-64
const VPD_DEVICE_ID: [u8; 28] = [
    0x00, 0x83, 0x00, 24, //
    0x02, 0x01, 0x00, 0x08, b'A', b'G', b'I', b'L', b'A', b'C', b'K', 0x00, //
    0x01, 0x02, 0x00, 0x08, 0x70, 0xB3, 0xD5, 0x4C, 0xE8, 0x01, 0x00, 0x00,
];

/// SCSI command decoded from a CDB
///
/// Refer to specifications (SPC, SAM, SBC, MMC, etc.)
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ScsiCommand {
    Unknown,

    /* SPC */
    TestUnitReady,
    RequestSense {
        alloc_len: u8,
    },
    Inquiry {
        /// Raw byte 1, reserved bits included (they must be zero)
        flags: u8,
        page_code: u8,
        alloc_len: u16,
    },
    ModeSense6 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        alloc_len: u8,
    },
    StartStopUnit {
        start: bool,
        load_eject: bool,
    },
    PreventAllowMediumRemoval {
        prevent: bool,
    },

    /* SBC */
    ReadCapacity10,
    Read {
        lba: u32,
        len: u16,
    },
    Write {
        lba: u32,
        len: u16,
    },

    /* MMC */
    ReadFormatCapacities {
        alloc_len: u16,
    },

    /* Diagnostic buffer access */
    #[cfg(feature = "rw-buffer")]
    ReadBuffer {
        mode: u8,
        buffer_id: u8,
        offset: u32,
        alloc_len: u32,
    },
    #[cfg(feature = "rw-buffer")]
    WriteBuffer {
        mode: u8,
        buffer_id: u8,
        offset: u32,
        param_len: u32,
    },
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageControl {
    CurrentValues = 0b00,
    ChangeableValues = 0b01,
    DefaultValues = 0b10,
    SavedValues = 0b11,
}

/// 24-bit big-endian field, as used by the buffer commands
#[cfg(feature = "rw-buffer")]
fn be24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

fn parse_cb(cb: &[u8]) -> ScsiCommand {
    match cb[0] {
        TEST_UNIT_READY => ScsiCommand::TestUnitReady,
        REQUEST_SENSE => ScsiCommand::RequestSense { alloc_len: cb[4] },
        INQUIRY => ScsiCommand::Inquiry {
            flags: cb[1],
            page_code: cb[2],
            alloc_len: u16::from_be_bytes([cb[3], cb[4]]),
        },
        MODE_SENSE_6 => ScsiCommand::ModeSense6 {
            dbd: (cb[1] & 0b00001000) != 0,
            page_control: PageControl::try_from_primitive(cb[2] >> 6).unwrap(),
            page_code: cb[2] & 0b00111111,
            alloc_len: cb[4],
        },
        START_STOP_UNIT => ScsiCommand::StartStopUnit {
            start: (cb[4] & 0b00000001) != 0,
            load_eject: (cb[4] & 0b00000010) != 0,
        },
        PREVENT_ALLOW_MEDIUM_REMOVAL => ScsiCommand::PreventAllowMediumRemoval {
            prevent: (cb[4] & 0b00000011) != 0,
        },
        READ_CAPACITY_10 => ScsiCommand::ReadCapacity10,
        READ_10 => ScsiCommand::Read {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        WRITE_10 => ScsiCommand::Write {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        READ_FORMAT_CAPACITIES => ScsiCommand::ReadFormatCapacities {
            alloc_len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        #[cfg(feature = "rw-buffer")]
        READ_BUFFER => ScsiCommand::ReadBuffer {
            mode: cb[1],
            buffer_id: cb[2],
            offset: be24(&cb[3..6]),
            alloc_len: be24(&cb[6..9]),
        },
        #[cfg(feature = "rw-buffer")]
        WRITE_BUFFER => ScsiCommand::WriteBuffer {
            mode: cb[1],
            buffer_id: cb[2],
            offset: be24(&cb[3..6]),
            param_len: be24(&cb[6..9]),
        },
        _ => ScsiCommand::Unknown,
    }
}

/// The SCSI target: command decode plus a fixed set of logical units.
///
/// One command block may be processed over several invocations of
/// [ScsiTarget::command] (chunked reads and writes); the per-transaction
/// context survives until [ScsiTarget::complete].
pub struct ScsiTarget<L: Lun, const N: usize = 1> {
    luns: [L; N],
    io: IoBuffer,
    ctx: u32,
    sense: RequestSense,
    #[cfg(feature = "rw-buffer")]
    echo: [u8; ECHO_BUFFER_LEN],
}

impl<L: Lun, const N: usize> ScsiTarget<L, N> {
    pub fn new(luns: [L; N]) -> ScsiTarget<L, N> {
        ScsiTarget {
            luns,
            io: IoBuffer::new(),
            ctx: 0,
            sense: RequestSense::new(),
            #[cfg(feature = "rw-buffer")]
            echo: [0; ECHO_BUFFER_LEN],
        }
    }

    /// Abort any transaction in progress and clear the sense data
    pub fn reset(&mut self) {
        self.ctx = 0;
        self.io.clear();
        self.sense = RequestSense::new();
        info!("scsi: reset");
    }

    pub fn lun_count(&self) -> u8 {
        N as u8
    }

    pub fn lun(&mut self, index: u8) -> Option<&mut L> {
        self.luns.get_mut(index as usize)
    }

    pub fn sense(&self) -> &RequestSense {
        &self.sense
    }

    /// The staged IN payload of the last command
    pub fn response(&self) -> &[u8] {
        self.io.bytes()
    }

    /// Staging buffer for host-to-device data phases
    pub fn io_mut(&mut self) -> &mut IoBuffer {
        &mut self.io
    }

    /// End of the current transaction: forget the chunking context
    pub fn complete(&mut self) {
        self.ctx = 0;
        self.io.clear();
    }

    /// Decode and process one SCSI command invocation.
    ///
    /// Small commands finish in a single call; READ, WRITE and the buffer
    /// commands are re-invoked with the same CDB once per chunk, tracked by
    /// the internal context counter.
    pub fn command(&mut self, cb: &[u8], lun: u8) -> Result<Flow, CommandError> {
        if cb.is_empty() {
            return Err(CommandError::Failed);
        }

        let lun = lun & 0x0F;
        if lun as usize >= N {
            self.sense
                .set(SENSE_KEY_ILLEGAL_REQUEST, ASC_LUN_NOT_SUPPORTED, 0);
            return Err(CommandError::Failed);
        }

        match (cb[0] >> 5) & 7 {
            0 => {
                if cb.len() < 6 {
                    return self.illegal_command();
                }
                self.cmd6(cb, lun)
            }
            1 | 2 => {
                if cb.len() < 10 {
                    return self.illegal_command();
                }
                self.cmd10(cb, lun)
            }
            4 => {
                warn!("scsi: CDB-16 commands not supported");
                self.illegal_command()
            }
            5 => {
                warn!("scsi: CDB-12 commands not supported");
                self.illegal_command()
            }
            6 | 7 => self.vendor(cb, lun),
            _ => {
                warn!("scsi: unknown CDB format");
                self.illegal_command()
            }
        }
    }

    fn illegal_command(&mut self) -> Result<Flow, CommandError> {
        self.sense
            .set(SENSE_KEY_ILLEGAL_REQUEST, ASC_INVALID_COMMAND, 0);
        Err(CommandError::Failed)
    }

    fn invalid_field(&mut self) -> Result<Flow, CommandError> {
        self.sense
            .set(SENSE_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0);
        Err(CommandError::Failed)
    }

    fn cmd6(&mut self, cb: &[u8], lun: u8) -> Result<Flow, CommandError> {
        match parse_cb(cb) {
            ScsiCommand::TestUnitReady => self.test_unit_ready(lun),
            ScsiCommand::RequestSense { .. } => self.request_sense(),
            ScsiCommand::Inquiry {
                flags, page_code, ..
            } => self.inquiry(flags, page_code),
            ScsiCommand::ModeSense6 { .. } => self.mode_sense(lun),
            ScsiCommand::StartStopUnit { start, load_eject } => {
                debug!(
                    "scsi: start/stop unit start={=bool} load_eject={=bool}",
                    start, load_eject
                );
                Ok(Flow::Done)
            }
            ScsiCommand::PreventAllowMediumRemoval { prevent } => {
                debug!("scsi: prevent/allow medium removal {=bool}", prevent);
                Ok(Flow::Done)
            }
            _ => {
                warn!("scsi: unknown CMD6 {=u8:x}", cb[0]);
                self.illegal_command()
            }
        }
    }

    fn cmd10(&mut self, cb: &[u8], lun: u8) -> Result<Flow, CommandError> {
        match parse_cb(cb) {
            ScsiCommand::ReadFormatCapacities { .. } => self.read_format_capacities(lun),
            ScsiCommand::ReadCapacity10 => self.read_capacity(lun),
            ScsiCommand::Read { lba, len } => cmd_read(
                &mut self.luns[lun as usize],
                &mut self.io,
                &mut self.sense,
                &mut self.ctx,
                lba,
                len,
            ),
            ScsiCommand::Write { lba, len } => cmd_write(
                &mut self.luns[lun as usize],
                &mut self.io,
                &mut self.sense,
                &mut self.ctx,
                lba,
                len,
            ),
            #[cfg(feature = "rw-buffer")]
            ScsiCommand::ReadBuffer {
                mode,
                buffer_id,
                offset,
                alloc_len,
            } => rw_buffer::read_buffer(
                &mut self.luns[lun as usize],
                mode,
                buffer_id,
                offset,
                alloc_len,
                &mut self.io,
                &mut self.ctx,
                &mut self.sense,
                &self.echo,
            ),
            #[cfg(feature = "rw-buffer")]
            ScsiCommand::WriteBuffer {
                mode,
                buffer_id,
                offset,
                param_len,
            } => rw_buffer::write_buffer(
                &mut self.luns[lun as usize],
                mode,
                buffer_id,
                offset,
                param_len,
                &mut self.io,
                &mut self.ctx,
                &mut self.sense,
                &mut self.echo,
            ),
            _ => {
                warn!("scsi: unknown CMD10 {=u8:x}", cb[0]);
                self.illegal_command()
            }
        }
    }

    fn vendor(&mut self, cb: &[u8], lun: u8) -> Result<Flow, CommandError> {
        debug!("scsi: vendor command {=u8:x}", cb[0]);
        match self.luns[lun as usize].vendor_command(&mut self.ctx, cb, &mut self.io) {
            Some(result) => result,
            None => self.illegal_command(),
        }
    }

    fn test_unit_ready(&mut self, lun: u8) -> Result<Flow, CommandError> {
        if self.luns[lun as usize].medium_state() != MediumState::Ready {
            self.sense
                .set(SENSE_KEY_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 0);
            return Err(CommandError::Rejected);
        }
        Ok(Flow::Done)
    }

    fn request_sense(&mut self) -> Result<Flow, CommandError> {
        info!(
            "scsi: request sense key={=u8:x} asc={=u8:x} ascq={=u8:x}",
            self.sense.key, self.sense.asc, self.sense.ascq
        );
        self.io.set(&self.sense.to_bytes());
        // Sense is a one-shot report
        self.sense.clear();
        Ok(Flow::DataIn)
    }

    fn inquiry(&mut self, flags: u8, page_code: u8) -> Result<Flow, CommandError> {
        info!("scsi: inquiry flags={=u8:x} page={=u8:x}", flags, page_code);

        if flags & 0xFE != 0 {
            return self.invalid_field();
        }
        // EVPD set: a specific Vital Product Data page is requested
        if flags & 0x01 != 0 {
            match page_code {
                0x00 => self.io.set(&VPD_PAGE_LIST),
                0x80 => self.io.set(&VPD_SERIAL_NUMBER),
                0x83 => self.io.set(&VPD_DEVICE_ID),
                _ => {
                    warn!("scsi: unknown VPD page {=u8:x}", page_code);
                    return self.invalid_field();
                }
            }
        } else {
            self.io.set(&INQUIRY_STD);
        }
        Ok(Flow::DataIn)
    }

    fn mode_sense(&mut self, lun: u8) -> Result<Flow, CommandError> {
        let writable = self.luns[lun as usize].writable();
        // Device-specific parameter: WP bit when the unit is read-only
        let param: u8 = if writable { 0x00 } else { 0x80 };

        #[cfg(feature = "cache-page")]
        {
            const CACHE_PAGE: [u8; 20] = [
                0x08, 0x12, //
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00,
            ];
            let mut ctrl_page: [u8; 12] = [
                0x0A, 0x0A, //
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ];
            if !writable {
                ctrl_page[4] |= 1 << 3; // SWP
            }

            let data = self.io.data_mut();
            data[0] = 0; // fixed below, once the total is known
            data[1] = 0; // medium type
            data[2] = param;
            data[3] = 0; // block descriptor length
            data[4..24].copy_from_slice(&CACHE_PAGE);
            data[24..36].copy_from_slice(&ctrl_page);
            data[0] = 36 - 1;
            self.io.commit(36);
        }
        #[cfg(not(feature = "cache-page"))]
        {
            self.io.set(&[0x03, 0, param, 0]);
        }
        Ok(Flow::DataIn)
    }

    fn read_capacity(&mut self, lun: u8) -> Result<Flow, CommandError> {
        info!("scsi: read capacity");
        let capacity = self.luns[lun as usize].capacity_blocks();
        let mut rsp = [0u8; 8];
        rsp[..4].copy_from_slice(&capacity.saturating_sub(1).to_be_bytes());
        rsp[4..].copy_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
        self.io.set(&rsp);
        Ok(Flow::DataIn)
    }

    fn read_format_capacities(&mut self, lun: u8) -> Result<Flow, CommandError> {
        info!("scsi: read format capacities");
        let capacity = self.luns[lun as usize].capacity_blocks();
        let mut rsp = [0u8; 12];
        rsp[3] = 8; // capacity list length, one descriptor
        rsp[4..8].copy_from_slice(&capacity.to_be_bytes());
        rsp[8] = 0x02; // formatted media
        rsp[9..12].copy_from_slice(&(BLOCK_SIZE as u32).to_be_bytes()[1..]);
        self.io.set(&rsp);
        Ok(Flow::DataIn)
    }
}

/// READ(10): one 512-byte block per invocation, context counts blocks done
fn cmd_read<L: Lun>(
    unit: &mut L,
    io: &mut IoBuffer,
    sense: &mut RequestSense,
    ctx: &mut u32,
    lba: u32,
    transfer_len: u16,
) -> Result<Flow, CommandError> {
    if transfer_len == 0 {
        return Ok(Flow::Done);
    }

    if *ctx == 0 {
        info!("scsi: read lba={=u32} count={=u16}", lba, transfer_len);
    }

    let addr = (lba + *ctx) * BLOCK_SIZE as u32;
    match unit.read(addr, io.data_mut()) {
        Ok(n) => io.commit(n),
        Err(_) => {
            error!("scsi: read error at {=u32:x}", addr);
            sense.set(SENSE_KEY_MEDIUM_ERROR, ASC_NO_INDEX, 0);
            return Err(CommandError::Failed);
        }
    }

    *ctx += 1;
    if *ctx < transfer_len as u32 {
        Ok(Flow::DataInMore)
    } else {
        Ok(Flow::DataIn)
    }
}

/// WRITE(10): the first invocation preloads, then one block per received
/// chunk, then the completion callback
fn cmd_write<L: Lun>(
    unit: &mut L,
    io: &mut IoBuffer,
    sense: &mut RequestSense,
    ctx: &mut u32,
    lba: u32,
    transfer_len: u16,
) -> Result<Flow, CommandError> {
    if *ctx == 0 {
        info!("scsi: write lba={=u32} count={=u16}", lba, transfer_len);
    }

    if !unit.writable() {
        warn!("scsi: write protected");
        sense.set(SENSE_KEY_DATA_PROTECT, ASC_WRITE_PROTECTED, 0);
        return Err(CommandError::Rejected);
    }

    if *ctx == 0 {
        let addr = lba * BLOCK_SIZE as u32;
        if unit.write_preload(addr).is_err() {
            error!("scsi: write preload rejected");
            sense.set(SENSE_KEY_MEDIUM_ERROR, ASC_WRITE_ERROR, 0);
            return Err(CommandError::Failed);
        }
    } else {
        let addr = (lba + *ctx - 1) * BLOCK_SIZE as u32;
        if unit.write(addr, io.bytes()).is_err() {
            error!("scsi: write error at {=u32:x}", addr);
            sense.set(SENSE_KEY_MEDIUM_ERROR, ASC_WRITE_ERROR, 0);
            return Err(CommandError::Failed);
        }
    }
    io.clear();

    *ctx += 1;
    if *ctx <= transfer_len as u32 {
        return Ok(Flow::DataOutMore);
    }

    if unit.write_complete().is_err() {
        error!("scsi: write completion failed");
        sense.set(SENSE_KEY_MEDIUM_ERROR, ASC_WRITE_ERROR, 0);
        return Err(CommandError::Failed);
    }
    Ok(Flow::Done)
}
