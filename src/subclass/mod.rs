//! SCSI subclass: logical units and shared command types

pub mod scsi;

#[cfg(feature = "rw-buffer")]
pub mod rw_buffer;

/// Sector size of every logical unit, in bytes
pub const BLOCK_SIZE: usize = 512;

/* LUN permission mask */
/// Allow READ BUFFER diagnostic access
pub const PERM_READ_BUFFER: u32 = 1 << 0;
/// Allow WRITE BUFFER diagnostic access
pub const PERM_WRITE_BUFFER: u32 = 1 << 1;

/// Medium state of a logical unit. The embedding application may flip this
/// at any time between transactions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MediumState {
    NotPresent,
    Ready,
}

/// Storage-side failure reported by a [Lun] callback
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LunError;

/// Outcome of a successfully decoded SCSI command, telling the transport
/// which data phase comes next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Flow {
    /// Command complete, no data phase
    Done,
    /// IN payload staged in the io buffer, last chunk
    DataIn,
    /// IN payload staged, invoke the command again for the next chunk
    DataInMore,
    /// OUT payload expected, more will follow
    DataOutMore,
    /// OUT payload expected, last chunk
    DataOutLast,
}

/// Command failure; sense data is populated before this is returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Processing failed
    Failed,
    /// Command refused (unit not ready, write protected, invalid field)
    Rejected,
}

/// A logical unit: the block device behind one LUN of the SCSI target.
///
/// `addr` arguments are byte addresses (LBA * 512). The diagnostic buffer
/// hooks back READ BUFFER / WRITE BUFFER; a unit that does not expose device
/// memory keeps the defaults and gates them off with its permission mask.
pub trait Lun {
    fn medium_state(&self) -> MediumState;

    /// Capacity in 512-byte sectors
    fn capacity_blocks(&self) -> u32;

    fn writable(&self) -> bool;

    /// Permission mask (`PERM_*` bits)
    fn permissions(&self) -> u32 {
        0
    }

    /// Read into `buf`, returning the number of bytes actually read
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, LunError>;

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), LunError>;

    /// Called once before the first block of a WRITE transaction
    fn write_preload(&mut self, _addr: u32) -> Result<(), LunError> {
        Ok(())
    }

    /// Called after the last block of a WRITE transaction
    fn write_complete(&mut self) -> Result<(), LunError> {
        Ok(())
    }

    /// Vendor-specific command hook (CDB groups 6 and 7). `ctx` persists
    /// across invocations of one chunked transaction, `io` is the shared
    /// staging buffer. `None` rejects the command.
    fn vendor_command(
        &mut self,
        _ctx: &mut u32,
        _cb: &[u8],
        _io: &mut IoBuffer,
    ) -> Option<Result<Flow, CommandError>> {
        None
    }

    /// Capacity and alignment of a diagnostic buffer: `(offset_boundary,
    /// capacity)` as reported by READ BUFFER descriptor mode
    #[cfg(feature = "rw-buffer")]
    fn buffer_descriptor(&self, _id: u8) -> Option<(u8, u32)> {
        None
    }

    /// Raw read of a diagnostic buffer region
    #[cfg(feature = "rw-buffer")]
    fn buffer_read(&mut self, _id: u8, _offset: u32, _dst: &mut [u8]) -> Result<usize, LunError> {
        Err(LunError)
    }

    /// Erase the microcode region before a WRITE BUFFER download
    #[cfg(feature = "rw-buffer")]
    fn microcode_erase(&mut self) -> Result<(), LunError> {
        Err(LunError)
    }

    /// Program one chunk of a WRITE BUFFER microcode download
    #[cfg(feature = "rw-buffer")]
    fn microcode_write(&mut self, _offset: u32, _data: &[u8]) -> Result<(), LunError> {
        Err(LunError)
    }
}

/// The staging buffer shared between the SCSI layer and the transport: one
/// sector of response or write data plus its fill level.
pub struct IoBuffer {
    data: [u8; BLOCK_SIZE],
    len: usize,
}

impl IoBuffer {
    pub(crate) fn new() -> IoBuffer {
        IoBuffer {
            data: [0; BLOCK_SIZE],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The staged bytes
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space left for incoming data
    pub fn space(&self) -> usize {
        BLOCK_SIZE - self.len
    }

    /// Append, returning the number of bytes actually taken
    pub fn extend(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.space());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Replace the content with `src`
    pub fn set(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= BLOCK_SIZE);
        self.data[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }

    /// Mutable access for in-place staging; `commit` fixes the length
    pub fn data_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data
    }

    pub fn commit(&mut self, len: usize) {
        debug_assert!(len <= BLOCK_SIZE);
        self.len = len;
    }
}

/* Sense keys */
pub const SENSE_KEY_NOT_READY: u8 = 0x02;
pub const SENSE_KEY_MEDIUM_ERROR: u8 = 0x03;
pub const SENSE_KEY_HARDWARE_ERROR: u8 = 0x04;
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_KEY_DATA_PROTECT: u8 = 0x07;

/* Additional sense codes */
pub const ASC_NO_INDEX: u8 = 0x01;
pub const ASC_WRITE_ERROR: u8 = 0x0C;
pub const ASC_INVALID_COMMAND: u8 = 0x20;
pub const ASC_INVALID_FIELD_IN_CDB: u8 = 0x24;
pub const ASC_LUN_NOT_SUPPORTED: u8 = 0x25;
pub const ASC_WRITE_PROTECTED: u8 = 0x27;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

/// Fixed-format sense data (SPC-4). Populated by command processing, drained
/// and cleared by REQUEST SENSE.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestSense {
    pub code: u8,
    pub key: u8,
    pub info: u32,
    pub length: u8,
    pub cmd_info: u32,
    pub asc: u8,
    pub ascq: u8,
}

impl RequestSense {
    pub(crate) fn new() -> RequestSense {
        RequestSense {
            code: 0x70,
            key: 0,
            info: 0,
            length: 10,
            cmd_info: 0,
            asc: 0,
            ascq: 0,
        }
    }

    pub(crate) fn set(&mut self, key: u8, asc: u8, ascq: u8) {
        self.key = key;
        self.asc = asc;
        self.ascq = ascq;
    }

    /// Clear the error fields, keeping response code and additional length
    pub(crate) fn clear(&mut self) {
        self.set(0, 0, 0);
    }

    /// Wire encoding, 18 bytes
    pub fn to_bytes(&self) -> [u8; 18] {
        let mut bytes = [0u8; 18];
        bytes[0] = self.code;
        bytes[2] = self.key;
        bytes[3..7].copy_from_slice(&self.info.to_be_bytes());
        bytes[7] = self.length;
        bytes[8..12].copy_from_slice(&self.cmd_info.to_be_bytes());
        bytes[12] = self.asc;
        bytes[13] = self.ascq;
        bytes
    }
}
