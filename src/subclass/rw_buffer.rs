//! READ BUFFER / WRITE BUFFER diagnostic commands
//!
//! Extension of the SCSI layer giving the host access to an internal echo
//! buffer, to raw device memory regions and to the microcode flash region.
//! Every mode is gated by the LUN permission mask.

use crate::fmt::{debug, error, info, warn};
use crate::subclass::{
    CommandError, Flow, IoBuffer, Lun, RequestSense, ASC_INVALID_FIELD_IN_CDB, ASC_WRITE_ERROR,
    BLOCK_SIZE, PERM_READ_BUFFER, PERM_WRITE_BUFFER, SENSE_KEY_ILLEGAL_REQUEST,
    SENSE_KEY_MEDIUM_ERROR,
};

/// Size of the internal echo buffer
pub const ECHO_BUFFER_LEN: usize = 1024;

/// Largest accepted microcode image
const MICROCODE_MAX_LEN: u32 = 65536;

/* Buffer command modes (SPC-4 6.15 / 6.35 subset) */
const MODE_DATA: u8 = 0x02;
const MODE_DESCRIPTOR: u8 = 0x03;
const MODE_DOWNLOAD_MICROCODE: u8 = 0x04;
const MODE_DOWNLOAD_MICROCODE_SAVE: u8 = 0x05;
const MODE_ECHO: u8 = 0x0A;

fn invalid_field(sense: &mut RequestSense) -> Result<Flow, CommandError> {
    sense.set(SENSE_KEY_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CDB, 0);
    Err(CommandError::Rejected)
}

/// READ BUFFER: diagnostic read of device memory
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_buffer<L: Lun>(
    unit: &mut L,
    mode: u8,
    buffer_id: u8,
    offset: u32,
    length: u32,
    io: &mut IoBuffer,
    ctx: &mut u32,
    sense: &mut RequestSense,
    echo: &[u8; ECHO_BUFFER_LEN],
) -> Result<Flow, CommandError> {
    if unit.permissions() & PERM_READ_BUFFER == 0 {
        warn!("scsi: read buffer not permitted");
        return invalid_field(sense);
    }

    match mode {
        MODE_DATA => mem_read(unit, buffer_id, offset, length, io, ctx, sense),
        MODE_DESCRIPTOR => mem_desc(unit, buffer_id, io, sense),
        MODE_ECHO => echo_read(offset, length, io, ctx, sense, echo),
        _ => {
            warn!("scsi: read buffer unknown mode {=u8:x}", mode);
            invalid_field(sense)
        }
    }
}

/// WRITE BUFFER: echo loopback or microcode download
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_buffer<L: Lun>(
    unit: &mut L,
    mode: u8,
    buffer_id: u8,
    offset: u32,
    param_len: u32,
    io: &mut IoBuffer,
    ctx: &mut u32,
    sense: &mut RequestSense,
    echo: &mut [u8; ECHO_BUFFER_LEN],
) -> Result<Flow, CommandError> {
    let _ = buffer_id;

    if unit.permissions() & PERM_WRITE_BUFFER == 0 {
        warn!("scsi: write buffer not permitted");
        return invalid_field(sense);
    }

    match mode {
        MODE_ECHO => echo_write(offset, param_len, io, ctx, sense, echo),
        MODE_DOWNLOAD_MICROCODE | MODE_DOWNLOAD_MICROCODE_SAVE => {
            microcode_write(unit, param_len, io, ctx, sense)
        }
        _ => {
            warn!("scsi: write buffer unknown mode {=u8:x}", mode);
            invalid_field(sense)
        }
    }
}

fn echo_read(
    offset: u32,
    length: u32,
    io: &mut IoBuffer,
    ctx: &mut u32,
    sense: &mut RequestSense,
    echo: &[u8; ECHO_BUFFER_LEN],
) -> Result<Flow, CommandError> {
    if *ctx == 0 {
        debug!("scsi: read buffer (echo) offset={=u32} len={=u32}", offset, length);
        if length as usize > ECHO_BUFFER_LEN {
            return invalid_field(sense);
        }
    }

    let remaining = length.saturating_sub(*ctx) as usize;
    let addr = (offset + *ctx) as usize;
    let available = ECHO_BUFFER_LEN.saturating_sub(addr);
    let chunk = remaining.min(BLOCK_SIZE).min(available);
    if chunk == 0 {
        return Ok(Flow::Done);
    }

    io.set(&echo[addr..addr + chunk]);
    *ctx += chunk as u32;
    Ok(Flow::DataInMore)
}

fn echo_write(
    offset: u32,
    param_len: u32,
    io: &mut IoBuffer,
    ctx: &mut u32,
    sense: &mut RequestSense,
    echo: &mut [u8; ECHO_BUFFER_LEN],
) -> Result<Flow, CommandError> {
    if *ctx == 0 {
        debug!("scsi: write buffer (echo) offset={=u32} len={=u32}", offset, param_len);
        if (offset + param_len) as usize > ECHO_BUFFER_LEN {
            return invalid_field(sense);
        }
        io.clear();
        *ctx = 1;
        return Ok(Flow::DataOutMore);
    }

    let done = *ctx - 1;
    let addr = (offset + done) as usize;
    let len = io.len().min(ECHO_BUFFER_LEN - addr);
    echo[addr..addr + len].copy_from_slice(&io.bytes()[..len]);

    *ctx += io.len() as u32;
    io.clear();
    if *ctx - 1 < param_len {
        Ok(Flow::DataOutMore)
    } else {
        Ok(Flow::Done)
    }
}

fn mem_desc<L: Lun>(
    unit: &mut L,
    buffer_id: u8,
    io: &mut IoBuffer,
    sense: &mut RequestSense,
) -> Result<Flow, CommandError> {
    debug!("scsi: read buffer descriptor id={=u8}", buffer_id);

    match unit.buffer_descriptor(buffer_id) {
        Some((boundary, capacity)) => {
            let mut rsp = [0u8; 4];
            rsp[0] = boundary;
            rsp[1..4].copy_from_slice(&capacity.to_be_bytes()[1..]);
            io.set(&rsp);
            Ok(Flow::DataIn)
        }
        None => {
            warn!("scsi: read buffer invalid buffer id {=u8}", buffer_id);
            invalid_field(sense)
        }
    }
}

fn mem_read<L: Lun>(
    unit: &mut L,
    buffer_id: u8,
    offset: u32,
    length: u32,
    io: &mut IoBuffer,
    ctx: &mut u32,
    sense: &mut RequestSense,
) -> Result<Flow, CommandError> {
    if *ctx == 0 {
        debug!(
            "scsi: read buffer (mem) id={=u8} offset={=u32} len={=u32}",
            buffer_id, offset, length
        );
    }

    let remaining = length.saturating_sub(*ctx) as usize;
    if remaining == 0 {
        return Ok(Flow::Done);
    }
    let chunk = remaining.min(BLOCK_SIZE);

    match unit.buffer_read(buffer_id, offset + *ctx, &mut io.data_mut()[..chunk]) {
        Ok(n) => {
            io.commit(n);
            *ctx += n as u32;
            Ok(Flow::DataInMore)
        }
        Err(_) => {
            warn!("scsi: read buffer invalid buffer id {=u8}", buffer_id);
            invalid_field(sense)
        }
    }
}

fn microcode_write<L: Lun>(
    unit: &mut L,
    param_len: u32,
    io: &mut IoBuffer,
    ctx: &mut u32,
    sense: &mut RequestSense,
) -> Result<Flow, CommandError> {
    if *ctx == 0 {
        info!("scsi: write buffer (microcode) len={=u32}", param_len);

        if param_len > MICROCODE_MAX_LEN {
            return invalid_field(sense);
        }
        if unit.microcode_erase().is_err() {
            sense.set(SENSE_KEY_MEDIUM_ERROR, ASC_WRITE_ERROR, 0);
            return Err(CommandError::Failed);
        }
        io.clear();
        *ctx = 1;
        return Ok(Flow::DataOutMore);
    }

    let offset = *ctx - 1;
    if unit.microcode_write(offset, io.bytes()).is_err() {
        error!("scsi: microcode write failed at {=u32:x}", offset);
        sense.set(SENSE_KEY_MEDIUM_ERROR, ASC_WRITE_ERROR, 0);
        return Err(CommandError::Failed);
    }

    *ctx += io.len() as u32;
    io.clear();
    if *ctx - 1 < param_len {
        Ok(Flow::DataOutMore)
    } else {
        Ok(Flow::Done)
    }
}
