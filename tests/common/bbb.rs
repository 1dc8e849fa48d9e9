//! Host-side Bulk Only Transport helpers: CBW building, CSW parsing and the
//! bulk pipe pumping loops.

use cowstick_ums::device::controller::EpState;
use cowstick_ums::device::UsbInterface;

use crate::common::{clear_halt, Dev, MockController};

pub const BULK_IN_ADDR: u8 = 0x81;
pub const BULK_OUT_ADDR: u8 = 0x02;

const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

#[derive(Debug, Copy, Clone)]
pub enum DataDirection {
    Out,
    In,
    NotExpected,
}

pub struct Cbw {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    pub block: Vec<u8>,
}

impl Cbw {
    pub fn new(tag: u32, len: u32, direction: DataDirection, block: Vec<u8>) -> Cbw {
        Cbw {
            tag,
            data_transfer_len: len,
            direction,
            lun: 0,
            block,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        assert!((1..=16).contains(&self.block.len()));

        let mut bytes = vec![];
        bytes.extend_from_slice(CBW_SIGNATURE_LE.as_slice());
        bytes.extend_from_slice(self.tag.to_le_bytes().as_slice());
        bytes.extend_from_slice(self.data_transfer_len.to_le_bytes().as_slice());

        let direction = match self.direction {
            DataDirection::In => 1u8 << 7,
            DataDirection::Out | DataDirection::NotExpected => 0u8,
        };
        bytes.push(direction);
        bytes.push(self.lun);
        bytes.push(self.block.len() as u8);

        let mut block = vec![0u8; 16];
        block[..self.block.len()].copy_from_slice(self.block.as_slice());
        bytes.extend_from_slice(block.as_slice());

        bytes
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct CswResult {
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

/// Send a CBW on the bulk-OUT pipe, retrying while the device holds it NAKed
pub fn write_cbw<IF: UsbInterface<MockController>>(
    ctrl: &MockController,
    dev: &mut Dev<IF>,
    cbw: Cbw,
) -> bool {
    let bytes = cbw.into_bytes();
    for _ in 0..50 {
        if ctrl.deliver_out(2, &bytes, false) {
            dev.handle_interrupt();
            dev.periodic();
            return true;
        }
        dev.periodic();
    }
    false
}

/// Read up to `n` bytes from the bulk-IN pipe, interleaving main-loop passes
pub fn read_in_bytes<IF: UsbInterface<MockController>>(
    ctrl: &MockController,
    dev: &mut Dev<IF>,
    n: usize,
) -> Vec<u8> {
    let mut out = vec![];
    let mut idle = 0;
    while out.len() < n && idle < 50 {
        dev.periodic();
        match ctrl.take_in(1) {
            Some(packet) => {
                dev.handle_interrupt();
                out.extend(packet);
                idle = 0;
            }
            None => idle += 1,
        }
    }
    out
}

/// Read and decode the CSW that closes the current transaction
pub fn read_csw<IF: UsbInterface<MockController>>(
    ctrl: &MockController,
    dev: &mut Dev<IF>,
) -> Option<CswResult> {
    let bytes = read_in_bytes(ctrl, dev, 13);
    if bytes.len() != 13 || bytes[..4] != CSW_SIGNATURE_LE {
        return None;
    }
    // Let the session re-arm for the next command
    dev.periodic();

    Some(CswResult {
        tag: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        residue: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        status: bytes[12],
    })
}

/// Stream data to the bulk-OUT pipe in packet-sized pieces, returning how
/// many bytes the device actually accepted (it may STALL mid-transfer).
pub fn write_out_bytes<IF: UsbInterface<MockController>>(
    ctrl: &MockController,
    dev: &mut Dev<IF>,
    data: &[u8],
) -> usize {
    let mut sent = 0;
    for chunk in data.chunks(64) {
        let mut tries = 0;
        loop {
            if ctrl.stat_rx(2) == EpState::Stall as u32 {
                return sent;
            }
            if ctrl.deliver_out(2, chunk, false) {
                dev.handle_interrupt();
                sent += chunk.len();
                break;
            }
            dev.periodic();
            tries += 1;
            if tries > 50 {
                return sent;
            }
        }
    }
    dev.periodic();
    sent
}

pub fn in_stalled(ctrl: &MockController) -> bool {
    ctrl.stat_tx(1) == EpState::Stall as u32
}

pub fn out_stalled(ctrl: &MockController) -> bool {
    ctrl.stat_rx(2) == EpState::Stall as u32
}

/// The host half of Reset Recovery: class reset then both Clear Halts
pub fn reset_recovery<IF: UsbInterface<MockController>>(
    ctrl: &MockController,
    dev: &mut Dev<IF>,
) {
    crate::common::control(ctrl, dev, 0x21, 0xFF, 0, 0, 0).expect("bulk only reset");
    clear_halt(ctrl, dev, BULK_IN_ADDR).expect("clear halt IN");
    clear_halt(ctrl, dev, BULK_OUT_ADDR).expect("clear halt OUT");
}
