#![allow(dead_code)]

//! Shared test harness: a mock USB controller with the register semantics of
//! the real part (toggle-only status fields, write-zero-to-clear event flags,
//! packet memory buffer descriptors) plus host-side transaction helpers.

use std::sync::{Arc, Mutex};

use cowstick_ums::device::controller::{istr, EpState, Reg, UsbController};
use cowstick_ums::device::{UsbDevice, UsbInterface};
use cowstick_ums::subclass::{
    Flow, IoBuffer, Lun, LunError, MediumState, PERM_READ_BUFFER, PERM_WRITE_BUFFER,
};

pub mod bbb;
pub mod scsi;

pub type Dev<IF> = UsbDevice<MockController, IF>;

const PMA_WORDS: usize = 256;

struct Inner {
    chep: [u32; 8],
    cntr: u32,
    istr: u32,
    daddr: u32,
    bcdr: u32,
    pma: [u32; PMA_WORDS],
}

impl Inner {
    fn new() -> Inner {
        Inner {
            chep: [0; 8],
            cntr: 0,
            istr: 0,
            daddr: 0,
            bcdr: 0,
            pma: [0; PMA_WORDS],
        }
    }
}

/// Controller double. Clones share state, so a test keeps one handle while
/// the device under test owns the other (the same pattern a bus mock for a
/// shared-bus stack uses).
#[derive(Clone)]
pub struct MockController {
    inner: Arc<Mutex<Inner>>,
}

impl MockController {
    pub fn new() -> MockController {
        MockController {
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Deliver an OUT (or SETUP) packet the way the hardware would: only if
    /// the endpoint is VALID, filling the RX buffer descriptor, moving the
    /// endpoint to NAK and raising a CTR event.
    pub fn deliver_out(&self, ep: u8, data: &[u8], setup: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let chep = inner.chep[ep as usize];
        if (chep >> 12) & 3 != EpState::Valid as u32 {
            return false;
        }

        let bd_idx = ep as usize * 2 + 1;
        let bd = inner.pma[bd_idx];
        let offset = (bd & 0xFFFF) as usize;
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut word = 0u32;
            for (j, byte) in chunk.iter().enumerate() {
                word |= (*byte as u32) << (8 * j);
            }
            inner.pma[offset / 4 + i] = word;
        }
        inner.pma[bd_idx] = (bd & !(0x3FF << 16)) | ((data.len() as u32) << 16);

        let mut chep = (chep & !(3 << 12)) | ((EpState::Nak as u32) << 12) | (1 << 15);
        if setup {
            chep |= 1 << 11;
        } else {
            chep &= !(1 << 11);
        }
        inner.chep[ep as usize] = chep;
        inner.istr = istr::CTR | istr::DIR | ep as u32;
        true
    }

    /// Complete an IN transaction if one is armed: collect the packet, move
    /// the endpoint to NAK and raise a CTR event.
    pub fn take_in(&self, ep: u8) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();

        let chep = inner.chep[ep as usize];
        if (chep >> 4) & 3 != EpState::Valid as u32 {
            return None;
        }

        let bd = inner.pma[ep as usize * 2];
        let len = ((bd >> 16) & 0x3FF) as usize;
        let offset = (bd & 0xFFFF) as usize;
        let mut data = Vec::with_capacity(len);
        for i in 0..len {
            data.push((inner.pma[offset / 4 + i / 4] >> (8 * (i % 4))) as u8);
        }

        inner.chep[ep as usize] = (chep & !(3 << 4)) | ((EpState::Nak as u32) << 4) | (1 << 7);
        inner.istr = istr::CTR | ep as u32;
        Some(data)
    }

    /// Raise a bus reset event
    pub fn trigger_reset(&self) {
        self.inner.lock().unwrap().istr |= istr::RESET;
    }

    pub fn stat_tx(&self, ep: u8) -> u32 {
        (self.inner.lock().unwrap().chep[ep as usize] >> 4) & 3
    }

    pub fn stat_rx(&self, ep: u8) -> u32 {
        (self.inner.lock().unwrap().chep[ep as usize] >> 12) & 3
    }

    pub fn dtog_tx(&self, ep: u8) -> bool {
        self.inner.lock().unwrap().chep[ep as usize] & (1 << 6) != 0
    }

    pub fn dtog_rx(&self, ep: u8) -> bool {
        self.inner.lock().unwrap().chep[ep as usize] & (1 << 14) != 0
    }

    /// Flip a data toggle behind the device's back (test rig only)
    pub fn force_dtog_tx(&self, ep: u8) {
        self.inner.lock().unwrap().chep[ep as usize] |= 1 << 6;
    }

    pub fn daddr(&self) -> u32 {
        self.inner.lock().unwrap().daddr
    }
}

impl UsbController for MockController {
    fn reg_rd(&self, reg: Reg) -> u32 {
        let inner = self.inner.lock().unwrap();
        match reg {
            Reg::Chep(n) => inner.chep[n as usize],
            Reg::Cntr => inner.cntr,
            Reg::Istr => inner.istr,
            Reg::Daddr => inner.daddr,
            Reg::Bcdr => inner.bcdr,
        }
    }

    fn reg_wr(&mut self, reg: Reg, value: u32) {
        let mut inner = self.inner.lock().unwrap();
        match reg {
            Reg::Chep(n) => {
                // Same write semantics as the hardware: UTYPE/KIND/address
                // are plain, SETUP read-only, DTOG/STAT toggle on ones,
                // VTRX/VTTX clear on zeroes
                const PLAIN: u32 = (3 << 9) | (1 << 8) | 0xF;
                const RO: u32 = 1 << 11;
                const TOGGLE: u32 = (1 << 14) | (3 << 12) | (1 << 6) | (3 << 4);
                const RC_W0: u32 = (1 << 15) | (1 << 7);

                let old = inner.chep[n as usize];
                inner.chep[n as usize] = (value & PLAIN)
                    | (old & RO)
                    | ((old ^ value) & TOGGLE)
                    | (old & value & RC_W0);
            }
            Reg::Cntr => inner.cntr = value,
            // Event flags are write-zero-to-clear
            Reg::Istr => inner.istr &= value,
            Reg::Daddr => inner.daddr = value,
            Reg::Bcdr => inner.bcdr = value,
        }
    }

    fn pma_rd(&self, addr: u16) -> u32 {
        assert_eq!(addr % 4, 0, "unaligned packet memory read");
        self.inner.lock().unwrap().pma[addr as usize / 4]
    }

    fn pma_wr(&mut self, addr: u16, value: u32) {
        assert_eq!(addr % 4, 0, "unaligned packet memory write");
        self.inner.lock().unwrap().pma[addr as usize / 4] = value;
    }
}

/* ------------------------- host-side transactions ------------------------ */

pub fn bus_reset<IF: UsbInterface<MockController>>(ctrl: &MockController, dev: &mut Dev<IF>) {
    ctrl.trigger_reset();
    dev.handle_interrupt();
}

/// Run one control transfer. Returns the data (or status-stage ZLP) sent by
/// the device, or Err if the device stalled the request.
pub fn control<IF: UsbInterface<MockController>>(
    ctrl: &MockController,
    dev: &mut Dev<IF>,
    bm_request_type: u8,
    b_request: u8,
    w_value: u16,
    w_index: u16,
    w_length: u16,
) -> Result<Vec<u8>, ()> {
    let mut setup = [0u8; 8];
    setup[0] = bm_request_type;
    setup[1] = b_request;
    setup[2..4].copy_from_slice(&w_value.to_le_bytes());
    setup[4..6].copy_from_slice(&w_index.to_le_bytes());
    setup[6..8].copy_from_slice(&w_length.to_le_bytes());

    assert!(ctrl.deliver_out(0, &setup, true), "EP0 not ready for SETUP");
    dev.handle_interrupt();

    // A response may be queued immediately or deferred to the periodic hook
    for _ in 0..16 {
        if ctrl.stat_tx(0) == EpState::Stall as u32 {
            return Err(());
        }
        if let Some(data) = ctrl.take_in(0) {
            dev.handle_interrupt();
            if bm_request_type & 0x80 != 0 {
                // Status stage of an IN transfer: the host acks with a ZLP
                if ctrl.deliver_out(0, &[], false) {
                    dev.handle_interrupt();
                }
            }
            return Ok(data);
        }
        dev.periodic();
    }
    Err(())
}

pub fn clear_halt<IF: UsbInterface<MockController>>(
    ctrl: &MockController,
    dev: &mut Dev<IF>,
    ep_addr: u8,
) -> Result<(), ()> {
    control(ctrl, dev, 0x02, 0x01, 0, ep_addr as u16, 0).map(|_| ())
}

/// Bring a freshly built device to the configured state
pub fn enumerate<IF: UsbInterface<MockController>>(ctrl: &MockController, dev: &mut Dev<IF>) {
    dev.start();
    bus_reset(ctrl, dev);
    control(ctrl, dev, 0x80, 0x06, 0x0100, 0, 64).expect("device descriptor");
    control(ctrl, dev, 0x00, 0x05, 5, 0, 0).expect("set address");
    control(ctrl, dev, 0x00, 0x09, 1, 0, 0).expect("set configuration");
}

/* --------------------------------- LUNs ---------------------------------- */

/// In-memory logical unit with every hook instrumented
pub struct RamDisk {
    pub data: Vec<u8>,
    pub present: bool,
    pub writable: bool,
    pub perm: u32,
    pub preloads: usize,
    pub completes: usize,
    /// Diagnostic memory region exposed as buffer id 0
    pub region: Vec<u8>,
    pub microcode: Vec<u8>,
    /// Canned response for vendor commands, None rejects them
    pub vendor_reply: Option<Vec<u8>>,
}

impl RamDisk {
    pub fn new(blocks: usize) -> RamDisk {
        let mut data = vec![0u8; blocks * 512];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        RamDisk {
            data,
            present: true,
            writable: true,
            perm: PERM_READ_BUFFER | PERM_WRITE_BUFFER,
            preloads: 0,
            completes: 0,
            region: (0..=255).cycle().take(4096).map(|b| b as u8).collect(),
            microcode: Vec::new(),
            vendor_reply: None,
        }
    }
}

impl Lun for RamDisk {
    fn medium_state(&self) -> MediumState {
        if self.present {
            MediumState::Ready
        } else {
            MediumState::NotPresent
        }
    }

    fn capacity_blocks(&self) -> u32 {
        (self.data.len() / 512) as u32
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn permissions(&self) -> u32 {
        self.perm
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize, LunError> {
        let addr = addr as usize;
        if addr + buf.len() > self.data.len() {
            return Err(LunError);
        }
        buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
        Ok(buf.len())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), LunError> {
        let addr = addr as usize;
        if addr + data.len() > self.data.len() {
            return Err(LunError);
        }
        self.data[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn write_preload(&mut self, _addr: u32) -> Result<(), LunError> {
        self.preloads += 1;
        Ok(())
    }

    fn write_complete(&mut self) -> Result<(), LunError> {
        self.completes += 1;
        Ok(())
    }

    fn vendor_command(
        &mut self,
        _ctx: &mut u32,
        _cb: &[u8],
        io: &mut IoBuffer,
    ) -> Option<Result<Flow, cowstick_ums::subclass::CommandError>> {
        self.vendor_reply.as_ref().map(|reply| {
            io.set(reply);
            Ok(Flow::DataIn)
        })
    }

    fn buffer_descriptor(&self, id: u8) -> Option<(u8, u32)> {
        match id {
            0 => Some((2, self.region.len() as u32)),
            1 => Some((2, 65536)),
            _ => None,
        }
    }

    fn buffer_read(&mut self, id: u8, offset: u32, dst: &mut [u8]) -> Result<usize, LunError> {
        if id != 0 {
            return Err(LunError);
        }
        let offset = offset as usize;
        if offset + dst.len() > self.region.len() {
            return Err(LunError);
        }
        dst.copy_from_slice(&self.region[offset..offset + dst.len()]);
        Ok(dst.len())
    }

    fn microcode_erase(&mut self) -> Result<(), LunError> {
        self.microcode.clear();
        Ok(())
    }

    fn microcode_write(&mut self, offset: u32, data: &[u8]) -> Result<(), LunError> {
        let offset = offset as usize;
        if self.microcode.len() < offset + data.len() {
            self.microcode.resize(offset + data.len(), 0);
        }
        self.microcode[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
