//! CDB builders for the host side of the tests

pub fn test_unit_ready() -> Vec<u8> {
    vec![0x00; 6]
}

pub fn request_sense(alloc_len: u8) -> Vec<u8> {
    vec![0x03, 0, 0, 0, alloc_len, 0]
}

pub fn inquiry(evpd: bool, page_code: u8, alloc_len: u16) -> Vec<u8> {
    let mut cb = vec![0x12, evpd as u8, page_code];
    cb.extend_from_slice(&alloc_len.to_be_bytes());
    cb.push(0);
    cb
}

/// INQUIRY with reserved bits set in byte 1 (must be rejected)
pub fn inquiry_bad_flags() -> Vec<u8> {
    vec![0x12, 0x02, 0, 0, 36, 0]
}

pub fn mode_sense6(alloc_len: u8) -> Vec<u8> {
    vec![0x1A, 0, 0, 0, alloc_len, 0]
}

pub fn start_stop_unit(start: bool) -> Vec<u8> {
    vec![0x1B, 0, 0, 0, start as u8, 0]
}

pub fn prevent_allow_removal(prevent: bool) -> Vec<u8> {
    vec![0x1E, 0, 0, 0, prevent as u8, 0]
}

pub fn read_format_capacities(alloc_len: u16) -> Vec<u8> {
    let mut cb = vec![0x23, 0, 0, 0, 0, 0, 0];
    cb.extend_from_slice(&alloc_len.to_be_bytes());
    cb.push(0);
    cb
}

pub fn read_capacity10() -> Vec<u8> {
    vec![0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

pub fn read10(lba: u32, len: u16) -> Vec<u8> {
    let mut cb = vec![0x28, 0];
    cb.extend_from_slice(&lba.to_be_bytes());
    cb.push(0);
    cb.extend_from_slice(&len.to_be_bytes());
    cb.push(0);
    cb
}

pub fn write10(lba: u32, len: u16) -> Vec<u8> {
    let mut cb = vec![0x2A, 0];
    cb.extend_from_slice(&lba.to_be_bytes());
    cb.push(0);
    cb.extend_from_slice(&len.to_be_bytes());
    cb.push(0);
    cb
}

fn buffer_cb(op: u8, mode: u8, buffer_id: u8, offset: u32, len: u32) -> Vec<u8> {
    let mut cb = vec![op, mode, buffer_id];
    cb.extend_from_slice(&offset.to_be_bytes()[1..]);
    cb.extend_from_slice(&len.to_be_bytes()[1..]);
    cb.push(0);
    cb
}

pub fn read_buffer(mode: u8, buffer_id: u8, offset: u32, len: u32) -> Vec<u8> {
    buffer_cb(0x3C, mode, buffer_id, offset, len)
}

pub fn write_buffer(mode: u8, buffer_id: u8, offset: u32, len: u32) -> Vec<u8> {
    buffer_cb(0x3B, mode, buffer_id, offset, len)
}

pub fn vendor(op: u8) -> Vec<u8> {
    vec![op, 0, 0, 0, 0, 0]
}
