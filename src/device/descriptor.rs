//! USB device descriptors and packet memory layout
//!
//! All tables are byte-exact: full-speed mass-storage key, VID 0x3608,
//! PID 0xC720, one configuration with a single MSC BBB interface on two
//! bulk endpoints.

use crate::{CLASS_MASS_STORAGE, PROTOCOL_BBB, SUBCLASS_SCSI};

/// Number of logical USB interfaces exposed by the device
pub const IF_COUNT: u8 = 1;
/// Number of string descriptors (index 0 is the language table)
pub const STR_COUNT: u8 = 3;
/// Max packet size of every endpoint used by this device
pub const PACKET_SIZE: usize = 64;

/// Packet memory offsets of the endpoint buffers, `[ep][0]` = TX, `[ep][1]` = RX.
///
/// EP0 buffers live at 0x80/0x40 right after the buffer descriptor table,
/// the bulk pipes use EP1 IN and EP2 OUT.
pub const EP_OFFSETS: [[u16; 2]; 8] = [
    [0x080, 0x040], // EP0 : Control
    [0x180, 0x140], // EP1 : Bulk IN
    [0x0C0, 0x100], // EP2 : Bulk OUT
    [0, 0],
    [0, 0],
    [0, 0],
    [0, 0],
    [0, 0],
];

/// Device descriptor (18 bytes)
pub const DEVICE: [u8; 18] = [
    18, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 64, //
    0x08, 0x36, 0x20, 0xC7, 0x01, 0x01, 0x01, 0x02, //
    0x00, 0x01,
];

/// Device qualifier (10 bytes)
pub const DEVICE_QUALIFIER: [u8; 10] = [
    10, 0x06, 0x00, 0x02, 0x00, 0x00, 0x00, 64, //
    0x00, 0x00,
];

/// Configuration descriptor assembly: configuration + interface + both bulk
/// endpoints, 32 bytes total.
pub const CONFIGURATION: [u8; 32] = [
    // Configuration
    0x09, 0x02, 32, 0x00, 0x01, 0x01, 0x00, 0x80, 0xFA,
    // Interface 0: Mass Storage, SCSI transparent, Bulk Only
    0x09, 0x04, 0x00, 0x00, 0x02, CLASS_MASS_STORAGE, SUBCLASS_SCSI, PROTOCOL_BBB, 0x00,
    // Endpoint 0x81, Bulk IN, 64 bytes
    0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x01,
    // Endpoint 0x02, Bulk OUT, 64 bytes
    0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x01,
];

const STR_LANG: &[u8] = &[4, 0x03, 0x09, 0x04];

const STR_MANUFACTURER: &[u8] = &[
    16, 0x03, //
    b'A', 0x00, b'g', 0x00, b'i', 0x00, b'l', 0x00, //
    b'a', 0x00, b'c', 0x00, b'k', 0x00,
];

const STR_PRODUCT: &[u8] = &[
    26, 0x03, //
    b'C', 0x00, b'o', 0x00, b'w', 0x00, b's', 0x00, //
    b't', 0x00, b'i', 0x00, b'c', 0x00, b'k', 0x00, //
    b'-', 0x00, b'u', 0x00, b'm', 0x00, b's', 0x00,
];

/// String descriptors; index 0 is the en-US language identifier table.
pub const STRINGS: [&[u8]; STR_COUNT as usize] = [STR_LANG, STR_MANUFACTURER, STR_PRODUCT];
