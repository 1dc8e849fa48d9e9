//! USB Mass Storage firmware core
//!
//! The upward-facing protocol stack of a USB mass-storage key, from the USB
//! 2.0 device framework up to the SCSI command set:
//!
//! * [device] - chapter-9 device layer over an STM32G0-style controller
//! * [transport] - Bulk Only Transport state machine
//! * [subclass] - SCSI target, logical units and diagnostic commands
//! * [bulk] - generic bulk loopback interface for bring-up
//!
//! The typical assembly is a [device::UsbDevice] carrying a
//! [transport::bbb::BulkOnly] over the application's [subclass::Lun]
//! implementations; the interrupt handler calls
//! [device::UsbDevice::handle_interrupt] and the main loop calls
//! [device::UsbDevice::periodic].
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `rw-buffer` | Include READ BUFFER / WRITE BUFFER diagnostic commands |
//! | `cache-page` | Report caching and control mode pages in MODE SENSE(6) |
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |

#![no_std]

pub mod bulk;
pub mod device;
pub(crate) mod fmt;
pub mod subclass;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
/// SCSI transparent command set subclass code
pub const SUBCLASS_SCSI: u8 = 0x06;
/// Bulk Only Transport interface protocol code
pub const PROTOCOL_BBB: u8 = 0x50;
