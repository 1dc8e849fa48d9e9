//! USB Mass Storage transports

pub mod bbb;

/// The status of a Mass Storage command, as reported in a CSW.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}
