//! Per-device status codes reported by the gateway
//!
//! Each device slot is summarized in one byte: the low four bits order the
//! flashing stages so progress can be compared, bit 4 marks an error stage,
//! and the high bits carry USB mount state. Stage names span five bits so
//! that error stages and `disconnected` still resolve to a name.

use bitflags::bitflags;
use std::fmt;
use strum::{Display, FromRepr};

/// Progress of one device slot through the flashing sequence
///
/// Ordering is meaningful: a slot never goes backwards within one flashing
/// attempt, so "reached stage N" is satisfied by any later stage too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Display, FromRepr)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum DeviceStage {
    Unknown = 0,
    /// The multiplexer has routed USB to this slot
    Selected = 1,
    /// Bootloader entry was requested over the CDC interface
    BootselRequest = 2,
    BootselComplete = 3,
    FlashDiskInit = 4,
    FlashDiskReadBusy = 5,
    FlashDiskWriteBusy = 6,
    FlashDiskIoComplete = 7,
    /// The target re-enumerated as a mass-storage flash disk
    FlashRequest = 8,
    FlashComplete = 9,
    ErrorBootselMiss = 16,
    ErrorFlashInquiry = 17,
    ErrorFlashMount = 18,
    ErrorFlashOpen = 19,
    ErrorFlashWrite = 20,
    ErrorFlashClose = 21,
    Disconnected = 22,
}

bitflags! {
    /// Modifier bits in the high nibble of a status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        const ERROR       = 0x10;
        const TUH_MOUNTED = 0x20;
        const MSC_MOUNTED = 0x40;
        const CDC_MOUNTED = 0x80;
    }
}

/// The condition a status poll is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The slot has settled back to a fully clear byte
    Settled,
    /// The slot has reached the given stage, or progressed past it
    Stage(DeviceStage),
    /// All of the given mount flags are set
    Mounted(StatusFlags),
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Settled => write!(f, "{}", DeviceStage::Unknown),
            Expected::Stage(stage) => write!(f, "{stage}"),
            Expected::Mounted(flags) => write!(f, "mount flags {:#04x}", flags.bits()),
        }
    }
}

/// One raw status byte for one device slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus(pub u8);

impl DeviceStatus {
    /// The named stage, if the five stage bits hold a known value
    pub fn stage(self) -> Option<DeviceStage> {
        DeviceStage::from_repr(self.0 & 0x1f)
    }

    /// Position within the flashing sequence, for floor comparisons
    pub fn stage_ordinal(self) -> u8 {
        self.0 & 0x0f
    }

    pub fn flags(self) -> StatusFlags {
        StatusFlags::from_bits_truncate(self.0)
    }

    /// Whether the slot is in an error stage
    ///
    /// An error status fails the wait no matter what was expected, so this
    /// must be checked before [`DeviceStatus::satisfies`].
    pub fn is_error(self) -> bool {
        self.flags().contains(StatusFlags::ERROR)
    }

    /// Whether this status meets or exceeds the expectation
    pub fn satisfies(self, expected: Expected) -> bool {
        match expected {
            Expected::Settled => self.0 == 0,
            Expected::Mounted(flags) => self.flags().contains(flags),
            Expected::Stage(stage) => self.stage_ordinal() >= stage as u8,
        }
    }
}

impl From<u8> for DeviceStatus {
    fn from(raw: u8) -> Self {
        DeviceStatus(raw)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage() {
            Some(stage) => write!(f, "{stage}")?,
            None => f.write_str("???")?,
        }
        let flags = self.flags();
        if flags.contains(StatusFlags::ERROR) {
            f.write_str(" (error)")?;
        }
        if flags.contains(StatusFlags::TUH_MOUNTED) {
            f.write_str(" (tuh mounted)")?;
        }
        if flags.contains(StatusFlags::MSC_MOUNTED) {
            f.write_str(" (msc mounted)")?;
        }
        if flags.contains(StatusFlags::CDC_MOUNTED) {
            f.write_str(" (cdc mounted)")?;
        }
        Ok(())
    }
}
