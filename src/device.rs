//! Device descriptors (§3): the chip-identifying, page-geometry facts a
//! driver needs to run its programming algorithm.
//!
//! The curated catalog of named devices is an external collaborator (the
//! project's INI-backed device database, §2B); this module only defines the
//! shape that catalog produces and [`crate::config::ProjectConfig`] parses
//! the project-local half of.

use crate::error::{PigroError, Result};

/// Base address of STM32F1 flash in the Cortex-M3 memory map (§3).
pub const ARM_FLASH_BASE: u32 = 0x0800_0000;

/// A device descriptor, polymorphic over target family (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDescriptor {
    Avr(AvrDevice),
    Arm(ArmDevice),
}

impl DeviceDescriptor {
    pub fn name(&self) -> &str {
        match self {
            DeviceDescriptor::Avr(d) => &d.name,
            DeviceDescriptor::Arm(d) => &d.name,
        }
    }
}

/// AVR device geometry and expected signature (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvrDevice {
    pub name: String,
    pub signature: [u8; 3],
    pub page_word_size: u8,
    pub page_count: u8,
    pub paged: bool,
    pub fuse_low: Option<u8>,
    pub fuse_high: Option<u8>,
    pub fuse_ext: Option<u8>,
}

impl AvrDevice {
    /// `page_byte_size = page_word_size * 2` (§3 invariant).
    pub fn page_byte_size(&self) -> u32 {
        self.page_word_size as u32 * 2
    }
}

/// STM32F1-class ARM device geometry (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmDevice {
    pub name: String,
    pub idcode: u32,
    pub page_size: u32,
    pub flash_size: u32,
}

impl ArmDevice {
    /// Validates the §3 invariants (`page_size` a power of two, `flash_size`
    /// a multiple of it) before constructing the descriptor.
    pub fn new(name: String, idcode: u32, page_size: u32, flash_size: u32) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(PigroError::PageSizeNotPowerOfTwo(page_size));
        }
        if flash_size % page_size != 0 {
            return Err(PigroError::ConfigParseError(format!(
                "flash_size {flash_size} is not a multiple of page_size {page_size}"
            )));
        }
        Ok(ArmDevice {
            name,
            idcode,
            page_size,
            flash_size,
        })
    }

    pub fn page_count(&self) -> u32 {
        self.flash_size / self.page_size
    }

    /// `[0x0800_0000, 0x0800_0000 + flash_size)` (§3 invariant).
    pub fn flash_range(&self) -> std::ops::Range<u32> {
        ARM_FLASH_BASE..ARM_FLASH_BASE + self.flash_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avr_page_byte_size_doubles_word_size() {
        let d = AvrDevice {
            name: "atmega8".into(),
            signature: [0x1E, 0x93, 0x07],
            page_word_size: 32,
            page_count: 128,
            paged: true,
            fuse_low: None,
            fuse_high: None,
            fuse_ext: None,
        };
        assert_eq!(d.page_byte_size(), 64);
    }

    #[test]
    fn arm_rejects_non_power_of_two_page_size() {
        let err = ArmDevice::new("stm32f103".into(), 0x3BA0_0477, 96, 65536).unwrap_err();
        assert!(matches!(err, PigroError::PageSizeNotPowerOfTwo(96)));
    }

    #[test]
    fn arm_rejects_flash_size_not_multiple_of_page_size() {
        let err = ArmDevice::new("stm32f103".into(), 0x3BA0_0477, 1024, 1500).unwrap_err();
        assert!(matches!(err, PigroError::ConfigParseError(_)));
    }

    #[test]
    fn arm_flash_range_starts_at_0800_0000() {
        let d = ArmDevice::new("stm32f103".into(), 0x3BA0_0477, 1024, 128 * 1024).unwrap();
        assert_eq!(d.flash_range(), 0x0800_0000..0x0802_0000);
        assert_eq!(d.page_count(), 128);
    }
}
