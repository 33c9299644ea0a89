//! ISP programming state machine for AVR parts (§4.5): program-enable,
//! paged flash I/O, chip erase, fuse read/write, signature read — all built
//! on [`Bridge::isp_io`], the one AVR primitive the bridge exposes.
//!
//! Every public operation here brackets its work with `program_enable` and
//! `program_disable`, matching §9's "scoped cleanup on all exit paths": the
//! target is only ever left in programming mode for the duration of one
//! call, and `program_disable` runs even when the wrapped work fails or is
//! cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, trace, warn};

use crate::bridge::Bridge;
use crate::device::AvrDevice;
use crate::error::{PigroError, Result};
use crate::firmware::{Firmware, Page};
use crate::link::Link;

/// `isp_io` instructions, packed MSB-first into a 32-bit word (§4.5).
mod cmd {
    pub const PROGRAM_ENABLE: u32 = 0xAC53_0000;
    pub const CHIP_ERASE: u32 = 0xAC80_0000;
    pub const READ_SIGNATURE: u32 = 0x3000_0000;
    pub const READ_LOW_FUSE: u32 = 0x5000_0000;
    pub const READ_HIGH_FUSE: u32 = 0x5808_0000;
    pub const READ_EXT_FUSE: u32 = 0x5008_0000;
    pub const WRITE_LOW_FUSE: u32 = 0xACA0_0000;
    pub const WRITE_HIGH_FUSE: u32 = 0xACA8_0000;
    pub const WRITE_EXT_FUSE: u32 = 0xACA4_0000;
    pub const LOAD_LOW_BYTE: u32 = 0x40;
    pub const LOAD_HIGH_BYTE: u32 = 0x48;
    pub const WRITE_PAGE: u32 = 0x4C;
    pub const READ_LOW_BYTE: u32 = 0x20;
    pub const READ_HIGH_BYTE: u32 = 0x28;
}

/// Result of reading back a device's signature and reconciling it against
/// the configured descriptor (§8 S1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCode {
    pub signature: [u8; 3],
    pub matches_expected: bool,
}

/// The three AVR fuse bytes (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fuses {
    pub low: u8,
    pub high: u8,
    pub ext: u8,
}

/// One mismatched byte found by [`AvrDriver::check_firmware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub page_addr: u32,
    pub offset: usize,
    pub expected: u8,
    pub actual: u8,
}

/// Outcome of an [`AvrDriver::check_firmware`] pass (§2B: full-dump-then-
/// summarize, not stop-at-first-mismatch).
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub mismatches: Vec<Mismatch>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Decomposes an absolute byte address in word-addressed AVR flash into the
/// `(word_addr, is_high_byte)` pair `isp_io`'s read/load commands expect.
fn word_addr_and_half(addr: u32) -> (u32, bool) {
    ((addr >> 1) & 0xFFFF, addr & 1 != 0)
}

pub struct AvrDriver<L: Link> {
    bridge: Bridge<L>,
    device: AvrDevice,
    cancel: Arc<AtomicBool>,
}

impl<L: Link> AvrDriver<L> {
    pub fn new(bridge: Bridge<L>, device: AvrDevice, cancel: Arc<AtomicBool>) -> Self {
        AvrDriver {
            bridge,
            device,
            cancel,
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.bridge.close()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Pulses RESET low→high→low and issues the program-enable instruction
    /// (§4.5). Fails with `ProgramEnableFailed` unless the bridge echoes the
    /// instruction's third byte back (`0x53`).
    fn program_enable(&mut self) -> Result<()> {
        self.bridge.isp_reset(false)?;
        self.bridge.isp_reset(true)?;
        self.bridge.isp_reset(false)?;
        let reply = self.bridge.isp_io(cmd::PROGRAM_ENABLE)?;
        if (reply >> 8) & 0xFF != 0x53 {
            return Err(PigroError::ProgramEnableFailed);
        }
        Ok(())
    }

    /// Raises RESET, releasing the target back to normal run mode.
    fn program_disable(&mut self) -> Result<()> {
        self.bridge.isp_reset(true)
    }

    /// Runs `f` inside a program-enable/disable bracket, guaranteeing
    /// `program_disable` runs on every exit path (§9).
    fn with_session<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.program_enable()?;
        let result = f(self);
        let disable_result = self.program_disable();
        match result {
            Ok(value) => disable_result.map(|()| value),
            Err(e) => {
                if let Err(cleanup_err) = disable_result {
                    warn!("avr: program_disable failed during cleanup: {cleanup_err}");
                }
                Err(e)
            }
        }
    }

    fn read_signature(&mut self) -> Result<[u8; 3]> {
        let mut sig = [0u8; 3];
        for (i, byte) in sig.iter_mut().enumerate() {
            let reply = self.bridge.isp_io(cmd::READ_SIGNATURE | ((i as u32) << 8))?;
            *byte = (reply & 0xFF) as u8;
        }
        Ok(sig)
    }

    fn read_byte(&mut self, addr: u32) -> Result<u8> {
        let (word_addr, is_high) = word_addr_and_half(addr);
        let cmd_byte = if is_high { cmd::READ_HIGH_BYTE } else { cmd::READ_LOW_BYTE };
        let instr = (cmd_byte << 24) | (word_addr << 8);
        let reply = self.bridge.isp_io(instr)?;
        Ok((reply & 0xFF) as u8)
    }

    fn load_page_byte(&mut self, addr: u32, byte: u8) -> Result<()> {
        let (word_addr, is_high) = word_addr_and_half(addr);
        let cmd_byte = if is_high { cmd::LOAD_HIGH_BYTE } else { cmd::LOAD_LOW_BYTE };
        let instr = (cmd_byte << 24) | (word_addr << 8) | byte as u32;
        self.bridge.isp_io(instr)?;
        Ok(())
    }

    fn flush_page(&mut self, page_addr: u32) -> Result<()> {
        let (word_addr, _) = word_addr_and_half(page_addr);
        let instr = (cmd::WRITE_PAGE << 24) | (word_addr << 8);
        self.bridge.isp_io(instr)?;
        trace!("avr: flushed page {page_addr:#06x}");
        Ok(())
    }

    fn chip_erase_inner(&mut self) -> Result<()> {
        let reply = self.bridge.isp_io(cmd::CHIP_ERASE)?;
        if (reply >> 16) & 0xFF != 0xAC {
            return Err(PigroError::ChipEraseFailed);
        }
        Ok(())
    }

    /// Reads back the three signature bytes and reports whether they match
    /// the configured descriptor (§4.5, §8 S1).
    pub fn chip_info(&mut self) -> Result<DeviceCode> {
        let signature = self.with_session(|me| me.read_signature())?;
        let matches_expected = signature == self.device.signature;
        info!(
            "avr: signature {:02X?} [ {} ]",
            signature,
            if matches_expected { "ok" } else { "mismatch" }
        );
        Ok(DeviceCode {
            signature,
            matches_expected,
        })
    }

    /// Full-chip erase (§4.5). Exposed standalone for the orchestrator's
    /// `erase` action, and used internally by `write_firmware`.
    pub fn chip_erase(&mut self) -> Result<()> {
        self.with_session(|me| me.chip_erase_inner())
    }

    /// Reads back every page and re-assembles a [`Firmware]` (§4.5
    /// expansion, grounded in the original `AVR::readFirmware`).
    pub fn read_firmware(&mut self) -> Result<Firmware> {
        self.read_firmware_with_progress(|_| {})
    }

    /// As [`Self::read_firmware`], but calls `on_progress(pages_done)` after
    /// each page so the orchestrator can translate it into `ReportProgress`.
    pub fn read_firmware_with_progress(&mut self, mut on_progress: impl FnMut(u32)) -> Result<Firmware> {
        self.with_session(|me| me.read_firmware_inner(&mut on_progress))
    }

    fn read_firmware_inner(&mut self, on_progress: &mut dyn FnMut(u32)) -> Result<Firmware> {
        let page_size = self.device.page_byte_size();
        let mut pages = Vec::with_capacity(self.device.page_count as usize);
        for page_idx in 0..self.device.page_count as u32 {
            if self.is_cancelled() {
                return Err(PigroError::Cancelled);
            }
            let page_base = page_idx * page_size;
            let mut data = vec![0u8; page_size as usize];
            for (offset, byte) in data.iter_mut().enumerate() {
                *byte = self.read_byte(page_base + offset as u32)?;
            }
            pages.push(Page {
                addr: page_base,
                data,
            });
            on_progress(page_idx + 1);
        }
        Firmware::from_pages(pages, page_size)
    }

    /// Reads back every firmware byte and compares it against `firmware`,
    /// recording every mismatch rather than stopping at the first one (§2B).
    pub fn check_firmware(&mut self, firmware: &Firmware) -> Result<Report> {
        self.check_firmware_with_progress(firmware, |_| {})
    }

    pub fn check_firmware_with_progress(&mut self, firmware: &Firmware, mut on_progress: impl FnMut(u32)) -> Result<Report> {
        self.with_session(|me| me.check_firmware_inner(firmware, &mut on_progress))
    }

    fn check_firmware_inner(&mut self, firmware: &Firmware, on_progress: &mut dyn FnMut(u32)) -> Result<Report> {
        let mut report = Report::default();
        for (page_idx, page) in firmware.pages().enumerate() {
            if self.is_cancelled() {
                return Err(PigroError::Cancelled);
            }
            for (offset, &expected) in page.data.iter().enumerate() {
                let actual = self.read_byte(page.addr + offset as u32)?;
                if actual != expected {
                    trace!(
                        "avr: mismatch at page {:#06x} offset {offset}: expected {expected:#04x} actual {actual:#04x}",
                        page.addr
                    );
                    report.mismatches.push(Mismatch {
                        page_addr: page.addr,
                        offset,
                        expected,
                        actual,
                    });
                }
            }
            on_progress(page_idx as u32 + 1);
        }
        Ok(report)
    }

    /// Validates page range, verifies signature, erases, then streams every
    /// page's bytes through the load/flush protocol (§4.5 write-firmware
    /// protocol). Cancellation mid-page leaves that page's partial load
    /// buffer un-flushed (§8 S6).
    pub fn write_firmware(&mut self, firmware: &Firmware) -> Result<()> {
        self.write_firmware_with_progress(firmware, |_| {})
    }

    /// As [`Self::write_firmware`], but calls `on_progress(pages_done)` after
    /// each page is flushed, for the orchestrator's `ReportProgress` events.
    pub fn write_firmware_with_progress(&mut self, firmware: &Firmware, mut on_progress: impl FnMut(u32)) -> Result<()> {
        firmware.check_range(self.device.page_byte_size(), self.device.page_count as u32)?;
        self.with_session(|me| me.write_firmware_inner(firmware, &mut on_progress))
    }

    fn write_firmware_inner(&mut self, firmware: &Firmware, on_progress: &mut dyn FnMut(u32)) -> Result<()> {
        let signature = self.read_signature()?;
        if signature != self.device.signature {
            return Err(PigroError::WrongSignature {
                expected: self.device.signature,
                actual: signature,
            });
        }
        self.chip_erase_inner()?;

        for (page_idx, page) in firmware.pages().enumerate() {
            for (offset, &byte) in page.data.iter().enumerate() {
                if self.is_cancelled() {
                    return Err(PigroError::Cancelled);
                }
                self.load_page_byte(page.addr + offset as u32, byte)?;
            }
            self.flush_page(page.addr)?;
            on_progress(page_idx as u32 + 1);
        }
        Ok(())
    }

    pub fn read_fuse(&mut self) -> Result<Fuses> {
        self.with_session(|me| me.read_fuse_inner())
    }

    fn read_fuse_inner(&mut self) -> Result<Fuses> {
        Ok(Fuses {
            low: (self.bridge.isp_io(cmd::READ_LOW_FUSE)? & 0xFF) as u8,
            high: (self.bridge.isp_io(cmd::READ_HIGH_FUSE)? & 0xFF) as u8,
            ext: (self.bridge.isp_io(cmd::READ_EXT_FUSE)? & 0xFF) as u8,
        })
    }

    pub fn write_fuse(&mut self) -> Result<()> {
        self.with_session(|me| me.write_fuse_inner())
    }

    fn write_fuse_inner(&mut self) -> Result<()> {
        if let Some(low) = self.device.fuse_low {
            self.bridge.isp_io(cmd::WRITE_LOW_FUSE | low as u32)?;
            let actual = (self.bridge.isp_io(cmd::READ_LOW_FUSE)? & 0xFF) as u8;
            if actual != low {
                return Err(PigroError::FuseMismatch { expected: low, actual });
            }
        }
        if let Some(high) = self.device.fuse_high {
            self.bridge.isp_io(cmd::WRITE_HIGH_FUSE | high as u32)?;
            let actual = (self.bridge.isp_io(cmd::READ_HIGH_FUSE)? & 0xFF) as u8;
            if actual != high {
                return Err(PigroError::FuseMismatch { expected: high, actual });
            }
        }
        if let Some(ext) = self.device.fuse_ext {
            self.bridge.isp_io(cmd::WRITE_EXT_FUSE | ext as u32)?;
            let actual = (self.bridge.isp_io(cmd::READ_EXT_FUSE)? & 0xFF) as u8;
            if actual != ext {
                return Err(PigroError::FuseMismatch { expected: ext, actual });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketCodec;
    use crate::link::FakeLink;

    const ACK: u8 = 0x01;

    fn atmega8() -> AvrDevice {
        AvrDevice {
            name: "atmega8".into(),
            signature: [0x1E, 0x93, 0x07],
            page_word_size: 16,
            page_count: 128,
            paged: true,
            fuse_low: None,
            fuse_high: None,
            fuse_ext: None,
        }
    }

    /// S1 — AVR info on silent peer: program_enable succeeds, signature
    /// reads echo [0x1E,0x93,0x07].
    #[test]
    fn s1_chip_info_matches_expected_signature() {
        // isp_reset x3 have no typed reply in this driver (they don't go
        // through isp_io), so this test drives program_enable + the 4
        // isp_io round trips (program_enable + 3 signature reads) directly
        // via a hand-built reply script instead of the helper above, since
        // isp_reset's cmd=2 reply must also be threaded through.
        let mut bytes = Vec::new();
        // 3x isp_reset (cmd 2, 1-byte payload echoed back arbitrarily)
        for _ in 0..3 {
            bytes.push(ACK);
            bytes.extend_from_slice(&[2, 1, 0]);
        }
        // program_enable: isp_io reply with data index 2 == 0x53
        bytes.push(ACK);
        bytes.extend_from_slice(&[3, 4, 0x00, 0x00, 0x53, 0x00]);
        // 3x signature reads: signature byte is the low byte, data index 3
        for sig_byte in [0x1E, 0x93, 0x07] {
            bytes.push(ACK);
            bytes.extend_from_slice(&[3, 4, 0x00, 0x00, 0x00, sig_byte]);
        }
        // final isp_reset (program_disable)
        bytes.push(ACK);
        bytes.extend_from_slice(&[2, 1, 0]);

        let link = FakeLink::new(bytes);
        let mut codec = PacketCodec::new(link);
        codec.set_nack_support(true);
        let bridge = Bridge::new(codec);
        let mut driver = AvrDriver::new(bridge, atmega8(), Arc::new(AtomicBool::new(false)));

        let info = driver.chip_info().unwrap();
        assert_eq!(info.signature, [0x1E, 0x93, 0x07]);
        assert!(info.matches_expected);
    }

    #[test]
    fn word_addr_and_half_splits_low_bit() {
        assert_eq!(word_addr_and_half(0x0000), (0, false));
        assert_eq!(word_addr_and_half(0x0001), (0, true));
        assert_eq!(word_addr_and_half(0x0002), (1, false));
    }

    #[test]
    fn report_is_ok_when_no_mismatches() {
        let report = Report::default();
        assert!(report.is_ok());
    }

    #[test]
    fn report_is_not_ok_with_mismatches() {
        let mut report = Report::default();
        report.mismatches.push(Mismatch {
            page_addr: 0,
            offset: 0,
            expected: 1,
            actual: 2,
        });
        assert!(!report.is_ok());
    }
}
