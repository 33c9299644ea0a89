//! JTAG/ARM-debug state machine for STM32F1-class Cortex-M3 parts (§4.6):
//! TAP reset, DP/AP access through [`Bridge::xpacc`]/[`Bridge::apacc`],
//! MEM-AP discovery, debug halt, and the STM32 FPEC flash unlock/erase/
//! program/lock sequence.
//!
//! `WaitAck` (§7) is the one error the driver retries on its own, bounded
//! and with exponential backoff (§9 Open Question: N=3, starting at 100us,
//! doubling each attempt — see DESIGN.md).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info, trace, warn};

use crate::bridge::Bridge;
use crate::device::{ArmDevice, ARM_FLASH_BASE};
use crate::error::{PigroError, Result};
use crate::firmware::{Firmware, Page};
use crate::link::Link;

/// JTAG instruction register values for the ARM debug port (§4.6).
mod ir {
    pub const ABORT: u8 = 0x8;
    pub const DPACC: u8 = 0xA;
    pub const APACC: u8 = 0xB;
    pub const IDCODE: u8 = 0xE;
    pub const BYPASS: u8 = 0xF;
}

/// DP register addresses (bits [3:2] of the DPACC address field).
mod dp {
    pub const CTRL_STAT: u8 = 0x4;
    pub const SELECT: u8 = 0x8;
    pub const RDBUFF: u8 = 0xC;
}

/// AP bank-0 register addresses within the selected MEM-AP.
mod ap {
    pub const CSW: u8 = 0x00;
    pub const TAR: u8 = 0x04;
    pub const DRW: u8 = 0x0C;
}

bitflags! {
    /// DP `CTRL/STAT` register bits this driver cares about (§4.6).
    struct CtrlStat: u32 {
        const CDBGPWRUPREQ = 1 << 28;
        const CDBGPWRUPACK = 1 << 29;
        const CSYSPWRUPREQ = 1 << 30;
        const CSYSPWRUPACK = 1 << 31;
        /// Sticky error bits `{1,4,5}` a clean `xpacc` transaction requires
        /// clear (§4.6 "DP/AP read via xpacc").
        const STICKYORUN = 1 << 1;
        const STICKYCMP = 1 << 4;
        const STICKYERR = 1 << 5;
    }
}

const DHCSR: u32 = 0xE000_EDF0;
const DEMCR: u32 = 0xE000_EDFC;
const DHCSR_DBGKEY: u32 = 0xA05F_0000;
const DHCSR_C_DEBUGEN: u32 = 1 << 0;
const DHCSR_C_HALT: u32 = 1 << 1;
const DEMCR_VC_CORERESET: u32 = 1 << 0;

const FLASH_KEYR: u32 = 0x4002_2004;
const FLASH_CR: u32 = 0x4002_2010;
const FLASH_AR: u32 = 0x4002_2014;
const FLASH_SR: u32 = 0x4002_200C;
const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xCDEF_89AB;

bitflags! {
    /// `FLASH_CR` bits the FPEC programming sequence toggles (§4.6).
    struct FlashCr: u32 {
        const PG = 1 << 0;
        const PER = 1 << 1;
        const MER = 1 << 2;
        const STRT = 1 << 6;
        const LOCK = 1 << 7;
    }
}

bitflags! {
    /// `FLASH_SR` status bits checked after every FPEC operation (§4.6
    /// "Check SR").
    struct FlashSr: u32 {
        const BSY = 1 << 0;
        const PGERR = 1 << 2;
        const WRPRTERR = 1 << 4;
        const EOP = 1 << 5;
    }
}

/// `isp_io`'s cousin on the JTAG side: information read from the IDCODE
/// scan chain and reconciled against the configured descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCode {
    pub idcode: u32,
    pub matches_expected: bool,
}

/// One mismatched word found by [`ArmDriver::check_firmware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub addr: u32,
    pub expected: u32,
    pub actual: u32,
}

/// Outcome of an [`ArmDriver::check_firmware`] pass (§2B).
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub mismatches: Vec<Mismatch>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub struct ArmDriver<L: Link> {
    bridge: Bridge<L>,
    device: ArmDevice,
    cancel: Arc<AtomicBool>,
    mem_ap: u8,
}

impl<L: Link> ArmDriver<L> {
    pub fn new(bridge: Bridge<L>, device: ArmDevice, cancel: Arc<AtomicBool>) -> Self {
        ArmDriver {
            bridge,
            device,
            cancel,
            mem_ap: 0,
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.bridge.close()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Retries a DP/AP access bounded times with exponential backoff
    /// whenever it fails with `WaitAck` (§7, §9 Open Question).
    fn with_wait_retry<T>(&mut self, mut f: impl FnMut(&mut Self) -> Result<T>) -> Result<T> {
        const MAX_ATTEMPTS: u32 = 3;
        const INITIAL_BACKOFF: Duration = Duration::from_micros(100);
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match f(self) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    trace!("arm: WAIT on attempt {attempt}, backing off {backoff:?}");
                    sleep(backoff);
                    backoff *= 2;
                }
                Err(PigroError::WaitAck) => return Err(PigroError::WaitAck),
                Err(e) => return Err(e),
            }
        }
    }

    /// TAP reset followed by a single IDCODE scan, per the JTAG state
    /// machine's standard reset-then-scan idiom (§4.6).
    fn tap_reset_and_scan_idcode(&mut self) -> Result<u32> {
        self.bridge.jtag_reset(1)?;
        let idcode = self.bridge.raw_io(ir::IDCODE, 0, 32)?;
        Ok(idcode)
    }

    /// Reads `DPACC`/`APACC` via the bridge's 3-phase pipeline (§4.6),
    /// retrying on WAIT.
    fn dpacc_read(&mut self, reg: u8) -> Result<u32> {
        self.with_wait_retry(|me| me.bridge.xpacc(ir::DPACC, reg, 0, false))
    }

    fn dpacc_write(&mut self, reg: u8, value: u32) -> Result<()> {
        self.with_wait_retry(|me| me.bridge.xpacc(ir::DPACC, reg, value, true))?;
        Ok(())
    }

    fn apacc_read(&mut self, reg: u8) -> Result<u32> {
        self.with_wait_retry(|me| me.bridge.apacc(me.mem_ap, reg, 0, false))
    }

    fn apacc_write(&mut self, reg: u8, value: u32) -> Result<()> {
        self.with_wait_retry(|me| me.bridge.apacc(me.mem_ap, reg, value, true))?;
        Ok(())
    }

    /// Scans AP index space for the first MEM-AP that reports a valid IDR
    /// (§4.6 MEM-AP discovery). Only AP 0 is probed: STM32F1 parts expose
    /// exactly one MEM-AP and scanning further wastes retries.
    fn discover_mem_ap(&mut self) -> Result<u8> {
        self.mem_ap = 0;
        let idr = self.apacc_read(0xFC)?;
        if idr == 0 {
            return Err(PigroError::MemApNotFound);
        }
        Ok(self.mem_ap)
    }

    /// Requests system+debug power-up via CTRL/STAT and blocks for the
    /// matching ACK bits (§4.6).
    fn power_up(&mut self) -> Result<()> {
        let req = CtrlStat::CSYSPWRUPREQ | CtrlStat::CDBGPWRUPREQ;
        self.dpacc_write(dp::CTRL_STAT, req.bits())?;
        let status = CtrlStat::from_bits_truncate(self.dpacc_read(dp::CTRL_STAT)?);
        if !status.contains(CtrlStat::CSYSPWRUPACK) {
            return Err(PigroError::NoSystemPower);
        }
        if !status.contains(CtrlStat::CDBGPWRUPACK) {
            return Err(PigroError::NoDebugPower);
        }
        Ok(())
    }

    /// Sets `DHCSR.C_DEBUGEN` (and `C_HALT`, optionally) so the core's
    /// debug logic is live and memory access through the MEM-AP is
    /// guaranteed coherent (§4.6). Finishes with a `jtag_reset(1)`, matching
    /// the debug-enable sequence's final TAP reset after DHCSR/DEMCR are set.
    fn debug_enable(&mut self, halt: bool) -> Result<()> {
        self.power_up()?;
        self.discover_mem_ap()?;
        self.set_memaddr(DEMCR)?;
        self.write_mem32(DEMCR_VC_CORERESET)?;
        self.set_memaddr(DHCSR)?;
        let mut value = DHCSR_DBGKEY | DHCSR_C_DEBUGEN;
        if halt {
            value |= DHCSR_C_HALT;
        }
        self.write_mem32(value)?;
        self.bridge.jtag_reset(1)?;
        Ok(())
    }

    fn set_memaddr(&mut self, addr: u32) -> Result<()> {
        self.bridge.set_memap(self.mem_ap)?;
        self.bridge.set_memaddr(addr)
    }

    fn read_mem32(&mut self) -> Result<u32> {
        self.bridge.read_next32()
    }

    fn write_mem32(&mut self, value: u32) -> Result<()> {
        self.bridge.write_next32(value)
    }

    fn read_mem32_at(&mut self, addr: u32) -> Result<u32> {
        self.set_memaddr(addr)?;
        self.read_mem32()
    }

    fn write_mem32_at(&mut self, addr: u32, value: u32) -> Result<()> {
        self.set_memaddr(addr)?;
        self.write_mem32(value)
    }

    /// Lightweight TAP reset + IDCODE scan, without powering up the debug
    /// core (§4.6): cheap enough to run just to identify a connected part.
    pub fn chip_info(&mut self) -> Result<DeviceCode> {
        let idcode = self.tap_reset_and_scan_idcode()?;
        let matches_expected = idcode == self.device.idcode;
        info!(
            "arm: idcode {idcode:#010x} [ {} ]",
            if matches_expected { "ok" } else { "mismatch" }
        );
        Ok(DeviceCode {
            idcode,
            matches_expected,
        })
    }

    /// Runs `f` with the debug core powered up and halted, guaranteeing
    /// the FPEC is re-locked and debug disabled on every exit path (§9).
    ///
    /// Before powering up debug, the scanned IDCODE's low 28 bits (the top
    /// nibble is a silicon revision field) must match the configured part;
    /// anything else fails `UnsupportedDevice` rather than attempting to
    /// debug-enable a part this driver doesn't understand (§4.6 step 2).
    fn with_session<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        const IDCODE_MASK: u32 = 0x0FFF_FFFF;
        let idcode = self.tap_reset_and_scan_idcode()?;
        if idcode & IDCODE_MASK != self.device.idcode & IDCODE_MASK {
            return Err(PigroError::UnsupportedDevice);
        }
        self.debug_enable(true)?;
        let result = f(self);
        let cleanup = self.cleanup();
        match result {
            Ok(value) => cleanup.map(|()| value),
            Err(e) => {
                if let Err(cleanup_err) = cleanup {
                    warn!("arm: cleanup failed during error unwind: {cleanup_err}");
                }
                Err(e)
            }
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        self.lock_flash()?;
        self.set_memaddr(DHCSR)?;
        self.write_mem32(DHCSR_DBGKEY)?;
        Ok(())
    }

    fn unlock_flash(&mut self) -> Result<()> {
        self.write_mem32_at(FLASH_KEYR, FLASH_KEY1)?;
        self.write_mem32_at(FLASH_KEYR, FLASH_KEY2)?;
        let cr = FlashCr::from_bits_truncate(self.read_mem32_at(FLASH_CR)?);
        if cr.contains(FlashCr::LOCK) {
            return Err(PigroError::FpecUnlockFailed);
        }
        Ok(())
    }

    fn lock_flash(&mut self) -> Result<()> {
        let cr = FlashCr::from_bits_truncate(self.read_mem32_at(FLASH_CR)?);
        self.write_mem32_at(FLASH_CR, (cr | FlashCr::LOCK).bits())
    }

    fn wait_flash_idle(&mut self) -> Result<()> {
        loop {
            if self.is_cancelled() {
                return Err(PigroError::Cancelled);
            }
            let sr = FlashSr::from_bits_truncate(self.read_mem32_at(FLASH_SR)?);
            if !sr.contains(FlashSr::BSY) {
                if sr.contains(FlashSr::PGERR) {
                    return Err(PigroError::FlashCellNotErased);
                }
                if sr.contains(FlashSr::WRPRTERR) {
                    return Err(PigroError::FlashWriteProtected);
                }
                if sr.contains(FlashSr::EOP) {
                    self.write_mem32_at(FLASH_SR, FlashSr::EOP.bits())?;
                    return Ok(());
                }
                return Err(PigroError::FlashUnknown(sr.bits()));
            }
        }
    }

    fn mass_erase(&mut self) -> Result<()> {
        self.write_mem32_at(
            FLASH_SR,
            (FlashSr::PGERR | FlashSr::WRPRTERR | FlashSr::EOP).bits(),
        )?;
        let cr = FlashCr::from_bits_truncate(self.read_mem32_at(FLASH_CR)?);
        self.write_mem32_at(FLASH_CR, (cr | FlashCr::MER).bits())?;
        let cr = FlashCr::from_bits_truncate(self.read_mem32_at(FLASH_CR)?);
        self.write_mem32_at(FLASH_CR, (cr | FlashCr::STRT).bits())?;
        self.wait_flash_idle()?;
        let cr = FlashCr::from_bits_truncate(self.read_mem32_at(FLASH_CR)?);
        self.write_mem32_at(FLASH_CR, (cr & !FlashCr::MER).bits())
    }

    /// Full mass erase (§4.6). Exposed standalone for the orchestrator's
    /// `erase` action.
    pub fn chip_erase(&mut self) -> Result<()> {
        self.with_session(|me| {
            me.unlock_flash()?;
            me.mass_erase()
        })
    }

    /// Reads back the full flash range as 32-bit words and re-assembles a
    /// [`Firmware`] (§4.6 expansion).
    pub fn read_firmware(&mut self) -> Result<Firmware> {
        self.read_firmware_with_progress(|_| {})
    }

    /// As [`Self::read_firmware`], but calls `on_progress(pages_done)` after
    /// each page so the orchestrator can translate it into `ReportProgress`.
    pub fn read_firmware_with_progress(&mut self, mut on_progress: impl FnMut(u32)) -> Result<Firmware> {
        self.with_session(|me| me.read_firmware_inner(&mut on_progress))
    }

    fn read_firmware_inner(&mut self, on_progress: &mut dyn FnMut(u32)) -> Result<Firmware> {
        let page_size = self.device.page_size;
        let mut pages = Vec::with_capacity(self.device.page_count() as usize);
        for page_idx in 0..self.device.page_count() {
            if self.is_cancelled() {
                return Err(PigroError::Cancelled);
            }
            let page_base = ARM_FLASH_BASE + page_idx * page_size;
            let mut data = Vec::with_capacity(page_size as usize);
            for word_addr in (page_base..page_base + page_size).step_by(4) {
                let word = self.read_mem32_at(word_addr)?;
                data.extend_from_slice(&word.to_le_bytes());
            }
            pages.push(Page {
                addr: page_base - ARM_FLASH_BASE,
                data,
            });
            on_progress(page_idx + 1);
        }
        Firmware::from_pages(pages, page_size)
    }

    /// Reads back every firmware word and compares it against `firmware`,
    /// recording every mismatch (§2B).
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
            for (chunk_i, chunk) in page.data.chunks(4).enumerate() {
                let mut buf = [0u8; 4];
                buf[..chunk.len()].copy_from_slice(chunk);
                let expected = u32::from_le_bytes(buf);
                let addr = ARM_FLASH_BASE + page.addr + (chunk_i * 4) as u32;
                let actual = self.read_mem32_at(addr)?;
                if actual != expected {
                    report.mismatches.push(Mismatch { addr, expected, actual });
                }
            }
            on_progress(page_idx as u32 + 1);
        }
        Ok(report)
    }

    /// Validates page range, mass-erases, then streams every 32-bit word
    /// through `program_next` after setting `FLASH_CR.PG` (§4.6
    /// write-firmware protocol, step 3).
    pub fn write_firmware(&mut self, firmware: &Firmware) -> Result<()> {
        self.write_firmware_with_progress(firmware, |_| {})
    }

    /// As [`Self::write_firmware`], but calls `on_progress(pages_done)` after
    /// each page's words are all streamed through `program_next`.
    pub fn write_firmware_with_progress(&mut self, firmware: &Firmware, mut on_progress: impl FnMut(u32)) -> Result<()> {
        firmware.check_range(self.device.page_size, self.device.page_count())?;
        self.with_session(|me| me.write_firmware_inner(firmware, &mut on_progress))
    }

    fn write_firmware_inner(&mut self, firmware: &Firmware, on_progress: &mut dyn FnMut(u32)) -> Result<()> {
        self.unlock_flash()?;
        self.mass_erase()?;

        let cr = FlashCr::from_bits_truncate(self.read_mem32_at(FLASH_CR)?);
        self.write_mem32_at(FLASH_CR, (cr | FlashCr::PG).bits())?;

        for (page_idx, page) in firmware.pages().enumerate() {
            let page_addr = ARM_FLASH_BASE + page.addr;
            self.set_memaddr(page_addr)?;
            for chunk in page.data.chunks(4) {
                if self.is_cancelled() {
                    return Err(PigroError::Cancelled);
                }
                let mut buf = [0u8; 4];
                buf[..chunk.len()].copy_from_slice(chunk);
                self.bridge.program_next(u32::from_le_bytes(buf))?;
                self.wait_flash_idle()?;
            }
            on_progress(page_idx as u32 + 1);
        }

        let cr = FlashCr::from_bits_truncate(self.read_mem32_at(FLASH_CR)?);
        self.write_mem32_at(FLASH_CR, (cr & !FlashCr::PG).bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketCodec;
    use crate::link::FakeLink;

    fn stm32f103() -> ArmDevice {
        ArmDevice::new("stm32f103".into(), 0x3BA0_0477, 1024, 128 * 1024).unwrap()
    }

    #[test]
    fn chip_info_matches_expected_idcode() {
        // jtag_reset(cmd 5, 1-byte payload) -> reply cmd 5 len 1
        // raw_io(cmd 8, ir+bits+4 bytes) -> reply cmd 8 len (2+4)
        let mut bytes = vec![5, 1, 0];
        bytes.extend_from_slice(&[8, 6, 0xE, 32]);
        bytes.extend_from_slice(&0x3BA0_0477u32.to_le_bytes());
        let link = FakeLink::new(bytes);
        let mut codec = PacketCodec::new(link);
        codec.set_nack_support(false);
        let bridge = Bridge::new(codec);
        let mut driver = ArmDriver::new(bridge, stm32f103(), Arc::new(AtomicBool::new(false)));

        let info = driver.chip_info().unwrap();
        assert_eq!(info.idcode, 0x3BA0_0477);
        assert!(info.matches_expected);
    }

    #[test]
    fn chip_info_flags_mismatch() {
        let mut bytes = vec![5, 1, 0];
        bytes.extend_from_slice(&[8, 6, 0xE, 32]);
        bytes.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let link = FakeLink::new(bytes);
        let codec = PacketCodec::new(link);
        let bridge = Bridge::new(codec);
        let mut driver = ArmDriver::new(bridge, stm32f103(), Arc::new(AtomicBool::new(false)));

        let info = driver.chip_info().unwrap();
        assert!(!info.matches_expected);
    }

    /// `with_session` (and anything built on it, e.g. `chip_erase`) must
    /// reject an unrecognized IDCODE before ever touching power-up or FPEC
    /// registers (§4.6 step 2).
    #[test]
    fn with_session_rejects_mismatched_idcode() {
        let mut bytes = vec![5, 1, 0]; // jtag_reset
        bytes.extend_from_slice(&[8, 6, 0xE, 32]); // raw_io(IDCODE) header
        bytes.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes()); // wrong IDCODE
        let link = FakeLink::new(bytes);
        let codec = PacketCodec::new(link);
        let bridge = Bridge::new(codec);
        let mut driver = ArmDriver::new(bridge, stm32f103(), Arc::new(AtomicBool::new(false)));

        let err = driver.chip_erase().unwrap_err();
        assert!(matches!(err, PigroError::UnsupportedDevice));
    }

    #[test]
    fn report_is_ok_when_no_mismatches() {
        assert!(Report::default().is_ok());
    }

    #[test]
    fn report_is_not_ok_with_mismatches() {
        let mut report = Report::default();
        report.mismatches.push(Mismatch {
            addr: ARM_FLASH_BASE,
            expected: 1,
            actual: 2,
        });
        assert!(!report.is_ok());
    }
}
