//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns a [`Result<T>`] built on
//! [`PigroError`]. The variants mirror the layers they are raised from:
//! transport framing, JTAG/DP bridge transactions, the two driver families,
//! firmware/HEX parsing, project configuration, and worker cancellation.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, PigroError>;

/// Names the fault class packed into the high nibble of a bridge error byte
/// (§4.3), so `JtagAck`'s `Display` reads like the original tool's console
/// diagnostics ("sticky CTRL/STAT flags") instead of a bare hex dump.
fn jtag_class_name(class: u8) -> &'static str {
    match class & 0xF0 {
        0x10 => "I/O failure",
        0x20 => "sticky CTRL/STAT flags set",
        0x40 => "SELECT write failure",
        _ => "unrecognized fault class",
    }
}

/// The single error type returned by every public operation in this crate.
#[derive(Debug, Error)]
pub enum PigroError {
    // --- Transport -------------------------------------------------------
    #[error("timed out waiting for a byte from the bridge")]
    Timeout,

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),

    #[error("frame out of sync: expected ACK/NACK, got {0:#04x}")]
    OutOfSync(u8),

    #[error("bridge replied NACK to the last frame")]
    ProtocolNack,

    #[error("bridge reply had an unexpected shape for this command")]
    ProtocolShape,

    #[error("bridge reported a packet length of {0}, exceeding the {max} byte limit", max = crate::codec::MAX_PACKET_LEN)]
    PacketTooBig(u8),

    #[error("bridge gave an unrecognized answer during the version handshake")]
    ProtocolBadHandshake,

    // --- Bridge / JTAG -----------------------------------------------------
    #[error("JTAG ACK fault: {} (class={class:#04x} ack={ack:#04x})", jtag_class_name(*class))]
    JtagAck { class: u8, ack: u8 },

    #[error("JTAG I/O failure")]
    JtagIo,

    #[error("DP/AP SELECT write failed")]
    SelectFailed,

    #[error("bridge kept returning WAIT after the retry budget was exhausted")]
    WaitAck,

    // --- ARM ---------------------------------------------------------------
    #[error("target IDCODE did not match a supported Cortex-M3 part")]
    UnsupportedDevice,

    #[error("no MEM-AP found while scanning AP index space")]
    MemApNotFound,

    #[error("target did not acknowledge debug power-up request")]
    NoDebugPower,

    #[error("target did not acknowledge system power-up request")]
    NoSystemPower,

    #[error("FPEC did not unlock: CR.LOCK remained set after the key sequence")]
    FpecUnlockFailed,

    #[error("flash cell was not erased before programming (FLASH_SR.PGERR)")]
    FlashCellNotErased,

    #[error("flash page is write protected (FLASH_SR.WRPRTERR)")]
    FlashWriteProtected,

    #[error("FLASH_SR reported an unrecognized status word: {0:#010x}")]
    FlashUnknown(u32),

    // --- AVR -----------------------------------------------------------
    #[error("target did not acknowledge program-enable")]
    ProgramEnableFailed,

    #[error("device signature {actual:02x?} does not match expected {expected:02x?}")]
    WrongSignature {
        expected: [u8; 3],
        actual: [u8; 3],
    },

    #[error("device/operation is not supported by this driver")]
    UnsupportedChip,

    #[error("chip erase did not complete: bridge did not echo the erase instruction")]
    ChipEraseFailed,

    #[error("fuse byte mismatch: expected {expected:#04x}, read {actual:#04x}")]
    FuseMismatch { expected: u8, actual: u8 },

    // --- Firmware / HEX ------------------------------------------------
    #[error("malformed Intel HEX line: {0}")]
    HexMalformed(String),

    #[error("Intel HEX checksum mismatch on line {line}")]
    HexBadChecksum { line: usize },

    #[error("unsupported Intel HEX record type {0:#04x}")]
    HexUnsupported(u8),

    #[error("page address {addr:#010x} is out of range for a {page_count}-page, {page_size}-byte device")]
    PageOutOfRange {
        addr: u32,
        page_size: u32,
        page_count: u32,
    },

    #[error("page size {0} is not a power of two")]
    PageSizeNotPowerOfTwo(u32),

    // --- Config ----------------------------------------------------------
    #[error("project file is missing the [{0}] section")]
    ConfigMissingSection(String),

    #[error("project file is missing key '{key}' in [{section}]")]
    ConfigMissingKey { section: String, key: String },

    #[error("could not parse project file: {0}")]
    ConfigParseError(String),

    // --- Control -----------------------------------------------------------
    #[error("action was cancelled")]
    Cancelled,
}

impl PigroError {
    /// True for the one error class the driver layer is allowed to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PigroError::WaitAck)
    }
}
