//! Byte-level serial transport to the bridge microcontroller.
//!
//! [`Link`] is the trait the codec and drivers are built against; [`SerialLink`]
//! is the one production implementation, backed by [`serialport`]. Tests run
//! the codec and drivers against [`FakeLink`] instead, which never touches
//! real hardware.

use std::io::{Read, Write as _};
use std::time::Duration;

use log::trace;

use crate::error::{PigroError, Result};

/// Default per-byte read timeout, per the wire protocol (§4.1 / §5).
pub const DEFAULT_BYTE_TIMEOUT: Duration = Duration::from_millis(200);

/// Baud rate fixed by the wire protocol: 9600 8N1, no flow control.
pub const BAUD_RATE: u32 = 9600;

/// Byte-level transport to the bridge.
///
/// Implementors need only guarantee that `read_byte` blocks for at most
/// `timeout` before failing with [`PigroError::Timeout`], and that `write`
/// does not return until all bytes have left the host (writes-until-drained).
pub trait Link {
    fn read_byte(&mut self, timeout: Duration) -> Result<u8>;
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn drain_input(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Production [`Link`] backed by a real serial port.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    /// Opens `path` at the fixed 9600 8N1 configuration the bridge expects.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(DEFAULT_BYTE_TIMEOUT)
            .open()?;
        Ok(SerialLink { port })
    }
}

impl Link for SerialLink {
    fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        self.port.set_timeout(timeout)?;
        let mut buf = [0u8; 1];
        match self.port.read_exact(&mut buf) {
            Ok(()) => {
                trace!("link: read {:#04x}", buf[0]);
                Ok(buf[0])
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(PigroError::Timeout),
            Err(e) => Err(PigroError::Io(e)),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("link: write {:02x?}", bytes);
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn drain_input(&mut self) -> Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(PigroError::from)
    }

    fn close(&mut self) -> Result<()> {
        // Dropping `self.port` releases the handle; nothing else to flush.
        Ok(())
    }
}

/// An in-memory [`Link`] used by tests: a fixed reply script plus a record of
/// every byte the code under test wrote.
#[cfg(any(test, feature = "test-support"))]
pub struct FakeLink {
    /// Bytes the peer "sends" to us, consumed front-to-back.
    pub to_read: std::collections::VecDeque<u8>,
    /// Every byte written by the code under test, in order.
    pub written: Vec<u8>,
    pub closed: bool,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeLink {
    pub fn new(reply_bytes: impl IntoIterator<Item = u8>) -> Self {
        FakeLink {
            to_read: reply_bytes.into_iter().collect(),
            written: Vec::new(),
            closed: false,
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Link for FakeLink {
    fn read_byte(&mut self, _timeout: Duration) -> Result<u8> {
        self.to_read.pop_front().ok_or(PigroError::Timeout)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn drain_input(&mut self) -> Result<()> {
        self.to_read.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
