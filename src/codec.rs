//! Packet framing on top of a [`Link`]: fixed-shape `{cmd, len, data}` frames
//! with an optional per-frame ACK/NACK sync byte, and the version handshake
//! that decides whether that sync byte is in play at all.

use log::{debug, warn};

use crate::error::{PigroError, Result};
use crate::link::{Link, DEFAULT_BYTE_TIMEOUT};

/// Largest payload a single packet may carry (§3).
pub const MAX_PACKET_LEN: u8 = 6;

const ACK: u8 = 0x01;
const NACK: u8 = 0x02;

const CMD_HANDSHAKE: u8 = 1;

/// A single `{cmd, len, data}` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub cmd: u8,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(cmd: u8, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        assert!(data.len() <= MAX_PACKET_LEN as usize, "packet payload too long");
        Packet { cmd, data }
    }

    pub fn len(&self) -> u8 {
        self.data.len() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Framing layer over a [`Link`]. Owns the `nack_support` flag negotiated by
/// [`PacketCodec::handshake`].
pub struct PacketCodec<L: Link> {
    link: L,
    nack_support: bool,
}

impl<L: Link> PacketCodec<L> {
    pub fn new(link: L) -> Self {
        PacketCodec {
            link,
            nack_support: false,
        }
    }

    pub fn nack_support(&self) -> bool {
        self.nack_support
    }

    /// Forces the ACK/NACK framing mode without running the handshake.
    /// Exposed for tests that exercise a single bridge op in isolation.
    #[cfg(any(test, feature = "test-support"))]
    pub fn set_nack_support(&mut self, value: bool) {
        self.nack_support = value;
    }

    pub fn close(&mut self) -> Result<()> {
        self.link.close()
    }

    /// Sends a packet. If ACK framing is in effect, synchronously reads one
    /// sync byte and fails with `ProtocolNack`/`OutOfSync` as appropriate.
    pub fn send(&mut self, pkt: &Packet) -> Result<()> {
        self.write_frame(pkt)?;
        if self.nack_support {
            let sync = self.link.read_byte(DEFAULT_BYTE_TIMEOUT)?;
            match sync {
                ACK => Ok(()),
                NACK => Err(PigroError::ProtocolNack),
                other => Err(PigroError::OutOfSync(other)),
            }
        } else {
            Ok(())
        }
    }

    /// Reads a reply packet: `cmd`, `len`, then `len` payload bytes.
    pub fn recv(&mut self) -> Result<Packet> {
        let cmd = self.link.read_byte(DEFAULT_BYTE_TIMEOUT)?;
        let len = self.link.read_byte(DEFAULT_BYTE_TIMEOUT)?;
        if len > MAX_PACKET_LEN {
            return Err(PigroError::PacketTooBig(len));
        }
        let mut data = Vec::with_capacity(len as usize);
        for _ in 0..len {
            data.push(self.link.read_byte(DEFAULT_BYTE_TIMEOUT)?);
        }
        Ok(Packet { cmd, data })
    }

    /// One round trip: send then recv, honoring ACK/NACK framing on the send
    /// side. This is the shape every [`crate::bridge::Bridge`] operation uses.
    pub fn transact(&mut self, pkt: &Packet) -> Result<Packet> {
        self.send(pkt)?;
        self.recv()
    }

    /// Probes the peer and switches the codec into ACK mode for everything
    /// that follows, or falls back to the legacy no-ACK dialect.
    ///
    /// The handshake frame itself is written WITHOUT expecting ACK framing
    /// (that's what's being negotiated), then:
    /// - a byte arrives and equals `ACK` -> new peer: read the 2-byte version
    ///   reply, `nack_support = true`.
    /// - a byte arrives and is anything else -> `ProtocolBadHandshake`.
    /// - nothing arrives within the read window -> legacy peer, version 0.1,
    ///   `nack_support = false`.
    pub fn handshake(&mut self) -> Result<(u8, u8, bool)> {
        self.link.drain_input()?;
        self.write_frame(&Packet::new(CMD_HANDSHAKE, vec![0, 0]))?;

        match self.link.read_byte(DEFAULT_BYTE_TIMEOUT) {
            Ok(ACK) => {
                let reply = self.recv()?;
                if reply.cmd != CMD_HANDSHAKE || reply.len() != 2 {
                    return Err(PigroError::ProtocolBadHandshake);
                }
                self.nack_support = true;
                let (major, minor) = (reply.data[0], reply.data[1]);
                debug!("handshake: new protocol, nack_support=true, version={major}.{minor}");
                Ok((major, minor, true))
            }
            Ok(_other) => Err(PigroError::ProtocolBadHandshake),
            Err(PigroError::Timeout) => {
                warn!("handshake: no reply, falling back to legacy no-ACK protocol 0.1");
                self.nack_support = false;
                Ok((0, 1, false))
            }
            Err(e) => Err(e),
        }
    }

    fn write_frame(&mut self, pkt: &Packet) -> Result<()> {
        let mut frame = Vec::with_capacity(2 + pkt.data.len());
        frame.push(pkt.cmd);
        frame.push(pkt.len());
        frame.extend_from_slice(&pkt.data);
        self.link.write(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::FakeLink;

    #[test]
    fn round_trip_without_ack() {
        // recv() for cmd=7, len=3, data=[9,9,9]
        let link = FakeLink::new(vec![7, 3, 9, 9, 9]);
        let mut codec = PacketCodec::new(link);
        let reply = codec.recv().unwrap();
        assert_eq!(reply, Packet::new(7, vec![9, 9, 9]));
    }

    #[test]
    fn send_with_ack_support() {
        let link = FakeLink::new(vec![ACK]);
        let mut codec = PacketCodec::new(link);
        codec.nack_support = true;
        codec.send(&Packet::new(3, vec![1, 2, 3, 4])).unwrap();
    }

    #[test]
    fn send_with_nack_fails() {
        let link = FakeLink::new(vec![NACK]);
        let mut codec = PacketCodec::new(link);
        codec.nack_support = true;
        let err = codec.send(&Packet::new(3, vec![0])).unwrap_err();
        assert!(matches!(err, PigroError::ProtocolNack));
    }

    #[test]
    fn send_out_of_sync() {
        let link = FakeLink::new(vec![0x55]);
        let mut codec = PacketCodec::new(link);
        codec.nack_support = true;
        let err = codec.send(&Packet::new(3, vec![0])).unwrap_err();
        assert!(matches!(err, PigroError::OutOfSync(0x55)));
    }

    #[test]
    fn recv_packet_too_big() {
        let link = FakeLink::new(vec![1, 7]);
        let mut codec = PacketCodec::new(link);
        let err = codec.recv().unwrap_err();
        assert!(matches!(err, PigroError::PacketTooBig(7)));
    }

    #[test]
    fn handshake_new_peer() {
        // S5: peer sends ACK, then recv() reply cmd=1 len=2 data=[0,2]
        let link = FakeLink::new(vec![ACK, 1, 2, 0, 2]);
        let mut codec = PacketCodec::new(link);
        let (major, minor, nack) = codec.handshake().unwrap();
        assert_eq!((major, minor, nack), (0, 2, true));
    }

    #[test]
    fn handshake_legacy_peer() {
        let link = FakeLink::new(vec![]);
        let mut codec = PacketCodec::new(link);
        let (major, minor, nack) = codec.handshake().unwrap();
        assert_eq!((major, minor, nack), (0, 1, false));
    }

    #[test]
    fn handshake_bad_sync_byte() {
        let link = FakeLink::new(vec![0x77]);
        let mut codec = PacketCodec::new(link);
        let err = codec.handshake().unwrap_err();
        assert!(matches!(err, PigroError::ProtocolBadHandshake));
    }
}
