//! Typed operations layered over [`PacketCodec`], matching the bridge's wire
//! command set one-to-one (§4.3 / §6).
//!
//! Two byte orders are in play, inherited unchanged from the bridge firmware
//! contract: AVR's `isp_io` packs its 32-bit instruction **MSB-first**, while
//! every JTAG/ARM command below packs multi-byte fields **LSB-first**. Each
//! helper is named after the field it serializes so the two conventions never
//! get mixed up by accident.
//!
//! Absolute memory access (`read_mem`/`write_mem`, cmd 15/16) is restricted to
//! 16-bit halfwords here: an address (4 bytes) plus a 32-bit value would need
//! an 8-byte payload, over the 6-byte frame limit the wire protocol fixes in
//! §3. [`Bridge::read_mem32`]/[`Bridge::write_mem32`] compose two halfword
//! transactions instead of asking the wire for a single oversized one; see
//! DESIGN.md for why this is preferred over the single-frame encoding.

use log::trace;

use crate::codec::{Packet, PacketCodec};
use crate::error::{PigroError, Result};
use crate::link::Link;

const CMD_ISP_RESET: u8 = 2;
const CMD_ISP_IO: u8 = 3;
const CMD_JTAG_RESET: u8 = 5;
const CMD_JTAG_RAW_IR: u8 = 6;
const CMD_JTAG_RAW_DR: u8 = 7;
const CMD_RAW_IO: u8 = 8;
const CMD_XPACC: u8 = 9;
const CMD_APACC: u8 = 10;
const CMD_CONFIG: u8 = 11;
const CMD_READ_NEXT: u8 = 12;
const CMD_WRITE_NEXT: u8 = 13;
const CMD_PROGRAM_NEXT: u8 = 14;
const CMD_READ_MEM: u8 = 15;
const CMD_WRITE_MEM: u8 = 16;

const CONFIG_SET_MEMAP: u8 = 1;
const CONFIG_SET_MEMADDR: u8 = 2;

/// The JTAG/DP/AP ACK code, extracted from the low nibble of an error byte or
/// the low 3 bits of a raw scan-out, per §4.3's error byte convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    OkFault,
    Wait,
    Other(u8),
}

impl Ack {
    pub fn from_low_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0b010 => Ack::OkFault,
            0b001 => Ack::Wait,
            other => Ack::Other(other),
        }
    }
}

fn write_bits_le(value: u64, bytecount: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytecount);
    let mut v = value;
    for _ in 0..bytecount {
        out.push((v & 0xFF) as u8);
        v >>= 8;
    }
    out
}

fn read_bits_le(data: &[u8]) -> u64 {
    let mut result: u64 = 0;
    for (i, byte) in data.iter().enumerate() {
        result |= (*byte as u64) << (8 * i);
    }
    result
}

fn bytecount_for_bits(bits: u8) -> usize {
    ((bits as usize) + 7) / 8
}

/// Decodes a reply whose length-1 payload is an error byte (§4.3): high
/// nibble is the fault class, low nibble the ACK code.
fn check_error_byte(pkt: &Packet) -> Result<()> {
    if pkt.data.len() != 1 {
        return Ok(());
    }
    let byte = pkt.data[0];
    if byte == 0 {
        return Ok(());
    }
    if byte & 0x40 != 0 {
        return Err(PigroError::SelectFailed);
    }
    if byte & 0x20 != 0 {
        return Err(PigroError::JtagAck {
            class: byte & 0xF0,
            ack: byte & 0x0F,
        });
    }
    if byte & 0x10 != 0 {
        return Err(PigroError::JtagIo);
    }
    match Ack::from_low_bits(byte) {
        Ack::OkFault => Ok(()),
        Ack::Wait => Err(PigroError::WaitAck),
        Ack::Other(ack) => Err(PigroError::JtagAck { class: 0, ack }),
    }
}

/// Typed bridge operations, layered over a [`PacketCodec`].
pub struct Bridge<L: Link> {
    codec: PacketCodec<L>,
}

impl<L: Link> Bridge<L> {
    pub fn new(codec: PacketCodec<L>) -> Self {
        Bridge { codec }
    }

    pub fn codec_mut(&mut self) -> &mut PacketCodec<L> {
        &mut self.codec
    }

    pub fn close(&mut self) -> Result<()> {
        self.codec.close()
    }

    // --- ISP (AVR) -----------------------------------------------------

    pub fn isp_reset(&mut self, level: bool) -> Result<()> {
        self.codec.transact(&Packet::new(CMD_ISP_RESET, vec![level as u8]))?;
        Ok(())
    }

    /// `cmd_isp_io`: request and response are both a 4-byte, MSB-first 32-bit
    /// word (main.cpp's `cmd_isp_io`).
    pub fn isp_io(&mut self, instr: u32) -> Result<u32> {
        let reply = self.codec.transact(&Packet::new(CMD_ISP_IO, instr.to_be_bytes().to_vec()))?;
        if reply.data.len() != 4 {
            return Err(PigroError::ProtocolShape);
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&reply.data);
        Ok(u32::from_be_bytes(buf))
    }

    // --- JTAG low-level --------------------------------------------------

    pub fn jtag_reset(&mut self, mode: u8) -> Result<()> {
        self.codec.transact(&Packet::new(CMD_JTAG_RESET, vec![mode]))?;
        Ok(())
    }

    pub fn jtag_raw_ir(&mut self, value: u64, bits: u8) -> Result<u64> {
        let bytecount = bytecount_for_bits(bits);
        let mut data = vec![bits];
        data.extend(write_bits_le(value, bytecount));
        let reply = self.codec.transact(&Packet::new(CMD_JTAG_RAW_IR, data))?;
        if reply.data.len() != 1 + bytecount {
            return Err(PigroError::ProtocolShape);
        }
        Ok(read_bits_le(&reply.data[1..]))
    }

    pub fn jtag_raw_dr(&mut self, value: u64, bits: u8) -> Result<u64> {
        let bytecount = bytecount_for_bits(bits);
        let mut data = vec![bits];
        data.extend(write_bits_le(value, bytecount));
        let reply = self.codec.transact(&Packet::new(CMD_JTAG_RAW_DR, data))?;
        if reply.data.len() != 1 + bytecount {
            return Err(PigroError::ProtocolShape);
        }
        Ok(read_bits_le(&reply.data[1..]))
    }

    // --- JTAG high-level ---------------------------------------------------

    /// `cmd_raw_io`: shifts `value` (`bits` wide, ≤32) through `ir`'s data
    /// register, returning the scanned-out value of the same width.
    pub fn raw_io(&mut self, ir: u8, value: u32, bits: u8) -> Result<u32> {
        let bytecount = bytecount_for_bits(bits);
        let mut data = vec![ir, bits];
        data.extend(write_bits_le(value as u64, bytecount));
        let reply = self.codec.transact(&Packet::new(CMD_RAW_IO, data))?;
        if reply.data.len() != 2 + bytecount {
            return Err(PigroError::ProtocolShape);
        }
        Ok(read_bits_le(&reply.data[2..]) as u32)
    }

    /// `cmd_xpacc`: DP access via the three-phase JTAG pipeline. `reg` is the
    /// 4-bit DP register address; the bridge combines it with the read/write
    /// bit internally.
    pub fn xpacc(&mut self, ir: u8, reg: u8, value: u32, write: bool) -> Result<u32> {
        if reg > 0x0F {
            return Err(PigroError::ProtocolShape);
        }
        let mut data = vec![ir, (reg & 0xFC) | if write { 0b00 } else { 0b10 }];
        data.extend(write_bits_le(value as u64, 4));
        let reply = self.codec.transact(&Packet::new(CMD_XPACC, data))?;
        check_error_byte(&reply)?;
        if reply.data.len() != 6 {
            return Err(PigroError::ProtocolShape);
        }
        Ok(read_bits_le(&reply.data[2..]) as u32)
    }

    /// `cmd_apacc`: AP access, `ap` selects the access port index.
    pub fn apacc(&mut self, ap: u8, reg: u8, value: u32, write: bool) -> Result<u32> {
        if reg & 0x03 != 0 {
            return Err(PigroError::ProtocolShape);
        }
        let mut data = vec![ap, (reg & 0xFC) | if write { 0b00 } else { 0b10 }];
        data.extend(write_bits_le(value as u64, 4));
        let reply = self.codec.transact(&Packet::new(CMD_APACC, data))?;
        check_error_byte(&reply)?;
        if reply.data.len() != 6 {
            return Err(PigroError::ProtocolShape);
        }
        Ok(read_bits_le(&reply.data[2..]) as u32)
    }

    pub fn set_memap(&mut self, ap: u8) -> Result<()> {
        let data = vec![CONFIG_SET_MEMAP, ap];
        let reply = self.codec.transact(&Packet::new(CMD_CONFIG, data))?;
        if reply.data.len() != 2 || reply.data[1] != ap {
            return Err(PigroError::ProtocolShape);
        }
        Ok(())
    }

    pub fn set_memaddr(&mut self, addr: u32) -> Result<()> {
        let mut data = vec![CONFIG_SET_MEMADDR];
        data.extend(write_bits_le(addr as u64, 4));
        let reply = self.codec.transact(&Packet::new(CMD_CONFIG, data))?;
        if reply.data.len() != 5 {
            return Err(PigroError::ProtocolShape);
        }
        let echoed = read_bits_le(&reply.data[1..]) as u32;
        if echoed != addr {
            return Err(PigroError::ProtocolShape);
        }
        Ok(())
    }

    // --- Cursor I/O --------------------------------------------------------

    pub fn read_next32(&mut self) -> Result<u32> {
        let reply = self.codec.transact(&Packet::new(CMD_READ_NEXT, vec![]))?;
        check_error_byte(&reply)?;
        if reply.data.len() != 4 {
            return Err(PigroError::ProtocolShape);
        }
        Ok(read_bits_le(&reply.data) as u32)
    }

    pub fn read_next16(&mut self) -> Result<u16> {
        let reply = self.codec.transact(&Packet::new(CMD_READ_NEXT, vec![]))?;
        check_error_byte(&reply)?;
        if reply.data.len() != 2 {
            return Err(PigroError::ProtocolShape);
        }
        Ok(read_bits_le(&reply.data) as u16)
    }

    pub fn write_next32(&mut self, value: u32) -> Result<()> {
        let data = write_bits_le(value as u64, 4);
        let reply = self.codec.transact(&Packet::new(CMD_WRITE_NEXT, data))?;
        check_error_byte(&reply)?;
        if reply.data.len() != 4 || read_bits_le(&reply.data) as u32 != value {
            return Err(PigroError::ProtocolShape);
        }
        Ok(())
    }

    pub fn write_next16(&mut self, value: u16) -> Result<()> {
        let data = write_bits_le(value as u64, 2);
        let reply = self.codec.transact(&Packet::new(CMD_WRITE_NEXT, data))?;
        check_error_byte(&reply)?;
        if reply.data.len() != 2 || read_bits_le(&reply.data) as u16 != value {
            return Err(PigroError::ProtocolShape);
        }
        Ok(())
    }

    /// `cmd_program_next`: stores one 32-bit FPEC word at the bridge's
    /// current auto-incrementing cursor. On failure the bridge replies with a
    /// 2-byte status pair instead of echoing the value back.
    pub fn program_next(&mut self, value: u32) -> Result<()> {
        let data = value.to_le_bytes().to_vec();
        let reply = self.codec.transact(&Packet::new(CMD_PROGRAM_NEXT, data))?;
        if reply.data.len() == 2 {
            trace!(
                "program_next: bridge reported status0={:#04x} status1={:#04x}",
                reply.data[0],
                reply.data[1]
            );
            return Err(PigroError::FlashUnknown(
                (reply.data[0] as u32) | ((reply.data[1] as u32) << 8),
            ));
        }
        if reply.data.len() != 4 || read_bits_le(&reply.data) as u32 != value {
            return Err(PigroError::ProtocolShape);
        }
        Ok(())
    }

    // --- Absolute memory -----------------------------------------------

    fn read_mem16_raw(&mut self, addr: u32) -> Result<u16> {
        let mut data = write_bits_le(addr as u64, 4);
        data.extend(write_bits_le(0, 2));
        let reply = self.codec.transact(&Packet::new(CMD_READ_MEM, data))?;
        if reply.data.len() != 6 {
            return Err(PigroError::ProtocolShape);
        }
        Ok(read_bits_le(&reply.data[4..]) as u16)
    }

    fn write_mem16_raw(&mut self, addr: u32, value: u16) -> Result<()> {
        let mut data = write_bits_le(addr as u64, 4);
        data.extend(write_bits_le(value as u64, 2));
        let reply = self.codec.transact(&Packet::new(CMD_WRITE_MEM, data))?;
        if reply.data.len() != 6 {
            return Err(PigroError::ProtocolShape);
        }
        Ok(())
    }

    pub fn read_mem16(&mut self, addr: u32) -> Result<u16> {
        self.read_mem16_raw(addr)
    }

    pub fn write_mem16(&mut self, addr: u32, value: u16) -> Result<()> {
        self.write_mem16_raw(addr, value)
    }

    /// Composed from two halfword transactions (see module docs).
    pub fn read_mem32(&mut self, addr: u32) -> Result<u32> {
        let lo = self.read_mem16_raw(addr)? as u32;
        let hi = self.read_mem16_raw(addr + 2)? as u32;
        Ok(lo | (hi << 16))
    }

    /// Composed from two halfword transactions (see module docs).
    pub fn write_mem32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.write_mem16_raw(addr, (value & 0xFFFF) as u16)?;
        self.write_mem16_raw(addr + 2, (value >> 16) as u16)?;
        Ok(())
    }
}
