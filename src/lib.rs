//! Host-side programmer for AVR (ISP) and STM32F1-class Cortex-M3 (JTAG)
//! targets, talking to a bridging microcontroller over a small framed serial
//! protocol.
//!
//! The crate is organized bottom-up, each layer built only on the one below:
//!
//! - [`link`] — byte-level serial transport.
//! - [`codec`] — packet framing and the version handshake.
//! - [`bridge`] — typed wire operations (ISP, JTAG, MEM-AP, FPEC).
//! - [`avr`] / [`arm`] — the two programming state machines.
//! - [`firmware`] / [`hexreader`] — Intel HEX parsing and the page-aligned
//!   firmware model both drivers read from and write to.
//! - [`device`] / [`config`] — device descriptors and project files.
//! - [`orchestrator`] — the worker thread a shell drives one action at a time.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod arm;
pub mod avr;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod firmware;
pub mod hexreader;
pub mod link;
pub mod orchestrator;

pub use crate::error::{PigroError, Result};
