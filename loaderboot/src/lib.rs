//! # loaderboot
//!
//! Device-side serial boot loader protocol stack for HiSilicon chips.
//!
//! This crate implements the loader that sits on the chip end of a serial
//! flashing session: it receives framed commands over a UART-style byte
//! channel, moves firmware images and configuration blobs with the YMODEM
//! protocol, and drives the platform's flash and efuse primitives.
//!
//! - Command frame codec (magic/size/type/pad/payload/CRC16)
//! - Command dispatch loop (download, upload, reset, efuse, baud rate)
//! - YMODEM receive and transmit engines
//! - Flash transfer orchestration (chip/region erase policy, chunked writes)
//!
//! The byte channel and the hardware are abstracted behind the [`Channel`]
//! and [`Platform`] traits, so the whole stack runs unmodified against a
//! real serial port or an in-memory test double.
//!
//! ## Features
//!
//! - `native` (default): `serialport`-backed channel helper
//! - `efuse` (default): burn/read efuse command handlers
//! - `upload` (default): upload-data command handler
//!
//! ## Example
//!
//! ```rust,no_run
//! use loaderboot::{Loader, Platform, Result};
//!
//! struct RamBoard {
//!     flash: Vec<u8>,
//! }
//!
//! impl Platform for RamBoard {
//!     fn flash_capacity(&self) -> u32 {
//!         self.flash.len() as u32
//!     }
//!
//!     fn flash_erase(&mut self, offset: u32, size: u32) -> Result<()> {
//!         let end = (offset as usize).saturating_add(size as usize).min(self.flash.len());
//!         self.flash[offset as usize..end].fill(0xFF);
//!         Ok(())
//!     }
//!
//!     fn flash_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
//!         self.flash[offset as usize..offset as usize + data.len()].copy_from_slice(data);
//!         Ok(())
//!     }
//!
//!     fn flash_read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
//!         buf.copy_from_slice(&self.flash[offset as usize..offset as usize + buf.len()]);
//!         Ok(())
//!     }
//!
//!     fn kick_watchdog(&mut self) {}
//!
//!     fn reset(&mut self) {}
//! }
//!
//! fn main() -> Result<()> {
//!     #[cfg(feature = "native")]
//!     {
//!         let chan = loaderboot::channel::native::open("/dev/ttyUSB0", 115200)?;
//!         let board = RamBoard { flash: vec![0xFF; 0x80_0000] };
//!         let mut loader = Loader::new(chan, board);
//!         // Runs until the host issues a reset command.
//!         loader.run()?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod loader;
pub mod platform;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use {
    channel::Channel,
    error::{Error, Result},
    loader::{FLASH_CHIP_ERASE_SIZE, Loader, LoaderConfig},
    platform::{Platform, UartConfig},
    protocol::frame::{ACK_FAILURE, ACK_SUCCESS, CommandType, Frame, FrameCodec},
    protocol::ymodem::{YmodemConfig, YmodemReceiver},
};

#[cfg(feature = "upload")]
pub use protocol::ymodem::YmodemSender;
