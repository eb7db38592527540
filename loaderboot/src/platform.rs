//! Hardware abstraction consumed by the boot loader.
//!
//! The original loader receives its flash driver as a table of function
//! pointers at startup and reaches global primitives for the watchdog,
//! delays and efuse access. Here the whole surface is a single [`Platform`]
//! trait implemented by the board support crate, which keeps the protocol
//! stack testable against an in-memory double.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Serialized length of a [`UartConfig`] in a set-baud-rate payload.
pub const UART_CONFIG_LEN: usize = 8;

/// UART parameters carried by a set-baud-rate command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartConfig {
    /// Requested baud rate.
    pub baud_rate: u32,
    /// Data bits (typically 8).
    pub data_bits: u8,
    /// Stop bits (typically 1).
    pub stop_bits: u8,
    /// Parity (0 = none).
    pub parity: u8,
    /// Flow control (0 = none).
    pub flow_control: u8,
}

impl UartConfig {
    /// Parse a UART configuration from a command payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < UART_CONFIG_LEN {
            return Err(Error::InvalidParam("uart config too short".into()));
        }
        Ok(Self {
            baud_rate: LittleEndian::read_u32(&payload[0..4]),
            data_bits: payload[4],
            stop_bits: payload[5],
            parity: payload[6],
            flow_control: payload[7],
        })
    }
}

/// Board services required by the loader.
///
/// Flash operations are keyed by byte offset into the device, not by mapped
/// address. An erase with `size == FLASH_CHIP_ERASE_SIZE` (`0xFFFF_FFFF`)
/// means "erase the entire device".
///
/// Implementations report hardware failures through [`Error::Flash`] /
/// [`Error::Efuse`] so the loader can translate them into a failure
/// acknowledgement without aborting the command loop.
pub trait Platform {
    /// Total addressable flash size in bytes.
    fn flash_capacity(&self) -> u32;

    /// Erase `size` bytes starting at `offset`.
    fn flash_erase(&mut self, offset: u32, size: u32) -> Result<()>;

    /// Program `data` at `offset`. The region is expected to be erased.
    fn flash_write(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Read `buf.len()` bytes starting at `offset`.
    fn flash_read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Kick the hardware watchdog.
    fn kick_watchdog(&mut self);

    /// Trigger a device reset. On real hardware this does not return; test
    /// doubles record the call and return so the command loop can exit.
    fn reset(&mut self);

    /// Version bytes reported by the read-version command.
    fn firmware_version(&self) -> &[u8] {
        &[]
    }

    /// Reconfigure the UART for the requested parameters.
    fn set_baud_rate(&mut self, _config: &UartConfig) -> Result<()> {
        Err(Error::InvalidParam("baud rate switch not supported".into()))
    }

    /// Program a single OTP bit. `byte_index` selects the efuse byte,
    /// `bit_offset` the bit within it (0..8).
    #[cfg(feature = "efuse")]
    fn efuse_write_bit(&mut self, _byte_index: u16, _bit_offset: u16) -> Result<()> {
        Err(Error::Efuse("efuse not supported".into()))
    }

    /// Read one efuse item into `buf`.
    #[cfg(feature = "efuse")]
    fn efuse_read_item(&mut self, _index: u16, _buf: &mut [u8]) -> Result<()> {
        Err(Error::Efuse("efuse not supported".into()))
    }

    /// Number of addressable efuse items (bounds burn/read requests).
    #[cfg(feature = "efuse")]
    fn efuse_item_count(&self) -> u16 {
        0
    }
}
