//! In-memory test doubles shared by the module tests.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::platform::{Platform, UartConfig};
use crate::protocol::crc::crc16_xmodem;
use crate::protocol::ymodem::{EOF_PAD, SOH_DATA_LEN, control};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

/// Build a YMODEM packet with the header byte selected by `data_span`.
pub(crate) fn ym_packet(seq: u8, data: &[u8], data_span: usize) -> Vec<u8> {
    let header = match data_span {
        128 => control::SOH,
        1024 => control::STX,
        2048 => control::STX_2K,
        4096 => control::STX_4K,
        8192 => control::STX_8K,
        _ => panic!("bad packet span"),
    };
    let mut pkt = Vec::with_capacity(data_span + 5);
    pkt.push(header);
    pkt.push(seq);
    pkt.push(!seq);
    pkt.extend_from_slice(data);
    pkt.resize(3 + data_span, EOF_PAD);
    let crc = crc16_xmodem(&pkt[3..]);
    pkt.push((crc >> 8) as u8);
    pkt.push(crc as u8);
    pkt
}

/// YMODEM block 0 carrying a file name and textual length.
pub(crate) fn ym_header_packet(name: &str, length: &str) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(name.as_bytes());
    data.push(0);
    data.extend_from_slice(length.as_bytes());
    data.push(0);
    data.resize(SOH_DATA_LEN, 0);
    ym_packet(0, &data, SOH_DATA_LEN)
}

/// Complete YMODEM stream for one file: header, data blocks, EOT, null.
pub(crate) fn ym_stream(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut stream = ym_header_packet(name, &payload.len().to_string());
    for (i, chunk) in payload.chunks(1024).enumerate() {
        stream.extend_from_slice(&ym_packet((i + 1) as u8, chunk, 1024));
    }
    stream.push(control::EOT);
    stream.extend_from_slice(&ym_packet(0, &[0u8; SOH_DATA_LEN], SOH_DATA_LEN));
    stream
}

/// Mock serial channel with separate read/write buffers.
///
/// Reads return `TimedOut` while the scripted input is exhausted; after
/// `max_idle_reads` consecutive empty reads the channel reports
/// `UnexpectedEof`, which the command loop treats as a dead line. That
/// bounds every test that would otherwise poll forever.
pub(crate) struct MockChannel {
    read_buf: VecDeque<u8>,
    write_buf: Vec<u8>,
    idle_reads: u32,
    max_idle_reads: u32,
}

impl MockChannel {
    pub(crate) fn new(response: &[u8]) -> Self {
        Self {
            read_buf: response.iter().copied().collect(),
            write_buf: Vec::new(),
            idle_reads: 0,
            max_idle_reads: 200,
        }
    }

    /// Everything the code under test wrote so far.
    pub(crate) fn written(&self) -> &[u8] {
        &self.write_buf
    }

    /// Count occurrences of `byte` in the written output.
    pub(crate) fn count_written(&self, byte: u8) -> usize {
        self.write_buf.iter().filter(|&&b| b == byte).count()
    }
}

impl Read for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.read_buf.is_empty() {
            self.idle_reads += 1;
            if self.idle_reads > self.max_idle_reads {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "channel closed",
                ));
            }
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
        }
        self.idle_reads = 0;
        let n = buf.len().min(self.read_buf.len());
        for b in buf.iter_mut().take(n) {
            *b = self.read_buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Channel for MockChannel {
    fn set_read_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Mock board with in-memory flash and call recording.
pub(crate) struct MockPlatform {
    pub flash: Vec<u8>,
    pub erase_calls: Vec<(u32, u32)>,
    pub write_calls: Vec<(u32, usize)>,
    pub wdt_kicks: u32,
    pub reset_count: u32,
    pub baud_changes: Vec<UartConfig>,
    pub version: Vec<u8>,
    pub fail_erase: bool,
    pub fail_write: bool,
    #[cfg(feature = "efuse")]
    pub efuse_bits: Vec<(u16, u16)>,
    /// Efuse byte indexes whose writes report a hardware error.
    #[cfg(feature = "efuse")]
    pub efuse_bad_bytes: Vec<u16>,
    #[cfg(feature = "efuse")]
    pub efuse_items: u16,
}

impl MockPlatform {
    pub(crate) fn new(flash_size: usize) -> Self {
        Self {
            flash: vec![0xFF; flash_size],
            erase_calls: Vec::new(),
            write_calls: Vec::new(),
            wdt_kicks: 0,
            reset_count: 0,
            baud_changes: Vec::new(),
            version: b"loaderboot test 0.1\0".to_vec(),
            fail_erase: false,
            fail_write: false,
            #[cfg(feature = "efuse")]
            efuse_bits: Vec::new(),
            #[cfg(feature = "efuse")]
            efuse_bad_bytes: Vec::new(),
            #[cfg(feature = "efuse")]
            efuse_items: 32,
        }
    }
}

impl Platform for MockPlatform {
    fn flash_capacity(&self) -> u32 {
        self.flash.len() as u32
    }

    fn flash_erase(&mut self, offset: u32, size: u32) -> Result<()> {
        self.erase_calls.push((offset, size));
        if self.fail_erase {
            return Err(Error::Flash("erase failed".into()));
        }
        let start = offset as usize;
        let end = start.saturating_add(size as usize).min(self.flash.len());
        if start < self.flash.len() {
            self.flash[start..end].fill(0xFF);
        }
        Ok(())
    }

    fn flash_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.write_calls.push((offset, data.len()));
        if self.fail_write {
            return Err(Error::Flash("write failed".into()));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > self.flash.len() {
            return Err(Error::Flash("write out of range".into()));
        }
        self.flash[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flash_read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.flash.len() {
            return Err(Error::Flash("read out of range".into()));
        }
        buf.copy_from_slice(&self.flash[start..end]);
        Ok(())
    }

    fn kick_watchdog(&mut self) {
        self.wdt_kicks += 1;
    }

    fn reset(&mut self) {
        self.reset_count += 1;
    }

    fn firmware_version(&self) -> &[u8] {
        &self.version
    }

    fn set_baud_rate(&mut self, config: &UartConfig) -> Result<()> {
        self.baud_changes.push(*config);
        Ok(())
    }

    #[cfg(feature = "efuse")]
    fn efuse_write_bit(&mut self, byte_index: u16, bit_offset: u16) -> Result<()> {
        if self.efuse_bad_bytes.contains(&byte_index) {
            return Err(Error::Efuse(format!("bit write failed at byte {byte_index}")));
        }
        self.efuse_bits.push((byte_index, bit_offset));
        Ok(())
    }

    #[cfg(feature = "efuse")]
    fn efuse_read_item(&mut self, _index: u16, buf: &mut [u8]) -> Result<()> {
        buf.fill(0x5A);
        Ok(())
    }

    #[cfg(feature = "efuse")]
    fn efuse_item_count(&self) -> u16 {
        self.efuse_items
    }
}
