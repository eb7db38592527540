//! YMODEM file transfer engines.
//!
//! The loader uses YMODEM in both directions: receiving firmware images and
//! configuration blobs from the host (download), and sending stored data
//! back to it (upload). Both sides use CRC16 mode.
//!
//! ```text
//! Packet format:
//! +------+-----+------+----------------+--------+
//! | HDR  | SEQ | ~SEQ |      DATA      | CRC16  |
//! +------+-----+------+----------------+--------+
//! | 1    | 1   | 1    | 128..8192      | 2 (BE) |
//! +------+-----+------+----------------+--------+
//! ```
//!
//! The header byte selects the data length: SOH = 128, STX = 1024, and the
//! extended headers 0x0A/0x0B/0x0C select 2048/4096/8192. Block 0 carries
//! the file name and a textual length (decimal or `0x`-prefixed hex).
//!
//! YMODEM has no selective acknowledgement: the only recovery from a lost
//! ACK is the sender retransmitting the last block, which the receiver
//! detects as `expected - 1` and re-ACKs without consuming.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::crc::crc16_xmodem;
use log::{debug, trace};
use std::thread;
use std::time::Duration;

/// YMODEM control characters.
pub mod control {
    /// Start of header, 128-byte data block.
    pub const SOH: u8 = 0x01;
    /// Start of text, 1024-byte data block.
    pub const STX: u8 = 0x02;
    /// Extended header, 2048-byte data block.
    pub const STX_2K: u8 = 0x0A;
    /// Extended header, 4096-byte data block.
    pub const STX_4K: u8 = 0x0B;
    /// Extended header, 8192-byte data block.
    pub const STX_8K: u8 = 0x0C;
    /// End of transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Data length of an SOH packet.
pub const SOH_DATA_LEN: usize = 128;

/// Data length of an STX packet.
pub const STX_DATA_LEN: usize = 1024;

/// Largest supported packet data length.
pub const PACKET_DATA_MAX: usize = 8192;

/// Filler byte used to pad short transmit packets.
pub const EOF_PAD: u8 = 0x1A;

/// Consecutive CAN bytes that abort a transfer.
const CAN_ABORT_COUNT: u32 = 3;

/// Settle delay before declaring a session finished or retrying the line.
const LINE_SETTLE_DELAY: Duration = Duration::from_millis(20);

/// YMODEM session options.
#[derive(Debug, Clone)]
pub struct YmodemConfig {
    /// Timeout for a single byte read.
    pub byte_timeout: Duration,
    /// Packet receive retries / transmit NAK ceiling.
    pub max_retries: u32,
    /// Smallest acceptable declared file length (inclusive).
    pub min_size: u32,
    /// Largest acceptable declared file length (inclusive).
    pub max_size: u32,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        Self {
            byte_timeout: Duration::from_millis(1000),
            max_retries: 20,
            min_size: 1,
            max_size: 0x0080_0000,
        }
    }
}

/// Outcome of one packet receive attempt.
enum RawPacket {
    /// A data or header block landed in the packet buffer.
    Block,
    /// The sender signalled end of transmission.
    Eot,
}

/// YMODEM receive session. One instance per transfer.
pub struct YmodemReceiver<'a, C: Channel> {
    chan: &'a mut C,
    config: YmodemConfig,
    packet: Box<[u8]>,
    packet_len: usize,
    packet_off: usize,
    rx_eof: bool,
    tx_ack: bool,
    blk: u8,
    expected_blk: u8,
    file_length: u32,
    read_length: u32,
}

impl<'a, C: Channel> YmodemReceiver<'a, C> {
    /// Create a receive session over `chan`.
    pub fn new(chan: &'a mut C, config: YmodemConfig) -> Self {
        Self {
            chan,
            config,
            packet: vec![0u8; PACKET_DATA_MAX].into_boxed_slice(),
            packet_len: 0,
            packet_off: 0,
            rx_eof: false,
            tx_ack: false,
            blk: 0,
            expected_blk: 0,
            file_length: 0,
            read_length: 0,
        }
    }

    /// File length declared by the sender's header block.
    pub fn file_length(&self) -> u32 {
        self.file_length
    }

    /// Start the transfer: request CRC mode and consume the header block.
    ///
    /// Validates the declared file length against the configured bounds
    /// before any data packet is requested. `kick` keeps the watchdog fed
    /// across retries.
    pub fn open(&mut self, kick: &mut dyn FnMut()) -> Result<()> {
        self.packet_len = 0;
        self.packet_off = 0;
        self.file_length = 0;
        self.read_length = 0;
        self.tx_ack = false;
        self.rx_eof = false;

        self.put(control::C)?;
        kick();

        let mut retries = self.config.max_retries;
        while retries > 0 {
            retries -= 1;
            match self.read_packet() {
                Ok(RawPacket::Block) => return self.parse_file_info(),
                Ok(RawPacket::Eot) => {}, // nothing sent yet, not a valid start
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_timeout() => {
                    kick();
                    thread::sleep(LINE_SETTLE_DELAY);
                    self.put(control::C)?;
                },
                Err(e) => trace!("discarding bad start packet: {e}"),
            }
        }
        Err(Error::Timeout("no YMODEM start packet received".into()))
    }

    /// Copy up to `buf.len()` bytes of file data into `buf`.
    ///
    /// Returns the number of bytes copied; a short count means the transfer
    /// ended. Packet fetch, duplicate handling and the EOT handshake happen
    /// underneath.
    pub fn read(&mut self, buf: &mut [u8], kick: &mut dyn FnMut()) -> Result<usize> {
        let mut total = 0;
        while !self.rx_eof && total < buf.len() {
            if self.packet_off >= self.packet_len {
                if !self.fetch_packet(kick)? {
                    break;
                }
            }
            let n = (self.packet_len - self.packet_off).min(buf.len() - total);
            buf[total..total + n]
                .copy_from_slice(&self.packet[self.packet_off..self.packet_off + n]);
            self.packet_off += n;
            total += n;
        }
        Ok(total)
    }

    /// Flush whatever the sender still has in flight.
    pub fn close(&mut self) {
        self.chan.drain();
    }

    fn put(&mut self, byte: u8) -> Result<()> {
        self.chan.write_all_bytes(&[byte])
    }

    /// Wait for the next packet the caller can consume.
    ///
    /// Returns `Ok(true)` when a fresh in-sequence packet is buffered and
    /// `Ok(false)` on end-of-transfer. Duplicates of the previous block are
    /// re-ACKed and skipped; anything else burns a retry and requests a
    /// retransmit.
    fn fetch_packet(&mut self, kick: &mut dyn FnMut()) -> Result<bool> {
        let mut retries = self.config.max_retries;
        let mut last_err: Option<Error> = None;
        while retries > 0 {
            retries -= 1;
            match self.read_packet() {
                Ok(RawPacket::Block) => {
                    if self.blk == self.expected_blk {
                        self.accept_packet();
                        return Ok(true);
                    } else if self.blk == self.expected_blk.wrapping_sub(1) {
                        // retransmit after a lost ACK: re-ACK, do not consume
                        debug!("duplicate block {}, re-acking", self.blk);
                        self.put(control::ACK)?;
                        continue;
                    }
                    last_err = Some(Error::Sequence {
                        expected: self.expected_blk,
                        actual: self.blk,
                    });
                },
                Ok(RawPacket::Eot) => {
                    // ACK the EOT, request and drain the terminating null
                    // block, ACK it, done.
                    self.put(control::ACK)?;
                    self.put(control::C)?;
                    let _ = self.read_packet();
                    self.put(control::ACK)?;
                    self.rx_eof = true;
                    return Ok(false);
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => last_err = Some(e),
            }
            self.chan.drain();
            self.put(control::C)?;
            kick();
        }
        Err(last_err
            .unwrap_or_else(|| Error::Timeout("YMODEM receive retries exhausted".into())))
    }

    /// Receive one raw packet into the packet buffer.
    fn read_packet(&mut self) -> Result<RawPacket> {
        if self.tx_ack {
            self.put(control::ACK)?;
            self.tx_ack = false;
        }

        let data_len = match self.read_packet_header()? {
            Some(len) => len,
            None => return Ok(RawPacket::Eot),
        };

        let blk = self.read_data_byte()?;
        let cblk = self.read_data_byte()?;
        for i in 0..data_len {
            self.packet[i] = self.read_data_byte()?;
        }
        let crc_hi = self.read_data_byte()?;
        let crc_lo = self.read_data_byte()?;

        if blk ^ cblk != 0xFF {
            return Err(Error::Ymodem(format!(
                "block number corrupt: {blk:#04x}/{cblk:#04x}"
            )));
        }
        let transmitted = (u16::from(crc_hi) << 8) | u16::from(crc_lo);
        let computed = crc16_xmodem(&self.packet[..data_len]);
        if computed != transmitted {
            return Err(Error::CrcMismatch {
                expected: computed,
                actual: transmitted,
            });
        }

        self.blk = blk;
        self.packet_len = data_len;
        self.packet_off = 0;
        Ok(RawPacket::Block)
    }

    /// Scan for a packet header byte.
    ///
    /// Returns the selected data length, or `None` for EOT. Three CANs
    /// abort; an EOT is only honoured as the very first byte of the scan.
    fn read_packet_header(&mut self) -> Result<Option<usize>> {
        let mut can_count = 0u32;
        let mut first = true;
        loop {
            let ch = match self.read_data_byte() {
                Ok(ch) => ch,
                Err(e) if e.is_timeout() => {
                    self.chan.drain();
                    thread::sleep(LINE_SETTLE_DELAY);
                    return Err(e);
                },
                Err(e) => return Err(e),
            };
            match ch {
                control::SOH => return Ok(Some(SOH_DATA_LEN)),
                control::STX => return Ok(Some(STX_DATA_LEN)),
                control::STX_2K => return Ok(Some(2048)),
                control::STX_4K => return Ok(Some(4096)),
                control::STX_8K => return Ok(Some(PACKET_DATA_MAX)),
                control::CAN => {
                    can_count += 1;
                    if can_count == CAN_ABORT_COUNT {
                        return Err(Error::Cancelled);
                    }
                },
                control::EOT if first => {
                    self.put(control::ACK)?;
                    return Ok(None);
                },
                _ => {},
            }
            first = false;
        }
    }

    fn read_data_byte(&mut self) -> Result<u8> {
        self.chan.read_byte(self.config.byte_timeout)
    }

    /// Consume the header block: skip the file name, parse and bound the
    /// textual length field.
    fn parse_file_info(&mut self) -> Result<()> {
        if self.blk == 0 {
            let window = &self.packet[..self.packet_len.min(SOH_DATA_LEN)];
            let name_end = window.iter().position(|&b| b == 0).unwrap_or(window.len());
            debug!(
                "YMODEM header: {:?}",
                String::from_utf8_lossy(&window[..name_end])
            );
            let length_field = window.get(name_end + 1..).unwrap_or(&[]);
            self.file_length = parse_length(length_field)?;
            if self.file_length < self.config.min_size
                || self.file_length > self.config.max_size
            {
                return Err(Error::Ymodem(format!(
                    "declared length {} outside [{}, {}]",
                    self.file_length, self.config.min_size, self.config.max_size
                )));
            }
            self.tx_ack = true;
        }
        self.expected_blk = 1;
        self.packet_len = 0;
        self.packet_off = 0;
        Ok(())
    }

    /// Book-keeping for an accepted in-sequence packet.
    fn accept_packet(&mut self) {
        self.tx_ack = true;
        self.expected_blk = self.expected_blk.wrapping_add(1);
        self.read_length += self.packet_len as u32;
        if self.read_length > self.file_length {
            // final packet overruns the declared length, trim the padding
            let excess = (self.read_length - self.file_length) as usize;
            self.packet_len -= excess.min(self.packet_len);
        }
        self.packet_off = 0;
    }
}

/// Parse the textual length field of a YMODEM header block.
///
/// Accepts decimal or `0x`/`0X`-prefixed hexadecimal, terminated by NUL or
/// whitespace.
fn parse_length(field: &[u8]) -> Result<u32> {
    let text = field.split(|&b| b == 0).next().unwrap_or(&[]);
    let text = std::str::from_utf8(text)
        .map_err(|_| Error::Ymodem("length field is not text".into()))?;
    let token = text.trim_start_matches(' ');
    let token = token.split(' ').next().unwrap_or("");
    let value = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        token.parse::<u32>()
    };
    value.map_err(|_| Error::Ymodem(format!("bad length field {token:?}")))
}

#[cfg(feature = "upload")]
pub use sender::YmodemSender;

#[cfg(feature = "upload")]
mod sender {
    use super::*;

    /// Total size of an SOH packet on the wire.
    const SOH_PACKET_TOTAL: usize = 3 + SOH_DATA_LEN + 2;

    /// Total size of an STX packet on the wire.
    const STX_PACKET_TOTAL: usize = 3 + STX_DATA_LEN + 2;

    /// Drain delay after the final ACK before declaring success.
    const FINISH_DELAY: Duration = Duration::from_millis(100);

    /// Transmit-side protocol stage, advanced by received control bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TxStage {
        /// Waiting for the initial 'C' that requests the file-info block.
        WaitStartC,
        /// File-info block sent, waiting for its ACK.
        WaitInitAck,
        /// Waiting for the 'C' that starts the data phase.
        WaitTransC,
        /// Mid-file data block sent, waiting for its ACK.
        WaitInterAck,
        /// Final data block sent, waiting for its ACK.
        WaitFinalAck,
        /// EOT sent, waiting for the 'C' that requests the null block.
        WaitEotC,
        /// Terminating null block sent, waiting for the closing ACK.
        WaitZeroAck,
    }

    /// YMODEM transmit session. One instance per upload.
    ///
    /// Unlike the receive direction this is driven by the peer: each
    /// received control byte (`C`, ACK, NAK, CAN) advances the stage
    /// machine. `source` supplies file bytes by offset, so data can stream
    /// straight out of flash without staging the whole file.
    pub struct YmodemSender<'a, C: Channel, S>
    where
        S: FnMut(u32, &mut [u8]) -> Result<()>,
    {
        chan: &'a mut C,
        config: YmodemConfig,
        source: S,
        file_name: &'a str,
        file_length: u32,
        offset: u32,
        seq: u8,
        stage: TxStage,
        retry: u32,
        can_count: u32,
        buffer: [u8; STX_PACKET_TOTAL],
        last_len: usize,
    }

    impl<'a, C: Channel, S> YmodemSender<'a, C, S>
    where
        S: FnMut(u32, &mut [u8]) -> Result<()>,
    {
        /// Create a transmit session for `file_length` bytes pulled from
        /// `source`.
        pub fn new(
            chan: &'a mut C,
            config: YmodemConfig,
            file_name: &'a str,
            file_length: u32,
            source: S,
        ) -> Self {
            Self {
                chan,
                config,
                source,
                file_name,
                file_length,
                offset: 0,
                seq: 0,
                stage: TxStage::WaitStartC,
                retry: 0,
                can_count: 0,
                buffer: [0u8; STX_PACKET_TOTAL],
                last_len: 0,
            }
        }

        /// Run the transfer to completion.
        pub fn send(&mut self) -> Result<()> {
            let mut idle = 0u32;
            loop {
                let ch = match self.chan.read_byte(self.config.byte_timeout) {
                    Ok(ch) => ch,
                    Err(e) if e.is_timeout() => {
                        idle += 1;
                        if idle > self.config.max_retries {
                            return Err(e);
                        }
                        continue;
                    },
                    Err(e) => return Err(e),
                };
                idle = 0;

                match ch {
                    control::C => {
                        self.can_count = 0;
                        self.retry = 0;
                        self.on_start_request()?;
                    },
                    control::ACK => {
                        self.can_count = 0;
                        self.retry = 0;
                        if self.stage == TxStage::WaitZeroAck {
                            thread::sleep(FINISH_DELAY);
                            debug!("upload complete: {} bytes", self.file_length);
                            return Ok(());
                        }
                        self.on_ack()?;
                    },
                    control::NAK => {
                        self.can_count = 0;
                        self.retry += 1;
                        if self.retry == self.config.max_retries {
                            return Err(Error::Ymodem(
                                "peer rejected packet after retries".into(),
                            ));
                        }
                        self.on_nak()?;
                    },
                    control::CAN => {
                        self.retry = 0;
                        self.can_count += 1;
                        if self.can_count == CAN_ABORT_COUNT {
                            return Err(Error::Cancelled);
                        }
                    },
                    _ => {
                        self.can_count = 0;
                    },
                }
            }
        }

        /// Peer sent 'C': emit whatever unit the current stage calls for.
        fn on_start_request(&mut self) -> Result<()> {
            match self.stage {
                TxStage::WaitStartC => self.send_file_info(),
                TxStage::WaitTransC => self.send_data(),
                TxStage::WaitEotC => self.send_null_info(),
                _ => Ok(()),
            }
        }

        fn on_ack(&mut self) -> Result<()> {
            match self.stage {
                TxStage::WaitInitAck => {
                    self.stage = TxStage::WaitTransC;
                    Ok(())
                },
                TxStage::WaitInterAck => self.send_data(),
                TxStage::WaitFinalAck => {
                    self.chan.write_all_bytes(&[control::EOT])?;
                    self.stage = TxStage::WaitEotC;
                    Ok(())
                },
                _ => Ok(()),
            }
        }

        /// Peer rejected the last unit: send it again verbatim.
        fn on_nak(&mut self) -> Result<()> {
            match self.stage {
                TxStage::WaitInitAck
                | TxStage::WaitInterAck
                | TxStage::WaitFinalAck
                | TxStage::WaitZeroAck => self.resend_last(),
                TxStage::WaitEotC => self.chan.write_all_bytes(&[control::EOT]),
                _ => Ok(()),
            }
        }

        fn resend_last(&mut self) -> Result<()> {
            trace!("retransmitting last packet ({} bytes)", self.last_len);
            self.chan.write_all_bytes(&self.buffer[..self.last_len])
        }

        /// Block 0: file name, NUL, decimal length text; CRC over the fixed
        /// 128-byte span.
        fn send_file_info(&mut self) -> Result<()> {
            self.buffer[..SOH_PACKET_TOTAL].fill(0);
            self.buffer[0] = control::SOH;
            self.buffer[1] = self.seq;
            self.buffer[2] = !self.seq;

            let name = self.file_name.as_bytes();
            let name_len = name.len().min(SOH_DATA_LEN / 2);
            self.buffer[3..3 + name_len].copy_from_slice(&name[..name_len]);
            let text = self.file_length.to_string();
            let text_at = 3 + name_len + 1;
            self.buffer[text_at..text_at + text.len()].copy_from_slice(text.as_bytes());

            self.seal_soh_packet();
            self.stage = TxStage::WaitInitAck;
            self.chan.write_all_bytes(&self.buffer[..SOH_PACKET_TOTAL])
        }

        /// Send the next data block: SOH when the remainder fits 128 bytes,
        /// STX otherwise, both padded with EOF filler.
        fn send_data(&mut self) -> Result<()> {
            let remain = self.file_length - self.offset;
            self.stage = TxStage::WaitFinalAck;
            self.buffer.fill(EOF_PAD);
            self.seq = self.seq.wrapping_add(1);
            self.buffer[1] = self.seq;
            self.buffer[2] = !self.seq;

            let chunk;
            if remain <= SOH_DATA_LEN as u32 {
                self.buffer[0] = control::SOH;
                chunk = remain;
                (self.source)(self.offset, &mut self.buffer[3..3 + chunk as usize])?;
                self.seal_soh_packet();
                self.last_len = SOH_PACKET_TOTAL;
            } else {
                self.buffer[0] = control::STX;
                chunk = remain.min(STX_DATA_LEN as u32);
                if remain > STX_DATA_LEN as u32 {
                    self.stage = TxStage::WaitInterAck;
                }
                (self.source)(self.offset, &mut self.buffer[3..3 + chunk as usize])?;
                let crc = crc16_xmodem(&self.buffer[3..3 + STX_DATA_LEN]);
                self.buffer[3 + STX_DATA_LEN] = (crc >> 8) as u8;
                self.buffer[3 + STX_DATA_LEN + 1] = crc as u8;
                self.last_len = STX_PACKET_TOTAL;
            }
            self.chan.write_all_bytes(&self.buffer[..self.last_len])?;
            self.offset += chunk;
            Ok(())
        }

        /// Terminating null block that closes the YMODEM session.
        fn send_null_info(&mut self) -> Result<()> {
            self.buffer[..SOH_PACKET_TOTAL].fill(0);
            self.buffer[0] = control::SOH;
            self.buffer[1] = 0;
            self.buffer[2] = 0xFF;
            self.seal_soh_packet();
            self.stage = TxStage::WaitZeroAck;
            self.chan.write_all_bytes(&self.buffer[..SOH_PACKET_TOTAL])
        }

        /// CRC the fixed 128-byte span and record the packet length for
        /// retransmits.
        fn seal_soh_packet(&mut self) {
            let crc = crc16_xmodem(&self.buffer[3..3 + SOH_DATA_LEN]);
            self.buffer[3 + SOH_DATA_LEN] = (crc >> 8) as u8;
            self.buffer[3 + SOH_DATA_LEN + 1] = crc as u8;
            self.last_len = SOH_PACKET_TOTAL;
        }
    }
}
