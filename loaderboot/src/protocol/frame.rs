//! Command frame codec.
//!
//! Every command and acknowledgement on the boot serial link uses the same
//! frame format:
//!
//! ```text
//! +------------+--------+------+-------+---------------+--------+
//! |   Magic    | Length | Type | ~Type |    Payload    | CRC16  |
//! +------------+--------+------+-------+---------------+--------+
//! |   4 bytes  | 2 bytes| 1    | 1     |   variable    | 2 bytes|
//! +------------+--------+------+-------+---------------+--------+
//! | 0xDEADBEEF |  total | cmd  | ~cmd  |   payload     | CRC    |
//! +------------+--------+------+-------+---------------+--------+
//! ```
//!
//! The length field counts the whole frame including header and CRC. The
//! CRC16-XMODEM covers everything before the CRC field. All multi-byte
//! fields are little-endian.
//!
//! The receive side is a byte-at-a-time state machine: the transport gives
//! no framing guarantee, so the scanner hunts for the 4-byte magic in the
//! stream and resynchronises on a stray `0xEF` (the first magic byte on the
//! wire) instead of staying desynced after a bit error.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::crc::{crc16_xmodem, crc16_xmodem_update};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::{debug, trace};
use std::time::Duration;

/// Frame magic number (transmitted little-endian: `EF BE AD DE`).
pub const FRAME_MAGIC: u32 = 0xDEADBEEF;

/// First magic byte on the wire; seeing it mid-scan restarts the header
/// match at position 1 instead of position 0.
const RESYNC_BYTE: u8 = 0xEF;

/// Fixed header length: magic(4) + length(2) + type(1) + pad(1).
pub const FRAME_HEADER_LEN: usize = 8;

/// Trailing checksum length.
pub const CHECKSUM_LEN: usize = 2;

/// Smallest legal frame: header plus checksum, no payload.
pub const FRAME_MIN_LEN: usize = FRAME_HEADER_LEN + CHECKSUM_LEN;

/// Largest legal frame (codec buffer capacity).
pub const FRAME_MAX_LEN: usize = 1024;

/// Total length of an acknowledgement frame.
pub const ACK_LEN: usize = 12;

/// ACK status code for success.
pub const ACK_SUCCESS: u8 = 0x5A;

/// ACK status code for failure.
pub const ACK_FAILURE: u8 = 0xA5;

/// How many received bytes the header scanner tolerates before giving up.
const HEADER_SCAN_MAX: u32 = 100;

/// Command opcodes (frame type field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    /// Download a flash image (0xD2).
    DownloadImage = 0xD2,

    /// Download a factory image; same flash path, different source marker
    /// (0x78).
    FactoryImage = 0x78,

    /// Upload data from flash back to the host (0xB4).
    UploadData = 0xB4,

    /// Burn an efuse configuration blob (0xC3).
    BurnEfuse = 0xC3,

    /// Read an efuse item (0xA5).
    ReadEfuse = 0xA5,

    /// Report the loader version string (0x69).
    ReadVersion = 0x69,

    /// Switch the UART baud rate (0x5A).
    SetBaudRate = 0x5A,

    /// Reset the device (0x87).
    Reset = 0x87,

    /// Acknowledgement frame type (device to host, 0xE1).
    Ack = 0xE1,
}

impl CommandType {
    /// Map a raw opcode byte to a command, if it is one we know.
    pub fn from_u8(op: u8) -> Option<Self> {
        match op {
            0xD2 => Some(Self::DownloadImage),
            0x78 => Some(Self::FactoryImage),
            0xB4 => Some(Self::UploadData),
            0xC3 => Some(Self::BurnEfuse),
            0xA5 => Some(Self::ReadEfuse),
            0x69 => Some(Self::ReadVersion),
            0x5A => Some(Self::SetBaudRate),
            0x87 => Some(Self::Reset),
            0xE1 => Some(Self::Ack),
            _ => None,
        }
    }

    /// The pad byte paired with this opcode (~cmd).
    pub fn pad(self) -> u8 {
        !(self as u8)
    }
}

/// A validated command frame: opcode plus payload, checksum already
/// verified and stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    cmd: u8,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame for the given command.
    pub fn new(cmd: CommandType, payload: Vec<u8>) -> Self {
        Self {
            cmd: cmd as u8,
            payload,
        }
    }

    /// Build an acknowledgement frame carrying `code`.
    pub fn ack(code: u8) -> Self {
        Self {
            cmd: CommandType::Ack as u8,
            payload: vec![code, !code],
        }
    }

    /// Raw opcode byte.
    pub fn command(&self) -> u8 {
        self.cmd
    }

    /// Opcode as a [`CommandType`], if recognised.
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_u8(self.cmd)
    }

    /// Frame payload (checksum excluded).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Read a little-endian u32 at `offset` in the payload.
    pub fn payload_u32(&self, offset: usize) -> Result<u32> {
        self.payload
            .get(offset..offset + 4)
            .map(LittleEndian::read_u32)
            .ok_or_else(|| Error::InvalidParam("payload too short".into()))
    }

    /// Read a little-endian u16 at `offset` in the payload.
    pub fn payload_u16(&self, offset: usize) -> Result<u16> {
        self.payload
            .get(offset..offset + 2)
            .map(LittleEndian::read_u16)
            .ok_or_else(|| Error::InvalidParam("payload too short".into()))
    }

    /// Read a byte at `offset` in the payload.
    pub fn payload_u8(&self, offset: usize) -> Result<u8> {
        self.payload
            .get(offset)
            .copied()
            .ok_or_else(|| Error::InvalidParam("payload too short".into()))
    }

    /// Serialize the complete frame including checksum.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let total_len = FRAME_MIN_LEN + self.payload.len();
        let mut buf = Vec::with_capacity(total_len);

        // Magic (little-endian)
        buf.write_u32::<LittleEndian>(FRAME_MAGIC).unwrap();

        // Length (includes everything) - safe cast, frames are < 64KB
        buf.write_u16::<LittleEndian>(total_len as u16).unwrap();

        // Opcode and its complement
        buf.push(self.cmd);
        buf.push(!self.cmd);

        // Payload
        buf.extend_from_slice(&self.payload);

        // CRC16 over everything before the CRC
        let crc = crc16_xmodem(&buf);
        buf.write_u16::<LittleEndian>(crc).unwrap();

        buf
    }
}

/// Command frame receiver/transmitter over a byte channel.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Timeout while hunting for the first header byte.
    pub header_timeout: Duration,
    /// Per-byte timeout for the rest of the frame.
    pub byte_timeout: Duration,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(2),
            byte_timeout: Duration::from_millis(100),
        }
    }
}

impl FrameCodec {
    /// Receive one validated command frame.
    ///
    /// `kick` is invoked on every scanner iteration so a slow host cannot
    /// starve the watchdog.
    pub fn receive<C: Channel>(&self, chan: &mut C, kick: &mut dyn FnMut()) -> Result<Frame> {
        let header = self.receive_header(chan, kick)?;
        let packet_size = usize::from(LittleEndian::read_u16(&header[4..6]));
        let cmd = header[6];

        // Body: payload plus trailing checksum, each byte on a short fuse.
        let body_len = packet_size - FRAME_HEADER_LEN;
        let mut body = vec![0u8; body_len];
        for slot in body.iter_mut() {
            *slot = chan.read_byte(self.byte_timeout)?;
        }

        let (payload, cs) = body.split_at(body_len - CHECKSUM_LEN);
        let transmitted = LittleEndian::read_u16(cs);
        let computed = crc16_xmodem_update(crc16_xmodem(&header), payload);
        if computed != transmitted {
            return Err(Error::CrcMismatch {
                expected: computed,
                actual: transmitted,
            });
        }

        trace!("frame received: cmd={cmd:#04x} payload={} bytes", payload.len());
        Ok(Frame {
            cmd,
            payload: payload.to_vec(),
        })
    }

    /// Hunt for a complete, plausible 8-byte header in the byte stream.
    fn receive_header<C: Channel>(
        &self,
        chan: &mut C,
        kick: &mut dyn FnMut(),
    ) -> Result<[u8; FRAME_HEADER_LEN]> {
        let magic = FRAME_MAGIC.to_le_bytes();
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut pos = 0usize;
        let mut received = 0u32;

        while received < HEADER_SCAN_MAX {
            kick();
            let timeout = if pos == 0 {
                self.header_timeout
            } else {
                self.byte_timeout
            };
            let ch = match chan.read_byte(timeout) {
                Ok(ch) => ch,
                // Nothing arrived at all: the line is just idle.
                Err(e) if e.is_timeout() && received == 0 => return Err(Error::Idle),
                Err(e) => return Err(e),
            };
            received += 1;

            if pos < magic.len() {
                if ch == magic[pos] {
                    header[pos] = ch;
                    pos += 1;
                } else if ch == RESYNC_BYTE {
                    header[0] = ch;
                    pos = 1;
                } else {
                    pos = 0;
                }
                continue;
            }

            header[pos] = ch;
            pos += 1;

            if pos == 6 {
                let size = usize::from(LittleEndian::read_u16(&header[4..6]));
                if !(FRAME_MIN_LEN..=FRAME_MAX_LEN).contains(&size) {
                    debug!("implausible frame length {size}, resyncing");
                    pos = 0;
                }
            } else if pos == FRAME_HEADER_LEN {
                if header[7] != !header[6] {
                    return Err(Error::Frame(format!(
                        "pad byte {:#04x} does not match opcode {:#04x}",
                        header[7], header[6]
                    )));
                }
                return Ok(header);
            }
        }
        Err(Error::Frame("no frame header found in the byte stream".into()))
    }

    /// Emit an acknowledgement frame carrying `code`.
    ///
    /// Header and payload go out first, then the checksum, matching the
    /// original two-write sequence on the wire.
    pub fn send_ack<C: Channel>(&self, chan: &mut C, code: u8) -> Result<()> {
        let encoded = Frame::ack(code).encode();
        debug_assert_eq!(encoded.len(), ACK_LEN);
        let split = encoded.len() - CHECKSUM_LEN;
        chan.write_all(&encoded[..split])?;
        chan.write_all(&encoded[split..])?;
        chan.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    fn receive(chan: &mut MockChannel) -> Result<Frame> {
        FrameCodec::default().receive(chan, &mut || {})
    }

    #[test]
    fn test_command_type_pad() {
        assert_eq!(CommandType::DownloadImage.pad(), 0x2D);
        assert_eq!(CommandType::Reset.pad(), 0x78);
        assert_eq!(CommandType::Ack.pad(), 0x1E);
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(CommandType::Reset, vec![0x00, 0x00]);
        let data = frame.encode();
        // Total: magic(4) + len(2) + cmd(1) + pad(1) + payload(2) + crc(2)
        assert_eq!(data.len(), 12);
        assert_eq!(&data[0..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&data[4..6], &[0x0C, 0x00]);
        assert_eq!(data[6], 0x87);
        assert_eq!(data[7], 0x78);
    }

    #[test]
    fn test_frame_round_trip() {
        for payload in [
            vec![],
            vec![0x42],
            (0..=255u8).collect::<Vec<_>>(),
            vec![0xEF; 64], // resync byte inside the payload must not confuse anything
        ] {
            let sent = Frame::new(CommandType::DownloadImage, payload.clone());
            let mut chan = MockChannel::new(&sent.encode());
            let got = receive(&mut chan).unwrap();
            assert_eq!(got.command(), CommandType::DownloadImage as u8);
            assert_eq!(got.payload(), payload.as_slice());
        }
    }

    #[test]
    fn test_single_bit_flip_rejected() {
        let encoded = Frame::new(CommandType::UploadData, vec![1, 2, 3, 4, 5, 6, 7, 8]).encode();
        // Flip one bit in the payload region: the CRC must catch it.
        for byte in 8..encoded.len() - CHECKSUM_LEN {
            let mut corrupted = encoded.clone();
            corrupted[byte] ^= 0x10;
            let mut chan = MockChannel::new(&corrupted);
            assert!(
                receive(&mut chan).is_err(),
                "bit flip at byte {byte} was accepted"
            );
        }
    }

    #[test]
    fn test_pad_mismatch_rejected() {
        let mut encoded = Frame::new(CommandType::Reset, vec![0, 0]).encode();
        encoded[7] = 0x00; // should be !0x87
        let mut chan = MockChannel::new(&encoded);
        let err = receive(&mut chan).unwrap_err();
        assert!(matches!(err, Error::Frame(_)), "got {err:?}");
    }

    #[test]
    fn test_resync_after_leading_noise() {
        let mut stream = vec![0x00, 0x12, 0xEF, 0x55]; // noise, including a false magic start
        stream.extend_from_slice(&Frame::new(CommandType::Reset, vec![0, 0]).encode());
        let mut chan = MockChannel::new(&stream);
        let frame = receive(&mut chan).unwrap();
        assert_eq!(frame.command_type(), Some(CommandType::Reset));
    }

    #[test]
    fn test_scan_limit_bounds_noise() {
        let mut chan = MockChannel::new(&[0x55; 150]);
        let err = receive(&mut chan).unwrap_err();
        assert!(matches!(err, Error::Frame(_)), "got {err:?}");
    }

    #[test]
    fn test_oversized_length_resyncs() {
        // Header claiming a 2000-byte frame, then a valid frame.
        let mut stream = vec![0xEF, 0xBE, 0xAD, 0xDE, 0xD0, 0x07];
        stream.extend_from_slice(&Frame::new(CommandType::Reset, vec![0, 0]).encode());
        let mut chan = MockChannel::new(&stream);
        let frame = receive(&mut chan).unwrap();
        assert_eq!(frame.command_type(), Some(CommandType::Reset));
    }

    #[test]
    fn test_timeout_mid_frame() {
        let encoded = Frame::new(CommandType::DownloadImage, vec![0; 13]).encode();
        let mut chan = MockChannel::new(&encoded[..12]); // truncated mid-payload
        let err = receive(&mut chan).unwrap_err();
        assert!(err.is_timeout(), "got {err:?}");
    }

    #[test]
    fn test_idle_line_is_not_a_frame_error() {
        let mut chan = MockChannel::new(&[]);
        let err = receive(&mut chan).unwrap_err();
        assert!(matches!(err, Error::Idle), "got {err:?}");
    }

    #[test]
    fn test_ack_frame_bytes() {
        let mut chan = MockChannel::new(&[]);
        FrameCodec::default()
            .send_ack(&mut chan, ACK_SUCCESS)
            .unwrap();
        let written = chan.written();
        assert_eq!(written.len(), ACK_LEN);
        assert_eq!(written[6], CommandType::Ack as u8);
        assert_eq!(written[7], 0x1E);
        assert_eq!(written[8], ACK_SUCCESS);
        assert_eq!(written[9], !ACK_SUCCESS);
        // The emitted ACK must itself parse as a valid frame.
        let mut echo = MockChannel::new(written);
        let frame = receive(&mut echo).unwrap();
        assert_eq!(frame.command_type(), Some(CommandType::Ack));
        assert_eq!(frame.payload(), &[ACK_SUCCESS, !ACK_SUCCESS]);
    }

    #[test]
    fn test_payload_accessors() {
        let mut payload = vec![0u8; 13];
        payload[0..4].copy_from_slice(&0x1000u32.to_le_bytes());
        payload[4..8].copy_from_slice(&4096u32.to_le_bytes());
        payload[8..12].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        payload[12] = 1;
        let frame = Frame::new(CommandType::DownloadImage, payload);
        assert_eq!(frame.payload_u32(0).unwrap(), 0x1000);
        assert_eq!(frame.payload_u32(4).unwrap(), 4096);
        assert_eq!(frame.payload_u32(8).unwrap(), 0xFFFF_FFFF);
        assert_eq!(frame.payload_u8(12).unwrap(), 1);
        assert!(frame.payload_u32(10).is_err());
    }
}
