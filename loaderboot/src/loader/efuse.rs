//! Efuse configuration burn and read-back.
//!
//! A burn command stages a configuration blob in RAM via YMODEM, verifies
//! the SHA-256 digest embedded in its header, then programs the requested
//! OTP bits one by one.
//!
//! Blob layout:
//!
//! ```text
//! header (48 bytes):
//!   hash[32] | stru_ver u8 | stru_size u8 | item_count u16 |
//!   file_size u32 | reserved u32[2]
//! items (item_count times):
//!   stru_ver u8 | stru_size u8 | start_bit u16 | bit_width u16 |
//!   value_len u16 | value[value_len]
//! ```
//!
//! The digest covers everything after the hash field. A single item whose
//! bit writes fail is logged and skipped: OTP bits cannot be un-set, so
//! aborting mid-burn would only leave the device in a worse half-programmed
//! state than finishing the remaining items.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::protocol::frame::{ACK_SUCCESS, Frame};
use crate::protocol::ymodem::YmodemReceiver;
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use sha2::{Digest, Sha256};

use super::Loader;

/// Size of the blob header.
pub(crate) const EFUSE_HEADER_LEN: usize = 48;

/// Fixed part of one item, before its value bytes.
const EFUSE_ITEM_FIXED_LEN: usize = 8;

/// Largest accepted configuration blob.
pub(crate) const EFUSE_CFG_MAX_LEN: u32 = 4096;

/// Length of the embedded SHA-256 digest.
const SHA256_LEN: usize = 32;

/// Bytes returned by a read-efuse request.
const EFUSE_READ_MAX_BYTES: usize = 32;

struct EfuseHeader {
    stru_size: u8,
    item_count: u16,
}

struct EfuseItem<'a> {
    start_bit: u16,
    bit_width: u16,
    value: &'a [u8],
    next_offset: usize,
}

impl<C: Channel, P: Platform> Loader<C, P> {
    /// Burn-efuse handler. Payload layout: `[file_len: u32]` at offset 0.
    pub(crate) fn handle_burn_efuse(&mut self, frame: &Frame) -> Result<()> {
        let file_len = frame.payload_u32(0)?;
        if file_len <= EFUSE_HEADER_LEN as u32 || file_len > EFUSE_CFG_MAX_LEN {
            warn!("File length error: {file_len:#x}");
            return Err(Error::InvalidParam("efuse config length".into()));
        }

        info!("Ready for efuse config");
        self.send_ack(ACK_SUCCESS)?;

        let blob = self.receive_blob(file_len)?;
        burn(&mut self.platform, &blob)
    }

    /// Read-efuse handler. Payload layout: `[item_index: u16]` at offset 0.
    pub(crate) fn handle_read_efuse(&mut self, frame: &Frame) -> Result<()> {
        let index = frame.payload_u16(0)?;
        if index >= self.platform.efuse_item_count() {
            return Err(Error::InvalidParam(format!("efuse item {index} out of range")));
        }
        let mut data = [0u8; EFUSE_READ_MAX_BYTES];
        self.platform.efuse_read_item(index, &mut data)?;
        info!("efuse item {index}: {data:02x?}");
        Ok(())
    }

    /// Stage the configuration blob in RAM via YMODEM.
    fn receive_blob(&mut self, file_len: u32) -> Result<Vec<u8>> {
        let config = self.ymodem_config(EFUSE_HEADER_LEN as u32 + 1, EFUSE_CFG_MAX_LEN);
        let platform = &mut self.platform;
        let mut session = YmodemReceiver::new(&mut self.chan, config);
        let result = stage_blob(&mut session, platform, file_len);
        session.close();
        result
    }
}

fn stage_blob<C: Channel, P: Platform>(
    session: &mut YmodemReceiver<'_, C>,
    platform: &mut P,
    expected_len: u32,
) -> Result<Vec<u8>> {
    session.open(&mut || platform.kick_watchdog())?;
    if session.file_length() != expected_len {
        return Err(Error::InvalidParam(
            "efuse blob length does not match the command".into(),
        ));
    }

    let mut blob = vec![0u8; expected_len as usize];
    let mut filled = 0usize;
    while filled < blob.len() {
        let n = session.read(&mut blob[filled..], &mut || platform.kick_watchdog())?;
        if n == 0 {
            return Err(Error::Ymodem("efuse transfer ended short".into()));
        }
        filled += n;
        platform.kick_watchdog();
    }

    // drain the end-of-transfer handshake
    let mut scratch = [0u8; 128];
    let _ = session.read(&mut scratch, &mut || platform.kick_watchdog());
    Ok(blob)
}

/// Verify the blob and program every item, tolerating per-item failures.
fn burn<P: Platform>(platform: &mut P, blob: &[u8]) -> Result<()> {
    let header = verify(blob, platform.efuse_item_count())?;

    let mut offset = usize::from(header.stru_size);
    for index in 0..header.item_count {
        let item = parse_item(blob, offset)?;
        if let Err(e) = write_item(platform, &item) {
            // OTP writes cannot be rolled back; one glitched bit must not
            // abandon the remaining items.
            warn!(
                "efuse write error, index {index} (start bit {}, width {}): {e}",
                item.start_bit, item.bit_width
            );
        }
        offset = item.next_offset;
    }
    info!("efuse burn finished: {} item(s)", header.item_count);
    Ok(())
}

/// Check the embedded digest and the item count bound.
fn verify(blob: &[u8], max_items: u16) -> Result<EfuseHeader> {
    if blob.len() < EFUSE_HEADER_LEN {
        return Err(Error::Efuse("blob shorter than its header".into()));
    }
    let digest = Sha256::digest(&blob[SHA256_LEN..]);
    if digest.as_slice() != &blob[..SHA256_LEN] {
        return Err(Error::Efuse("configuration hash mismatch".into()));
    }

    let header = EfuseHeader {
        stru_size: blob[33],
        item_count: LittleEndian::read_u16(&blob[34..36]),
    };
    if usize::from(header.stru_size) < EFUSE_HEADER_LEN {
        return Err(Error::Efuse("bad header structure size".into()));
    }
    if header.item_count > max_items {
        return Err(Error::Efuse("item count exceeds efuse capacity".into()));
    }
    Ok(header)
}

fn parse_item(blob: &[u8], offset: usize) -> Result<EfuseItem<'_>> {
    let fixed = blob
        .get(offset..offset + EFUSE_ITEM_FIXED_LEN)
        .ok_or_else(|| Error::Efuse("item header out of bounds".into()))?;
    let stru_size = usize::from(fixed[1]).max(EFUSE_ITEM_FIXED_LEN);
    let start_bit = LittleEndian::read_u16(&fixed[2..4]);
    let bit_width = LittleEndian::read_u16(&fixed[4..6]);
    let value_len = usize::from(LittleEndian::read_u16(&fixed[6..8]));

    let value = blob
        .get(offset + EFUSE_ITEM_FIXED_LEN..offset + EFUSE_ITEM_FIXED_LEN + value_len)
        .ok_or_else(|| Error::Efuse("item value out of bounds".into()))?;
    if usize::from(bit_width) > value_len * 8 {
        return Err(Error::Efuse("item width exceeds its value".into()));
    }
    if start_bit.checked_add(bit_width).is_none() {
        return Err(Error::Efuse("item bit range overflows".into()));
    }

    Ok(EfuseItem {
        start_bit,
        bit_width,
        value,
        next_offset: offset + stru_size + value_len,
    })
}

/// Program every set bit of one item.
fn write_item<P: Platform>(platform: &mut P, item: &EfuseItem<'_>) -> Result<()> {
    for j in 0..item.bit_width {
        let byte = usize::from(j >> 3);
        let mask = 1u8 << (j & 0x7);
        if item.value[byte] & mask != 0 {
            let bit = item.start_bit + j;
            platform.efuse_write_bit(bit >> 3, bit & 0x7)?;
        }
    }
    Ok(())
}
