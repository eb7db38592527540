//! Flash transfer orchestration.
//!
//! Download commands choose an erase policy (full chip, region, or none),
//! acknowledge readiness, then stream the YMODEM payload straight into
//! flash in fixed chunks. Upload commands run the transmit engine with the
//! flash as its byte source.
//!
//! A full-chip erase is remembered for the rest of the command-loop
//! session: a host that erases everything and then downloads several
//! images must not wipe the device again in between.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::protocol::frame::{ACK_SUCCESS, CommandType, Frame};
use crate::protocol::ymodem::YmodemReceiver;
use log::{info, warn};

#[cfg(feature = "upload")]
use crate::protocol::ymodem::YmodemSender;

use super::Loader;

/// Erase-size sentinel meaning "erase the entire device".
pub const FLASH_CHIP_ERASE_SIZE: u32 = 0xFFFF_FFFF;

/// Bytes pulled from the YMODEM engine per flash write.
const DOWNLOAD_CHUNK: usize = 1024;

impl<C: Channel, P: Platform> Loader<C, P> {
    /// Download-image / factory-image handler.
    ///
    /// Payload layout: `[download_addr: u32][file_len: u32][erase_size: u32]
    /// [burn_efuse: u8]` at offsets 0/4/8/12, little-endian.
    pub(crate) fn handle_download(&mut self, frame: &Frame) -> Result<()> {
        let download_addr = frame.payload_u32(0)?;
        let file_len = frame.payload_u32(4)?;
        let erase_size = frame.payload_u32(8)?;
        let _burn_efuse = frame.payload_u8(12)?;
        let flash_size = self.platform.flash_capacity();
        let factory = frame.command_type() == Some(CommandType::FactoryImage);

        if !factory && erase_size == FLASH_CHIP_ERASE_SIZE {
            self.erase_all()?;
            if file_len == 0 {
                // erase-only request, no image follows
                return Ok(());
            }
        }

        if file_len == 0 || (erase_size != 0 && erase_size < file_len) || file_len > flash_size {
            warn!(
                "Invalid params: addr={download_addr:#010x} file_len={file_len:#x} \
                 erase_size={erase_size:#x}"
            );
            return Err(Error::InvalidParam("download length/erase bounds".into()));
        }

        if factory {
            info!("factory image -> {download_addr:#010x}");
        }
        self.download_to_flash(download_addr, erase_size, flash_size)
    }

    /// Erase the whole device once per session.
    fn erase_all(&mut self) -> Result<()> {
        if self.chip_erased {
            return Ok(());
        }
        self.platform.kick_watchdog();
        self.platform.flash_erase(0, FLASH_CHIP_ERASE_SIZE)?;
        self.chip_erased = true;
        Ok(())
    }

    /// Apply the erase policy, signal readiness, stream the image in.
    fn download_to_flash(
        &mut self,
        flash_offset: u32,
        erase_size: u32,
        flash_size: u32,
    ) -> Result<()> {
        let mut erased_bound = erase_size;
        self.platform.kick_watchdog();
        if erase_size == FLASH_CHIP_ERASE_SIZE {
            self.erase_all()?;
        } else if erase_size != 0 {
            self.platform.flash_erase(flash_offset, erase_size)?;
        } else {
            // 0 means the host guarantees the region is already blank;
            // only bound the write by the device size.
            erased_bound = FLASH_CHIP_ERASE_SIZE;
        }
        self.platform.kick_watchdog();

        info!("Ready for download");
        self.send_ack(ACK_SUCCESS)?;

        let config = self.ymodem_config(1, flash_size);
        let platform = &mut self.platform;
        let mut session = YmodemReceiver::new(&mut self.chan, config);
        let result = stream_to_flash(&mut session, platform, flash_offset, erased_bound);
        session.close();
        result
    }

    /// Upload-data handler.
    ///
    /// Payload layout: `[file_len: u32][upload_addr: u32]` at offsets 0/4.
    /// The address must be 4-byte aligned and the whole range must fit in
    /// flash.
    #[cfg(feature = "upload")]
    pub(crate) fn handle_upload(&mut self, frame: &Frame) -> Result<()> {
        let file_len = frame.payload_u32(0)?;
        let upload_addr = frame.payload_u32(4)?;
        let flash_size = self.platform.flash_capacity();

        if file_len == 0 || file_len > flash_size {
            return Err(Error::InvalidParam("upload length".into()));
        }
        if upload_addr % 4 != 0 {
            return Err(Error::InvalidParam("upload address not 4-byte aligned".into()));
        }
        match upload_addr.checked_add(file_len) {
            Some(end) if end <= flash_size => {},
            _ => {
                return Err(Error::InvalidParam(
                    "upload range exceeds flash capacity".into(),
                ));
            },
        }

        info!("Ready for upload: {file_len:#x} bytes @ {upload_addr:#010x}");
        self.send_ack(ACK_SUCCESS)?;

        let config = self.ymodem_config(1, flash_size);
        let platform = &mut self.platform;
        let mut session = YmodemSender::new(
            &mut self.chan,
            config,
            &self.config.upload_file_name,
            file_len,
            |offset, buf| {
                platform.flash_read(upload_addr + offset, buf)?;
                platform.kick_watchdog();
                Ok(())
            },
        );
        session.send()
    }
}

/// Pull the YMODEM payload and write it to flash chunk by chunk.
fn stream_to_flash<C: Channel, P: Platform>(
    session: &mut YmodemReceiver<'_, C>,
    platform: &mut P,
    flash_offset: u32,
    erased_size: u32,
) -> Result<()> {
    session.open(&mut || platform.kick_watchdog())?;

    let file_length = session.file_length();
    if erased_size != 0 && erased_size < file_length {
        warn!("file length {file_length:#x} exceeds the erased region {erased_size:#x}");
        return Err(Error::InvalidParam("file length exceeds the erased region".into()));
    }

    let mut buf = [0u8; DOWNLOAD_CHUNK];
    let mut offset = flash_offset;
    let mut remaining = file_length;
    while remaining > 0 {
        let want = remaining.min(DOWNLOAD_CHUNK as u32) as usize;
        let n = session.read(&mut buf[..want], &mut || platform.kick_watchdog())?;
        if n == 0 {
            return Err(Error::Ymodem(
                "transfer ended short of the declared length".into(),
            ));
        }
        platform.flash_write(offset, &buf[..n])?;
        offset += n as u32;
        remaining -= n as u32;
        platform.kick_watchdog();
    }

    // drain the end-of-transfer handshake
    let _ = session.read(&mut buf, &mut || platform.kick_watchdog());
    info!("total size: {file_length:#x}");
    Ok(())
}
