//! Boot loader command loop.
//!
//! The loader sits in a loop receiving command frames, dispatching them to
//! handlers and acknowledging the outcome. Failures are never fatal to the
//! loop itself: a bad frame or a failed command produces a failure ACK and
//! the loader keeps listening. The only exits are a reset command (which
//! hands control to the platform reset) and a dead channel.
//!
//! Command dispatch is an exhaustive match on [`CommandType`]; an opcode
//! with no handler (unknown, or compiled out) is reported as a command
//! failure.

mod transfer;

#[cfg(feature = "efuse")]
mod efuse;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::platform::{Platform, UartConfig};
use crate::protocol::frame::{
    ACK_FAILURE, ACK_SUCCESS, CommandType, FRAME_MIN_LEN, Frame, FrameCodec,
};
use crate::protocol::ymodem::YmodemConfig;
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;

pub use transfer::FLASH_CHIP_ERASE_SIZE;

/// Delay between a reset/baud-switch acknowledgement and the action, so the
/// last bytes drain out of the UART first.
const ACK_DRAIN_DELAY: Duration = Duration::from_millis(5);

/// Total length of a set-baud-rate frame on the wire.
const BAUD_FRAME_LEN: usize = 18;

/// Loader tuning knobs.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Command frame codec timeouts.
    pub frame: FrameCodec,
    /// Per-byte timeout inside YMODEM sessions.
    pub ymodem_byte_timeout: Duration,
    /// YMODEM retry ceiling (receive retries / transmit NAK budget).
    pub ymodem_retries: u32,
    /// File name announced in upload sessions.
    pub upload_file_name: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            frame: FrameCodec::default(),
            ymodem_byte_timeout: Duration::from_millis(1000),
            ymodem_retries: 20,
            upload_file_name: "upload.bin".into(),
        }
    }
}

/// What the loop should do after a successful command.
pub(crate) enum Flow {
    /// Keep listening for the next frame.
    Continue,
    /// The reset handler fired; leave the loop.
    Reset,
}

/// The boot loader: command loop plus per-session state.
pub struct Loader<C: Channel, P: Platform> {
    pub(crate) chan: C,
    pub(crate) platform: P,
    pub(crate) config: LoaderConfig,
    /// Set once a full-chip erase has run in this session, so repeated
    /// chip-erase downloads do not wipe the device twice.
    pub(crate) chip_erased: bool,
}

impl<C: Channel, P: Platform> Loader<C, P> {
    /// Create a loader over `chan` driving `platform`.
    pub fn new(chan: C, platform: P) -> Self {
        Self::with_config(chan, platform, LoaderConfig::default())
    }

    /// Create a loader with custom tuning.
    pub fn with_config(chan: C, platform: P, config: LoaderConfig) -> Self {
        Self {
            chan,
            platform,
            config,
            chip_erased: false,
        }
    }

    /// Borrow the underlying channel.
    pub fn channel(&self) -> &C {
        &self.chan
    }

    /// Borrow the platform.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Consume the loader and return its channel and platform.
    pub fn into_parts(self) -> (C, P) {
        (self.chan, self.platform)
    }

    /// Run the command loop.
    ///
    /// Returns `Ok(())` after a reset command (on real hardware the
    /// platform reset does not return at all) and `Err` only when the
    /// channel itself dies.
    pub fn run(&mut self) -> Result<()> {
        info!("command loop ready");
        loop {
            let frame = match self.receive_frame() {
                Ok(frame) => frame,
                Err(Error::Idle) => continue,
                Err(Error::Io(e)) => return Err(Error::Io(e)),
                Err(e) => {
                    debug!("frame receive failed: {e}");
                    self.send_ack(ACK_FAILURE)?;
                    continue;
                },
            };

            match self.dispatch(&frame) {
                Ok(Flow::Reset) => return Ok(()),
                Ok(Flow::Continue) => {
                    self.platform.kick_watchdog();
                    self.send_ack(ACK_SUCCESS)?;
                    info!("command {:#04x} successful", frame.command());
                },
                Err(e) => {
                    warn!("command {:#04x} failed: {e}", frame.command());
                    self.send_ack(ACK_FAILURE)?;
                },
            }
        }
    }

    fn receive_frame(&mut self) -> Result<Frame> {
        self.config
            .frame
            .receive(&mut self.chan, &mut || self.platform.kick_watchdog())
    }

    pub(crate) fn send_ack(&mut self, code: u8) -> Result<()> {
        self.config.frame.send_ack(&mut self.chan, code)
    }

    pub(crate) fn ymodem_config(&self, min_size: u32, max_size: u32) -> YmodemConfig {
        YmodemConfig {
            byte_timeout: self.config.ymodem_byte_timeout,
            max_retries: self.config.ymodem_retries,
            min_size,
            max_size,
        }
    }

    /// Map an opcode to its handler and run it.
    fn dispatch(&mut self, frame: &Frame) -> Result<Flow> {
        let Some(cmd) = frame.command_type() else {
            return Err(Error::UnsupportedCommand(frame.command()));
        };
        match cmd {
            CommandType::DownloadImage | CommandType::FactoryImage => {
                self.handle_download(frame).map(|()| Flow::Continue)
            },
            CommandType::Reset => self.handle_reset(),
            CommandType::ReadVersion => self.handle_read_version().map(|()| Flow::Continue),
            CommandType::SetBaudRate => {
                self.handle_set_baud_rate(frame).map(|()| Flow::Continue)
            },

            #[cfg(feature = "upload")]
            CommandType::UploadData => self.handle_upload(frame).map(|()| Flow::Continue),
            #[cfg(not(feature = "upload"))]
            CommandType::UploadData => Err(Error::UnsupportedCommand(frame.command())),

            #[cfg(feature = "efuse")]
            CommandType::BurnEfuse => self.handle_burn_efuse(frame).map(|()| Flow::Continue),
            #[cfg(feature = "efuse")]
            CommandType::ReadEfuse => self.handle_read_efuse(frame).map(|()| Flow::Continue),
            #[cfg(not(feature = "efuse"))]
            CommandType::BurnEfuse | CommandType::ReadEfuse => {
                Err(Error::UnsupportedCommand(frame.command()))
            },

            // ACK is a device-to-host frame type, never a command.
            CommandType::Ack => Err(Error::UnsupportedCommand(frame.command())),
        }
    }

    /// ACK first so the host sees the outcome, then pull the plug.
    fn handle_reset(&mut self) -> Result<Flow> {
        info!("Reset device...");
        self.send_ack(ACK_SUCCESS)?;
        thread::sleep(ACK_DRAIN_DELAY);
        self.platform.reset();
        Ok(Flow::Reset)
    }

    /// Emit the version bytes raw on the channel, console style.
    fn handle_read_version(&mut self) -> Result<()> {
        let version = self.platform.firmware_version();
        self.chan.write_all_bytes(version)?;
        Ok(())
    }

    /// Acknowledge at the old rate, let the ACK drain, then switch. The
    /// main loop sends the usual success ACK afterwards at the new rate.
    fn handle_set_baud_rate(&mut self, frame: &Frame) -> Result<()> {
        if frame.payload().len() + FRAME_MIN_LEN != BAUD_FRAME_LEN {
            return Err(Error::InvalidParam("malformed baud rate frame".into()));
        }
        let uart = UartConfig::parse(frame.payload())?;
        debug!("switching baud rate to {}", uart.baud_rate);
        self.send_ack(ACK_SUCCESS)?;
        thread::sleep(ACK_DRAIN_DELAY);
        self.platform.set_baud_rate(&uart)
    }
}
