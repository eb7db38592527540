//! Byte channel abstraction for the boot protocol.
//!
//! The protocol stack only ever needs three things from the transport:
//! blocking single-byte reads with a caller-chosen timeout, buffered writes,
//! and a way to throw away stale input. Everything else (baud rate, pins,
//! enumeration) belongs to the platform.
//!
//! A real UART is plugged in through the [`Channel`] trait; on host
//! platforms the `native` feature provides an implementation on top of the
//! `serialport` crate, and tests use an in-memory double.

use crate::error::{Error, Result};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Timeout used when draining stale input.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Byte-oriented serial channel used by the boot protocol.
pub trait Channel: Read + Write {
    /// Set the timeout applied to subsequent reads.
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Read a single byte, waiting at most `timeout`.
    ///
    /// An expired timeout surfaces as [`Error::Timeout`]; every other I/O
    /// failure is passed through as [`Error::Io`].
    fn read_byte(&mut self, timeout: Duration) -> Result<u8>
    where
        Self: Sized,
    {
        self.set_read_timeout(timeout)?;
        let mut buf = [0u8; 1];
        match self.read(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(_) => Err(Error::Timeout("read_byte: no data".into())),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Err(Error::Timeout("read_byte: timeout".into()))
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write all bytes and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()>
    where
        Self: Sized,
    {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Discard whatever input is pending on the line.
    fn drain(&mut self)
    where
        Self: Sized,
    {
        while self.read_byte(DRAIN_TIMEOUT).is_ok() {}
    }
}

/// Native serial port support via the `serialport` crate.
#[cfg(feature = "native")]
pub mod native {
    use super::Channel;
    use crate::error::Result;
    use std::time::Duration;

    /// Default read timeout for freshly opened ports.
    const OPEN_TIMEOUT: Duration = Duration::from_millis(1000);

    impl Channel for Box<dyn serialport::SerialPort> {
        fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
            serialport::SerialPort::set_timeout(self.as_mut(), timeout)?;
            Ok(())
        }
    }

    /// Open a native serial port as a boot protocol channel.
    ///
    /// # Arguments
    ///
    /// * `port_name` - Serial port name (e.g., "/dev/ttyUSB0" or "COM3")
    /// * `baud_rate` - Initial baud rate
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Box<dyn serialport::SerialPort>> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(OPEN_TIMEOUT)
            .open()?;
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    #[test]
    fn test_read_byte_returns_fed_data() {
        let mut chan = MockChannel::new(&[0xAB, 0xCD]);
        assert_eq!(chan.read_byte(Duration::from_millis(10)).unwrap(), 0xAB);
        assert_eq!(chan.read_byte(Duration::from_millis(10)).unwrap(), 0xCD);
    }

    #[test]
    fn test_read_byte_timeout_on_empty() {
        let mut chan = MockChannel::new(&[]);
        let err = chan.read_byte(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
    }

    #[test]
    fn test_drain_discards_pending_input() {
        let mut chan = MockChannel::new(&[1, 2, 3, 4]);
        chan.drain();
        let err = chan.read_byte(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_write_all_bytes() {
        let mut chan = MockChannel::new(&[]);
        chan.write_all_bytes(&[0x11, 0x22]).unwrap();
        assert_eq!(chan.written(), &[0x11, 0x22]);
    }
}
