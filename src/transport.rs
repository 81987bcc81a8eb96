use std::time::Duration;

use thiserror::Error;

/// Errors reported by a transport port.
///
/// `Timeout` leaves the port state untouched: the caller may retry the read.
/// `Nak` only occurs on the serial back-end.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("port I/O error: {0}")]
    Io(String),

    #[error("read timed out")]
    Timeout,

    #[error("device disappeared")]
    NoSuchDevice,

    #[error("reader sent NAK")]
    Nak,

    #[error("operation not supported by this transport")]
    Unsupported,
}

/// An abstract bulk channel to a CCID reader.
///
/// One implementation per back-end: [`crate::usb_port::UsbPort`] maps calls
/// onto bulk transfers, [`crate::serial_port::SerialCcidPort`] adds the
/// SYNC/ACK/NAK/LRC framing on top of a tty. A scripted implementation is
/// used by the protocol tests.
pub trait CcidPort: Send {
    /// Send one complete CCID command (header + payload).
    fn write(&mut self, bytes: &[u8]) -> Result<(), PortError>;

    /// Receive one complete CCID response, waiting at most `timeout`.
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, PortError>;

    /// Control transfer, used by the ICCD variants and the data-rate query.
    ///
    /// Direction comes from bit 7 of `request_type`: device-to-host fills
    /// `data` and returns the transferred length, host-to-device sends the
    /// `data` contents.
    fn control(
        &mut self,
        _request_type: u8,
        _request: u8,
        _value: u16,
        _data: &mut [u8],
    ) -> Result<usize, PortError> {
        Err(PortError::Unsupported)
    }

    /// Read the interrupt endpoint (card movement notifications).
    fn interrupt_read(&mut self, _timeout: Duration) -> Result<Vec<u8>, PortError> {
        Err(PortError::Unsupported)
    }

    /// Suffix writes that fill a packet boundary with a zero length packet;
    /// enabled by quirks on the firmwares that need it. Meaningless on
    /// non-USB transports.
    fn set_zero_length_packet(&mut self, _enabled: bool) {}

    /// Reset the underlying device so the next open starts from sequence
    /// zero; driven by the reset-on-close driver option. Best effort.
    fn reset(&mut self) {}

    /// Human-readable port identity for logs.
    fn name(&self) -> &str;
}
