//! CCID message codec.
//!
//! Builds and parses the 10-byte header shared by every bulk message, per
//! USB-IF CCID specification v1.1. The layout is exact: opcode, 32-bit
//! little-endian payload length, slot, sequence byte, then three
//! opcode-specific bytes.

use thiserror::Error;

pub const HEADER_SIZE: usize = 10;

/// Maximum ATR length, including TS and TCK.
pub const MAX_ATR_SIZE: usize = 33;

/// Command buffer size: APDU header + Lc + 64 kB data + Le, for extended
/// APDU capable readers.
pub const CMD_BUF_SIZE: usize = 4 + 3 + 64 * 1024 + 3;

/// CCID message types, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    // PC to RDR (host to reader)
    PcToRdrIccPowerOn = 0x62,
    PcToRdrIccPowerOff = 0x63,
    PcToRdrGetSlotStatus = 0x65,
    PcToRdrXfrBlock = 0x6F,
    PcToRdrGetParameters = 0x6C,
    PcToRdrResetParameters = 0x6D,
    PcToRdrSetParameters = 0x61,
    PcToRdrEscape = 0x6B,
    PcToRdrSecure = 0x69,

    // RDR to PC (reader to host)
    RdrToPcDataBlock = 0x80,
    RdrToPcSlotStatus = 0x81,
    RdrToPcParameters = 0x82,
    RdrToPcEscape = 0x83,
}

/// Interrupt-IN notification opcode, followed by the slot state bitfield.
pub const RDR_TO_PC_NOTIFY_SLOT_CHANGE: u8 = 0x50;

/// bStatus: ICC status in the two low bits.
pub const ICC_STATUS_MASK: u8 = 0x03;
pub const ICC_PRESENT_ACTIVE: u8 = 0x00;
pub const ICC_PRESENT_INACTIVE: u8 = 0x01;
pub const ICC_ABSENT: u8 = 0x02;

/// bStatus: command status in the two high bits.
pub const COMMAND_FAILED: u8 = 0x40;
pub const TIME_EXTENSION: u8 = 0x80;

/// Voltage selection for IccPowerOn (bPowerSelect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Voltage {
    Automatic = 0x00,
    Volts5 = 0x01,
    Volts3 = 0x02,
    Volts1_8 = 0x03,
}

impl Voltage {
    /// Next voltage to try when a power-up is refused: the ladder walks
    /// 1.8V to 3V to 5V and stops there.
    pub fn step_down(self) -> Option<Voltage> {
        match self {
            Voltage::Volts1_8 => Some(Voltage::Volts3),
            Voltage::Volts3 => Some(Voltage::Volts5),
            Voltage::Volts5 | Voltage::Automatic => None,
        }
    }
}

/// Canonical error kinds mapped from the CCID `bError` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    CommandNotSupported,
    PinCancelled,
    PinTimeout,
    /// Parity error during the exchange. The only kind with its own
    /// recovery path: it feeds the T=1 retransmission rules.
    Parity,
    CardAbsent,
    HardwareError,
    /// The reader points at an offending byte of the command.
    BadParameterOffset(u8),
    Unknown(u8),
}

impl SlotError {
    pub fn from_byte(b: u8) -> SlotError {
        match b {
            0x00 => SlotError::CommandNotSupported,
            0xEF => SlotError::PinCancelled,
            0xF0 => SlotError::PinTimeout,
            0xFD => SlotError::Parity,
            0xFE => SlotError::CardAbsent,
            0xFB => SlotError::HardwareError,
            1..=127 => SlotError::BadParameterOffset(b),
            other => SlotError::Unknown(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("response shorter than the CCID header: {0} bytes")]
    TooShort(usize),

    #[error("declared length {declared} does not match received payload {received}")]
    LengthMismatch { declared: usize, received: usize },
}

/// Build a complete bulk-OUT message.
pub fn build_command(
    opcode: MessageType,
    slot: u8,
    seq: u8,
    params: [u8; 3],
    payload: &[u8],
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.push(opcode as u8);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.push(slot);
    bytes.push(seq);
    bytes.extend_from_slice(&params);
    bytes.extend_from_slice(payload);
    bytes
}

/// A parsed bulk-IN message.
#[derive(Debug, Clone)]
pub struct Response {
    pub opcode: u8,
    pub slot: u8,
    pub seq: u8,
    /// bStatus: ICC status plus command status bits.
    pub status: u8,
    /// bError, meaningful when the command-failed bit is set.
    pub error: u8,
    /// bChainParameter for DataBlock, bClockStatus for SlotStatus.
    pub chain_parameter: u8,
    pub payload: Vec<u8>,
}

impl Response {
    /// Parse a bulk-IN byte stream.
    ///
    /// The declared length must equal the received length minus the header;
    /// a mismatch is a fatal communication error for the exchange.
    pub fn parse(bytes: &[u8]) -> Result<Response, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::TooShort(bytes.len()));
        }

        let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        let received = bytes.len() - HEADER_SIZE;
        if declared != received {
            return Err(CodecError::LengthMismatch { declared, received });
        }

        Ok(Response {
            opcode: bytes[0],
            slot: bytes[5],
            seq: bytes[6],
            status: bytes[7],
            error: bytes[8],
            chain_parameter: bytes[9],
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }

    pub fn command_failed(&self) -> bool {
        self.status & COMMAND_FAILED != 0
    }

    /// Reader asks for more time; not an error, re-issue the read.
    pub fn time_extension(&self) -> bool {
        self.status & TIME_EXTENSION != 0
    }

    pub fn icc_status(&self) -> u8 {
        self.status & ICC_STATUS_MASK
    }

    pub fn slot_error(&self) -> SlotError {
        SlotError::from_byte(self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_layout() {
        let cmd = build_command(
            MessageType::PcToRdrXfrBlock,
            1,
            0x42,
            [0, 0x34, 0x12],
            &[0xAA, 0xBB],
        );
        assert_eq!(
            cmd,
            vec![0x6F, 0x02, 0x00, 0x00, 0x00, 0x01, 0x42, 0x00, 0x34, 0x12, 0xAA, 0xBB]
        );
    }

    #[test]
    fn zero_length_command_is_header_only() {
        let cmd = build_command(MessageType::PcToRdrIccPowerOff, 0, 7, [0; 3], &[]);
        assert_eq!(cmd.len(), HEADER_SIZE);
        assert_eq!(cmd[0], 0x63);
        assert_eq!(cmd[6], 7);
    }

    #[test]
    fn response_roundtrip() {
        let raw = [0x80, 3, 0, 0, 0, 0, 0x13, 0x00, 0x00, 0x00, 0x90, 0x00, 0x61];
        let rsp = Response::parse(&raw).unwrap();
        assert_eq!(rsp.opcode, 0x80);
        assert_eq!(rsp.seq, 0x13);
        assert!(!rsp.command_failed());
        assert_eq!(rsp.payload, vec![0x90, 0x00, 0x61]);
    }

    #[test]
    fn declared_length_must_match() {
        let raw = [0x80, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0x90, 0x00];
        assert!(matches!(
            Response::parse(&raw),
            Err(CodecError::LengthMismatch {
                declared: 5,
                received: 2
            })
        ));
    }

    #[test]
    fn short_response_rejected() {
        assert!(matches!(
            Response::parse(&[0x80, 0, 0]),
            Err(CodecError::TooShort(3))
        ));
    }

    #[test]
    fn error_byte_classification() {
        assert_eq!(SlotError::from_byte(0xFE), SlotError::CardAbsent);
        assert_eq!(SlotError::from_byte(0xFD), SlotError::Parity);
        assert_eq!(SlotError::from_byte(0xEF), SlotError::PinCancelled);
        assert_eq!(SlotError::from_byte(0xF0), SlotError::PinTimeout);
        assert_eq!(SlotError::from_byte(0x00), SlotError::CommandNotSupported);
        assert_eq!(SlotError::from_byte(7), SlotError::BadParameterOffset(7));
        assert_eq!(SlotError::from_byte(0xC0), SlotError::Unknown(0xC0));
    }

    #[test]
    fn status_bits() {
        let mut rsp = Response::parse(&[0x80, 0, 0, 0, 0, 0, 0, 0x42, 0xFE, 0]).unwrap();
        assert!(rsp.command_failed());
        assert_eq!(rsp.icc_status(), ICC_ABSENT);
        rsp.status = 0x80;
        assert!(rsp.time_extension());
    }
}
