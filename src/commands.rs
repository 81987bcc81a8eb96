//! CCID command layer: everything that turns a protocol intention into a
//! bulk (or ICCD control) exchange on one device.
//!
//! A [`Device`] owns the transport port, the reader descriptor and the
//! sequence counter shared by all slots of a multi-slot reader. The
//! per-channel [`Slot`] carries the cached ATR, power flags and T=1 state.

use std::time::Duration;

use thiserror::Error;

use crate::atr::Atr;
use crate::ccid::{self, build_command, CodecError, MessageType, Response, SlotError, Voltage};
use crate::descriptor::{FramingClass, ReaderDescriptor, FEATURE_AUTO_VOLTAGE};
use crate::t1::{LinkError, T1Link, T1State};
use crate::transport::{CcidPort, PortError};

/// USB write timeout, fixed; reads are timed by the descriptor.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Power flag bits, used to detect quick insertion/removal cycles the
/// resource manager did not observe.
pub const POWERFLAGS_RAZ: u8 = 0x00;
pub const MASK_POWERFLAGS_PUP: u8 = 0x01;
pub const MASK_POWERFLAGS_PDWN: u8 = 0x02;

#[derive(Debug, Error)]
pub enum CmdError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("reader reported {0:?}")]
    Slot(SlotError),

    #[error("command not supported by this reader")]
    NotSupported,

    #[error("command larger than the reader accepts")]
    TooLong,

    #[error("too many duplicate frames")]
    TooManyDuplicates,

    #[error("T=1 transport failed")]
    T1(#[from] crate::t1::T1Error),

    #[error("APDU case not supported")]
    UnsupportedCase,

    #[error("empty response from the card")]
    ResponseTimeout,

    #[error("received length does not match the expectation")]
    LengthInconsistent,
}

/// Runtime state of one channel (one slot of a device).
#[derive(Debug)]
pub struct Slot {
    pub index: u8,
    /// Cached ATR from the last successful power-up.
    pub atr: Vec<u8>,
    pub power_flags: u8,
    pub t1: T1State,
    /// Friendly name for logging.
    pub name: String,
}

impl Slot {
    pub fn new(index: u8, name: String) -> Slot {
        Slot {
            index,
            atr: Vec::new(),
            power_flags: POWERFLAGS_RAZ,
            t1: T1State::new(),
            name,
        }
    }

    pub fn parsed_atr(&self) -> Option<Atr> {
        if self.atr.is_empty() {
            None
        } else {
            Atr::parse(&self.atr).ok()
        }
    }
}

/// One physical interface device. Multi-slot readers share a single
/// `Device` (and therefore a single port and sequence counter) across
/// channels; the driver keeps it behind a mutex.
pub struct Device {
    pub port: Box<dyn CcidPort>,
    pub desc: ReaderDescriptor,
    seq: u8,
    /// Sequence byte of the command in flight, for duplicate detection.
    last_seq: u8,
    pub slots: Vec<Slot>,
}

impl Device {
    pub fn new(port: Box<dyn CcidPort>, desc: ReaderDescriptor) -> Device {
        Device {
            port,
            desc,
            seq: 0,
            last_seq: 0,
            slots: Vec::new(),
        }
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.last_seq = seq;
        seq
    }

    /// Build and send one bulk-OUT command.
    pub(crate) fn send_command(
        &mut self,
        opcode: MessageType,
        slot: u8,
        params: [u8; 3],
        payload: &[u8],
    ) -> Result<(), CmdError> {
        let seq = self.next_seq();
        let bytes = build_command(opcode, slot, seq, params, payload);
        log::debug!(
            "{}: sending {:?}, len={}, seq={}",
            self.port.name(),
            opcode,
            bytes.len(),
            seq
        );
        log::trace!("-> {bytes:02X?}");
        self.port.write(&bytes)?;
        Ok(())
    }

    /// Read one bulk-IN response.
    ///
    /// Re-reads silently on a time-extension status and on duplicate frames
    /// (echoed sequence byte lower than the one in flight); ten duplicates
    /// declare the port broken.
    pub(crate) fn read_response(&mut self) -> Result<Response, CmdError> {
        let mut duplicates = 0;
        loop {
            let raw = self
                .port
                .read(ccid::HEADER_SIZE + ccid::CMD_BUF_SIZE, self.desc.read_timeout)?;
            log::trace!("<- {:02X?}", &raw[..raw.len().min(64)]);

            let response = Response::parse(&raw)?;

            if response.seq < self.last_seq {
                duplicates += 1;
                if duplicates > 10 {
                    log::error!("too many duplicate frames detected");
                    return Err(CmdError::TooManyDuplicates);
                }
                log::info!("duplicate frame detected");
                continue;
            }

            if response.time_extension() {
                log::debug!("time extension requested: 0x{:02X}", response.error);
                continue;
            }

            log::debug!(
                "{}: response opcode=0x{:02X} status=0x{:02X} error=0x{:02X}",
                self.port.name(),
                response.opcode,
                response.status,
                response.error
            );
            return Ok(response);
        }
    }

    /// Write a command and read its response; a NAK from the serial
    /// transport (echo state being resolved on the first command) is
    /// retried once with a fresh sequence number.
    fn exchange(
        &mut self,
        opcode: MessageType,
        slot: u8,
        params: [u8; 3],
        payload: &[u8],
    ) -> Result<Response, CmdError> {
        self.send_command(opcode, slot, params, payload)?;
        match self.read_response() {
            Err(CmdError::Port(PortError::Nak)) => {
                log::debug!("NAK received, replaying the command");
                self.send_command(opcode, slot, params, payload)?;
                self.read_response()
            }
            other => other,
        }
    }

    /// CCID_Transmit: send an XfrBlock carrying `data`.
    ///
    /// `expected` is the expected reply length, used by character level
    /// readers only. `bwi` extends the block waiting timeout.
    pub(crate) fn transmit_block(
        &mut self,
        slot: u8,
        data: &[u8],
        expected: u16,
        bwi: u8,
    ) -> Result<(), CmdError> {
        match self.desc.framing {
            FramingClass::IccdA => {
                let mut buf = data.to_vec();
                self.port.control(0x21, 0x65, 0, &mut buf)?;
                Ok(())
            }
            FramingClass::IccdB => {
                // The chain parameter rides in the high byte of wValue.
                let mut buf = data.to_vec();
                self.port.control(0x21, 0x65, expected << 8, &mut buf)?;
                Ok(())
            }
            FramingClass::Ccid => {
                if data.len() > ccid::CMD_BUF_SIZE {
                    log::error!("TX length too big: {}", data.len());
                    return Err(CmdError::TooLong);
                }
                let params = [bwi, (expected & 0xFF) as u8, (expected >> 8) as u8];
                self.send_command(MessageType::PcToRdrXfrBlock, slot, params, data)
            }
        }
    }

    /// CCID_Receive: collect one DataBlock response.
    ///
    /// Returns the payload and the chain parameter. A cancelled or timed
    /// out secure PIN operation is faked as the `64 01` / `64 00` status
    /// words, matching what callers expect from the card.
    pub(crate) fn receive_block(&mut self) -> Result<(Vec<u8>, u8), CmdError> {
        if self.desc.framing == FramingClass::IccdA {
            let mut buf = vec![0u8; 512];
            let n = self.port.control(0xA1, 0x6F, 0, &mut buf)?;
            buf.truncate(n);
            return Ok((buf, 0));
        }
        if self.desc.framing == FramingClass::IccdB {
            loop {
                let mut buf = vec![0u8; 512];
                let n = self.port.control(0xA1, 0x6F, 0, &mut buf)?;
                buf.truncate(n.max(1));
                match buf[0] {
                    0x00 => {
                        // Data created by the preceding request.
                        return Ok((buf[1..].to_vec(), 0));
                    }
                    0x40 => {
                        // Status information.
                        let error = buf.get(2).copied().unwrap_or(0);
                        return Err(CmdError::Slot(SlotError::from_byte(error)));
                    }
                    0x80 => {
                        // Polling: the card asks us to come back later.
                        let delay = u64::from(buf.get(2).copied().unwrap_or(0)) << 8
                            | u64::from(buf.get(1).copied().unwrap_or(0));
                        let delay = if delay == 0 { 1 } else { delay };
                        std::thread::sleep(Duration::from_millis(delay * 10));
                        continue;
                    }
                    chain @ (0x01 | 0x02 | 0x03 | 0x10) => {
                        return Ok((buf[1..].to_vec(), chain));
                    }
                    other => {
                        log::error!("unknown bResponseType: 0x{other:02X}");
                        return Err(CmdError::Slot(SlotError::Unknown(other)));
                    }
                }
            }
        }

        let response = self.read_response()?;

        if response.command_failed() {
            log::debug!("command failed, bError=0x{:02X}", response.error);
            return match response.slot_error() {
                SlotError::PinCancelled => Ok((vec![0x64, 0x01], response.chain_parameter)),
                SlotError::PinTimeout => Ok((vec![0x64, 0x00], response.chain_parameter)),
                err => Err(CmdError::Slot(err)),
            };
        }

        Ok((response.payload, response.chain_parameter))
    }

    /// IccPowerOn. Returns the raw ATR.
    ///
    /// When the reader lacks automatic voltage selection, an unsupported or
    /// refused voltage steps down through 1.8V, 3V, 5V to automatic.
    pub fn power_on(&mut self, slot: u8, requested: Voltage) -> Result<Vec<u8>, CmdError> {
        match self.desc.framing {
            FramingClass::IccdA => {
                self.power_off(slot)?;
                self.slot_status(slot)?;
                let mut buf = vec![0u8; ccid::MAX_ATR_SIZE];
                let n = self.port.control(0xA1, 0x62, 0, &mut buf)?;
                buf.truncate(n);
                return Ok(buf);
            }
            FramingClass::IccdB => {
                self.power_off(slot)?;
                self.port.control(0x21, 0x62, 1, &mut [])?;
                let (atr, _) = self.receive_block()?;
                return Ok(atr);
            }
            FramingClass::Ccid => {}
        }

        let mut voltage = if self.desc.has_feature(FEATURE_AUTO_VOLTAGE) {
            Voltage::Automatic
        } else {
            // Step past voltages the reader does not provide.
            use crate::descriptor::{VOLTAGE_SUPPORT_1_8V, VOLTAGE_SUPPORT_3V, VOLTAGE_SUPPORT_5V};
            let mut v = requested;
            if v == Voltage::Volts5 && self.desc.voltage_support & VOLTAGE_SUPPORT_5V == 0 {
                log::info!("5V requested but not supported by the reader");
                v = Voltage::Volts3;
            }
            if v == Voltage::Volts3 && self.desc.voltage_support & VOLTAGE_SUPPORT_3V == 0 {
                log::info!("3V requested but not supported by the reader");
                v = Voltage::Volts1_8;
            }
            if v == Voltage::Volts1_8 && self.desc.voltage_support & VOLTAGE_SUPPORT_1_8V == 0 {
                log::info!("1.8V requested but not supported by the reader");
                v = Voltage::Automatic;
            }
            v
        };

        let mut iso_mode_retry = true;
        loop {
            let response = self.exchange(
                MessageType::PcToRdrIccPowerOn,
                slot,
                [voltage as u8, 0, 0],
                &[],
            )?;

            if response.command_failed() {
                log::debug!("power up failed, bError=0x{:02X}", response.error);

                // Some Gemalto and Cherry readers power up in EMV mode and
                // answer 0xBB; switch them to ISO mode once and retry.
                if response.error == 0xBB
                    && iso_mode_retry
                    && matches!(self.desc.reader_id(), crate::quirks::GEMPC433 | crate::quirks::CHERRYXX33)
                {
                    iso_mode_retry = false;
                    let mut out = vec![0u8; 1];
                    self.escape(slot, &[0x1F, 0x01], &mut out, None)?;
                    continue;
                }

                if let Some(lower) = voltage.step_down() {
                    log::info!("power up at {voltage:?} failed, trying {lower:?}");
                    voltage = lower;
                    continue;
                }

                return Err(CmdError::Slot(response.slot_error()));
            }

            return Ok(response.payload);
        }
    }

    /// IccPowerOff.
    pub fn power_off(&mut self, slot: u8) -> Result<(), CmdError> {
        match self.desc.framing {
            FramingClass::IccdA => {
                self.port.control(0x21, 0x63, 0, &mut [])?;
                return Ok(());
            }
            FramingClass::IccdB => {
                self.port.control(0x21, 0x63, 0, &mut [])?;
                let mut buf = [0u8; 3];
                self.port.control(0xA1, 0x81, 0, &mut buf)?;
                return Ok(());
            }
            FramingClass::Ccid => {}
        }

        let response = self.exchange(MessageType::PcToRdrIccPowerOff, slot, [0; 3], &[])?;
        if response.command_failed() {
            return Err(CmdError::Slot(response.slot_error()));
        }
        Ok(())
    }

    /// GetSlotStatus. Returns the CCID bStatus byte (ICC status in the low
    /// bits); the ICCD variants synthesise one.
    pub fn slot_status(&mut self, slot: u8) -> Result<u8, CmdError> {
        match self.desc.framing {
            FramingClass::IccdA => {
                loop {
                    let mut status = [0u8; 1];
                    self.port.control(0xA1, 0xA0, 0, &mut status)?;
                    if status[0] & 0x40 != 0 {
                        // Busy, poll again.
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    return Ok(if status[0] == 0x80 {
                        ccid::ICC_ABSENT
                    } else {
                        ccid::ICC_PRESENT_ACTIVE
                    });
                }
            }
            FramingClass::IccdB => {
                let mut buf = [0u8; 3];
                self.port.control(0xA1, 0x81, 0, &mut buf)?;
                return Ok(match buf[1] & 0x03 {
                    0 => ccid::ICC_PRESENT_ACTIVE,
                    1 => ccid::ICC_PRESENT_INACTIVE,
                    _ => ccid::ICC_ABSENT,
                });
            }
            FramingClass::Ccid => {}
        }

        let response = self.exchange(MessageType::PcToRdrGetSlotStatus, slot, [0; 3], &[])?;
        // Card absent or mute is not a communication error here.
        if response.command_failed() && response.error != 0xFE {
            return Err(CmdError::Slot(response.slot_error()));
        }
        Ok(response.icc_status())
    }

    /// Raw ICCD-A status byte, polled until the interface leaves its busy
    /// state. The character-level exchange keys its phases off this value.
    pub(crate) fn slot_status_raw(&mut self, _slot: u8) -> Result<u8, CmdError> {
        loop {
            let mut status = [0u8; 1];
            self.port.control(0xA1, 0xA0, 0, &mut status)?;
            if status[0] & 0x40 != 0 {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            return Ok(status[0]);
        }
    }

    /// PC_to_RDR_Escape with a 30 second (or caller-chosen) timeout.
    pub fn escape(
        &mut self,
        slot: u8,
        tx: &[u8],
        rx: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<(), CmdError> {
        let old_timeout = self.desc.read_timeout;
        self.desc.read_timeout = timeout.unwrap_or(Duration::from_secs(30));

        let result = self.exchange(MessageType::PcToRdrEscape, slot, [0; 3], tx);
        self.desc.read_timeout = old_timeout;

        let response = result?;
        if response.command_failed() {
            return Err(CmdError::Slot(response.slot_error()));
        }
        *rx = response.payload;
        Ok(())
    }

    /// SetParameters with the CCID interpretation of partial failures: a
    /// byte-offset error means a parameter was not changeable and is not
    /// fatal.
    pub fn set_parameters(&mut self, slot: u8, protocol: u8, data: &[u8]) -> Result<(), CmdError> {
        log::debug!("SetParameters: protocol T={protocol}, {} bytes", data.len());
        let response =
            self.exchange(MessageType::PcToRdrSetParameters, slot, [protocol, 0, 0], data)?;
        if response.command_failed() {
            return match response.slot_error() {
                SlotError::CommandNotSupported => Err(CmdError::NotSupported),
                SlotError::BadParameterOffset(_) => Ok(()),
                err => Err(CmdError::Slot(err)),
            };
        }
        Ok(())
    }

    /// GetParameters: current protocol data structure as reported by the
    /// reader.
    pub fn get_parameters(&mut self, slot: u8) -> Result<Vec<u8>, CmdError> {
        let response = self.exchange(MessageType::PcToRdrGetParameters, slot, [0; 3], &[])?;
        if response.command_failed() {
            return Err(CmdError::Slot(response.slot_error()));
        }
        Ok(response.payload)
    }

    /// ResetParameters: return the slot to default protocol parameters.
    pub fn reset_parameters(&mut self, slot: u8) -> Result<Vec<u8>, CmdError> {
        let response = self.exchange(MessageType::PcToRdrResetParameters, slot, [0; 3], &[])?;
        if response.command_failed() {
            return Err(CmdError::Slot(response.slot_error()));
        }
        Ok(response.payload)
    }

    /// One-shot XfrBlock used for T=0 TPDU and short-APDU exchanges.
    pub fn xfr_block_tpdu(&mut self, slot: u8, tx: &[u8]) -> Result<Vec<u8>, CmdError> {
        log::debug!("T=0: {} bytes", tx.len());

        if tx.len() > self.desc.max_block_payload() {
            // The SCM firmware announces 263 instead of 270; a full-length
            // short APDU still goes through.
            if self.desc.max_message_length == 263 {
                log::info!(
                    "command of {} bytes over the bogus SCM limit, sending anyway",
                    tx.len()
                );
            } else {
                log::error!(
                    "command too long ({} bytes) for max {} bytes",
                    tx.len(),
                    self.desc.max_block_payload()
                );
                return Err(CmdError::TooLong);
            }
        }

        self.transmit_block(slot, tx, 0, 0)?;
        let (payload, _) = self.receive_block()?;
        Ok(payload)
    }

    /// Extended APDU exchange: chunk the command across XfrBlock commands
    /// with the level parameter, then gather the chained response.
    pub fn xfr_block_extended(&mut self, slot: u8, tx: &[u8]) -> Result<Vec<u8>, CmdError> {
        let chunk_limit = self.desc.max_block_payload().min(ccid::CMD_BUF_SIZE);
        log::debug!("extended APDU: {} bytes", tx.len());

        let mut sent = 0usize;
        let mut level: u16 = 0x00;
        let mut len = tx.len();
        if len > chunk_limit {
            len = chunk_limit;
            // The command APDU begins here and continues in the next block.
            level = 0x01;
        }

        loop {
            self.transmit_block(slot, &tx[sent..sent + len], level, 0)?;
            sent += len;

            // Last block (0x02) or the only block (0x00): the card answers.
            if level == 0x02 || level == 0x00 {
                break;
            }

            // Read a nul block before continuing the chain.
            let _ = self.receive_block()?;

            if tx.len() - sent > chunk_limit {
                level = 0x03;
                len = chunk_limit;
            } else {
                level = 0x02;
                len = tx.len() - sent;
            }
        }

        let mut rx = Vec::new();
        loop {
            let (chunk, chain) = self.receive_block()?;
            rx.extend_from_slice(&chunk);

            match chain {
                0x00 | 0x02 => break,
                0x01 | 0x03 | 0x10 => {
                    // Empty continuation probe: more response data follows.
                    self.transmit_block(slot, &[], 0x10, 0)?;
                }
                other => {
                    log::error!("unexpected chain parameter 0x{other:02X}");
                    return Err(CmdError::Slot(SlotError::Unknown(other)));
                }
            }
        }

        Ok(rx)
    }

    /// Borrow this device as a T=1 link for the given slot.
    pub fn t1_link(&mut self, slot: u8) -> DeviceLink<'_> {
        DeviceLink { device: self, slot }
    }
}

/// The T=1 engine's view of a device: one block out, one block in.
pub struct DeviceLink<'a> {
    device: &'a mut Device,
    slot: u8,
}

impl T1Link for DeviceLink<'_> {
    fn exchange(&mut self, block: &[u8], wtx: u8) -> Result<Vec<u8>, LinkError> {
        log::trace!("T=1 send: {block:02X?}");

        let old_timeout = self.device.desc.read_timeout;
        if wtx > 1 {
            // Temporary timeout granted by the card's WTX request.
            self.device.desc.read_timeout = old_timeout * u32::from(wtx);
            log::info!(
                "new timeout at WTX request: {:?}",
                self.device.desc.read_timeout
            );
        }

        let result = self.exchange_inner(block, wtx);

        self.device.desc.read_timeout = old_timeout;

        match &result {
            Ok(data) => log::trace!("T=1 recv: {data:02X?}"),
            Err(e) => log::debug!("T=1 link error: {e:?}"),
        }
        result
    }
}

impl DeviceLink<'_> {
    fn exchange_inner(&mut self, block: &[u8], wtx: u8) -> Result<Vec<u8>, LinkError> {
        let map_err = |e: &CmdError| match e {
            CmdError::Slot(SlotError::Parity) => LinkError::Parity,
            _ => LinkError::Fatal,
        };

        if self.device.desc.is_char_level() {
            // Character level: the prologue first, then the declared
            // remainder of the block.
            self.device
                .transmit_block(self.slot, block, 3, wtx)
                .map_err(|e| map_err(&e))?;
            let (mut head, _) = self
                .device
                .receive_block()
                .map_err(|e| map_err(&e))?;
            if head.len() < 3 {
                return Err(LinkError::Fatal);
            }

            let rest = u16::from(head[2]) + 1;
            self.device
                .transmit_block(self.slot, &[], rest, wtx)
                .map_err(|e| map_err(&e))?;
            let (tail, _) = self
                .device
                .receive_block()
                .map_err(|e| map_err(&e))?;
            head.extend_from_slice(&tail);
            Ok(head)
        } else {
            self.device
                .transmit_block(self.slot, block, 0, wtx)
                .map_err(|e| map_err(&e))?;
            let (data, _) = self
                .device
                .receive_block()
                .map_err(|e| map_err(&e))?;
            Ok(data)
        }
    }
}

/// Run a complete T=1 APDU exchange on a slot.
pub fn xfr_block_t1(
    device: &mut Device,
    slot_index: usize,
    tx: &[u8],
    rx_limit: usize,
) -> Result<Vec<u8>, CmdError> {
    log::debug!("T=1: {} bytes", tx.len());

    let mut t1 = std::mem::take(&mut device.slots[slot_index].t1);
    let slot_number = device.slots[slot_index].index;
    let result = {
        let mut link = device.t1_link(slot_number);
        t1.transceive(&mut link, tx, rx_limit)
    };
    device.slots[slot_index].t1 = t1;
    Ok(result?)
}
