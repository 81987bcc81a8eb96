//! Secure PIN entry.
//!
//! Translates the standardised PC/SC v2 part 10 PIN verification and
//! modification blocks into the CCID Secure command payload (a different
//! field order that drops `bTimeOut2` and `ulDataLength`), applies the
//! firmware fixups the pinpad readers need, and splices a T=1 prologue when
//! a TPDU-level reader drives a T=1 card.

use std::time::Duration;

use crate::ccid::MessageType;
use crate::commands::{CmdError, Device};
use crate::descriptor::{CardProtocol, ExchangeClass};
use crate::quirks::{
    CHERRYST2000, CHERRYXX44, DELLSCRK, DELLSK, GEMPCPINPAD, SPR532, VEGAALPHA,
};

/// Offsets in the part-10 PIN verification structure.
mod verify {
    pub const TIMEOUT: usize = 0;
    pub const PIN_BLOCK_STRING: usize = 3;
    pub const MAX_EXTRA_DIGIT_LO: usize = 5;
    pub const MAX_EXTRA_DIGIT_HI: usize = 6;
    pub const ENTRY_VALIDATION: usize = 7;
    pub const NUMBER_MESSAGE: usize = 8;
    pub const TEO_PROLOGUE: usize = 12;
    pub const DATA_LENGTH: usize = 15;
    pub const AB_DATA: usize = 19;
}

/// Offsets in the part-10 PIN modification structure.
mod modify {
    pub const TIMEOUT: usize = 0;
    pub const ENTRY_VALIDATION: usize = 10;
    pub const NUMBER_MESSAGE: usize = 11;
    pub const MSG_INDEX2: usize = 15;
    pub const MSG_INDEX3: usize = 16;
    pub const TEO_PROLOGUE: usize = 17;
    pub const DATA_LENGTH: usize = 20;
    pub const AB_DATA: usize = 24;
}

fn data_length(block: &[u8], offset: usize) -> usize {
    u32::from_le_bytes([
        block[offset],
        block[offset + 1],
        block[offset + 2],
        block[offset + 3],
    ]) as usize
}

/// True when the reader is TPDU level and the card runs T=1: the reader
/// inserts the PIN into a frame we must prologue ourselves.
fn needs_t1_prologue(device: &Device) -> bool {
    device.desc.card_protocol == Some(CardProtocol::T1)
        && device.desc.exchange_class() == ExchangeClass::Tpdu
}

/// PIN verification through the reader's pinpad.
pub fn verify(device: &mut Device, slot_index: usize, tx: &[u8]) -> Result<Vec<u8>, CmdError> {
    let mut tx = tx.to_vec();

    // 19 bytes of fixed structure plus at least a 4-byte APDU.
    if tx.len() < verify::AB_DATA + 4 || tx.len() > verify::AB_DATA + crate::ccid::CMD_BUF_SIZE {
        log::info!("bad PIN verify block length: {}", tx.len());
        return Err(CmdError::NotSupported);
    }
    if data_length(&tx, verify::DATA_LENGTH) + verify::AB_DATA != tx.len() {
        log::info!("ulDataLength does not match the block length");
        return Err(CmdError::NotSupported);
    }

    let reader_id = device.desc.reader_id();

    // Out-of-range validation conditions crash some firmwares.
    if tx[verify::ENTRY_VALIDATION] == 0 || tx[verify::ENTRY_VALIDATION] > 0x07 {
        log::info!(
            "correcting bEntryValidationCondition (was 0x{:02X})",
            tx[verify::ENTRY_VALIDATION]
        );
        tx[verify::ENTRY_VALIDATION] = 0x02;
    }

    if reader_id == GEMPCPINPAD || reader_id == VEGAALPHA {
        // This firmware only accepts exactly one message and key-press
        // validation.
        if tx[verify::NUMBER_MESSAGE] != 0x01 {
            log::info!(
                "correcting bNumberMessage (was {})",
                tx[verify::NUMBER_MESSAGE]
            );
            tx[verify::NUMBER_MESSAGE] = 0x01;
        }
        if tx[verify::ENTRY_VALIDATION] != 0x02 {
            tx[verify::ENTRY_VALIDATION] = 0x02;
        }
    }

    if reader_id == DELLSCRK || reader_id == DELLSK {
        // Only "no message" goes through, and the Enter key that confirmed
        // the host dialog may still be down.
        if tx[verify::NUMBER_MESSAGE] != 0x00 {
            log::info!(
                "correcting bNumberMessage for Dell keyboard (was {})",
                tx[verify::NUMBER_MESSAGE]
            );
            tx[verify::NUMBER_MESSAGE] = 0x00;
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    if reader_id == DELLSK {
        log::info!("correcting wPINMaxExtraDigit byte order for Dell keyboard");
        tx.swap(verify::MAX_EXTRA_DIGIT_LO, verify::MAX_EXTRA_DIGIT_HI);
    }

    let spliced = needs_t1_prologue(device);
    if spliced {
        let apdu_len = tx.len() - verify::AB_DATA;
        let prologue = device.slots[slot_index].t1.build_prologue(apdu_len);
        tx[verify::TEO_PROLOGUE..verify::TEO_PROLOGUE + 3].copy_from_slice(&prologue);
        device.slots[slot_index].t1.toggle_sequences();
    }

    // SPR532 appends the PIN without padding on a case 1 APDU unless told
    // otherwise through a vendor escape.
    if reader_id == SPR532
        && tx[verify::PIN_BLOCK_STRING] == 0
        && data_length(&tx, verify::DATA_LENGTH) == 4
    {
        let mut out = Vec::new();
        device.escape(device.slots[slot_index].index, &[0x80, 0x02, 0x00], &mut out, None)?;
    }

    // CCID payload: bPINOperation, then the part-10 block without
    // bTimeOut2 and ulDataLength.
    let mut payload = vec![0x00];
    for (b, &byte) in tx.iter().enumerate() {
        if b == 1 || (verify::DATA_LENGTH..=verify::DATA_LENGTH + 3).contains(&b) {
            continue;
        }
        payload.push(byte);
    }

    let result = run_secure(device, slot_index, tx[verify::TIMEOUT], &payload);
    finish_t1_splice(device, slot_index, spliced, result)
}

/// PIN modification through the reader's pinpad.
pub fn modify(device: &mut Device, slot_index: usize, tx: &[u8]) -> Result<Vec<u8>, CmdError> {
    let mut tx = tx.to_vec();

    if tx.len() < modify::AB_DATA + 4 || tx.len() > modify::AB_DATA + crate::ccid::CMD_BUF_SIZE {
        log::info!("bad PIN modify block length: {}", tx.len());
        return Err(CmdError::NotSupported);
    }
    if data_length(&tx, modify::DATA_LENGTH) + modify::AB_DATA != tx.len() {
        log::info!("ulDataLength does not match the block length");
        return Err(CmdError::NotSupported);
    }

    if tx[modify::NUMBER_MESSAGE] > 3 && tx[modify::NUMBER_MESSAGE] != 0xFF {
        log::info!("wrong bNumberMessage: {}", tx[modify::NUMBER_MESSAGE]);
        return Err(CmdError::NotSupported);
    }

    if tx[modify::ENTRY_VALIDATION] == 0 || tx[modify::ENTRY_VALIDATION] > 0x07 {
        log::info!(
            "correcting bEntryValidationCondition (was 0x{:02X})",
            tx[modify::ENTRY_VALIDATION]
        );
        tx[modify::ENTRY_VALIDATION] = 0x02;
    }

    let reader_id = device.desc.reader_id();
    let mut restore_number_messages = None;

    if reader_id == SPR532 || reader_id == CHERRYST2000 {
        // No display, but the firmware wants all three message indexes
        // present and bNumberMessage zeroed afterwards.
        tx[modify::NUMBER_MESSAGE] = 0x03;
        tx[modify::NUMBER_MESSAGE + 3] = 0;
        tx[modify::MSG_INDEX2] = 0;
        tx[modify::MSG_INDEX3] = 0;
        restore_number_messages = Some(0x00);
    }

    if reader_id == CHERRYXX44 {
        // Accepts the command with fewer messages but the card then sees
        // 6B 80.
        tx[modify::NUMBER_MESSAGE] = 0x03;
    }

    if reader_id == GEMPCPINPAD || reader_id == VEGAALPHA {
        if tx[modify::ENTRY_VALIDATION] != 0x02 {
            log::info!(
                "correcting bEntryValidationCondition (was {})",
                tx[modify::ENTRY_VALIDATION]
            );
            tx[modify::ENTRY_VALIDATION] = 0x02;
        }
        // The firmware wants 3 messages in the frame; the real count is
        // restored in the CCID payload afterwards.
        restore_number_messages = Some(tx[modify::NUMBER_MESSAGE]);
        if tx[modify::NUMBER_MESSAGE] != 0x03 {
            log::info!(
                "correcting bNumberMessages (was {})",
                tx[modify::NUMBER_MESSAGE]
            );
            tx[modify::NUMBER_MESSAGE] = 0x03;
        }
    }

    let spliced = needs_t1_prologue(device);
    if spliced {
        let apdu_len = tx.len() - modify::AB_DATA;
        let prologue = device.slots[slot_index].t1.build_prologue(apdu_len);
        tx[modify::TEO_PROLOGUE..modify::TEO_PROLOGUE + 3].copy_from_slice(&prologue);
        device.slots[slot_index].t1.toggle_sequences();
    }

    // CCID payload: bPINOperation, then the block without bTimeOut2,
    // ulDataLength, and with the message indexes bNumberMessage implies.
    let mut payload = vec![0x01];
    for (b, &byte) in tx.iter().enumerate() {
        if b == 1 {
            continue;
        }
        if b == modify::MSG_INDEX2 && tx[modify::NUMBER_MESSAGE] == 0 {
            continue;
        }
        if b == modify::MSG_INDEX3 && tx[modify::NUMBER_MESSAGE] < 3 {
            continue;
        }
        if (modify::DATA_LENGTH..=modify::DATA_LENGTH + 3).contains(&b) {
            continue;
        }
        payload.push(byte);
    }

    if let Some(real) = restore_number_messages {
        // bNumberMessage sits at offset 11 of the CCID structure, plus the
        // leading bPINOperation byte.
        payload[11] = real;
    }

    let result = run_secure(device, slot_index, tx[modify::TIMEOUT], &payload);
    finish_t1_splice(device, slot_index, spliced, result)
}

/// Send the Secure command with the raised timeout and collect the reply.
fn run_secure(
    device: &mut Device,
    slot_index: usize,
    user_timeout: u8,
    payload: &[u8],
) -> Result<Vec<u8>, CmdError> {
    let slot_number = device.slots[slot_index].index;

    let old_timeout = device.desc.read_timeout;
    device.desc.read_timeout =
        Duration::from_secs(30).max(Duration::from_secs(u64::from(user_timeout) + 10));

    let result = (|| -> Result<Vec<u8>, CmdError> {
        device.send_command(MessageType::PcToRdrSecure, slot_number, [0, 0, 0], payload)?;
        let (data, _) = device.receive_block()?;
        Ok(data)
    })();

    device.desc.read_timeout = old_timeout;
    result
}

/// Undo or complete the T=1 frame handling around a spliced exchange: on
/// failure (including the faked `64 xx` statuses) no TPDU ever reached the
/// card, so the sequence numbers roll back; on success the reply still
/// carries the T=1 prologue and checksum, which the caller must not see.
fn finish_t1_splice(
    device: &mut Device,
    slot_index: usize,
    spliced: bool,
    result: Result<Vec<u8>, CmdError>,
) -> Result<Vec<u8>, CmdError> {
    if !spliced {
        return result;
    }

    match result {
        Ok(data) if data.len() > 2 => {
            // Strip NAD, PCB, LEN and the trailing checksum.
            let mut trimmed = data[3..].to_vec();
            trimmed.pop();
            Ok(trimmed)
        }
        other => {
            device.slots[slot_index].t1.toggle_sequences();
            other
        }
    }
}
