//! T=0 character-level exchange.
//!
//! TPDU-level readers take the whole APDU in one XfrBlock (see
//! [`crate::commands::Device::xfr_block_tpdu`]); character-level readers
//! leave the ISO 7816-3 procedure byte machine to the driver: send the
//! 5-byte header, then feed or fetch bytes according to each procedure byte
//! until SW1 SW2 arrive.

use crate::commands::{CmdError, Device};
use crate::descriptor::FramingClass;

/// Expected response length from the ISO 7816-4 case of the command.
///
/// Case 1 (4-byte header) and case 3 (header plus Lc data) expect the status
/// words only; case 2 (5-byte header) expects Le data bytes plus status.
pub fn expected_response_length(cmd: &[u8]) -> Result<usize, CmdError> {
    match cmd.len() {
        4 => Ok(2),
        5 => {
            let le = if cmd[4] == 0 { 256 } else { usize::from(cmd[4]) };
            Ok(le + 2)
        }
        n if n > 5 && n == usize::from(cmd[4]) + 5 => Ok(2),
        _ => Err(CmdError::UnsupportedCase),
    }
}

/// Character-level T=0 exchange.
pub fn xfr_block_char_t0(device: &mut Device, slot: u8, snd: &[u8]) -> Result<Vec<u8>, CmdError> {
    log::debug!("T=0 char: {} bytes", snd.len());

    if device.desc.framing == FramingClass::IccdA {
        return xfr_block_iccd_a(device, slot, snd);
    }

    let exp_len = expected_response_length(snd)?;

    // Cases 1 and 2 expect data from the card; case 3 sends data.
    let is_rcv = snd.len() == 4 || snd.len() == 5;

    // The command header is always sent as 5 bytes (a case 1 command is
    // padded with P3 = 0).
    let mut header = [0u8; 5];
    let consumed = snd.len().min(5);
    header[..consumed].copy_from_slice(&snd[..consumed]);

    let ins = header[1];
    if ins & 0xF0 == 0x60 || ins & 0xF0 == 0x90 {
        log::error!("fatal: INS (0x{ins:02X}) = 0x6X or 0x9X");
        return Err(CmdError::Slot(crate::ccid::SlotError::Unknown(ins)));
    }

    // Remaining command data after the header, for case 3.
    let mut snd_rest = &snd[consumed..];

    device.transmit_block(slot, &header, 1, 0)?;

    let mut rcv: Vec<u8> = Vec::new();
    let mut in_buf: Vec<u8> = Vec::new();

    loop {
        if in_buf.is_empty() {
            let (data, _) = device.receive_block()?;
            in_buf = data;
        }
        if in_buf.is_empty() {
            // The card went silent mid-exchange; drop whatever partial
            // response accumulated and report the timeout.
            log::error!("empty response while waiting for a procedure byte");
            return Err(CmdError::ResponseTimeout);
        }

        let proc = in_buf[0];

        if proc == 0x60 {
            // NULL: the card asks for more time, poll again.
            in_buf.clear();
            device.transmit_block(slot, &[], 1, 0)?;
            continue;
        } else if proc == ins || proc == ins ^ 0x01 {
            // ACK: transfer all remaining bytes.
            in_buf.remove(0);
            if is_rcv {
                let wanted = exp_len - rcv.len();
                receive_data(device, slot, &mut rcv, &mut in_buf, wanted)?;
                if rcv.len() == exp_len {
                    return Ok(rcv);
                }
            } else {
                let snd_rest_len = snd_rest.len();
                send_data(device, slot, &mut snd_rest, snd_rest_len)?;
            }
        } else if proc == ins ^ 0xFF || proc == ins ^ 0xFE {
            // ~ACK: transfer a single byte.
            in_buf.remove(0);
            if is_rcv {
                receive_data(device, slot, &mut rcv, &mut in_buf, 1)?;
                if rcv.len() == exp_len {
                    return Ok(rcv);
                }
            } else {
                send_data(device, slot, &mut snd_rest, 1)?;
            }
        } else if proc & 0xF0 == 0x60 || proc & 0xF0 == 0x90 {
            // SW1: collect SW1 SW2 and finish.
            return collect_status_words(device, slot, rcv, in_buf);
        } else {
            log::error!("unrecognized procedure byte 0x{proc:02X}");
            return Ok(rcv);
        }
    }
}

/// Move `wanted` response bytes into `rcv`: drain the lookahead buffer
/// first, then ask the reader for the remainder.
fn receive_data(
    device: &mut Device,
    slot: u8,
    rcv: &mut Vec<u8>,
    in_buf: &mut Vec<u8>,
    wanted: usize,
) -> Result<(), CmdError> {
    let from_buffer = wanted.min(in_buf.len());
    rcv.extend_from_slice(&in_buf[..from_buffer]);
    in_buf.drain(..from_buffer);

    let mut remain = wanted - from_buffer;
    if remain == 0 {
        return Ok(());
    }

    if device.desc.split_modulo_64_reads && (remain + 10) % 64 == 0 {
        // This reader family cannot produce a bulk-in of exactly a packet
        // multiple; fetch one byte, then the rest.
        device.transmit_block(slot, &[], 1, 0)?;
        let (first, _) = device.receive_block()?;
        rcv.extend_from_slice(&first);
        remain -= first.len().min(remain);
        if remain == 0 {
            return Ok(());
        }
    }

    device.transmit_block(slot, &[], remain as u16, 0)?;
    let (data, _) = device.receive_block()?;
    if data.len() != remain {
        log::error!("expected {remain} data bytes, received {}", data.len());
        return Err(CmdError::LengthInconsistent);
    }
    rcv.extend_from_slice(&data);
    Ok(())
}

/// Hand `count` command bytes to the card after an ACK.
fn send_data(
    device: &mut Device,
    slot: u8,
    snd_rest: &mut &[u8],
    count: usize,
) -> Result<(), CmdError> {
    let count = count.min(snd_rest.len());
    device.transmit_block(slot, &snd_rest[..count], 1, 0)?;
    *snd_rest = &snd_rest[count..];
    Ok(())
}

/// SW1 is at the head of `in_buf`; SW2 either follows it or needs one more
/// read.
fn collect_status_words(
    device: &mut Device,
    slot: u8,
    mut rcv: Vec<u8>,
    mut in_buf: Vec<u8>,
) -> Result<Vec<u8>, CmdError> {
    let sw1 = in_buf.remove(0);
    rcv.push(sw1);

    let sw2 = if in_buf.is_empty() {
        device.transmit_block(slot, &[], 1, 0)?;
        let (data, _) = device.receive_block()?;
        if data.is_empty() {
            return Err(CmdError::ResponseTimeout);
        }
        data[0]
    } else {
        in_buf.remove(0)
    };
    rcv.push(sw2);

    log::debug!("SW = {sw1:02X} {sw2:02X}");
    Ok(rcv)
}

/// The ICCD-A variant drives the exchange through slot status polling
/// instead of procedure bytes.
fn xfr_block_iccd_a(device: &mut Device, slot: u8, snd: &[u8]) -> Result<Vec<u8>, CmdError> {
    let mut header = [0u8; 5];
    let consumed = snd.len().min(5);
    header[..consumed].copy_from_slice(&snd[..consumed]);
    let snd_rest = &snd[consumed..];

    device.transmit_block(slot, &header, 0, 0)?;

    let status = device.slot_status_raw(slot)?;
    let mut rcv = Vec::new();
    if status == 0x10 {
        if !snd_rest.is_empty() {
            device.transmit_block(slot, snd_rest, 0, 0)?;
        } else {
            let (data, _) = device.receive_block()?;
            rcv = data;
        }
    }

    let status = device.slot_status_raw(slot)?;
    if status == 0x20 {
        let (sw, _) = device.receive_block()?;
        rcv.extend_from_slice(&sw);
    }

    Ok(rcv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_table() {
        // Case 1: header only.
        assert_eq!(expected_response_length(&[0x00, 0xA4, 0x00, 0x00]).unwrap(), 2);
        // Case 2: Le = 8.
        assert_eq!(
            expected_response_length(&[0x00, 0xB0, 0x00, 0x00, 0x08]).unwrap(),
            10
        );
        // Case 2 with Le = 0 means 256 bytes.
        assert_eq!(
            expected_response_length(&[0x00, 0xB0, 0x00, 0x00, 0x00]).unwrap(),
            258
        );
        // Case 3: Lc = 2 plus 2 data bytes.
        assert_eq!(
            expected_response_length(&[0x00, 0xD0, 0x00, 0x00, 0x02, 0xAA, 0xBB]).unwrap(),
            2
        );
        // Inconsistent Lc.
        assert!(expected_response_length(&[0x00, 0xD0, 0x00, 0x00, 0x05, 0xAA]).is_err());
    }
}
