//! Protocol and Parameters Selection.
//!
//! Builds the `FF PPS0 [PPS1] [PPS2] [PPS3] PCK` request, runs it through
//! the reader and decides whether the card's confirmation is acceptable.
//! Whether a PPS is attempted at all (auto-PPS readers, TA2 specific mode,
//! baud rate search) is the facade's decision.

use thiserror::Error;

use crate::commands::{CmdError, Device};

pub const PPS_MAX_LENGTH: usize = 6;

const PPSS: u8 = 0xFF;

const HAS_PPS1: u8 = 0x10;
const HAS_PPS2: u8 = 0x20;
const HAS_PPS3: u8 = 0x40;

#[derive(Debug, Error)]
pub enum PpsError {
    #[error("PPS exchange failed at the transport")]
    Icc(#[from] CmdError),

    #[error("PPS handshake rejected by the card")]
    Handshake,
}

/// Default TA1 when the card drops our PPS1 proposal.
pub const DEFAULT_TA1: u8 = 0x11;

/// Assemble a PPS request. `protocol` goes in the low nibble of PPS0; the
/// check character is the XOR of everything before it.
pub fn build_request(
    protocol: u8,
    pps1: Option<u8>,
    pps2: Option<u8>,
    pps3: Option<u8>,
) -> Vec<u8> {
    let mut pps0 = protocol & 0x0F;
    if pps1.is_some() {
        pps0 |= HAS_PPS1;
    }
    if pps2.is_some() {
        pps0 |= HAS_PPS2;
    }
    if pps3.is_some() {
        pps0 |= HAS_PPS3;
    }

    let mut request = vec![PPSS, pps0];
    request.extend(pps1);
    request.extend(pps2);
    request.extend(pps3);
    request.push(check_character(&request));
    request
}

fn check_character(block: &[u8]) -> u8 {
    block.iter().fold(0, |acc, &b| acc ^ b)
}

/// The confirmation is acceptable when it echoes the request, or shortens
/// it by clearing presence bits; an echoed PPS1 must match ours exactly.
fn matches_request(request: &[u8], confirm: &[u8]) -> bool {
    if confirm.len() < 3 {
        return false;
    }
    if request.len() == confirm.len() && request != confirm {
        return false;
    }
    if request.len() < confirm.len() {
        return false;
    }
    if confirm[1] & HAS_PPS1 != 0 && confirm[2] != request[2] {
        return false;
    }
    true
}

/// Result of a successful PPS exchange.
#[derive(Debug)]
pub struct PpsOutcome {
    pub confirm: Vec<u8>,
    /// TA1 value in effect after the handshake: the echoed PPS1, or the
    /// default when the card dropped the proposal.
    pub pps1: u8,
}

/// Send the request and verify the confirmation.
pub fn exchange(device: &mut Device, slot: u8, request: &[u8]) -> Result<PpsOutcome, PpsError> {
    log::debug!("PPS: sending request: {request:02X?}");

    let expected = if device.desc.is_char_level() { 4 } else { 0 };
    device.transmit_block(slot, request, expected, 0)?;
    let (confirm, _) = device.receive_block()?;

    log::debug!("PPS: receiving confirm: {confirm:02X?}");

    if !matches_request(request, &confirm) {
        return Err(PpsError::Handshake);
    }

    let pps1 = if request[1] & HAS_PPS1 != 0 && confirm[1] & HAS_PPS1 != 0 {
        confirm[2]
    } else {
        DEFAULT_TA1
    };

    Ok(PpsOutcome { confirm, pps1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_and_pck() {
        let request = build_request(1, Some(0x96), None, None);
        assert_eq!(request, vec![0xFF, 0x11, 0x96, 0xFF ^ 0x11 ^ 0x96]);

        let bare = build_request(0, None, None, None);
        assert_eq!(bare, vec![0xFF, 0x00, 0xFF]);
    }

    #[test]
    fn full_echo_is_accepted() {
        let request = build_request(1, Some(0x96), None, None);
        assert!(matches_request(&request, &request.clone()));
    }

    #[test]
    fn dropped_pps1_is_accepted() {
        // Card falls back to default parameters: FF 00 PCK.
        let request = build_request(1, Some(0x96), None, None);
        let confirm = vec![0xFF, 0x00, 0xFF];
        assert!(matches_request(&request, &confirm));
    }

    #[test]
    fn changed_pps1_is_rejected() {
        let request = build_request(1, Some(0x96), None, None);
        let confirm = vec![0xFF, 0x11, 0x95, 0xFF ^ 0x11 ^ 0x95];
        assert!(!matches_request(&request, &confirm));
    }

    #[test]
    fn longer_confirm_is_rejected() {
        let request = build_request(1, None, None, None);
        let confirm = build_request(1, Some(0x96), None, None);
        assert!(!matches_request(&request, &confirm));
    }
}
