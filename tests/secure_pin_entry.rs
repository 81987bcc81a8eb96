//! Secure PIN entry through the control surface, including the T=1
//! prologue splice for TPDU-level readers.

mod common;

use common::{data_block, slot_status_ok, t1_i_block, ScriptedPort};
use ifd_ccid::ccid::COMMAND_FAILED;
use ifd_ccid::descriptor::{
    CardProtocol, ReaderDescriptor, FEATURE_AUTO_PPS_PROP, FEATURE_TPDU, PIN_SUPPORT_MODIFY,
    PIN_SUPPORT_VERIFY,
};
use ifd_ccid::driver::control_codes::{
    feature_ioctl, CM_IOCTL_GET_FEATURE_REQUEST, FEATURE_GET_TLV_PROPERTIES,
    FEATURE_VERIFY_PIN_DIRECT,
};
use ifd_ccid::driver::PowerAction;
use ifd_ccid::{Driver, IfdError};

const ATR_T1: &[u8] = &[0x3B, 0x80, 0x81, 0x01, 0x00];

/// A part-10 verify block: 19 fixed bytes plus a 13-byte verify APDU.
fn verify_block() -> Vec<u8> {
    let mut block = vec![
        0x19, // bTimeOut
        0x00, // bTimeOut2
        0x82, // bmFormatString
        0x08, // bmPINBlockString
        0x00, // bmPINLengthFormat
        0x04, 0x08, // wPINMaxExtraDigit
        0x02, // bEntryValidationCondition
        0x01, // bNumberMessage
        0x09, 0x04, // wLangId
        0x00, // bMsgIndex
        0x00, 0x00, 0x00, // bTeoPrologue
        0x0D, 0x00, 0x00, 0x00, // ulDataLength
    ];
    block.extend_from_slice(&[
        0x00, 0x20, 0x00, 0x00, 0x08, 0x30, 0x30, 0x30, 0x30, 0x00, 0x00, 0x00, 0x00,
    ]);
    block
}

fn pinpad_driver(answers: Vec<common::Answer>) -> (Driver, std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>) {
    let driver = Driver::default();
    let mut script = vec![slot_status_ok(), data_block(0, 0, ATR_T1)];
    script.extend(answers);

    let (port, written) = ScriptedPort::new(script);
    let desc = ReaderDescriptor {
        features: FEATURE_TPDU | FEATURE_AUTO_PPS_PROP,
        pin_support: PIN_SUPPORT_VERIFY | PIN_SUPPORT_MODIFY,
        ..Default::default()
    };
    driver
        .create_channel_with_port(1, Box::new(port), desc, "fake:0")
        .unwrap();
    driver.power_icc(1, PowerAction::PowerUp).unwrap();
    driver
        .set_protocol_parameters(1, CardProtocol::T1, 0, 0, 0, 0)
        .unwrap();
    (driver, written)
}

#[test]
fn verify_splices_a_t1_prologue() {
    let (driver, written) = pinpad_driver(vec![data_block(
        0,
        0,
        &t1_i_block(0, false, &[0x90, 0x00]),
    )]);

    let rx = driver
        .control(1, feature_ioctl(FEATURE_VERIFY_PIN_DIRECT), &verify_block(), 256)
        .unwrap();

    // The prologue and checksum are stripped before the caller sees the
    // answer.
    assert_eq!(rx, vec![0x90, 0x00]);

    let written = written.lock().unwrap();
    let secure = &written[2];
    assert_eq!(secure[0], 0x69);
    let payload = &secure[10..];
    // bPINOperation = verification.
    assert_eq!(payload[0], 0x00);
    // bTimeOut copied, bTimeOut2 dropped.
    assert_eq!(payload[1], 0x19);
    assert_eq!(payload[2], 0x82);
    // The generated prologue: NAD 0, I-block with ns=0, 13 data bytes.
    assert_eq!(&payload[12..15], &[0x00, 0x00, 0x0D]);
    // The embedded APDU follows; ulDataLength was dropped.
    assert_eq!(&payload[15..20], &[0x00, 0x20, 0x00, 0x00, 0x08]);
}

#[test]
fn rejected_verify_rolls_the_sequence_back() {
    let (driver, written) = pinpad_driver(vec![
        // The reader rejects the Secure command: no TPDU was sent.
        data_block(COMMAND_FAILED, 0xEF, &[]),
        // A second attempt succeeds.
        data_block(0, 0, &t1_i_block(0, false, &[0x90, 0x00])),
    ]);

    // A cancelled PIN entry surfaces as the 64 01 status words.
    let rx = driver
        .control(1, feature_ioctl(FEATURE_VERIFY_PIN_DIRECT), &verify_block(), 256)
        .unwrap();
    assert_eq!(rx, vec![0x64, 0x01]);

    let rx = driver
        .control(1, feature_ioctl(FEATURE_VERIFY_PIN_DIRECT), &verify_block(), 256)
        .unwrap();
    assert_eq!(rx, vec![0x90, 0x00]);

    // Both Secure commands carried the same sequence bit in the prologue:
    // the rollback undid the toggle after the rejected attempt.
    let written = written.lock().unwrap();
    assert_eq!(written[2][10 + 13], 0x00);
    assert_eq!(written[3][10 + 13], 0x00);
}

#[test]
fn feature_list_advertises_the_pinpad() {
    let (driver, _) = pinpad_driver(Vec::new());

    let tlv = driver
        .control(1, CM_IOCTL_GET_FEATURE_REQUEST, &[], 256)
        .unwrap();

    // 6-byte records: tag, length 4, big-endian control code.
    assert_eq!(tlv.len() % 6, 0);
    let mut found_verify = false;
    let mut found_tlv_props = false;
    for record in tlv.chunks_exact(6) {
        assert_eq!(record[1], 4);
        let code = u32::from_be_bytes([record[2], record[3], record[4], record[5]]);
        if record[0] == FEATURE_VERIFY_PIN_DIRECT {
            assert_eq!(code, feature_ioctl(FEATURE_VERIFY_PIN_DIRECT));
            found_verify = true;
        }
        if record[0] == FEATURE_GET_TLV_PROPERTIES {
            found_tlv_props = true;
        }
    }
    assert!(found_verify);
    assert!(found_tlv_props);
}

#[test]
fn vendor_escape_requires_the_driver_option() {
    let (driver, _) = pinpad_driver(Vec::new());

    assert!(matches!(
        driver.control(
            1,
            ifd_ccid::driver::control_codes::IOCTL_SMARTCARD_VENDOR_IFD_EXCHANGE,
            &[0x02],
            256
        ),
        Err(IfdError::NotSupported)
    ));
}

#[test]
fn malformed_pin_block_is_not_supported() {
    let (driver, _) = pinpad_driver(Vec::new());

    assert!(matches!(
        driver.control(1, feature_ioctl(FEATURE_VERIFY_PIN_DIRECT), &[0u8; 5], 256),
        Err(IfdError::NotSupported)
    ));
}
