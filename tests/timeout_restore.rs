//! The read timeout is save-and-restored around every section that
//! stretches it: secure PIN entry and WTX grants.

mod common;

use common::{data_block, t1_i_block, t1_s_block, Answer, ScriptedPort};
use ifd_ccid::commands::{xfr_block_t1, Device, Slot};
use ifd_ccid::descriptor::{CardProtocol, ReaderDescriptor, FEATURE_TPDU};

fn device(answers: Vec<Answer>) -> Device {
    let (port, _) = ScriptedPort::new(answers);
    let desc = ReaderDescriptor {
        features: FEATURE_TPDU,
        card_protocol: Some(CardProtocol::T1),
        ..Default::default()
    };
    let mut dev = Device::new(Box::new(port), desc);
    dev.slots.push(Slot::new(0, "test".into()));
    dev
}

#[test]
fn secure_pin_timeout_is_restored() {
    let mut dev = device(vec![Answer::Timeout]);
    let before = dev.desc.read_timeout;

    let mut block = vec![0u8; 19];
    block[15] = 13; // ulDataLength
    block.extend_from_slice(&[
        0x00, 0x20, 0x00, 0x00, 0x08, 0x30, 0x30, 0x30, 0x30, 0x00, 0x00, 0x00, 0x00,
    ]);

    assert!(ifd_ccid::secure_pin::verify(&mut dev, 0, &block).is_err());
    assert_eq!(dev.desc.read_timeout, before);
}

#[test]
fn wtx_grant_timeout_is_restored() {
    let mut dev = device(vec![
        data_block(0, 0, &t1_s_block(0xC3, &[0x08])),
        data_block(0, 0, &t1_i_block(0, false, &[0x90, 0x00])),
    ]);
    let before = dev.desc.read_timeout;

    let rx = xfr_block_t1(&mut dev, 0, &[0x00, 0xB0, 0x00, 0x00], 256).unwrap();
    assert_eq!(rx, vec![0x90, 0x00]);
    assert_eq!(dev.desc.read_timeout, before);
}

#[test]
fn timeout_mid_wtx_still_restores() {
    let mut dev = device(vec![
        data_block(0, 0, &t1_s_block(0xC3, &[0x08])),
        Answer::Timeout,
    ]);
    let before = dev.desc.read_timeout;

    assert!(xfr_block_t1(&mut dev, 0, &[0x00, 0xB0, 0x00, 0x00], 256).is_err());
    assert_eq!(dev.desc.read_timeout, before);
}
