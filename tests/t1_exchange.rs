//! Full-stack T=1 exchanges: APDUs travel through the facade, the T=1
//! engine, and the CCID codec down to a scripted port.

mod common;

use common::{data_block, slot_status_ok, t1_i_block, t1_r_block, t1_s_block, xor, ScriptedPort};
use ifd_ccid::descriptor::{CardProtocol, ReaderDescriptor, FEATURE_AUTO_PPS_PROP, FEATURE_TPDU};
use ifd_ccid::driver::PowerAction;
use ifd_ccid::{Driver, IfdError};

// A T=1 ATR: TD1 = 0x81 -> TD2 = 0x01, protocol T=1, no TA1, valid TCK.
const ATR_T1: &[u8] = &[0x3B, 0x80, 0x81, 0x01, 0x00];

fn t1_driver(answers: Vec<common::Answer>) -> (Driver, std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>) {
    let driver = Driver::default();
    let mut script = vec![slot_status_ok(), data_block(0, 0, ATR_T1)];
    script.extend(answers);

    let (port, written) = ScriptedPort::new(script);
    let desc = ReaderDescriptor {
        features: FEATURE_TPDU | FEATURE_AUTO_PPS_PROP,
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

/// The T=1 block inside the n-th XfrBlock command written after open and
/// power-up.
fn t1_payload(written: &[Vec<u8>], n: usize) -> Vec<u8> {
    // Command 0 is the open probe, command 1 the power-on.
    written[2 + n][10..].to_vec()
}

#[test]
fn single_block_exchange() {
    let apdu = [0x00, 0xA4, 0x04, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04];
    let response = [0x61, 0x23];

    let (driver, written) =
        t1_driver(vec![data_block(0, 0, &t1_i_block(0, false, &response))]);

    let rx = driver.transmit(1, &apdu, 256).unwrap();
    assert_eq!(rx, response.to_vec());

    // The outbound block is 00 00 len apdu lrc.
    let written = written.lock().unwrap();
    let block = t1_payload(&written, 0);
    let mut expect = vec![0x00, 0x00, apdu.len() as u8];
    expect.extend_from_slice(&apdu);
    expect.push(xor(&expect));
    assert_eq!(block, expect);
}

#[test]
fn chained_response_is_gathered() {
    let first: Vec<u8> = (0..32).collect();
    let second: Vec<u8> = (32..48).collect();

    let (driver, written) = t1_driver(vec![
        data_block(0, 0, &t1_i_block(0, true, &first)),
        data_block(0, 0, &t1_i_block(1, false, &second)),
    ]);

    let rx = driver.transmit(1, &[0x00, 0xB0, 0x00, 0x00, 0x30], 256).unwrap();
    assert_eq!(rx.len(), 48);
    assert_eq!(&rx[..32], first.as_slice());
    assert_eq!(&rx[32..], second.as_slice());

    // Between the chained I-blocks the driver acknowledged with R(nr=1).
    let written = written.lock().unwrap();
    assert_eq!(t1_payload(&written, 1), t1_r_block(1, 0));
}

#[test]
fn corrupted_block_is_asked_again() {
    let good = t1_i_block(0, false, &[0x90, 0x00]);
    let mut bad = good.clone();
    let last = bad.len() - 1;
    bad[last] ^= 0x55;

    let (driver, written) = t1_driver(vec![
        data_block(0, 0, &bad),
        data_block(0, 0, &good),
    ]);

    let rx = driver.transmit(1, &[0x00, 0xC0, 0x00, 0x00], 256).unwrap();
    assert_eq!(rx, vec![0x90, 0x00]);

    // R(EDC error, nr=0) between the two attempts.
    let written = written.lock().unwrap();
    assert_eq!(t1_payload(&written, 1), t1_r_block(0, 1));
}

#[test]
fn resync_after_three_corrupted_blocks() {
    let good = t1_i_block(0, false, &[0x90, 0x00]);
    let mut bad = good.clone();
    let last = bad.len() - 1;
    bad[last] ^= 0x55;

    let (driver, written) = t1_driver(vec![
        data_block(0, 0, &bad),
        data_block(0, 0, &bad.clone()),
        data_block(0, 0, &bad.clone()),
        data_block(0, 0, &t1_s_block(0xE0, &[])), // resync response
        data_block(0, 0, &good),
    ]);

    let rx = driver.transmit(1, &[0x00, 0xB0, 0x00, 0x00], 256).unwrap();
    assert_eq!(rx, vec![0x90, 0x00]);

    let written = written.lock().unwrap();
    // I, R(EDC), R(EDC) replayed, S(RESYNC request), I again with ns=0.
    assert_eq!(t1_payload(&written, 3), t1_s_block(0xC0, &[]));
    let retry = t1_payload(&written, 4);
    assert_eq!(retry[1] & 0xC0, 0x00);
    assert_eq!(retry[1] & 0x40, 0x00);
}

#[test]
fn resync_exhaustion_goes_dead_until_repowered() {
    let garbage = vec![0xFF, 0xFF, 0xFF, 0xFF];
    let mut answers = Vec::new();
    for _ in 0..16 {
        answers.push(data_block(0, 0, &garbage));
    }
    let (driver, _) = t1_driver(answers);

    assert!(matches!(
        driver.transmit(1, &[0x00, 0xB0, 0x00, 0x00], 256),
        Err(IfdError::Communication)
    ));

    // The engine is dead: the next exchange fails without any I/O.
    assert!(matches!(
        driver.transmit(1, &[0x00, 0xB0, 0x00, 0x00], 256),
        Err(IfdError::Communication)
    ));
}

#[test]
fn wtx_is_granted_for_one_exchange() {
    let (driver, written) = t1_driver(vec![
        data_block(0, 0, &t1_s_block(0xC3, &[0x10])),
        data_block(0, 0, &t1_i_block(0, false, &[0x90, 0x00])),
    ]);

    let rx = driver.transmit(1, &[0x00, 0x88, 0x00, 0x00], 256).unwrap();
    assert_eq!(rx, vec![0x90, 0x00]);

    // The engine answered with a WTX response echoing the multiplier.
    let written = written.lock().unwrap();
    assert_eq!(t1_payload(&written, 1), t1_s_block(0xE3, &[0x10]));
}
