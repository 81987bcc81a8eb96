//! Scripted transport shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ifd_ccid::transport::{CcidPort, PortError};

/// One scripted reaction of the fake reader.
pub enum Answer {
    /// A CCID bulk-IN frame; its sequence byte is patched to echo the last
    /// command so scripts stay valid regardless of how many commands ran
    /// before.
    Frame(Vec<u8>),
    /// A frame used exactly as given, stale sequence byte included.
    RawFrame(Vec<u8>),
    Timeout,
    Nak,
    Gone,
}

/// A port that replays a prepared script and records everything written.
pub struct ScriptedPort {
    answers: VecDeque<Answer>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    last_seq: u8,
}

impl ScriptedPort {
    pub fn new(answers: Vec<Answer>) -> (ScriptedPort, Arc<Mutex<Vec<Vec<u8>>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            ScriptedPort {
                answers: answers.into(),
                written: written.clone(),
                last_seq: 0,
            },
            written,
        )
    }
}

impl CcidPort for ScriptedPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        if bytes.len() > 6 {
            self.last_seq = bytes[6];
        }
        self.written.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn read(&mut self, _max_len: usize, _timeout: Duration) -> Result<Vec<u8>, PortError> {
        match self.answers.pop_front() {
            None | Some(Answer::Timeout) => Err(PortError::Timeout),
            Some(Answer::Nak) => Err(PortError::Nak),
            Some(Answer::Gone) => Err(PortError::NoSuchDevice),
            Some(Answer::Frame(mut frame)) => {
                if frame.len() > 6 {
                    frame[6] = self.last_seq;
                }
                Ok(frame)
            }
            Some(Answer::RawFrame(frame)) => Ok(frame),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// RDR_to_PC_DataBlock with the given status/error bytes.
pub fn data_block(status: u8, error: u8, payload: &[u8]) -> Answer {
    let mut frame = vec![0x80];
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.push(0); // slot
    frame.push(0); // seq, patched at read time
    frame.push(status);
    frame.push(error);
    frame.push(0); // chain parameter
    frame.extend_from_slice(payload);
    Answer::Frame(frame)
}

/// RDR_to_PC_SlotStatus with an active card.
pub fn slot_status_ok() -> Answer {
    Answer::Frame(vec![0x81, 0, 0, 0, 0, 0, 0, 0, 0, 0])
}

/// RDR_to_PC_Parameters acknowledging a SetParameters.
pub fn parameters_ok(protocol: u8, data: &[u8]) -> Answer {
    let mut frame = vec![0x82];
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.push(0);
    frame.push(0);
    frame.push(0);
    frame.push(0);
    frame.push(protocol);
    frame.extend_from_slice(data);
    Answer::Frame(frame)
}

pub fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, &b| acc ^ b)
}

/// T=1 I-block with an LRC.
pub fn t1_i_block(ns: u8, more: bool, inf: &[u8]) -> Vec<u8> {
    let mut pcb = ns << 6;
    if more {
        pcb |= 0x20;
    }
    let mut block = vec![0x00, pcb, inf.len() as u8];
    block.extend_from_slice(inf);
    block.push(xor(&block));
    block
}

/// T=1 R-block with an LRC.
pub fn t1_r_block(nr: u8, error: u8) -> Vec<u8> {
    let mut block = vec![0x00, 0x80 | (nr << 4) | error, 0x00];
    block.push(xor(&block));
    block
}

/// T=1 S-block with an LRC.
pub fn t1_s_block(pcb: u8, inf: &[u8]) -> Vec<u8> {
    let mut block = vec![0x00, pcb, inf.len() as u8];
    block.extend_from_slice(inf);
    block.push(xor(&block));
    block
}
