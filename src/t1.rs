//! T=1 block protocol engine.
//!
//! Implements the ISO 7816-3 block transport: I-block chaining, R-block
//! acknowledge/reject, S-block control (RESYNC, IFS, ABORT, WTX), error
//! detection with LRC or CRC, and the rule 6.x/7.x recovery ladder.
//!
//! The engine is pure protocol: all I/O goes through the [`T1Link`] seam, so
//! every received-block-to-next-action decision is testable without a
//! reader. The CCID command layer provides the real link.

use thiserror::Error;

/// NAD, PCB, LEN plus the largest INF (254) and a 2-byte EDC.
pub const T1_BUFFER_SIZE: usize = 3 + 254 + 2;

const NAD: usize = 0;
const PCB: usize = 1;
const LEN: usize = 2;
const DATA: usize = 3;

/// PCB templates.
const PCB_I_BLOCK: u8 = 0x00;
const PCB_R_BLOCK: u8 = 0x80;
const PCB_S_BLOCK: u8 = 0xC0;

const I_SEQ_SHIFT: u8 = 6;
const R_SEQ_SHIFT: u8 = 4;
const MORE_BIT: u8 = 0x20;

const S_RESPONSE: u8 = 0x20;
const S_RESYNC: u8 = 0x00;
const S_IFS: u8 = 0x01;
const S_ABORT: u8 = 0x02;
const S_WTX: u8 = 0x03;

/// R-block error nibble.
const R_EDC_ERROR: u8 = 0x01;
const R_OTHER_ERROR: u8 = 0x02;

fn swap_nibbles(x: u8) -> u8 {
    (x >> 4) | ((x & 0x0F) << 4)
}

/// Classification of a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    I { seq: u8, more: bool },
    R { seq: u8, error: u8, bit5: bool },
    S { response: bool, kind: u8 },
}

pub fn classify(pcb: u8) -> BlockKind {
    match pcb & 0xC0 {
        PCB_R_BLOCK => BlockKind::R {
            seq: (pcb >> R_SEQ_SHIFT) & 1,
            error: pcb & 0x0F,
            bit5: pcb & MORE_BIT != 0,
        },
        PCB_S_BLOCK => BlockKind::S {
            response: pcb & S_RESPONSE != 0,
            kind: pcb & 0x0F,
        },
        _ => BlockKind::I {
            seq: (pcb >> I_SEQ_SHIFT) & 1,
            more: pcb & MORE_BIT != 0,
        },
    }
}

fn is_r_block(pcb: u8) -> bool {
    matches!(classify(pcb), BlockKind::R { .. })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// 1-byte XOR.
    Lrc,
    /// 2-byte CRC, network byte order.
    Crc,
}

impl ChecksumKind {
    pub fn len(self) -> usize {
        match self {
            ChecksumKind::Lrc => 1,
            ChecksumKind::Crc => 2,
        }
    }
}

pub fn lrc(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// CRC over the NAD..INF range, ISO/IEC 13239 with initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn append_checksum(kind: ChecksumKind, block: &mut Vec<u8>) {
    match kind {
        ChecksumKind::Lrc => block.push(lrc(block)),
        ChecksumKind::Crc => {
            let crc = crc16(block);
            block.extend_from_slice(&crc.to_be_bytes());
        }
    }
}

fn verify_checksum(kind: ChecksumKind, block: &[u8]) -> bool {
    let edc_len = kind.len();
    if block.len() < edc_len + 3 {
        return false;
    }
    let (body, edc) = block.split_at(block.len() - edc_len);
    match kind {
        ChecksumKind::Lrc => edc[0] == lrc(body),
        ChecksumKind::Crc => edc == crc16(body).to_be_bytes(),
    }
}

/// Errors from the link below the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The reader reported a parity error for the exchange; feeds the
    /// retransmission rules.
    Parity,
    /// Anything else; the exchange cannot continue.
    Fatal,
}

/// One block exchange: send `block`, return the peer's raw block.
///
/// `wtx` is the waiting-time-extension multiplier currently granted to the
/// card (0 or 1 mean none); the link stretches its read deadline by it for
/// this exchange only.
pub trait T1Link {
    fn exchange(&mut self, block: &[u8], wtx: u8) -> Result<Vec<u8>, LinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum T1Error {
    #[error("T=1 state machine is dead, reset the card first")]
    Dead,

    #[error("T=1 exchange failed")]
    Fatal,

    #[error("parity errors exhausted the T=1 retry budget")]
    Parity,

    #[error("receive buffer overrun")]
    Overrun,

    #[error("card aborted the exchange")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sending,
    Receiving,
    Resynching,
    Dead,
}

/// Per-slot T=1 protocol state. Created at power-up, torn down at
/// power-down.
#[derive(Debug, Clone)]
pub struct T1State {
    /// Our send sequence bit.
    ns: u8,
    /// Expected receive sequence bit.
    nr: u8,
    pub ifsc: usize,
    pub ifsd: usize,
    checksum: ChecksumKind,
    phase: Phase,
    /// Whether the last I-block we sent carried the chaining bit.
    more: bool,
    /// WTX multiplier granted to the card for the next exchange.
    wtx: u8,
    /// Prologue of the last block sent, for rule 7.2 retransmission.
    /// Only R-blocks are ever replayed from here.
    previous_block: [u8; 4],
    /// Per-exchange retry budget.
    retries: u32,
}

impl Default for T1State {
    fn default() -> Self {
        T1State::new()
    }
}

impl T1State {
    pub fn new() -> T1State {
        T1State {
            ns: 0,
            nr: 0,
            ifsc: 32,
            ifsd: 32,
            checksum: ChecksumKind::Lrc,
            phase: Phase::Sending,
            more: false,
            wtx: 0,
            previous_block: [0; 4],
            retries: 3,
        }
    }

    pub fn set_checksum(&mut self, kind: ChecksumKind) {
        self.checksum = kind;
    }

    pub fn checksum(&self) -> ChecksumKind {
        self.checksum
    }

    pub fn is_dead(&self) -> bool {
        self.phase == Phase::Dead
    }

    pub fn ns(&self) -> u8 {
        self.ns
    }

    pub fn nr(&self) -> u8 {
        self.nr
    }

    /// Flip both sequence bits; used by the secure PIN path which injects
    /// one I-block prologue outside the engine.
    pub fn toggle_sequences(&mut self) {
        self.ns ^= 1;
        self.nr ^= 1;
    }

    /// Build an I-block prologue (NAD, PCB, LEN) for `data` without sending
    /// it or touching the sequence state. The secure PIN engine embeds this
    /// in front of the PIN block so the reader's insertion lands in a valid
    /// frame.
    pub fn build_prologue(&self, data_len: usize) -> [u8; 3] {
        let mut pcb = PCB_I_BLOCK | (self.ns << I_SEQ_SHIFT);
        let mut len = data_len;
        if len > self.ifsc {
            pcb |= MORE_BIT;
            len = self.ifsc;
        }
        [0x00, pcb, len as u8]
    }

    /// Build a block. For I-blocks `data` is the remaining send queue and
    /// at most `ifsc` bytes are taken; the number taken is returned.
    fn build(&mut self, mut pcb: u8, data: &[u8]) -> (Vec<u8>, usize) {
        let mut len = data.len();
        let mut more = false;
        if len > self.ifsc {
            pcb |= MORE_BIT;
            len = self.ifsc;
            more = true;
        }

        match pcb & 0xC0 {
            PCB_R_BLOCK => pcb |= self.nr << R_SEQ_SHIFT,
            PCB_S_BLOCK => {}
            _ => {
                pcb |= self.ns << I_SEQ_SHIFT;
                self.more = more;
            }
        }

        let mut block = Vec::with_capacity(3 + len + self.checksum.len());
        block.push(0x00); // NAD: primary interface
        block.push(pcb);
        block.push(len as u8);
        block.extend_from_slice(&data[..len]);
        append_checksum(self.checksum, &mut block);

        // Memorise the prologue for rule 7.2; only R-blocks get replayed.
        let n = self.previous_block.len().min(block.len());
        self.previous_block[..n].copy_from_slice(&block[..n]);

        (block, len)
    }

    /// Rule 7.2: replay the last sent block if it was an R-block.
    fn rebuild(&self) -> Option<Vec<u8>> {
        if is_r_block(self.previous_block[PCB]) {
            Some(self.previous_block.to_vec())
        } else {
            log::error!(
                "previous block was not an R-block: {:02X}",
                self.previous_block[PCB]
            );
            None
        }
    }

    /// Negotiate IFSD with the card right after power-up; used when the
    /// reader does not advertise auto-IFSD.
    pub fn negotiate_ifsd(&mut self, link: &mut dyn T1Link, ifsd: u8) -> Result<(), T1Error> {
        let mut retries = self.retries;

        loop {
            let (block, _) = self.build(PCB_S_BLOCK | S_IFS, &[ifsd]);
            let result = link.exchange(&block, 0);

            retries -= 1;
            if retries == 0 {
                self.phase = Phase::Dead;
                return Err(T1Error::Fatal);
            }

            let rdata = match result {
                Ok(data) => data,
                Err(LinkError::Parity) => continue,
                Err(LinkError::Fatal) => {
                    self.phase = Phase::Dead;
                    return Err(T1Error::Fatal);
                }
            };

            let expected_len = 4 + self.checksum.len();
            if rdata.len() != expected_len
                || rdata[NAD] != swap_nibbles(0)
                || !verify_checksum(self.checksum, &rdata)
                || rdata[LEN] != 1
                || rdata[PCB] != PCB_S_BLOCK | S_RESPONSE | S_IFS
                || rdata[DATA] != ifsd
            {
                continue;
            }

            self.ifsd = usize::from(ifsd);
            return Ok(());
        }
    }

    /// Send a command APDU, apply the recovery rules, return the response
    /// APDU. `rcv_limit` bounds the receive buffer.
    pub fn transceive(
        &mut self,
        link: &mut dyn T1Link,
        snd: &[u8],
        rcv_limit: usize,
    ) -> Result<Vec<u8>, T1Error> {
        if snd.is_empty() {
            return Err(T1Error::Fatal);
        }
        if self.phase == Phase::Dead {
            log::error!("T=1 state machine is DEAD, reset the card first");
            return Err(T1Error::Dead);
        }

        self.phase = Phase::Sending;
        let mut retries = self.retries;
        let mut resyncs = 3u32;
        let mut parity_seen = false;

        // Send cursor: `sent` bytes are acknowledged, `last_send` are in
        // flight in the current I-block.
        let mut sent = 0usize;
        let mut last_send;
        let mut rcv: Vec<u8> = Vec::new();

        let (mut sdata, n) = self.build(PCB_I_BLOCK, snd);
        last_send = n;

        loop {
            retries = retries.saturating_sub(1);

            let exchanged = link.exchange(&sdata, self.wtx);
            self.wtx = 0;

            let mut rdata = match exchanged {
                Ok(data) => data,
                Err(LinkError::Parity) => {
                    log::debug!("parity error reported by the reader");
                    parity_seen = true;
                    // Rule 7.4.2
                    if retries == 0 {
                        sdata = self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                        continue;
                    }
                    // Rule 7.2
                    if let Some(replay) = self.rebuild() {
                        sdata = replay;
                        continue;
                    }
                    let (block, _) = self.build(PCB_R_BLOCK | R_EDC_ERROR, &[]);
                    sdata = block;
                    continue;
                }
                Err(LinkError::Fatal) => {
                    log::error!("fatal: transmit/receive failed");
                    self.phase = Phase::Dead;
                    return Err(if parity_seen { T1Error::Parity } else { T1Error::Fatal });
                }
            };

            // The reader may hand back trailing garbage; cut at the
            // declared length plus EDC.
            if rdata.len() >= 3 {
                let m = usize::from(rdata[LEN]) + 3 + self.checksum.len();
                if m < rdata.len() {
                    rdata.truncate(m);
                }
            }

            // Wrong NAD, an illegal declared length, or fewer bytes than
            // the prologue announces.
            if rdata.len() < 3
                || rdata[NAD] != swap_nibbles(0)
                || rdata[LEN] == 0xFF
                || rdata.len() < 3 + usize::from(rdata[LEN]) + self.checksum.len()
            {
                log::debug!("bad NAD or length, R-block required");
                if retries == 0 {
                    sdata = self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                    continue;
                }
                if let Some(replay) = self.rebuild() {
                    sdata = replay;
                    continue;
                }
                let (block, _) = self.build(PCB_R_BLOCK | R_OTHER_ERROR, &[]);
                sdata = block;
                continue;
            }

            if !verify_checksum(self.checksum, &rdata) {
                log::debug!("checksum failed");
                if retries == 0 {
                    sdata = self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                    continue;
                }
                if let Some(replay) = self.rebuild() {
                    sdata = replay;
                    continue;
                }
                let (block, _) = self.build(PCB_R_BLOCK | R_EDC_ERROR, &[]);
                sdata = block;
                continue;
            }

            match classify(rdata[PCB]) {
                BlockKind::R { seq, error: _, bit5 } => {
                    // An R-block never carries data and never sets bit 5.
                    if rdata[LEN] != 0 || bit5 {
                        log::debug!("invalid R-block");
                        if retries == 0 {
                            sdata = self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                            continue;
                        }
                        if let Some(replay) = self.rebuild() {
                            sdata = replay;
                            continue;
                        }
                        let (block, _) = self.build(PCB_R_BLOCK | R_OTHER_ERROR, &[]);
                        sdata = block;
                        continue;
                    }

                    // While the final chunk is in flight only R(ns) makes
                    // sense: anything else is a protocol violation.
                    if seq != self.ns && !self.more {
                        log::debug!("received seq {seq}, expected {}, more: {}", self.ns, self.more);
                        if let Some(replay) = self.rebuild() {
                            sdata = replay;
                            continue;
                        }
                        if retries == 0 {
                            sdata = self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                            continue;
                        }
                        let (block, _) = self.build(PCB_R_BLOCK | R_OTHER_ERROR, &[]);
                        sdata = block;
                        continue;
                    }

                    if self.phase == Phase::Receiving {
                        // The card rejected our acknowledgement: repeat it.
                        if let Some(replay) = self.rebuild() {
                            sdata = replay;
                            continue;
                        }
                        let (block, _) = self.build(PCB_R_BLOCK, &[]);
                        sdata = block;
                        retries = self.retries;
                        continue;
                    }

                    // The card asking for the next sequence number means it
                    // received the current block: advance the cursor.
                    if seq != self.ns {
                        sent += last_send;
                        last_send = 0;
                        self.ns ^= 1;
                    }

                    // Nothing left to send: the card should not ask for
                    // more.
                    if sent >= snd.len() {
                        sdata = self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                        continue;
                    }

                    let (block, n) = self.build(PCB_I_BLOCK, &snd[sent..]);
                    sdata = block;
                    last_send = n;
                    retries = self.retries;
                    continue;
                }

                BlockKind::I { seq, more } => {
                    // The first I-block from the card acknowledges the last
                    // block we sent.
                    if self.phase == Phase::Sending {
                        sent += last_send;
                        last_send = 0;
                        self.ns ^= 1;
                    }

                    self.phase = Phase::Receiving;

                    if seq != self.nr {
                        log::debug!("wrong nr");
                        let (block, _) = self.build(PCB_R_BLOCK | R_OTHER_ERROR, &[]);
                        sdata = block;
                        continue;
                    }

                    self.nr ^= 1;

                    let inf = &rdata[DATA..DATA + usize::from(rdata[LEN])];
                    if rcv.len() + inf.len() > rcv_limit {
                        log::error!(
                            "receive buffer overrun by {} bytes",
                            rcv.len() + inf.len() - rcv_limit
                        );
                        self.phase = Phase::Dead;
                        return Err(T1Error::Overrun);
                    }
                    rcv.extend_from_slice(inf);

                    if !more {
                        return Ok(rcv);
                    }

                    let (block, _) = self.build(PCB_R_BLOCK, &[]);
                    sdata = block;
                    retries = self.retries;
                    continue;
                }

                BlockKind::S { response: true, .. } => {
                    if self.phase == Phase::Resynching {
                        // Rules 6.2 and 6.3: restart the exchange.
                        log::debug!("S-block resync answer received");
                        self.phase = Phase::Sending;
                        last_send = 0;
                        resyncs = 3;
                        retries = self.retries;
                        rcv.clear();
                        let (block, n) = self.build(PCB_I_BLOCK, &snd[sent..]);
                        sdata = block;
                        last_send = n;
                        continue;
                    }

                    log::error!("unexpected S-block response received");
                    if retries == 0 {
                        sdata = self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                        continue;
                    }
                    if let Some(replay) = self.rebuild() {
                        sdata = replay;
                        continue;
                    }
                    let (block, _) = self.build(PCB_R_BLOCK | R_OTHER_ERROR, &[]);
                    sdata = block;
                    continue;
                }

                BlockKind::S {
                    response: false,
                    kind,
                } => {
                    log::debug!("S-block request received");
                    match kind {
                        S_RESYNC => {
                            if rdata[LEN] != 0 {
                                let (block, _) = self.build(PCB_R_BLOCK | R_OTHER_ERROR, &[]);
                                sdata = block;
                                continue;
                            }
                            // The card is not allowed to initiate a resync.
                            log::debug!("resync requested by the card");
                            sdata = self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                            continue;
                        }

                        S_ABORT => {
                            if rdata[LEN] != 0 {
                                let (block, _) = self.build(PCB_R_BLOCK | R_OTHER_ERROR, &[]);
                                sdata = block;
                                continue;
                            }
                            // Rule 9: acknowledge, then give up on the
                            // exchange.
                            log::error!("abort requested by the card");
                            let (block, _) =
                                self.build(PCB_S_BLOCK | S_RESPONSE | S_ABORT, &[]);
                            let _ = link.exchange(&block, 0);
                            self.phase = Phase::Dead;
                            return Err(T1Error::Aborted);
                        }

                        S_IFS => {
                            if rdata[LEN] != 1 {
                                let (block, _) = self.build(PCB_R_BLOCK | R_OTHER_ERROR, &[]);
                                sdata = block;
                                continue;
                            }
                            let ifs = rdata[DATA];
                            log::debug!("card sent S-block with ifs={ifs}");
                            if ifs == 0 {
                                sdata =
                                    self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                                continue;
                            }
                            self.ifsc = usize::from(ifs);
                            let (block, _) =
                                self.build(PCB_S_BLOCK | S_RESPONSE | S_IFS, &[ifs]);
                            sdata = block;
                            retries = self.retries;
                            continue;
                        }

                        S_WTX => {
                            if rdata[LEN] != 1 {
                                let (block, _) = self.build(PCB_R_BLOCK | R_OTHER_ERROR, &[]);
                                sdata = block;
                                continue;
                            }
                            let wtx = rdata[DATA];
                            log::debug!("card sent S-block with wtx={wtx}");
                            self.wtx = wtx;
                            let (block, _) =
                                self.build(PCB_S_BLOCK | S_RESPONSE | S_WTX, &[wtx]);
                            sdata = block;
                            retries = self.retries;
                            continue;
                        }

                        other => {
                            log::error!("unknown S-block type 0x{other:02X}");
                            sdata = self.start_resync(&mut retries, &mut resyncs, parity_seen)?;
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Rules 6 and 6.4: enter the resynchronisation phase, or give up when
    /// the resync budget is exhausted.
    ///
    /// Returns the S(RESYNC request) block to send next, or the final error.
    fn start_resync(
        &mut self,
        retries: &mut u32,
        resyncs: &mut u32,
        parity_seen: bool,
    ) -> Result<Vec<u8>, T1Error> {
        if *resyncs == 0 {
            self.phase = Phase::Dead;
            return Err(if parity_seen { T1Error::Parity } else { T1Error::Fatal });
        }

        *resyncs -= 1;
        self.ns = 0;
        self.nr = 0;
        let (block, _) = self.build(PCB_S_BLOCK | S_RESYNC, &[]);
        self.phase = Phase::Resynching;
        self.more = false;
        *retries = 1;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted link: records every block the engine sends and replays a
    /// prepared list of card answers.
    struct FakeLink {
        sent: Vec<Vec<u8>>,
        answers: Vec<Result<Vec<u8>, LinkError>>,
    }

    impl FakeLink {
        fn new(answers: Vec<Result<Vec<u8>, LinkError>>) -> FakeLink {
            FakeLink {
                sent: Vec::new(),
                answers,
            }
        }
    }

    impl T1Link for FakeLink {
        fn exchange(&mut self, block: &[u8], _wtx: u8) -> Result<Vec<u8>, LinkError> {
            self.sent.push(block.to_vec());
            if self.answers.is_empty() {
                Err(LinkError::Fatal)
            } else {
                self.answers.remove(0)
            }
        }
    }

    fn i_block(ns: u8, more: bool, inf: &[u8]) -> Vec<u8> {
        let mut pcb = ns << 6;
        if more {
            pcb |= 0x20;
        }
        let mut b = vec![0x00, pcb, inf.len() as u8];
        b.extend_from_slice(inf);
        b.push(lrc(&b));
        b
    }

    fn r_block(nr: u8, error: u8) -> Vec<u8> {
        let mut b = vec![0x00, 0x80 | (nr << 4) | error, 0x00];
        b.push(lrc(&b));
        b
    }

    fn s_block(pcb: u8, inf: &[u8]) -> Vec<u8> {
        let mut b = vec![0x00, pcb, inf.len() as u8];
        b.extend_from_slice(inf);
        b.push(lrc(&b));
        b
    }

    #[test]
    fn classify_blocks() {
        assert_eq!(classify(0x00), BlockKind::I { seq: 0, more: false });
        assert_eq!(classify(0x60), BlockKind::I { seq: 1, more: true });
        assert_eq!(
            classify(0x91),
            BlockKind::R {
                seq: 1,
                error: 1,
                bit5: false
            }
        );
        assert_eq!(
            classify(0xC0),
            BlockKind::S {
                response: false,
                kind: 0
            }
        );
        assert_eq!(
            classify(0xE3),
            BlockKind::S {
                response: true,
                kind: 3
            }
        );
    }

    #[test]
    fn lrc_is_xor() {
        assert_eq!(lrc(&[0x00, 0x00, 0x02, 0x80, 0x00]), 0x82);
    }

    #[test]
    fn crc_is_stable() {
        // Self-check property: appending the big-endian CRC and recomputing
        // over the whole frame must verify.
        let mut block = vec![0x00, 0x00, 0x02, 0x12, 0x34];
        let crc = crc16(&block);
        block.extend_from_slice(&crc.to_be_bytes());
        assert!(verify_checksum(ChecksumKind::Crc, &block));
    }

    #[test]
    fn happy_path_single_block() {
        let apdu = [0x00, 0xA4, 0x04, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04];
        let response = [0x90, 0x00];
        let mut link = FakeLink::new(vec![Ok(i_block(0, false, &response))]);
        let mut t1 = T1State::new();

        let out = t1.transceive(&mut link, &apdu, 256).unwrap();
        assert_eq!(out, response);

        // One outbound I-block: 00 00 len apdu lrc
        assert_eq!(link.sent.len(), 1);
        let mut expect = vec![0x00, 0x00, apdu.len() as u8];
        expect.extend_from_slice(&apdu);
        expect.push(lrc(&expect));
        assert_eq!(link.sent[0], expect);

        // Both sequence bits toggled exactly once.
        assert_eq!(t1.ns(), 1);
        assert_eq!(t1.nr(), 1);
    }

    #[test]
    fn chained_response_is_concatenated() {
        let first: Vec<u8> = (0..32).collect();
        let second: Vec<u8> = (32..48).collect();
        let mut link = FakeLink::new(vec![
            Ok(i_block(0, true, &first)),
            Ok(i_block(1, false, &second)),
        ]);
        let mut t1 = T1State::new();

        let out = t1.transceive(&mut link, &[0x01, 0x02, 0x03, 0x04, 0x05], 256).unwrap();
        assert_eq!(out.len(), 48);
        assert_eq!(&out[..32], first.as_slice());
        assert_eq!(&out[32..], second.as_slice());

        // Between the two I-blocks the engine acknowledged with R(nr=1).
        assert_eq!(link.sent.len(), 2);
        assert_eq!(link.sent[1], r_block(1, 0));
    }

    #[test]
    fn chained_send_advances_on_r_ack() {
        // 40 bytes at IFSC 32: two chunks, the card acks the first with
        // R(ns ^ 1) then answers the second.
        let apdu: Vec<u8> = (0..40).collect();
        let mut link = FakeLink::new(vec![
            Ok(r_block(1, 0)),
            Ok(i_block(0, false, &[0x90, 0x00])),
        ]);
        let mut t1 = T1State::new();

        let out = t1.transceive(&mut link, &apdu, 256).unwrap();
        assert_eq!(out, vec![0x90, 0x00]);

        assert_eq!(link.sent.len(), 2);
        // First chunk: chained, 32 bytes, ns=0.
        assert_eq!(link.sent[0][1], 0x20);
        assert_eq!(link.sent[0][2], 32);
        // Second chunk: final 8 bytes, ns=1.
        assert_eq!(link.sent[1][1], 0x40);
        assert_eq!(link.sent[1][2], 8);
    }

    #[test]
    fn bad_edc_triggers_r_block_then_accepts_resend() {
        let good = i_block(0, false, &[0x61, 0x10]);
        let mut bad = good.clone();
        let lastpos = bad.len() - 1;
        bad[lastpos] ^= 0xFF;

        let mut link = FakeLink::new(vec![Ok(bad), Ok(good)]);
        let mut t1 = T1State::new();

        let out = t1.transceive(&mut link, &[0x00, 0xC0, 0x00, 0x00], 256).unwrap();
        assert_eq!(out, vec![0x61, 0x10]);

        assert_eq!(link.sent.len(), 2);
        // R(EDC error) with nr=0.
        assert_eq!(link.sent[1], r_block(0, 1));
    }

    #[test]
    fn parity_error_triggers_r_block() {
        let good = i_block(0, false, &[0x90, 0x00]);
        let mut link = FakeLink::new(vec![Err(LinkError::Parity), Ok(good)]);
        let mut t1 = T1State::new();

        let out = t1.transceive(&mut link, &[0x00, 0xB0, 0x00, 0x00], 256).unwrap();
        assert_eq!(out, vec![0x90, 0x00]);
        assert_eq!(link.sent[1], r_block(0, 1));
    }

    #[test]
    fn three_edc_errors_resync_then_recover() {
        let good = i_block(0, false, &[0x90, 0x00]);
        let mut bad = good.clone();
        let lastpos = bad.len() - 1;
        bad[lastpos] ^= 0xFF;

        let resync_ok = s_block(0xE0, &[]);
        let mut link = FakeLink::new(vec![
            Ok(bad.clone()),
            Ok(bad.clone()),
            Ok(bad),
            Ok(resync_ok),
            Ok(good),
        ]);
        let mut t1 = T1State::new();

        let out = t1.transceive(&mut link, &[0x00, 0xB0, 0x00, 0x00], 256).unwrap();
        assert_eq!(out, vec![0x90, 0x00]);

        // I, R, R, S(RESYNC request), I again
        assert_eq!(link.sent.len(), 5);
        assert_eq!(link.sent[3], s_block(0xC0, &[]));
        assert_eq!(link.sent[4][1] & 0xC0, 0x00);
        // Sequence numbers were reset before the retry.
        assert_eq!(link.sent[4][1] & 0x40, 0x00);
    }

    #[test]
    fn resync_budget_exhaustion_marks_dead() {
        // Card answers garbage forever: retries drain, then each resync
        // attempt drains, then the engine dies.
        let mut bad_answers = Vec::new();
        for _ in 0..32 {
            bad_answers.push(Ok(vec![0xFF, 0xFF, 0xFF, 0xFF]));
        }
        let mut link = FakeLink::new(bad_answers);
        let mut t1 = T1State::new();

        let err = t1.transceive(&mut link, &[0x00, 0xB0, 0x00, 0x00], 256).unwrap_err();
        assert_eq!(err, T1Error::Fatal);
        assert!(t1.is_dead());

        // Any further call fails immediately.
        let err = t1.transceive(&mut link, &[0x00], 256).unwrap_err();
        assert_eq!(err, T1Error::Dead);
    }

    #[test]
    fn parity_exhaustion_reports_parity() {
        let mut answers = Vec::new();
        for _ in 0..32 {
            answers.push(Err(LinkError::Parity));
        }
        let mut link = FakeLink::new(answers);
        let mut t1 = T1State::new();

        let err = t1.transceive(&mut link, &[0x00, 0xB0, 0x00, 0x00], 256).unwrap_err();
        assert_eq!(err, T1Error::Parity);
        assert!(t1.is_dead());
    }

    #[test]
    fn wtx_request_is_echoed_and_granted_once() {
        struct WtxLink {
            step: usize,
            seen_wtx: Vec<u8>,
        }
        impl T1Link for WtxLink {
            fn exchange(&mut self, block: &[u8], wtx: u8) -> Result<Vec<u8>, LinkError> {
                self.seen_wtx.push(wtx);
                self.step += 1;
                match self.step {
                    1 => Ok(s_block(0xC3, &[0x08])), // WTX request, x8
                    2 => {
                        // The engine must answer with a WTX response
                        // echoing the multiplier.
                        assert_eq!(block[1], 0xE3);
                        assert_eq!(block[3], 0x08);
                        Ok(i_block(0, false, &[0x90, 0x00]))
                    }
                    _ => Err(LinkError::Fatal),
                }
            }
        }

        let mut link = WtxLink {
            step: 0,
            seen_wtx: Vec::new(),
        };
        let mut t1 = T1State::new();
        let out = t1.transceive(&mut link, &[0x00, 0xB0, 0x00, 0x00], 256).unwrap();
        assert_eq!(out, vec![0x90, 0x00]);
        // The multiplier applies to the exchange after the request only.
        assert_eq!(link.seen_wtx, vec![0, 8]);
    }

    #[test]
    fn ifs_request_updates_ifsc() {
        let mut link = FakeLink::new(vec![
            Ok(s_block(0xC1, &[0x40])),
            Ok(i_block(0, false, &[0x90, 0x00])),
        ]);
        let mut t1 = T1State::new();
        t1.transceive(&mut link, &[0x00, 0xB0, 0x00, 0x00], 256).unwrap();
        assert_eq!(t1.ifsc, 0x40);
        // Response echoes the value.
        assert_eq!(link.sent[1], s_block(0xE1, &[0x40]));
    }

    #[test]
    fn abort_request_surfaces_error() {
        let mut link = FakeLink::new(vec![
            Ok(s_block(0xC2, &[])),
            Ok(i_block(0, false, &[0x90, 0x00])),
        ]);
        let mut t1 = T1State::new();
        let err = t1.transceive(&mut link, &[0x00, 0xB0, 0x00, 0x00], 256).unwrap_err();
        assert_eq!(err, T1Error::Aborted);
        // The abort was acknowledged with an S response first.
        assert_eq!(link.sent[1], s_block(0xE2, &[]));
    }

    #[test]
    fn overrun_is_fatal() {
        let mut link = FakeLink::new(vec![Ok(i_block(0, false, &[0u8; 32]))]);
        let mut t1 = T1State::new();
        let err = t1.transceive(&mut link, &[0x00, 0xB0, 0x00, 0x00], 16).unwrap_err();
        assert_eq!(err, T1Error::Overrun);
        assert!(t1.is_dead());
    }

    #[test]
    fn ifsd_negotiation_happy_path() {
        let mut link = FakeLink::new(vec![Ok(s_block(0xE1, &[254]))]);
        let mut t1 = T1State::new();
        t1.negotiate_ifsd(&mut link, 254).unwrap();
        assert_eq!(t1.ifsd, 254);
        assert_eq!(link.sent[0], s_block(0xC1, &[254]));
    }

    #[test]
    fn ifsd_negotiation_gives_up_after_retries() {
        let mut link = FakeLink::new(vec![
            Ok(s_block(0xE1, &[11])), // wrong echo
            Ok(s_block(0xE1, &[12])),
            Ok(s_block(0xE1, &[13])),
        ]);
        let mut t1 = T1State::new();
        assert!(t1.negotiate_ifsd(&mut link, 254).is_err());
        assert!(t1.is_dead());
    }

    #[test]
    fn prologue_carries_sequence_and_chaining() {
        let mut t1 = T1State::new();
        assert_eq!(t1.build_prologue(8), [0x00, 0x00, 0x08]);
        t1.toggle_sequences();
        assert_eq!(t1.build_prologue(8), [0x00, 0x40, 0x08]);
        // Longer than IFSC: chained.
        assert_eq!(t1.build_prologue(100), [0x00, 0x60, 0x20]);
    }
}
