//! ST 2022-7 dual-path deduplication for audio and ancillary sessions.
//!
//! Video dedups per-frame via the fragment histogram; the sample-based
//! essences instead track the last 64 sequence numbers in a sliding
//! bitmap. A late packet from the redundant path whose sequence is
//! behind the high-water mark but whose bitmap bit is clear is a
//! gap-fill, not a duplicate. After a stream reset every packet looks
//! redundant; once every active port has rejected
//! [`SESSION_REDUNDANT_ERROR_THRESHOLD`] packets in a row the next one
//! is force-accepted to break the deadlock.

use crate::streaming::rtp::{seq16_gt, tmstamp_gt};
use crate::streaming::SESSION_REDUNDANT_ERROR_THRESHOLD;
use tracing::warn;

/// Width of the received-sequence bitmap.
pub const DEDUP_BITMAP_BITS: u16 = 64;

/// Which port of a redundant pair a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SessionPort {
    Primary = 0,
    Redundant = 1,
}

pub const SESSION_PORT_MAX: usize = 2;

/// How the dedup decides a packet is redundant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMode {
    /// Audio: drop when the timestamp is not strictly advancing.
    Timestamp,
    /// Ancillary: both timestamp and sequence must advance.
    TimestampAndSeq,
}

/// Outcome of one dedup check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupResult {
    /// Drop this packet (redundant).
    pub drop: bool,
    /// The per-port sequence was non-continuous.
    pub port_seq_discontinuity: bool,
    /// The session-level sequence was non-continuous (accepted packets
    /// only).
    pub session_seq_discontinuity: bool,
    /// The redundant threshold was reached and the packet force-accepted.
    pub threshold_override: bool,
}

/// Dedup state, embedded in each audio/ancillary session.
pub struct Dedup {
    mode: DedupMode,
    num_ports: usize,
    idx: u32,

    latest_seq_id: [Option<u16>; SESSION_PORT_MAX],
    session_seq_id: Option<u16>,
    tmstamp: Option<u32>,

    redundant_error_cnt: [u32; SESSION_PORT_MAX],

    recv_bitmap: u64,
    bitmap_base: u16,
}

impl Dedup {
    pub fn new(mode: DedupMode, num_ports: usize, idx: u32) -> Dedup {
        Dedup {
            mode,
            num_ports,
            idx,
            latest_seq_id: [None; SESSION_PORT_MAX],
            session_seq_id: None,
            tmstamp: None,
            redundant_error_cnt: [0; SESSION_PORT_MAX],
            recv_bitmap: 0,
            bitmap_base: 0,
        }
    }

    /// Forget everything (stream reset).
    pub fn reset(&mut self) {
        self.latest_seq_id = [None; SESSION_PORT_MAX];
        self.session_seq_id = None;
        self.tmstamp = None;
        self.redundant_error_cnt = [0; SESSION_PORT_MAX];
        self.recv_bitmap = 0;
        self.bitmap_base = 0;
    }

    pub fn recv_bitmap(&self) -> u64 {
        self.recv_bitmap
    }

    pub fn bitmap_base(&self) -> u16 {
        self.bitmap_base
    }

    /// Slide the window so `seq` fits, then set its bit.
    fn bitmap_mark(&mut self, seq: u16) {
        let mut offset = seq.wrapping_sub(self.bitmap_base);
        if offset >= DEDUP_BITMAP_BITS {
            let shift = offset - (DEDUP_BITMAP_BITS - 1);
            if shift >= DEDUP_BITMAP_BITS {
                self.recv_bitmap = 0;
            } else {
                self.recv_bitmap >>= shift;
            }
            self.bitmap_base = self.bitmap_base.wrapping_add(shift);
            offset = seq.wrapping_sub(self.bitmap_base);
        }
        self.recv_bitmap |= 1u64 << offset;
    }

    /// Was `seq` already received? Sequences that fell off the tail are
    /// too old to tell apart and count as received.
    fn bitmap_test(&self, seq: u16) -> bool {
        let offset = seq.wrapping_sub(self.bitmap_base);
        if offset & 0x8000 != 0 {
            return true; // behind the window
        }
        if offset >= DEDUP_BITMAP_BITS {
            return false; // ahead of the window
        }
        self.recv_bitmap & (1u64 << offset) != 0
    }

    /// Core check, called for every header-validated packet.
    pub fn check(&mut self, seq_id: u16, tmstamp: u32, port: SessionPort) -> DedupResult {
        let mut r = DedupResult::default();

        // first-packet initialisation: pretend the previous one existed
        if self.latest_seq_id[port as usize].is_none() {
            self.latest_seq_id[port as usize] = Some(seq_id.wrapping_sub(1));
        }
        if self.session_seq_id.is_none() {
            self.session_seq_id = Some(seq_id.wrapping_sub(1));
        }
        if self.tmstamp.is_none() {
            self.tmstamp = Some(tmstamp.wrapping_sub(1));
        }

        // per-port sequence continuity
        let latest = self.latest_seq_id[port as usize].unwrap();
        if seq_id != latest.wrapping_add(1) {
            r.port_seq_discontinuity = true;
        }
        self.latest_seq_id[port as usize] = Some(seq_id);

        // redundancy check
        let session_seq = self.session_seq_id.unwrap();
        let session_tmstamp = self.tmstamp.unwrap();
        let is_redundant = match self.mode {
            DedupMode::TimestampAndSeq => {
                if tmstamp_gt(session_tmstamp, tmstamp) {
                    // older timestamp than anything seen - the bitmap still
                    // knows whether this exact sequence arrived
                    self.bitmap_test(seq_id)
                } else if !seq16_gt(seq_id, session_seq) {
                    self.bitmap_test(seq_id)
                } else {
                    false
                }
            }
            DedupMode::Timestamp => !tmstamp_gt(tmstamp, session_tmstamp),
        };

        if is_redundant {
            self.redundant_error_cnt[port as usize] += 1;

            let all_exceeded = (0..self.num_ports)
                .all(|p| self.redundant_error_cnt[p] >= SESSION_REDUNDANT_ERROR_THRESHOLD);
            if !all_exceeded {
                r.drop = true;
                return r;
            }

            r.threshold_override = true;
            warn!(
                "dedup({}): redundant threshold reached, accept seq {} (old {}) ts {} (old {})",
                self.idx, seq_id, session_seq, tmstamp, session_tmstamp
            );
        }

        self.redundant_error_cnt[port as usize] = 0;

        // session-level continuity, accepted packets only
        if seq_id != session_seq.wrapping_add(1) {
            r.session_seq_discontinuity = true;
        }

        match self.mode {
            DedupMode::TimestampAndSeq => {
                self.bitmap_mark(seq_id);
                // only advance the high-water marks; gap-fills must not
                // regress them
                if seq16_gt(seq_id, session_seq) {
                    self.session_seq_id = Some(seq_id);
                }
                if tmstamp_gt(tmstamp, session_tmstamp) {
                    self.tmstamp = Some(tmstamp);
                }
            }
            DedupMode::Timestamp => {
                self.session_seq_id = Some(seq_id);
                self.tmstamp = Some(tmstamp);
            }
        }

        r
    }
}

// ---------------------------------------------------------------------------
// Merge-sort burst helper
// ---------------------------------------------------------------------------

/// Feed two per-port bursts into `handler` in RTP sequence order so
/// gap-fill packets from the redundant path are processed before later
/// primary packets advance the session high-water mark. `seq_of` pulls
/// the sequence number out of a packet.
pub fn merge_bursts<P, F, S>(primary: Vec<P>, redundant: Vec<P>, seq_of: S, mut handler: F)
where
    F: FnMut(P, SessionPort),
    S: Fn(&P) -> u16,
{
    if redundant.is_empty() {
        for p in primary {
            handler(p, SessionPort::Primary);
        }
        return;
    }
    if primary.is_empty() {
        for p in redundant {
            handler(p, SessionPort::Redundant);
        }
        return;
    }

    let mut pi = primary.into_iter().peekable();
    let mut ri = redundant.into_iter().peekable();

    loop {
        match (pi.peek(), ri.peek()) {
            (Some(p), Some(r)) => {
                let sp = seq_of(p);
                let sr = seq_of(r);
                if sp == sr {
                    // same sequence - process both, dedup keeps the first
                    handler(pi.next().unwrap(), SessionPort::Primary);
                    handler(ri.next().unwrap(), SessionPort::Redundant);
                } else if seq16_gt(sr, sp) {
                    handler(pi.next().unwrap(), SessionPort::Primary);
                } else {
                    handler(ri.next().unwrap(), SessionPort::Redundant);
                }
            }
            (Some(_), None) => handler(pi.next().unwrap(), SessionPort::Primary),
            (None, Some(_)) => handler(ri.next().unwrap(), SessionPort::Redundant),
            (None, None) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
