//! ST 2110-40 ancillary-data sessions (RFC 8331).
//!
//! Ancillary payloads are streams of 10-bit words packed back to back:
//! DID, SDID and the data count carry parity in bits 8/9, user data
//! words follow, and a 9-bit checksum (bit 9 = complement of bit 8)
//! closes each ANC packet. One RTP packet per frame time carries all of
//! the frame's ANC packets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::streaming::dedup::{Dedup, DedupMode, SessionPort};
use crate::streaming::format::AncFormat;
use crate::streaming::net::{self, patch_ip_id, PacketView, RTP_OFFSET};
use crate::streaming::nic::TxPacket;
use crate::streaming::ptp::PtpClock;
use crate::streaming::ring::SharedRing;
use crate::streaming::rtp::{self, Rfc8331, RFC8331_HDR_SIZE};
use crate::streaming::send::{CLOCK_PRECISION_NS, SLEEP_STEP_NS, TPRS_SLOTS_ADVANCE};
use crate::streaming::session::{AncRxBuilder, AncTxBuilder, SessionShared};
use crate::streaming::{PktDrop, SnState};

/// One ancillary data packet (a DID/SDID payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncMeta {
    pub did: u8,
    pub sdid: u8,
    /// 8-bit user data words; parity is added on the wire.
    pub udw: Vec<u8>,
    pub line_number: u16,
    pub horizontal_offset: u16,
    pub stream_num: u8,
}

/// Ancillary producer: the ANC packets of the next frame.
pub trait AncProducer: Send {
    fn next_meta(&mut self) -> Option<Vec<AncMeta>>;
}

/// Ancillary consumer.
pub trait AncConsumer: Send {
    fn meta_recv(&mut self, metas: Vec<AncMeta>, tmstamp: u32);
}

// ---------------------------------------------------------------------------
// 10-bit word packing
// ---------------------------------------------------------------------------

/// Write the `idx`-th 10-bit word of a packed stream.
pub fn set_10b_word(data: &mut [u8], idx: usize, word: u16) {
    let bit = idx * 10;
    let byte = bit / 8;
    let phase = bit % 8;
    // the word spans two bytes, starting `phase` bits in
    let mut v = u16::from_be_bytes([data[byte], data[byte + 1]]);
    let shift = 6 - phase;
    let mask = 0x3ff << shift;
    v = (v & !mask) | ((word & 0x3ff) << shift);
    data[byte] = (v >> 8) as u8;
    data[byte + 1] = v as u8;
}

/// Read the `idx`-th 10-bit word of a packed stream.
pub fn get_10b_word(data: &[u8], idx: usize) -> u16 {
    let bit = idx * 10;
    let byte = bit / 8;
    let phase = bit % 8;
    let v = u16::from_be_bytes([data[byte], data[byte + 1]]);
    (v >> (6 - phase)) & 0x3ff
}

/// Add the parity bits to an 8-bit value: bit 8 = odd parity of the
/// data bits, bit 9 = its complement.
pub fn add_parity_bits(val: u8) -> u16 {
    let parity = (val.count_ones() & 1) as u16;
    let b8 = parity << 8;
    let b9 = (parity ^ 1) << 9;
    b9 | b8 | val as u16
}

/// Verify a 10-bit word carries consistent parity bits.
pub fn check_parity_bits(word: u16) -> bool {
    word == add_parity_bits(word as u8)
}

/// 9-bit checksum over the first `count` words with bit 9 set to the
/// complement of bit 8.
pub fn checksum_10b(data: &[u8], count: usize) -> u16 {
    let mut sum: u16 = 0;
    for i in 0..count {
        sum = sum.wrapping_add(get_10b_word(data, i));
    }
    sum &= 0x1ff;
    (!(sum << 1) & 0x200) | sum
}

/// Words needed for one ANC payload: DID + SDID + count + UDWs + checksum.
fn words_for(udw_len: usize) -> usize {
    3 + udw_len + 1
}

/// Bytes of a 10-bit stream of `words`, rounded up to 32-bit alignment.
fn padded_len(words: usize) -> usize {
    (words * 10).div_ceil(8).div_ceil(4) * 4
}

// ---------------------------------------------------------------------------
// Payload encode/decode
// ---------------------------------------------------------------------------

/// Encode the ANC packets into an RFC 8331 RTP payload.
pub fn encode_anc_payload(metas: &[AncMeta]) -> Vec<u8> {
    let mut out = Vec::new();
    for meta in metas {
        // packet header word: C | line (11) | offset (12) | S | stream
        let word: u32 = ((meta.line_number as u32 & 0x7ff) << 20)
            | ((meta.horizontal_offset as u32 & 0xfff) << 8)
            | (meta.stream_num as u32 & 0x7f);
        out.extend_from_slice(&word.to_be_bytes());

        let words = words_for(meta.udw.len());
        let mut body = vec![0u8; padded_len(words)];
        set_10b_word(&mut body, 0, add_parity_bits(meta.did));
        set_10b_word(&mut body, 1, add_parity_bits(meta.sdid));
        set_10b_word(&mut body, 2, add_parity_bits(meta.udw.len() as u8));
        for (i, &b) in meta.udw.iter().enumerate() {
            set_10b_word(&mut body, 3 + i, add_parity_bits(b));
        }
        let cks = checksum_10b(&body, 3 + meta.udw.len());
        set_10b_word(&mut body, 3 + meta.udw.len(), cks);
        out.extend_from_slice(&body);
    }
    out
}

/// Decode and verify an RFC 8331 payload of `count` ANC packets.
pub fn decode_anc_payload(payload: &[u8], count: u8) -> Result<Vec<AncMeta>, PktDrop> {
    let mut metas = Vec::with_capacity(count as usize);
    let mut off = 0usize;
    for _ in 0..count {
        if off + 4 > payload.len() {
            return Err(PktDrop::BadRtpLnLen);
        }
        let word = u32::from_be_bytes(payload[off..off + 4].try_into().unwrap());
        let line_number = ((word >> 20) & 0x7ff) as u16;
        let horizontal_offset = ((word >> 8) & 0xfff) as u16;
        let stream_num = (word & 0x7f) as u8;
        off += 4;

        // need at least DID/SDID/count to size the rest
        if off + 4 > payload.len() {
            return Err(PktDrop::BadRtpLnLen);
        }
        let body = &payload[off..];
        let did_w = get_10b_word(body, 0);
        let sdid_w = get_10b_word(body, 1);
        let count_w = get_10b_word(body, 2);
        if !check_parity_bits(did_w) || !check_parity_bits(sdid_w) || !check_parity_bits(count_w) {
            return Err(PktDrop::BadRtpHdr);
        }
        let udw_len = (count_w & 0xff) as usize;
        let words = words_for(udw_len);
        let body_len = padded_len(words);
        if off + body_len > payload.len() {
            return Err(PktDrop::BadRtpLnLen);
        }

        let expect = checksum_10b(body, 3 + udw_len);
        let got = get_10b_word(body, 3 + udw_len);
        if expect != got {
            return Err(PktDrop::BadRtpHdr);
        }

        let mut udw = Vec::with_capacity(udw_len);
        for i in 0..udw_len {
            let w = get_10b_word(body, 3 + i);
            if !check_parity_bits(w) {
                return Err(PktDrop::BadRtpHdr);
            }
            udw.push(w as u8);
        }
        metas.push(AncMeta {
            did: did_w as u8,
            sdid: sdid_w as u8,
            udw,
            line_number,
            horizontal_offset,
            stream_num,
        });
        off += body_len;
    }
    Ok(metas)
}

// ---------------------------------------------------------------------------
// TX
// ---------------------------------------------------------------------------

struct AncTxSession {
    shared: Arc<SessionShared>,
    fmt: AncFormat,
    flow: crate::streaming::net::Flow,
    producer: Box<dyn AncProducer>,
    sequence: u32,
    epochs: u64,
    ip_packet_id: u16,
    tprs: u32,
}

impl AncTxSession {
    fn from_builder(b: AncTxBuilder) -> Option<AncTxSession> {
        Some(AncTxSession {
            shared: b.shared,
            fmt: b.fmt,
            flow: b.flow?,
            producer: b.producer,
            sequence: 0,
            epochs: 0,
            ip_packet_id: 0,
            tprs: b.tprs,
        })
    }

    /// 90 kHz timestamp aligned to the frame epoch, ancillary flavour.
    fn get_frame_tmstamp(
        &mut self,
        clock: &PtpClock,
        first_waits: bool,
        nic_tx_time: u32,
        stop: &AtomicBool,
    ) -> (u32, u64) {
        let ntime = clock.now_ns();
        let frame_time = self.fmt.frame_time_ns;
        let epochs = ntime / frame_time;

        let mut same_epoch = false;
        let mut one_late = false;
        if self.epochs == 0 {
            self.epochs = epochs;
        } else {
            match epochs as i64 - self.epochs as i64 {
                0 => same_epoch = true,
                1 => {
                    one_late = true;
                    self.epochs += 1;
                }
                _ => self.epochs = epochs,
            }
        }

        let advance = nic_tx_time as u64 + TPRS_SLOTS_ADVANCE as u64 * self.tprs as u64;
        let mut to_elapse: i64 = 0;
        if same_epoch && !one_late {
            self.epochs += 1;
            to_elapse = (self.epochs * frame_time) as i64 - ntime as i64 - advance as i64;
        }
        let tmstamp = (self.epochs as f64 * self.fmt.frame_ticks_90k()) as u64;
        let tx_time = (self.epochs * frame_time).saturating_sub(advance);

        if first_waits && to_elapse > 2 * CLOCK_PRECISION_NS as i64 {
            to_elapse -= CLOCK_PRECISION_NS as i64;
            let step = if to_elapse > 10 * CLOCK_PRECISION_NS as i64 {
                SLEEP_STEP_NS
            } else {
                CLOCK_PRECISION_NS / 2
            };
            while !stop.load(Ordering::Acquire) {
                thread::sleep(Duration::from_nanos(step));
                let elapsed = clock.now_ns().saturating_sub(ntime);
                if elapsed as i64 + CLOCK_PRECISION_NS as i64 > to_elapse {
                    break;
                }
            }
        }
        (tmstamp as u32, tx_time)
    }

    /// One RTP packet carrying this frame's ANC packets.
    fn build_packet(&mut self, tmstamp: u32, tx_time: u64) -> Option<TxPacket> {
        let metas = match self.producer.next_meta() {
            Some(m) => m,
            None => {
                self.shared.state.store(SnState::NoNextFrame);
                return None;
            }
        };
        let payload = encode_anc_payload(&metas);
        let pkt_size = (RTP_OFFSET + RFC8331_HDR_SIZE + payload.len()) as u16;

        let mut head = vec![0u8; pkt_size as usize];
        net::render_headers(&mut head, &self.flow, pkt_size);
        Rfc8331 {
            rtp: rtp::RtpHeader {
                // every packet closes a frame's worth of metadata
                marker: true,
                payload_type: rtp::PAYLOAD_TYPE_ANCILLARY,
                seq_number: self.sequence as u16,
                tmstamp,
                ssrc: self.shared.ssrc,
            },
            seq_ext: (self.sequence >> 16) as u16,
            length: payload.len() as u16,
            anc_count: metas.len() as u8,
            f: 0,
        }
        .encode(&mut head[RTP_OFFSET..]);
        head[RTP_OFFSET + RFC8331_HDR_SIZE..].copy_from_slice(&payload);
        patch_ip_id(&mut head, self.ip_packet_id);
        self.ip_packet_id = self.ip_packet_id.wrapping_add(1);
        self.sequence = self.sequence.wrapping_add(1);

        self.shared.stats.pkts_send.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.frms_send.fetch_add(1, Ordering::Relaxed);
        Some(TxPacket {
            head,
            ext: None,
            tx_time,
        })
    }
}

/// The ancillary enqueue thread: one packet per session per frame time.
pub fn anc_tx_loop(
    builders: Vec<AncTxBuilder>,
    ring: Arc<SharedRing>,
    clock: Arc<PtpClock>,
    stop: Arc<AtomicBool>,
    nic_tx_time: u32,
) {
    let mut sessions: Vec<AncTxSession> = builders
        .into_iter()
        .filter_map(AncTxSession::from_builder)
        .collect();
    for s in &sessions {
        s.shared.state.store(SnState::Run);
    }
    info!("ancillary transmitter: {} session(s)", sessions.len());

    while !stop.load(Ordering::Acquire) {
        let mut first = true;
        for s in sessions.iter_mut() {
            if s.shared.state.load() != SnState::Run {
                continue;
            }
            let (tmstamp, tx_time) = s.get_frame_tmstamp(&clock, first, nic_tx_time, &stop);
            first = false;
            if let Some(pkt) = s.build_packet(tmstamp, tx_time) {
                if ring.push(pkt).is_err() {
                    debug!("anc session {}: shared ring full", s.shared.timeslot);
                }
            }
        }
        if sessions.iter().all(|s| s.shared.state.load() != SnState::Run) {
            thread::sleep(Duration::from_millis(5));
        }
    }
}

// ---------------------------------------------------------------------------
// RX
// ---------------------------------------------------------------------------

pub struct AncRxSession {
    pub shared: Arc<SessionShared>,
    pub fmt: AncFormat,
    pub dst_ports: Vec<u16>,
    consumer: Box<dyn AncConsumer>,
    dedup: Dedup,
}

impl AncRxSession {
    pub fn from_builder(b: AncRxBuilder) -> AncRxSession {
        let ports = if b.redundant { 2 } else { 1 };
        b.shared.state.store(SnState::Run);
        let dst_ports = b.flows.iter().map(|f| f.dst_port).collect();
        AncRxSession {
            dedup: Dedup::new(DedupMode::TimestampAndSeq, ports, b.shared.timeslot),
            dst_ports,
            consumer: b.consumer,
            fmt: b.fmt,
            shared: b.shared,
        }
    }

    pub fn on_packet(&mut self, view: &PacketView, port: SessionPort, _pkt_time: u64) {
        if let Err(reason) = self.process(view, port) {
            self.shared.stats.drop_pkt(reason);
        }
    }

    fn process(&mut self, view: &PacketView, port: SessionPort) -> Result<(), PktDrop> {
        let rtp_bytes = view.rtp();
        let hdr = Rfc8331::decode(rtp_bytes).map_err(|_| PktDrop::BadRtpHdr)?;
        if rtp::RtpHeader::csrc_count(rtp_bytes) != 0
            || hdr.rtp.payload_type != rtp::PAYLOAD_TYPE_ANCILLARY
        {
            return Err(PktDrop::BadRtpHdr);
        }
        if hdr.rtp.tmstamp == 0 {
            return Err(PktDrop::BadRtpTmstamp);
        }

        // ancillary dedups on both timestamp and sequence so late
        // gap-fills from the twin path still land
        let check = self
            .dedup
            .check(hdr.rtp.seq_number, hdr.rtp.tmstamp, port);
        if check.drop {
            return Err(PktDrop::RedundantPath);
        }

        let payload = &rtp_bytes[RFC8331_HDR_SIZE..];
        let metas = decode_anc_payload(payload, hdr.anc_count)?;
        self.shared.stats.pkts_recv.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.frms_recv.fetch_add(1, Ordering::Relaxed);
        self.consumer.meta_recv(metas, hdr.rtp.tmstamp);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::net::{render_headers, Flow};
    use crate::streaming::session::FlowRule;
    use crate::streaming::{AtomicSnState, Direction, Essence, SessionStats};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[test]
    fn test_10b_word_phases() {
        let mut buf = vec![0u8; 10];
        // four words cover every phase
        let words = [0x3ff, 0x155, 0x2aa, 0x0a5];
        for (i, &w) in words.iter().enumerate() {
            set_10b_word(&mut buf, i, w);
        }
        for (i, &w) in words.iter().enumerate() {
            assert_eq!(get_10b_word(&buf, i), w, "word {i}");
        }
    }

    #[test]
    fn test_parity_bits() {
        // even population: bit 9 set
        assert_eq!(add_parity_bits(0x00), 0x200);
        assert_eq!(add_parity_bits(0x03), 0x203);
        // odd population: bit 8 set
        assert_eq!(add_parity_bits(0x01), 0x101);
        assert!(check_parity_bits(0x101));
        assert!(!check_parity_bits(0x301));
        assert!(!check_parity_bits(0x001));
    }

    #[test]
    fn test_checksum_bit9_is_complement() {
        let mut buf = vec![0u8; 16];
        set_10b_word(&mut buf, 0, add_parity_bits(0x61));
        set_10b_word(&mut buf, 1, add_parity_bits(0x02));
        set_10b_word(&mut buf, 2, add_parity_bits(0x01));
        set_10b_word(&mut buf, 3, add_parity_bits(0x42));
        let cks = checksum_10b(&buf, 4);
        let b8 = (cks >> 8) & 1;
        let b9 = (cks >> 9) & 1;
        assert_eq!(b9, b8 ^ 1);
    }

    #[test]
    fn test_payload_roundtrip() {
        let metas = vec![
            AncMeta {
                did: 0x61,
                sdid: 0x02,
                udw: vec![0x08, 0x0c, 0x10, 0xff],
                line_number: 9,
                horizontal_offset: 0,
                stream_num: 0,
            },
            AncMeta {
                did: 0x41,
                sdid: 0x07,
                udw: vec![],
                line_number: 571,
                horizontal_offset: 100,
                stream_num: 3,
            },
        ];
        let payload = encode_anc_payload(&metas);
        let back = decode_anc_payload(&payload, 2).unwrap();
        assert_eq!(back, metas);
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let metas = vec![AncMeta {
            did: 0x61,
            sdid: 0x02,
            udw: vec![1, 2, 3],
            line_number: 0,
            horizontal_offset: 0,
            stream_num: 0,
        }];
        let mut payload = encode_anc_payload(&metas);
        let last = payload.len() - 1;
        payload[last] ^= 0xff;
        assert!(decode_anc_payload(&payload, 1).is_err());
    }

    fn shared() -> Arc<SessionShared> {
        Arc::new(SessionShared {
            timeslot: 0,
            essence: Essence::Ancillary,
            direction: Direction::Consumer,
            ssrc: 0x66,
            state: AtomicSnState::new(SnState::On),
            stats: SessionStats::default(),
        })
    }

    #[derive(Default)]
    struct Sink {
        recv: Vec<(Vec<AncMeta>, u32)>,
    }
    struct SinkConsumer(Arc<Mutex<Sink>>);
    impl AncConsumer for SinkConsumer {
        fn meta_recv(&mut self, metas: Vec<AncMeta>, tmstamp: u32) {
            self.0.lock().unwrap().recv.push((metas, tmstamp));
        }
    }

    fn rx_session() -> (AncRxSession, Arc<Mutex<Sink>>) {
        let sink = Arc::new(Mutex::new(Sink::default()));
        let b = AncRxBuilder {
            shared: shared(),
            fmt: AncFormat::new(crate::streaming::format::FrameRate::P29_97),
            flows: vec![FlowRule {
                queue: 0,
                src_ip: Ipv4Addr::new(192, 168, 0, 1),
                dst_ip: Ipv4Addr::new(192, 168, 0, 2),
                src_port: 30000,
                dst_port: 30000,
                src_ip_masked: false,
                ip_proto_masked: false,
            }],
            consumer: Box::new(SinkConsumer(sink.clone())),
            redundant: true,
        };
        (AncRxSession::from_builder(b), sink)
    }

    fn anc_packet(seq: u16, tmstamp: u32) -> Vec<u8> {
        let metas = vec![AncMeta {
            did: 0x61,
            sdid: 0x01,
            udw: vec![seq as u8],
            line_number: 9,
            horizontal_offset: 0,
            stream_num: 0,
        }];
        let payload = encode_anc_payload(&metas);
        let pkt_len = RTP_OFFSET + RFC8331_HDR_SIZE + payload.len();
        let mut frame = vec![0u8; pkt_len];
        let flow = Flow {
            src_ip: Ipv4Addr::new(192, 168, 0, 1),
            dst_ip: Ipv4Addr::new(192, 168, 0, 2),
            src_port: 30000,
            dst_port: 30000,
            src_mac: [2, 0, 0, 0, 0, 1],
            dst_mac: [2, 0, 0, 0, 0, 2],
            dscp: 0,
            ecn: 0,
            vlan: None,
        };
        render_headers(&mut frame, &flow, pkt_len as u16);
        Rfc8331 {
            rtp: rtp::RtpHeader {
                marker: true,
                payload_type: rtp::PAYLOAD_TYPE_ANCILLARY,
                seq_number: seq,
                tmstamp,
                ssrc: 0x66,
            },
            seq_ext: 0,
            length: payload.len() as u16,
            anc_count: 1,
            f: 0,
        }
        .encode(&mut frame[RTP_OFFSET..]);
        frame[RTP_OFFSET + RFC8331_HDR_SIZE..].copy_from_slice(&payload);
        frame
    }

    fn feed(s: &mut AncRxSession, frame: &[u8], port: SessionPort) {
        let view = PacketView::new(frame).unwrap();
        s.on_packet(&view, port, 0);
    }

    // Scenario 5: ports deliver [10,11,13] and [10,12,13]; after the
    // merge-sort dedup the handler sees each of 10..13 exactly once.
    #[test]
    fn test_gap_fill_across_paths() {
        let (mut s, sink) = rx_session();
        let t = |seq: u16| 3003 * (seq as u32 - 9);
        let primary: Vec<Vec<u8>> =
            vec![anc_packet(10, t(10)), anc_packet(11, t(11)), anc_packet(13, t(13))];
        let redundant: Vec<Vec<u8>> =
            vec![anc_packet(10, t(10)), anc_packet(12, t(12)), anc_packet(13, t(13))];
        crate::streaming::dedup::merge_bursts(
            primary,
            redundant,
            |f| {
                rtp::RtpHeader::decode(&f[RTP_OFFSET..])
                    .map(|h| h.seq_number)
                    .unwrap()
            },
            |frame, port| feed(&mut s, &frame, port),
        );
        let sink = sink.lock().unwrap();
        let seqs: Vec<u8> = sink.recv.iter().map(|(m, _)| m[0].udw[0]).collect();
        assert_eq!(seqs, vec![10, 11, 12, 13]);
        assert_eq!(s.shared.stats.pkts_dropped(PktDrop::RedundantPath), 2);
    }

    #[test]
    fn test_frames_counted_per_packet() {
        let (mut s, _) = rx_session();
        feed(&mut s, &anc_packet(1, 3003), SessionPort::Primary);
        feed(&mut s, &anc_packet(2, 6006), SessionPort::Primary);
        assert_eq!(s.shared.stats.frms_recv.load(Ordering::Relaxed), 2);
    }
}
