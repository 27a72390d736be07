//! ST 2110-30 PCM audio sessions.
//!
//! Audio runs on a 1 ms packet cadence: every epoch carries one packet
//! of `sample_grp_count` sample groups, timestamped in the 48 kHz
//! domain as `epochs x sample_grp_count`. The receive side is a plain
//! ring over the application buffer with ST 2022-7 timestamp dedup in
//! front of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::streaming::dedup::{Dedup, DedupMode, SessionPort};
use crate::streaming::format::AudioFormat;
use crate::streaming::net::{patch_ip_id, PacketView, RTP_OFFSET};
use crate::streaming::nic::{PayloadRef, TxPacket};
use crate::streaming::ptp::PtpClock;
use crate::streaming::ring::SharedRing;
use crate::streaming::rtp;
use crate::streaming::send::{CLOCK_PRECISION_NS, SLEEP_STEP_NS};
use crate::streaming::session::{AudioRxBuilder, AudioTxBuilder, SessionShared};
use crate::streaming::{AudioConsumer, AudioProducer, FrameBuf, PktDrop, SnState};

// ---------------------------------------------------------------------------
// TX
// ---------------------------------------------------------------------------

struct AudioTxSession {
    shared: Arc<SessionShared>,
    fmt: AudioFormat,
    hdr_print: Vec<u8>,
    producer: Box<dyn AudioProducer>,
    buf: Option<Arc<FrameBuf>>,
    buf_offset: u32,
    sequence: u16,
    epochs: u64,
    ip_packet_id: u16,
}

impl AudioTxSession {
    fn from_builder(b: AudioTxBuilder) -> AudioTxSession {
        AudioTxSession {
            shared: b.shared,
            fmt: b.fmt,
            hdr_print: b.hdr_print,
            producer: b.producer,
            buf: None,
            buf_offset: 0,
            sequence: 0,
            epochs: 0,
            ip_packet_id: 0,
        }
    }

    /// 48 kHz timestamp aligned to the 1 ms epoch; returns the launch
    /// time as well. Sleeps out the epoch when `first_waits`.
    fn get_packet_tmstamp(
        &mut self,
        clock: &PtpClock,
        first_waits: bool,
        nic_tx_time: u32,
        stop: &AtomicBool,
    ) -> (u32, u64) {
        let ntime = clock.now_ns();
        let epoch_time = self.fmt.epoch_time_ns;
        let epochs = ntime / epoch_time;

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

        let advance = nic_tx_time as u64;
        let mut to_elapse: i64 = 0;
        if !(one_late || !same_epoch) {
            self.epochs += 1;
            to_elapse = (self.epochs * epoch_time) as i64 - ntime as i64 - advance as i64;
        }
        let tmstamp48k = self.epochs * self.fmt.sample_grp_count as u64;
        let tx_time = (self.epochs * epoch_time).saturating_sub(advance);

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

        (tmstamp48k as u32, tx_time)
    }

    /// Build the epoch's packet: header patch plus a zero-copy slice of
    /// the producer buffer. Returns None when the producer ran dry.
    fn build_packet(&mut self, tmstamp: u32, tx_time: u64) -> Option<TxPacket> {
        let payload = self.fmt.payload_size();
        if self.buf.is_none() {
            self.buf = self.producer.next_buffer(None);
            self.buf_offset = 0;
        }
        let buf = self.buf.clone()?;
        if self.buf_offset + payload > buf.len() as u32 {
            // ragged tail: buffers must hold whole packets
            self.buf_offset = 0;
        }

        let mut head = self.hdr_print.clone();
        let rtp_hdr = &mut head[RTP_OFFSET..];
        rtp_hdr[rtp::OFF_SEQ..rtp::OFF_SEQ + 2].copy_from_slice(&self.sequence.to_be_bytes());
        rtp::patch_tmstamp(rtp_hdr, tmstamp);
        patch_ip_id(&mut head, self.ip_packet_id);
        self.ip_packet_id = self.ip_packet_id.wrapping_add(1);

        let ext = PayloadRef {
            frame: buf.clone(),
            offset: self.buf_offset,
            len: payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.buf_offset += payload;
        if self.buf_offset >= buf.len() as u32 {
            let prev = self.buf.take();
            self.buf = self.producer.next_buffer(prev);
            self.buf_offset = 0;
            if self.buf.is_none() {
                self.shared.state.store(SnState::NoNextFrame);
            }
        }

        self.shared.stats.pkts_send.fetch_add(1, Ordering::Relaxed);
        Some(TxPacket {
            head,
            ext: Some(ext),
            tx_time,
        })
    }
}

/// The audio enqueue thread: one packet per session per 1 ms epoch,
/// delivered through the shared control ring.
pub fn audio_tx_loop(
    builders: Vec<AudioTxBuilder>,
    ring: Arc<SharedRing>,
    clock: Arc<PtpClock>,
    stop: Arc<AtomicBool>,
    nic_tx_time: u32,
) {
    let mut sessions: Vec<AudioTxSession> =
        builders.into_iter().map(AudioTxSession::from_builder).collect();
    for s in &sessions {
        s.shared.state.store(SnState::Run);
    }
    info!("audio transmitter: {} session(s)", sessions.len());

    while !stop.load(Ordering::Acquire) {
        let mut first = true;
        for s in sessions.iter_mut() {
            if s.shared.state.load() != SnState::Run {
                continue;
            }
            let (tmstamp, tx_time) = s.get_packet_tmstamp(&clock, first, nic_tx_time, &stop);
            first = false;
            if let Some(pkt) = s.build_packet(tmstamp, tx_time) {
                if ring.push(pkt).is_err() {
                    debug!("audio session {}: shared ring full", s.shared.timeslot);
                }
            }
        }
        if sessions.iter().all(|s| s.shared.state.load() != SnState::Run) {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

// ---------------------------------------------------------------------------
// RX
// ---------------------------------------------------------------------------

pub struct AudioRxSession {
    pub shared: Arc<SessionShared>,
    pub fmt: AudioFormat,
    pub dst_ports: Vec<u16>,
    consumer: Box<dyn AudioConsumer>,
    dedup: Dedup,
    buf: Vec<u8>,
    buf_offset: u32,
    tmstamp: u32,
    pub wraps: u64,
}

impl AudioRxSession {
    pub fn from_builder(b: AudioRxBuilder) -> AudioRxSession {
        let ports = if b.redundant { 2 } else { 1 };
        b.shared.state.store(SnState::Run);
        let dst_ports = b.flows.iter().map(|f| f.dst_port).collect();
        AudioRxSession {
            dedup: Dedup::new(DedupMode::Timestamp, ports, b.shared.timeslot),
            buf: vec![0u8; b.buf_size as usize],
            buf_offset: 0,
            tmstamp: 0,
            wraps: 0,
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
        let hdr = rtp::RtpHeader::decode(rtp_bytes).map_err(|_| PktDrop::BadRtpHdr)?;
        if rtp::RtpHeader::csrc_count(rtp_bytes) != 0
            || hdr.payload_type != rtp::PAYLOAD_TYPE_AUDIO
        {
            return Err(PktDrop::BadRtpHdr);
        }
        if hdr.tmstamp == 0 {
            return Err(PktDrop::BadRtpTmstamp);
        }
        let payload = &rtp_bytes[rtp::RTP_HDR_SIZE..];
        let payload_size = self.fmt.payload_size() as usize;
        if payload.len() < payload_size {
            return Err(PktDrop::BadUdpLen);
        }

        // the redundant twin carries the same timestamp: dedup on it
        let check = self.dedup.check(hdr.seq_number, hdr.tmstamp, port);
        if check.drop {
            return Err(PktDrop::RedundantPath);
        }
        if check.session_seq_discontinuity {
            debug!(
                "audio session {}: sequence gap at {}",
                self.shared.timeslot, hdr.seq_number
            );
        }

        self.tmstamp = hdr.tmstamp;
        let off = self.buf_offset as usize;
        self.buf[off..off + payload_size].copy_from_slice(&payload[..payload_size]);
        self.shared.stats.pkts_recv.fetch_add(1, Ordering::Relaxed);

        self.consumer
            .sample_recv(&self.buf, self.buf_offset, hdr.tmstamp);
        self.buf_offset += payload_size as u32;
        if self.buf_offset >= self.buf.len() as u32 {
            self.consumer.buffer_done(&self.buf);
            self.buf_offset = 0;
            self.wraps += 1;
        }
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
    use crate::streaming::{
        AtomicSnState, Direction, Essence, SessionStats,
    };
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    fn fmt() -> AudioFormat {
        AudioFormat::new(8, 3) // 24 B groups, 1152 B payload
    }

    fn shared() -> Arc<SessionShared> {
        Arc::new(SessionShared {
            timeslot: 0,
            essence: Essence::Audio,
            direction: Direction::Consumer,
            ssrc: 0x55,
            state: AtomicSnState::new(SnState::On),
            stats: SessionStats::default(),
        })
    }

    fn flow_rule(dst_port: u16) -> FlowRule {
        FlowRule {
            queue: 0,
            src_ip: Ipv4Addr::new(192, 168, 0, 1),
            dst_ip: Ipv4Addr::new(192, 168, 0, 2),
            src_port: 20000,
            dst_port,
            src_ip_masked: false,
            ip_proto_masked: false,
        }
    }

    #[derive(Default)]
    struct Sink {
        samples: Vec<(u32, u32)>,
        done: u32,
    }

    struct SinkConsumer(Arc<Mutex<Sink>>);
    impl AudioConsumer for SinkConsumer {
        fn sample_recv(&mut self, _buf: &[u8], buf_offset: u32, tmstamp: u32) {
            self.0.lock().unwrap().samples.push((buf_offset, tmstamp));
        }
        fn buffer_done(&mut self, _buf: &[u8]) {
            self.0.lock().unwrap().done += 1;
        }
    }

    fn rx_session(buf_size: u32, redundant: bool) -> (AudioRxSession, Arc<Mutex<Sink>>) {
        let sink = Arc::new(Mutex::new(Sink::default()));
        let builder = AudioRxBuilder {
            shared: shared(),
            fmt: fmt(),
            flows: vec![flow_rule(20000)],
            consumer: Box::new(SinkConsumer(sink.clone())),
            buf_size,
            redundant,
        };
        (AudioRxSession::from_builder(builder), sink)
    }

    fn audio_packet(seq: u16, tmstamp: u32, fill: u8) -> Vec<u8> {
        let f = fmt();
        let pkt_len = RTP_OFFSET + rtp::RTP_HDR_SIZE + f.payload_size() as usize;
        let mut frame = vec![0u8; pkt_len];
        let flow = Flow {
            src_ip: Ipv4Addr::new(192, 168, 0, 1),
            dst_ip: Ipv4Addr::new(192, 168, 0, 2),
            src_port: 20000,
            dst_port: 20000,
            src_mac: [2, 0, 0, 0, 0, 1],
            dst_mac: [2, 0, 0, 0, 0, 2],
            dscp: 0,
            ecn: 0,
            vlan: None,
        };
        render_headers(&mut frame, &flow, pkt_len as u16);
        rtp::RtpHeader {
            marker: false,
            payload_type: rtp::PAYLOAD_TYPE_AUDIO,
            seq_number: seq,
            tmstamp,
            ssrc: 0x55,
        }
        .encode(&mut frame[RTP_OFFSET..]);
        frame[RTP_OFFSET + rtp::RTP_HDR_SIZE..].fill(fill);
        frame
    }

    fn feed(s: &mut AudioRxSession, frame: &[u8], port: SessionPort) {
        let view = PacketView::new(frame).unwrap();
        s.on_packet(&view, port, 0);
    }

    // Scenario 3: 1000 packets of 1152 bytes wrap the buffer exactly
    // (1000 x 1152) / buf_size times.
    #[test]
    fn test_buffer_wrap_count() {
        let buf_size = 48 * 1152; // whole packets
        let (mut s, sink) = rx_session(buf_size, false);
        let mut tmstamp = 48u32;
        for seq in 0..1000u16 {
            let pkt = audio_packet(seq, tmstamp, (seq % 251) as u8);
            feed(&mut s, &pkt, SessionPort::Primary);
            tmstamp = tmstamp.wrapping_add(48);
        }
        assert_eq!(s.shared.stats.pkts_recv.load(Ordering::Relaxed), 1000);
        let expected_wraps = (1000 * 1152) / buf_size as u64;
        assert_eq!(s.wraps, expected_wraps);
        assert_eq!(sink.lock().unwrap().done, expected_wraps as u32);
        assert_eq!(sink.lock().unwrap().samples.len(), 1000);
    }

    #[test]
    fn test_redundant_twin_dropped() {
        let (mut s, _) = rx_session(48 * 1152, true);
        let p = audio_packet(1, 480, 0xaa);
        feed(&mut s, &p, SessionPort::Primary);
        feed(&mut s, &p, SessionPort::Redundant);
        assert_eq!(s.shared.stats.pkts_recv.load(Ordering::Relaxed), 1);
        assert_eq!(s.shared.stats.pkts_dropped(PktDrop::RedundantPath), 1);
        // the next advancing packet is accepted from either path
        let p2 = audio_packet(2, 528, 0xbb);
        feed(&mut s, &p2, SessionPort::Redundant);
        assert_eq!(s.shared.stats.pkts_recv.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_payload_lands_at_offset() {
        let (mut s, sink) = rx_session(4 * 1152, false);
        for seq in 0..3u16 {
            let pkt = audio_packet(seq, 48 * (seq as u32 + 1), 0x10 + seq as u8);
            feed(&mut s, &pkt, SessionPort::Primary);
        }
        let sink = sink.lock().unwrap();
        assert_eq!(
            sink.samples,
            vec![(0, 48), (1152, 96), (2304, 144)]
        );
        assert_eq!(&s.buf[1152..1160], &[0x11; 8]);
    }

    #[test]
    fn test_bad_headers_dropped() {
        let (mut s, _) = rx_session(4 * 1152, false);
        let mut pkt = audio_packet(0, 48, 0);
        pkt[RTP_OFFSET + 1] = rtp::PAYLOAD_TYPE_VIDEO;
        feed(&mut s, &pkt, SessionPort::Primary);
        assert_eq!(s.shared.stats.pkts_dropped(PktDrop::BadRtpHdr), 1);

        let pkt = audio_packet(1, 0, 0);
        feed(&mut s, &pkt, SessionPort::Primary);
        assert_eq!(s.shared.stats.pkts_dropped(PktDrop::BadRtpTmstamp), 1);
    }

    // TX side: packets march one epoch (1 ms) apart in the 48 kHz domain.
    #[test]
    fn test_tx_timestamps_advance_by_grp_count() {
        struct LoopProducer {
            buf: Option<Arc<FrameBuf>>,
        }
        impl AudioProducer for LoopProducer {
            fn next_buffer(&mut self, _prev: Option<Arc<FrameBuf>>) -> Option<Arc<FrameBuf>> {
                self.buf.clone()
            }
        }

        let f = fmt();
        let flow = Flow {
            src_ip: Ipv4Addr::new(192, 168, 0, 1),
            dst_ip: Ipv4Addr::new(192, 168, 0, 2),
            src_port: 20000,
            dst_port: 20000,
            src_mac: [2, 0, 0, 0, 0, 1],
            dst_mac: [2, 0, 0, 0, 0, 2],
            dscp: 0,
            ecn: 0,
            vlan: None,
        };
        let mut hdr = vec![0u8; RTP_OFFSET + rtp::RTP_HDR_SIZE];
        render_headers(&mut hdr, &flow, f.pkt_size() as u16);
        rtp::RtpHeader {
            marker: false,
            payload_type: rtp::PAYLOAD_TYPE_AUDIO,
            seq_number: 0,
            tmstamp: 0,
            ssrc: 0x55,
        }
        .encode(&mut hdr[RTP_OFFSET..]);

        let builder = AudioTxBuilder {
            shared: shared(),
            fmt: f.clone(),
            flow: Some(flow),
            hdr_print: hdr,
            producer: Box::new(LoopProducer {
                buf: Some(FrameBuf::from_vec(vec![0x42; 4 * 1152])),
            }),
        };
        let mut s = AudioTxSession::from_builder(builder);
        let clock = PtpClock::new();
        let stop = AtomicBool::new(false);

        let (t0, _) = s.get_packet_tmstamp(&clock, false, 25_000, &stop);
        let pkt0 = s.build_packet(t0, 0).unwrap();
        let (t1, _) = s.get_packet_tmstamp(&clock, false, 25_000, &stop);
        let pkt1 = s.build_packet(t1, 0).unwrap();

        // same or next epoch: the timestamp grid is sample_grp_count
        let d = t1.wrapping_sub(t0);
        assert!(d == f.sample_grp_count || d == 2 * f.sample_grp_count, "delta {d}");
        let h0 = rtp::RtpHeader::decode(&pkt0.head[RTP_OFFSET..]).unwrap();
        let h1 = rtp::RtpHeader::decode(&pkt1.head[RTP_OFFSET..]).unwrap();
        assert_eq!(h1.seq_number, h0.seq_number + 1);
        assert_eq!(pkt0.ext.as_ref().unwrap().offset, 0);
        assert_eq!(pkt1.ext.as_ref().unwrap().offset, 1152);
    }
}
