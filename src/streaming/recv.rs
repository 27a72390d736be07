//! RX session ingress: demultiplex, reassemble, repair.
//!
//! Receiver threads burst-read their queue, stamp packets with PTP
//! time and dispatch by UDP destination port. Per-session processing
//! runs a two-phase state machine: the first-packet phase scans for a
//! frame start while filling the PREV buffer; the steady phase fills
//! CURR and rotates on the marker (or on the fragment-pattern fallback
//! when the marker is lost). Frames missing at most a quarter of their
//! packets are repaired line by line from the previous frame, which
//! bounds visible glitches to motion and keeps static detail.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::streaming::dedup::SessionPort;
use crate::streaming::ebu::EbuStats;
use crate::streaming::format::{PktFmt, VideoFormat, Vscan};
use crate::streaming::net::PacketView;
use crate::streaming::nic::RxPacket;
use crate::streaming::ptp::PtpEngine;
use crate::streaming::rtp::{self, tmstamp_gt};
use crate::streaming::session::{RxDevice, RxHandle, SessionShared, VideoRxBuilder};
use crate::streaming::{
    FrmDrop, PktDrop, SnState, StError, VideoConsumer, RECV_APP_FRAME_MAX,
};

/// Packets a repairable frame may lack: a quarter of the frame.
#[inline]
fn loss_allowed(pkts_in_frame: u32) -> u32 {
    pkts_in_frame / 4
}

const FRAME_PREV: usize = 0;
const FRAME_CURR: usize = 1;

// ---------------------------------------------------------------------------
// Fragment histogram geometry
// ---------------------------------------------------------------------------

/// How frag-histogram bits map onto lines for one (vscan, pkt_fmt).
#[derive(Debug, Clone, Copy)]
struct FragGeometry {
    /// Histogram bytes.
    bytes: usize,
    /// Bits used per line (or line pair for dual-line).
    bits_per_line: u8,
    /// Two consecutive lines share a byte.
    two_lines_per_byte: bool,
    /// Dual-line: one byte tracks a line pair.
    line_pair: bool,
    /// The value of a fully received byte.
    full_byte: u8,
}

impl FragGeometry {
    fn new(fmt: &VideoFormat) -> FragGeometry {
        let field_lines = if fmt.vscan.interlaced() {
            fmt.height / 2
        } else {
            fmt.height
        } as usize;
        match (fmt.vscan, fmt.pkt_fmt) {
            (_, PktFmt::IntelDualLine) => {
                let bits = fmt.pkts_in_line as u8;
                FragGeometry {
                    bytes: field_lines / 2,
                    bits_per_line: bits,
                    two_lines_per_byte: false,
                    line_pair: true,
                    full_byte: ((1u16 << bits) - 1) as u8,
                }
            }
            (Vscan::P2160 | Vscan::I2160, _) => FragGeometry {
                bytes: field_lines,
                bits_per_line: 8,
                two_lines_per_byte: false,
                line_pair: false,
                full_byte: 0xff,
            },
            _ => {
                let bits = fmt.pkts_in_line as u8;
                let full = ((1u16 << bits) - 1) as u8;
                FragGeometry {
                    bytes: field_lines / 2,
                    bits_per_line: bits,
                    two_lines_per_byte: true,
                    line_pair: false,
                    full_byte: full | (full << bits),
                }
            }
        }
    }

    /// The 64-bit full pattern compared eight bytes at a time.
    fn pattern(&self) -> u64 {
        u64::from_ne_bytes([self.full_byte; 8])
    }

    fn index_and_bit(&self, line: u16, pkt_in_line: u16) -> (usize, u8) {
        if self.line_pair || self.two_lines_per_byte {
            let idx = (line / 2) as usize;
            let bit = if self.two_lines_per_byte {
                (1u8 << pkt_in_line) << (self.bits_per_line * (line & 1) as u8)
            } else {
                1u8 << pkt_in_line
            };
            (idx, bit)
        } else {
            (line as usize, 1u8 << pkt_in_line)
        }
    }
}

// ---------------------------------------------------------------------------
// Per-session RX state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxPhase {
    /// Scanning for the frame start, filling PREV.
    First,
    /// Steady state, filling CURR.
    Next,
}

#[derive(Default)]
struct ConsBuf {
    tmstamp: u32,
    pkts: u32,
    buf: Option<Vec<u8>>,
}

/// Parsed per-packet line fields (receiver side of the packet ctx).
#[derive(Debug, Default, Clone, Copy)]
struct RxCtx {
    tmstamp: u32,
    line1_number: u16,
    line1_offset: u16,
    line1_length: u16,
    line2_number: u16,
    line2_offset: u16,
    field_id: u8,
}

pub struct VideoRxSession {
    pub shared: Arc<SessionShared>,
    pub fmt: VideoFormat,
    pub dst_ports: Vec<u16>,
    consumer: Box<dyn VideoConsumer>,

    phase: RxPhase,
    ctx: RxCtx,
    cons_bufs: [ConsBuf; 2],
    spare: VecDeque<Vec<u8>>,
    tmstamp_to_drop: [u32; 2],

    geometry: FragGeometry,
    frag_pattern: u64,
    frag_hist: Vec<u8>,
    line_hist: Vec<u32>,

    ebu: Option<EbuStats>,
    pub tprs: u32,
    pub tr_offset: u32,
    pub loss_allowed: u32,

    /// PTP time of the last accepted packet, for the timeout watchdog.
    last_progress: u64,
}

impl VideoRxSession {
    pub fn from_builder(b: VideoRxBuilder) -> VideoRxSession {
        let geometry = FragGeometry::new(&b.fmt);
        let frame_size = b.fmt.frame_size() as usize;
        let field_lines = if b.fmt.vscan.interlaced() {
            b.fmt.height / 2
        } else {
            b.fmt.height
        } as usize;
        let line_entries = if geometry.line_pair {
            field_lines / 2
        } else {
            field_lines
        };

        let mut spare: VecDeque<Vec<u8>> =
            (0..RECV_APP_FRAME_MAX).map(|_| vec![0u8; frame_size]).collect();
        let mut cons_bufs: [ConsBuf; 2] = Default::default();
        cons_bufs[FRAME_PREV].buf = spare.pop_front();
        cons_bufs[FRAME_CURR].buf = spare.pop_front();

        let dst_ports = b.flows.iter().map(|f| f.dst_port).collect();
        let loss = loss_allowed(b.fmt.pkts_in_frame);
        b.shared.state.store(SnState::Run);
        VideoRxSession {
            shared: b.shared,
            dst_ports,
            consumer: b.consumer,
            phase: RxPhase::First,
            ctx: RxCtx::default(),
            cons_bufs,
            spare,
            tmstamp_to_drop: [0; 2],
            frag_pattern: geometry.pattern(),
            frag_hist: vec![0u8; geometry.bytes],
            line_hist: vec![0u32; line_entries],
            geometry,
            ebu: if b.ebu_check {
                Some(EbuStats::new())
            } else {
                None
            },
            tprs: b.tprs,
            tr_offset: b.tr_offset,
            loss_allowed: loss,
            fmt: b.fmt,
            last_progress: 0,
        }
    }

    fn field_lines(&self) -> u16 {
        if self.fmt.vscan.interlaced() {
            (self.fmt.height / 2) as u16
        } else {
            self.fmt.height as u16
        }
    }

    /// Per-line expectation of the line histogram once a frame is full.
    fn expected_per_line(&self) -> u32 {
        self.fmt.pkts_in_line
    }

    fn clear_histograms(&mut self) {
        self.frag_hist.fill(0);
        self.line_hist.fill(0);
    }

    fn drop_tmstamp_push(&mut self, tmstamp: u32) {
        self.tmstamp_to_drop[1] = self.tmstamp_to_drop[0];
        self.tmstamp_to_drop[0] = tmstamp;
        self.ctx.tmstamp = 0;
    }

    /// Eight-byte stride over the histogram against the full pattern.
    pub fn frag_complete(&self) -> bool {
        let mut chunks = self.frag_hist.chunks_exact(8);
        for c in &mut chunks {
            let v = u64::from_ne_bytes(c.try_into().unwrap());
            if v != self.frag_pattern {
                return false;
            }
        }
        chunks.remainder().iter().all(|&b| b == self.geometry.full_byte)
    }

    // -- header validation ---------------------------------------------------

    fn check_ip_udp(&self, view: &PacketView) -> Result<(), PktDrop> {
        let ip_len = view.ip_total_length() as usize;
        if ip_len + crate::streaming::net::ETH_HDR_SIZE > self.fmt.pkt_size as usize {
            return Err(PktDrop::BadIpLen);
        }
        let udp_len = view.udp_len() as usize;
        if udp_len + crate::streaming::net::IPV4_HDR_SIZE != ip_len {
            return Err(PktDrop::BadUdpLen);
        }
        Ok(())
    }

    /// Validate the RTP layer and latch the line fields into the ctx.
    fn check_rtp(&mut self, rtp_bytes: &[u8]) -> Result<(u32, bool), PktDrop> {
        if rtp::RtpHeader::csrc_count(rtp_bytes) != 0 {
            return Err(PktDrop::BadRtpHdr);
        }
        let interlaced = self.fmt.vscan.interlaced();
        let field_lines = self.field_lines();

        match self.fmt.pkt_fmt {
            PktFmt::IntelDualLine => {
                let hdr = rtp::Rfc4175Dual::decode(rtp_bytes).map_err(|_| PktDrop::BadRtpHdr)?;
                if hdr.rtp.payload_type != rtp::PAYLOAD_TYPE_VIDEO {
                    return Err(PktDrop::BadRtpHdr);
                }
                if !rtp::Rfc4175Dual::line1_continuation(rtp_bytes) {
                    return Err(PktDrop::BadRtpLnCont);
                }
                if hdr.line1_length as u32 > self.fmt.line_payload()
                    || hdr.line2_length as u32 > self.fmt.line_payload()
                {
                    return Err(PktDrop::BadRtpLnLen);
                }
                if hdr.line1_number >= field_lines || hdr.line2_number >= field_lines {
                    return Err(PktDrop::BadRtpLnNum);
                }
                if hdr.line1_offset as u32 + self.fmt.pixels_in_pkt > self.fmt.width
                    || hdr.line2_offset as u32 + self.fmt.pixels_in_pkt > self.fmt.width
                {
                    return Err(PktDrop::BadRtpOffset);
                }
                self.ctx.line1_number = hdr.line1_number;
                self.ctx.line2_number = hdr.line2_number;
                self.ctx.line1_offset = hdr.line1_offset;
                self.ctx.line2_offset = hdr.line2_offset;
                self.ctx.line1_length = hdr.line1_length;
                self.ctx.field_id = 2;
                Ok((hdr.rtp.tmstamp, hdr.rtp.marker))
            }
            _ => {
                let hdr = rtp::Rfc4175Single::decode(rtp_bytes).map_err(|_| PktDrop::BadRtpHdr)?;
                if hdr.rtp.payload_type != rtp::PAYLOAD_TYPE_VIDEO {
                    return Err(PktDrop::BadRtpHdr);
                }
                if hdr.continuation {
                    return Err(PktDrop::BadRtpLnCont);
                }
                if hdr.line_length as u32 > self.fmt.line_payload() {
                    return Err(PktDrop::BadRtpLnLen);
                }
                if hdr.line_number >= field_lines {
                    return Err(PktDrop::BadRtpLnNum);
                }
                if hdr.line_offset as u32 + self.fmt.pixels_in_pkt > self.fmt.width
                    && (hdr.line_offset as u32 * crate::streaming::pack::PIXEL_GROUP_SIZE as u32
                        / crate::streaming::pack::PIXELS_PER_GROUP as u32)
                        + hdr.line_length as u32
                        > self.fmt.line_size()
                {
                    return Err(PktDrop::BadRtpOffset);
                }
                self.ctx.line1_number = hdr.line_number;
                self.ctx.line1_offset = hdr.line_offset;
                self.ctx.line1_length = hdr.line_length;
                self.ctx.field_id = if interlaced { hdr.field_id } else { 2 };
                Ok((hdr.rtp.tmstamp, hdr.rtp.marker))
            }
        }
    }

    // -- payload placement ---------------------------------------------------

    /// Copy the payload into `frame`, updating both histograms. A frag
    /// bit that is already set marks the redundant-path duplicate.
    fn fast_copy(&mut self, rtp_bytes: &[u8], frame_id: usize) -> Result<(), PktDrop> {
        let line_size = self.fmt.line_size() as usize;
        let grp_bytes = |pixels: usize| -> usize {
            pixels / crate::streaming::pack::PIXELS_PER_GROUP
                * crate::streaming::pack::PIXEL_GROUP_SIZE
        };

        let pkt_in_line = (self.ctx.line1_offset as u32 / self.fmt.pixels_in_pkt) as u16;
        let (idx, bit) = self
            .geometry
            .index_and_bit(self.ctx.line1_number, pkt_in_line);
        if self.frag_hist[idx] & bit != 0 {
            return Err(PktDrop::RedundantPath);
        }

        let hdr_len = self.fmt.rtp_hdr_size();
        let payload = &rtp_bytes[hdr_len..];

        let line1 = self.ctx.line1_number as usize;
        let off1 = line1 * line_size + grp_bytes(self.ctx.line1_offset as usize);
        let buf = self.cons_bufs[frame_id]
            .buf
            .as_mut()
            .ok_or(PktDrop::NoFrameBuf)?;

        match self.fmt.pkt_fmt {
            PktFmt::IntelDualLine => {
                let len = self.ctx.line1_length as usize;
                if payload.len() < 2 * len || off1 + len > buf.len() {
                    return Err(PktDrop::BadRtpLnLen);
                }
                let line2 = self.ctx.line2_number as usize;
                let off2 = line2 * line_size + grp_bytes(self.ctx.line2_offset as usize);
                if off2 + len > buf.len() {
                    return Err(PktDrop::BadRtpLnNum);
                }
                buf[off1..off1 + len].copy_from_slice(&payload[..len]);
                buf[off2..off2 + len].copy_from_slice(&payload[len..2 * len]);
                self.line_hist[line1 / 2] += 1;
            }
            _ => {
                let len = self.ctx.line1_length as usize;
                if payload.len() < len || off1 + len > buf.len() {
                    return Err(PktDrop::BadRtpLnLen);
                }
                buf[off1..off1 + len].copy_from_slice(&payload[..len]);
                self.line_hist[line1] += 1;
            }
        }
        self.frag_hist[idx] |= bit;
        Ok(())
    }

    // -- frame repair ---------------------------------------------------------

    /// Copy every missing packet range of CURR from PREV, then force the
    /// line histogram to its expectation.
    fn fix_video_frame(&mut self) {
        let line_size = self.fmt.line_size() as usize;
        let line_payload = self.fmt.line_payload() as usize;
        let expected = self.expected_per_line();
        let pkts = self.fmt.pkts_in_line as usize;

        let (left, right) = self.cons_bufs.split_at_mut(1);
        let prev = match left[0].buf.as_ref() {
            Some(b) => b,
            None => return,
        };
        let curr = match right[0].buf.as_mut() {
            Some(b) => b,
            None => return,
        };

        for entry in 0..self.line_hist.len() {
            if self.line_hist[entry] == expected {
                continue;
            }
            // histogram entries track lines, except dual-line where one
            // entry covers a line pair
            let line = if self.geometry.line_pair { entry * 2 } else { entry };
            for j in 0..pkts {
                let (idx, bit) = self.geometry.index_and_bit(line as u16, j as u16);
                if self.frag_hist[idx] & bit != 0 {
                    continue;
                }
                if self.geometry.line_pair {
                    let off1 = line * line_size + j * line_payload;
                    let off2 = off1 + line_size;
                    curr[off1..off1 + line_payload]
                        .copy_from_slice(&prev[off1..off1 + line_payload]);
                    curr[off2..off2 + line_payload]
                        .copy_from_slice(&prev[off2..off2 + line_payload]);
                } else {
                    // tail-aware: the last packet of a line may be short
                    let offset = line * line_size + j * line_payload;
                    let len = line_payload.min(line_size - j * line_payload);
                    curr[offset..offset + len].copy_from_slice(&prev[offset..offset + len]);
                }
                self.frag_hist[idx] |= bit;
            }
            self.line_hist[entry] = expected;
        }
    }

    // -- frame delivery -------------------------------------------------------

    fn notify_and_rotate(&mut self, tmstamp: u32) {
        let frms = self
            .shared
            .stats
            .frms_recv
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if let Some(buf) = self.cons_bufs[FRAME_CURR].buf.as_ref() {
            self.consumer.frame_recv(buf, tmstamp, self.ctx.field_id);
        }
        if let Some(ebu) = self.ebu.as_mut() {
            ebu.maybe_report(frms, self.shared.timeslot, self.tr_offset);
        }
        // the old repair source retires to the spare pool
        let done = self.cons_bufs[FRAME_PREV].tmstamp;
        if let Some(old) = self.cons_bufs[FRAME_PREV].buf.take() {
            self.consumer.frame_done(done);
            self.spare.push_back(old);
        }
        self.cons_bufs[FRAME_PREV] = std::mem::take(&mut self.cons_bufs[FRAME_CURR]);
        self.cons_bufs[FRAME_CURR].buf = self.spare.pop_front();
        self.cons_bufs[FRAME_CURR].tmstamp = 0;
        self.cons_bufs[FRAME_CURR].pkts = 0;
        self.clear_histograms();
    }

    /// Repair CURR from PREV, deliver it, account the loss.
    fn fix_current_frame(&mut self, _rtp_tmstamp: u32) {
        debug!(
            "session {}: fixing frame with {} of {} packets",
            self.shared.timeslot, self.cons_bufs[FRAME_CURR].pkts, self.fmt.pkts_in_frame
        );
        self.fix_video_frame();
        self.shared.stats.frms_fixed.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.pkts_lost_timedout.fetch_add(
            (self.fmt.pkts_in_frame - self.cons_bufs[FRAME_CURR].pkts) as u64,
            Ordering::Relaxed,
        );
        let tmstamp = self.cons_bufs[FRAME_CURR].tmstamp;
        self.notify_and_rotate(tmstamp);
    }

    /// Frame beyond repair: account it and restart on the new timestamp.
    fn incomplete_drop_and_continue(&mut self, rtp_tmstamp: u32, frame_id: usize, cont: bool) {
        if cont {
            let dropped = self.cons_bufs[frame_id].tmstamp;
            self.drop_tmstamp_push(dropped);
        } else {
            self.drop_tmstamp_push(rtp_tmstamp);
        }
        self.shared.stats.pkts_lost_timedout.fetch_add(
            self.fmt
                .pkts_in_frame
                .saturating_sub(self.cons_bufs[frame_id].pkts) as u64,
            Ordering::Relaxed,
        );
        self.shared.stats.drop_frame(FrmDrop::IncompleteFrame);
        self.clear_histograms();
        if cont {
            self.cons_bufs[frame_id].pkts = 1;
            self.cons_bufs[frame_id].tmstamp = rtp_tmstamp;
            self.shared.stats.pkts_recv.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cons_bufs[frame_id].pkts = 0;
            self.cons_bufs[frame_id].tmstamp = 0;
        }
    }

    // -- the per-packet state machine -----------------------------------------

    /// Process one frame-stamped packet. Every drop is counted on the
    /// session; nothing propagates past this function.
    pub fn on_packet(&mut self, view: &PacketView, pkt_time: u64) {
        match self.process(view, pkt_time) {
            Ok(()) => self.last_progress = pkt_time,
            Err(reason) => self.shared.stats.drop_pkt(reason),
        }
    }

    fn process(&mut self, view: &PacketView, pkt_time: u64) -> Result<(), PktDrop> {
        self.check_ip_udp(view)?;
        let rtp_bytes = view.rtp();
        let (rtp_tmstamp, marker) = self.check_rtp(rtp_bytes)?;
        if rtp_tmstamp == 0 {
            return Err(PktDrop::BadRtpTmstamp);
        }

        let frame_id = match self.phase {
            RxPhase::First => FRAME_PREV,
            RxPhase::Next => FRAME_CURR,
        };

        if rtp_tmstamp == self.ctx.tmstamp {
            // the common case: one more packet of the current frame
            self.cons_bufs[frame_id].pkts += 1;
            self.shared.stats.pkts_recv.fetch_add(1, Ordering::Relaxed);
            if let Some(ebu) = self.ebu.as_mut() {
                ebu.on_packet(
                    pkt_time,
                    self.cons_bufs[frame_id].pkts as u64,
                    self.fmt.frame_time_ns,
                    self.tr_offset,
                    self.tprs,
                );
            }
        } else if self.ctx.tmstamp == 0 || tmstamp_gt(rtp_tmstamp, self.ctx.tmstamp) {
            self.on_new_frame(rtp_tmstamp, frame_id)?;
            if let Some(ebu) = self.ebu.as_mut() {
                ebu.on_first_packet(
                    rtp_tmstamp,
                    pkt_time,
                    self.fmt.frame_time_ns,
                    self.fmt.frame_ticks_90k(),
                );
            }
        } else if rtp_tmstamp == self.tmstamp_to_drop[0] || rtp_tmstamp == self.tmstamp_to_drop[1] {
            return Err(PktDrop::NoFrameBuf);
        } else {
            // out of order / stale: drop silently
            return Err(PktDrop::BadRtpTmstamp);
        }

        self.ctx.tmstamp = rtp_tmstamp;

        let frame_id = match self.phase {
            RxPhase::First => FRAME_PREV,
            RxPhase::Next => FRAME_CURR,
        };
        self.fast_copy(rtp_bytes, frame_id)?;

        if marker {
            self.on_marker(rtp_tmstamp, frame_id);
        }
        Ok(())
    }

    /// A wrap-safe newer timestamp arrived: settle the frame in flight.
    fn on_new_frame(&mut self, rtp_tmstamp: u32, frame_id: usize) -> Result<(), PktDrop> {
        match self.phase {
            RxPhase::First => {
                if self.ctx.tmstamp == 0 {
                    // very first packet of the session
                    self.cons_bufs[FRAME_PREV].pkts = 1;
                    self.cons_bufs[FRAME_PREV].tmstamp = rtp_tmstamp;
                    self.shared.stats.pkts_recv.fetch_add(1, Ordering::Relaxed);
                } else if self.frag_complete() {
                    // marker was lost on the previous frame but every
                    // fragment arrived: deliver it now
                    let done_tmstamp = self.ctx.tmstamp;
                    self.deliver_first_frame(done_tmstamp);
                    self.phase = RxPhase::Next;
                    self.cons_bufs[FRAME_CURR].pkts = 1;
                    self.cons_bufs[FRAME_CURR].tmstamp = rtp_tmstamp;
                    self.shared.stats.pkts_recv.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.incomplete_drop_and_continue(rtp_tmstamp, FRAME_PREV, true);
                }
            }
            RxPhase::Next => {
                if self.cons_bufs[FRAME_CURR].tmstamp == 0 {
                    if self.cons_bufs[FRAME_CURR].buf.is_none() {
                        self.cons_bufs[FRAME_CURR].buf = self.spare.pop_front();
                        if self.cons_bufs[FRAME_CURR].buf.is_none() {
                            self.drop_frame_at(rtp_tmstamp);
                            return Err(PktDrop::NoFrameBuf);
                        }
                    }
                    self.cons_bufs[FRAME_CURR].pkts = 1;
                    self.cons_bufs[FRAME_CURR].tmstamp = rtp_tmstamp;
                    self.shared.stats.pkts_recv.fetch_add(1, Ordering::Relaxed);
                } else if self.frag_complete() {
                    // marker lost on the last packet: the fragment
                    // pattern still proves completion
                    let tmstamp = self.cons_bufs[FRAME_CURR].tmstamp;
                    self.shared.stats.pkts_lost_timedout.fetch_add(
                        self.fmt
                            .pkts_in_frame
                            .saturating_sub(self.cons_bufs[FRAME_CURR].pkts)
                            as u64,
                        Ordering::Relaxed,
                    );
                    self.notify_and_rotate(tmstamp);
                    self.start_new_current(rtp_tmstamp)?;
                } else if self.cons_bufs[FRAME_CURR].pkts + self.loss_allowed
                    >= self.fmt.pkts_in_frame
                {
                    self.fix_current_frame(rtp_tmstamp);
                    self.start_new_current(rtp_tmstamp)?;
                } else {
                    debug!(
                        "session {}: incomplete frame dropped, {} of {}",
                        self.shared.timeslot,
                        self.cons_bufs[FRAME_CURR].pkts,
                        self.fmt.pkts_in_frame
                    );
                    self.incomplete_drop_and_continue(rtp_tmstamp, FRAME_CURR, true);
                }
            }
        }
        Ok(())
    }

    fn start_new_current(&mut self, rtp_tmstamp: u32) -> Result<(), PktDrop> {
        if self.cons_bufs[FRAME_CURR].buf.is_none() {
            self.drop_frame_at(rtp_tmstamp);
            return Err(PktDrop::NoFrameBuf);
        }
        self.cons_bufs[FRAME_CURR].pkts = 1;
        self.cons_bufs[FRAME_CURR].tmstamp = rtp_tmstamp;
        self.shared.stats.pkts_recv.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn drop_frame_at(&mut self, rtp_tmstamp: u32) {
        self.drop_tmstamp_push(rtp_tmstamp);
        self.shared.stats.drop_frame(FrmDrop::NoFrameBuf);
    }

    /// First-phase delivery: PREV stays put as the repair source, CURR
    /// starts filling.
    fn deliver_first_frame(&mut self, tmstamp: u32) {
        let frms = self
            .shared
            .stats
            .frms_recv
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if let Some(buf) = self.cons_bufs[FRAME_PREV].buf.as_ref() {
            self.consumer.frame_recv(buf, tmstamp, self.ctx.field_id);
        }
        if let Some(ebu) = self.ebu.as_mut() {
            ebu.maybe_report(frms, self.shared.timeslot, self.tr_offset);
        }
        self.clear_histograms();
    }

    fn on_marker(&mut self, rtp_tmstamp: u32, frame_id: usize) {
        if self.cons_bufs[frame_id].tmstamp != rtp_tmstamp {
            return;
        }
        let complete = self.cons_bufs[frame_id].pkts == self.fmt.pkts_in_frame;
        match self.phase {
            RxPhase::First => {
                if complete || self.frag_complete() {
                    self.deliver_first_frame(rtp_tmstamp);
                    self.phase = RxPhase::Next;
                    self.cons_bufs[FRAME_CURR].pkts = 0;
                    self.cons_bufs[FRAME_CURR].tmstamp = 0;
                } else {
                    self.incomplete_drop_and_continue(rtp_tmstamp, FRAME_PREV, false);
                }
            }
            RxPhase::Next => {
                if complete {
                    self.notify_and_rotate(rtp_tmstamp);
                } else if self.cons_bufs[FRAME_CURR].pkts + self.loss_allowed
                    >= self.fmt.pkts_in_frame
                {
                    self.fix_current_frame(rtp_tmstamp);
                } else {
                    self.incomplete_drop_and_continue(rtp_tmstamp, FRAME_CURR, false);
                }
            }
        }
    }

    /// Timeout watchdog: no progress for over a frame interval.
    pub fn check_timeout(&mut self, now: u64) {
        if self.last_progress == 0 {
            return;
        }
        if now.saturating_sub(self.last_progress) > 2 * self.fmt.frame_time_ns
            && self.shared.state.load() == SnState::Run
        {
            self.shared.state.store(SnState::Timedout);
            warn!("session {} timed out", self.shared.timeslot);
        } else if self.shared.state.load() == SnState::Timedout
            && now.saturating_sub(self.last_progress) <= self.fmt.frame_time_ns
        {
            self.shared.state.store(SnState::Run);
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver threads
// ---------------------------------------------------------------------------

/// Packets read per rx_burst call.
const RX_BURST: usize = 8;

struct ReceiverThread {
    video: Vec<VideoRxSession>,
    audio: Vec<crate::streaming::audio::AudioRxSession>,
    anc: Vec<crate::streaming::anc::AncRxSession>,
}

impl ReceiverThread {
    fn dispatch_video(&mut self, pkt: &RxPacket) -> bool {
        let view = match PacketView::new(&pkt.data) {
            Some(v) => v,
            None => return false,
        };
        let port = view.udp_dst_port();
        for s in self.video.iter_mut() {
            if s.dst_ports.contains(&port) {
                match s.shared.state.load() {
                    SnState::Off => {}
                    SnState::StopPending => s.shared.state.store(SnState::Off),
                    _ => s.on_packet(&view, pkt.timestamp),
                }
                return true;
            }
        }
        false
    }
}

/// Spawn the receiver threads for a created RX device.
pub fn start_rx_device(
    mut dev: RxDevice,
    ptp: Option<Arc<PtpEngine>>,
) -> Result<RxHandle, StError> {
    let stop = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();
    let mut sessions: Vec<Arc<SessionShared>> = Vec::new();

    let rcv_threads = dev.nic_params.max_rcv_threads.max(1);

    // split sessions by their bound queue (timeslot % threads)
    let mut per_thread: Vec<ReceiverThread> = (0..rcv_threads)
        .map(|_| ReceiverThread {
            video: Vec::new(),
            audio: Vec::new(),
            anc: Vec::new(),
        })
        .collect();

    for b in dev.video.iter_mut().filter_map(|b| b.take()) {
        if b.flows.is_empty() {
            warn!("video RX session {} never bound, skipping", b.shared.timeslot);
            continue;
        }
        sessions.push(b.shared.clone());
        let tid = (b.shared.timeslot % rcv_threads) as usize;
        per_thread[tid].video.push(VideoRxSession::from_builder(b));
    }
    for b in dev.audio.iter_mut().filter_map(|b| b.take()) {
        if b.flows.is_empty() {
            continue;
        }
        sessions.push(b.shared.clone());
        let tid = (b.shared.timeslot % rcv_threads) as usize;
        per_thread[tid]
            .audio
            .push(crate::streaming::audio::AudioRxSession::from_builder(b));
    }
    for b in dev.anc.iter_mut().filter_map(|b| b.take()) {
        if b.flows.is_empty() {
            continue;
        }
        sessions.push(b.shared.clone());
        let tid = (b.shared.timeslot % rcv_threads) as usize;
        per_thread[tid]
            .anc
            .push(crate::streaming::anc::AncRxSession::from_builder(b));
    }

    for (tid, mut rt) in per_thread.into_iter().enumerate() {
        let ports = dev.ports.clone();
        let clock = dev.clock.clone();
        let stop = stop.clone();
        let ptp = ptp.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("st21-rcv-{tid}"))
                .spawn(move || {
                    info!("receiver {} polling {} port(s)", tid, ports.len());
                    let mut bursts: Vec<Vec<RxPacket>> =
                        ports.iter().map(|_| Vec::with_capacity(RX_BURST)).collect();
                    while !stop.load(Ordering::Acquire) {
                        let mut idle = true;
                        for (pi, port) in ports.iter().enumerate() {
                            bursts[pi].clear();
                            let n = port.rx_burst(tid as u16, &mut bursts[pi], RX_BURST);
                            if n > 0 {
                                idle = false;
                            }
                        }
                        let now = clock.now_ns();
                        for burst in bursts.iter_mut() {
                            for pkt in burst.iter_mut() {
                                if pkt.timestamp == 0 {
                                    pkt.timestamp = now;
                                }
                            }
                        }

                        // PTP frames come first so pacing never waits on media
                        if let Some(engine) = ptp.as_ref() {
                            for burst in bursts.iter_mut() {
                                burst.retain(|pkt| {
                                    !engine.on_ethernet_frame(&pkt.data, pkt.timestamp)
                                });
                            }
                        }

                        // video: dispatch in arrival order
                        for pi in 0..bursts.len() {
                            let burst = std::mem::take(&mut bursts[pi]);
                            let mut rest = Vec::with_capacity(burst.len());
                            for pkt in burst {
                                if !rt.dispatch_video(&pkt) {
                                    rest.push(pkt);
                                }
                            }
                            bursts[pi] = rest;
                        }

                        // audio / ancillary: merge the two paths in
                        // sequence order before the per-packet handler
                        let primary = std::mem::take(&mut bursts[0]);
                        let redundant = if bursts.len() > 1 {
                            std::mem::take(&mut bursts[1])
                        } else {
                            Vec::new()
                        };
                        dispatch_sample_sessions(&mut rt, primary, redundant);

                        for s in rt.video.iter_mut() {
                            s.check_timeout(now);
                        }
                        if idle {
                            thread::sleep(Duration::from_micros(50));
                        }
                    }
                    info!("receiver {} stopped", tid);
                })
                .map_err(|_| StError::NoMemory("receiver thread"))?,
        );
    }

    Ok(RxHandle {
        stop,
        sessions,
        threads,
    })
}

/// Feed audio/ancillary packets through the ST 2022-7 merge before the
/// session handlers.
fn dispatch_sample_sessions(
    rt: &mut ReceiverThread,
    primary: Vec<RxPacket>,
    redundant: Vec<RxPacket>,
) {
    if primary.is_empty() && redundant.is_empty() {
        return;
    }
    let seq_of = |pkt: &RxPacket| -> u16 {
        PacketView::new(&pkt.data)
            .and_then(|v| rtp::RtpHeader::decode(v.rtp()).ok())
            .map(|h| h.seq_number)
            .unwrap_or(0)
    };
    let mut merged: Vec<(RxPacket, SessionPort)> = Vec::new();
    crate::streaming::dedup::merge_bursts(primary, redundant, seq_of, |pkt, port| {
        merged.push((pkt, port))
    });
    for (pkt, sport) in merged {
        let view = match PacketView::new(&pkt.data) {
            Some(v) => v,
            None => continue,
        };
        let dst = view.udp_dst_port();
        let mut handled = false;
        for s in rt.audio.iter_mut() {
            if s.dst_ports.contains(&dst) {
                s.on_packet(&view, sport, pkt.timestamp);
                handled = true;
                break;
            }
        }
        if handled {
            continue;
        }
        for s in rt.anc.iter_mut() {
            if s.dst_ports.contains(&dst) {
                s.on_packet(&view, sport, pkt.timestamp);
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::format::FrameRate;
    use crate::streaming::net::{render_headers, Flow, RTP_OFFSET};
    use crate::streaming::session::FlowRule;
    use crate::streaming::{AtomicSnState, Direction, Essence, SessionStats};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured {
        frames: Vec<(Vec<u8>, u32)>,
        done: Vec<u32>,
    }

    struct CapturingConsumer(Arc<Mutex<Captured>>);

    impl VideoConsumer for CapturingConsumer {
        fn frame_recv(&mut self, frame: &[u8], tmstamp: u32, _field_id: u8) {
            self.0.lock().unwrap().frames.push((frame.to_vec(), tmstamp));
        }
        fn frame_done(&mut self, tmstamp: u32) {
            self.0.lock().unwrap().done.push(tmstamp);
        }
    }

    fn session(fmt: VideoFormat) -> (VideoRxSession, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let shared = Arc::new(SessionShared {
            timeslot: 0,
            essence: Essence::Video,
            direction: Direction::Consumer,
            ssrc: 0x123450,
            state: AtomicSnState::new(SnState::On),
            stats: SessionStats::default(),
        });
        let tprs = fmt.tprs(crate::streaming::format::PacerType::Tpn);
        let builder = VideoRxBuilder {
            shared,
            tr_offset: tprs * fmt.pkts_in_line * fmt.vscan.tr_offset_lines(),
            tprs,
            fmt,
            flows: vec![FlowRule {
                queue: 0,
                src_ip: Ipv4Addr::new(192, 168, 0, 1),
                dst_ip: Ipv4Addr::new(192, 168, 0, 2),
                src_port: 10000,
                dst_port: 10000,
                src_ip_masked: false,
                ip_proto_masked: false,
            }],
            consumer: Box::new(CapturingConsumer(captured.clone())),
            ebu_check: false,
        };
        (VideoRxSession::from_builder(builder), captured)
    }

    fn fmt_1080p_sln() -> VideoFormat {
        VideoFormat::new(Vscan::P1080, PktFmt::IntelSingleLine, FrameRate::P29_97).unwrap()
    }

    fn fmt_1080p_other() -> VideoFormat {
        VideoFormat::new(Vscan::P1080, PktFmt::OtherSingleLine, FrameRate::P29_97).unwrap()
    }

    /// Build the wire frame of one single-line packet.
    fn make_packet(fmt: &VideoFormat, tmstamp: u32, line: u16, pkt_in_line: u16, fill: u8) -> Vec<u8> {
        let line_payload = fmt.line_payload();
        let offset_pixels = pkt_in_line as u32 * fmt.pixels_in_pkt;
        let payload_len = (fmt.line_size() - pkt_in_line as u32 * line_payload).min(line_payload);
        let marker =
            line + 1 == fmt.height as u16 && pkt_in_line + 1 == fmt.pkts_in_line as u16;
        let pkt_len = RTP_OFFSET + fmt.rtp_hdr_size() + payload_len as usize;
        let mut frame = vec![0u8; pkt_len];
        let flow = Flow {
            src_ip: Ipv4Addr::new(192, 168, 0, 1),
            dst_ip: Ipv4Addr::new(192, 168, 0, 2),
            src_port: 10000,
            dst_port: 10000,
            src_mac: [2, 0, 0, 0, 0, 1],
            dst_mac: [2, 0, 0, 0, 0, 2],
            dscp: 0,
            ecn: 0,
            vlan: None,
        };
        render_headers(&mut frame, &flow, pkt_len as u16);
        rtp::Rfc4175Single {
            rtp: rtp::RtpHeader {
                marker,
                payload_type: rtp::PAYLOAD_TYPE_VIDEO,
                seq_number: 0,
                tmstamp,
                ssrc: 0x123450,
            },
            seq_ext: 0,
            line_length: payload_len as u16,
            line_number: line,
            field_id: 0,
            line_offset: offset_pixels as u16,
            continuation: false,
        }
        .encode(&mut frame[RTP_OFFSET..]);
        let start = RTP_OFFSET + fmt.rtp_hdr_size();
        frame[start..].fill(fill);
        frame
    }

    fn feed(s: &mut VideoRxSession, frame: &[u8], t: u64) {
        let view = PacketView::new(frame).unwrap();
        s.on_packet(&view, t);
    }

    fn feed_frame(s: &mut VideoRxSession, fmt: &VideoFormat, tmstamp: u32, fill: u8, skip: Option<(u16, u16)>) {
        for line in 0..fmt.height as u16 {
            for p in 0..fmt.pkts_in_line as u16 {
                if skip == Some((line, p)) {
                    continue;
                }
                let pkt = make_packet(fmt, tmstamp, line, p, fill);
                feed(s, &pkt, 1000);
            }
        }
    }

    #[test]
    fn test_full_frame_delivered_on_marker() {
        let fmt = fmt_1080p_sln();
        let (mut s, captured) = session(fmt.clone());
        feed_frame(&mut s, &fmt, 3003, 0xaa, None);
        let got = captured.lock().unwrap();
        assert_eq!(got.frames.len(), 1);
        assert_eq!(got.frames[0].1, 3003);
        assert!(got.frames[0].0.iter().all(|&b| b == 0xaa));
        assert_eq!(s.shared.stats.pkts_recv.load(Ordering::Relaxed), 4320);
        assert_eq!(s.shared.stats.frms_recv.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_second_frame_rotates_buffers() {
        let fmt = fmt_1080p_sln();
        let (mut s, captured) = session(fmt.clone());
        feed_frame(&mut s, &fmt, 3003, 0x11, None);
        feed_frame(&mut s, &fmt, 6006, 0x22, None);
        let got = captured.lock().unwrap();
        assert_eq!(got.frames.len(), 2);
        assert!(got.frames[1].0.iter().all(|&b| b == 0x22));
        // the first delivered buffer was retired exactly once
        assert_eq!(got.done.len(), 1);
    }

    // P7: after repair every line histogram entry equals the expectation.
    #[test]
    fn test_repair_from_previous_frame() {
        let fmt = fmt_1080p_sln();
        let (mut s, captured) = session(fmt.clone());
        // frame 1 complete, frame 2 missing one packet (not the marker):
        // the marker arrives with a repairable shortfall and the frame is
        // fixed from frame 1 right there
        feed_frame(&mut s, &fmt, 3003, 0x11, None);
        feed_frame(&mut s, &fmt, 6006, 0x22, Some((100, 2)));

        let pkt = make_packet(&fmt, 9009, 0, 0, 0x33);
        feed(&mut s, &pkt, 2000);

        // histograms were reset at rotation; only frame 3's first packet
        // has landed since
        assert_eq!(s.line_hist.iter().map(|&h| h as u64).sum::<u64>(), 1);
        let got = captured.lock().unwrap();
        assert_eq!(got.frames.len(), 2);
        let fixed = &got.frames[1].0;
        // the lost range was patched from frame 1
        let line_size = fmt.line_size() as usize;
        let lp = fmt.line_payload() as usize;
        let lost = &fixed[100 * line_size + 2 * lp..100 * line_size + 3 * lp];
        assert!(lost.iter().all(|&b| b == 0x11));
        // everything else is frame 2 content
        assert!(fixed[..100 * line_size].iter().all(|&b| b == 0x22));
        assert_eq!(s.shared.stats.frms_fixed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unrepairable_frame_dropped() {
        let fmt = fmt_1080p_sln();
        let (mut s, captured) = session(fmt.clone());
        feed_frame(&mut s, &fmt, 3003, 0x11, None);
        // frame 2: only a handful of packets
        for p in 0..4u16 {
            let pkt = make_packet(&fmt, 6006, 0, p, 0x22);
            feed(&mut s, &pkt, 1500);
        }
        // frame 3 starts: frame 2 is beyond repair
        let pkt = make_packet(&fmt, 9009, 0, 0, 0x33);
        feed(&mut s, &pkt, 2000);

        assert_eq!(captured.lock().unwrap().frames.len(), 1);
        assert_eq!(
            s.shared.stats.frames_dropped(FrmDrop::IncompleteFrame),
            1
        );
        // its timestamp is now on the drop stack: stragglers are binned
        let straggler = make_packet(&fmt, 6006, 5, 0, 0x22);
        feed(&mut s, &straggler, 2100);
        assert_eq!(s.shared.stats.pkts_dropped(PktDrop::NoFrameBuf), 1);
    }

    // Scenario 6: marker lost, every fragment received; the next epoch's
    // first packet must still deliver the frame.
    #[test]
    fn test_marker_loss_fragment_fallback() {
        let fmt = fmt_1080p_other();
        let (mut s, captured) = session(fmt.clone());
        feed_frame(&mut s, &fmt, 3003, 0x11, None);
        // frame 2 fully received except the marker packet never arrives
        let last = (fmt.height as u16 - 1, fmt.pkts_in_line as u16 - 1);
        feed_frame(&mut s, &fmt, 6006, 0x22, Some(last));
        // resend of the payload via the other path, marker flag clipped:
        // build it as a non-marker packet of the same range
        let mut pkt = make_packet(&fmt, 6006, last.0, last.1, 0x22);
        rtp::patch_marker(&mut pkt[RTP_OFFSET..], false);
        feed(&mut s, &pkt, 1500);
        assert_eq!(captured.lock().unwrap().frames.len(), 1, "await next epoch");

        // the next frame's first packet triggers the fallback
        let first = make_packet(&fmt, 9009, 0, 0, 0x33);
        feed(&mut s, &first, 2000);
        let got = captured.lock().unwrap();
        assert_eq!(got.frames.len(), 2);
        assert!(got.frames[1].0.iter().all(|&b| b == 0x22));
        // no repair was needed
        assert_eq!(s.shared.stats.frms_fixed.load(Ordering::Relaxed), 0);
    }

    // Scenario 2 shape: the redundant path duplicates every packet; all
    // duplicates are dropped, frames stay whole, nothing gets "fixed".
    #[test]
    fn test_redundant_duplicates_dropped() {
        let fmt = fmt_1080p_sln();
        let (mut s, captured) = session(fmt.clone());
        for line in 0..fmt.height as u16 {
            for p in 0..fmt.pkts_in_line as u16 {
                let pkt = make_packet(&fmt, 3003, line, p, 0x44);
                feed(&mut s, &pkt, 1000);
                // twin from the redundant path
                if line < 10 {
                    feed(&mut s, &pkt, 1001);
                }
            }
        }
        let got = captured.lock().unwrap();
        assert_eq!(got.frames.len(), 1);
        assert_eq!(s.shared.stats.frms_fixed.load(Ordering::Relaxed), 0);
        assert!(s.shared.stats.pkts_dropped(PktDrop::RedundantPath) > 0);
    }

    #[test]
    fn test_bad_headers_counted() {
        let fmt = fmt_1080p_sln();
        let (mut s, _) = session(fmt.clone());

        // zero timestamp
        let pkt = make_packet(&fmt, 0, 0, 0, 0);
        feed(&mut s, &pkt, 1);
        assert_eq!(s.shared.stats.pkts_dropped(PktDrop::BadRtpTmstamp), 1);

        // line number out of range
        let mut pkt = make_packet(&fmt, 3003, 0, 0, 0);
        rtp::patch_u16(&mut pkt[RTP_OFFSET..], rtp::OFF_LINE1_NUMBER, 2000);
        feed(&mut s, &pkt, 1);
        assert_eq!(s.shared.stats.pkts_dropped(PktDrop::BadRtpLnNum), 1);

        // continuation bit on a single-line packet
        let mut pkt = make_packet(&fmt, 3003, 0, 0, 0);
        rtp::patch_u16(
            &mut pkt[RTP_OFFSET..],
            rtp::OFF_LINE1_OFFSET,
            rtp::LINE_CONTINUATION_BIT,
        );
        feed(&mut s, &pkt, 1);
        assert_eq!(s.shared.stats.pkts_dropped(PktDrop::BadRtpLnCont), 1);

        // wrong payload type
        let mut pkt = make_packet(&fmt, 3003, 0, 0, 0);
        pkt[RTP_OFFSET + 1] = rtp::PAYLOAD_TYPE_AUDIO;
        feed(&mut s, &pkt, 1);
        assert_eq!(s.shared.stats.pkts_dropped(PktDrop::BadRtpHdr), 1);
    }

    #[test]
    fn test_timestamp_wrap_is_new_frame() {
        let fmt = fmt_1080p_sln();
        let (mut s, captured) = session(fmt.clone());
        let near_wrap = u32::MAX - 1000;
        feed_frame(&mut s, &fmt, near_wrap, 0x55, None);
        // next frame wraps the 32-bit timestamp
        let wrapped = near_wrap.wrapping_add(3003);
        feed_frame(&mut s, &fmt, wrapped, 0x66, None);
        let got = captured.lock().unwrap();
        assert_eq!(got.frames.len(), 2);
        assert_eq!(got.frames[1].1, wrapped);
    }

    #[test]
    fn test_dual_line_frame() {
        let fmt =
            VideoFormat::new(Vscan::P1080, PktFmt::IntelDualLine, FrameRate::P29_97).unwrap();
        let (mut s, captured) = session(fmt.clone());
        let lp = fmt.line_payload() as usize;
        for pair in 0..(fmt.height / 2) as u16 {
            for p in 0..fmt.pkts_in_line as u16 {
                let line1 = pair * 2;
                let marker = pair == (fmt.height / 2 - 1) as u16
                    && p == fmt.pkts_in_line as u16 - 1;
                let pkt_len = RTP_OFFSET + fmt.rtp_hdr_size() + 2 * lp;
                let mut frame = vec![0u8; pkt_len];
                let flow = Flow {
                    src_ip: Ipv4Addr::new(192, 168, 0, 1),
                    dst_ip: Ipv4Addr::new(192, 168, 0, 2),
                    src_port: 10000,
                    dst_port: 10000,
                    src_mac: [2, 0, 0, 0, 0, 1],
                    dst_mac: [2, 0, 0, 0, 0, 2],
                    dscp: 0,
                    ecn: 0,
                    vlan: None,
                };
                render_headers(&mut frame, &flow, pkt_len as u16);
                rtp::Rfc4175Dual {
                    rtp: rtp::RtpHeader {
                        marker,
                        payload_type: rtp::PAYLOAD_TYPE_VIDEO,
                        seq_number: 0,
                        tmstamp: 3003,
                        ssrc: 0x123450,
                    },
                    seq_ext: 0,
                    line1_length: lp as u16,
                    line1_number: line1,
                    line1_offset: p * fmt.pixels_in_pkt as u16,
                    line2_length: lp as u16,
                    line2_number: line1 + 1,
                    line2_offset: p * fmt.pixels_in_pkt as u16,
                }
                .encode(&mut frame[RTP_OFFSET..]);
                frame[RTP_OFFSET + fmt.rtp_hdr_size()..].fill(0x77);
                feed(&mut s, &frame, 100);
            }
        }
        let got = captured.lock().unwrap();
        assert_eq!(got.frames.len(), 1);
        assert!(got.frames[0].0.iter().all(|&b| b == 0x77));
    }

    // Scenario 1: a perfectly paced 1080p29 stream keeps the monitor
    // inside the narrow gateway over 100 frames.
    #[test]
    fn test_ebu_narrow_pass_over_100_frames() {
        let fmt = fmt_1080p_sln();
        let captured = Arc::new(Mutex::new(Captured::default()));
        let shared = Arc::new(SessionShared {
            timeslot: 0,
            essence: Essence::Video,
            direction: Direction::Consumer,
            ssrc: 0x123450,
            state: AtomicSnState::new(SnState::On),
            stats: SessionStats::default(),
        });
        let tprs = fmt.tprs(crate::streaming::format::PacerType::Tpn);
        let tr_offset = tprs * fmt.pkts_in_line * fmt.vscan.tr_offset_lines();
        let builder = VideoRxBuilder {
            shared,
            tr_offset,
            tprs,
            fmt: fmt.clone(),
            flows: vec![FlowRule {
                queue: 0,
                src_ip: Ipv4Addr::new(192, 168, 0, 1),
                dst_ip: Ipv4Addr::new(192, 168, 0, 2),
                src_port: 10000,
                dst_port: 10000,
                src_ip_masked: false,
                ip_proto_masked: false,
            }],
            consumer: Box::new(CapturingConsumer(captured.clone())),
            ebu_check: true,
        };
        let mut s = VideoRxSession::from_builder(builder);

        // packets ride the exact TPRS grid after the rise offset
        let base_epoch = 1000u64;
        for f in 0..100u64 {
            let epoch = base_epoch + f;
            let t0 = epoch * fmt.frame_time_ns + tr_offset as u64;
            let tmstamp = (epoch as f64 * fmt.frame_ticks_90k()) as u64 as u32;
            let mut pkt_idx = 0u64;
            for line in 0..fmt.height as u16 {
                for p in 0..fmt.pkts_in_line as u16 {
                    let pkt = make_packet(&fmt, tmstamp, line, p, 0x5a);
                    feed(&mut s, &pkt, t0 + pkt_idx * tprs as u64);
                    pkt_idx += 1;
                }
            }
            if f == 98 {
                // one frame before the report resets the accumulators
                let ebu = s.ebu.as_ref().unwrap();
                assert!(
                    ebu.cinst.max <= crate::streaming::ebu::CINST_NARROW_MAX,
                    "Cinst max {}",
                    ebu.cinst.max
                );
                assert!(
                    ebu.vrx.max <= crate::streaming::ebu::VRX_NARROW_MAX,
                    "VRX max {}",
                    ebu.vrx.max
                );
                assert!(ebu.fpt.max < 2 * tr_offset as u64, "FPT max {}", ebu.fpt.max);
                // steady timestamp increments
                assert_eq!(ebu.tmi.min, ebu.tmi.max);
            }
        }
        assert_eq!(
            s.shared.stats.frms_recv.load(Ordering::Relaxed),
            100
        );
        // the 100-frame report fired and reset the clusters
        let ebu = s.ebu.as_ref().unwrap();
        assert_eq!(ebu.fpt.cnt, 0);
        assert_eq!(captured.lock().unwrap().frames.len(), 100);
    }

    #[test]
    fn test_timeout_flags_session() {
        let fmt = fmt_1080p_sln();
        let (mut s, _) = session(fmt.clone());
        let pkt = make_packet(&fmt, 3003, 0, 0, 0);
        feed(&mut s, &pkt, 1_000_000);
        s.check_timeout(1_000_000 + 3 * fmt.frame_time_ns);
        assert_eq!(s.shared.state.load(), SnState::Timedout);
    }
}
