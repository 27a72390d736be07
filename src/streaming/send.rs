//! TX packet builder: per-session RTP assembly and frame timestamping.
//!
//! Enqueue threads walk their session range once per batch, building
//! four packets per session from the producer's frame buffer into the
//! session ring. The first packet of every frame gets its RTP timestamp
//! and launch time from the PTP epoch walk in [`VideoTxSession::
//! get_frame_tmstamp`]; every second line re-anchors the launch time so
//! the NIC's rate limiter stays locked to the TPRS grid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::streaming::format::{PktFmt, VideoFormat};
use crate::streaming::net::{patch_ip_id, udp_checksum, RTP_OFFSET};
use crate::streaming::nic::{NicPort, PayloadRef, TxPacket};
use crate::streaming::ptp::{PtpClock, PtpEngine};
use crate::streaming::ring::{tx_ring, SchedSync, TxRingProd, SESSION_RING_SIZE};
use crate::streaming::rtp::{self, LINE_CONTINUATION_BIT};
use crate::streaming::session::{SessionShared, TxDevice, TxHandle, VideoTxBuilder};
use crate::streaming::{FrameBuf, SnState, StError, VideoProducer};

/// Clock precision of the cooperative wait.
pub const CLOCK_PRECISION_NS: u64 = 64_000;
/// Sleep quantum of the cooperative wait.
pub const SLEEP_STEP_NS: u64 = 128_000;
/// TPRS slots the launch time is advanced by, absorbing scheduler jitter.
pub const TPRS_SLOTS_ADVANCE: u32 = 8;
/// Packets built per session per enqueue batch.
pub const PKTS_PER_BATCH: usize = 4;

// ---------------------------------------------------------------------------
// Per-session TX context
// ---------------------------------------------------------------------------

/// Packet-assembly cursor, owned by the enqueue thread.
#[derive(Debug, Default)]
struct TxPacketCtx {
    /// 32-bit sequence: low 16 on the wire plus the extension.
    sequence: u32,
    /// Current frame's RTP timestamp; 0 = renew on the next packet.
    tmstamp: u32,
    epochs: u64,
    align_tmstamp: bool,
    line1_number: u16,
    line1_offset: u16,
    line2_number: u16,
    line2_offset: u16,
    field_id: u8,
    ip_packet_id: u16,
    /// Byte position just past the last line completed.
    slice_offset: u32,
}

/// One video TX session as the enqueue thread owns it.
pub struct VideoTxSession {
    pub shared: Arc<SessionShared>,
    pub fmt: VideoFormat,
    hdr_print: Vec<u8>,
    ctx: TxPacketCtx,
    producer: Box<dyn VideoProducer>,
    prod_buf: Option<Arc<FrameBuf>>,
    /// Producer-acknowledged slice offset.
    slice_ack: u32,
    pub tprs: u32,
    pub tr_offset: u32,
    nic_tx_time: u32,
    hw_cksum: bool,
}

impl VideoTxSession {
    pub fn from_builder(b: VideoTxBuilder, nic_tx_time: u32, hw_cksum: bool) -> VideoTxSession {
        VideoTxSession {
            shared: b.shared,
            fmt: b.fmt,
            hdr_print: b.hdr_print,
            ctx: TxPacketCtx {
                line2_number: 1,
                ..Default::default()
            },
            producer: b.producer,
            prod_buf: None,
            slice_ack: 0,
            tprs: b.tprs,
            tr_offset: b.tr_offset,
            nic_tx_time,
            hw_cksum,
        }
    }

    /// Move the session towards RUN: pull the first/next frame or slice
    /// from the producer. Returns whether packets may be built.
    pub fn check_run_state(&mut self) -> bool {
        match self.shared.state.load() {
            SnState::Run => true,
            SnState::On | SnState::NoNextFrame => {
                let prev = if self.shared.state.load() == SnState::NoNextFrame {
                    self.prod_buf.take()
                } else {
                    None
                };
                match self.producer.next_frame(prev, self.ctx.field_id) {
                    Some(frame) => {
                        self.ctx.slice_offset = 0;
                        self.slice_ack =
                            self.producer
                                .next_slice_offset(&frame, 0, self.ctx.field_id);
                        self.prod_buf = Some(frame);
                        self.shared.state.store(SnState::Run);
                        true
                    }
                    None => {
                        self.shared.state.store(SnState::NoNextFrame);
                        false
                    }
                }
            }
            SnState::NoNextSlice => {
                let frame = match &self.prod_buf {
                    Some(f) => f,
                    None => return false,
                };
                let next = self
                    .producer
                    .next_slice_offset(frame, self.slice_ack, self.ctx.field_id);
                if next > self.slice_ack {
                    self.slice_ack = next;
                    self.shared.state.store(SnState::Run);
                    true
                } else {
                    false
                }
            }
            SnState::StopPending => {
                // drain: hand the frame back, go quiet
                if let Some(frame) = self.prod_buf.take() {
                    let _ = self.producer.next_frame(Some(frame), self.ctx.field_id);
                }
                self.shared.state.store(SnState::Off);
                false
            }
            SnState::Off | SnState::Timedout => false,
        }
    }

    /// ST 2110-21 frame timestamp, aligned to the PTP epoch. Returns the
    /// 32-bit 90 kHz timestamp and the launch time for the first packet.
    /// `round_time` caches the PTP read across the sessions of one batch.
    pub fn get_frame_tmstamp(
        &mut self,
        clock: &PtpClock,
        first_waits: bool,
        round_time: &mut u64,
        stop: &AtomicBool,
    ) -> (u32, u64) {
        if *round_time == 0 {
            *round_time = clock.now_ns();
        }
        let ntime = *round_time;
        let frame_time = self.fmt.frame_time_ns;
        let epochs = ntime / frame_time;

        let mut same_epoch = false;
        let mut one_late = false;
        if self.ctx.epochs == 0 {
            self.ctx.epochs = epochs;
        } else {
            match epochs as i64 - self.ctx.epochs as i64 {
                0 => same_epoch = true,
                1 => {
                    one_late = true;
                    self.ctx.epochs += 1;
                }
                _ => self.ctx.epochs = epochs,
            }
        }

        let advance = self.nic_tx_time as u64 + TPRS_SLOTS_ADVANCE as u64 * self.tprs as u64;
        let frm_ticks = self.fmt.frame_ticks_90k();
        let remaind = ntime % frame_time;
        let tr = self.tr_offset as u64;

        let mut to_elapse: i64;
        if (one_late || !same_epoch) && tr > advance && remaind < tr - advance {
            // still ahead of this epoch's first-packet window
            to_elapse = if remaind > tr / 2 {
                0
            } else {
                (tr - advance - remaind) as i64
            };
        } else {
            // aim at the next epoch
            self.ctx.epochs += 1;
            let to_epoch = (self.ctx.epochs * frame_time) as i64 - ntime as i64;
            to_elapse = to_epoch + tr as i64 - advance as i64;
        }
        let tmstamp90k = (self.ctx.epochs as f64 * frm_ticks) as u64;
        let tx_time = (self.ctx.epochs * frame_time + tr).saturating_sub(advance);

        // cooperative wait, only the first session of a round sleeps
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

        (tmstamp90k as u32, tx_time)
    }

    /// Launch time of the next packet batch when a line boundary was
    /// crossed mid-frame: epoch + trOffset + elapsed line slots.
    fn align_packet_time(&self) -> u64 {
        let base = (self.ctx.epochs * self.fmt.frame_time_ns + self.tr_offset as u64)
            .saturating_sub(self.nic_tx_time as u64);
        let slots = (self.ctx.line1_number as i64 + 1) * self.fmt.pkts_in_line as i64
            - TPRS_SLOTS_ADVANCE as i64;
        (base as i64 + slots * self.tprs as i64).max(0) as u64
    }

    /// Ask the producer for more of the frame once the builder has
    /// consumed everything acknowledged so far.
    fn poll_slice(&mut self) {
        if self.ctx.slice_offset < self.slice_ack {
            return;
        }
        let frame = match &self.prod_buf {
            Some(f) => f,
            None => return,
        };
        let next = self
            .producer
            .next_slice_offset(frame, self.slice_ack, self.ctx.field_id);
        if next == self.slice_ack {
            self.shared.state.store(SnState::NoNextSlice);
        }
        self.slice_ack = next;
    }

    /// Frame completed: recycle the buffer and fetch the next one.
    fn finish_frame(&mut self) {
        self.shared.stats.frms_send.fetch_add(1, Ordering::Relaxed);
        self.ctx.tmstamp = 0;
        self.ctx.line1_offset = 0;
        self.ctx.line2_offset = 0;
        self.ctx.line1_number = 0;
        self.ctx.line2_number = 1;
        self.ctx.slice_offset = 0;
        self.slice_ack = 0;
        if self.fmt.vscan.interlaced() {
            self.ctx.field_id ^= 1;
        }

        let prev = self.prod_buf.take();
        match self.producer.next_frame(prev, self.ctx.field_id) {
            Some(frame) => {
                let next = self
                    .producer
                    .next_slice_offset(&frame, 0, self.ctx.field_id);
                self.prod_buf = Some(frame);
                self.slice_ack = next;
                if next == 0 {
                    self.shared.state.store(SnState::NoNextSlice);
                }
            }
            None => {
                self.shared.state.store(SnState::NoNextFrame);
            }
        }
    }

    fn finish_head(&mut self, head: &mut [u8]) {
        patch_ip_id(head, self.ctx.ip_packet_id);
        self.ctx.ip_packet_id = self.ctx.ip_packet_id.wrapping_add(1);
    }

    /// Assemble one packet. Returns `None` when the session left RUN.
    pub fn build_packet(&mut self) -> Option<TxPacket> {
        if self.shared.state.load() != SnState::Run {
            return None;
        }
        let mut pkt = match self.fmt.pkt_fmt {
            PktFmt::IntelDualLine => self.build_dual_line(),
            PktFmt::IntelSingleLine | PktFmt::OtherSingleLine => self.build_single_line(),
        }?;
        if !self.hw_cksum {
            let tail = pkt.ext.as_ref().map(|e| e.bytes().to_vec()).unwrap_or_default();
            let cksum = udp_checksum(&pkt.head, &tail);
            pkt.head[crate::streaming::net::UDP_OFFSET + 6
                ..crate::streaming::net::UDP_OFFSET + 8]
                .copy_from_slice(&cksum.to_be_bytes());
        }
        self.shared.stats.pkts_send.fetch_add(1, Ordering::Relaxed);
        Some(pkt)
    }

    fn build_dual_line(&mut self) -> Option<TxPacket> {
        let fmt = &self.fmt;
        let width = fmt.width as u16;
        let pixels = fmt.pixels_in_pkt as u16;
        let line_size = fmt.line_size();
        let line_payload = fmt.line_payload() as usize;
        let frame = self.prod_buf.clone()?;

        let marker = self.ctx.line2_number + 1 == fmt.height as u16
            && self.ctx.line2_offset >= width - pixels;

        let tx_time = if self.ctx.align_tmstamp {
            self.ctx.align_tmstamp = false;
            self.align_packet_time()
        } else {
            0
        };

        let mut head = Vec::with_capacity(fmt.pkt_size as usize);
        head.extend_from_slice(&self.hdr_print);
        let rtp = &mut head[RTP_OFFSET..];
        rtp::patch_marker(rtp, marker);
        rtp::patch_sequence(rtp, self.ctx.sequence);
        rtp::patch_tmstamp(rtp, self.ctx.tmstamp);
        rtp::patch_u16(rtp, rtp::OFF_LINE1_NUMBER, self.ctx.line1_number & 0x7fff);
        rtp::patch_u16(rtp, rtp::OFF_LINE2_NUMBER, self.ctx.line2_number & 0x7fff);
        rtp::patch_u16(
            rtp,
            rtp::OFF_LINE1_OFFSET,
            self.ctx.line1_offset | LINE_CONTINUATION_BIT,
        );
        rtp::patch_u16(rtp, rtp::OFF_LINE2_OFFSET, self.ctx.line2_offset);

        let grp_bytes = |off: u16| -> u32 {
            off as u32 / crate::streaming::pack::PIXELS_PER_GROUP as u32
                * crate::streaming::pack::PIXEL_GROUP_SIZE as u32
        };
        let byte_ln1 = self.ctx.line1_number as u32 * line_size + grp_bytes(self.ctx.line1_offset);
        let byte_ln2 = self.ctx.line2_number as u32 * line_size + grp_bytes(self.ctx.line2_offset);

        let bytes = frame.bytes();
        head.extend_from_slice(&bytes[byte_ln1 as usize..byte_ln1 as usize + line_payload]);
        head.extend_from_slice(&bytes[byte_ln2 as usize..byte_ln2 as usize + line_payload]);
        self.finish_head(&mut head);

        // iterate to the next packet
        self.ctx.line1_offset += pixels;
        self.ctx.line2_offset += pixels;
        self.ctx.sequence = self.ctx.sequence.wrapping_add(1);
        if !marker && self.ctx.line2_offset >= width {
            self.ctx.line1_offset = 0;
            self.ctx.line2_offset = 0;
            self.ctx.line1_number += 2;
            self.ctx.line2_number += 2;
            self.ctx.slice_offset = byte_ln2 + line_payload as u32;
            self.ctx.align_tmstamp = true;
            self.poll_slice();
        }
        if marker {
            self.finish_frame();
        }

        Some(TxPacket {
            head,
            ext: None,
            tx_time,
        })
    }

    fn build_single_line(&mut self) -> Option<TxPacket> {
        let fmt = &self.fmt;
        let interlaced = fmt.vscan.interlaced();
        let field_lines = if interlaced {
            (fmt.height / 2) as u16
        } else {
            fmt.height as u16
        };
        let width = fmt.width as u16;
        let pixels = fmt.pixels_in_pkt as u16;
        let line_size = fmt.line_size();
        let frame = self.prod_buf.clone()?;

        let marker = self.ctx.line1_number + 1 == field_lines
            && self.ctx.line1_offset >= width.saturating_sub(pixels);

        let tx_time = if self.ctx.align_tmstamp {
            self.ctx.align_tmstamp = false;
            self.align_packet_time()
        } else {
            0
        };

        let grp_bytes = |off: u16| -> u32 {
            off as u32 / crate::streaming::pack::PIXELS_PER_GROUP as u32
                * crate::streaming::pack::PIXEL_GROUP_SIZE as u32
        };
        let offset_bytes = grp_bytes(self.ctx.line1_offset);
        // the line tail packet carries whatever is left of the line
        let length_left = fmt.line_payload().min(line_size - offset_bytes);

        let mut head = self.hdr_print.clone();
        let rtp = &mut head[RTP_OFFSET..];
        rtp::patch_marker(rtp, marker);
        rtp::patch_sequence(rtp, self.ctx.sequence);
        rtp::patch_tmstamp(rtp, self.ctx.tmstamp);
        let wire_line = if interlaced {
            self.ctx.line1_number | ((self.ctx.field_id as u16) << 15)
        } else {
            self.ctx.line1_number
        };
        rtp::patch_u16(rtp, rtp::OFF_LINE1_NUMBER, wire_line);
        rtp::patch_u16(rtp, rtp::OFF_LINE1_OFFSET, self.ctx.line1_offset);
        rtp::patch_u16(rtp, rtp::OFF_LINE1_LENGTH, length_left as u16);

        // interlaced sources are full rasters; a field reads every other
        // line of the buffer
        let buffer_line = if interlaced {
            self.ctx.line1_number as u32 * 2 + self.ctx.field_id as u32
        } else {
            self.ctx.line1_number as u32
        };
        let byte_ln1 = buffer_line * line_size + offset_bytes;
        self.finish_head(&mut head);

        let ext = PayloadRef {
            frame,
            offset: byte_ln1,
            len: length_left,
        };

        // iterate to the next packet
        self.ctx.line1_offset += pixels;
        self.ctx.sequence = self.ctx.sequence.wrapping_add(1);
        if !marker && self.ctx.line1_offset >= width {
            self.ctx.line1_offset = 0;
            self.ctx.line1_number += 1;
            self.ctx.align_tmstamp = self.ctx.line1_number & 1 != 0;
            self.ctx.slice_offset = byte_ln1 + length_left;
            self.poll_slice();
        }
        if marker {
            self.finish_frame();
        }

        Some(TxPacket {
            head,
            ext: Some(ext),
            tx_time,
        })
    }
}

// ---------------------------------------------------------------------------
// Enqueue thread
// ---------------------------------------------------------------------------

struct EnqueueSlot {
    session: VideoTxSession,
    ring: TxRingProd,
}

/// One enqueue thread: build PKTS_PER_BATCH packets per session per
/// round and push them into the session rings, in lockstep with the
/// sibling threads.
#[allow(clippy::too_many_arguments)]
fn enqueue_loop(
    thread_id: u32,
    mut slots: Vec<EnqueueSlot>,
    clock: Arc<PtpClock>,
    sync: Arc<SchedSync>,
    stop: Arc<AtomicBool>,
    sch_threads: u32,
) {
    // wait for every scheduler thread to come up
    sync.ring_start.wait(sch_threads);
    info!("enqueue thread {} streaming", thread_id);

    // Stopping never returns from inside a round: the sibling threads
    // are waiting at the barriers, so a leaving thread must pass them.
    while !stop.load(Ordering::Acquire) {
        sync.barrier1.sync(thread_id);

        let mut round_time = 0u64;
        let mut first_in_round = true;

        for slot in slots.iter_mut() {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let s = &mut slot.session;
            // bring the session to RUN, then renew the frame timestamp,
            // waiting out the epoch if this is the first session of the
            // round
            let mut frame_tx_time = 0u64;
            let mut ready = false;
            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                if !s.check_run_state() {
                    if s.shared.state.load() == SnState::Off {
                        break;
                    }
                    thread::sleep(Duration::from_micros(100));
                    continue;
                }
                if s.ctx.tmstamp == 0 {
                    let (tm, tx) =
                        s.get_frame_tmstamp(&clock, first_in_round, &mut round_time, &stop);
                    s.ctx.tmstamp = tm;
                    frame_tx_time = tx;
                    first_in_round = false;
                }
                ready = true;
                break;
            }
            if !ready {
                continue;
            }

            for j in 0..PKTS_PER_BATCH {
                let mut pkt = match s.build_packet() {
                    Some(p) => p,
                    None => break,
                };
                if j == 0 && frame_tx_time != 0 && pkt.tx_time == 0 {
                    pkt.tx_time = frame_tx_time;
                }
                // ring full: hand the period to the scheduler and retry
                loop {
                    match slot.ring.push(pkt) {
                        Ok(()) => break,
                        Err(back) => {
                            if stop.load(Ordering::Acquire) {
                                break;
                            }
                            pkt = back;
                            sync.sched_start.give(1);
                            std::hint::spin_loop();
                        }
                    }
                }
            }
        }

        sync.barrier2.sync(thread_id);
        sync.sched_start.give(1);
    }
}

// ---------------------------------------------------------------------------
// Device start
// ---------------------------------------------------------------------------

/// Split the session builders into data-plane threads and spawn them.
pub fn start_tx_device(
    mut dev: TxDevice,
    ptp: Option<Arc<PtpEngine>>,
) -> Result<TxHandle, StError> {
    let stop = Arc::new(AtomicBool::new(false));
    let shared_ring = crate::streaming::session::make_shared_ring();
    let mut sessions: Vec<Arc<SessionShared>> = Vec::new();
    let mut threads = Vec::new();

    let nic_tx_time = dev.port.link_speed().nic_tx_time_ns();
    let hw_cksum = dev.port.hw_checksum_offload();

    // rings: one per scheduler-visible slot, split prod/cons
    let max_sessions = dev.max_st21_sessions as usize;
    let mut prods: Vec<Option<TxRingProd>> = Vec::with_capacity(max_sessions);
    let mut conses = Vec::with_capacity(max_sessions);
    for _ in 0..max_sessions {
        let (p, c) = tx_ring(SESSION_RING_SIZE);
        prods.push(Some(p));
        conses.push(c);
    }

    // collect bound sessions per timeslot
    let mut tx_sessions: Vec<Option<VideoTxSession>> = (0..max_sessions).map(|_| None).collect();
    let mut occupied: Vec<usize> = Vec::new();
    for (slot, b) in dev.video.iter_mut().enumerate() {
        if let Some(builder) = b.take() {
            if builder.flow.is_none() {
                warn!("video session {} never bound, skipping", slot);
                continue;
            }
            sessions.push(builder.shared.clone());
            tx_sessions[slot] = Some(VideoTxSession::from_builder(builder, nic_tx_time, hw_cksum));
            occupied.push(slot);
        }
    }

    // the two-thread split needs at least two session rings to share
    let sch_threads = dev
        .nic_params
        .max_sch_threads
        .min(dev.max_st21_sessions)
        .max(1);
    let enq_threads = dev
        .nic_params
        .max_enq_threads
        .min(occupied.len().max(1) as u32);
    let sync = Arc::new(SchedSync::new(enq_threads));

    // enqueue threads: contiguous session ranges. With no video
    // sessions the schedulers idle on the shared ring and nothing else
    // is spawned here.
    let per_thread = occupied.len().div_ceil(enq_threads as usize).max(1);
    for tid in 0..if occupied.is_empty() { 0 } else { enq_threads } {
        let mut slots = Vec::new();
        for &slot in occupied
            .iter()
            .skip(tid as usize * per_thread)
            .take(per_thread)
        {
            slots.push(EnqueueSlot {
                session: tx_sessions[slot].take().expect("session assigned once"),
                ring: prods[slot].take().expect("ring assigned once"),
            });
        }
        let clock = dev.clock.clone();
        let sync = sync.clone();
        let stop = stop.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("st21-enq-{tid}"))
                .spawn(move || enqueue_loop(tid, slots, clock, sync, stop, sch_threads))
                .map_err(|_| StError::NoMemory("enqueue thread"))?,
        );
    }

    // audio and ancillary enqueue threads feed the shared ring
    let audio_builders: Vec<_> = dev
        .audio
        .iter_mut()
        .filter_map(|b| b.take())
        .filter(|b| b.flow.is_some())
        .collect();
    if !audio_builders.is_empty() {
        for b in &audio_builders {
            sessions.push(b.shared.clone());
        }
        let ring = shared_ring.clone();
        let clock = dev.clock.clone();
        let stop = stop.clone();
        let nic_tx = nic_tx_time;
        threads.push(
            thread::Builder::new()
                .name("st30-enq".into())
                .spawn(move || {
                    crate::streaming::audio::audio_tx_loop(audio_builders, ring, clock, stop, nic_tx)
                })
                .map_err(|_| StError::NoMemory("audio thread"))?,
        );
    }

    let anc_builders: Vec<_> = dev
        .anc
        .iter_mut()
        .filter_map(|b| b.take())
        .filter(|b| b.flow.is_some())
        .collect();
    if !anc_builders.is_empty() {
        for b in &anc_builders {
            sessions.push(b.shared.clone());
        }
        let ring = shared_ring.clone();
        let clock = dev.clock.clone();
        let stop = stop.clone();
        let nic_tx = nic_tx_time;
        threads.push(
            thread::Builder::new()
                .name("st40-enq".into())
                .spawn(move || {
                    crate::streaming::anc::anc_tx_loop(anc_builders, ring, clock, stop, nic_tx)
                })
                .map_err(|_| StError::NoMemory("anc thread"))?,
        );
    }

    // PTP delay requests leave through the shared ring too
    if let Some(engine) = ptp {
        let ring = shared_ring.clone();
        threads.push(
            thread::Builder::new()
                .name("ptp-delay-req".into())
                .spawn(move || engine.delay_req_loop(ring))
                .map_err(|_| StError::NoMemory("ptp thread"))?,
        );
    }

    // scheduler threads own the ring consumers
    let scheduler_threads = crate::streaming::sched::spawn_schedulers(
        &dev,
        conses,
        shared_ring.clone(),
        sync.clone(),
        stop.clone(),
        sch_threads,
    )?;
    threads.extend(scheduler_threads);

    Ok(TxHandle {
        stop,
        sync,
        shared_ring,
        timeslots: dev.timeslots.clone(),
        sessions,
        threads,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::format::{FrameRate, Vscan};
    use crate::streaming::net::Flow;
    use crate::streaming::session::{BindAddr, DeviceConfig};
    use crate::streaming::SessionStats;
    use crate::streaming::{AtomicSnState, Direction, Essence};
    use std::net::Ipv4Addr;

    /// Producer serving a fixed number of gradient frames.
    struct CountingProducer {
        frames_left: u32,
        frame_size: usize,
        handed_back: u32,
    }

    impl VideoProducer for CountingProducer {
        fn next_frame(
            &mut self,
            prev: Option<Arc<FrameBuf>>,
            _field_id: u8,
        ) -> Option<Arc<FrameBuf>> {
            if prev.is_some() {
                self.handed_back += 1;
            }
            if self.frames_left == 0 {
                return None;
            }
            self.frames_left -= 1;
            let data: Vec<u8> = (0..self.frame_size).map(|i| (i % 251) as u8).collect();
            Some(FrameBuf::from_vec(data))
        }

        fn next_slice_offset(&mut self, frame: &FrameBuf, _prev: u32, _field: u8) -> u32 {
            frame.len() as u32
        }
    }

    fn session(fmt: VideoFormat, frames: u32) -> VideoTxSession {
        let shared = Arc::new(SessionShared {
            timeslot: 0,
            essence: Essence::Video,
            direction: Direction::Producer,
            ssrc: 0x123450,
            state: AtomicSnState::new(SnState::On),
            stats: SessionStats::default(),
        });
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
        let frame_size = fmt.source_frame_size() as usize;
        let hdr = {
            // reuse the registry's renderer through a throwaway device
            let mut buf = vec![0u8; RTP_OFFSET + fmt.rtp_hdr_size()];
            crate::streaming::net::render_headers(&mut buf, &flow, fmt.pkt_size as u16);
            match fmt.pkt_fmt {
                PktFmt::IntelDualLine => rtp::Rfc4175Dual {
                    rtp: rtp::RtpHeader {
                        marker: false,
                        payload_type: rtp::PAYLOAD_TYPE_VIDEO,
                        seq_number: 0,
                        tmstamp: 0,
                        ssrc: 0x123450,
                    },
                    seq_ext: 0,
                    line1_length: fmt.line_payload() as u16,
                    line1_number: 0,
                    line1_offset: 0,
                    line2_length: fmt.line_payload() as u16,
                    line2_number: 1,
                    line2_offset: 0,
                }
                .encode(&mut buf[RTP_OFFSET..]),
                _ => rtp::Rfc4175Single {
                    rtp: rtp::RtpHeader {
                        marker: false,
                        payload_type: rtp::PAYLOAD_TYPE_VIDEO,
                        seq_number: 0,
                        tmstamp: 0,
                        ssrc: 0x123450,
                    },
                    seq_ext: 0,
                    line_length: fmt.line_payload() as u16,
                    line_number: 0,
                    field_id: 0,
                    line_offset: 0,
                    continuation: false,
                }
                .encode(&mut buf[RTP_OFFSET..]),
            }
            buf
        };
        let tprs = fmt.tprs(crate::streaming::format::PacerType::Tpn);
        let builder = VideoTxBuilder {
            shared,
            tr_offset: fmt.tr_offset(),
            tprs,
            pkt_time: 1000,
            fmt,
            flow: Some(flow),
            hdr_print: hdr,
            producer: Box::new(CountingProducer {
                frames_left: frames,
                frame_size,
                handed_back: 0,
            }),
        };
        VideoTxSession::from_builder(builder, 35_000, true)
    }

    fn fmt_single() -> VideoFormat {
        VideoFormat::new(Vscan::P1080, PktFmt::IntelSingleLine, FrameRate::P29_97).unwrap()
    }

    fn fmt_dual() -> VideoFormat {
        VideoFormat::new(Vscan::P1080, PktFmt::IntelDualLine, FrameRate::P29_97).unwrap()
    }

    #[test]
    fn test_single_line_walks_whole_frame() {
        let fmt = fmt_single();
        let mut s = session(fmt.clone(), 1);
        assert!(s.check_run_state());
        s.ctx.tmstamp = 90_000;

        let mut pkts = 0u32;
        let mut last_marker = false;
        while s.shared.state.load() == SnState::Run {
            let pkt = s.build_packet().unwrap();
            pkts += 1;
            let hdr = rtp::Rfc4175Single::decode(&pkt.head[RTP_OFFSET..]).unwrap();
            last_marker = hdr.rtp.marker;
            if pkts > fmt.pkts_in_frame {
                break;
            }
        }
        assert_eq!(pkts, fmt.pkts_in_frame);
        assert!(last_marker);
        // producer exhausted: next round parks the session
        assert_eq!(s.shared.state.load(), SnState::NoNextFrame);
    }

    #[test]
    fn test_single_line_payload_is_zero_copy_and_correct() {
        let fmt = fmt_single();
        let mut s = session(fmt.clone(), 1);
        assert!(s.check_run_state());
        s.ctx.tmstamp = 1;

        // second packet of line 0 covers bytes 1200..2400
        let _first = s.build_packet().unwrap();
        let second = s.build_packet().unwrap();
        let ext = second.ext.as_ref().unwrap();
        assert_eq!(ext.offset, 1200);
        assert_eq!(ext.len, 1200);
        let hdr = rtp::Rfc4175Single::decode(&second.head[RTP_OFFSET..]).unwrap();
        assert_eq!(hdr.line_number, 0);
        assert_eq!(hdr.line_offset, 480);
        assert_eq!(hdr.sequence(), 1);
        let expect: Vec<u8> = (1200..2400).map(|i| (i % 251) as u8).collect();
        assert_eq!(ext.bytes(), &expect[..]);
    }

    #[test]
    fn test_dual_line_marker_and_wrap() {
        let fmt = fmt_dual();
        let mut s = session(fmt.clone(), 1);
        assert!(s.check_run_state());
        s.ctx.tmstamp = 42;

        let mut seq = 0u32;
        let mut markers = 0;
        for _ in 0..fmt.pkts_in_frame {
            let pkt = s.build_packet().unwrap();
            let hdr = rtp::Rfc4175Dual::decode(&pkt.head[RTP_OFFSET..]).unwrap();
            assert_eq!(hdr.sequence(), seq);
            // dual-line wire format always flags line-1 continuation
            assert!(rtp::Rfc4175Dual::line1_continuation(&pkt.head[RTP_OFFSET..]));
            assert_eq!(hdr.line2_number, hdr.line1_number + 1);
            if hdr.rtp.marker {
                markers += 1;
                assert_eq!(hdr.line2_number, fmt.height as u16 - 1);
            }
            // payload rides inline: header + 1200 bytes
            assert_eq!(pkt.head.len(), fmt.pkt_size as usize);
            assert!(pkt.ext.is_none());
            seq += 1;
        }
        assert_eq!(markers, 1);
    }

    #[test]
    fn test_short_tail_720p() {
        let fmt =
            VideoFormat::new(Vscan::P720, PktFmt::IntelSingleLine, FrameRate::P50).unwrap();
        let mut s = session(fmt.clone(), 1);
        assert!(s.check_run_state());
        s.ctx.tmstamp = 7;

        // third packet of a line is the 800-byte tail
        let _p0 = s.build_packet().unwrap();
        let _p1 = s.build_packet().unwrap();
        let tail = s.build_packet().unwrap();
        let hdr = rtp::Rfc4175Single::decode(&tail.head[RTP_OFFSET..]).unwrap();
        assert_eq!(hdr.line_length, 800);
        assert_eq!(tail.ext.as_ref().unwrap().len, 800);
        // next packet starts line 1
        let p3 = s.build_packet().unwrap();
        let hdr3 = rtp::Rfc4175Single::decode(&p3.head[RTP_OFFSET..]).unwrap();
        assert_eq!(hdr3.line_number, 1);
        assert_eq!(hdr3.line_offset, 0);
    }

    #[test]
    fn test_interlaced_field_toggle() {
        let fmt =
            VideoFormat::new(Vscan::I1080, PktFmt::OtherSingleLine, FrameRate::P29_97).unwrap();
        let mut s = session(fmt.clone(), 2);
        assert!(s.check_run_state());
        s.ctx.tmstamp = 5;

        for _ in 0..fmt.pkts_in_frame {
            s.build_packet().unwrap();
        }
        // field completed: id toggles for the second field
        assert_eq!(s.ctx.field_id, 1);
        s.ctx.tmstamp = 6;
        let pkt = s.build_packet().unwrap();
        let hdr = rtp::Rfc4175Single::decode(&pkt.head[RTP_OFFSET..]).unwrap();
        assert_eq!(hdr.field_id, 1);
    }

    // PTP cold start: the first timestamp call must initialise the epoch
    // from the current PTP time and derive the 90 kHz timestamp from it.
    #[test]
    fn test_cold_start_epoch_init() {
        let fmt = fmt_single();
        let mut s = session(fmt.clone(), 1);
        let clock = PtpClock::new();
        let stop = AtomicBool::new(false);
        let mut round = 0u64;

        assert_eq!(s.ctx.epochs, 0);
        let (tm, tx_time) = s.get_frame_tmstamp(&clock, false, &mut round, &stop);
        assert_ne!(s.ctx.epochs, 0);
        let now_epochs = round / fmt.frame_time_ns;
        assert!(s.ctx.epochs == now_epochs || s.ctx.epochs == now_epochs + 1);
        let expect = (s.ctx.epochs as f64 * fmt.frame_ticks_90k()) as u64 as u32;
        assert_eq!(tm, expect);
        assert!(tx_time > 0);
    }

    #[test]
    fn test_epoch_classification_same_and_late() {
        let fmt = fmt_single();
        let mut s = session(fmt.clone(), 1);
        let clock = PtpClock::new();
        let stop = AtomicBool::new(false);

        let mut round = 0u64;
        let _ = s.get_frame_tmstamp(&clock, false, &mut round, &stop);
        let e0 = s.ctx.epochs;

        // same epoch again: builder advances to the next epoch
        let mut round2 = e0 * fmt.frame_time_ns + fmt.frame_time_ns / 2;
        let _ = s.get_frame_tmstamp(&clock, false, &mut round2, &stop);
        assert_eq!(s.ctx.epochs, e0 + 1);

        // exactly one late: accepted without skip
        let mut round3 = (e0 + 2) * fmt.frame_time_ns + 1;
        let _ = s.get_frame_tmstamp(&clock, false, &mut round3, &stop);
        assert_eq!(s.ctx.epochs, e0 + 2);

        // far ahead: re-anchor
        let mut round4 = (e0 + 100) * fmt.frame_time_ns + 1;
        let _ = s.get_frame_tmstamp(&clock, false, &mut round4, &stop);
        assert!(s.ctx.epochs >= e0 + 100);
    }

    #[test]
    fn test_stop_pending_drains() {
        let fmt = fmt_single();
        let mut s = session(fmt, 5);
        assert!(s.check_run_state());
        s.ctx.tmstamp = 1;
        let _ = s.build_packet().unwrap();
        s.shared.state.store(SnState::StopPending);
        assert!(!s.check_run_state());
        assert_eq!(s.shared.state.load(), SnState::Off);
        assert!(s.prod_buf.is_none());
    }

    #[test]
    fn test_device_start_and_shutdown() {
        use crate::streaming::format::{LinkSpeed, PacerType};
        use crate::streaming::nic::LoopbackPort;
        use crate::streaming::ptp::PtpClock;
        use crate::streaming::session::TxDevice;

        let port = Arc::new(LoopbackPort::new(
            [2, 0, 0, 0, 0, 1],
            LinkSpeed::G10,
            2,
            2,
        ));
        let clock = PtpClock::new();
        let mut cfg = DeviceConfig::new(FrameRate::P29_97, PacerType::Tpn);
        cfg.max_st21_sessions = Some(1);
        let mut dev = TxDevice::create(port.clone(), clock, cfg, Vscan::P1080).unwrap();
        let fmt = fmt_single();
        let frame_size = fmt.source_frame_size() as usize;
        let sn = dev
            .create_video_session(
                fmt,
                0x123450,
                Box::new(CountingProducer {
                    frames_left: 1,
                    frame_size,
                    handed_back: 0,
                }),
            )
            .unwrap();
        dev.bind_video(
            sn.timeslot,
            &BindAddr {
                src_ip: Ipv4Addr::new(192, 168, 0, 1),
                dst_ip: Ipv4Addr::new(239, 0, 0, 1),
                src_port: 10000,
                dst_port: 10000,
                dst_mac: None,
            },
        )
        .unwrap();
        let handle = dev.start(None).unwrap();
        // one frame's worth of packets eventually shows up on the wire
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while port.tx_l1_bytes() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(port.tx_l1_bytes() > 0);
        handle.shutdown();
    }
}
