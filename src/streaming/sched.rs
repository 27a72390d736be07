//! TPRS scheduler: deterministic round-robin with PAUSE filling.
//!
//! Each scheduler thread drains its session rings into burst vectors
//! for the NIC. A byte cursor walks precomputed per-ring thresholds:
//! every slot either emits real packets or synthetic 802.3x PAUSE
//! frames sized to the slot, so the cumulative bytes on the wire per
//! frame time always equal the device byte quota - that is what keeps
//! every session inside its ST 2110-21 envelope. Leftover budget falls
//! into the out-of-bound ring as one trailing PAUSE.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::info;

use crate::streaming::net::{build_pause_template, MIN_PKT_L1_SIZE, MIN_PKT_SIZE, PHY_OVERHEAD};
use crate::streaming::nic::{NicPort, WirePacket};
use crate::streaming::ptp::PtpClock;
use crate::streaming::ring::{SchedSync, SharedRing, TxRingCons};
use crate::streaming::session::{TxDevice, BUDGET_DENOM};
use crate::streaming::StError;

/// Packets whose launch time is this far in the future cut the burst.
pub const SCHED_TMSTAMP_TOLERANCE_NS: u64 = 100;
/// A launch time this far out is a stale request: cleared, sent ASAP.
pub const SCHED_TMSTAMP_CLEAR_NS: u64 = 34_000_000;

/// Gap left by the 720p line-tail packet, the one expected sub-slot gap.
const DEFAULT_LEFT_BYTES_720P: i64 = 2 * (1200 - 800);

/// What a dispatch slot resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    /// Session ring (media or pause substitution).
    Session,
    /// Extra ring fed from the shared control ring.
    Extra,
    /// Out-of-bound: leftover budget as one PAUSE.
    OutOfBound,
}

/// Per-thread scheduler state.
pub struct TprsScheduler {
    pub thread_id: u32,
    pub queue_id: u16,
    bulk: bool,

    quot: u32,
    remaind: u32,
    time_cursor: i64,
    time_remaind: u32,

    ring: usize,
    last_sn_ring: usize,
    last_tx_ring: usize,
    out_of_bound_ring: usize,

    ring_thresh_hi: Vec<i64>,
    ring_thresh_lo: Vec<i64>,
    /// Local ring index to global ring (timeslot / extra slot).
    deq_ring_map: Vec<usize>,
    /// Global per-ring provisioned L1 sizes.
    pkt_size_l1: Vec<u32>,

    /// L1 budget of the slot currently dispatched.
    pkt_size: u32,
    min_pkt_size: u32,

    pause_template: Arc<Vec<u8>>,
    burst: Vec<Option<WirePacket>>,
    burst_size: usize,
    top: usize,

    pub packets_tx: Vec<u64>,
    pub pauses_tx: Vec<u64>,
}

impl TprsScheduler {
    /// Build the threshold tables for one scheduler thread, mirroring
    /// the 1- and 2-thread ring layouts.
    pub fn init(dev_quot: u32, dev_remaind: u32, pkt_size_l1: &[u32], max_sessions: u32,
        max_rings: u32, sch_threads: u32, thread_id: u32, bulk: bool, src_mac: [u8; 6],
    ) -> TprsScheduler {
        let max_rings = max_rings as usize;
        let max_sessions = max_sessions as usize;
        let threads = sch_threads as usize;
        let tid = thread_id as usize;

        let mut quot;
        let remaind;
        let last_sn_ring;
        let mut last_tx_ring;
        let mut out_of_bound_ring;
        let mut deq_ring_map = vec![0usize; max_rings + 2];

        if threads == 2 {
            let left_quot: u32 =
                dev_quot - pkt_size_l1.iter().take(max_rings).sum::<u32>();
            last_sn_ring = max_sessions / 2 - 1;
            out_of_bound_ring = max_rings / 2;
            if max_rings % 2 == 1 {
                last_tx_ring = if tid == 0 {
                    out_of_bound_ring
                } else {
                    out_of_bound_ring - 1
                };
            } else {
                last_tx_ring = out_of_bound_ring - 1;
                if tid == 0 {
                    // the out-of-bound ring lives on the last thread
                    out_of_bound_ring -= 1;
                    last_tx_ring = out_of_bound_ring;
                }
            }
            let mut q = 0u32;
            for i in 0..=last_tx_ring.min(max_rings / 2 - 1) {
                let dev_ring = i * threads + tid;
                if dev_ring < max_rings {
                    q += pkt_size_l1[dev_ring];
                }
            }
            quot = q;
            if tid == 0 {
                remaind = 0;
            } else {
                quot += left_quot;
                remaind = dev_remaind;
            }
        } else {
            last_tx_ring = max_rings - 1;
            out_of_bound_ring = max_rings;
            last_sn_ring = max_sessions - 1;
            quot = dev_quot;
            remaind = dev_remaind;
        }

        let min_pkt_size = MIN_PKT_L1_SIZE as u32;
        let mut hi = vec![0i64; last_tx_ring + 2];
        let mut lo = vec![0i64; last_tx_ring + 2];
        let mut q = quot as i64;
        for i in 0..=last_sn_ring {
            let dev_ring = i * threads + tid;
            hi[i] = q + min_pkt_size as i64;
            q -= pkt_size_l1[dev_ring] as i64;
            lo[i] = q + min_pkt_size as i64;
            deq_ring_map[i] = dev_ring;
        }
        for i in last_sn_ring + 1..=last_tx_ring {
            let dev_ring = (i * threads + tid).min(pkt_size_l1.len() - 1);
            hi[i] = q + min_pkt_size as i64;
            q -= pkt_size_l1[dev_ring] as i64;
            lo[i] = q + min_pkt_size as i64;
            deq_ring_map[i] = dev_ring;
        }
        deq_ring_map[out_of_bound_ring] = max_rings;

        info!(
            "scheduler {}: quot {} rings {}..{} oob {}",
            thread_id, quot, last_sn_ring, last_tx_ring, out_of_bound_ring
        );

        let vect = last_tx_ring + 2;
        TprsScheduler {
            thread_id,
            queue_id: thread_id as u16,
            bulk,
            quot,
            remaind,
            time_cursor: 0,
            time_remaind: 0,
            ring: 0,
            last_sn_ring,
            last_tx_ring,
            out_of_bound_ring,
            ring_thresh_hi: hi,
            ring_thresh_lo: lo,
            deq_ring_map,
            pkt_size_l1: pkt_size_l1.to_vec(),
            pkt_size: pkt_size_l1.first().copied().unwrap_or(1538),
            min_pkt_size,
            pause_template: Arc::new(build_pause_template(src_mac)),
            burst: Vec::new(),
            burst_size: 0,
            top: 0,
            packets_tx: vec![0; max_rings + 1],
            pauses_tx: vec![0; max_rings + 1],
        }
        .with_burst_capacity(vect)
    }

    fn with_burst_capacity(mut self, vect: usize) -> TprsScheduler {
        let rounds = if self.bulk { 4 } else { 1 };
        self.burst = Vec::with_capacity(rounds * 2 * vect);
        self
    }

    /// Build from a created device.
    pub fn for_device(dev: &TxDevice, sch_threads: u32, thread_id: u32) -> TprsScheduler {
        TprsScheduler::init(
            dev.budget.quot,
            dev.budget.remaind,
            &dev.tx_pkt_size_l1,
            dev.max_st21_sessions,
            dev.budget.max_rings,
            sch_threads,
            thread_id,
            dev.cfg.bulk_dequeue,
            dev.port.mac(),
        )
    }

    fn vect_size(&self) -> usize {
        self.last_tx_ring + 1
    }

    fn vect_size_n_pauses(&self) -> usize {
        if self.last_tx_ring != self.out_of_bound_ring {
            self.vect_size() + 1
        } else {
            self.vect_size()
        }
    }

    /// Map the byte cursor to the slot whose threshold interval holds it.
    fn dispatch_time_cursor(&mut self) -> (usize, SlotKind) {
        if self.ring == self.out_of_bound_ring || self.time_cursor == 0 {
            self.ring = 0;
            self.pkt_size = self.pkt_size_l1[self.deq_ring_map[0]];
            return (0, SlotKind::Session);
        }
        for i in self.ring + 1..=self.last_tx_ring {
            if self.time_cursor <= self.ring_thresh_hi[i] && self.time_cursor > self.ring_thresh_lo[i]
            {
                self.ring = i;
                let dev_ring = self.deq_ring_map[i];
                self.pkt_size = self.pkt_size_l1[dev_ring.min(self.pkt_size_l1.len() - 1)];
                let kind = if i <= self.last_sn_ring {
                    SlotKind::Session
                } else {
                    SlotKind::Extra
                };
                return (i, kind);
            }
        }
        self.ring = self.out_of_bound_ring;
        self.pkt_size = self.time_cursor.max(0) as u32;
        (self.ring, SlotKind::OutOfBound)
    }

    /// Top up the cursor with one slot's worth of budget, carrying the
    /// sub-byte remainder across iterations.
    fn replenish(&mut self) {
        self.time_cursor += self.quot as i64;
        self.time_remaind += self.remaind;
        if self.time_remaind >= BUDGET_DENOM {
            self.time_remaind -= BUDGET_DENOM;
            self.time_cursor += 1;
        }
    }

    fn pause(&self, l1_size: u32) -> WirePacket {
        let l1 = (l1_size & !1).max(MIN_PKT_L1_SIZE as u32);
        WirePacket::Pause {
            template: self.pause_template.clone(),
            l2_len: (l1 as usize).saturating_sub(PHY_OVERHEAD).max(MIN_PKT_SIZE),
        }
    }

    fn place(&mut self, idx: usize, pkt: WirePacket) {
        if idx >= self.burst.len() {
            self.burst.resize_with(idx + 1, || None);
        }
        self.burst[idx] = Some(pkt);
        self.burst_size += 1;
    }

    /// Emit a session's packet batch; cursor pays the average L1 size.
    fn fill_packets(&mut self, i: usize, dev_ring: usize, pkts: Vec<WirePacket>) -> u32 {
        let n = pkts.len();
        let vect = self.vect_size();
        let total: usize = pkts.iter().map(|p| p.l2_len()).sum();
        for (r, pkt) in pkts.into_iter().enumerate() {
            self.place(r * vect + i, pkt);
        }
        self.packets_tx[dev_ring] += n as u64;
        let phy = PHY_OVERHEAD as u32 + (total / n) as u32;
        self.time_cursor -= phy as i64;
        phy
    }

    /// No packets on an active ring: substitute pauses of the slot size.
    fn fill_pause(&mut self, i: usize, dev_ring: usize) {
        let rounds = if self.bulk { 4 } else { 1 };
        let vect = self.vect_size();
        let pause_l1 = self.pkt_size & !1;
        for r in 0..rounds {
            self.place(r * vect + i, self.pause(pause_l1));
        }
        self.pauses_tx[dev_ring] += rounds as u64;
        self.time_cursor -= pause_l1 as i64;
    }

    /// Short packets leave a gap before the next slot; fill it so the
    /// wire time still adds up (the 720p line tail is the usual case).
    fn fill_gap(&mut self, dev_ring: usize, phy_pkt_size: u32) {
        let left = self.pkt_size_l1[dev_ring] as i64 - phy_pkt_size as i64;
        if left <= MIN_PKT_L1_SIZE as i64 {
            return;
        }
        let rounds = if self.bulk { 4 } else { 1 };
        if !self.bulk || left * 4 <= DEFAULT_LEFT_BYTES_720P {
            // one pause covering every round's gap
            let pause_l1 = (left * rounds as i64) as u32;
            let idx = self.top;
            self.top += 1;
            self.place(idx, self.pause(pause_l1));
            self.pauses_tx[dev_ring] += 1;
            self.time_cursor -= (pause_l1 & !1) as i64;
        } else {
            // unexpectedly large gap: one pause per round
            let pause_l1 = (left as u32) & !1;
            for _ in 0..rounds {
                let idx = self.top;
                self.top += 1;
                self.place(idx, self.pause(pause_l1));
            }
            self.pauses_tx[dev_ring] += rounds as u64;
            self.time_cursor -= rounds as i64 * pause_l1 as i64;
        }
    }

    /// Out-of-bound: burn the remaining cursor as one trailing PAUSE.
    fn fill_oob(&mut self, dev_ring: usize) {
        if self.time_cursor < MIN_PKT_SIZE as i64 {
            return;
        }
        let rounds = if self.bulk { 4 } else { 1 };
        let total = self.time_cursor * rounds as i64;
        if total <= crate::streaming::net::DEFAULT_PKT_L1_SIZE as i64 {
            let idx = self.top;
            self.top += 1;
            self.place(idx, self.pause(total as u32));
            self.pauses_tx[dev_ring] += 1;
            self.time_cursor = 0;
        } else {
            let pause_l1 = (self.time_cursor as u32) & !1;
            for _ in 0..rounds {
                let idx = self.top;
                self.top += 1;
                self.place(idx, self.pause(pause_l1));
            }
            self.pauses_tx[dev_ring] += rounds as u64;
            self.time_cursor -= pause_l1 as i64;
        }
    }

    /// Assemble one burst. Returns false at end-of-period (the first
    /// session ring ran dry).
    fn build_burst(
        &mut self,
        rings: &mut [TxRingCons],
        shared: &SharedRing,
    ) -> bool {
        let rounds = if self.bulk { 4 } else { 1 };
        self.burst.clear();
        self.burst
            .resize_with(rounds * 2 * self.vect_size_n_pauses(), || None);
        self.burst_size = 0;
        self.top = rounds * self.vect_size();

        for i in 0..self.vect_size_n_pauses() {
            let (slot, kind) = self.dispatch_time_cursor();
            match kind {
                SlotKind::Session => {
                    let dev_ring = self.deq_ring_map[slot];
                    let pkts = Self::deq_session(&mut rings[slot], rounds);
                    match pkts {
                        None if slot == 0 => return false,
                        None => self.fill_pause(i, dev_ring),
                        Some(pkts) => {
                            if slot == 0 {
                                self.replenish();
                            }
                            let phy = self.fill_packets(i, dev_ring, pkts);
                            self.fill_gap(dev_ring, phy);
                        }
                    }
                }
                SlotKind::Extra => {
                    let dev_ring = self.deq_ring_map[slot].min(self.pkt_size_l1.len() - 1);
                    let mut got = Vec::new();
                    for _ in 0..rounds {
                        match shared.pop() {
                            Some(p) => got.push(WirePacket::Media(p)),
                            None => break,
                        }
                    }
                    if got.len() == rounds {
                        let phy = self.fill_packets(i, dev_ring, got);
                        self.fill_gap(dev_ring, phy);
                    } else {
                        // mix of control packets and pauses
                        let vect = self.vect_size();
                        let n = got.len();
                        let mut l2_total = 0usize;
                        for (r, pkt) in got.into_iter().enumerate() {
                            l2_total += pkt.l2_len();
                            self.place(r * vect + i, pkt);
                        }
                        self.packets_tx[dev_ring] += n as u64;
                        let pause_l1 = self.pkt_size & !1;
                        for r in n..rounds {
                            self.place(r * vect + i, self.pause(pause_l1));
                            self.pauses_tx[dev_ring] += 1;
                        }
                        let pause_l2 = pause_l1 as usize - PHY_OVERHEAD;
                        let avg = (l2_total + (rounds - n) * pause_l2) / rounds;
                        self.time_cursor -= PHY_OVERHEAD as i64 + avg as i64;
                    }
                }
                SlotKind::OutOfBound => {
                    let dev_ring = self.pkt_size_l1.len();
                    self.fill_oob(dev_ring.min(self.pauses_tx.len() - 1));
                    break;
                }
            }
        }
        true
    }

    fn deq_session(ring: &mut TxRingCons, rounds: usize) -> Option<Vec<WirePacket>> {
        if rounds == 4 {
            ring.pop_bulk4()
                .map(|pkts| pkts.into_iter().map(WirePacket::Media).collect())
        } else {
            ring.pop().map(|p| vec![WirePacket::Media(p)])
        }
    }

    /// Hand the burst to the port, honouring launch times: the burst is
    /// cut at the first packet scheduled beyond now + tolerance, and
    /// far-future launch times are treated as stale and cleared.
    fn transmit(
        &mut self,
        port: &dyn NicPort,
        clock: &PtpClock,
        stop: &AtomicBool,
    ) {
        let mut frames: VecDeque<WirePacket> = self.burst.drain(..).flatten().collect();
        while !frames.is_empty() {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let now = clock.now_ns() + SCHED_TMSTAMP_TOLERANCE_NS;
            let mut cut = frames.len();
            for (idx, pkt) in frames.iter_mut().enumerate() {
                let t = pkt.tx_time();
                if t > now {
                    if t > now + SCHED_TMSTAMP_CLEAR_NS {
                        pkt.clear_tx_time();
                        continue;
                    }
                    cut = idx;
                    break;
                }
            }
            if cut == 0 {
                // head packet is not due yet; hold the line
                thread::yield_now();
                continue;
            }
            let mut chunk: VecDeque<WirePacket> = frames.drain(..cut).collect();
            while !chunk.is_empty() {
                if port.tx_burst(self.queue_id, &mut chunk) == 0 {
                    std::hint::spin_loop();
                }
            }
        }
        self.burst_size = 0;
    }

    /// One scheduler period: drain every session's enqueued batch into
    /// paced bursts until the first session ring runs dry.
    pub fn run_period(
        &mut self,
        rings: &mut [TxRingCons],
        shared: &SharedRing,
        port: &dyn NicPort,
        clock: &PtpClock,
        stop: &AtomicBool,
    ) {
        self.time_cursor = 0;
        self.ring = 0;
        loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            if !self.build_burst(rings, shared) {
                return;
            }
            self.transmit(port, clock, stop);
        }
    }
}

// ---------------------------------------------------------------------------
// Thread spawn
// ---------------------------------------------------------------------------

/// Spawn the scheduler threads for a device; `conses` are the session
/// ring consumers indexed by timeslot.
pub fn spawn_schedulers(
    dev: &TxDevice,
    mut conses: Vec<TxRingCons>,
    shared: Arc<SharedRing>,
    sync: Arc<SchedSync>,
    stop: Arc<AtomicBool>,
    sch_threads: u32,
) -> Result<Vec<JoinHandle<()>>, StError> {
    let mut handles = Vec::new();
    // local ring i of thread t is global ring i * sch_threads + t
    let mut per_thread: Vec<Vec<TxRingCons>> = (0..sch_threads).map(|_| Vec::new()).collect();
    for (slot, cons) in conses.drain(..).enumerate() {
        per_thread[slot % sch_threads as usize].push(cons);
    }

    for tid in 0..sch_threads {
        let mut sch = TprsScheduler::for_device(dev, sch_threads, tid);
        let mut rings = per_thread.remove(0);
        // pad so every session slot the thresholds cover has a ring
        while rings.len() <= sch.last_sn_ring {
            let (_, cons) = crate::streaming::ring::tx_ring(2);
            rings.push(cons);
        }
        let shared = shared.clone();
        let sync = sync.clone();
        let stop = stop.clone();
        let port = dev.port.clone();
        let clock = dev.clock.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("st21-sched-{tid}"))
                .spawn(move || {
                    sync.ring_start.give(1);
                    while !stop.load(Ordering::Acquire) {
                        // between periods: drain control traffic
                        while !sync.sched_start.is_set() {
                            if stop.load(Ordering::Acquire) {
                                return;
                            }
                            if let Some(pkt) = shared.pop() {
                                let mut one: VecDeque<WirePacket> =
                                    VecDeque::from([WirePacket::Media(pkt)]);
                                while !one.is_empty() {
                                    if port.tx_burst(sch.queue_id, &mut one) == 0 {
                                        std::hint::spin_loop();
                                    }
                                }
                            } else {
                                std::hint::spin_loop();
                            }
                        }
                        sch.run_period(&mut rings, &shared, port.as_ref(), &clock, &stop);
                        if tid == 0 {
                            sync.sched_start.clear();
                        }
                    }
                })
                .map_err(|_| StError::NoMemory("scheduler thread"))?,
        );
    }
    Ok(handles)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::format::LinkSpeed;
    use crate::streaming::nic::{LoopbackPort, TxPacket};
    use crate::streaming::ring::tx_ring;

    const QUOT: u32 = 10_420; // 10G, 1080p29 gapped per-slot budget
    const REMAIND: u32 = 2168;

    fn scheduler(sessions: u32, rings_total: u32, bulk: bool) -> TprsScheduler {
        let mut l1 = vec![1286u32; sessions as usize];
        l1.extend(std::iter::repeat(1538).take((rings_total - sessions) as usize));
        TprsScheduler::init(
            QUOT,
            REMAIND,
            &l1,
            sessions,
            rings_total,
            1,
            0,
            bulk,
            [2, 0, 0, 0, 0, 1],
        )
    }

    fn media(len: usize, tx_time: u64) -> TxPacket {
        TxPacket {
            head: vec![0u8; len],
            ext: None,
            tx_time,
        }
    }

    #[test]
    fn test_thresholds_cover_budget() {
        let sch = scheduler(2, 4, true);
        // intervals descend and stay disjoint
        for i in 1..=sch.last_tx_ring {
            assert!(sch.ring_thresh_hi[i] > sch.ring_thresh_lo[i]);
            if i > 1 {
                assert_eq!(sch.ring_thresh_lo[i - 1], sch.ring_thresh_hi[i]);
            }
        }
    }

    // P2: over one period the wire carries quota +- one packet slot per
    // replenish, pauses included.
    #[test]
    fn test_scheduler_conserves_bytes() {
        let port = LoopbackPort::new([2, 0, 0, 0, 0, 1], LinkSpeed::G10, 1, 1);
        let clock = PtpClock::new();
        let stop = AtomicBool::new(false);
        let shared = SharedRing::new(16);

        let mut sch = scheduler(2, 4, true);
        let (mut p0, c0) = tx_ring(64);
        let (mut p1, c1) = tx_ring(64);
        // session 0 supplies 4 batches; session 1 only one (pause fill)
        let batches = 4;
        for _ in 0..batches * 4 {
            p0.push(media(1262, 0)).map_err(|_| ()).unwrap();
        }
        for _ in 0..4 {
            p1.push(media(1262, 0)).map_err(|_| ()).unwrap();
        }
        let mut rings = vec![c0, c1];
        sch.run_period(&mut rings, &shared, &port, &clock, &stop);

        // each replenish covers one slot of the device budget; bulk mode
        // walks 4 rounds per replenish
        let expected = batches as u64 * 4 * (QUOT as u64 + 1); // remainder carries
        let got = port.tx_l1_bytes();
        let slop = 4 * 1538;
        assert!(
            got + slop as u64 >= expected && got <= expected + slop as u64,
            "wire bytes {} vs budget {}",
            got,
            expected
        );
        // session 1 starved after its first batch: pauses stood in
        assert!(sch.pauses_tx.iter().sum::<u64>() > 0);
        assert_eq!(sch.packets_tx[0], (batches * 4) as u64);
    }

    // P3: within a session, launch times are monotonic in NIC order.
    #[test]
    fn test_monotonic_tx_times_within_session() {
        let port = LoopbackPort::new([2, 0, 0, 0, 0, 1], LinkSpeed::G10, 1, 1);
        let clock = PtpClock::new();
        let stop = AtomicBool::new(false);
        let shared = SharedRing::new(16);

        let mut sch = scheduler(1, 2, true);
        let (mut p0, c0) = tx_ring(64);
        let base = clock.now_ns();
        for i in 0..8u64 {
            // already-due launch times, strictly increasing
            p0.push(media(1262, base.saturating_sub(1000) + i))
                .map_err(|_| ())
                .unwrap();
        }
        let mut rings = vec![c0];
        sch.run_period(&mut rings, &shared, &port, &clock, &stop);

        let sent = port.drain_tx(0);
        let times: Vec<u64> = sent
            .iter()
            .filter(|(f, _)| f.len() == 1262)
            .map(|&(_, t)| t)
            .collect();
        assert_eq!(times.len(), 8);
        for w in times.windows(2) {
            assert!(w[1] > w[0], "tx times not monotonic: {:?}", times);
        }
    }

    #[test]
    fn test_pause_fill_for_starved_ring() {
        let port = LoopbackPort::new([2, 0, 0, 0, 0, 1], LinkSpeed::G10, 1, 1);
        let clock = PtpClock::new();
        let stop = AtomicBool::new(false);
        let shared = SharedRing::new(16);

        let mut sch = scheduler(2, 4, true);
        let (mut p0, c0) = tx_ring(64);
        let (_p1, c1) = tx_ring(64);
        for _ in 0..4 {
            p0.push(media(1262, 0)).map_err(|_| ()).unwrap();
        }
        let mut rings = vec![c0, c1];
        sch.run_period(&mut rings, &shared, &port, &clock, &stop);

        // ring 1 never had packets: the wire got pauses instead
        assert!(sch.pauses_tx[1] >= 4);
        let sent = port.drain_tx(0);
        let pauses = sent
            .iter()
            .filter(|(f, _)| u16::from_be_bytes([f[12], f[13]]) == 0x8808)
            .count();
        assert!(pauses > 0);
    }

    #[test]
    fn test_stale_launch_time_cleared() {
        let port = LoopbackPort::new([2, 0, 0, 0, 0, 1], LinkSpeed::G10, 1, 1);
        let clock = PtpClock::new();
        let stop = AtomicBool::new(false);
        let shared = SharedRing::new(16);

        let mut sch = scheduler(1, 2, true);
        let (mut p0, c0) = tx_ring(64);
        let far = clock.now_ns() + 10 * SCHED_TMSTAMP_CLEAR_NS;
        p0.push(media(1262, far)).map_err(|_| ()).unwrap();
        for _ in 0..3 {
            p0.push(media(1262, 0)).map_err(|_| ()).unwrap();
        }
        let mut rings = vec![c0];
        sch.run_period(&mut rings, &shared, &port, &clock, &stop);

        // the out-of-range request went out immediately with time cleared
        let sent = port.drain_tx(0);
        let media_times: Vec<u64> = sent
            .iter()
            .filter(|(f, _)| f.len() == 1262)
            .map(|&(_, t)| t)
            .collect();
        assert_eq!(media_times.len(), 4);
        assert_eq!(media_times[0], 0);
    }

    #[test]
    fn test_shared_ring_control_packets_ride_extra_slot() {
        let port = LoopbackPort::new([2, 0, 0, 0, 0, 1], LinkSpeed::G10, 1, 1);
        let clock = PtpClock::new();
        let stop = AtomicBool::new(false);
        let shared = SharedRing::new(16);
        shared.push(media(60, 0)).map_err(|_| ()).unwrap();

        let mut sch = scheduler(1, 3, true);
        let (mut p0, c0) = tx_ring(64);
        for _ in 0..4 {
            p0.push(media(1262, 0)).map_err(|_| ()).unwrap();
        }
        let mut rings = vec![c0];
        sch.run_period(&mut rings, &shared, &port, &clock, &stop);

        let sent = port.drain_tx(0);
        assert!(sent.iter().any(|(f, _)| f.len() == 60));
    }
}
