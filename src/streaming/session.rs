//! Session registry and device lifecycle (the control plane).
//!
//! A device owns one NIC port direction: the TX device allocates TPRS
//! timeslots and the per-frame-time byte budget the scheduler spends;
//! the RX device installs flow rules and hands sessions to receiver
//! threads. Sessions are identified by their timeslot index into the
//! device tables; the data-plane threads own the per-session hot state
//! and only the control fields live behind atomics.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::info;

use crate::streaming::anc::{AncConsumer, AncProducer};
use crate::streaming::format::{
    AncFormat, AudioFormat, FrameRate, NicRateParams, PacerType, VideoFormat, Vscan,
};
use crate::streaming::net::{
    self, Flow, DEFAULT_PKT_L1_SIZE, MIN_PKT_L1_SIZE, PHY_OVERHEAD, RTP_OFFSET,
};
use crate::streaming::nic::NicPort;
use crate::streaming::ptp::{PtpClock, PtpEngine};
use crate::streaming::ring::{SchedSync, SharedRing, SHARED_RING_SIZE};
use crate::streaming::rtp;
use crate::streaming::{
    AtomicSnState, AudioConsumer, AudioProducer, Direction, Essence, SessionStats, SnState,
    StError, VideoConsumer, VideoProducer,
};

/// L1 size of the default 1080p single-line packet, the budget unit an
/// unoccupied session slot is provisioned at.
pub const HD_SLN_PKT_L1_SIZE: u32 = (RTP_OFFSET + rtp::RFC4175_SINGLE_HDR_SIZE) as u32
    + 1200
    + PHY_OVERHEAD as u32;

/// Sub-byte budget denominator carried by the scheduler remainder.
pub const BUDGET_DENOM: u32 = 10_000;

/// Gapped / linear packet-slot counts the device budget is divided by.
const PKTS_IN_FRAME_GAPPED: u32 = 4500;
const PKTS_IN_FRAME_LINEAR: u32 = 4320;

const MAX_ST30_SESSIONS: u32 = 32;
const MAX_ST40_SESSIONS: u32 = 32;

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

/// The control-plane view of a session. The data plane holds the rest.
pub struct SessionShared {
    pub timeslot: u32,
    pub essence: Essence,
    pub direction: Direction,
    pub ssrc: u32,
    pub state: AtomicSnState,
    pub stats: SessionStats,
}

impl SessionShared {
    fn new(timeslot: u32, essence: Essence, direction: Direction, ssrc: u32) -> Arc<SessionShared> {
        Arc::new(SessionShared {
            timeslot,
            essence,
            direction,
            ssrc,
            state: AtomicSnState::new(SnState::Off),
            stats: SessionStats::default(),
        })
    }
}

/// Addresses handed to `bind_ip_addr`.
#[derive(Debug, Clone)]
pub struct BindAddr {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Unicast destination MAC; ignored for multicast groups.
    pub dst_mac: Option<[u8; 6]>,
}

/// Device-wide knobs.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub rate: FrameRate,
    pub pacer: PacerType,
    /// Cap below the NIC-rate table limit.
    pub max_st21_sessions: Option<u32>,
    pub dscp_expedited: bool,
    pub ebu_check: bool,
    /// Scheduler dequeues four packets per slot when set.
    pub bulk_dequeue: bool,
}

impl DeviceConfig {
    pub fn new(rate: FrameRate, pacer: PacerType) -> DeviceConfig {
        DeviceConfig {
            rate,
            pacer,
            max_st21_sessions: None,
            dscp_expedited: false,
            ebu_check: false,
            bulk_dequeue: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Timeslot table
// ---------------------------------------------------------------------------

/// TPRS timeslot bookkeeping, shared between the registry and the
/// running device so destroy can release slots.
pub struct TimeslotTable {
    /// Per-slot packet time in ns; 0 = free.
    time_table: Vec<u32>,
    /// The whole device's TPRS budget, set by the first session.
    time_quot: u32,
    last_alloc: u32,
    count: u32,
}

impl TimeslotTable {
    fn new(max_sessions: u32) -> TimeslotTable {
        TimeslotTable {
            time_table: vec![0; max_sessions as usize],
            time_quot: 0,
            last_alloc: 0,
            count: 0,
        }
    }

    /// Find a timeslot for a session of `pkt_time`, first checking the
    /// cumulative packet time still fits the frame's TPRS budget.
    /// Returns `(timeslot, used_time_prefix)`; the prefix is added to
    /// the session trOffset so sessions stagger across the frame.
    fn allocate(&mut self, pkt_time: u32, tprs: u32) -> Result<(u32, u32), StError> {
        let max = self.time_table.len() as u32;
        if tprs < pkt_time || self.count == max {
            return Err(StError::NoTimeslot);
        }

        if self.time_quot == 0 {
            self.time_quot = tprs;
            self.time_table[0] = pkt_time;
            self.last_alloc = 0;
            self.count = 1;
            return Ok((0, 0));
        }

        let used: u32 = self.time_table.iter().sum();
        if self.time_quot < used + pkt_time {
            return Err(StError::NoTimeslot);
        }

        if max >= 32 {
            // Step by 8 so consecutive sessions land in different
            // scheduler batches; the +1 on wrap walks the remainder.
            let mut slot = self.last_alloc + 8;
            if slot >= max {
                slot = (slot + 1) % max;
            }
            let mut tries = 0;
            while tries < max - self.count {
                if self.time_table[slot as usize] == 0 {
                    self.time_table[slot as usize] = pkt_time;
                    self.last_alloc = slot;
                    self.count += 1;
                    return Ok((slot, used));
                }
                slot += 8;
                if slot >= max {
                    slot = (slot + 1) % max;
                }
                tries += 1;
            }
            Err(StError::NoTimeslot)
        } else {
            // small devices fill first-free
            for slot in 0..max {
                if self.time_table[slot as usize] == 0 {
                    self.time_table[slot as usize] = pkt_time;
                    self.last_alloc = slot;
                    self.count += 1;
                    return Ok((slot, used));
                }
            }
            Err(StError::NoTimeslot)
        }
    }

    /// First-free slot, no TPRS accounting. Audio and ancillary sessions
    /// are paced per epoch, not per packet slot, so only the index
    /// matters for them.
    fn allocate_index(&mut self) -> Result<u32, StError> {
        for slot in 0..self.time_table.len() as u32 {
            if self.time_table[slot as usize] == 0 {
                self.time_table[slot as usize] = 1;
                self.count += 1;
                return Ok(slot);
            }
        }
        Err(StError::NoTimeslot)
    }

    fn release(&mut self, timeslot: u32) {
        let slot = &mut self.time_table[timeslot as usize];
        if *slot != 0 {
            *slot = 0;
            self.count -= 1;
        }
    }

    pub fn occupied(&self) -> u32 {
        self.count
    }
}

// ---------------------------------------------------------------------------
// Flow rules
// ---------------------------------------------------------------------------

/// A hardware classification rule: matching packets land on a dedicated
/// RX queue. On ports without rule support this is bookkeeping only -
/// the software dispatch still matches defensively.
#[derive(Debug, Clone)]
pub struct FlowRule {
    pub queue: u16,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_ip_masked: bool,
    /// i40e/ice firmware rejects an explicit IP-protocol match next to a
    /// UDP pattern item, so the proto field is masked off there.
    pub ip_proto_masked: bool,
}

impl FlowRule {
    pub fn install(port: &dyn NicPort, queue: u16, addr: &BindAddr) -> FlowRule {
        let driver = port.driver_name();
        let ip_proto_masked = matches!(driver, "net_i40e" | "net_ice");
        // multicast groups have no meaningful source filter
        let src_ip_masked = net::is_multicast(addr.dst_ip);
        FlowRule {
            queue,
            src_ip: addr.src_ip,
            dst_ip: addr.dst_ip,
            src_port: addr.src_port,
            dst_port: addr.dst_port,
            src_ip_masked,
            ip_proto_masked,
        }
    }
}

// ---------------------------------------------------------------------------
// Session builders (handed to the data-plane threads at start)
// ---------------------------------------------------------------------------

pub struct VideoTxBuilder {
    pub shared: Arc<SessionShared>,
    pub fmt: VideoFormat,
    pub flow: Option<Flow>,
    pub hdr_print: Vec<u8>,
    pub producer: Box<dyn VideoProducer>,
    pub tprs: u32,
    pub tr_offset: u32,
    pub pkt_time: u32,
}

pub struct AudioTxBuilder {
    pub shared: Arc<SessionShared>,
    pub fmt: AudioFormat,
    pub flow: Option<Flow>,
    pub hdr_print: Vec<u8>,
    pub producer: Box<dyn AudioProducer>,
}

pub struct AncTxBuilder {
    pub shared: Arc<SessionShared>,
    pub fmt: AncFormat,
    pub flow: Option<Flow>,
    pub hdr_print: Vec<u8>,
    pub producer: Box<dyn AncProducer>,
    pub tprs: u32,
}

pub struct VideoRxBuilder {
    pub shared: Arc<SessionShared>,
    pub fmt: VideoFormat,
    pub flows: Vec<FlowRule>,
    pub consumer: Box<dyn VideoConsumer>,
    pub tprs: u32,
    pub tr_offset: u32,
    pub ebu_check: bool,
}

pub struct AudioRxBuilder {
    pub shared: Arc<SessionShared>,
    pub fmt: AudioFormat,
    pub flows: Vec<FlowRule>,
    pub consumer: Box<dyn AudioConsumer>,
    pub buf_size: u32,
    pub redundant: bool,
}

pub struct AncRxBuilder {
    pub shared: Arc<SessionShared>,
    pub fmt: AncFormat,
    pub flows: Vec<FlowRule>,
    pub consumer: Box<dyn AncConsumer>,
    pub redundant: bool,
}

// ---------------------------------------------------------------------------
// TX device
// ---------------------------------------------------------------------------

/// Per-frame-time byte budget of the TX device.
#[derive(Debug, Clone, Copy)]
pub struct TxBudget {
    /// Whole bytes per packet slot across the device.
    pub quot: u32,
    /// Sub-byte remainder, in 1/10000 bytes per slot.
    pub remaind: u32,
    pub max_rings: u32,
    pub out_of_bound_ring: bool,
}

pub struct TxDevice {
    pub port: Arc<dyn NicPort>,
    pub clock: Arc<PtpClock>,
    pub cfg: DeviceConfig,
    pub max_st21_sessions: u32,
    pub budget: TxBudget,
    /// L1 packet size provisioned per ring.
    pub tx_pkt_size_l1: Vec<u32>,
    pub timeslots: Arc<Mutex<TimeslotTable>>,
    pub nic_params: &'static NicRateParams,

    pub video: Vec<Option<VideoTxBuilder>>,
    pub audio: Vec<Option<AudioTxBuilder>>,
    pub anc: Vec<Option<AncTxBuilder>>,
    audio_slots: TimeslotTable,
    anc_slots: TimeslotTable,
}

impl TxDevice {
    /// Bind the port, size the budget from the link speed and frame
    /// rate, and provision the ring tables.
    pub fn create(
        port: Arc<dyn NicPort>,
        clock: Arc<PtpClock>,
        cfg: DeviceConfig,
        vscan: Vscan,
    ) -> Result<TxDevice, StError> {
        let speed = port.link_speed();
        let nic_params = NicRateParams::for_speed(speed);

        let table_max = nic_params.max_sessions(cfg.rate, vscan);
        let mut max_sessions = cfg
            .max_st21_sessions
            .map_or(table_max, |m| m.min(table_max))
            .max(1);

        // bytes per packet slot: frame budget divided by the slot count
        let frame_time = cfg.rate.frame_time_ns();
        let quot_base =
            frame_time as u128 * speed.gbps() as u128 * speed.quot_adjust() as u128;
        let mut slots = match cfg.pacer {
            PacerType::Tpn => PKTS_IN_FRAME_GAPPED,
            PacerType::Tpnl | PacerType::Tpw => PKTS_IN_FRAME_LINEAR,
        };
        if vscan.interlaced() || vscan == Vscan::P720 {
            slots /= 2;
        }
        let per_slot = (quot_base / 8 / slots as u128) as u64;
        let quot = (per_slot / BUDGET_DENOM as u64) as u32;
        let remaind = (per_slot % BUDGET_DENOM as u64) as u32;

        let mut max_rings =
            max_sessions + (quot.saturating_sub(max_sessions * HD_SLN_PKT_L1_SIZE)) / DEFAULT_PKT_L1_SIZE as u32;
        if max_rings <= max_sessions {
            max_sessions -= 1;
            max_rings = max_sessions + 1;
            info!(
                "budget: max sessions reduced to {} for the extra ring",
                max_sessions
            );
        }

        info!(
            "TX device: {} Gbps, {} sessions max, {} rings, quot {} (+{}/10000) bytes/slot",
            speed.gbps(),
            max_sessions,
            max_rings,
            quot,
            remaind
        );

        let mut dev = TxDevice {
            port,
            clock,
            cfg,
            max_st21_sessions: max_sessions,
            budget: TxBudget {
                quot,
                remaind,
                max_rings,
                out_of_bound_ring: true,
            },
            tx_pkt_size_l1: vec![0; max_rings as usize],
            timeslots: Arc::new(Mutex::new(TimeslotTable::new(max_sessions))),
            nic_params,
            video: (0..max_sessions).map(|_| None).collect(),
            audio: (0..MAX_ST30_SESSIONS).map(|_| None).collect(),
            anc: (0..MAX_ST40_SESSIONS).map(|_| None).collect(),
            audio_slots: TimeslotTable::new(MAX_ST30_SESSIONS),
            anc_slots: TimeslotTable::new(MAX_ST40_SESSIONS),
        };
        dev.adjust_budget();
        Ok(dev)
    }

    /// Redistribute the per-slot byte budget across occupied session
    /// rings and the trailing extra rings.
    pub fn adjust_budget(&mut self) {
        let mut budget = self.budget.quot as i64;
        for i in 0..self.max_st21_sessions as usize {
            self.tx_pkt_size_l1[i] = match &self.video[i] {
                Some(b) => b.fmt.pkt_l1_size(),
                None => HD_SLN_PKT_L1_SIZE,
            };
            budget -= self.tx_pkt_size_l1[i] as i64;
        }
        for i in self.max_st21_sessions as usize..self.budget.max_rings as usize {
            if budget >= DEFAULT_PKT_L1_SIZE as i64 {
                self.tx_pkt_size_l1[i] = DEFAULT_PKT_L1_SIZE as u32;
                budget -= DEFAULT_PKT_L1_SIZE as i64;
            } else if budget >= MIN_PKT_L1_SIZE as i64 {
                self.tx_pkt_size_l1[i] = budget as u32;
                budget = 0;
            } else {
                self.tx_pkt_size_l1[i] = MIN_PKT_L1_SIZE as u32;
            }
        }
    }

    /// Per-session packet time on the wire, rounded to the link rate.
    fn pkt_time_ns(&self, pkt_size: u32) -> u32 {
        let gbps = self.port.link_speed().gbps();
        let bits = (pkt_size + PHY_OVERHEAD as u32) * 8;
        let mut t = bits / gbps;
        if bits % gbps >= gbps / 2 {
            t += 1;
        }
        t
    }

    pub fn create_video_session(
        &mut self,
        fmt: VideoFormat,
        ssrc: u32,
        producer: Box<dyn VideoProducer>,
    ) -> Result<Arc<SessionShared>, StError> {
        if fmt.clock_rate != 90_000 {
            return Err(StError::BadClockRate);
        }
        let tprs = fmt.tprs(self.cfg.pacer);
        let pkt_time = self.pkt_time_ns(fmt.pkt_size);

        let (timeslot, used_prefix) = self.timeslots.lock().unwrap().allocate(pkt_time, tprs)?;
        let tr_offset = fmt.tr_offset() + used_prefix;

        let shared = SessionShared::new(timeslot, Essence::Video, Direction::Producer, ssrc);
        self.video[timeslot as usize] = Some(VideoTxBuilder {
            shared: shared.clone(),
            fmt,
            flow: None,
            hdr_print: Vec::new(),
            producer,
            tprs,
            tr_offset,
            pkt_time,
        });
        self.adjust_budget();
        info!(
            "video TX session {}: tprs {} ns, trOffset {} ns, pktTime {} ns",
            timeslot, tprs, tr_offset, pkt_time
        );
        Ok(shared)
    }

    pub fn bind_video(&mut self, timeslot: u32, addr: &BindAddr) -> Result<(), StError> {
        let dscp = if self.cfg.dscp_expedited {
            net::DSCP_EXPEDITED
        } else {
            0
        };
        let src_mac = self.port.mac();
        let builder = self.video[timeslot as usize]
            .as_mut()
            .ok_or(StError::SnNotReady)?;
        let flow = make_flow(addr, src_mac, dscp)?;
        builder.hdr_print = render_video_hdr(&builder.fmt, &flow, builder.shared.ssrc);
        builder.flow = Some(flow);
        builder.shared.state.store(SnState::On);
        Ok(())
    }

    pub fn create_audio_session(
        &mut self,
        fmt: AudioFormat,
        ssrc: u32,
        producer: Box<dyn AudioProducer>,
    ) -> Result<Arc<SessionShared>, StError> {
        let slot = self.audio_slots.allocate_index()?;
        let shared = SessionShared::new(slot, Essence::Audio, Direction::Producer, ssrc);
        self.audio[slot as usize] = Some(AudioTxBuilder {
            shared: shared.clone(),
            fmt,
            flow: None,
            hdr_print: Vec::new(),
            producer,
        });
        Ok(shared)
    }

    pub fn bind_audio(&mut self, slot: u32, addr: &BindAddr) -> Result<(), StError> {
        let src_mac = self.port.mac();
        let builder = self.audio[slot as usize]
            .as_mut()
            .ok_or(StError::SnNotReady)?;
        let flow = make_flow(addr, src_mac, 0)?;
        builder.hdr_print = render_audio_hdr(&builder.fmt, &flow, builder.shared.ssrc);
        builder.flow = Some(flow);
        builder.shared.state.store(SnState::On);
        Ok(())
    }

    pub fn create_anc_session(
        &mut self,
        fmt: AncFormat,
        ssrc: u32,
        producer: Box<dyn AncProducer>,
    ) -> Result<Arc<SessionShared>, StError> {
        let slot = self.anc_slots.allocate_index()?;
        let tprs = (fmt.frame_time_ns / PKTS_IN_FRAME_GAPPED as u64) as u32;
        let shared = SessionShared::new(slot, Essence::Ancillary, Direction::Producer, ssrc);
        self.anc[slot as usize] = Some(AncTxBuilder {
            shared: shared.clone(),
            fmt,
            flow: None,
            hdr_print: Vec::new(),
            producer,
            tprs,
        });
        Ok(shared)
    }

    pub fn bind_anc(&mut self, slot: u32, addr: &BindAddr) -> Result<(), StError> {
        let src_mac = self.port.mac();
        let builder = self.anc[slot as usize]
            .as_mut()
            .ok_or(StError::SnNotReady)?;
        let flow = make_flow(addr, src_mac, 0)?;
        // ancillary headers are built per packet (variable payload)
        builder.hdr_print = Vec::new();
        builder.flow = Some(flow);
        builder.shared.state.store(SnState::On);
        Ok(())
    }

    /// Remove a session before start, releasing its timeslot.
    pub fn destroy_video_session(&mut self, timeslot: u32) {
        if let Some(b) = self.video[timeslot as usize].take() {
            b.shared.state.store(SnState::Off);
            self.timeslots.lock().unwrap().release(timeslot);
            self.adjust_budget();
        }
    }

    /// Spawn the data-plane threads. Creation is all-or-nothing: every
    /// bound session streams from the first period.
    pub fn start(self, ptp: Option<Arc<PtpEngine>>) -> Result<TxHandle, StError> {
        crate::streaming::send::start_tx_device(self, ptp)
    }
}

/// Running TX device: the data plane plus the controls to stop it.
pub struct TxHandle {
    pub stop: Arc<AtomicBool>,
    pub sync: Arc<SchedSync>,
    pub shared_ring: Arc<SharedRing>,
    pub timeslots: Arc<Mutex<TimeslotTable>>,
    pub sessions: Vec<Arc<SessionShared>>,
    pub threads: Vec<JoinHandle<()>>,
}

impl TxHandle {
    /// Two-phase destroy: flag the session, let the data plane drain,
    /// release the timeslot. In-flight packets are delivered or freed.
    pub fn destroy_session(&self, shared: &SessionShared) {
        shared.state.store(SnState::StopPending);
        self.timeslots.lock().unwrap().release(shared.timeslot);
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        // wake anything parked on the period hand-off
        self.sync.ring_start.give(64);
        self.sync.sched_start.give(1);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

// ---------------------------------------------------------------------------
// RX device
// ---------------------------------------------------------------------------

pub struct RxDevice {
    /// Primary port plus the optional ST 2022-7 redundant port.
    pub ports: Vec<Arc<dyn NicPort>>,
    pub clock: Arc<PtpClock>,
    pub cfg: DeviceConfig,
    pub max_st21_sessions: u32,
    pub nic_params: &'static NicRateParams,
    pub timeslots: Arc<Mutex<TimeslotTable>>,

    pub video: Vec<Option<VideoRxBuilder>>,
    pub audio: Vec<Option<AudioRxBuilder>>,
    pub anc: Vec<Option<AncRxBuilder>>,
    audio_slots: TimeslotTable,
    anc_slots: TimeslotTable,
}

impl RxDevice {
    pub fn create(
        ports: Vec<Arc<dyn NicPort>>,
        clock: Arc<PtpClock>,
        cfg: DeviceConfig,
        vscan: Vscan,
    ) -> Result<RxDevice, StError> {
        let primary = ports.first().ok_or(StError::InvalidParam)?;
        let nic_params = NicRateParams::for_speed(primary.link_speed());
        let table_max = nic_params.max_sessions(cfg.rate, vscan);
        let max_sessions = cfg
            .max_st21_sessions
            .map_or(table_max, |m| m.min(table_max))
            .max(1);
        Ok(RxDevice {
            ports,
            clock,
            cfg,
            max_st21_sessions: max_sessions,
            nic_params,
            timeslots: Arc::new(Mutex::new(TimeslotTable::new(max_sessions))),
            video: (0..max_sessions).map(|_| None).collect(),
            audio: (0..MAX_ST30_SESSIONS).map(|_| None).collect(),
            anc: (0..MAX_ST40_SESSIONS).map(|_| None).collect(),
            audio_slots: TimeslotTable::new(MAX_ST30_SESSIONS),
            anc_slots: TimeslotTable::new(MAX_ST40_SESSIONS),
        })
    }

    pub fn create_video_session(
        &mut self,
        fmt: VideoFormat,
        ssrc: u32,
        consumer: Box<dyn VideoConsumer>,
    ) -> Result<Arc<SessionShared>, StError> {
        if fmt.clock_rate != 90_000 {
            return Err(StError::BadClockRate);
        }
        let frame_time = fmt.frame_time_ns;
        let tr_offset_base = fmt.tr_offset();
        // receiver model: TPRS spreads the active packets over the
        // frame time left after the rise offset
        let tprs = match self.cfg.pacer {
            PacerType::Tpn => {
                ((frame_time - tr_offset_base as u64) / fmt.pkts_in_frame as u64) as u32
            }
            PacerType::Tpnl | PacerType::Tpw => (frame_time / fmt.pkts_in_frame as u64) as u32,
        };
        let pkt_time = {
            let gbps = self.ports[0].link_speed().gbps();
            let bits = fmt.pkt_l1_size() * 8;
            let mut t = bits / gbps;
            if bits % gbps >= gbps / 2 {
                t += 1;
            }
            t
        };
        let (timeslot, _) = self.timeslots.lock().unwrap().allocate(pkt_time, tprs.max(pkt_time + 1))?;
        let tr_offset = tprs * fmt.pkts_in_line * fmt.vscan.tr_offset_lines();

        let shared = SessionShared::new(timeslot, Essence::Video, Direction::Consumer, ssrc);
        self.video[timeslot as usize] = Some(VideoRxBuilder {
            shared: shared.clone(),
            fmt,
            flows: Vec::new(),
            consumer,
            tprs,
            tr_offset,
            ebu_check: self.cfg.ebu_check,
        });
        Ok(shared)
    }

    /// Install the flow rule(s): one per port, same tuple, steering to
    /// the session's receiver queue.
    pub fn bind_video(&mut self, timeslot: u32, addr: &BindAddr) -> Result<(), StError> {
        let queue = (timeslot % self.nic_params.max_rcv_threads) as u16;
        let rules: Vec<FlowRule> = self
            .ports
            .iter()
            .map(|p| FlowRule::install(p.as_ref(), queue, addr))
            .collect();
        let builder = self.video[timeslot as usize]
            .as_mut()
            .ok_or(StError::SnNotReady)?;
        builder.flows = rules;
        builder.shared.state.store(SnState::On);
        Ok(())
    }

    pub fn create_audio_session(
        &mut self,
        fmt: AudioFormat,
        ssrc: u32,
        buf_size: u32,
        redundant: bool,
        consumer: Box<dyn AudioConsumer>,
    ) -> Result<Arc<SessionShared>, StError> {
        let slot = self.audio_slots.allocate_index()?;
        let shared = SessionShared::new(slot, Essence::Audio, Direction::Consumer, ssrc);
        self.audio[slot as usize] = Some(AudioRxBuilder {
            shared: shared.clone(),
            fmt,
            flows: Vec::new(),
            consumer,
            buf_size,
            redundant,
        });
        Ok(shared)
    }

    pub fn bind_audio(&mut self, slot: u32, addr: &BindAddr) -> Result<(), StError> {
        let queue = (slot % self.nic_params.max_rcv_threads) as u16;
        let rules: Vec<FlowRule> = self
            .ports
            .iter()
            .map(|p| FlowRule::install(p.as_ref(), queue, addr))
            .collect();
        let builder = self.audio[slot as usize]
            .as_mut()
            .ok_or(StError::SnNotReady)?;
        builder.flows = rules;
        builder.shared.state.store(SnState::On);
        Ok(())
    }

    pub fn create_anc_session(
        &mut self,
        fmt: AncFormat,
        ssrc: u32,
        redundant: bool,
        consumer: Box<dyn AncConsumer>,
    ) -> Result<Arc<SessionShared>, StError> {
        let slot = self.anc_slots.allocate_index()?;
        let shared = SessionShared::new(slot, Essence::Ancillary, Direction::Consumer, ssrc);
        self.anc[slot as usize] = Some(AncRxBuilder {
            shared: shared.clone(),
            fmt,
            flows: Vec::new(),
            consumer,
            redundant,
        });
        Ok(shared)
    }

    pub fn bind_anc(&mut self, slot: u32, addr: &BindAddr) -> Result<(), StError> {
        let queue = (slot % self.nic_params.max_rcv_threads) as u16;
        let rules: Vec<FlowRule> = self
            .ports
            .iter()
            .map(|p| FlowRule::install(p.as_ref(), queue, addr))
            .collect();
        let builder = self.anc[slot as usize]
            .as_mut()
            .ok_or(StError::SnNotReady)?;
        builder.flows = rules;
        builder.shared.state.store(SnState::On);
        Ok(())
    }

    pub fn start(self, ptp: Option<Arc<PtpEngine>>) -> Result<RxHandle, StError> {
        crate::streaming::recv::start_rx_device(self, ptp)
    }
}

/// Running RX device.
pub struct RxHandle {
    pub stop: Arc<AtomicBool>,
    pub sessions: Vec<Arc<SessionShared>>,
    pub threads: Vec<JoinHandle<()>>,
}

impl RxHandle {
    /// Flag a session for teardown; the receiver thread quiesces it on
    /// its next packet.
    pub fn destroy_session(&self, shared: &SessionShared) {
        shared.state.store(SnState::StopPending);
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Header template rendering
// ---------------------------------------------------------------------------

fn make_flow(addr: &BindAddr, src_mac: [u8; 6], dscp: u8) -> Result<Flow, StError> {
    let dst_mac = if net::is_multicast(addr.dst_ip) {
        net::multicast_mac(addr.dst_ip)
    } else {
        addr.dst_mac.ok_or(StError::InvalidParam)?
    };
    Ok(Flow {
        src_ip: addr.src_ip,
        dst_ip: addr.dst_ip,
        src_port: addr.src_port,
        dst_port: addr.dst_port,
        src_mac,
        dst_mac,
        dscp,
        ecn: 0,
        vlan: None,
    })
}

/// Render the full L2..RTP header template for a video session.
fn render_video_hdr(fmt: &VideoFormat, flow: &Flow, ssrc: u32) -> Vec<u8> {
    let hdr_len = RTP_OFFSET + fmt.rtp_hdr_size();
    let mut buf = vec![0u8; hdr_len];
    net::render_headers(&mut buf, flow, fmt.pkt_size as u16);

    let rtp_common = rtp::RtpHeader {
        marker: false,
        payload_type: rtp::PAYLOAD_TYPE_VIDEO,
        seq_number: 0,
        tmstamp: 0,
        ssrc,
    };
    match fmt.pkt_fmt {
        crate::streaming::format::PktFmt::IntelDualLine => {
            rtp::Rfc4175Dual {
                rtp: rtp_common,
                seq_ext: 0,
                line1_length: fmt.line_payload() as u16,
                line1_number: 0,
                line1_offset: 0,
                line2_length: fmt.line_payload() as u16,
                line2_number: 1,
                line2_offset: 0,
            }
            .encode(&mut buf[RTP_OFFSET..]);
        }
        _ => {
            rtp::Rfc4175Single {
                rtp: rtp_common,
                seq_ext: 0,
                line_length: fmt.line_payload() as u16,
                line_number: 0,
                field_id: 0,
                line_offset: 0,
                continuation: false,
            }
            .encode(&mut buf[RTP_OFFSET..]);
        }
    }
    buf
}

/// Render the L2..RTP template for an audio session.
fn render_audio_hdr(fmt: &AudioFormat, flow: &Flow, ssrc: u32) -> Vec<u8> {
    let hdr_len = RTP_OFFSET + rtp::RTP_HDR_SIZE;
    let mut buf = vec![0u8; hdr_len];
    net::render_headers(&mut buf, flow, fmt.pkt_size() as u16);
    rtp::RtpHeader {
        marker: false,
        payload_type: rtp::PAYLOAD_TYPE_AUDIO,
        seq_number: 0,
        tmstamp: 0,
        ssrc,
    }
    .encode(&mut buf[RTP_OFFSET..]);
    buf
}

/// Shared-ring factory used by device start paths.
pub fn make_shared_ring() -> Arc<SharedRing> {
    Arc::new(SharedRing::new(SHARED_RING_SIZE))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
