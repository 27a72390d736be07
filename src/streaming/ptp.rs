//! IEEE 1588v2 slave and the clock every subsystem paces against.
//!
//! The engine follows the classic four-timestamp exchange: the master's
//! Sync/Follow_Up pair yields t1/t2, our Delay_Req and the master's
//! Delay_Resp yield t3/t4, and `delta = ((t4-t3)-(t2-t1))/2` is applied
//! to the NIC hardware clock. The same exchange measured against the
//! local free-running counter (the "HPET" role) maintains a software
//! clock for ports without timesync, including continuous refinement of
//! the counter period.
//!
//! PTP message layout (header, 34 bytes):
//! ```text
//!  0: transportSpecific | messageType
//!  1: versionPTP
//!  2: messageLength
//!  4: domainNumber
//!  6: flagField
//!  8: correctionField
//! 20: sourcePortIdentity (8-byte clock id + 2-byte port)
//! 30: sequenceId
//! 32: controlField
//! 33: logMessageInterval
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::streaming::net::{ETHERTYPE_PTP, ETH_HDR_SIZE};
use crate::streaming::nic::{NicPort, TxPacket};
use crate::streaming::ring::SharedRing;
use crate::streaming::sync::SpinLock;

pub const PTP_HDR_SIZE: usize = 34;
pub const PTP_TIMESTAMP_SIZE: usize = 10;
pub const SYNC_MSG_SIZE: usize = PTP_HDR_SIZE + PTP_TIMESTAMP_SIZE;
pub const DELAY_REQ_MSG_SIZE: usize = PTP_HDR_SIZE + PTP_TIMESTAMP_SIZE;
pub const DELAY_RESP_MSG_SIZE: usize = PTP_HDR_SIZE + 2 * PTP_TIMESTAMP_SIZE;
pub const ANNOUNCE_MSG_SIZE: usize = PTP_HDR_SIZE + 30;

/// Base back-off before a Delay_Req, in microseconds.
const PAUSE_TO_SEND_FIRST_DELAY_REQ_US: u64 = 50;
/// One contention-order wait unit, in microseconds.
const ORDER_WAIT_TIME_US: u64 = 50;
/// Master-time span that triggers an HPET period recalibration.
const MIN_FREQ_MEASURE_NS: u64 = 10_000_000_000;

const PTP_MULTICAST_MAC: [u8; 6] = [0x01, 0x1b, 0x19, 0x00, 0x00, 0x00];

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

pub type ClockId = [u8; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortIdentity {
    pub clock_id: ClockId,
    pub port_number: u16,
}

impl PortIdentity {
    /// EUI-64 style identity: MAC halves around the ff:fe infix.
    pub fn from_mac(mac: [u8; 6]) -> PortIdentity {
        PortIdentity {
            clock_id: [mac[0], mac[1], mac[2], 0xff, 0xfe, mac[3], mac[4], mac[5]],
            port_number: 1,
        }
    }

    /// Recover the MAC for unicast Delay_Req addressing.
    pub fn to_mac(self) -> [u8; 6] {
        let id = self.clock_id;
        [id[0], id[1], id[2], id[5], id[6], id[7]]
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.clock_id);
        buf[8..10].copy_from_slice(&self.port_number.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> PortIdentity {
        let mut clock_id = [0u8; 8];
        clock_id.copy_from_slice(&buf[0..8]);
        PortIdentity {
            clock_id,
            port_number: u16::from_be_bytes([buf[8], buf[9]]),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpMessageType {
    Sync,
    DelayReq,
    FollowUp,
    DelayResp,
    Announce,
}

impl PtpMessageType {
    fn from_nibble(v: u8) -> Option<PtpMessageType> {
        match v & 0x0f {
            0x0 => Some(PtpMessageType::Sync),
            0x1 => Some(PtpMessageType::DelayReq),
            0x8 => Some(PtpMessageType::FollowUp),
            0x9 => Some(PtpMessageType::DelayResp),
            0xb => Some(PtpMessageType::Announce),
            _ => None,
        }
    }

    fn nibble(self) -> u8 {
        match self {
            PtpMessageType::Sync => 0x0,
            PtpMessageType::DelayReq => 0x1,
            PtpMessageType::FollowUp => 0x8,
            PtpMessageType::DelayResp => 0x9,
            PtpMessageType::Announce => 0xb,
        }
    }
}

/// Wire timestamp: 48-bit seconds + 32-bit nanoseconds.
pub fn encode_timestamp(buf: &mut [u8], ns: u64) {
    let sec = ns / 1_000_000_000;
    let rem = (ns % 1_000_000_000) as u32;
    buf[0..2].copy_from_slice(&((sec >> 32) as u16).to_be_bytes());
    buf[2..6].copy_from_slice(&(sec as u32).to_be_bytes());
    buf[6..10].copy_from_slice(&rem.to_be_bytes());
}

pub fn decode_timestamp(buf: &[u8]) -> u64 {
    let sec_msb = u16::from_be_bytes([buf[0], buf[1]]) as u64;
    let sec_lsb = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as u64;
    let ns = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]) as u64;
    ((sec_msb << 32) | sec_lsb) * 1_000_000_000 + ns
}

/// Parsed view of the common header.
#[derive(Debug, Clone, Copy)]
pub struct PtpHeader {
    pub msg_type: PtpMessageType,
    pub domain: u8,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
}

impl PtpHeader {
    pub fn decode(data: &[u8]) -> Option<PtpHeader> {
        if data.len() < PTP_HDR_SIZE {
            return None;
        }
        Some(PtpHeader {
            msg_type: PtpMessageType::from_nibble(data[0])?,
            domain: data[4],
            source_port_identity: PortIdentity::decode(&data[20..30]),
            sequence_id: u16::from_be_bytes([data[30], data[31]]),
        })
    }

    fn encode(&self, buf: &mut [u8], msg_len: u16) {
        buf[..PTP_HDR_SIZE].fill(0);
        buf[0] = self.msg_type.nibble();
        buf[1] = 2; // versionPTP
        buf[2..4].copy_from_slice(&msg_len.to_be_bytes());
        buf[4] = self.domain;
        self.source_port_identity.encode(&mut buf[20..30]);
        buf[30..32].copy_from_slice(&self.sequence_id.to_be_bytes());
    }
}

// ---------------------------------------------------------------------------
// Clock source
// ---------------------------------------------------------------------------

/// Which clock backs `PtpClock::now_ns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClockSource {
    /// NIC hardware timesync (preferred once the first exchange lands).
    Eth = 0,
    /// Free-running counter disciplined by the exchange.
    Hpet = 1,
    /// Plain system realtime clock.
    Rtc = 2,
}

/// The time source every pacing and timestamping call flows through.
pub struct PtpClock {
    source: AtomicU8,
    port: Mutex<Option<Arc<dyn NicPort>>>,
    hpet_origin: Instant,
    /// Offset from HPET tick 0 to the PTP epoch, in ns (i64 stored as u64).
    epoch_adj: AtomicU64,
    /// f64 bits of ns-per-HPET-tick, continuously refined.
    hpet_period_bits: AtomicU64,
}

impl PtpClock {
    pub fn new() -> Arc<PtpClock> {
        let origin = Instant::now();
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        Arc::new(PtpClock {
            source: AtomicU8::new(ClockSource::Hpet as u8),
            port: Mutex::new(None),
            hpet_origin: origin,
            epoch_adj: AtomicU64::new(wall),
            hpet_period_bits: AtomicU64::new(1.0f64.to_bits()),
        })
    }

    pub fn attach_port(&self, port: Arc<dyn NicPort>) {
        *self.port.lock().unwrap() = Some(port);
    }

    pub fn set_source(&self, source: ClockSource) {
        self.source.store(source as u8, Ordering::Release);
    }

    pub fn source(&self) -> ClockSource {
        match self.source.load(Ordering::Acquire) {
            0 => ClockSource::Eth,
            1 => ClockSource::Hpet,
            _ => ClockSource::Rtc,
        }
    }

    /// Raw free-running counter ticks.
    pub fn hpet_ticks(&self) -> u64 {
        self.hpet_origin.elapsed().as_nanos() as u64
    }

    pub fn hpet_period(&self) -> f64 {
        f64::from_bits(self.hpet_period_bits.load(Ordering::Acquire))
    }

    pub fn set_hpet_period(&self, period: f64) {
        self.hpet_period_bits
            .store(period.to_bits(), Ordering::Release);
    }

    pub fn add_epoch_adj(&self, delta_ns: i64) {
        self.epoch_adj
            .fetch_add(delta_ns as u64, Ordering::AcqRel);
    }

    /// PTP time reconstructed from a past HPET snapshot.
    pub fn time_from_hpet(&self, ticks: u64) -> u64 {
        let adjust = self.hpet_period() * ticks as f64;
        self.epoch_adj
            .load(Ordering::Acquire)
            .wrapping_add(adjust as u64)
    }

    /// The one call everything paces against.
    pub fn now_ns(&self) -> u64 {
        match self.source() {
            ClockSource::Eth => {
                if let Some(port) = self.port.lock().unwrap().as_ref() {
                    if let Some(t) = port.timesync_time() {
                        return t;
                    }
                }
                self.time_from_hpet(self.hpet_ticks())
            }
            ClockSource::Hpet => self.time_from_hpet(self.hpet_ticks()),
            ClockSource::Rtc => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_nanos() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Slave engine
// ---------------------------------------------------------------------------

/// How the slave picks its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterChooseMode {
    /// Lock onto the first Announce seen (default).
    FirstKnown,
    /// Only accept the configured clock id.
    UserSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Multicast,
    Unicast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    OneStep,
    TwoStep,
}

#[derive(Debug, Clone)]
pub struct PtpConfig {
    pub addr_mode: AddrMode,
    pub step_mode: StepMode,
    pub master_choose: MasterChooseMode,
    pub master_clock_id: Option<ClockId>,
}

impl Default for PtpConfig {
    fn default() -> Self {
        PtpConfig {
            addr_mode: AddrMode::Multicast,
            step_mode: StepMode::TwoStep,
            master_choose: MasterChooseMode::FirstKnown,
            master_clock_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlaveState {
    NotInitialized,
    Initialized,
}

/// Exchange state behind the PTP spin lock. Only the delay-req thread
/// contends with the receive path.
struct Slave {
    state: SlaveState,
    master: PortIdentity,
    ours: PortIdentity,

    t1: u64,
    t2: u64,
    t3: u64,
    t4: u64,
    t2_hpet: u64,
    t3_hpet: u64,

    sync_seq_id: u16,
    delay_req_id: u16,
    domain: u8,

    /// Pending Delay_Req frame, handed to the delay-req thread.
    pending_req: Option<TxPacket>,

    pause_to_send_delay_req_us: u64,

    // contention observation, reset every Announce
    how_sync_in_announce: u32,
    how_delay_res_in_announce: u32,
    how_delay_res_our_in_announce: u32,
    how_higher_port_identity: u32,

    // frequency calibration anchors
    t1_hpet_freq_start: u64,
    t1_hpet_freq_clk: u64,
    t1_hpet_freq_clk_next: u64,

    vlan_tci: u16,

    /// Last computed |delta|, observable for convergence checks.
    last_delta_abs: i64,
}

/// The PTP engine: feed it PTP ethernet frames, run its delay-req
/// thread, and it keeps the clock disciplined.
pub struct PtpEngine {
    port: Arc<dyn NicPort>,
    clock: Arc<PtpClock>,
    config: PtpConfig,
    slave: SpinLock<Slave>,
    /// Wakes the delay-req thread when a request is pending.
    req_signal: (Mutex<bool>, Condvar),
    stop: AtomicBool,
    pub delay_req_sent: AtomicU64,
}

fn rand_below(n: u64) -> u64 {
    let mut b = [0u8; 8];
    let _ = getrandom::getrandom(&mut b);
    u64::from_ne_bytes(b) % n
}

impl PtpEngine {
    pub fn new(port: Arc<dyn NicPort>, clock: Arc<PtpClock>, config: PtpConfig) -> Arc<PtpEngine> {
        let ours = PortIdentity::from_mac(port.mac());
        let pause = PAUSE_TO_SEND_FIRST_DELAY_REQ_US + rand_below(10) * ORDER_WAIT_TIME_US;
        clock.attach_port(port.clone());
        Arc::new(PtpEngine {
            port,
            clock,
            config,
            slave: SpinLock::new(Slave {
                state: SlaveState::NotInitialized,
                master: PortIdentity {
                    clock_id: [0; 8],
                    port_number: 0,
                },
                ours,
                t1: 0,
                t2: 0,
                t3: 0,
                t4: 0,
                t2_hpet: 0,
                t3_hpet: 0,
                sync_seq_id: 0,
                delay_req_id: 0,
                domain: 0,
                pending_req: None,
                pause_to_send_delay_req_us: pause,
                how_sync_in_announce: 0,
                how_delay_res_in_announce: 0,
                how_delay_res_our_in_announce: 0,
                how_higher_port_identity: 0,
                t1_hpet_freq_start: 0,
                t1_hpet_freq_clk: 0,
                t1_hpet_freq_clk_next: 0,
                vlan_tci: 0,
                last_delta_abs: i64::MAX,
            }),
            req_signal: (Mutex::new(false), Condvar::new()),
            stop: AtomicBool::new(false),
            delay_req_sent: AtomicU64::new(0),
        })
    }

    pub fn our_identity(&self) -> PortIdentity {
        self.slave.lock().ours
    }

    pub fn last_delta_abs(&self) -> i64 {
        self.slave.lock().last_delta_abs
    }

    pub fn is_initialized(&self) -> bool {
        self.slave.lock().state == SlaveState::Initialized
    }

    /// Feed one received ethernet frame. Returns true when it was a PTP
    /// frame this engine consumed.
    pub fn on_ethernet_frame(self: &Arc<Self>, frame: &[u8], sw_time: u64) -> bool {
        if frame.len() < ETH_HDR_SIZE + PTP_HDR_SIZE {
            return false;
        }
        let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        let mut l2 = ETH_HDR_SIZE;
        let mut vlan_tci = 0u16;
        if ethertype == crate::streaming::net::ETHERTYPE_VLAN && frame.len() >= l2 + 4 {
            vlan_tci = u16::from_be_bytes([frame[14], frame[15]]) & 0x0fff;
            ethertype = u16::from_be_bytes([frame[16], frame[17]]);
            l2 += 4;
        }
        if ethertype != ETHERTYPE_PTP {
            return false;
        }
        let msg = &frame[l2..];
        let hdr = match PtpHeader::decode(msg) {
            Some(h) => h,
            None => return true,
        };
        let hpet_now = self.clock.hpet_ticks();
        match hdr.msg_type {
            PtpMessageType::Sync => self.on_sync(&hdr, sw_time, hpet_now),
            PtpMessageType::FollowUp => self.on_follow_up(&hdr, msg),
            PtpMessageType::DelayResp => self.on_delay_resp(&hdr, msg),
            PtpMessageType::Announce => self.on_announce(&hdr, vlan_tci),
            PtpMessageType::DelayReq => {} // our own, or another slave's
        }
        true
    }

    fn master_matches(&self, slave: &Slave, hdr: &PtpHeader) -> bool {
        slave.state == SlaveState::Initialized && slave.master == hdr.source_port_identity
    }

    fn on_announce(&self, hdr: &PtpHeader, vlan_tci: u16) {
        let mut s = self.slave.lock();
        s.vlan_tci = vlan_tci;
        match s.state {
            SlaveState::NotInitialized => {
                match self.config.master_choose {
                    MasterChooseMode::FirstKnown => {
                        s.master = hdr.source_port_identity;
                    }
                    MasterChooseMode::UserSet => {
                        let want = match self.config.master_clock_id {
                            Some(id) => id,
                            None => return,
                        };
                        if hdr.source_port_identity.clock_id != want {
                            return;
                        }
                        s.master = hdr.source_port_identity;
                    }
                }
                s.domain = hdr.domain;
                s.state = SlaveState::Initialized;
                info!(
                    "PTP master locked: {:02x?} port {}",
                    s.master.clock_id, s.master.port_number
                );
            }
            SlaveState::Initialized => {
                // Recompute the delay-req back-off from what the last
                // announce interval showed about coexisting slaves.
                if s.how_sync_in_announce != 0 {
                    let order = if s.how_delay_res_in_announce == s.how_delay_res_our_in_announce {
                        rand_below(10)
                    } else {
                        (s.how_higher_port_identity / s.how_sync_in_announce) as u64
                    };
                    s.pause_to_send_delay_req_us =
                        PAUSE_TO_SEND_FIRST_DELAY_REQ_US + order * ORDER_WAIT_TIME_US;
                } else {
                    s.pause_to_send_delay_req_us = PAUSE_TO_SEND_FIRST_DELAY_REQ_US;
                }
                debug!(
                    "PTP announce: pause_to_send_delay_req {} us",
                    s.pause_to_send_delay_req_us
                );
            }
        }
        s.how_sync_in_announce = 0;
        s.how_delay_res_in_announce = 0;
        s.how_delay_res_our_in_announce = 0;
        s.how_higher_port_identity = 0;
    }

    fn on_sync(&self, hdr: &PtpHeader, sw_time: u64, hpet_now: u64) {
        let mut s = self.slave.lock();
        if !self.master_matches(&s, hdr) {
            return;
        }
        // hardware RX timestamp when the port has timesync
        s.t2 = self.port.timesync_rx_timestamp().unwrap_or(sw_time);
        s.t2_hpet = self.clock.time_from_hpet(hpet_now);
        s.sync_seq_id = hdr.sequence_id;
        s.how_sync_in_announce += 1;
        if s.t1_hpet_freq_start == 0 {
            s.t1_hpet_freq_clk = hpet_now;
        }
        s.t1_hpet_freq_clk_next = hpet_now;
    }

    fn on_follow_up(self: &Arc<Self>, hdr: &PtpHeader, msg: &[u8]) {
        if msg.len() < SYNC_MSG_SIZE {
            return;
        }
        let mut s = self.slave.lock();
        if !self.master_matches(&s, hdr) {
            return;
        }
        if hdr.sequence_id != s.sync_seq_id {
            debug!("FOLLOW_UP sequence id differs from SYNC");
            return;
        }
        s.t1 = decode_timestamp(&msg[PTP_HDR_SIZE..]);
        if s.t1_hpet_freq_start == 0 {
            s.t1_hpet_freq_start = s.t1;
        }

        s.delay_req_id = s.delay_req_id.wrapping_add(1);
        let req = self.build_delay_req(&s);
        s.pending_req = Some(req);
        drop(s);

        let (lock, cvar) = &self.req_signal;
        *lock.lock().unwrap() = true;
        cvar.notify_one();
    }

    fn build_delay_req(&self, s: &Slave) -> TxPacket {
        let mut frame = vec![0u8; ETH_HDR_SIZE + DELAY_REQ_MSG_SIZE];
        let dst = match self.config.addr_mode {
            AddrMode::Multicast => PTP_MULTICAST_MAC,
            AddrMode::Unicast => s.master.to_mac(),
        };
        frame[0..6].copy_from_slice(&dst);
        frame[6..12].copy_from_slice(&self.port.mac());
        frame[12..14].copy_from_slice(&ETHERTYPE_PTP.to_be_bytes());

        let hdr = PtpHeader {
            msg_type: PtpMessageType::DelayReq,
            domain: s.domain,
            source_port_identity: s.ours,
            sequence_id: s.delay_req_id,
        };
        hdr.encode(&mut frame[ETH_HDR_SIZE..], DELAY_REQ_MSG_SIZE as u16);
        // originTimestamp stays zero on a delay request

        TxPacket {
            head: frame,
            ext: None,
            tx_time: 0,
        }
    }

    fn on_delay_resp(&self, hdr: &PtpHeader, msg: &[u8]) {
        if msg.len() < DELAY_RESP_MSG_SIZE {
            return;
        }
        let mut s = self.slave.lock();
        if s.state != SlaveState::Initialized {
            return;
        }
        s.how_delay_res_in_announce += 1;

        let requesting = PortIdentity::decode(&msg[PTP_HDR_SIZE + PTP_TIMESTAMP_SIZE..]);
        if requesting != s.ours {
            // someone else's exchange: remember it for the contention
            // back-off
            if requesting > s.ours {
                s.how_higher_port_identity += 1;
            }
            return;
        }
        if hdr.sequence_id != s.delay_req_id {
            debug!("DELAY_RESP does not match our DELAY_REQ id");
            return;
        }
        s.how_delay_res_our_in_announce += 1;

        // prefer the hardware TX timestamp of our Delay_Req
        if let Some(t3) = self.port.timesync_tx_timestamp() {
            s.t3 = t3;
        }
        s.t4 = decode_timestamp(&msg[PTP_HDR_SIZE..]);

        let delta = ((s.t4 as i64 - s.t3 as i64) - (s.t2 as i64 - s.t1 as i64)) / 2;
        self.port.timesync_adjust(delta);
        if self.port.timesync_time().is_some() {
            self.clock.set_source(ClockSource::Eth);
        }
        s.last_delta_abs = delta.abs();
        debug!("PTP delta {} ns", delta);

        let delta_hpet =
            ((s.t4 as i64 - s.t3_hpet as i64) - (s.t2_hpet as i64 - s.t1 as i64)) / 2;
        self.clock.add_epoch_adj(delta_hpet);

        // recalibrate the counter period over >=10 s of master time
        let cur_del = s.t1.saturating_sub(s.t1_hpet_freq_start);
        if s.t1_hpet_freq_start != 0 && cur_del >= MIN_FREQ_MEASURE_NS {
            let clk_del = s.t1_hpet_freq_clk_next.saturating_sub(s.t1_hpet_freq_clk);
            if clk_del != 0 {
                let period = cur_del as f64 / clk_del as f64;
                self.clock.set_hpet_period(period);
                info!("HPET period recalibrated: {:.9} ns/tick", period);
            }
            s.t1_hpet_freq_start = 0;
            s.t1_hpet_freq_clk = 0;
        }
    }

    /// The dedicated delay-request thread body. Parks until a Follow_Up
    /// arms a request, waits out the contention back-off, transmits via
    /// the shared extra ring and captures t3.
    pub fn delay_req_loop(self: Arc<Self>, shared_ring: Arc<SharedRing>) {
        let (lock, cvar) = &self.req_signal;
        while !self.stop.load(Ordering::Acquire) {
            {
                let mut armed = lock.lock().unwrap();
                while !*armed && !self.stop.load(Ordering::Acquire) {
                    let (guard, _timeout) = cvar
                        .wait_timeout(armed, Duration::from_millis(100))
                        .unwrap();
                    armed = guard;
                }
                if self.stop.load(Ordering::Acquire) {
                    return;
                }
                *armed = false;
            }

            let pause = self.slave.lock().pause_to_send_delay_req_us;
            std::thread::sleep(Duration::from_micros(pause));

            let req = self.slave.lock().pending_req.take();
            if let Some(req) = req {
                if shared_ring.push(req).is_err() {
                    warn!("delay request ring full, dropping");
                    continue;
                }
                self.delay_req_sent.fetch_add(1, Ordering::Relaxed);
                // software t3 until the response reads the hardware stamp
                let mut s = self.slave.lock();
                s.t3 = self.clock.now_ns();
                s.t3_hpet = self.clock.time_from_hpet(self.clock.hpet_ticks());
            }
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let (lock, cvar) = &self.req_signal;
        let _ = lock.lock().map(|mut g| *g = true);
        cvar.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::format::LinkSpeed;
    use crate::streaming::nic::LoopbackPort;
    use crate::streaming::ring::SharedRing;

    const MASTER: PortIdentity = PortIdentity {
        clock_id: [0xaa, 0xbb, 0xcc, 0xff, 0xfe, 0x01, 0x02, 0x03],
        port_number: 1,
    };

    fn eth_frame(msg: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HDR_SIZE + msg.len()];
        frame[0..6].copy_from_slice(&PTP_MULTICAST_MAC);
        frame[12..14].copy_from_slice(&ETHERTYPE_PTP.to_be_bytes());
        frame[ETH_HDR_SIZE..].copy_from_slice(msg);
        frame
    }

    fn announce() -> Vec<u8> {
        let mut msg = vec![0u8; ANNOUNCE_MSG_SIZE];
        PtpHeader {
            msg_type: PtpMessageType::Announce,
            domain: 0,
            source_port_identity: MASTER,
            sequence_id: 1,
        }
        .encode(&mut msg, ANNOUNCE_MSG_SIZE as u16);
        msg
    }

    fn sync(seq: u16) -> Vec<u8> {
        let mut msg = vec![0u8; SYNC_MSG_SIZE];
        PtpHeader {
            msg_type: PtpMessageType::Sync,
            domain: 0,
            source_port_identity: MASTER,
            sequence_id: seq,
        }
        .encode(&mut msg, SYNC_MSG_SIZE as u16);
        msg
    }

    fn follow_up(seq: u16, t1: u64) -> Vec<u8> {
        let mut msg = vec![0u8; SYNC_MSG_SIZE];
        PtpHeader {
            msg_type: PtpMessageType::FollowUp,
            domain: 0,
            source_port_identity: MASTER,
            sequence_id: seq,
        }
        .encode(&mut msg, SYNC_MSG_SIZE as u16);
        encode_timestamp(&mut msg[PTP_HDR_SIZE..], t1);
        msg
    }

    fn delay_resp(seq: u16, t4: u64, requesting: PortIdentity) -> Vec<u8> {
        let mut msg = vec![0u8; DELAY_RESP_MSG_SIZE];
        PtpHeader {
            msg_type: PtpMessageType::DelayResp,
            domain: 0,
            source_port_identity: MASTER,
            sequence_id: seq,
        }
        .encode(&mut msg, DELAY_RESP_MSG_SIZE as u16);
        encode_timestamp(&mut msg[PTP_HDR_SIZE..], t4);
        requesting.encode(&mut msg[PTP_HDR_SIZE + PTP_TIMESTAMP_SIZE..]);
        msg
    }

    fn engine() -> (Arc<PtpEngine>, Arc<LoopbackPort>, Arc<PtpClock>) {
        let port = Arc::new(LoopbackPort::new(
            [0x02, 0, 0, 0, 0, 0x42],
            LinkSpeed::G10,
            1,
            1,
        ));
        let clock = PtpClock::new();
        let engine = PtpEngine::new(port.clone(), clock.clone(), PtpConfig::default());
        (engine, port, clock)
    }

    #[test]
    fn test_timestamp_codec_roundtrip() {
        let mut buf = [0u8; PTP_TIMESTAMP_SIZE];
        for ns in [0u64, 999_999_999, 1_500_000_000, 1_700_000_000_123_456_789] {
            encode_timestamp(&mut buf, ns);
            assert_eq!(decode_timestamp(&buf), ns);
        }
    }

    #[test]
    fn test_port_identity_from_mac() {
        let id = PortIdentity::from_mac([1, 2, 3, 4, 5, 6]);
        assert_eq!(id.clock_id, [1, 2, 3, 0xff, 0xfe, 4, 5, 6]);
        assert_eq!(id.to_mac(), [1, 2, 3, 4, 5, 6]);
        assert_eq!(id.port_number, 1);
    }

    #[test]
    fn test_announce_locks_first_master() {
        let (engine, _, _) = engine();
        assert!(!engine.is_initialized());
        assert!(engine.on_ethernet_frame(&eth_frame(&announce()), 0));
        assert!(engine.is_initialized());
    }

    #[test]
    fn test_user_set_master_filters_announce() {
        let port = Arc::new(LoopbackPort::new(
            [0x02, 0, 0, 0, 0, 0x42],
            LinkSpeed::G10,
            1,
            1,
        ));
        let clock = PtpClock::new();
        let engine = PtpEngine::new(
            port,
            clock,
            PtpConfig {
                master_choose: MasterChooseMode::UserSet,
                master_clock_id: Some([9; 8]),
                ..Default::default()
            },
        );
        engine.on_ethernet_frame(&eth_frame(&announce()), 0);
        assert!(!engine.is_initialized());
    }

    #[test]
    fn test_no_delay_req_without_sync_follow_up_pair() {
        let (engine, _, _) = engine();
        engine.on_ethernet_frame(&eth_frame(&announce()), 0);
        engine.on_ethernet_frame(&eth_frame(&sync(5)), 1000);
        // mismatched sequence id: no request armed
        engine.on_ethernet_frame(&eth_frame(&follow_up(6, 900)), 0);
        assert!(engine.slave.lock().pending_req.is_none());
        // matching pair arms one
        engine.on_ethernet_frame(&eth_frame(&follow_up(5, 900)), 0);
        assert!(engine.slave.lock().pending_req.is_some());
    }

    // A stable simulated network: the computed |delta| must shrink over
    // consecutive exchanges as the port clock converges on the master.
    #[test]
    fn test_delta_decreases_over_exchanges() {
        let (engine, port, clock) = engine();
        engine.on_ethernet_frame(&eth_frame(&announce()), 0);

        // master runs 1 ms ahead of the port clock; wire delay 500 ns
        let master_offset = 1_000_000i64;
        let wire = 500u64;
        let ring = Arc::new(SharedRing::new(8));
        let mut deltas = Vec::new();

        for seq in 1..=3u16 {
            let t_local = port.timesync_time().unwrap();
            let t_master = (t_local as i64 + master_offset) as u64;
            engine.on_ethernet_frame(&eth_frame(&sync(seq)), t_local + wire);
            engine.on_ethernet_frame(&eth_frame(&follow_up(seq, t_master)), 0);

            // emulate the delay-req thread synchronously
            let req = engine.slave.lock().pending_req.take().unwrap();
            ring.push(req).map_err(|_| ()).unwrap();
            {
                let mut s = engine.slave.lock();
                s.t3 = port.timesync_time().unwrap();
                s.t3_hpet = clock.time_from_hpet(clock.hpet_ticks());
            }
            let t3 = engine.slave.lock().t3;
            let t4 = (t3 as i64 + master_offset) as u64 + wire;
            let req_id = engine.slave.lock().delay_req_id;
            engine.on_ethernet_frame(
                &eth_frame(&delay_resp(req_id, t4, engine.our_identity())),
                0,
            );
            deltas.push(engine.last_delta_abs());
        }

        // first exchange absorbs the 1 ms offset; later ones are tiny
        assert!(deltas[0] > 400_000, "deltas {:?}", deltas);
        assert!(deltas[1] < deltas[0] / 4, "deltas {:?}", deltas);
        assert!(deltas[2] < deltas[0] / 4, "deltas {:?}", deltas);
        assert_eq!(clock.source(), ClockSource::Eth);
    }

    #[test]
    fn test_foreign_delay_resp_counted_not_consumed() {
        let (engine, _, _) = engine();
        engine.on_ethernet_frame(&eth_frame(&announce()), 0);
        let other = PortIdentity::from_mac([0xff, 0xee, 0xdd, 1, 2, 3]);
        engine.on_ethernet_frame(&eth_frame(&delay_resp(1, 123, other)), 0);
        let s = engine.slave.lock();
        assert_eq!(s.how_delay_res_in_announce, 1);
        assert_eq!(s.how_delay_res_our_in_announce, 0);
        assert_eq!(s.t4, 0);
    }

    #[test]
    fn test_clock_sources() {
        let clock = PtpClock::new();
        clock.set_source(ClockSource::Hpet);
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
        clock.add_epoch_adj(5_000_000_000);
        assert!(clock.now_ns() >= a + 5_000_000_000);
    }
}
