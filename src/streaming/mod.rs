//! Wire-level ST 2110 send/receive core.
//!
//! The modules here split the same way the data moves: `send` builds
//! RTP packets into per-session rings, `sched` drains them onto the NIC
//! under the ST 2110-21 pacing envelope, `recv` reassembles frames on
//! the way in, `ptp` keeps the epoch clock all of them reference, and
//! `ebu` watches the result. `session` owns the registry tying it
//! together; `audio` and `anc` carry the non-video essences.

pub mod anc;
pub mod audio;
pub mod dedup;
pub mod ebu;
pub mod format;
pub mod net;
pub mod nic;
pub mod pack;
pub mod ptp;
pub mod recv;
pub mod ring;
pub mod rtp;
pub mod sched;
pub mod send;
pub mod session;
pub mod sync;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// TX frames that may be in flight per session: one being packetised,
/// one being filled by the producer.
pub const SEND_APP_FRAME_MAX: usize = 2;
/// RX rotating buffers, so late packets of prior frames still land.
pub const RECV_APP_FRAME_MAX: usize = 6;

/// Consecutive redundant packets per port before dedup force-accepts.
pub const SESSION_REDUNDANT_ERROR_THRESHOLD: u32 = 20;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Library status codes. Packet-level conditions stay inside the data
/// plane as counters; only session-fatal variants cross the public API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StError {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("out of memory for {0}")]
    NoMemory(&'static str),
    #[error("no free timeslot for the requested packet time")]
    NoTimeslot,
    #[error("frame rate {0} not supported")]
    BadFrameRate(u32),
    #[error("NIC rate {0} Gbps not supported")]
    BadNicRate(u32),
    #[error("packet format not supported for this scan")]
    BadPktFmt,
    #[error("pacer type not supported")]
    BadPacing,
    #[error("clock rate not supported")]
    BadClockRate,
    #[error("session not ready")]
    SnNotReady,
    #[error("device not ready")]
    DevNotReady,
    #[error("flow rule installation failed")]
    FlowRule,
    #[error("PTP engine error")]
    Ptp,
}

impl StError {
    /// Numeric code in the ST ranges (device errors 0x300..).
    pub fn code(&self) -> i32 {
        let c = match self {
            StError::InvalidParam => 0x01,
            StError::NoMemory(_) => 0x02,
            StError::NoTimeslot => 0x10,
            StError::SnNotReady => 0x11,
            StError::BadFrameRate(_) => 0x20,
            StError::BadNicRate(_) => 0x21,
            StError::BadPktFmt => 0x22,
            StError::BadPacing => 0x23,
            StError::BadClockRate => 0x24,
            StError::DevNotReady => 0x30,
            StError::FlowRule => 0x31,
            StError::Ptp => 0x32,
        };
        -(0x300 + c)
    }
}

/// Packet-level drop reasons, indexing the per-session counters
/// (0x100 range).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PktDrop {
    BadPktLen = 0,
    BadIpLen,
    BadUdpLen,
    BadRtpHdr,
    BadRtpTmstamp,
    BadRtpLnLen,
    BadRtpLnNum,
    BadRtpOffset,
    BadRtpLnCont,
    NoFrameBuf,
    RedundantPath,
}

pub const PKT_DROP_KINDS: usize = 11;

/// Frame-level drop reasons (0x200 range).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum FrmDrop {
    BadTmstamp = 0,
    NoFrameBuf,
    IncompleteFrame,
}

pub const FRM_DROP_KINDS: usize = 3;

// ---------------------------------------------------------------------------
// Session identity and state
// ---------------------------------------------------------------------------

/// Direction of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Producer,
    Consumer,
}

/// Media essence of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Essence {
    Video,
    Audio,
    Ancillary,
}

/// Session lifecycle. Stored as an atomic so the data plane reads it
/// without the session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SnState {
    Off = 0,
    /// Created but idle, waiting for the first frame.
    On = 1,
    /// Actively streaming.
    Run = 2,
    /// Producer returned no buffer; retry on the next round.
    NoNextFrame = 3,
    /// Producer has not advanced the slice yet.
    NoNextSlice = 4,
    /// Stop requested, draining.
    StopPending = 5,
    /// Receiver saw no progress for over a frame interval.
    Timedout = 6,
}

impl SnState {
    fn from_u8(v: u8) -> SnState {
        match v {
            1 => SnState::On,
            2 => SnState::Run,
            3 => SnState::NoNextFrame,
            4 => SnState::NoNextSlice,
            5 => SnState::StopPending,
            6 => SnState::Timedout,
            _ => SnState::Off,
        }
    }
}

/// Atomic wrapper for [`SnState`].
pub struct AtomicSnState(AtomicU8);

impl AtomicSnState {
    pub fn new(state: SnState) -> Self {
        AtomicSnState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> SnState {
        SnState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: SnState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Per-session statistics, updated lock-free from the data plane.
#[derive(Default)]
pub struct SessionStats {
    pub pkts_send: AtomicU64,
    pub frms_send: AtomicU64,
    pub pkts_recv: AtomicU64,
    pub frms_recv: AtomicU64,
    pub frms_fixed: AtomicU64,
    pub pkts_drop_total: AtomicU64,
    pub frms_drop_total: AtomicU64,
    pub pkts_lost_timedout: AtomicU64,
    pkts_drop: [AtomicU64; PKT_DROP_KINDS],
    frms_drop: [AtomicU64; FRM_DROP_KINDS],
}

impl SessionStats {
    pub fn drop_pkt(&self, reason: PktDrop) {
        self.pkts_drop_total.fetch_add(1, Ordering::Relaxed);
        self.pkts_drop[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_frame(&self, reason: FrmDrop) {
        self.frms_drop_total.fetch_add(1, Ordering::Relaxed);
        self.frms_drop[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn pkts_dropped(&self, reason: PktDrop) -> u64 {
        self.pkts_drop[reason as usize].load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self, reason: FrmDrop) -> u64 {
        self.frms_drop[reason as usize].load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Frame buffers and application callbacks
// ---------------------------------------------------------------------------

/// A producer-side frame. The producer fills one fully, hands it over,
/// and recycles it through `Arc::get_mut` once the core drops its
/// reference - at most [`SEND_APP_FRAME_MAX`] are alive per session.
pub struct FrameBuf {
    data: Box<[u8]>,
}

impl FrameBuf {
    pub fn new(size: usize) -> Arc<FrameBuf> {
        Arc::new(FrameBuf {
            data: vec![0u8; size].into_boxed_slice(),
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Arc<FrameBuf> {
        Arc::new(FrameBuf {
            data: data.into_boxed_slice(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Mutable access for an exclusively held frame (producer refill path).
pub fn frame_buf_mut(frame: &mut Arc<FrameBuf>) -> Option<&mut [u8]> {
    Arc::get_mut(frame).map(|f| &mut *f.data)
}

/// Video producer callbacks, polled from the enqueue thread.
pub trait VideoProducer: Send {
    /// Next frame to transmit. `prev` is the frame just finished, handed
    /// back for reuse. `None` parks the session in NoNextFrame.
    fn next_frame(&mut self, prev: Option<Arc<FrameBuf>>, field_id: u8) -> Option<Arc<FrameBuf>>;

    /// Highest byte offset of `frame` that is ready to read. Producers
    /// that fill whole frames return the frame size immediately.
    fn next_slice_offset(&mut self, frame: &FrameBuf, prev_offset: u32, field_id: u8) -> u32;
}

/// Video consumer callbacks, driven from the receiver thread.
pub trait VideoConsumer: Send {
    /// A complete (or repaired) frame.
    fn frame_recv(&mut self, frame: &[u8], tmstamp: u32, field_id: u8);

    /// The previous frame will no longer be written to.
    fn frame_done(&mut self, tmstamp: u32);
}

/// Audio producer: hands over filled buffers of whole packets.
pub trait AudioProducer: Send {
    fn next_buffer(&mut self, prev: Option<Arc<FrameBuf>>) -> Option<Arc<FrameBuf>>;
}

/// Audio consumer callbacks.
pub trait AudioConsumer: Send {
    fn sample_recv(&mut self, buf: &[u8], buf_offset: u32, tmstamp: u32);
    fn buffer_done(&mut self, buf: &[u8]);
}
