//! Media format tables.
//!
//! Video formats cover the vscan x packet-format cross the transmitter
//! and receiver understand; the NIC-rate table bounds session and thread
//! counts per link speed, mirroring what a 2110-capable NIC can sustain
//! per frame rate.

use crate::streaming::net::{PHY_OVERHEAD, RTP_OFFSET};
use crate::streaming::pack::{PIXELS_PER_GROUP, PIXEL_GROUP_SIZE};
use crate::streaming::rtp::{RFC4175_DUAL_HDR_SIZE, RFC4175_SINGLE_HDR_SIZE};
use crate::streaming::StError;

pub const NS_PER_SEC: u64 = 1_000_000_000;

/// RTP video clock.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;
/// Nanoseconds per 90 kHz tick, rounded as the original does.
pub const VIDEO_TMSTAMP_TIME_NS: u32 = 11_111;

/// Scan geometry of a video session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vscan {
    P720,
    P1080,
    P2160,
    I720,
    I1080,
    I2160,
}

impl Vscan {
    pub fn width(self) -> u32 {
        match self {
            Vscan::P720 | Vscan::I720 => 1280,
            Vscan::P1080 | Vscan::I1080 => 1920,
            Vscan::P2160 | Vscan::I2160 => 3840,
        }
    }

    pub fn height(self) -> u32 {
        match self {
            Vscan::P720 | Vscan::I720 => 720,
            Vscan::P1080 | Vscan::I1080 => 1080,
            Vscan::P2160 | Vscan::I2160 => 2160,
        }
    }

    /// Total line count of the raster including blanking, the divisor of
    /// the gapped TPRS model.
    pub fn total_lines(self) -> u32 {
        match self {
            Vscan::P720 | Vscan::I720 => 750,
            Vscan::P1080 | Vscan::I1080 => 1125,
            Vscan::P2160 | Vscan::I2160 => 2250,
        }
    }

    /// Lines between the epoch boundary and the first active packet.
    pub fn tr_offset_lines(self) -> u32 {
        match self {
            Vscan::P720 | Vscan::I720 => 14,
            Vscan::P1080 | Vscan::I1080 => 21,
            Vscan::P2160 | Vscan::I2160 => 43,
        }
    }

    pub fn interlaced(self) -> bool {
        matches!(self, Vscan::I720 | Vscan::I1080 | Vscan::I2160)
    }
}

/// RFC 4175 encapsulation variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PktFmt {
    /// Two lines per packet (Intel extension).
    IntelDualLine,
    /// One line split into equal packets plus a short tail (Intel).
    IntelSingleLine,
    /// Single line, arbitrary vendor split.
    OtherSingleLine,
}

/// Frame rates the pacing engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameRate {
    P25,
    P29_97,
    P50,
    P59_94,
}

impl FrameRate {
    pub fn from_cli(rate: u32) -> Result<FrameRate, StError> {
        match rate {
            25 => Ok(FrameRate::P25),
            29 => Ok(FrameRate::P29_97),
            50 => Ok(FrameRate::P50),
            59 => Ok(FrameRate::P59_94),
            _ => Err(StError::BadFrameRate(rate)),
        }
    }

    /// (numerator, denominator) of frames per second.
    pub fn ratio(self) -> (u32, u32) {
        match self {
            FrameRate::P25 => (25, 1),
            FrameRate::P29_97 => (30_000, 1001),
            FrameRate::P50 => (50, 1),
            FrameRate::P59_94 => (60_000, 1001),
        }
    }

    /// Frame duration in nanoseconds (truncated, as the pacing engine
    /// divides epochs).
    pub fn frame_time_ns(self) -> u64 {
        match self {
            FrameRate::P25 => 40_000_000,
            FrameRate::P29_97 => 1_000_000 * 1001 / 30,
            FrameRate::P50 => 20_000_000,
            FrameRate::P59_94 => 1_000_000 * 1001 / 60,
        }
    }
}

/// ST 2110-21 pacer model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerType {
    /// Narrow gapped (default): TPRS spread over the full raster
    /// including blanking.
    Tpn,
    /// Narrow linear.
    Tpnl,
    /// Wide.
    Tpw,
}

// ---------------------------------------------------------------------------
// Video format
// ---------------------------------------------------------------------------

/// Fully derived geometry of a video session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub vscan: Vscan,
    pub pkt_fmt: PktFmt,
    pub rate: FrameRate,
    pub width: u32,
    pub height: u32,
    pub clock_rate: u32,
    pub frame_time_ns: u64,
    /// Pixels carried by one packet (both lines for dual-line).
    pub pixels_in_pkt: u32,
    /// Packets per line (single-line) or per line pair (dual-line).
    pub pkts_in_line: u32,
    /// Active content packets per frame (per field when interlaced).
    pub pkts_in_frame: u32,
    /// L2 size of a full media packet.
    pub pkt_size: u32,
}

impl VideoFormat {
    pub fn new(vscan: Vscan, pkt_fmt: PktFmt, rate: FrameRate) -> Result<VideoFormat, StError> {
        let width = vscan.width();
        let height = vscan.height();
        let interlaced = vscan.interlaced();

        // pixels_in_pkt is the per-line advance of one packet; a dual-line
        // packet carries that many pixels of BOTH lines
        let (pixels_in_pkt, pkts_in_line) = match (vscan, pkt_fmt) {
            // 5 packets per line pair, 640 bytes per line half
            (Vscan::P720 | Vscan::I720, PktFmt::IntelDualLine) => (256, 5),
            // 1200 + 1200 + 800 byte payloads
            (Vscan::P720 | Vscan::I720, _) => (480, 3),
            // 8 packets per line pair, 600 bytes per line half
            (Vscan::P1080 | Vscan::I1080, PktFmt::IntelDualLine) => (240, 8),
            (Vscan::P1080 | Vscan::I1080, _) => (480, 4),
            (Vscan::P2160 | Vscan::I2160, PktFmt::IntelDualLine) => {
                return Err(StError::BadPktFmt)
            }
            (Vscan::P2160 | Vscan::I2160, _) => (480, 8),
        };

        // content packets: lines (or line pairs) times packets each
        let content_lines = if interlaced { height / 2 } else { height };
        let pkts_in_frame = match pkt_fmt {
            PktFmt::IntelDualLine => content_lines / 2 * pkts_in_line,
            _ => content_lines * pkts_in_line,
        };

        let line_payload = pixels_in_pkt / PIXELS_PER_GROUP as u32 * PIXEL_GROUP_SIZE as u32;
        let payload = match pkt_fmt {
            PktFmt::IntelDualLine => 2 * line_payload,
            // full-size packet; the line tail may be shorter
            _ => line_payload,
        };
        let hdr = match pkt_fmt {
            PktFmt::IntelDualLine => RTP_OFFSET + RFC4175_DUAL_HDR_SIZE,
            _ => RTP_OFFSET + RFC4175_SINGLE_HDR_SIZE,
        };
        let pkt_size = hdr as u32 + payload;

        Ok(VideoFormat {
            vscan,
            pkt_fmt,
            rate,
            width,
            height,
            clock_rate: VIDEO_CLOCK_RATE,
            frame_time_ns: rate.frame_time_ns(),
            pixels_in_pkt,
            pkts_in_line,
            pkts_in_frame,
            pkt_size,
        })
    }

    /// Bytes of one packed scan line.
    pub fn line_size(&self) -> u32 {
        self.width / PIXELS_PER_GROUP as u32 * PIXEL_GROUP_SIZE as u32
    }

    /// Bytes of one received frame (one field for interlaced sessions).
    pub fn frame_size(&self) -> u32 {
        let full = self.source_frame_size();
        if self.vscan.interlaced() {
            full / 2
        } else {
            full
        }
    }

    /// Bytes of the producer's source buffer: always the full raster;
    /// interlaced sessions read alternating lines out of it.
    pub fn source_frame_size(&self) -> u32 {
        self.width * self.height * PIXEL_GROUP_SIZE as u32 / PIXELS_PER_GROUP as u32
    }

    /// Wire L1 size of a full media packet.
    pub fn pkt_l1_size(&self) -> u32 {
        self.pkt_size + PHY_OVERHEAD as u32
    }

    /// RTP header length for this encapsulation.
    pub fn rtp_hdr_size(&self) -> usize {
        match self.pkt_fmt {
            PktFmt::IntelDualLine => RFC4175_DUAL_HDR_SIZE,
            _ => RFC4175_SINGLE_HDR_SIZE,
        }
    }

    /// Payload bytes per packet per line (the "line length" field).
    pub fn line_payload(&self) -> u32 {
        self.pixels_in_pkt / PIXELS_PER_GROUP as u32 * PIXEL_GROUP_SIZE as u32
    }

    /// TPRS (ns between two packets of this session) under `pacer`.
    pub fn tprs(&self, pacer: PacerType) -> u32 {
        let gapped_slots = self.gapped_pkts_in_frame();
        match pacer {
            PacerType::Tpn => (self.frame_time_ns / gapped_slots as u64) as u32,
            PacerType::Tpnl | PacerType::Tpw => {
                (self.frame_time_ns / self.pkts_in_frame as u64) as u32
            }
        }
    }

    /// Packet slots per frame in the gapped model (blanking included).
    pub fn gapped_pkts_in_frame(&self) -> u32 {
        let mut slots = self.pkts_in_line * self.vscan.total_lines();
        if self.pkt_fmt == PktFmt::IntelDualLine {
            slots /= 2;
        }
        if self.vscan.interlaced() {
            slots /= 2;
        }
        slots
    }

    /// trOffset in ns: rise-offset lines scaled into the frame time.
    pub fn tr_offset(&self) -> u32 {
        (self.frame_time_ns * self.vscan.tr_offset_lines() as u64
            / self.vscan.total_lines() as u64) as u32
    }

    /// 90 kHz ticks per frame, kept fractional for epoch scaling.
    pub fn frame_ticks_90k(&self) -> f64 {
        let (mul, den) = self.rate.ratio();
        self.clock_rate as f64 * den as f64 / mul as f64
    }
}

// ---------------------------------------------------------------------------
// Audio format (ST 2110-30)
// ---------------------------------------------------------------------------

/// PCM audio session geometry: 48 kHz, 1 ms packet time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u32,
    /// Bytes per sample per channel (2 = 16-bit, 3 = 24-bit).
    pub sample_size: u32,
    /// Sample groups per packet (1 ms worth).
    pub sample_grp_count: u32,
    /// Packet cadence in ns.
    pub epoch_time_ns: u64,
}

impl AudioFormat {
    pub fn new(channels: u32, sample_size: u32) -> AudioFormat {
        AudioFormat {
            sample_rate: 48_000,
            channels,
            sample_size,
            sample_grp_count: 48,
            epoch_time_ns: 1_000_000,
        }
    }

    /// One sample group: one sample of every channel.
    pub fn sample_grp_size(&self) -> u32 {
        self.channels * self.sample_size
    }

    pub fn payload_size(&self) -> u32 {
        self.sample_grp_size() * self.sample_grp_count
    }

    /// L2 packet size.
    pub fn pkt_size(&self) -> u32 {
        (RTP_OFFSET + crate::streaming::rtp::RTP_HDR_SIZE) as u32 + self.payload_size()
    }
}

// ---------------------------------------------------------------------------
// Ancillary format (ST 2110-40)
// ---------------------------------------------------------------------------

/// Ancillary-data session geometry: one packet per frame time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncFormat {
    pub rate: FrameRate,
    pub clock_rate: u32,
    pub frame_time_ns: u64,
}

impl AncFormat {
    pub fn new(rate: FrameRate) -> AncFormat {
        AncFormat {
            rate,
            clock_rate: VIDEO_CLOCK_RATE,
            frame_time_ns: rate.frame_time_ns(),
        }
    }

    pub fn frame_ticks_90k(&self) -> f64 {
        let (mul, den) = self.rate.ratio();
        self.clock_rate as f64 * den as f64 / mul as f64
    }
}

// ---------------------------------------------------------------------------
// NIC rate table
// ---------------------------------------------------------------------------

/// Link speeds the pacing tables cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSpeed {
    G10,
    G25,
    G40,
    G100,
}

impl LinkSpeed {
    pub fn gbps(self) -> u32 {
        match self {
            LinkSpeed::G10 => 10,
            LinkSpeed::G25 => 25,
            LinkSpeed::G40 => 40,
            LinkSpeed::G100 => 100,
        }
    }

    pub fn from_gbps(gbps: u32) -> Result<LinkSpeed, StError> {
        match gbps {
            10 => Ok(LinkSpeed::G10),
            25 => Ok(LinkSpeed::G25),
            40 => Ok(LinkSpeed::G40),
            100 => Ok(LinkSpeed::G100),
            _ => Err(StError::BadNicRate(gbps)),
        }
    }

    /// Effective rate numerator over 10000: 100 GbE pacing targets
    /// 98.46 Gb to stay inside the shaper.
    pub fn quot_adjust(self) -> u32 {
        match self {
            LinkSpeed::G100 => 9846,
            _ => 10_000,
        }
    }

    /// Worst-case NIC internal latency budgeted ahead of the wire time.
    pub fn nic_tx_time_ns(self) -> u32 {
        match self {
            LinkSpeed::G10 => 35_000,
            LinkSpeed::G25 => 25_000,
            LinkSpeed::G40 => 15_000,
            LinkSpeed::G100 => 9_000,
        }
    }
}

/// Per-speed capacity limits.
#[derive(Debug, Clone, Copy)]
pub struct NicRateParams {
    pub speed: LinkSpeed,
    pub max_st21_25fps: u32,
    pub max_st21_29fps: u32,
    pub max_st21_50fps: u32,
    pub max_st21_59fps: u32,
    pub max_tx_rings: u32,
    pub max_sch_threads: u32,
    pub max_enq_threads: u32,
    pub max_rcv_threads: u32,
}

pub const NIC_RATE_TABLE: [NicRateParams; 4] = [
    NicRateParams {
        speed: LinkSpeed::G10,
        max_st21_25fps: 8,
        max_st21_29fps: 6,
        max_st21_50fps: 4,
        max_st21_59fps: 3,
        max_tx_rings: 1,
        max_sch_threads: 1,
        max_enq_threads: 1,
        max_rcv_threads: 1,
    },
    NicRateParams {
        speed: LinkSpeed::G25,
        max_st21_25fps: 20,
        max_st21_29fps: 16,
        max_st21_50fps: 10,
        max_st21_59fps: 8,
        max_tx_rings: 1,
        max_sch_threads: 1,
        max_enq_threads: 2,
        max_rcv_threads: 2,
    },
    NicRateParams {
        speed: LinkSpeed::G40,
        max_st21_25fps: 32,
        max_st21_29fps: 28,
        max_st21_50fps: 16,
        max_st21_59fps: 14,
        max_tx_rings: 1,
        max_sch_threads: 1,
        max_enq_threads: 4,
        max_rcv_threads: 4,
    },
    NicRateParams {
        speed: LinkSpeed::G100,
        max_st21_25fps: 80,
        max_st21_29fps: 64,
        max_st21_50fps: 40,
        max_st21_59fps: 32,
        max_tx_rings: 2,
        max_sch_threads: 2,
        max_enq_threads: 8,
        max_rcv_threads: 8,
    },
];

impl NicRateParams {
    pub fn for_speed(speed: LinkSpeed) -> &'static NicRateParams {
        NIC_RATE_TABLE
            .iter()
            .find(|p| p.speed == speed)
            .expect("table covers every speed")
    }

    /// 1080p-equivalent session budget at `rate`. 720p counts one
    /// quarter, 2160p four times.
    pub fn max_sessions(&self, rate: FrameRate, vscan: Vscan) -> u32 {
        let base = match rate {
            FrameRate::P25 => self.max_st21_25fps,
            FrameRate::P29_97 => self.max_st21_29fps,
            FrameRate::P50 => self.max_st21_50fps,
            FrameRate::P59_94 => self.max_st21_59fps,
        };
        match vscan {
            Vscan::P720 | Vscan::I720 => base * 4,
            Vscan::P1080 | Vscan::I1080 => base,
            Vscan::P2160 | Vscan::I2160 => (base / 4).max(1),
        }
    }
}

pub const MAX_SESSIONS: usize = 160;
pub const MAX_ENQ_THREADS: usize = 8;
pub const MAX_RCV_THREADS: usize = 8;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_1080p_single_line_geometry() {
        let fmt = VideoFormat::new(Vscan::P1080, PktFmt::IntelSingleLine, FrameRate::P29_97)
            .unwrap();
        assert_eq!(fmt.line_size(), 4800);
        assert_eq!(fmt.pkts_in_line, 4);
        assert_eq!(fmt.pkts_in_frame, 4320);
        assert_eq!(fmt.line_payload(), 1200);
        // 14 + 20 + 8 + 20 header + 1200 payload
        assert_eq!(fmt.pkt_size, 1262);
        assert_eq!(fmt.frame_size(), 5_184_000);
        assert_eq!(fmt.gapped_pkts_in_frame(), 4500);
    }

    #[test]
    fn test_1080p_dual_line_geometry() {
        let fmt =
            VideoFormat::new(Vscan::P1080, PktFmt::IntelDualLine, FrameRate::P29_97).unwrap();
        assert_eq!(fmt.pkts_in_frame, 4320);
        assert_eq!(fmt.line_payload(), 600);
        // 14 + 20 + 8 + 26 header + 1200 payload
        assert_eq!(fmt.pkt_size, 1268);
        assert_eq!(fmt.gapped_pkts_in_frame(), 4500);
    }

    #[test]
    fn test_720p_short_tail() {
        let fmt =
            VideoFormat::new(Vscan::P720, PktFmt::IntelSingleLine, FrameRate::P50).unwrap();
        assert_eq!(fmt.line_size(), 3200);
        assert_eq!(fmt.pkts_in_line, 3);
        // two full packets and an 800-byte tail
        assert_eq!(fmt.line_size() - 2 * fmt.line_payload(), 800);
        assert_eq!(fmt.pkts_in_frame, 2160);
    }

    #[test]
    fn test_2160p_geometry() {
        let fmt =
            VideoFormat::new(Vscan::P2160, PktFmt::OtherSingleLine, FrameRate::P59_94).unwrap();
        assert_eq!(fmt.line_size(), 9600);
        assert_eq!(fmt.pkts_in_line, 8);
        assert_eq!(fmt.pkts_in_frame, 2160 * 8);
        assert!(VideoFormat::new(Vscan::P2160, PktFmt::IntelDualLine, FrameRate::P25).is_err());
    }

    #[test]
    fn test_interlaced_halves_frame() {
        let p = VideoFormat::new(Vscan::P1080, PktFmt::OtherSingleLine, FrameRate::P29_97)
            .unwrap();
        let i = VideoFormat::new(Vscan::I1080, PktFmt::OtherSingleLine, FrameRate::P29_97)
            .unwrap();
        assert_eq!(i.pkts_in_frame * 2, p.pkts_in_frame);
        assert_eq!(i.frame_size() * 2, p.frame_size());
    }

    #[test]
    fn test_frame_times() {
        assert_eq!(FrameRate::P25.frame_time_ns(), 40_000_000);
        assert_eq!(FrameRate::P29_97.frame_time_ns(), 33_366_666);
        assert_eq!(FrameRate::P59_94.frame_time_ns(), 16_683_333);
    }

    #[test]
    fn test_tprs_models() {
        let fmt = VideoFormat::new(Vscan::P1080, PktFmt::IntelSingleLine, FrameRate::P29_97)
            .unwrap();
        let gapped = fmt.tprs(PacerType::Tpn);
        let linear = fmt.tprs(PacerType::Tpnl);
        // gapped spreads over 4500 slots, linear over 4320
        assert_eq!(gapped, (fmt.frame_time_ns / 4500) as u32);
        assert_eq!(linear, (fmt.frame_time_ns / 4320) as u32);
        assert!(gapped < linear);
    }

    #[test]
    fn test_audio_format_scenario() {
        // 48 kHz, 8 channel, 24-bit, 1 ms packets
        let fmt = AudioFormat::new(8, 3);
        assert_eq!(fmt.sample_grp_size(), 24);
        assert_eq!(fmt.sample_grp_count, 48);
        assert_eq!(fmt.payload_size(), 1152);
        assert_eq!(fmt.pkt_size(), 42 + 12 + 1152);
    }

    #[test]
    fn test_nic_rate_table_sessions() {
        let p = NicRateParams::for_speed(LinkSpeed::G25);
        assert_eq!(p.max_sessions(FrameRate::P29_97, Vscan::P1080), 16);
        assert_eq!(p.max_sessions(FrameRate::P29_97, Vscan::P720), 64);
        assert_eq!(p.max_sessions(FrameRate::P59_94, Vscan::P2160), 2);
    }
}
