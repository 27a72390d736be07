//! EBU compliance monitor.
//!
//! Live measurement of the ST 2110-21 pacing quantities on the receive
//! path: Cinst and VRX per packet, FPT / latency / timestamp difference
//! and increment per frame. Accumulators are averaged and logged with
//! PASS/FAIL verdicts every 100 frames, then reset. The monitor only
//! observes - it never back-pressures the data plane.

use tracing::info;

/// Narrow-gateway Cinst bound.
pub const CINST_NARROW_MAX: u64 = 5;
/// Wide-gateway Cinst bound.
pub const CINST_WIDE_MAX: u64 = 16;
/// Narrow-gateway VRX bound.
pub const VRX_NARROW_MAX: u64 = 9;
/// Wide-gateway VRX bound.
pub const VRX_WIDE_MAX: u64 = 720;
/// RTP-vs-epoch timestamp difference bound, 90 kHz ticks.
pub const TMD_MAX: u64 = 129;
/// Latency bound in ns.
pub const LAT_MAX: u64 = 1_000_000;

/// Frames between verdict logs.
const REPORT_INTERVAL_FRAMES: u64 = 100;

/// count / sum / min / max cluster.
#[derive(Debug, Clone, Copy)]
pub struct Accumulator {
    pub cnt: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl Accumulator {
    fn new() -> Accumulator {
        Accumulator {
            cnt: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    fn add(&mut self, v: u64) {
        self.cnt += 1;
        self.sum += v;
        if v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
    }

    pub fn avg(&self) -> f64 {
        if self.cnt == 0 {
            -1.0
        } else {
            self.sum as f64 / self.cnt as f64
        }
    }
}

/// Per-session EBU state.
pub struct EbuStats {
    pub cinst: Accumulator,
    pub vrx: Accumulator,
    pub fpt: Accumulator,
    pub lat: Accumulator,
    pub tmd: Accumulator,
    pub tmi: Accumulator,

    cin_tmstamp: u64,
    prev_rtp_tmstamp: u32,
    /// Epoch index of the frame currently being measured.
    pub epochs: u64,
}

impl EbuStats {
    pub fn new() -> EbuStats {
        EbuStats {
            cinst: Accumulator::new(),
            vrx: Accumulator::new(),
            fpt: Accumulator::new(),
            lat: Accumulator::new(),
            tmd: Accumulator::new(),
            tmi: Accumulator::new(),
            cin_tmstamp: 0,
            prev_rtp_tmstamp: 0,
            epochs: 0,
        }
    }

    fn clear_packet_level(&mut self) {
        self.cinst = Accumulator::new();
        self.vrx = Accumulator::new();
        self.cin_tmstamp = 0;
    }

    fn clear_frame_level(&mut self) {
        self.fpt = Accumulator::new();
        self.lat = Accumulator::new();
        self.tmd = Accumulator::new();
        self.tmi = Accumulator::new();
    }

    /// Per-packet measurement: VRX (drain-model buffer depth) and Cinst
    /// (instantaneous network compression).
    pub fn on_packet(&mut self, pkt_tmstamp: u64, pkt_cnt: u64, frame_time_ns: u64, tr_offset: u32, tprs: u32) {
        let epoch_tmstamp = self.epochs * frame_time_ns;
        let t_vd = epoch_tmstamp + tr_offset as u64;

        if pkt_tmstamp > t_vd {
            let expected = (pkt_tmstamp - t_vd) / tprs as u64;
            let diff = pkt_cnt.saturating_sub(expected);
            self.vrx.add(diff);
        }

        if pkt_cnt == 1 || self.cin_tmstamp == 0 {
            self.cin_tmstamp = pkt_tmstamp;
        } else {
            let diff_time = pkt_tmstamp.saturating_sub(self.cin_tmstamp);
            // the model drains 10% faster than the send rate
            let expected = (diff_time as f64 / tprs as f64 * 1.1) as u64;
            let cin = pkt_cnt.saturating_sub(expected);
            self.cinst.add(cin);
        }
    }

    /// First-packet-of-frame measurement: FPT, latency, RTP timestamp
    /// difference and increment. Re-anchors the epoch from the packet
    /// arrival time.
    pub fn on_first_packet(
        &mut self,
        rtp_tmstamp: u32,
        pkt_tmstamp: u64,
        frame_time_ns: u64,
        frame_ticks_90k: f64,
    ) {
        self.epochs = pkt_tmstamp / frame_time_ns;
        let epoch_tmstamp = self.epochs * frame_time_ns;

        let diff = pkt_tmstamp - epoch_tmstamp;
        self.lat.add(diff);
        self.fpt.add(diff);

        // expected 32-bit timestamp for this epoch; compare wrap-safe
        let tmstamp32 = (self.epochs as f64 * frame_ticks_90k) as u64 as u32;
        self.tmd.add(tmstamp32.abs_diff(rtp_tmstamp) as u64);

        if self.prev_rtp_tmstamp != 0 {
            self.tmi.add(rtp_tmstamp.wrapping_sub(self.prev_rtp_tmstamp) as u64);
        }
        self.prev_rtp_tmstamp = rtp_tmstamp;
    }

    /// Log verdicts and reset once per [`REPORT_INTERVAL_FRAMES`].
    pub fn maybe_report(&mut self, frms_recv: u64, timeslot: u32, tr_offset: u32) {
        if frms_recv == 0 || frms_recv % REPORT_INTERVAL_FRAMES != 0 {
            return;
        }
        self.report(timeslot, tr_offset);
        self.clear_packet_level();
        self.clear_frame_level();
    }

    pub fn report(&self, timeslot: u32, tr_offset: u32) {
        let cinst_verdict = if self.cinst.max <= CINST_NARROW_MAX {
            "PASSED NARROW"
        } else if self.cinst.max <= CINST_WIDE_MAX {
            "PASSED WIDE"
        } else {
            "FAILED"
        };
        info!(
            "Session {} Cinst AVG {:.2} MIN {} MAX {} test {}",
            timeslot,
            self.cinst.avg(),
            self.cinst.min.min(self.cinst.max),
            self.cinst.max,
            cinst_verdict
        );

        let vrx_verdict = if self.vrx.max <= VRX_NARROW_MAX {
            "PASSED NARROW"
        } else if self.vrx.max <= VRX_WIDE_MAX {
            "PASSED WIDE"
        } else {
            "FAILED"
        };
        info!(
            "Session {} VRX AVG {:.2} MIN {} MAX {} test {}",
            timeslot,
            self.vrx.avg(),
            self.vrx.min.min(self.vrx.max),
            self.vrx.max,
            vrx_verdict
        );

        info!(
            "Session {} TRO {} FPT AVG {:.2} MIN {} MAX {} test {}",
            timeslot,
            tr_offset,
            self.fpt.avg(),
            self.fpt.min.min(self.fpt.max),
            self.fpt.max,
            if self.fpt.max < 2 * tr_offset as u64 {
                "PASSED"
            } else {
                "FAILED"
            }
        );

        let tmi_verdict = if self.tmi.max == self.tmi.min
            || (self.tmi.max == 1502 && self.tmi.min == 1501)
        {
            "PASSED"
        } else {
            "FAILED"
        };
        info!(
            "Session {} TM inc AVG {:.2} MIN {} MAX {} test {}",
            timeslot,
            self.tmi.avg(),
            self.tmi.min.min(self.tmi.max),
            self.tmi.max,
            tmi_verdict
        );

        info!(
            "Session {} TMD MIN {} MAX {} test {}",
            timeslot,
            self.tmd.min.min(self.tmd.max),
            self.tmd.max,
            if self.tmd.max < TMD_MAX {
                "PASSED"
            } else {
                "FAILED"
            }
        );

        info!(
            "Session {} LAT AVG {:.2} MIN {} MAX {} test {}",
            timeslot,
            self.lat.avg(),
            self.lat.min.min(self.lat.max),
            self.lat.max,
            if self.lat.max < LAT_MAX {
                "PASSED"
            } else {
                "FAILED"
            }
        );
    }
}

impl Default for EbuStats {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
