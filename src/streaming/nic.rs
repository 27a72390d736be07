//! The NIC seam.
//!
//! The kernel-bypass driver itself is an external collaborator: the core
//! only needs a port that consumes prepared packet bursts on a TX queue
//! and surfaces RX bursts with timestamps. [`NicPort`] is that seam.
//! Two implementations live here: [`LoopbackPort`] backs the tests, and
//! [`UdpFallbackPort`] runs the stack end-to-end over the host kernel's
//! UDP sockets on machines without a bypass NIC (pacing fidelity is
//! whatever the kernel gives you; PAUSE frames never reach a real wire
//! and are dropped at this seam).

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::streaming::format::LinkSpeed;
use crate::streaming::net::{self, PacketView, PHY_OVERHEAD};
use crate::streaming::FrameBuf;

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// Borrowed payload range of a producer frame, chained after the header
/// bytes without copying.
#[derive(Clone)]
pub struct PayloadRef {
    pub frame: Arc<FrameBuf>,
    pub offset: u32,
    pub len: u32,
}

impl PayloadRef {
    pub fn bytes(&self) -> &[u8] {
        &self.frame.bytes()[self.offset as usize..(self.offset + self.len) as usize]
    }
}

/// A media packet ready for the wire: rendered headers (plus inline
/// payload for dual-line formats) and an optional zero-copy tail.
pub struct TxPacket {
    pub head: Vec<u8>,
    pub ext: Option<PayloadRef>,
    /// Absolute PTP ns the NIC should launch this packet; 0 = as soon
    /// as possible.
    pub tx_time: u64,
}

impl TxPacket {
    pub fn l2_len(&self) -> usize {
        self.head.len() + self.ext.as_ref().map_or(0, |e| e.len as usize)
    }

    pub fn l1_len(&self) -> usize {
        self.l2_len() + PHY_OVERHEAD
    }

    /// Flatten header + tail into one frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.l2_len());
        out.extend_from_slice(&self.head);
        if let Some(ext) = &self.ext {
            out.extend_from_slice(ext.bytes());
        }
        out
    }
}

/// What the scheduler hands to the port: media or a truncated PAUSE.
pub enum WirePacket {
    Media(TxPacket),
    Pause {
        template: Arc<Vec<u8>>,
        l2_len: usize,
    },
}

impl WirePacket {
    pub fn l2_len(&self) -> usize {
        match self {
            WirePacket::Media(p) => p.l2_len(),
            WirePacket::Pause { l2_len, .. } => *l2_len,
        }
    }

    pub fn l1_len(&self) -> usize {
        self.l2_len() + PHY_OVERHEAD
    }

    pub fn tx_time(&self) -> u64 {
        match self {
            WirePacket::Media(p) => p.tx_time,
            WirePacket::Pause { .. } => 0,
        }
    }

    /// Clear the launch time (used when a requested time is out of range).
    pub fn clear_tx_time(&mut self) {
        if let WirePacket::Media(p) = self {
            p.tx_time = 0;
        }
    }

    pub fn to_frame(&self) -> Vec<u8> {
        match self {
            WirePacket::Media(p) => p.to_frame(),
            WirePacket::Pause { template, l2_len } => template[..*l2_len].to_vec(),
        }
    }
}

/// A received frame plus the PTP time stamped at ingress.
pub struct RxPacket {
    pub data: Vec<u8>,
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// Port trait
// ---------------------------------------------------------------------------

/// One NIC port. TX queues are owned by scheduler threads, RX queues by
/// receiver threads; the implementations must tolerate concurrent calls
/// on distinct queues.
pub trait NicPort: Send + Sync {
    fn mac(&self) -> [u8; 6];
    fn link_speed(&self) -> LinkSpeed;

    /// Driver family name; flow-rule programming keys quirks off it.
    fn driver_name(&self) -> &'static str {
        "unknown"
    }

    /// Hand a burst to the driver. Returns how many packets were
    /// accepted; the caller retries the rest.
    fn tx_burst(&self, queue: u16, pkts: &mut VecDeque<WirePacket>) -> usize;

    /// Poll up to `max` frames from an RX queue.
    fn rx_burst(&self, queue: u16, out: &mut Vec<RxPacket>, max: usize) -> usize;

    /// Hardware clock, when the port has timesync. All default to "no
    /// hardware support"; the PTP engine falls back to software capture.
    fn timesync_time(&self) -> Option<u64> {
        None
    }
    fn timesync_adjust(&self, _delta_ns: i64) {}
    fn timesync_rx_timestamp(&self) -> Option<u64> {
        None
    }
    fn timesync_tx_timestamp(&self) -> Option<u64> {
        None
    }

    /// Whether IP/UDP checksums can be left to the hardware.
    fn hw_checksum_offload(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Loopback port
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LoopbackQueues {
    tx: Vec<Mutex<VecDeque<(Vec<u8>, u64)>>>,
    rx: Vec<Mutex<VecDeque<RxPacket>>>,
}

/// In-memory port: TX frames are captured per queue for inspection,
/// RX frames are whatever the test injected. Carries an adjustable
/// "hardware" clock so PTP tests can run against it.
pub struct LoopbackPort {
    mac: [u8; 6],
    speed: LinkSpeed,
    queues: LoopbackQueues,
    origin: Instant,
    clock_adj: AtomicI64,
    tx_l1_bytes: AtomicU64,
    /// Cap on packets accepted per tx_burst call (tests exercise the
    /// retry loop by lowering it). usize::MAX = accept everything.
    pub accept_per_burst: usize,
}

impl LoopbackPort {
    pub fn new(mac: [u8; 6], speed: LinkSpeed, tx_queues: usize, rx_queues: usize) -> LoopbackPort {
        LoopbackPort {
            mac,
            speed,
            queues: LoopbackQueues {
                tx: (0..tx_queues).map(|_| Mutex::new(VecDeque::new())).collect(),
                rx: (0..rx_queues).map(|_| Mutex::new(VecDeque::new())).collect(),
            },
            origin: Instant::now(),
            clock_adj: AtomicI64::new(0),
            tx_l1_bytes: AtomicU64::new(0),
            accept_per_burst: usize::MAX,
        }
    }

    /// Inject a frame into an RX queue.
    pub fn inject(&self, queue: u16, data: Vec<u8>, timestamp: u64) {
        self.queues.rx[queue as usize]
            .lock()
            .unwrap()
            .push_back(RxPacket { data, timestamp });
    }

    /// Drain everything transmitted on a queue: (frame, tx_time) pairs.
    pub fn drain_tx(&self, queue: u16) -> Vec<(Vec<u8>, u64)> {
        self.queues.tx[queue as usize].lock().unwrap().drain(..).collect()
    }

    /// Cumulative L1 bytes accepted across all TX queues.
    pub fn tx_l1_bytes(&self) -> u64 {
        self.tx_l1_bytes.load(Ordering::Relaxed)
    }
}

impl NicPort for LoopbackPort {
    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    fn link_speed(&self) -> LinkSpeed {
        self.speed
    }

    fn tx_burst(&self, queue: u16, pkts: &mut VecDeque<WirePacket>) -> usize {
        let mut q = self.queues.tx[queue as usize].lock().unwrap();
        let take = pkts.len().min(self.accept_per_burst);
        for _ in 0..take {
            let pkt = pkts.pop_front().unwrap();
            self.tx_l1_bytes
                .fetch_add(pkt.l1_len() as u64, Ordering::Relaxed);
            q.push_back((pkt.to_frame(), pkt.tx_time()));
        }
        take
    }

    fn rx_burst(&self, queue: u16, out: &mut Vec<RxPacket>, max: usize) -> usize {
        let mut q = self.queues.rx[queue as usize].lock().unwrap();
        let mut n = 0;
        while n < max {
            match q.pop_front() {
                Some(p) => {
                    out.push(p);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn timesync_time(&self) -> Option<u64> {
        let base = self.origin.elapsed().as_nanos() as i64;
        Some((base + self.clock_adj.load(Ordering::Relaxed)) as u64)
    }

    fn timesync_adjust(&self, delta_ns: i64) {
        self.clock_adj.fetch_add(delta_ns, Ordering::Relaxed);
    }

    fn timesync_rx_timestamp(&self) -> Option<u64> {
        self.timesync_time()
    }

    fn timesync_tx_timestamp(&self) -> Option<u64> {
        self.timesync_time()
    }

    fn hw_checksum_offload(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Host-UDP fallback port
// ---------------------------------------------------------------------------

/// Port over the host kernel's UDP stack. Media frames are unwrapped to
/// their datagram payload and sent through a socket; received datagrams
/// are re-framed so the RX path sees the L2 layout it expects.
pub struct UdpFallbackPort {
    mac: [u8; 6],
    speed: LinkSpeed,
    socket: UdpSocket,
    local: SocketAddrV4,
}

impl UdpFallbackPort {
    pub fn bind(local: SocketAddrV4, speed: LinkSpeed) -> std::io::Result<UdpFallbackPort> {
        use socket2::{Domain, Protocol, Socket, Type};

        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.set_recv_buffer_size(4 << 20)?;
        sock.bind(&std::net::SocketAddr::V4(local).into())?;
        let socket: UdpSocket = sock.into();

        // a locally administered MAC derived from the bind address
        let o = local.ip().octets();
        let mac = [0x02, o[0], o[1], o[2], o[3], (local.port() & 0xff) as u8];

        Ok(UdpFallbackPort {
            mac,
            speed,
            socket,
            local,
        })
    }

    pub fn join_multicast(&self, group: Ipv4Addr) -> std::io::Result<()> {
        self.socket.join_multicast_v4(&group, self.local.ip())
    }
}

impl NicPort for UdpFallbackPort {
    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    fn link_speed(&self) -> LinkSpeed {
        self.speed
    }

    fn tx_burst(&self, _queue: u16, pkts: &mut VecDeque<WirePacket>) -> usize {
        let mut sent = 0;
        while let Some(pkt) = pkts.front() {
            match pkt {
                WirePacket::Pause { .. } => {
                    // nothing to pause on a host stack
                    pkts.pop_front();
                    sent += 1;
                    continue;
                }
                WirePacket::Media(_) => {}
            }
            let frame = pkt.to_frame();
            let view = match PacketView::new(&frame) {
                Some(v) => v,
                None => {
                    pkts.pop_front();
                    sent += 1;
                    continue;
                }
            };
            let dst_ip = Ipv4Addr::new(frame[30], frame[31], frame[32], frame[33]);
            let dst = SocketAddrV4::new(dst_ip, view.udp_dst_port());
            match self.socket.send_to(view.rtp(), dst) {
                Ok(_) => {
                    pkts.pop_front();
                    sent += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    pkts.pop_front();
                    sent += 1;
                }
            }
        }
        sent
    }

    fn rx_burst(&self, _queue: u16, out: &mut Vec<RxPacket>, max: usize) -> usize {
        let mut buf = [0u8; 2048];
        let mut n = 0;
        while n < max {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let src = match from {
                        std::net::SocketAddr::V4(v4) => v4,
                        _ => continue,
                    };
                    // re-frame: synthetic L2/IP/UDP around the datagram
                    let pkt_size = (net::RTP_OFFSET + len) as u16;
                    let flow = net::Flow {
                        src_ip: *src.ip(),
                        dst_ip: *self.local.ip(),
                        src_port: src.port(),
                        dst_port: self.local.port(),
                        src_mac: [0; 6],
                        dst_mac: self.mac,
                        dscp: 0,
                        ecn: 0,
                        vlan: None,
                    };
                    let mut frame = vec![0u8; pkt_size as usize];
                    net::render_headers(&mut frame, &flow, pkt_size);
                    frame[net::RTP_OFFSET..].copy_from_slice(&buf[..len]);
                    out.push(RxPacket {
                        data: frame,
                        timestamp: 0, // stamped by the receiver thread
                    });
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_tx_accounting() {
        let port = LoopbackPort::new([2, 0, 0, 0, 0, 1], LinkSpeed::G10, 1, 1);
        let mut burst = VecDeque::new();
        burst.push_back(WirePacket::Media(TxPacket {
            head: vec![0u8; 100],
            ext: None,
            tx_time: 42,
        }));
        let tpl = Arc::new(net::build_pause_template([2, 0, 0, 0, 0, 1]));
        burst.push_back(WirePacket::Pause {
            template: tpl,
            l2_len: 60,
        });
        assert_eq!(port.tx_burst(0, &mut burst), 2);
        assert_eq!(port.tx_l1_bytes(), (100 + 24) + (60 + 24));
        let frames = port.drain_tx(0);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1, 42);
        assert_eq!(frames[1].0.len(), 60);
    }

    #[test]
    fn test_loopback_partial_accept() {
        let mut port = LoopbackPort::new([2, 0, 0, 0, 0, 1], LinkSpeed::G10, 1, 1);
        port.accept_per_burst = 1;
        let mut burst = VecDeque::new();
        for _ in 0..3 {
            burst.push_back(WirePacket::Media(TxPacket {
                head: vec![0u8; 64],
                ext: None,
                tx_time: 0,
            }));
        }
        let mut total = 0;
        while !burst.is_empty() {
            total += port.tx_burst(0, &mut burst);
        }
        assert_eq!(total, 3);
    }

    #[test]
    fn test_loopback_rx_inject() {
        let port = LoopbackPort::new([2, 0, 0, 0, 0, 1], LinkSpeed::G10, 1, 1);
        port.inject(0, vec![1, 2, 3], 7);
        let mut out = Vec::new();
        assert_eq!(port.rx_burst(0, &mut out, 8), 1);
        assert_eq!(out[0].data, vec![1, 2, 3]);
        assert_eq!(out[0].timestamp, 7);
    }

    #[test]
    fn test_payload_ref_zero_copy() {
        let frame = FrameBuf::from_vec((0..100u8).collect());
        let pkt = TxPacket {
            head: vec![0xee; 10],
            ext: Some(PayloadRef {
                frame: frame.clone(),
                offset: 50,
                len: 4,
            }),
            tx_time: 0,
        };
        assert_eq!(pkt.l2_len(), 14);
        assert_eq!(&pkt.to_frame()[10..], &[50, 51, 52, 53]);
        // two references: producer + packet
        assert_eq!(Arc::strong_count(&frame), 2);
    }

    #[test]
    fn test_loopback_clock_adjust() {
        let port = LoopbackPort::new([2, 0, 0, 0, 0, 1], LinkSpeed::G10, 1, 1);
        let t0 = port.timesync_time().unwrap();
        port.timesync_adjust(1_000_000_000);
        let t1 = port.timesync_time().unwrap();
        assert!(t1 >= t0 + 1_000_000_000);
    }
}
