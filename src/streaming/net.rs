//! Ethernet / IPv4 / UDP framing for media flows.
//!
//! Each session renders its full header stack once at bind time (the
//! "header print") and the TX builder patches the per-packet fields in
//! place. PAUSE frames are synthetic 802.3x frames whose only purpose
//! is to occupy wire time in the TPRS schedule.

use std::net::Ipv4Addr;

/// L2 header length without VLAN.
pub const ETH_HDR_SIZE: usize = 14;
/// IPv4 header length (no options).
pub const IPV4_HDR_SIZE: usize = 20;
/// UDP header length.
pub const UDP_HDR_SIZE: usize = 8;
/// L2 offset of the IPv4 header.
pub const IPV4_OFFSET: usize = ETH_HDR_SIZE;
/// L2 offset of the UDP header.
pub const UDP_OFFSET: usize = ETH_HDR_SIZE + IPV4_HDR_SIZE;
/// L2 offset of the RTP header.
pub const RTP_OFFSET: usize = UDP_OFFSET + UDP_HDR_SIZE;

/// Preamble + SFD + FCS + interpacket gap: bytes a frame occupies on the
/// PHY beyond its L2 length.
pub const PHY_OVERHEAD: usize = 24;
/// Smallest L2 frame.
pub const MIN_PKT_SIZE: usize = 60;
/// Smallest frame measured at L1.
pub const MIN_PKT_L1_SIZE: usize = MIN_PKT_SIZE + PHY_OVERHEAD;
/// Full-size frame measured at L1.
pub const DEFAULT_PKT_L1_SIZE: usize = 1514 + PHY_OVERHEAD;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_PTP: u16 = 0x88f7;
/// 802.3x MAC control (PAUSE).
pub const ETHERTYPE_FLOW_CONTROL: u16 = 0x8808;

pub const IP_PROTO_UDP: u8 = 17;

/// IPv4 don't-fragment flag (host order, shifted into the frag field).
const IP_DONT_FRAGMENT: u16 = 0x4000;

/// DSCP expedited forwarding, used for media flows when enabled.
pub const DSCP_EXPEDITED: u8 = 46;

// ---------------------------------------------------------------------------
// Flow tuple
// ---------------------------------------------------------------------------

/// Addresses of one media flow; redundant (ST 2022-7) sessions carry two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub dscp: u8,
    pub ecn: u8,
    pub vlan: Option<u16>,
}

impl Flow {
    pub fn tos(&self) -> u8 {
        (self.dscp << 2) | (self.ecn & 0x3)
    }
}

/// True when `ip` is in 224.0.0.0/4.
pub fn is_multicast(ip: Ipv4Addr) -> bool {
    ip.octets()[0] >= 224 && ip.octets()[0] <= 239
}

/// Synthesise the IANA multicast MAC: 01:00:5e + low 23 bits of the group.
pub fn multicast_mac(ip: Ipv4Addr) -> [u8; 6] {
    let o = ip.octets();
    [0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]
}

// ---------------------------------------------------------------------------
// Header rendering
// ---------------------------------------------------------------------------

/// Render the Ethernet + IPv4 + UDP stack for a media packet of `pkt_size`
/// L2 bytes into the head of `buf`. The IP identification, checksums and
/// RTP fields are patched per packet.
pub fn render_headers(buf: &mut [u8], flow: &Flow, pkt_size: u16) {
    // Ethernet
    buf[0..6].copy_from_slice(&flow.dst_mac);
    buf[6..12].copy_from_slice(&flow.src_mac);
    buf[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    // IPv4
    let ip = &mut buf[IPV4_OFFSET..IPV4_OFFSET + IPV4_HDR_SIZE];
    ip.fill(0);
    ip[0] = 0x45;
    ip[1] = flow.tos();
    let total_len = pkt_size - ETH_HDR_SIZE as u16;
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip[6..8].copy_from_slice(&IP_DONT_FRAGMENT.to_be_bytes());
    ip[8] = 64; // ttl
    ip[9] = IP_PROTO_UDP;
    ip[12..16].copy_from_slice(&flow.src_ip.octets());
    ip[16..20].copy_from_slice(&flow.dst_ip.octets());

    // UDP
    let udp = &mut buf[UDP_OFFSET..UDP_OFFSET + UDP_HDR_SIZE];
    udp[0..2].copy_from_slice(&flow.src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&flow.dst_port.to_be_bytes());
    let dgram_len = pkt_size - (ETH_HDR_SIZE + IPV4_HDR_SIZE) as u16;
    udp[4..6].copy_from_slice(&dgram_len.to_be_bytes());
    udp[6..8].copy_from_slice(&[0, 0]);
}

/// Patch the IPv4 identification field and recompute the header checksum.
pub fn patch_ip_id(buf: &mut [u8], id: u16) {
    buf[IPV4_OFFSET + 4..IPV4_OFFSET + 6].copy_from_slice(&id.to_be_bytes());
    buf[IPV4_OFFSET + 10] = 0;
    buf[IPV4_OFFSET + 11] = 0;
    let cksum = internet_checksum(&buf[IPV4_OFFSET..IPV4_OFFSET + IPV4_HDR_SIZE]);
    buf[IPV4_OFFSET + 10..IPV4_OFFSET + 12].copy_from_slice(&cksum.to_be_bytes());
}

/// RFC 1071 ones-complement sum over `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data, 0)
}

fn ones_complement_sum(data: &[u8], init: u32) -> u16 {
    let mut sum = init;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// UDP checksum over the pseudo header + datagram. `l2` is the whole
/// frame; `payload_tail` is the externally attached payload (empty when
/// the datagram is fully inline). Returns 0xffff in place of 0 per
/// RFC 768. Used only when the port lacks hardware checksum offload.
pub fn udp_checksum(l2: &[u8], payload_tail: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&l2[IPV4_OFFSET + 12..IPV4_OFFSET + 16]);
    pseudo[4..8].copy_from_slice(&l2[IPV4_OFFSET + 16..IPV4_OFFSET + 20]);
    pseudo[9] = IP_PROTO_UDP;
    let udp_len = (l2.len() - UDP_OFFSET + payload_tail.len()) as u16;
    pseudo[10..12].copy_from_slice(&udp_len.to_be_bytes());

    let mut sum = ones_complement_sum(&pseudo, 0) as u32;
    sum += ones_complement_sum(&l2[UDP_OFFSET..], 0) as u32;
    // The inline part is always even (headers), so the tail folds cleanly.
    sum += ones_complement_sum(payload_tail, 0) as u32;
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    let cksum = !(sum as u16);
    if cksum == 0 {
        0xffff
    } else {
        cksum
    }
}

// ---------------------------------------------------------------------------
// PAUSE frames
// ---------------------------------------------------------------------------

/// Build the 802.3x PAUSE template: 1514 zero-filled bytes with the MAC
/// control ethertype and the 01:80:C2:00:00:01 destination. The scheduler
/// truncates it to the gap size it needs to fill.
pub fn build_pause_template(src_mac: [u8; 6]) -> Vec<u8> {
    let mut pkt = vec![0u8; 1514];
    pkt[0..6].copy_from_slice(&[0x01, 0x80, 0xc2, 0x00, 0x00, 0x01]);
    pkt[6..12].copy_from_slice(&src_mac);
    pkt[12..14].copy_from_slice(&ETHERTYPE_FLOW_CONTROL.to_be_bytes());
    pkt
}

// ---------------------------------------------------------------------------
// Parsing helpers for the RX path
// ---------------------------------------------------------------------------

/// Quick L2..L4 view over a received frame. Offsets are fixed: media
/// flows are untagged IPv4/UDP (VLAN is stripped by the port).
pub struct PacketView<'a> {
    pub data: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn new(data: &'a [u8]) -> Option<PacketView<'a>> {
        if data.len() < RTP_OFFSET {
            return None;
        }
        Some(PacketView { data })
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.data[12], self.data[13]])
    }

    pub fn ip_proto(&self) -> u8 {
        self.data[IPV4_OFFSET + 9]
    }

    pub fn ip_total_length(&self) -> u16 {
        u16::from_be_bytes([self.data[IPV4_OFFSET + 2], self.data[IPV4_OFFSET + 3]])
    }

    pub fn udp_dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[UDP_OFFSET + 2], self.data[UDP_OFFSET + 3]])
    }

    pub fn udp_src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[UDP_OFFSET], self.data[UDP_OFFSET + 1]])
    }

    pub fn udp_len(&self) -> u16 {
        u16::from_be_bytes([self.data[UDP_OFFSET + 4], self.data[UDP_OFFSET + 5]])
    }

    pub fn rtp(&self) -> &'a [u8] {
        &self.data[RTP_OFFSET..]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_flow() -> Flow {
        Flow {
            src_ip: Ipv4Addr::new(192, 168, 0, 1),
            dst_ip: Ipv4Addr::new(192, 168, 0, 2),
            src_port: 10000,
            dst_port: 10000,
            src_mac: [2, 0, 0, 0, 0, 1],
            dst_mac: [2, 0, 0, 0, 0, 2],
            dscp: 0,
            ecn: 0,
            vlan: None,
        }
    }

    #[test]
    fn test_render_headers_lengths() {
        let mut buf = vec![0u8; 1262];
        render_headers(&mut buf, &test_flow(), 1262);
        let view = PacketView::new(&buf).unwrap();
        assert_eq!(view.ethertype(), ETHERTYPE_IPV4);
        assert_eq!(view.ip_proto(), IP_PROTO_UDP);
        assert_eq!(view.ip_total_length(), 1262 - 14);
        assert_eq!(view.udp_len(), 1262 - 14 - 20);
        assert_eq!(view.udp_dst_port(), 10000);
    }

    #[test]
    fn test_ip_checksum_valid_after_patch() {
        let mut buf = vec![0u8; 100];
        render_headers(&mut buf, &test_flow(), 100);
        patch_ip_id(&mut buf, 0x1234);
        // a valid IPv4 header sums to zero
        assert_eq!(
            ones_complement_sum(&buf[IPV4_OFFSET..IPV4_OFFSET + IPV4_HDR_SIZE], 0),
            0xffff
        );
    }

    #[test]
    fn test_multicast_detection_and_mac() {
        assert!(is_multicast(Ipv4Addr::new(239, 1, 2, 3)));
        assert!(!is_multicast(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(
            multicast_mac(Ipv4Addr::new(239, 129, 2, 3)),
            [0x01, 0x00, 0x5e, 0x01, 2, 3]
        );
    }

    #[test]
    fn test_pause_template() {
        let pause = build_pause_template([2, 0, 0, 0, 0, 1]);
        assert_eq!(pause.len(), 1514);
        assert_eq!(&pause[0..6], &[0x01, 0x80, 0xc2, 0x00, 0x00, 0x01]);
        assert_eq!(
            u16::from_be_bytes([pause[12], pause[13]]),
            ETHERTYPE_FLOW_CONTROL
        );
    }

    #[test]
    fn test_udp_checksum_verifies() {
        let mut buf = vec![0u8; 120];
        render_headers(&mut buf, &test_flow(), 120);
        let payload = [0xa5u8; 16];
        let cksum = udp_checksum(&buf, &payload);
        buf[UDP_OFFSET + 6..UDP_OFFSET + 8].copy_from_slice(&cksum.to_be_bytes());

        // Receiver-side verification: pseudo header + datagram sums to 0xffff.
        let mut pseudo = [0u8; 12];
        pseudo[0..4].copy_from_slice(&buf[IPV4_OFFSET + 12..IPV4_OFFSET + 16]);
        pseudo[4..8].copy_from_slice(&buf[IPV4_OFFSET + 16..IPV4_OFFSET + 20]);
        pseudo[9] = IP_PROTO_UDP;
        let udp_len = (buf.len() - UDP_OFFSET + payload.len()) as u16;
        pseudo[10..12].copy_from_slice(&udp_len.to_be_bytes());
        let mut all = pseudo.to_vec();
        all.extend_from_slice(&buf[UDP_OFFSET..]);
        all.extend_from_slice(&payload);
        assert_eq!(ones_complement_sum(&all, 0), 0xffff);
    }
}
