// ── Ethernet / IPv4 / UDP / ARP / ICMP ──
//
// Frames built here carry no VLAN tag and IPv4 headers without options,
// which puts the UDP payload at a fixed offset of 42 bytes.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use super::{len_u16, read_u16};
use crate::model::MacAddress;

pub const ETH_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const UDP_PAYLOAD_OFFSET: usize = ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ARP_BODY_LEN: usize = 28;

pub fn dst_mac(frame: &[u8]) -> Option<MacAddress> {
    MacAddress::from_slice(frame, 0)
}

pub fn src_mac(frame: &[u8]) -> Option<MacAddress> {
    MacAddress::from_slice(frame, 6)
}

pub fn ethertype(frame: &[u8]) -> Option<u16> {
    read_u16(frame, 12)
}

fn read_ipv4(bytes: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(Ipv4Addr::from(raw))
}

/// RFC 1071 ones' complement checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| {
            let hi = pair.first().copied().unwrap_or(0);
            let lo = pair.get(1).copied().unwrap_or(0);
            u32::from(u16::from_be_bytes([hi, lo]))
        })
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !u16::try_from(sum).unwrap_or(u16::MAX)
}

fn put_ethernet(buf: &mut BytesMut, dst: MacAddress, src: MacAddress, ethertype: u16) {
    buf.put_slice(&dst.octets());
    buf.put_slice(&src.octets());
    buf.put_u16(ethertype);
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload_len: usize) -> [u8; 20] {
    let mut header = [0u8; IPV4_HEADER_LEN];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&len_u16(IPV4_HEADER_LEN + payload_len).to_be_bytes());
    header[4..6].copy_from_slice(&1u16.to_be_bytes());
    header[8] = DEFAULT_TTL;
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());
    let sum = checksum(&header);
    header[10..12].copy_from_slice(&sum.to_be_bytes());
    header
}

// ── UDP ─────────────────────────────────────────────────────────────

/// Both ends of a UDP exchange, link layer included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPath {
    pub src_mac: MacAddress,
    pub dst_mac: MacAddress,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl UdpPath {
    /// The same path seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            src_mac: self.dst_mac,
            dst_mac: self.src_mac,
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

/// Ethernet + IPv4 + UDP around `payload`. The UDP checksum is left zero.
pub fn udp_frame(path: &UdpPath, payload: &[u8]) -> Bytes {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(UDP_PAYLOAD_OFFSET + payload.len());
    put_ethernet(&mut buf, path.dst_mac, path.src_mac, ETHERTYPE_IPV4);
    buf.put_slice(&ipv4_header(path.src_ip, path.dst_ip, IPPROTO_UDP, udp_len));
    buf.put_u16(path.src_port);
    buf.put_u16(path.dst_port);
    buf.put_u16(len_u16(udp_len));
    buf.put_u16(0);
    buf.put_slice(payload);
    buf.freeze()
}

/// A received UDP datagram borrowed from its frame.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub path: UdpPath,
    pub payload: &'a [u8],
}

pub fn parse_udp(frame: &[u8]) -> Option<UdpDatagram<'_>> {
    if ethertype(frame)? != ETHERTYPE_IPV4 {
        return None;
    }
    let packet = parse_ipv4_udp(frame.get(ETH_HEADER_LEN..)?)?;
    Some(UdpDatagram {
        path: UdpPath {
            src_mac: src_mac(frame)?,
            dst_mac: dst_mac(frame)?,
            src_ip: packet.src_ip,
            dst_ip: packet.dst_ip,
            src_port: packet.src_port,
            dst_port: packet.dst_port,
        },
        payload: packet.payload,
    })
}

/// A UDP datagram inside a bare IPv4 packet, as carried by 802.11 data
/// frames after LLC/SNAP.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Udp<'a> {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

pub fn parse_ipv4_udp(ip: &[u8]) -> Option<Ipv4Udp<'_>> {
    let ihl = usize::from(ip.first()? & 0x0f) * 4;
    if ihl < IPV4_HEADER_LEN || *ip.get(9)? != IPPROTO_UDP {
        return None;
    }
    let udp = ip.get(ihl..)?;
    let udp_len = usize::from(read_u16(udp, 4)?);
    if udp_len < UDP_HEADER_LEN {
        return None;
    }
    Some(Ipv4Udp {
        src_ip: read_ipv4(ip, 12)?,
        dst_ip: read_ipv4(ip, 16)?,
        src_port: read_u16(udp, 0)?,
        dst_port: read_u16(udp, 2)?,
        payload: udp.get(UDP_HEADER_LEN..udp_len)?,
    })
}

// ── ARP ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn who_has(src_mac: MacAddress, src_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            op: ArpOp::Request,
            sender_mac: src_mac,
            sender_ip: src_ip,
            target_mac: MacAddress::BROADCAST,
            target_ip,
        }
    }

    /// Gratuitous ARP announcing `ip` at `mac`.
    pub fn gratuitous(mac: MacAddress, ip: Ipv4Addr) -> Self {
        Self::who_has(mac, ip, ip)
    }

    pub fn is_at(
        src_mac: MacAddress,
        src_ip: Ipv4Addr,
        dst_mac: MacAddress,
        dst_ip: Ipv4Addr,
    ) -> Self {
        Self {
            op: ArpOp::Reply,
            sender_mac: src_mac,
            sender_ip: src_ip,
            target_mac: dst_mac,
            target_ip: dst_ip,
        }
    }

    /// The reply this request asks for, answered by `mac`.
    pub fn answer(&self, mac: MacAddress) -> Self {
        Self::is_at(mac, self.target_ip, self.sender_mac, self.sender_ip)
    }

    /// The 28-byte ARP body (no Ethernet header).
    pub fn body(&self) -> [u8; ARP_BODY_LEN] {
        let op: u16 = match self.op {
            ArpOp::Request => 1,
            ArpOp::Reply => 2,
        };
        let mut body = [0u8; ARP_BODY_LEN];
        body[0..8].copy_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x00]);
        body[6..8].copy_from_slice(&op.to_be_bytes());
        body[8..14].copy_from_slice(&self.sender_mac.octets());
        body[14..18].copy_from_slice(&self.sender_ip.octets());
        body[18..24].copy_from_slice(&self.target_mac.octets());
        body[24..28].copy_from_slice(&self.target_ip.octets());
        body
    }

    pub fn to_frame(&self) -> Bytes {
        let dst = match self.op {
            ArpOp::Request => MacAddress::BROADCAST,
            ArpOp::Reply => self.target_mac,
        };
        let mut buf = BytesMut::with_capacity(ETH_HEADER_LEN + ARP_BODY_LEN);
        put_ethernet(&mut buf, dst, self.sender_mac, ETHERTYPE_ARP);
        buf.put_slice(&self.body());
        buf.freeze()
    }

    pub fn parse_body(body: &[u8]) -> Option<Self> {
        let op = match read_u16(body, 6)? {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            _ => return None,
        };
        Some(Self {
            op,
            sender_mac: MacAddress::from_slice(body, 8)?,
            sender_ip: read_ipv4(body, 14)?,
            target_mac: MacAddress::from_slice(body, 18)?,
            target_ip: read_ipv4(body, 24)?,
        })
    }

    pub fn parse(frame: &[u8]) -> Option<Self> {
        if ethertype(frame)? != ETHERTYPE_ARP {
            return None;
        }
        Self::parse_body(frame.get(ETH_HEADER_LEN..)?)
    }
}

// ── ICMP ────────────────────────────────────────────────────────────

/// Destination of an ICMP echo request, if `frame` is one.
pub fn icmp_echo_target(frame: &[u8]) -> Option<Ipv4Addr> {
    let (ip, icmp) = icmp_parts(frame)?;
    if icmp.first() != Some(&ICMP_ECHO_REQUEST) {
        return None;
    }
    read_ipv4(ip, 16)
}

/// Echo reply to an ICMP echo request frame, addresses swapped.
pub fn icmp_echo_reply(request: &[u8]) -> Option<Bytes> {
    let (ip, icmp) = icmp_parts(request)?;
    if icmp.len() < 8 || icmp.first() != Some(&ICMP_ECHO_REQUEST) {
        return None;
    }
    let mut reply = icmp.to_vec();
    reply[0] = ICMP_ECHO_REPLY;
    reply[2..4].copy_from_slice(&[0, 0]);
    let sum = checksum(&reply);
    reply[2..4].copy_from_slice(&sum.to_be_bytes());

    let mut buf = BytesMut::with_capacity(ETH_HEADER_LEN + IPV4_HEADER_LEN + reply.len());
    put_ethernet(&mut buf, src_mac(request)?, dst_mac(request)?, ETHERTYPE_IPV4);
    buf.put_slice(&ipv4_header(
        read_ipv4(ip, 16)?,
        read_ipv4(ip, 12)?,
        IPPROTO_ICMP,
        reply.len(),
    ));
    buf.put_slice(&reply);
    Some(buf.freeze())
}

fn icmp_parts(frame: &[u8]) -> Option<(&[u8], &[u8])> {
    if ethertype(frame)? != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = frame.get(ETH_HEADER_LEN..)?;
    if *ip.get(9)? != IPPROTO_ICMP {
        return None;
    }
    let ihl = usize::from(ip.first()? & 0x0f) * 4;
    let total = usize::from(read_u16(ip, 2)?);
    Some((ip, ip.get(ihl..total)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ap_mac() -> MacAddress {
        MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
    }

    fn path() -> UdpPath {
        UdpPath {
            src_mac: ap_mac(),
            dst_mac: MacAddress::BROADCAST,
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_ip: Ipv4Addr::BROADCAST,
            src_port: 10001,
            dst_port: 5246,
        }
    }

    #[test]
    fn udp_frame_layout() {
        let frame = udp_frame(&path(), &[0xde, 0xad]);
        assert_eq!(frame.len(), UDP_PAYLOAD_OFFSET + 2);
        assert_eq!(&frame[..6], &[0xff; 6]);
        assert_eq!(&frame[6..12], &ap_mac().octets());
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        // version/IHL, total length, id, TTL, protocol
        assert_eq!(frame[14], 0x45);
        assert_eq!(&frame[16..18], &[0x00, 30]);
        assert_eq!(&frame[18..20], &[0x00, 0x01]);
        assert_eq!(frame[22], 64);
        assert_eq!(frame[23], 17);
        // ports, UDP length, zero checksum
        assert_eq!(&frame[34..42], &[0x27, 0x11, 0x14, 0x7e, 0x00, 10, 0x00, 0x00]);
        assert_eq!(&frame[42..], &[0xde, 0xad]);
    }

    #[test]
    fn ipv4_header_checksum_verifies() {
        let frame = udp_frame(&path(), b"payload");
        assert_eq!(checksum(&frame[14..34]), 0);
    }

    #[test]
    fn bare_ipv4_packet_parses_without_ethernet() {
        let frame = udp_frame(&path(), b"lease");
        let packet = parse_ipv4_udp(&frame[ETH_HEADER_LEN..]).unwrap();
        assert_eq!(packet.src_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(packet.dst_port, 5246);
        assert_eq!(packet.payload, b"lease");
        assert!(parse_ipv4_udp(&frame[..ETH_HEADER_LEN + 4]).is_none());
    }

    #[test]
    fn checksum_known_vector() {
        // RFC 1071 example words.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn udp_parse_recovers_path() {
        let frame = udp_frame(&path(), &[1, 2, 3]);
        let datagram = parse_udp(&frame).unwrap();
        assert_eq!(datagram.path, path());
        assert_eq!(datagram.payload, &[1, 2, 3]);
    }

    #[test]
    fn who_has_golden_bytes() {
        let arp = ArpPacket::who_has(ap_mac(), Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1));
        let frame = arp.to_frame();
        let expected: Vec<u8> = [
            &[0xff; 6][..],
            &ap_mac().octets(),
            &[0x08, 0x06],
            &[0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01],
            &ap_mac().octets(),
            &[10, 0, 0, 2],
            &[0xff; 6],
            &[10, 0, 0, 1],
        ]
        .concat();
        assert_eq!(frame.to_vec(), expected);
        assert_eq!(ArpPacket::parse(&frame), Some(arp));
    }

    #[test]
    fn answer_swaps_roles() {
        let wlc = MacAddress::new([0xaa; 6]);
        let request = ArpPacket::who_has(ap_mac(), Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1));
        let reply = request.answer(wlc);
        assert_eq!(reply.op, ArpOp::Reply);
        assert_eq!(reply.sender_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(reply.target_mac, ap_mac());
        assert_eq!(&reply.to_frame()[..6], &ap_mac().octets());
    }

    #[test]
    fn icmp_echo_is_answered() {
        let peer = MacAddress::new([0xaa; 6]);
        let icmp = [ICMP_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0x00, 0x01, b'h', b'i'];
        let mut buf = BytesMut::new();
        put_ethernet(&mut buf, ap_mac(), peer, ETHERTYPE_IPV4);
        buf.put_slice(&ipv4_header(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            IPPROTO_ICMP,
            icmp.len(),
        ));
        buf.put_slice(&icmp);
        let request = buf.freeze();

        assert_eq!(icmp_echo_target(&request), Some(Ipv4Addr::new(10, 0, 0, 2)));
        let reply = icmp_echo_reply(&request).unwrap();
        assert_eq!(dst_mac(&reply), Some(peer));
        assert_eq!(reply[34], ICMP_ECHO_REPLY);
        assert_eq!(checksum(&reply[34..]), 0);
        assert_eq!(&reply[26..30], &[10, 0, 0, 2]);
    }
}
