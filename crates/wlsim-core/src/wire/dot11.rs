// ── IEEE 802.11 frames inside CAPWAP ──
//
// The controller carries the two frame-control bytes swapped, so the
// type/subtype byte comes second. Everything else is on-air layout:
// multi-byte body fields are little-endian.

use super::read_u16;
use crate::model::MacAddress;

pub const ASSOC_REQUEST: [u8; 2] = [0x00, 0x00];
pub const ASSOC_RESPONSE: [u8; 2] = [0x00, 0x10];
pub const DISASSOC: [u8; 2] = [0x00, 0xa0];
pub const DEAUTH: [u8; 2] = [0x00, 0xc0];
const QOS_DATA_TO_DS: [u8; 2] = [0x01, 0x88];

const MGMT_HEADER_LEN: usize = 24;
const QOS_CONTROL_LEN: usize = 2;
const LLC_SNAP: [u8; 6] = [0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00];
const SUPPORTED_RATES: [u8; 8] = [0x82, 0x84, 0x8b, 0x96, 0x0c, 0x12, 0x18, 0x24];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    AssocRequest,
    AssocResponse,
    Disassoc,
    Deauth,
    Data,
    Other,
}

pub fn classify(frame: &[u8]) -> FrameKind {
    let Some(fc) = frame.get(..2) else {
        return FrameKind::Other;
    };
    match [fc[0], fc[1]] {
        ASSOC_REQUEST => FrameKind::AssocRequest,
        ASSOC_RESPONSE => FrameKind::AssocResponse,
        DISASSOC => FrameKind::Disassoc,
        DEAUTH => FrameKind::Deauth,
        [_, type_byte] if type_byte & 0x0c == 0x08 => FrameKind::Data,
        _ => FrameKind::Other,
    }
}

/// Receiver address.
pub fn addr1(frame: &[u8]) -> Option<MacAddress> {
    MacAddress::from_slice(frame, 4)
}

/// Transmitter address.
pub fn addr2(frame: &[u8]) -> Option<MacAddress> {
    MacAddress::from_slice(frame, 10)
}

fn sequence_control(seq: u16) -> [u8; 2] {
    ((seq & 0x0fff) << 4).to_le_bytes()
}

fn management(fc: [u8; 2], da: MacAddress, sa: MacAddress, bssid: MacAddress, seq: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(64);
    frame.extend_from_slice(&fc);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&da.octets());
    frame.extend_from_slice(&sa.octets());
    frame.extend_from_slice(&bssid.octets());
    frame.extend_from_slice(&sequence_control(seq));
    frame
}

/// Association request from `client` for `ssid` on `bssid`.
pub fn association_request(bssid: MacAddress, client: MacAddress, ssid: &str, seq: u16) -> Vec<u8> {
    let mut frame = management(ASSOC_REQUEST, bssid, client, bssid, seq);
    // ESS capability, listen interval 10.
    frame.extend_from_slice(&[0x01, 0x00, 0x0a, 0x00]);
    let ssid = &ssid.as_bytes()[..ssid.len().min(32)];
    frame.push(0);
    frame.push(u8::try_from(ssid.len()).unwrap_or(32));
    frame.extend_from_slice(ssid);
    frame.push(1);
    frame.push(8);
    frame.extend_from_slice(&SUPPORTED_RATES);
    frame
}

/// Association response, as a controller would send it.
pub fn association_response(bssid: MacAddress, client: MacAddress, status: u16, aid: u16, seq: u16) -> Vec<u8> {
    let mut frame = management(ASSOC_RESPONSE, client, bssid, bssid, seq);
    frame.extend_from_slice(&[0x01, 0x00]);
    frame.extend_from_slice(&status.to_le_bytes());
    frame.extend_from_slice(&(aid | 0xc000).to_le_bytes());
    frame.push(1);
    frame.push(8);
    frame.extend_from_slice(&SUPPORTED_RATES);
    frame
}

pub fn disassociation(bssid: MacAddress, client: MacAddress, reason: u16, seq: u16) -> Vec<u8> {
    let mut frame = management(DISASSOC, bssid, client, bssid, seq);
    frame.extend_from_slice(&reason.to_le_bytes());
    frame
}

/// Deauthentication sent by the controller to `client`.
pub fn deauthentication(bssid: MacAddress, client: MacAddress, reason: u16, seq: u16) -> Vec<u8> {
    let mut frame = management(DEAUTH, client, bssid, bssid, seq);
    frame.extend_from_slice(&reason.to_le_bytes());
    frame
}

/// Status code of an association response.
pub fn association_status(frame: &[u8]) -> Option<u16> {
    let raw = read_u16(frame, MGMT_HEADER_LEN + 2)?;
    Some(raw.swap_bytes())
}

/// Converts an Ethernet frame sent by `client` into a to-DS QoS data frame.
pub fn wrap_ethernet(bssid: MacAddress, client: MacAddress, ethernet: &[u8], seq: u16) -> Option<Vec<u8>> {
    let destination = MacAddress::from_slice(ethernet, 0)?;
    let ethertype = ethernet.get(12..14)?;
    let payload = ethernet.get(14..)?;
    let mut frame = Vec::with_capacity(MGMT_HEADER_LEN + QOS_CONTROL_LEN + 8 + payload.len());
    frame.extend_from_slice(&QOS_DATA_TO_DS);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&bssid.octets());
    frame.extend_from_slice(&client.octets());
    frame.extend_from_slice(&destination.octets());
    frame.extend_from_slice(&sequence_control(seq));
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&LLC_SNAP);
    frame.extend_from_slice(ethertype);
    frame.extend_from_slice(payload);
    Some(frame)
}

/// Ethertype and payload of a data frame with LLC/SNAP encapsulation.
pub fn data_payload(frame: &[u8]) -> Option<(u16, &[u8])> {
    if classify(frame) != FrameKind::Data {
        return None;
    }
    // QoS subtypes carry two extra bytes of QoS control.
    let qos = frame.get(1)? & 0x80 != 0;
    let llc = MGMT_HEADER_LEN + if qos { QOS_CONTROL_LEN } else { 0 };
    if frame.get(llc..llc + 6)? != &LLC_SNAP[..] {
        return None;
    }
    let ethertype = read_u16(frame, llc + 6)?;
    Some((ethertype, frame.get(llc + 8..)?))
}
