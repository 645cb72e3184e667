// ── CAPWAP framing (RFC 5415 / RFC 5416) ──
//
// Header, control messages, message elements and the data-channel frames
// an emulated WTP sends. Only the subset a WTP needs is modelled.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use strum::Display;

use super::{len_u16, read_u16, read_u32};
use crate::config::ApIdentity;
use crate::error::CoreError;
use crate::model::{EncryptPolicy, MacAddress, Vap};

pub const CONTROL_PORT: u16 = 5246;
pub const DATA_PORT: u16 = 5247;

pub const PREAMBLE_PLAIN: u8 = 0x00;
pub const PREAMBLE_DTLS: u8 = 0x01;
/// Prefix of every DTLS record carried on a CAPWAP port.
pub const DTLS_HEADER: [u8; 4] = [PREAMBLE_DTLS, 0, 0, 0];
/// First byte of a DTLS alert record.
pub const DTLS_ALERT: u8 = 0x15;

const WBID_IEEE80211: u8 = 1;
const HEADER_LEN: usize = 8;
const CONTROL_HEADER_LEN: usize = 8;

const FLAG_T: u8 = 0x01;
const FLAG_F: u8 = 0x80;
const FLAG_L: u8 = 0x40;
const FLAG_W: u8 = 0x20;
const FLAG_K: u8 = 0x08;

/// Length byte, RSSI -40 dBm, SNR 31 dB, data rate 0, padding.
const WIRELESS_INFO: [u8; 8] = [4, 0xd8, 0x1f, 0x00, 0x00, 0x00, 0x00, 0x00];

const CISCO_VENDOR_ID: [u8; 4] = [0x00, 0x00, 0x00, 0x09];

/// Radio slots every emulated AP exposes.
pub const RADIO_IDS: [u8; 2] = [0, 1];

/// Message element type codes.
pub mod element {
    pub const AC_NAME: u16 = 4;
    pub const DISCOVERY_TYPE: u16 = 20;
    pub const LOCATION_DATA: u16 = 28;
    pub const LOCAL_IPV4_ADDRESS: u16 = 30;
    pub const RADIO_ADMIN_STATE: u16 = 31;
    pub const RADIO_OPER_STATE: u16 = 32;
    pub const RESULT_CODE: u16 = 33;
    pub const SESSION_ID: u16 = 35;
    pub const STATISTICS_TIMER: u16 = 36;
    pub const WTP_BOARD_DATA: u16 = 38;
    pub const WTP_DESCRIPTOR: u16 = 39;
    pub const WTP_FRAME_TUNNEL_MODE: u16 = 41;
    pub const WTP_MAC_TYPE: u16 = 44;
    pub const WTP_NAME: u16 = 45;
    pub const WTP_REBOOT_STATISTICS: u16 = 48;
    pub const ECN_SUPPORT: u16 = 53;
    pub const IEEE80211_ADD_WLAN: u16 = 1024;
    pub const IEEE80211_DELETE_WLAN: u16 = 1027;
    pub const IEEE80211_WTP_RADIO_INFO: u16 = 1048;
}

/// Control message types this emulator sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum MessageType {
    DiscoveryRequest,
    DiscoveryResponse,
    JoinRequest,
    JoinResponse,
    ConfigStatusRequest,
    ConfigStatusResponse,
    ConfigUpdateRequest,
    ConfigUpdateResponse,
    ChangeStateRequest,
    ChangeStateResponse,
    EchoRequest,
    EchoResponse,
    ResetRequest,
    ResetResponse,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            Self::DiscoveryRequest => 1,
            Self::DiscoveryResponse => 2,
            Self::JoinRequest => 3,
            Self::JoinResponse => 4,
            Self::ConfigStatusRequest => 5,
            Self::ConfigStatusResponse => 6,
            Self::ConfigUpdateRequest => 7,
            Self::ConfigUpdateResponse => 8,
            Self::ChangeStateRequest => 11,
            Self::ChangeStateResponse => 12,
            Self::EchoRequest => 13,
            Self::EchoResponse => 14,
            Self::ResetRequest => 17,
            Self::ResetResponse => 18,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::DiscoveryRequest,
            2 => Self::DiscoveryResponse,
            3 => Self::JoinRequest,
            4 => Self::JoinResponse,
            5 => Self::ConfigStatusRequest,
            6 => Self::ConfigStatusResponse,
            7 => Self::ConfigUpdateRequest,
            8 => Self::ConfigUpdateResponse,
            11 => Self::ChangeStateRequest,
            12 => Self::ChangeStateResponse,
            13 => Self::EchoRequest,
            14 => Self::EchoResponse,
            17 => Self::ResetRequest,
            18 => Self::ResetResponse,
            _ => return None,
        })
    }
}

// ── Header ──────────────────────────────────────────────────────────

fn header(words: u8, radio_id: u8, native: bool, flags: u8) -> [u8; HEADER_LEN] {
    [
        PREAMBLE_PLAIN,
        (words << 3) | (radio_id >> 2),
        ((radio_id & 0x03) << 6) | (WBID_IEEE80211 << 1) | u8::from(native),
        flags,
        0,
        0,
        0,
        0,
    ]
}

/// Decoded fixed CAPWAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapwapHeader {
    /// Header length in bytes, options included.
    pub len: usize,
    pub radio_id: u8,
    /// T flag: payload is a native 802.11 frame.
    pub native: bool,
    pub fragment: bool,
    pub last_fragment: bool,
    pub keep_alive: bool,
    pub fragment_id: u16,
    /// Offset of this fragment's payload in bytes.
    pub fragment_offset: usize,
}

impl CapwapHeader {
    pub fn parse(capwap: &[u8]) -> Result<Self, CoreError> {
        let fixed: [u8; HEADER_LEN] = capwap
            .get(..HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(CoreError::Truncated {
                what: "CAPWAP header",
                needed: HEADER_LEN,
                available: capwap.len(),
            })?;
        let len = usize::from((fixed[1] & 0xf8) >> 1);
        if len < HEADER_LEN {
            return Err(CoreError::Malformed {
                what: "CAPWAP header",
                reason: format!("HLEN {len} below minimum"),
            });
        }
        if len > capwap.len() {
            return Err(CoreError::Truncated {
                what: "CAPWAP header",
                needed: len,
                available: capwap.len(),
            });
        }
        Ok(Self {
            len,
            radio_id: ((fixed[1] & 0x07) << 2) | (fixed[2] >> 6),
            native: fixed[2] & FLAG_T != 0,
            fragment: fixed[3] & FLAG_F != 0,
            last_fragment: fixed[3] & FLAG_L != 0,
            keep_alive: fixed[3] & FLAG_K != 0,
            fragment_id: u16::from_be_bytes([fixed[4], fixed[5]]),
            fragment_offset: usize::from(u16::from_be_bytes([fixed[6], fixed[7]]) >> 3) * 8,
        })
    }
}

/// Control message type byte, read without a full parse.
pub fn peek_message_type(capwap: &[u8]) -> Option<MessageType> {
    let header = CapwapHeader::parse(capwap).ok()?;
    MessageType::from_code(read_u32(capwap, header.len)?)
}

// ── Message elements ────────────────────────────────────────────────

/// Builder for a run of type-length-value message elements.
#[derive(Debug, Default)]
pub struct ElementWriter {
    buf: BytesMut,
}

impl ElementWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, ty: u16, value: &[u8]) -> Self {
        self.buf.put_u16(ty);
        self.buf.put_u16(len_u16(value.len()));
        self.buf.put_slice(value);
        self
    }

    pub fn result_code(self, code: u32) -> Self {
        self.put(element::RESULT_CODE, &code.to_be_bytes())
    }

    pub fn ac_name(self, name: &str) -> Self {
        self.put(element::AC_NAME, name.as_bytes())
    }

    /// IEEE 802.11 Add WLAN with no key and open authentication
    /// unless `vap` says otherwise.
    pub fn add_wlan(self, vap: &Vap) -> Self {
        let mut value = vec![vap.slot_id, vap.vap_id, 0x00, 0x01, 0, 0];
        let key: &[u8] = match vap.encrypt_policy {
            EncryptPolicy::Open => &[],
            EncryptPolicy::Protected => &[0u8; 16],
        };
        value.extend_from_slice(&len_u16(key.len()).to_be_bytes());
        value.extend_from_slice(key);
        value.extend_from_slice(&[0u8; 6]);
        let auth_type = u8::from(vap.encrypt_policy == EncryptPolicy::Protected);
        value.extend_from_slice(&[0, auth_type, 0, 0, 0]);
        value.extend_from_slice(vap.ssid.as_bytes());
        self.put(element::IEEE80211_ADD_WLAN, &value)
    }

    pub fn delete_wlan(self, slot_id: u8, vap_id: u8) -> Self {
        self.put(element::IEEE80211_DELETE_WLAN, &[slot_id, vap_id])
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub ty: u16,
    pub value: Bytes,
}

/// A change to the VAP table requested by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WlanChange {
    Add(Vap),
    Delete { slot_id: u8, vap_id: u8 },
}

// ── Control messages ────────────────────────────────────────────────

/// Plaintext control message: header, control header, elements.
pub fn control_message(msg: MessageType, seq: u8, elements: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + CONTROL_HEADER_LEN + elements.len());
    buf.put_slice(&header(2, 0, false, 0));
    buf.put_u32(u32::from(msg.code()));
    buf.put_u8(seq);
    // Counts the length field, the flags byte and the elements.
    buf.put_u16(len_u16(elements.len() + 3));
    buf.put_u8(0);
    buf.put_slice(elements);
    buf.freeze()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub msg_type: Option<MessageType>,
    pub seq: u8,
    pub elements: Vec<Element>,
}

impl ControlMessage {
    pub fn parse(capwap: &[u8]) -> Result<Self, CoreError> {
        let header = CapwapHeader::parse(capwap)?;
        let body = &capwap[header.len..];
        let truncated = |needed: usize| CoreError::Truncated {
            what: "CAPWAP control message",
            needed,
            available: body.len(),
        };
        let raw_type = read_u32(body, 0).ok_or_else(|| truncated(CONTROL_HEADER_LEN))?;
        let seq = *body.get(4).ok_or_else(|| truncated(CONTROL_HEADER_LEN))?;
        let declared = usize::from(read_u16(body, 5).ok_or_else(|| truncated(CONTROL_HEADER_LEN))?);
        let elements_len = declared.saturating_sub(3);
        let mut rest = body
            .get(CONTROL_HEADER_LEN..CONTROL_HEADER_LEN + elements_len)
            .ok_or_else(|| truncated(CONTROL_HEADER_LEN + elements_len))?;

        let mut elements = Vec::new();
        while !rest.is_empty() {
            let ty = read_u16(rest, 0).ok_or_else(|| truncated(4))?;
            let len = usize::from(read_u16(rest, 2).ok_or_else(|| truncated(4))?);
            let value = rest.get(4..4 + len).ok_or(CoreError::Truncated {
                what: "CAPWAP message element",
                needed: 4 + len,
                available: rest.len(),
            })?;
            elements.push(Element {
                ty,
                value: Bytes::copy_from_slice(value),
            });
            rest = &rest[4 + len..];
        }

        Ok(Self {
            msg_type: MessageType::from_code(raw_type),
            seq,
            elements,
        })
    }

    pub fn element(&self, ty: u16) -> Option<&Element> {
        self.elements.iter().find(|e| e.ty == ty)
    }

    pub fn result_code(&self) -> Option<u32> {
        read_u32(&self.element(element::RESULT_CODE)?.value, 0)
    }

    pub fn ac_name(&self) -> Option<String> {
        let value = &self.element(element::AC_NAME)?.value;
        Some(String::from_utf8_lossy(value).into_owned())
    }

    pub fn wlan_changes(&self) -> Vec<WlanChange> {
        self.elements
            .iter()
            .filter_map(|e| match e.ty {
                element::IEEE80211_ADD_WLAN => parse_add_wlan(&e.value).map(WlanChange::Add),
                element::IEEE80211_DELETE_WLAN => Some(WlanChange::Delete {
                    slot_id: *e.value.first()?,
                    vap_id: *e.value.get(1)?,
                }),
                _ => None,
            })
            .collect()
    }
}

fn parse_add_wlan(value: &[u8]) -> Option<Vap> {
    let slot_id = *value.first()?;
    let vap_id = *value.get(1)?;
    let key_len = usize::from(read_u16(value, 6)?);
    // Group TSC (6), QoS, auth type, MAC mode, tunnel mode, suppress SSID.
    let after_key = 8 + key_len;
    let auth_type = *value.get(after_key + 7)?;
    let ssid = value.get(after_key + 11..)?;
    let encrypt_policy = if key_len == 0 && auth_type == 0 {
        EncryptPolicy::Open
    } else {
        EncryptPolicy::Protected
    };
    Some(Vap {
        ssid: String::from_utf8_lossy(ssid).into_owned(),
        slot_id,
        vap_id,
        encrypt_policy,
    })
}

// ── WTP requests ────────────────────────────────────────────────────

/// What a WTP says about itself in Discovery and Join.
#[derive(Debug, Clone, Copy)]
pub struct WtpInfo<'a> {
    pub name: &'a str,
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub identity: &'a ApIdentity,
}

impl WtpInfo<'_> {
    fn board_data(&self) -> Vec<u8> {
        let mut value = CISCO_VENDOR_ID.to_vec();
        for (ty, data) in [
            (0u16, self.identity.model.as_bytes()),
            (1, self.identity.serial_number.as_bytes()),
            (2, &[0x00, 0x00][..]),
            (4, &self.mac.octets()[..]),
        ] {
            value.extend_from_slice(&ty.to_be_bytes());
            value.extend_from_slice(&len_u16(data.len()).to_be_bytes());
            value.extend_from_slice(data);
        }
        value
    }

    fn descriptor(&self) -> Vec<u8> {
        // Max radios, radios in use, one encryption sub-element (WBID 1, AES-CCMP capable).
        let mut value = vec![2, 2, 1, WBID_IEEE80211, 0x00, 0x01];
        let version = self.identity.software_version;
        for ty in [0u16, 1, 2] {
            value.extend_from_slice(&CISCO_VENDOR_ID);
            value.extend_from_slice(&ty.to_be_bytes());
            value.extend_from_slice(&4u16.to_be_bytes());
            value.extend_from_slice(&version);
        }
        value
    }

    fn common(&self, elements: ElementWriter) -> ElementWriter {
        let mut elements = elements
            .put(element::WTP_BOARD_DATA, &self.board_data())
            .put(element::WTP_DESCRIPTOR, &self.descriptor())
            .put(element::WTP_FRAME_TUNNEL_MODE, &[0x08])
            .put(element::WTP_MAC_TYPE, &[0x01]);
        for radio_id in RADIO_IDS {
            // 802.11b/g/n on slot 0, 802.11a/n on slot 1.
            let radio_type: u32 = if radio_id == 0 { 0x0d } else { 0x0a };
            let mut info = vec![radio_id];
            info.extend_from_slice(&radio_type.to_be_bytes());
            elements = elements.put(element::IEEE80211_WTP_RADIO_INFO, &info);
        }
        elements
    }
}

pub fn discovery_request(wtp: &WtpInfo<'_>, seq: u8, static_controller: bool) -> Bytes {
    let elements = wtp
        .common(ElementWriter::new().put(element::DISCOVERY_TYPE, &[u8::from(static_controller)]))
        .finish();
    control_message(MessageType::DiscoveryRequest, seq, &elements)
}

pub fn join_request(wtp: &WtpInfo<'_>, seq: u8, session_id: &[u8; 16]) -> Bytes {
    let elements = ElementWriter::new().put(element::LOCATION_DATA, wtp.identity.location.as_bytes());
    let elements = wtp
        .common(elements)
        .put(element::WTP_NAME, wtp.name.as_bytes())
        .put(element::SESSION_ID, session_id)
        .put(element::ECN_SUPPORT, &[0])
        .put(element::LOCAL_IPV4_ADDRESS, &wtp.ip.octets())
        .finish();
    control_message(MessageType::JoinRequest, seq, &elements)
}

pub fn config_status_request(seq: u8, ac_name: &str) -> Bytes {
    let mut elements = ElementWriter::new().ac_name(ac_name);
    for radio_id in RADIO_IDS {
        elements = elements.put(element::RADIO_ADMIN_STATE, &[radio_id, 1]);
    }
    let elements = elements
        .put(element::STATISTICS_TIMER, &120u16.to_be_bytes())
        .put(element::WTP_REBOOT_STATISTICS, &[0u8; 15])
        .finish();
    control_message(MessageType::ConfigStatusRequest, seq, &elements)
}

/// Change State Event reporting `radio_id` operational.
pub fn change_state_request(seq: u8, radio_id: u8) -> Bytes {
    let elements = ElementWriter::new()
        .put(element::RADIO_OPER_STATE, &[radio_id, 2, 0])
        .result_code(0)
        .finish();
    control_message(MessageType::ChangeStateRequest, seq, &elements)
}

pub fn echo_request(seq: u8) -> Bytes {
    control_message(MessageType::EchoRequest, seq, &[])
}

/// Acknowledges a Configuration Update Request, echoing its sequence number.
pub fn config_update_response(seq: u8) -> Bytes {
    let elements = ElementWriter::new().result_code(0).finish();
    control_message(MessageType::ConfigUpdateResponse, seq, &elements)
}

// ── Data channel ────────────────────────────────────────────────────

/// Data-channel keep-alive carrying the session id.
pub fn keep_alive(session_id: &[u8; 16]) -> Bytes {
    let elements = ElementWriter::new().put(element::SESSION_ID, session_id);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 2 + elements.len());
    buf.put_slice(&header(2, 0, false, FLAG_K));
    buf.put_u16(len_u16(elements.len()));
    buf.put_slice(&elements.finish());
    buf.freeze()
}

/// Native 802.11 frame on the data channel, with wireless-specific info.
pub fn data_frame(radio_id: u8, dot11: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + WIRELESS_INFO.len() + dot11.len());
    buf.put_slice(&header(4, radio_id, true, FLAG_W));
    buf.put_slice(&WIRELESS_INFO);
    buf.put_slice(dot11);
    buf.freeze()
}

// ── Fragment reassembly ─────────────────────────────────────────────

/// Rebuilds fragmented control messages, one fragment id at a time.
#[derive(Debug, Default)]
pub struct Reassembler {
    fragment_id: Option<u16>,
    header: Option<Bytes>,
    parts: BTreeMap<usize, Bytes>,
    total: Option<usize>,
}

impl Reassembler {
    /// Feed one CAPWAP packet. Unfragmented packets pass straight through;
    /// fragments are held until the set is complete and contiguous.
    pub fn push(&mut self, capwap: &[u8]) -> Result<Option<Bytes>, CoreError> {
        let header = CapwapHeader::parse(capwap)?;
        if !header.fragment {
            return Ok(Some(Bytes::copy_from_slice(capwap)));
        }
        if self.fragment_id != Some(header.fragment_id) {
            *self = Self {
                fragment_id: Some(header.fragment_id),
                ..Self::default()
            };
        }
        let payload = &capwap[header.len..];
        if header.fragment_offset == 0 {
            let mut first = capwap[..header.len].to_vec();
            first[3] &= !(FLAG_F | FLAG_L);
            first[4..HEADER_LEN].fill(0);
            self.header = Some(Bytes::from(first));
        }
        if header.last_fragment {
            self.total = Some(header.fragment_offset + payload.len());
        }
        self.parts
            .insert(header.fragment_offset, Bytes::copy_from_slice(payload));
        Ok(self.try_complete())
    }

    fn try_complete(&mut self) -> Option<Bytes> {
        let total = self.total?;
        let mut expected = 0;
        for (offset, part) in &self.parts {
            if *offset != expected {
                return None;
            }
            expected += part.len();
        }
        if expected != total {
            return None;
        }
        let header = self.header.take()?;
        let mut whole = BytesMut::with_capacity(header.len() + total);
        whole.put_slice(&header);
        for part in self.parts.values() {
            whole.put_slice(part);
        }
        *self = Self::default();
        Some(whole.freeze())
    }
}
