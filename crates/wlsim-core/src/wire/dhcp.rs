// ── DHCP over BOOTP ──
//
// A fixed 236-byte BOOTP header, the magic cookie, then options. Only the
// options a client needs to obtain and describe a lease are decoded;
// everything else is skipped.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use strum::Display;

use super::ether::{UdpPath, udp_frame};
use super::read_u32;
use crate::error::CoreError;
use crate::model::MacAddress;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const BOOTP_LEN: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const OPTIONS_OFFSET: usize = BOOTP_LEN + MAGIC_COOKIE.len();
const CHADDR_OFFSET: usize = 28;
const HTYPE_ETHERNET: u8 = 1;

pub const OP_REQUEST: u8 = 1;
pub const OP_REPLY: u8 = 2;

pub mod option {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DOMAIN_NAME: u8 = 15;
    pub const REQUESTED_ADDR: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const END: u8 = 255;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

/// Decoded options. Encoding writes them in field order, then END.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    pub message_type: Option<MessageType>,
    pub requested_addr: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub lease_time: Option<u32>,
    pub renewal_time: Option<u32>,
    pub rebinding_time: Option<u32>,
    pub domain: Option<String>,
}

impl DhcpOptions {
    fn put(&self, buf: &mut BytesMut) {
        if let Some(ty) = self.message_type {
            buf.put_slice(&[option::MESSAGE_TYPE, 1, ty.code()]);
        }
        let addresses = [
            (option::REQUESTED_ADDR, self.requested_addr),
            (option::SERVER_ID, self.server_id),
            (option::SUBNET_MASK, self.subnet_mask),
            (option::ROUTER, self.router),
        ];
        for (code, addr) in addresses {
            if let Some(addr) = addr {
                buf.put_slice(&[code, 4]);
                buf.put_slice(&addr.octets());
            }
        }
        let times = [
            (option::LEASE_TIME, self.lease_time),
            (option::RENEWAL_TIME, self.renewal_time),
            (option::REBINDING_TIME, self.rebinding_time),
        ];
        for (code, secs) in times {
            if let Some(secs) = secs {
                buf.put_slice(&[code, 4]);
                buf.put_u32(secs);
            }
        }
        if let Some(domain) = &self.domain {
            let raw = &domain.as_bytes()[..domain.len().min(255)];
            buf.put_slice(&[option::DOMAIN_NAME, u8::try_from(raw.len()).unwrap_or(u8::MAX)]);
            buf.put_slice(raw);
        }
        buf.put_u8(option::END);
    }

    fn parse(mut rest: &[u8]) -> Result<Self, CoreError> {
        let mut options = Self::default();
        while let Some((&code, tail)) = rest.split_first() {
            match code {
                option::PAD => {
                    rest = tail;
                    continue;
                }
                option::END => break,
                _ => {}
            }
            let (&len, tail) = tail.split_first().ok_or(CoreError::Truncated {
                what: "DHCP option",
                needed: 2,
                available: 1,
            })?;
            let len = usize::from(len);
            let value = tail.get(..len).ok_or(CoreError::Truncated {
                what: "DHCP option",
                needed: len,
                available: tail.len(),
            })?;
            options.apply(code, value);
            rest = &tail[len..];
        }
        Ok(options)
    }

    /// Values of the wrong width are ignored like unknown options.
    fn apply(&mut self, code: u8, value: &[u8]) {
        let addr = || <[u8; 4]>::try_from(value).ok().map(Ipv4Addr::from);
        let secs = || <[u8; 4]>::try_from(value).ok().map(u32::from_be_bytes);
        match code {
            option::MESSAGE_TYPE => {
                self.message_type = value.first().copied().and_then(MessageType::from_code);
            }
            option::REQUESTED_ADDR => self.requested_addr = addr(),
            option::SERVER_ID => self.server_id = addr(),
            option::SUBNET_MASK => self.subnet_mask = addr(),
            // A router list keeps its first entry.
            option::ROUTER => {
                self.router = value
                    .get(..4)
                    .and_then(|first| <[u8; 4]>::try_from(first).ok())
                    .map(Ipv4Addr::from);
            }
            option::LEASE_TIME => self.lease_time = secs(),
            option::RENEWAL_TIME => self.renewal_time = secs(),
            option::REBINDING_TIME => self.rebinding_time = secs(),
            option::DOMAIN_NAME => self.domain = Some(String::from_utf8_lossy(value).into_owned()),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub xid: u32,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub chaddr: MacAddress,
    pub options: DhcpOptions,
}

impl DhcpMessage {
    fn client(xid: u32, client: MacAddress, options: DhcpOptions) -> Self {
        Self {
            op: OP_REQUEST,
            xid,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: client,
            options,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.message_type
    }

    pub fn is_reply(&self) -> bool {
        self.op == OP_REPLY
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OPTIONS_OFFSET + 64);
        buf.put_slice(&[self.op, HTYPE_ETHERNET, 6, 0]);
        buf.put_u32(self.xid);
        // secs, flags
        buf.put_u32(0);
        buf.put_slice(&self.ciaddr.octets());
        buf.put_slice(&self.yiaddr.octets());
        buf.put_slice(&self.siaddr.octets());
        // giaddr
        buf.put_u32(0);
        buf.put_slice(&self.chaddr.octets());
        // chaddr padding, sname, file
        buf.put_bytes(0, 10 + 64 + 128);
        buf.put_slice(&MAGIC_COOKIE);
        self.options.put(&mut buf);
        buf.freeze()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < OPTIONS_OFFSET {
            return Err(CoreError::Truncated {
                what: "DHCP message",
                needed: OPTIONS_OFFSET,
                available: bytes.len(),
            });
        }
        if bytes[BOOTP_LEN..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return Err(CoreError::Malformed {
                what: "DHCP message",
                reason: "missing magic cookie".into(),
            });
        }
        let addr = |offset: usize| read_u32(bytes, offset).map_or(Ipv4Addr::UNSPECIFIED, Ipv4Addr::from);
        Ok(Self {
            op: bytes[0],
            xid: read_u32(bytes, 4).unwrap_or_default(),
            ciaddr: addr(12),
            yiaddr: addr(16),
            siaddr: addr(20),
            chaddr: MacAddress::from_slice(bytes, CHADDR_OFFSET).unwrap_or(MacAddress::ZERO),
            options: DhcpOptions::parse(&bytes[OPTIONS_OFFSET..])?,
        })
    }
}

/// DHCPDISCOVER from `client`.
pub fn discover(xid: u32, client: MacAddress) -> DhcpMessage {
    DhcpMessage::client(
        xid,
        client,
        DhcpOptions {
            message_type: Some(MessageType::Discover),
            ..DhcpOptions::default()
        },
    )
}

/// DHCPREQUEST selecting `requested` from the server at `server_id`.
pub fn request(xid: u32, client: MacAddress, requested: Ipv4Addr, server_id: Ipv4Addr) -> DhcpMessage {
    DhcpMessage::client(
        xid,
        client,
        DhcpOptions {
            message_type: Some(MessageType::Request),
            requested_addr: Some(requested),
            server_id: Some(server_id),
            ..DhcpOptions::default()
        },
    )
}

/// Server answer to `request`, offering or confirming `yiaddr`.
pub fn reply(request: &DhcpMessage, yiaddr: Ipv4Addr, options: DhcpOptions) -> DhcpMessage {
    DhcpMessage {
        op: OP_REPLY,
        xid: request.xid,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr,
        siaddr: options.server_id.unwrap_or(Ipv4Addr::UNSPECIFIED),
        chaddr: request.chaddr,
        options,
    }
}

/// Broadcast Ethernet frame carrying a client message, as sent before
/// the client has an address.
pub fn client_frame(client: MacAddress, message: &DhcpMessage) -> Bytes {
    let path = UdpPath {
        src_mac: client,
        dst_mac: MacAddress::BROADCAST,
        src_ip: Ipv4Addr::UNSPECIFIED,
        dst_ip: Ipv4Addr::BROADCAST,
        src_port: CLIENT_PORT,
        dst_port: SERVER_PORT,
    };
    udp_frame(&path, &message.to_bytes())
}
