//! Byte-exact frame construction and parsing.
//!
//! [`ether`] covers Ethernet II, IPv4, UDP, ARP and ICMP echo; [`capwap`]
//! the CAPWAP header, control messages and message elements; [`dot11`]
//! the 802.11 frames clients exchange through the AP's data channel;
//! [`dhcp`] the BOOTP messages a client leases its address with.

pub mod capwap;
pub mod dhcp;
pub mod dot11;
pub mod ether;

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let raw: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(raw))
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

/// Length as a 16-bit wire field, saturating.
pub(crate) fn len_u16(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}
