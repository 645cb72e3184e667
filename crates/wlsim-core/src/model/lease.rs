// ── DHCP lease ──

use std::net::Ipv4Addr;

use serde::Serialize;

/// Address a client obtained over DHCP, with what the server told it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DhcpLease {
    pub ip: Ipv4Addr,
    pub server_ip: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    /// Seconds.
    pub lease_time: Option<u32>,
    pub domain: Option<String>,
}
