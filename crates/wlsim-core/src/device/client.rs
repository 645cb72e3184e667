// ── Wireless client ──
//
// A station attached to one AP. The AP is held weakly: a client never
// keeps its AP alive, and every frame it sends goes through the AP's
// data channel.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::ap::Ap;
use super::{DeviceCore, WirelessDevice, lock};
use crate::model::{ClientState, DhcpLease, MacAddress, Vap};
use crate::pubsub::BrokerHandle;
use crate::wire::dot11;
use crate::wire::ether::ArpPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    pub mac: MacAddress,
    /// Static address; `None` leases one over DHCP.
    pub ip: Option<Ipv4Addr>,
    pub gateway_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub mac: MacAddress,
    pub ip: Option<Ipv4Addr>,
    pub lease: Option<DhcpLease>,
    pub ap: MacAddress,
    pub state: ClientState,
    pub retries: u32,
    pub total_retries: u32,
    pub got_disconnect: bool,
}

#[derive(Debug)]
struct ClientInner {
    state: ClientState,
    retries: u32,
    total_retries: u32,
    got_disconnect: bool,
    seen_arp_reply: bool,
    leave_requested: bool,
    lease: Option<DhcpLease>,
}

pub struct Client {
    core: DeviceCore,
    settings: ClientSettings,
    ap: Weak<Ap>,
    ap_mac: MacAddress,
    inner: Mutex<ClientInner>,
}

impl WirelessDevice for Client {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn is_attached(&self, mac: MacAddress) -> bool {
        mac == self.ap_mac
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("mac", &self.core.mac())
            .field("ap", &self.ap_mac)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client and attach it to `ap`.
    pub fn attach(
        settings: ClientSettings,
        ap: &Arc<Ap>,
        bus: &BrokerHandle,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            core: DeviceCore::new(settings.mac, settings.mac.to_string(), bus, parent),
            settings,
            ap: Arc::downgrade(ap),
            ap_mac: ap.mac(),
            inner: Mutex::new(ClientInner {
                state: ClientState::Association,
                retries: 0,
                total_retries: 0,
                got_disconnect: false,
                seen_arp_reply: false,
                leave_requested: false,
                lease: None,
            }),
        });
        ap.attach_client(Arc::clone(&client));
        client
    }

    /// Current address: the static one, else the leased one.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.settings
            .ip
            .or_else(|| lock(&self.inner).lease.as_ref().map(|lease| lease.ip))
    }

    pub fn static_ip(&self) -> Option<Ipv4Addr> {
        self.settings.ip
    }

    pub fn gateway_ip(&self) -> Option<Ipv4Addr> {
        self.settings
            .gateway_ip
            .or_else(|| lock(&self.inner).lease.as_ref().and_then(|lease| lease.router))
    }

    pub fn lease(&self) -> Option<DhcpLease> {
        lock(&self.inner).lease.clone()
    }

    pub(crate) fn bind_lease(&self, lease: DhcpLease) {
        debug!(client = %self.core.mac(), ip = %lease.ip, "lease bound");
        lock(&self.inner).lease = Some(lease);
    }

    /// Forget the lease; the next IP_LEARN asks for a new one.
    pub(crate) fn release_lease(&self) {
        lock(&self.inner).lease = None;
    }

    pub fn ap_mac(&self) -> MacAddress {
        self.ap_mac
    }

    /// The owning AP, unless it has already been dropped.
    pub fn ap(&self) -> Option<Arc<Ap>> {
        self.ap.upgrade()
    }

    pub fn state(&self) -> ClientState {
        lock(&self.inner).state
    }

    pub(crate) fn set_state(&self, next: ClientState) {
        let previous = std::mem::replace(&mut lock(&self.inner).state, next);
        if previous != next {
            debug!(client = %self.core.mac(), from = %previous, to = %next, "state changed");
        }
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let inner = lock(&self.inner);
        ClientSnapshot {
            mac: self.core.mac(),
            ip: self.settings.ip.or_else(|| inner.lease.as_ref().map(|lease| lease.ip)),
            lease: inner.lease.clone(),
            ap: self.ap_mac,
            state: inner.state,
            retries: inner.retries,
            total_retries: inner.total_retries,
            got_disconnect: inner.got_disconnect,
        }
    }

    // ── Flags ───────────────────────────────────────────────────────

    pub fn got_disconnect(&self) -> bool {
        lock(&self.inner).got_disconnect
    }

    /// The AP went away: flag it and wake anything the client waits on.
    pub fn mark_disconnected(&self) {
        lock(&self.inner).got_disconnect = true;
        trace!(client = %self.core.mac(), "marked disconnected");
        self.core.wake();
    }

    pub(crate) fn clear_disconnect(&self) {
        lock(&self.inner).got_disconnect = false;
    }

    /// Ask the association service to leave gracefully.
    pub fn request_leave(&self) {
        lock(&self.inner).leave_requested = true;
        self.core.wake();
    }

    pub(crate) fn leave_requested(&self) -> bool {
        lock(&self.inner).leave_requested
    }

    pub(crate) fn take_leave_request(&self) -> bool {
        std::mem::take(&mut lock(&self.inner).leave_requested)
    }

    pub(crate) fn seen_arp_reply(&self) -> bool {
        lock(&self.inner).seen_arp_reply
    }

    pub(crate) fn set_seen_arp_reply(&self) {
        lock(&self.inner).seen_arp_reply = true;
        self.core.wake();
    }

    pub(crate) fn reset_arp_reply(&self) {
        lock(&self.inner).seen_arp_reply = false;
    }

    pub fn retries(&self) -> u32 {
        lock(&self.inner).retries
    }

    /// Count one more attempt; returns the retry count before it.
    pub(crate) fn count_retry(&self) -> u32 {
        let mut inner = lock(&self.inner);
        let before = inner.retries;
        inner.retries += 1;
        inner.total_retries += 1;
        before
    }

    pub(crate) fn reset_retries(&self) {
        lock(&self.inner).retries = 0;
    }

    // ── Frames ──────────────────────────────────────────────────────

    /// Association request for `vap`, ready to send through the AP.
    pub(crate) fn association_frame(&self, vap: &Vap) -> Option<Bytes> {
        let ap = self.ap()?;
        let bssid = ap.settings().radio_mac;
        let frame = dot11::association_request(bssid, self.core.mac(), &vap.ssid, ap.next_dot11_seq());
        Some(ap.dot11_frame(vap.slot_id, &frame))
    }

    pub(crate) fn disassociation_frame(&self) -> Option<Bytes> {
        let ap = self.ap()?;
        let bssid = ap.settings().radio_mac;
        // Reason 8: station is leaving.
        let frame = dot11::disassociation(bssid, self.core.mac(), 8, ap.next_dot11_seq());
        Some(ap.dot11_frame(0, &frame))
    }

    /// Ethernet frame from this client, as a to-DS data frame via the AP.
    pub(crate) fn ethernet_frame(&self, ethernet: &[u8]) -> Option<Bytes> {
        let ap = self.ap()?;
        let bssid = ap.settings().radio_mac;
        let frame = dot11::wrap_ethernet(bssid, self.core.mac(), ethernet, ap.next_dot11_seq())?;
        Some(ap.dot11_frame(0, &frame))
    }

    pub(crate) fn gratuitous_arp(&self) -> Option<Bytes> {
        let ip = self.settings.ip?;
        self.ethernet_frame(&ArpPacket::gratuitous(self.core.mac(), ip).to_frame())
    }

    pub(crate) fn gateway_arp_request(&self) -> Option<Bytes> {
        let ip = self.settings.ip?;
        let gateway = self.settings.gateway_ip?;
        self.ethernet_frame(&ArpPacket::who_has(self.core.mac(), ip, gateway).to_frame())
    }
}
