// ── Worker ──
//
// Owns the devices of one worker and demultiplexes every received frame
// to the device it belongs to. Protocol state lives on the devices; the
// worker only routes, answers ARP and ICMP, and spawns the services.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::ap::{ServiceApShutdown, drive_ap};
use crate::client::{AssociationOutcome, ClientServiceAssociation};
use crate::device::{Ap, ApSettings, Client, ClientSettings, DataChannel, WirelessDevice};
use crate::dtls::DtlsConnector;
use crate::error::CoreError;
use crate::model::{ApState, MacAddress};
use crate::service::{ServiceEnv, ServiceResult, run_service};
use crate::wire::capwap::{CONTROL_PORT, DATA_PORT, PREAMBLE_DTLS, PREAMBLE_PLAIN};
use crate::wire::dot11;
use crate::wire::ether::{
    self, ArpOp, ArpPacket, ETHERTYPE_ARP, ETHERTYPE_IPV4, icmp_echo_reply, icmp_echo_target, parse_udp,
};

pub type ApTask = JoinHandle<Result<(), CoreError>>;
pub type ClientTask = JoinHandle<Result<ServiceResult<AssociationOutcome>, CoreError>>;

pub struct Worker {
    env: ServiceEnv,
    connector: Arc<dyn DtlsConnector>,
    cancel: CancellationToken,
    aps: DashMap<MacAddress, Arc<Ap>>,
    aps_by_ip: DashMap<Ipv4Addr, MacAddress>,
    clients: DashMap<MacAddress, Arc<Client>>,
}

impl Worker {
    /// Devices created by this worker are interrupted when `cancel` fires.
    pub fn new(env: ServiceEnv, connector: Arc<dyn DtlsConnector>, cancel: CancellationToken) -> Self {
        Self {
            env,
            connector,
            cancel,
            aps: DashMap::new(),
            aps_by_ip: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    pub fn env(&self) -> &ServiceEnv {
        &self.env
    }

    // ── Devices ─────────────────────────────────────────────────────

    pub fn add_ap(&self, settings: ApSettings) -> Result<Arc<Ap>, CoreError> {
        if self.aps.contains_key(&settings.mac) {
            return Err(CoreError::DuplicateDevice { mac: settings.mac });
        }
        let ap = Ap::new(settings, &self.env, Arc::clone(&self.connector), &self.cancel);
        self.aps.insert(settings.mac, Arc::clone(&ap));
        self.aps_by_ip.insert(settings.ip, settings.mac);
        debug!(ap = %settings.mac, ip = %settings.ip, name = ap.name(), "AP added");
        Ok(ap)
    }

    pub fn add_client(&self, settings: ClientSettings, ap_mac: MacAddress) -> Result<Arc<Client>, CoreError> {
        if self.clients.contains_key(&settings.mac) {
            return Err(CoreError::DuplicateDevice { mac: settings.mac });
        }
        let ap = self.ap(ap_mac)?;
        let client = Client::attach(settings, &ap, self.env.bus(), &self.cancel);
        self.clients.insert(settings.mac, Arc::clone(&client));
        debug!(client = %settings.mac, ap = %ap_mac, "client added");
        Ok(client)
    }

    pub fn ap(&self, mac: MacAddress) -> Result<Arc<Ap>, CoreError> {
        self.aps
            .get(&mac)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::DeviceNotFound {
                identifier: mac.to_string(),
            })
    }

    pub fn client(&self, mac: MacAddress) -> Result<Arc<Client>, CoreError> {
        self.clients
            .get(&mac)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoreError::DeviceNotFound {
                identifier: mac.to_string(),
            })
    }

    pub fn aps(&self) -> Vec<Arc<Ap>> {
        self.aps.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    // ── Orchestration ───────────────────────────────────────────────

    /// Start one lifecycle driver per AP not yet closed.
    pub fn join_aps(&self) -> Vec<ApTask> {
        self.aps()
            .into_iter()
            .filter(|ap| ap.state() != ApState::Closed)
            .map(|ap| {
                let env = self.env.clone();
                tokio::spawn(drive_ap(ap, env))
            })
            .collect()
    }

    /// Start the association service of every client.
    pub fn associate_clients(&self) -> Vec<ClientTask> {
        self.clients()
            .into_iter()
            .map(|client| {
                let env = self.env.clone();
                tokio::spawn(run_service(client, env, ClientServiceAssociation))
            })
            .collect()
    }

    /// Interrupt everything running on the AP, then close it down.
    pub async fn stop_ap(&self, mac: MacAddress) -> Result<ServiceResult<ApState>, CoreError> {
        let ap = self.ap(mac)?;
        ap.core().interrupt();
        info!(ap = %mac, state = %ap.state(), "stopping AP");
        run_service(ap, self.env.clone(), ServiceApShutdown).await
    }

    // ── Receive path ────────────────────────────────────────────────

    /// Route one received Ethernet frame.
    pub fn handle_packet(&self, frame: Bytes) {
        let Some(dst) = ether::dst_mac(&frame) else {
            return;
        };
        if dst.is_broadcast() {
            self.handle_broadcast(&frame);
            return;
        }
        match self.aps.get(&dst).map(|entry| Arc::clone(entry.value())) {
            Some(ap) => self.handle_ap_frame(&ap, &frame),
            None => trace!(%dst, "frame for unknown MAC dropped"),
        }
    }

    fn handle_broadcast(&self, frame: &Bytes) {
        if ether::ethertype(frame) == Some(ETHERTYPE_ARP) {
            if let Some(arp) = ArpPacket::parse(frame) {
                self.answer_arp_request(&arp);
            }
            return;
        }
        for ap in self.aps() {
            ap.core().deliver(frame);
        }
        for client in self.clients() {
            client.core().deliver(frame);
        }
    }

    fn answer_arp_request(&self, arp: &ArpPacket) {
        if arp.op != ArpOp::Request {
            return;
        }
        let Some(mac) = self.aps_by_ip.get(&arp.target_ip).map(|entry| *entry.value()) else {
            return;
        };
        trace!(ap = %mac, asker = %arp.sender_ip, "answering ARP");
        self.env.send(arp.answer(mac).to_frame());
    }

    fn handle_ap_frame(&self, ap: &Arc<Ap>, frame: &Bytes) {
        match ether::ethertype(frame) {
            Some(ETHERTYPE_ARP) => {
                let Some(arp) = ArpPacket::parse(frame) else {
                    return;
                };
                match arp.op {
                    ArpOp::Reply if ap.wlc_ip() == Some(arp.sender_ip) => ap.learn_wlc_mac(arp.sender_mac),
                    ArpOp::Request => self.answer_arp_request(&arp),
                    ArpOp::Reply => {}
                }
            }
            Some(ETHERTYPE_IPV4) => self.handle_ap_ipv4(ap, frame),
            _ => trace!(ap = %ap.mac(), "non-IP frame dropped"),
        }
    }

    fn handle_ap_ipv4(&self, ap: &Arc<Ap>, frame: &Bytes) {
        if icmp_echo_target(frame) == Some(ap.ip()) {
            if let Some(reply) = icmp_echo_reply(frame) {
                self.env.send(reply);
            }
            return;
        }
        let Some(datagram) = parse_udp(frame) else {
            return;
        };
        let payload = datagram.payload;
        match datagram.path.src_port {
            CONTROL_PORT => match payload.first() {
                Some(&PREAMBLE_PLAIN) => ap.handle_plain_control(&datagram.path, payload),
                Some(&PREAMBLE_DTLS) => {
                    for reply in ap.handle_dtls(frame, payload) {
                        self.env.send(reply);
                    }
                }
                _ => trace!(ap = %ap.mac(), "unknown CAPWAP preamble"),
            },
            DATA_PORT => match ap.handle_data(payload) {
                DataChannel::KeepAlive(Some(reply)) => self.env.send(reply),
                DataChannel::Dot11(dot11) => self.route_dot11(ap, &dot11),
                DataChannel::KeepAlive(None) | DataChannel::Ignored => {}
            },
            port => trace!(ap = %ap.mac(), port, "UDP frame on unrelated port dropped"),
        }
    }

    /// 802.11 frame from the controller, for the AP's stations.
    fn route_dot11(&self, ap: &Ap, frame: &Bytes) {
        let Some(receiver) = dot11::addr1(frame) else {
            return;
        };
        let targets: Vec<Arc<Client>> = if receiver.is_broadcast() {
            ap.clients()
        } else {
            self.clients
                .get(&receiver)
                .filter(|client| client.ap_mac() == ap.mac())
                .map(|client| vec![Arc::clone(client.value())])
                .unwrap_or_default()
        };
        if targets.is_empty() {
            trace!(ap = %ap.mac(), station = %receiver, "802.11 frame for unknown station dropped");
            return;
        }
        for client in targets {
            self.client_arp(&client, frame);
            client.core().deliver(frame);
        }
    }

    fn client_arp(&self, client: &Client, frame: &[u8]) {
        let Some((ETHERTYPE_ARP, body)) = dot11::data_payload(frame) else {
            return;
        };
        let (Some(arp), Some(ip)) = (ArpPacket::parse_body(body), client.ip()) else {
            return;
        };
        if arp.target_ip != ip {
            return;
        }
        match arp.op {
            ArpOp::Reply => client.set_seen_arp_reply(),
            ArpOp::Request => {
                if let Some(reply) = client.ethernet_frame(&arp.answer(client.mac()).to_frame()) {
                    self.env.send(reply);
                }
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("aps", &self.aps.len())
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}
