#![allow(clippy::unwrap_used, dead_code)]

//! Shared fixtures: a recording transmit sink, a scripted DTLS session
//! and a scripted controller that answers through the worker.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use wlsim_core::dtls::{HandshakeStatus, ShutdownStatus};
use wlsim_core::model::EncryptPolicy;
use wlsim_core::service::ServiceEnv;
use wlsim_core::wire::capwap::{
    self, CONTROL_PORT, CapwapHeader, ControlMessage, DATA_PORT, DTLS_HEADER, ElementWriter, MessageType,
    PREAMBLE_DTLS, PREAMBLE_PLAIN,
};
use wlsim_core::wire::dot11::{self, FrameKind};
use wlsim_core::wire::dhcp::{self, DhcpMessage, DhcpOptions};
use wlsim_core::wire::ether::{
    ArpOp, ArpPacket, ETHERTYPE_ARP, ETHERTYPE_IPV4, UdpPath, parse_ipv4_udp, parse_udp, udp_frame,
};
use wlsim_core::{
    Ap, ApSettings, Broker, CoreError, DtlsConnector, DtlsSession, MacAddress, PacketSink, Vap, WirelessConfig,
    Worker,
};

pub const WLC_MAC: MacAddress = MacAddress::new([0x00, 0x0c, 0x29, 0x00, 0x00, 0x01]);
pub const WLC_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const GATEWAY_MAC: MacAddress = MacAddress::new([0x00, 0x0c, 0x29, 0x00, 0x00, 0xfe]);
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);
pub const DHCP_SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const LEASE_SECS: u32 = 3600;

const RECORD_HANDSHAKE: u8 = 0x16;
const RECORD_APPLICATION: u8 = 0x17;

// ── Recording sink ──────────────────────────────────────────────────

/// Every frame the core sent, with the virtual instant it was sent at.
#[derive(Clone, Default)]
pub struct Sent {
    frames: Arc<Mutex<Vec<(Instant, Bytes)>>>,
}

impl Sent {
    pub fn matching(&self, pred: impl Fn(&[u8]) -> bool) -> Vec<(Instant, Bytes)> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, frame)| pred(frame))
            .cloned()
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&[u8]) -> bool) -> usize {
        self.matching(pred).len()
    }
}

struct RecordingSink {
    sent: Sent,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PacketSink for RecordingSink {
    fn send(&self, packet: Bytes) {
        self.sent.frames.lock().unwrap().push((Instant::now(), packet.clone()));
        let _ = self.tx.send(packet);
    }
}

// ── Scripted DTLS ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Finishes on the first handshake step.
    Finish,
    /// Never hears back from the peer.
    Never,
    /// The peer answers with a fatal alert.
    Alert,
}

/// Identity "encryption": application records are the plaintext behind a
/// content-type byte, so the fake controller can read them.
struct ScriptedSession {
    mode: HandshakeMode,
    finished: bool,
    shutdown: bool,
    inbox: VecDeque<Bytes>,
    outbox: Vec<Bytes>,
    timeouts: Arc<AtomicUsize>,
}

impl DtlsSession for ScriptedSession {
    fn do_handshake(&mut self) -> Result<HandshakeStatus, CoreError> {
        match self.mode {
            HandshakeMode::Finish => {
                self.finished = true;
                Ok(HandshakeStatus::Finished)
            }
            HandshakeMode::Never => {
                self.outbox.push(Bytes::from_static(&[RECORD_HANDSHAKE, 1]));
                Ok(HandshakeStatus::InProgress)
            }
            HandshakeMode::Alert => Ok(HandshakeStatus::Alert("handshake_failure".into())),
        }
    }

    fn handle_timeout(&mut self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    fn is_handshake_finished(&self) -> bool {
        self.finished
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    fn feed(&mut self, record: &[u8]) {
        self.inbox.push_back(Bytes::copy_from_slice(record));
    }

    fn drain(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbox)
    }

    fn write(&mut self, plaintext: &[u8]) -> Result<(), CoreError> {
        if !self.finished {
            return Err(CoreError::Dtls {
                message: "write before handshake".into(),
            });
        }
        let mut record = BytesMut::with_capacity(plaintext.len() + 1);
        record.put_u8(RECORD_APPLICATION);
        record.put_slice(plaintext);
        self.outbox.push(record.freeze());
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Bytes>, CoreError> {
        Ok(self
            .inbox
            .pop_front()
            .filter(|record| record.first() == Some(&RECORD_APPLICATION))
            .map(|record| record.slice(1..)))
    }

    fn shutdown(&mut self) -> Result<ShutdownStatus, CoreError> {
        self.shutdown = true;
        self.outbox.push(Bytes::from_static(&[0x15, 1, 0]));
        Ok(ShutdownStatus::Complete)
    }
}

pub struct ScriptedConnector {
    mode: Mutex<HandshakeMode>,
    pub sessions: AtomicUsize,
    pub handshake_timeouts: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(mode: HandshakeMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            sessions: AtomicUsize::new(0),
            handshake_timeouts: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl DtlsConnector for ScriptedConnector {
    fn new_session(&self, _ap: MacAddress) -> Box<dyn DtlsSession> {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        Box::new(ScriptedSession {
            mode: *self.mode.lock().unwrap(),
            finished: false,
            shutdown: false,
            inbox: VecDeque::new(),
            outbox: Vec::new(),
            timeouts: Arc::clone(&self.handshake_timeouts),
        })
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub worker: Arc<Worker>,
    pub env: ServiceEnv,
    pub sent: Sent,
    pub connector: Arc<ScriptedConnector>,
    pub cancel: CancellationToken,
    rx: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl Harness {
    pub fn new(config: WirelessConfig, mode: HandshakeMode) -> Self {
        let cancel = CancellationToken::new();
        let (bus, _broker) = Broker::spawn(cancel.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Sent::default();
        let sink = RecordingSink {
            sent: sent.clone(),
            tx,
        };
        let env = ServiceEnv::new(Arc::new(sink), bus, config);
        let connector = ScriptedConnector::new(mode);
        let worker = Arc::new(Worker::new(
            env.clone(),
            Arc::clone(&connector) as Arc<dyn DtlsConnector>,
            cancel.clone(),
        ));
        Self {
            worker,
            env,
            sent,
            connector,
            cancel,
            rx: Some(rx),
        }
    }

    /// Answer the core's frames with `script` from now on.
    pub fn spawn_wlc(&mut self, script: WlcScript) -> JoinHandle<()> {
        let rx = self.rx.take().unwrap();
        let wlc = FakeWlc {
            worker: Arc::clone(&self.worker),
            script,
            nak_sent: AtomicBool::new(false),
        };
        tokio::spawn(wlc.run(rx))
    }

    pub fn add_ap(&self, n: u8) -> Arc<Ap> {
        self.worker.add_ap(ap_settings(n)).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn ap_settings(n: u8) -> ApSettings {
    ApSettings {
        mac: MacAddress::new([0x00, 0x00, 0x00, 0x00, 0x01, n]),
        ip: Ipv4Addr::new(10, 0, 1, n),
        udp_port: 10_000 + u16::from(n) * 2,
        radio_mac: MacAddress::new([0x00, 0x00, 0x00, 0x01, n, 0x00]),
    }
}

/// Poll `cond` every 50 ms of virtual time until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

/// Config with the controller address known up front.
pub fn config_with_wlc() -> WirelessConfig {
    WirelessConfig {
        wlc_ip: Some(WLC_IP),
        ..WirelessConfig::default()
    }
}

// ── Frame predicates ────────────────────────────────────────────────

pub fn plain_control_type(frame: &[u8]) -> Option<MessageType> {
    let udp = parse_udp(frame)?;
    if udp.path.dst_port != CONTROL_PORT || udp.payload.first() != Some(&PREAMBLE_PLAIN) {
        return None;
    }
    capwap::peek_message_type(udp.payload)
}

/// Plaintext CAPWAP inside a DTLS application record, if `frame` has one.
pub fn dtls_control(frame: &[u8]) -> Option<Bytes> {
    let udp = parse_udp(frame)?;
    if udp.path.dst_port != CONTROL_PORT || udp.payload.first() != Some(&PREAMBLE_DTLS) {
        return None;
    }
    let record = udp.payload.get(DTLS_HEADER.len()..)?;
    if record.first() != Some(&RECORD_APPLICATION) {
        return None;
    }
    Some(Bytes::copy_from_slice(&record[1..]))
}

pub fn dtls_control_type(frame: &[u8]) -> Option<MessageType> {
    capwap::peek_message_type(&dtls_control(frame)?)
}

pub fn is_discovery(frame: &[u8]) -> bool {
    plain_control_type(frame) == Some(MessageType::DiscoveryRequest)
}

pub fn is_request(ty: MessageType) -> impl Fn(&[u8]) -> bool {
    move |frame| dtls_control_type(frame) == Some(ty)
}

// ── Controller side framing ─────────────────────────────────────────

fn wlc_path(ap: &UdpPath, src_port: u16) -> UdpPath {
    UdpPath {
        src_mac: WLC_MAC,
        dst_mac: ap.src_mac,
        src_ip: WLC_IP,
        dst_ip: ap.src_ip,
        src_port,
        dst_port: ap.src_port,
    }
}

/// Controller → AP control message over the AP's DTLS session.
pub fn to_ap_dtls(ap: &ApSettings, capwap: &[u8]) -> Bytes {
    let path = UdpPath {
        src_mac: WLC_MAC,
        dst_mac: ap.mac,
        src_ip: WLC_IP,
        dst_ip: ap.ip,
        src_port: CONTROL_PORT,
        dst_port: ap.udp_port,
    };
    let mut payload = BytesMut::new();
    payload.put_slice(&DTLS_HEADER);
    payload.put_u8(RECORD_APPLICATION);
    payload.put_slice(capwap);
    udp_frame(&path, &payload)
}

pub fn open_vap(ssid: &str) -> Vap {
    Vap {
        ssid: ssid.into(),
        slot_id: 0,
        vap_id: 1,
        encrypt_policy: EncryptPolicy::Open,
    }
}

// ── Fake controller ─────────────────────────────────────────────────

/// How the fake controller answers. `None` codes mean "never answer".
#[derive(Debug, Clone)]
pub struct WlcScript {
    pub discovery_code: Option<u32>,
    pub join_code: Option<u32>,
    pub config_status_code: Option<u32>,
    pub answer_change_state: bool,
    pub push_ssid: bool,
    pub answer_keep_alive: bool,
    pub answer_echo: bool,
    pub answer_association: bool,
    pub answer_gateway_arp: bool,
    pub answer_dhcp: bool,
    /// Refuse the first DHCPREQUEST with a DHCPNAK.
    pub dhcp_nak_first: bool,
}

impl Default for WlcScript {
    fn default() -> Self {
        Self {
            discovery_code: Some(0),
            join_code: Some(0),
            config_status_code: Some(0),
            answer_change_state: true,
            push_ssid: true,
            answer_keep_alive: true,
            answer_echo: true,
            answer_association: true,
            answer_gateway_arp: true,
            answer_dhcp: true,
            dhcp_nak_first: false,
        }
    }
}

struct FakeWlc {
    worker: Arc<Worker>,
    script: WlcScript,
    nak_sent: AtomicBool,
}

impl FakeWlc {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(frame) = rx.recv().await {
            for reply in self.answer(&frame) {
                self.worker.handle_packet(reply);
            }
        }
    }

    fn answer(&self, frame: &[u8]) -> Vec<Bytes> {
        if let Some(arp) = ArpPacket::parse(frame) {
            if arp.op == ArpOp::Request && arp.target_ip == WLC_IP {
                return vec![arp.answer(WLC_MAC).to_frame()];
            }
            return Vec::new();
        }
        let Some(udp) = parse_udp(frame) else {
            return Vec::new();
        };
        match (udp.path.dst_port, udp.payload.first()) {
            (CONTROL_PORT, Some(&PREAMBLE_PLAIN)) => self.answer_plain(&udp.path, udp.payload),
            (CONTROL_PORT, Some(&PREAMBLE_DTLS)) => match dtls_control(frame) {
                Some(capwap) => self.answer_control(&udp.path, &capwap),
                None => Vec::new(),
            },
            (DATA_PORT, _) => self.answer_data(&udp.path, udp.payload),
            _ => Vec::new(),
        }
    }

    fn answer_plain(&self, path: &UdpPath, capwap: &[u8]) -> Vec<Bytes> {
        let Ok(request) = ControlMessage::parse(capwap) else {
            return Vec::new();
        };
        let (Some(MessageType::DiscoveryRequest), Some(code)) = (request.msg_type, self.script.discovery_code) else {
            return Vec::new();
        };
        let elements = ElementWriter::new().result_code(code).ac_name("fake-wlc").finish();
        let response = capwap::control_message(MessageType::DiscoveryResponse, request.seq, &elements);
        vec![udp_frame(&wlc_path(path, CONTROL_PORT), &response)]
    }

    fn answer_control(&self, path: &UdpPath, capwap: &[u8]) -> Vec<Bytes> {
        let Ok(request) = ControlMessage::parse(capwap) else {
            return Vec::new();
        };
        let reply = |ty: MessageType, code: u32| {
            let elements = ElementWriter::new().result_code(code).finish();
            self.dtls_frame(path, &capwap::control_message(ty, request.seq, &elements))
        };
        match request.msg_type {
            Some(MessageType::JoinRequest) => self
                .script
                .join_code
                .map(|code| vec![reply(MessageType::JoinResponse, code)])
                .unwrap_or_default(),
            Some(MessageType::ConfigStatusRequest) => {
                let Some(code) = self.script.config_status_code else {
                    return Vec::new();
                };
                let mut frames = vec![reply(MessageType::ConfigStatusResponse, code)];
                if self.script.push_ssid {
                    let elements = ElementWriter::new().add_wlan(&open_vap("lab")).finish();
                    let update = capwap::control_message(MessageType::ConfigUpdateRequest, 0x40, &elements);
                    frames.push(self.dtls_frame(path, &update));
                }
                frames
            }
            Some(MessageType::ChangeStateRequest) if self.script.answer_change_state => {
                vec![reply(MessageType::ChangeStateResponse, 0)]
            }
            Some(MessageType::EchoRequest) if self.script.answer_echo => {
                let response = capwap::control_message(MessageType::EchoResponse, request.seq, &[]);
                vec![self.dtls_frame(path, &response)]
            }
            _ => Vec::new(),
        }
    }

    fn answer_data(&self, path: &UdpPath, capwap: &[u8]) -> Vec<Bytes> {
        let Ok(header) = CapwapHeader::parse(capwap) else {
            return Vec::new();
        };
        if header.keep_alive {
            if !self.script.answer_keep_alive {
                return Vec::new();
            }
            return vec![udp_frame(&wlc_path(path, DATA_PORT), capwap)];
        }
        if !header.native {
            return Vec::new();
        }
        let dot11_frame = &capwap[header.len..];
        let station = dot11::addr2(dot11_frame);
        let bssid = dot11::addr1(dot11_frame);
        let (Some(station), Some(bssid)) = (station, bssid) else {
            return Vec::new();
        };
        let answer = match dot11::classify(dot11_frame) {
            FrameKind::AssocRequest if self.script.answer_association => {
                dot11::association_response(bssid, station, 0, 1, 0)
            }
            FrameKind::Data => match dot11::data_payload(dot11_frame) {
                Some((ETHERTYPE_ARP, body)) if self.script.answer_gateway_arp => {
                    let Some(arp) = ArpPacket::parse_body(body) else {
                        return Vec::new();
                    };
                    if arp.op != ArpOp::Request || arp.target_ip != GATEWAY_IP {
                        return Vec::new();
                    }
                    to_station(station, &arp.answer(GATEWAY_MAC).to_frame())
                }
                Some((ETHERTYPE_IPV4, packet)) if self.script.answer_dhcp => {
                    let Some(reply) = self.answer_dhcp(packet) else {
                        return Vec::new();
                    };
                    to_station(station, &dhcp_server_frame(&reply))
                }
                _ => return Vec::new(),
            },
            _ => return Vec::new(),
        };
        vec![udp_frame(&wlc_path(path, DATA_PORT), &capwap::data_frame(0, &answer))]
    }

    fn answer_dhcp(&self, packet: &[u8]) -> Option<DhcpMessage> {
        let udp = parse_ipv4_udp(packet)?;
        if udp.dst_port != dhcp::SERVER_PORT {
            return None;
        }
        let request = DhcpMessage::parse(udp.payload).ok()?;
        let offered = offered_ip(request.chaddr);
        let ty = match request.message_type()? {
            dhcp::MessageType::Discover => dhcp::MessageType::Offer,
            dhcp::MessageType::Request if self.nak_this_request() => return Some(nak(&request)),
            dhcp::MessageType::Request if request.options.requested_addr == Some(offered) => dhcp::MessageType::Ack,
            _ => return None,
        };
        Some(dhcp::reply(&request, offered, lease_options(ty)))
    }

    fn nak_this_request(&self) -> bool {
        self.script.dhcp_nak_first && !self.nak_sent.swap(true, Ordering::SeqCst)
    }

    fn dtls_frame(&self, path: &UdpPath, capwap: &[u8]) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_slice(&DTLS_HEADER);
        payload.put_u8(RECORD_APPLICATION);
        payload.put_slice(capwap);
        udp_frame(&wlc_path(path, CONTROL_PORT), &payload)
    }
}

/// Address the fake DHCP server hands `station`.
pub fn offered_ip(station: MacAddress) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 100 + station.octets()[5] % 100)
}

fn lease_options(ty: dhcp::MessageType) -> DhcpOptions {
    DhcpOptions {
        message_type: Some(ty),
        server_id: Some(DHCP_SERVER_IP),
        subnet_mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
        router: Some(GATEWAY_IP),
        lease_time: Some(LEASE_SECS),
        domain: Some("lab.local".into()),
        ..DhcpOptions::default()
    }
}

fn nak(request: &DhcpMessage) -> DhcpMessage {
    let options = DhcpOptions {
        message_type: Some(dhcp::MessageType::Nak),
        server_id: Some(DHCP_SERVER_IP),
        ..DhcpOptions::default()
    };
    dhcp::reply(request, Ipv4Addr::UNSPECIFIED, options)
}

/// Broadcast server reply, from the gateway's MAC.
fn dhcp_server_frame(reply: &DhcpMessage) -> Bytes {
    let path = UdpPath {
        src_mac: GATEWAY_MAC,
        dst_mac: MacAddress::BROADCAST,
        src_ip: DHCP_SERVER_IP,
        dst_ip: Ipv4Addr::BROADCAST,
        src_port: dhcp::SERVER_PORT,
        dst_port: dhcp::CLIENT_PORT,
    };
    udp_frame(&path, &reply.to_bytes())
}

/// DHCP message inside a frame the core sent, if it carries one.
pub fn sent_dhcp(frame: &[u8]) -> Option<DhcpMessage> {
    let udp = parse_udp(frame)?;
    if udp.path.dst_port != DATA_PORT {
        return None;
    }
    let header = CapwapHeader::parse(udp.payload).ok()?;
    let (ETHERTYPE_IPV4, packet) = dot11::data_payload(udp.payload.get(header.len..)?)? else {
        return None;
    };
    let inner = parse_ipv4_udp(packet)?;
    if inner.dst_port != dhcp::SERVER_PORT {
        return None;
    }
    DhcpMessage::parse(inner.payload).ok()
}

/// Data frame addressed to `station`. Only the receiver address and the
/// LLC payload matter to the AP, so the to-DS builder is reused with the
/// station in the first address slot.
pub fn to_station(station: MacAddress, ethernet: &[u8]) -> Vec<u8> {
    let source = MacAddress::from_slice(ethernet, 6).unwrap_or(GATEWAY_MAC);
    dot11::wrap_ethernet(station, source, ethernet, 0).unwrap_or_default()
}
