// ── Access point ──
//
// Protocol state of one emulated AP plus the receive-side handlers the
// worker calls for frames addressed to it. Handlers only record what
// arrived and poke the device; the AP's services act on it.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::client::Client;
use super::{DeviceCore, WirelessDevice, lock};
use crate::config::ApIdentity;
use crate::dtls::{DtlsConnector, DtlsSession};
use crate::error::CoreError;
use crate::events::WirelessEvent;
use crate::model::{ApState, MacAddress, Vap, VapKey};
use crate::service::ServiceEnv;
use crate::wire::capwap::{
    self, CONTROL_PORT, CapwapHeader, ControlMessage, DATA_PORT, DTLS_ALERT, DTLS_HEADER, MessageType,
    Reassembler, WlanChange, WtpInfo,
};
use crate::wire::ether::{ArpPacket, UdpPath, udp_frame};

const STATE_HISTORY: usize = 32;
const DOT11_SEQ_MAX: u16 = 0x0fff;

/// How an AP is attached to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApSettings {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    /// Source port of the control channel; data uses the next one.
    pub udp_port: u16,
    /// Base BSSID of the radios.
    pub radio_mac: MacAddress,
}

/// What a data-channel packet from the controller turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannel {
    /// Keep-alive; carries the answer to send, if one is due.
    KeepAlive(Option<Bytes>),
    /// Native 802.11 frame for one of the AP's stations.
    Dot11(Bytes),
    Ignored,
}

/// Serializable view of an AP for the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ApSnapshot {
    pub mac: MacAddress,
    pub name: String,
    pub ip: Ipv4Addr,
    pub state: ApState,
    pub wlc_ip: Option<Ipv4Addr>,
    pub wlc_mac: Option<MacAddress>,
    pub vaps: Vec<Vap>,
    pub clients: Vec<MacAddress>,
    pub discover_attempts: u32,
    pub dtls_timeouts: u32,
    pub join_duration: Option<f64>,
}

struct ApInner {
    state: ApState,
    wlc_ip: Option<Ipv4Addr>,
    wlc_mac: Option<MacAddress>,
    /// Result code of the last response per type; present once received.
    responses: HashMap<MessageType, Option<u32>>,
    vaps: BTreeMap<VapKey, Vap>,
    ac_name: String,
    capwap_seq: u8,
    dot11_seq: u16,
    got_keep_alive: bool,
    expect_keep_alive_response: bool,
    got_disconnect: bool,
    session_id: [u8; 16],
    reassembler: Reassembler,
    discover_attempts: u32,
    dtls_timeouts: u32,
    join_duration: Option<Duration>,
}

impl ApInner {
    fn new(wlc_ip: Option<Ipv4Addr>) -> Self {
        Self {
            state: ApState::Init,
            wlc_ip,
            wlc_mac: None,
            responses: HashMap::new(),
            vaps: BTreeMap::new(),
            ac_name: String::new(),
            capwap_seq: 0,
            dot11_seq: 0,
            got_keep_alive: false,
            expect_keep_alive_response: false,
            got_disconnect: false,
            session_id: *Uuid::new_v4().as_bytes(),
            reassembler: Reassembler::default(),
            discover_attempts: 0,
            dtls_timeouts: 0,
            join_duration: None,
        }
    }
}

pub struct Ap {
    core: DeviceCore,
    settings: ApSettings,
    identity: ApIdentity,
    inner: Mutex<ApInner>,
    dtls: Mutex<Box<dyn DtlsSession>>,
    connector: Arc<dyn DtlsConnector>,
    clients: Mutex<Vec<Arc<Client>>>,
    state_tx: broadcast::Sender<ApState>,
}

impl WirelessDevice for Ap {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn is_attached(&self, mac: MacAddress) -> bool {
        lock(&self.clients).iter().any(|client| client.mac() == mac)
    }
}

impl std::fmt::Debug for Ap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ap")
            .field("mac", &self.core.mac())
            .field("ip", &self.settings.ip)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Ap {
    pub fn new(
        settings: ApSettings,
        env: &ServiceEnv,
        connector: Arc<dyn DtlsConnector>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let name = format!("AP{}", settings.mac.dotted());
        let (state_tx, _) = broadcast::channel(STATE_HISTORY);
        Arc::new(Self {
            core: DeviceCore::new(settings.mac, name, env.bus(), parent),
            identity: env.config().identity.clone(),
            inner: Mutex::new(ApInner::new(env.config().wlc_ip)),
            dtls: Mutex::new(connector.new_session(settings.mac)),
            connector,
            clients: Mutex::new(Vec::new()),
            state_tx,
            settings,
        })
    }

    pub fn settings(&self) -> &ApSettings {
        &self.settings
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.settings.ip
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    // ── State ───────────────────────────────────────────────────────

    pub fn state(&self) -> ApState {
        lock(&self.inner).state
    }

    /// Every state the AP enters from now on.
    pub fn state_changes(&self) -> broadcast::Receiver<ApState> {
        self.state_tx.subscribe()
    }

    /// Move to `next`. Re-entering the current state is a no-op; an
    /// illegal move is refused and logged.
    pub(crate) fn set_state(&self, next: ApState) -> bool {
        let previous = {
            let mut inner = lock(&self.inner);
            let previous = inner.state;
            if previous == next {
                return true;
            }
            if !previous.can_advance_to(next) {
                warn!(ap = %self.core.mac(), from = %previous, to = %next, "illegal state transition refused");
                return false;
            }
            inner.state = next;
            previous
        };
        debug!(ap = %self.core.mac(), from = %previous, to = %next, "state changed");
        let _ = self.state_tx.send(next);
        true
    }

    pub fn snapshot(&self) -> ApSnapshot {
        let clients = self.clients().iter().map(|client| client.mac()).collect();
        let inner = lock(&self.inner);
        ApSnapshot {
            mac: self.core.mac(),
            name: self.core.name().to_owned(),
            ip: self.settings.ip,
            state: inner.state,
            wlc_ip: inner.wlc_ip,
            wlc_mac: inner.wlc_mac,
            vaps: inner.vaps.values().cloned().collect(),
            clients,
            discover_attempts: inner.discover_attempts,
            dtls_timeouts: inner.dtls_timeouts,
            join_duration: inner.join_duration.map(|d| d.as_secs_f64()),
        }
    }

    // ── Controller ──────────────────────────────────────────────────

    pub fn wlc_ip(&self) -> Option<Ipv4Addr> {
        lock(&self.inner).wlc_ip
    }

    pub fn wlc_mac(&self) -> Option<MacAddress> {
        lock(&self.inner).wlc_mac
    }

    pub(crate) fn learn_wlc_mac(&self, mac: MacAddress) {
        lock(&self.inner).wlc_mac = Some(mac);
        self.core.wake();
    }

    pub(crate) fn forget_wlc_mac(&self) {
        lock(&self.inner).wlc_mac = None;
    }

    pub fn ac_name(&self) -> String {
        lock(&self.inner).ac_name.clone()
    }

    // ── VAPs ────────────────────────────────────────────────────────

    pub fn vaps(&self) -> Vec<Vap> {
        lock(&self.inner).vaps.values().cloned().collect()
    }

    pub fn has_vaps(&self) -> bool {
        !lock(&self.inner).vaps.is_empty()
    }

    /// First VAP with open authentication, in `(slot, vap)` order.
    pub fn open_vap(&self) -> Option<Vap> {
        lock(&self.inner).vaps.values().find(|vap| vap.is_open()).cloned()
    }

    /// Returns true when this change taught the AP its first SSID.
    fn apply_wlan_changes(&self, changes: Vec<WlanChange>) -> bool {
        let mut inner = lock(&self.inner);
        let had_vaps = !inner.vaps.is_empty();
        for change in changes {
            match change {
                WlanChange::Add(vap) => {
                    debug!(ap = %self.core.mac(), ssid = %vap.ssid, slot = vap.slot_id, vap = vap.vap_id, "VAP added");
                    inner.vaps.insert(vap.key(), vap);
                }
                WlanChange::Delete { slot_id, vap_id } => {
                    debug!(ap = %self.core.mac(), slot = slot_id, vap = vap_id, "VAP deleted");
                    inner.vaps.remove(&(slot_id, vap_id));
                }
            }
        }
        !had_vaps && !inner.vaps.is_empty()
    }

    // ── Clients ─────────────────────────────────────────────────────

    pub fn clients(&self) -> Vec<Arc<Client>> {
        lock(&self.clients).clone()
    }

    pub(crate) fn attach_client(&self, client: Arc<Client>) {
        lock(&self.clients).push(client);
    }

    /// Mark every attached client disconnected and wake its services.
    pub(crate) fn disconnect_clients(&self) -> usize {
        let clients = self.clients();
        for client in &clients {
            client.mark_disconnected();
        }
        clients.len()
    }

    // ── Protocol flags ──────────────────────────────────────────────

    /// Forget any earlier response of type `ty` before a new request.
    pub(crate) fn expect_response(&self, ty: MessageType) {
        lock(&self.inner).responses.remove(&ty);
    }

    /// Result code of a response received since `expect_response`.
    pub(crate) fn take_response(&self, ty: MessageType) -> Option<Option<u32>> {
        lock(&self.inner).responses.remove(&ty)
    }

    pub(crate) fn record_response(&self, ty: MessageType, code: Option<u32>) {
        lock(&self.inner).responses.insert(ty, code);
        self.core.wake();
    }

    pub fn got_disconnect(&self) -> bool {
        lock(&self.inner).got_disconnect
    }

    pub(crate) fn mark_disconnect(&self) {
        lock(&self.inner).got_disconnect = true;
        self.core.wake();
    }

    pub(crate) fn await_keep_alive(&self) {
        let mut inner = lock(&self.inner);
        inner.got_keep_alive = false;
        inner.expect_keep_alive_response = true;
    }

    pub(crate) fn got_keep_alive(&self) -> bool {
        lock(&self.inner).got_keep_alive
    }

    pub(crate) fn count_discover_attempt(&self) -> u32 {
        let mut inner = lock(&self.inner);
        inner.discover_attempts += 1;
        inner.discover_attempts
    }

    pub(crate) fn count_dtls_timeout(&self) -> u32 {
        let mut inner = lock(&self.inner);
        inner.dtls_timeouts += 1;
        inner.dtls_timeouts
    }

    pub(crate) fn set_join_duration(&self, duration: Duration) {
        lock(&self.inner).join_duration = Some(duration);
    }

    /// Clear per-session protocol state ahead of a fresh discovery.
    pub(crate) fn reset_session_state(&self) {
        let mut inner = lock(&self.inner);
        inner.responses.clear();
        inner.vaps.clear();
        inner.got_keep_alive = false;
        inner.expect_keep_alive_response = false;
        inner.got_disconnect = false;
        inner.reassembler = Reassembler::default();
        inner.session_id = *Uuid::new_v4().as_bytes();
    }

    // ── DTLS ────────────────────────────────────────────────────────

    pub(crate) fn with_dtls<T>(&self, f: impl FnOnce(&mut dyn DtlsSession) -> T) -> T {
        let mut session = lock(&self.dtls);
        f(session.as_mut())
    }

    /// Drop the current session and start over with a fresh one.
    pub(crate) fn renew_dtls(&self) {
        let fresh = self.connector.new_session(self.core.mac());
        *lock(&self.dtls) = fresh;
        trace!(ap = %self.core.mac(), "DTLS session renewed");
    }

    /// Control-channel frames around DTLS records.
    pub(crate) fn dtls_frames(&self, records: Vec<Bytes>) -> Vec<Bytes> {
        let path = self.control_path();
        records
            .iter()
            .map(|record| {
                let mut payload = BytesMut::with_capacity(DTLS_HEADER.len() + record.len());
                payload.put_slice(&DTLS_HEADER);
                payload.put_slice(record);
                udp_frame(&path, &payload)
            })
            .collect()
    }

    /// Encrypt a plaintext control message into ready-to-send frames.
    pub(crate) fn encrypt_control(&self, plaintext: &[u8]) -> Result<Vec<Bytes>, CoreError> {
        let records = self.with_dtls(|session| {
            session.write(plaintext)?;
            Ok::<_, CoreError>(session.drain())
        })?;
        Ok(self.dtls_frames(records))
    }

    // ── Frame building ──────────────────────────────────────────────

    pub(crate) fn next_capwap_seq(&self) -> u8 {
        let mut inner = lock(&self.inner);
        let seq = inner.capwap_seq;
        inner.capwap_seq = seq.wrapping_add(1);
        seq
    }

    pub(crate) fn next_dot11_seq(&self) -> u16 {
        let mut inner = lock(&self.inner);
        let seq = inner.dot11_seq;
        inner.dot11_seq = if seq >= DOT11_SEQ_MAX { 0 } else { seq + 1 };
        seq
    }

    fn path_to_wlc(&self, src_port: u16, dst_port: u16) -> UdpPath {
        let inner = lock(&self.inner);
        UdpPath {
            src_mac: self.core.mac(),
            dst_mac: inner.wlc_mac.unwrap_or(MacAddress::BROADCAST),
            src_ip: self.settings.ip,
            dst_ip: inner.wlc_ip.unwrap_or(Ipv4Addr::BROADCAST),
            src_port,
            dst_port,
        }
    }

    fn control_path(&self) -> UdpPath {
        self.path_to_wlc(self.settings.udp_port, CONTROL_PORT)
    }

    fn data_path(&self) -> UdpPath {
        self.path_to_wlc(self.settings.udp_port.wrapping_add(1), DATA_PORT)
    }

    pub(crate) fn wtp_info(&self) -> WtpInfo<'_> {
        WtpInfo {
            name: self.core.name(),
            mac: self.core.mac(),
            ip: self.settings.ip,
            identity: &self.identity,
        }
    }

    /// Plaintext Discovery Request; broadcast while the controller is unknown.
    pub(crate) fn discovery_frame(&self) -> Bytes {
        let static_controller = self.wlc_ip().is_some();
        let capwap = capwap::discovery_request(&self.wtp_info(), self.next_capwap_seq(), static_controller);
        udp_frame(&self.control_path(), &capwap)
    }

    pub(crate) fn join_request(&self) -> Bytes {
        let session_id = lock(&self.inner).session_id;
        capwap::join_request(&self.wtp_info(), self.next_capwap_seq(), &session_id)
    }

    pub(crate) fn keep_alive_frame(&self) -> Bytes {
        let session_id = lock(&self.inner).session_id;
        udp_frame(&self.data_path(), &capwap::keep_alive(&session_id))
    }

    /// CAPWAP data frame carrying a native 802.11 frame on `radio_id`.
    pub(crate) fn dot11_frame(&self, radio_id: u8, dot11: &[u8]) -> Bytes {
        udp_frame(&self.data_path(), &capwap::data_frame(radio_id, dot11))
    }

    /// ARP who-has for the controller, when its MAC is still unknown.
    pub(crate) fn wlc_arp_request(&self) -> Option<Bytes> {
        let wlc_ip = self.wlc_ip()?;
        Some(ArpPacket::who_has(self.core.mac(), self.settings.ip, wlc_ip).to_frame())
    }

    pub fn gratuitous_arp(&self) -> Bytes {
        ArpPacket::gratuitous(self.core.mac(), self.settings.ip).to_frame()
    }

    // ── Receive side ────────────────────────────────────────────────

    /// Plaintext control message from the controller.
    pub(crate) fn handle_plain_control(&self, path: &UdpPath, capwap: &[u8]) {
        let message = match ControlMessage::parse(capwap) {
            Ok(message) => message,
            Err(e) => {
                trace!(ap = %self.core.mac(), error = %e, "unparsable plaintext control message");
                return;
            }
        };
        if message.msg_type != Some(MessageType::DiscoveryResponse) {
            trace!(ap = %self.core.mac(), msg_type = ?message.msg_type, "plaintext control message ignored");
            return;
        }
        {
            let mut inner = lock(&self.inner);
            inner.wlc_ip = Some(path.src_ip);
            inner.wlc_mac = Some(path.src_mac);
            if let Some(name) = message.ac_name() {
                inner.ac_name = name;
            }
        }
        self.record_response(MessageType::DiscoveryResponse, message.result_code());
    }

    /// DTLS-wrapped control payload (`payload` starts at the preamble).
    /// Returns frames to send back.
    pub(crate) fn handle_dtls(&self, frame: &Bytes, payload: &[u8]) -> Vec<Bytes> {
        let state = self.state();
        let record = payload.get(DTLS_HEADER.len()..).unwrap_or_default();
        match state {
            ApState::Dtls => {
                // The handshake service reads these itself.
                self.core.deliver(frame);
                Vec::new()
            }
            ApState::Closing => {
                self.with_dtls(|session| session.feed(record));
                self.core.wake();
                Vec::new()
            }
            state if state.has_dtls_session() => {
                if record.first() == Some(&DTLS_ALERT) {
                    debug!(ap = %self.core.mac(), "DTLS alert from controller");
                    self.mark_disconnect();
                    return Vec::new();
                }
                self.decrypt_and_dispatch(record)
            }
            _ => {
                trace!(ap = %self.core.mac(), %state, "DTLS record outside a session dropped");
                Vec::new()
            }
        }
    }

    fn decrypt_and_dispatch(&self, record: &[u8]) -> Vec<Bytes> {
        let plaintext = self.with_dtls(|session| {
            session.feed(record);
            session.read()
        });
        let plaintext = match plaintext {
            Ok(Some(plaintext)) => plaintext,
            Ok(None) => return Vec::new(),
            Err(e) => {
                debug!(ap = %self.core.mac(), error = %e, "DTLS record failed to decrypt");
                return Vec::new();
            }
        };
        let reassembled = lock(&self.inner).reassembler.push(&plaintext);
        match reassembled {
            Ok(Some(message)) => self.dispatch_control(&message),
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!(ap = %self.core.mac(), error = %e, "bad CAPWAP fragment");
                Vec::new()
            }
        }
    }

    fn dispatch_control(&self, capwap: &[u8]) -> Vec<Bytes> {
        let message = match ControlMessage::parse(capwap) {
            Ok(message) => message,
            Err(e) => {
                debug!(ap = %self.core.mac(), error = %e, "unparsable control message");
                return Vec::new();
            }
        };
        trace!(ap = %self.core.mac(), msg_type = ?message.msg_type, seq = message.seq, "control message received");
        match message.msg_type {
            Some(MessageType::ConfigUpdateRequest) => self.handle_config_update(&message),
            Some(MessageType::ResetRequest) => {
                self.mark_disconnect();
                Vec::new()
            }
            Some(
                ty @ (MessageType::JoinResponse
                | MessageType::ConfigStatusResponse
                | MessageType::ChangeStateResponse
                | MessageType::EchoResponse),
            ) => {
                self.record_response(ty, message.result_code());
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_config_update(&self, message: &ControlMessage) -> Vec<Bytes> {
        if let Some(name) = message.ac_name() {
            lock(&self.inner).ac_name = name;
        }
        if self.apply_wlan_changes(message.wlan_changes()) {
            let event = WirelessEvent::ap_vap_received(self.core.mac());
            self.core.publisher().publish(&event.sub_topic(), event.payload());
        }
        self.core.wake();
        match self.encrypt_control(&capwap::config_update_response(message.seq)) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(ap = %self.core.mac(), error = %e, "could not answer configuration update");
                Vec::new()
            }
        }
    }

    /// CAPWAP data-channel packet from the controller.
    pub(crate) fn handle_data(&self, capwap: &[u8]) -> DataChannel {
        let Ok(header) = CapwapHeader::parse(capwap) else {
            return DataChannel::Ignored;
        };
        if header.keep_alive {
            let answer = {
                let mut inner = lock(&self.inner);
                inner.got_keep_alive = true;
                let answer_due = inner.state >= ApState::Join && !inner.expect_keep_alive_response;
                inner.expect_keep_alive_response = false;
                answer_due
            };
            self.core.wake();
            let reply = answer.then(|| self.keep_alive_frame());
            return DataChannel::KeepAlive(reply);
        }
        if header.native {
            return DataChannel::Dot11(Bytes::copy_from_slice(&capwap[header.len..]));
        }
        DataChannel::Ignored
    }
}
