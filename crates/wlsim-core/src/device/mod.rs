//! Emulated wireless devices.
//!
//! An [`Ap`] owns its [`Client`]s; a client only holds a weak reference
//! back. Both share a [`DeviceCore`]: identity, the device's publisher,
//! its `services_info` bag, the receive queues of its running services,
//! the poke used to wake them, and the interrupt token.

mod ap;
mod client;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub use ap::{Ap, ApSettings, ApSnapshot, DataChannel};
pub use client::{Client, ClientSettings, ClientSnapshot};

use crate::error::CoreError;
use crate::model::MacAddress;
use crate::pubsub::{BrokerHandle, Publisher, Topic};
use crate::service::ServicesInfo;

/// Anything a service can be bound to.
pub trait WirelessDevice: Send + Sync + 'static {
    fn core(&self) -> &DeviceCore;

    /// Whether `mac` is directly attached to this device (an AP's client,
    /// or a client's AP). Event waits are restricted to these.
    fn is_attached(&self, mac: MacAddress) -> bool;

    fn mac(&self) -> MacAddress {
        self.core().mac()
    }
}

/// State every device carries regardless of its kind.
pub struct DeviceCore {
    mac: MacAddress,
    name: String,
    publisher: Publisher,
    services_info: ServicesInfo,
    rx_slots: Mutex<HashMap<&'static str, mpsc::Sender<Bytes>>>,
    wake: Notify,
    parent_cancel: CancellationToken,
    cancel: ArcSwap<CancellationToken>,
}

impl DeviceCore {
    pub fn new(mac: MacAddress, name: String, bus: &BrokerHandle, parent: &CancellationToken) -> Self {
        Self {
            mac,
            name,
            publisher: bus.publisher(Topic::new([mac.to_string()])),
            services_info: ServicesInfo::default(),
            rx_slots: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            parent_cancel: parent.clone(),
            cancel: ArcSwap::from_pointee(parent.child_token()),
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn services_info(&self) -> &ServicesInfo {
        &self.services_info
    }

    // ── Interruption ────────────────────────────────────────────────

    /// Token the next service run will watch.
    pub fn cancel_token(&self) -> CancellationToken {
        CancellationToken::clone(&self.cancel.load())
    }

    /// Unwind every service currently running on this device. Services
    /// started afterwards get a fresh token and run normally.
    pub fn interrupt(&self) {
        let fresh = Arc::new(self.parent_cancel.child_token());
        let previous = self.cancel.swap(fresh);
        previous.cancel();
        debug!(device = %self.mac, "device interrupted");
    }

    // ── Wake-ups ────────────────────────────────────────────────────

    /// Poke the device: a flag a service may be waiting on has changed.
    /// Wakes current waiters and leaves a permit for the next one, so a
    /// poke landing between a probe and its wait is not lost.
    pub fn wake(&self) {
        self.wake.notify_waiters();
        self.wake.notify_one();
    }

    pub async fn woken(&self) {
        self.wake.notified().await;
    }

    // ── Receive queues ──────────────────────────────────────────────

    pub(crate) fn open_rx(&self, service: &'static str, capacity: usize) -> Result<mpsc::Receiver<Bytes>, CoreError> {
        let mut slots = lock(&self.rx_slots);
        if slots.get(service).is_some_and(|tx| !tx.is_closed()) {
            return Err(CoreError::ServiceAlreadyRunning {
                service,
                device: self.mac,
            });
        }
        let (tx, rx) = mpsc::channel(capacity);
        slots.insert(service, tx);
        Ok(rx)
    }

    pub(crate) fn close_rx(&self, service: &'static str) {
        lock(&self.rx_slots).remove(service);
    }

    /// Queue `packet` for every service that requested packets. A full
    /// queue drops the packet for that service only.
    pub fn deliver(&self, packet: &Bytes) -> usize {
        let slots = lock(&self.rx_slots);
        let mut delivered = 0;
        for (service, tx) in slots.iter() {
            match tx.try_send(packet.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => trace!(device = %self.mac, service, "receive queue full or closed, packet dropped"),
            }
        }
        delivered
    }

    /// Services currently holding a receive queue.
    pub fn active_services(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = lock(&self.rx_slots).keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCore")
            .field("mac", &self.mac)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Device locks are never held across an await, so a poisoned lock only
/// means a panic elsewhere; the data is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
