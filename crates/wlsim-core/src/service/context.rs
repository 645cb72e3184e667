// ── Service context ──
//
// The per-run handle a service suspends through. Owns the service's
// admission permit and receive queue; both are released on drop, so an
// interrupted service cleans up exactly like a finished one.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::future::select_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use super::admission::AdmissionPermit;
use super::env::ServiceEnv;
use super::{Service, Wake};
use crate::config::WirelessConfig;
use crate::device::WirelessDevice;
use crate::error::{CoreError, Stop};
use crate::events::WirelessEvent;
use crate::pubsub::{Subscription, Topic};

pub struct ServiceContext<D: WirelessDevice> {
    name: &'static str,
    device: Arc<D>,
    env: ServiceEnv,
    cancel: CancellationToken,
    rx: Option<mpsc::Receiver<Bytes>>,
    permit: Option<AdmissionPermit>,
    started_at: Option<Instant>,
}

impl<D: WirelessDevice> ServiceContext<D> {
    pub(crate) fn new(
        name: &'static str,
        device: Arc<D>,
        env: ServiceEnv,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            device,
            env,
            cancel,
            rx: None,
            permit: None,
            started_at: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn env(&self) -> &ServiceEnv {
        &self.env
    }

    pub fn config(&self) -> &WirelessConfig {
        self.env.config()
    }

    pub fn holds_admission(&self) -> bool {
        self.permit.is_some()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Become eligible to run.
    ///
    /// Suspends until this service's class has a free admission slot.
    /// `first_start` records the start time; `request_packets` opens a
    /// receive queue fed by the worker's packet demultiplexer.
    pub async fn request_start(&mut self, first_start: bool, request_packets: bool) -> Result<(), Stop> {
        if request_packets && self.rx.is_none() {
            let capacity = self.config().rx_queue_len.max(1);
            self.rx = Some(self.device.core().open_rx(self.name, capacity)?);
        }
        if self.permit.is_none() {
            let admission = self.env.admissions().get(self.name);
            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Stop::Interrupted),
                permit = admission.acquire() => permit?,
            };
            self.permit = Some(permit);
        }
        if first_start || self.started_at.is_none() {
            self.started_at = Some(Instant::now());
            self.add_service_info("start_time", Utc::now().to_rfc3339());
        }
        self.publish_lifecycle("request_start");
        Ok(())
    }

    /// Release the admission slot and record completion bookkeeping.
    ///
    /// `delete` also closes the receive queue, deregistering the service
    /// from packet delivery.
    pub fn request_stop(&mut self, done: bool, success: bool, delete: bool) {
        self.permit = None;
        self.record_stop(done, success);
        if delete {
            self.close_rx();
        }
        self.publish_lifecycle("request_stop");
    }

    fn record_stop(&mut self, done: bool, success: bool) {
        if let Some(started) = self.started_at.take() {
            self.add_service_info("stop_time", Utc::now().to_rfc3339());
            self.add_service_info("duration", started.elapsed().as_secs_f64());
        }
        self.add_service_info("done", done);
        self.add_service_info("success", success);
    }

    fn close_rx(&mut self) {
        if self.rx.take().is_some() {
            self.device.core().close_rx(self.name);
        }
    }

    fn publish_lifecycle(&self, what: &str) {
        self.device
            .core()
            .publisher()
            .publish(&Topic::new([self.name, what]), Value::from(what));
    }

    pub fn add_service_info(&self, key: &str, value: impl Into<Value>) {
        self.device.core().services_info().set(self.name, key, value);
    }

    // ── Effects ─────────────────────────────────────────────────────

    pub fn send(&self, packet: Bytes) {
        self.env.send(packet);
    }

    /// Publish `event`. Events may be raised for this device or for a
    /// device attached to it.
    pub fn raise_event(&self, event: &WirelessEvent) -> Result<(), Stop> {
        self.check_scope(event)?;
        trace!(device = %event.device, service = %event.service, value = %event.value, "event raised");
        if event.device == self.device.mac() {
            self.device
                .core()
                .publisher()
                .publish(&event.sub_topic(), event.payload());
        } else {
            self.env.bus().publish(event.topic(), event.payload());
        }
        Ok(())
    }

    fn check_scope(&self, event: &WirelessEvent) -> Result<(), Stop> {
        let own = self.device.mac();
        if event.device == own || self.device.is_attached(event.device) {
            return Ok(());
        }
        let violation = CoreError::EventOutOfScope {
            service: self.name,
            device: own,
            target: event.device,
        };
        error!(error = %violation, "event scope violation");
        Err(violation.into())
    }

    // ── Suspension points ───────────────────────────────────────────

    pub async fn sleep(&self, duration: Duration) -> Result<(), Stop> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Stop::Interrupted),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Wait for the device to be poked, or `timeout`.
    pub async fn wait_wake(&self, timeout: Duration) -> Result<Wake, Stop> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Stop::Interrupted),
            () = self.device.core().woken() => Ok(Wake::Woken),
            () = tokio::time::sleep(timeout) => Ok(Wake::TimedOut),
        }
    }

    /// Re-evaluate `probe` on every poke until it yields or `deadline`
    /// passes. Spurious pokes never end the wait early.
    pub async fn wait_until<T>(
        &self,
        deadline: Instant,
        mut probe: impl FnMut() -> Option<T> + Send,
    ) -> Result<Option<T>, Stop> {
        loop {
            if let Some(found) = probe() {
                return Ok(Some(found));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.wait_wake(deadline - now).await?;
        }
    }

    /// Up to `limit` queued packets, waiting up to `timeout` for the first.
    /// An empty result means the wait timed out.
    pub async fn wait_for_packets(
        &mut self,
        timeout: Option<Duration>,
        limit: usize,
    ) -> Result<Vec<Bytes>, Stop> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(CoreError::PacketsNotRequested { service: self.name }.into());
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Stop::Interrupted),
            packets = recv_packets(Some(rx), limit) => Ok(packets),
            () = sleep_for(timeout) => Ok(Vec::new()),
        }
    }

    /// Wait for one event of this device or an attached one.
    pub async fn wait_for_event(
        &mut self,
        event: &WirelessEvent,
        timeout: Option<Duration>,
    ) -> Result<Wake, Stop> {
        self.wait_for_any_events(std::slice::from_ref(event), false, timeout)
            .await
    }

    /// Wait for the first of `events`, a device poke, or (with
    /// `wait_packet`) a received packet.
    pub async fn wait_for_any_events(
        &mut self,
        events: &[WirelessEvent],
        wait_packet: bool,
        timeout: Option<Duration>,
    ) -> Result<Wake, Stop> {
        for event in events {
            self.check_scope(event)?;
        }
        let mut subscriptions: Vec<Subscription> = events
            .iter()
            .map(|event| self.env.bus().subscribe(event.topic(), None))
            .collect();
        let rx = if wait_packet { self.rx.as_mut() } else { None };
        let core = self.device.core();

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Stop::Interrupted),
            () = core.woken() => Ok(Wake::Woken),
            Some(index) = first_event(&mut subscriptions) => {
                Ok(events.get(index).cloned().map_or(Wake::Woken, Wake::Event))
            }
            packets = recv_packets(rx, 1) => Ok(Wake::Packets(packets)),
            () = sleep_for(timeout) => Ok(Wake::TimedOut),
        }
    }

    /// Run `service` to completion on the same device, then resume.
    pub async fn launch<S: Service<D>>(&self, service: S) -> Result<S::Output, Stop> {
        trace!(parent = self.name, child = S::NAME, "sub-service launched");
        let mut child = ServiceContext::new(
            S::NAME,
            Arc::clone(&self.device),
            self.env.clone(),
            self.cancel.clone(),
        );
        service.run(&mut child).await
    }
}

impl<D: WirelessDevice> Drop for ServiceContext<D> {
    fn drop(&mut self) {
        // Ended without request_stop: interrupted or bailed out.
        if self.started_at.is_some() {
            self.record_stop(false, false);
        }
        self.close_rx();
    }
}

async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => pending().await,
    }
}

async fn recv_packets(rx: Option<&mut mpsc::Receiver<Bytes>>, limit: usize) -> Vec<Bytes> {
    let Some(rx) = rx else {
        return pending().await;
    };
    let Some(first) = rx.recv().await else {
        return pending().await;
    };
    let mut packets = vec![first];
    while packets.len() < limit.max(1) {
        match rx.try_recv() {
            Ok(packet) => packets.push(packet),
            Err(_) => break,
        }
    }
    packets
}

async fn first_event(subscriptions: &mut [Subscription]) -> Option<usize> {
    if subscriptions.is_empty() {
        return pending().await;
    }
    let waits = subscriptions
        .iter_mut()
        .enumerate()
        .map(|(index, sub)| Box::pin(async move { sub.recv().await.map(|_| index) }));
    let (fired, _, _) = select_all(waits).await;
    fired
}
