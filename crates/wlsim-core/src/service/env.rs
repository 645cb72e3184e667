// ── Service environment ──
//
// What every service of one worker shares: the transmit sink, the broker,
// the configuration and the admission registry. Cloning is cheap.

use std::sync::Arc;

use bytes::Bytes;

use super::admission::Admissions;
use crate::config::WirelessConfig;
use crate::pubsub::BrokerHandle;
use crate::sink::PacketSink;

struct EnvInner {
    sink: Arc<dyn PacketSink>,
    bus: BrokerHandle,
    config: WirelessConfig,
    admissions: Admissions,
}

#[derive(Clone)]
pub struct ServiceEnv {
    inner: Arc<EnvInner>,
}

impl ServiceEnv {
    /// Admission ceilings come from `config.concurrency`.
    pub fn new(sink: Arc<dyn PacketSink>, bus: BrokerHandle, config: WirelessConfig) -> Self {
        let admissions = Admissions::from_limits(&config.concurrency);
        Self {
            inner: Arc::new(EnvInner {
                sink,
                bus,
                config,
                admissions,
            }),
        }
    }

    pub fn send(&self, packet: Bytes) {
        self.inner.sink.send(packet);
    }

    pub fn bus(&self) -> &BrokerHandle {
        &self.inner.bus
    }

    pub fn config(&self) -> &WirelessConfig {
        &self.inner.config
    }

    pub fn admissions(&self) -> &Admissions {
        &self.inner.admissions
    }
}
