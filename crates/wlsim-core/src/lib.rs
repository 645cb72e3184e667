//! Wireless access point and client emulation over CAPWAP.
//!
//! Thousands of emulated APs discover a controller, bring up DTLS, join
//! and keep their session alive, while their clients associate through
//! them. Every AP and client phase is a [`service::Service`]: an async
//! routine whose waits all go through a [`service::ServiceContext`], so a
//! device interrupt unwinds any of them cleanly. Devices talk to each
//! other only through the [`pubsub`] broker.
//!
//! The core owns no sockets and no TLS library. Frames go out through a
//! [`PacketSink`], come in through [`Worker::handle_packet`], and DTLS is
//! provided by a [`DtlsConnector`].

pub mod ap;
pub mod client;
pub mod config;
pub mod device;
pub mod dtls;
pub mod error;
pub mod events;
pub mod model;
pub mod pubsub;
pub mod service;
pub mod sink;
pub mod wire;
pub mod worker;

pub use config::{
    AdmissionLimits, ApIdentity, AssociationTimers, CapwapTimers, DhcpTimers, DtlsTimers, WirelessConfig,
};
pub use device::{Ap, ApSettings, Client, ClientSettings, WirelessDevice};
pub use dtls::{DtlsConnector, DtlsSession};
pub use error::{CoreError, Stop};
pub use events::WirelessEvent;
pub use model::{ApState, ClientState, DhcpLease, MacAddress, Vap};
pub use pubsub::{Broker, BrokerHandle, Topic};
pub use service::{ServiceEnv, ServiceResult};
pub use sink::{ChannelSink, PacketSink};
pub use worker::Worker;
