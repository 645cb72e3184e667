//! Cooperative service primitive.
//!
//! A service is an async routine bound to one device. Everything it may
//! wait on goes through its [`ServiceContext`]: a timer, received packets,
//! events of related devices, a nested service, or an admission slot. Each
//! of those waits also watches the device's interrupt token and returns
//! [`Stop::Interrupted`] when it fires, so `?` unwinds the whole stack of
//! nested services and `Drop` releases what they held.

mod admission;
mod context;
mod env;
mod info;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error};

pub use admission::{Admission, AdmissionPermit, Admissions};
pub use context::ServiceContext;
pub use env::ServiceEnv;
pub use info::ServicesInfo;

use crate::device::WirelessDevice;
use crate::error::{CoreError, Stop};
use crate::events::WirelessEvent;

/// Names services register under; also the `services_info` keys.
pub mod names {
    pub const AP_DISCOVER: &str = "ServiceAPDiscoverWLC";
    pub const AP_DTLS: &str = "ServiceAPEstablishDTLS";
    pub const AP_JOIN: &str = "ServiceAPJoinWLC";
    pub const AP_RUN: &str = "ServiceAPRun";
    pub const AP_SHUTDOWN: &str = "ServiceAPShutdown";
    pub const CLIENT_ASSOCIATION: &str = "ClientServiceAssociation";
    pub const CLIENT_DHCP: &str = "ClientServiceDHCP";
}

/// A resumable routine over a device of type `D`.
pub trait Service<D: WirelessDevice>: Send + Sized {
    type Output: Send;

    /// Registration name, admission class and `services_info` key.
    const NAME: &'static str;

    fn run(
        self,
        ctx: &mut ServiceContext<D>,
    ) -> impl Future<Output = Result<Self::Output, Stop>> + Send;
}

/// What woke a multi-source wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake {
    Packets(Vec<Bytes>),
    Event(WirelessEvent),
    /// The device was poked: a flag changed that the service should re-check.
    Woken,
    TimedOut,
}

/// How a top-level service run ended, from the caller's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResult<T> {
    Completed(T),
    Interrupted,
}

/// Run `service` on `device` to completion.
///
/// Interruption comes back as [`ServiceResult::Interrupted`]; only contract
/// violations surface as `Err`.
pub async fn run_service<D, S>(
    device: Arc<D>,
    env: ServiceEnv,
    service: S,
) -> Result<ServiceResult<S::Output>, CoreError>
where
    D: WirelessDevice,
    S: Service<D>,
{
    let mac = device.mac();
    let cancel = device.core().cancel_token();
    let mut ctx = ServiceContext::new(S::NAME, device, env, cancel);
    debug!(device = %mac, service = S::NAME, "service started");
    match service.run(&mut ctx).await {
        Ok(output) => {
            debug!(device = %mac, service = S::NAME, "service completed");
            Ok(ServiceResult::Completed(output))
        }
        Err(Stop::Interrupted) => {
            debug!(device = %mac, service = S::NAME, "service interrupted");
            Ok(ServiceResult::Interrupted)
        }
        Err(Stop::Contract(e)) => {
            error!(device = %mac, service = S::NAME, error = %e, "service violated its contract");
            Err(e)
        }
    }
}
