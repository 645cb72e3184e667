//! Access point state machine.
//!
//! INIT → DISCOVER → DTLS → JOIN → RUN, with a rollback to DISCOVER on any
//! failure, and CLOSING → CLOSED on request. Each phase is a service;
//! [`drive_ap`] strings them together for the lifetime of the AP.

mod control;
mod discover;
mod dtls;
mod join;
mod run;
mod shutdown;

use std::sync::Arc;

use tracing::debug;

pub use control::{RoundTrip, classify, control_round_trip};
pub use discover::{DiscoverOutcome, ServiceApDiscoverWlc};
pub use dtls::{DtlsOutcome, ServiceApEstablishDtls};
pub use join::{JoinOutcome, ServiceApJoinWlc};
pub use run::{RunOutcome, ServiceApRun};
pub use shutdown::ServiceApShutdown;

use crate::device::{Ap, WirelessDevice};
use crate::error::CoreError;
use crate::model::ApState;
use crate::service::{ServiceEnv, ServiceResult, run_service};

/// Keep an AP joined: rediscover after every failure, run once joined.
///
/// Returns when the AP is interrupted or closed. Only contract violations
/// come back as errors.
pub async fn drive_ap(ap: Arc<Ap>, env: ServiceEnv) -> Result<(), CoreError> {
    let pause = env.config().capwap.retransmit_interval;
    loop {
        if ap.state() == ApState::Closed {
            return Ok(());
        }
        let cancel = ap.core().cancel_token();

        match run_service(Arc::clone(&ap), env.clone(), ServiceApDiscoverWlc).await? {
            ServiceResult::Interrupted => return Ok(()),
            ServiceResult::Completed(DiscoverOutcome::Joined) => {}
            ServiceResult::Completed(outcome) => {
                debug!(ap = %ap.mac(), ?outcome, "not joined, rediscovering");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(pause) => {}
                }
                continue;
            }
        }

        match run_service(Arc::clone(&ap), env.clone(), ServiceApRun).await? {
            ServiceResult::Interrupted => return Ok(()),
            ServiceResult::Completed(outcome) => {
                debug!(ap = %ap.mac(), ?outcome, "left RUN, rediscovering");
            }
        }
    }
}
