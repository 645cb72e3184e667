// ── Discovery ──
//
// Holds the join admission slot for the whole attempt: discovery, the
// DTLS handshake and the join sequence run nested inside it.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::control::{RoundTrip, classify};
use super::dtls::{DtlsOutcome, ServiceApEstablishDtls};
use super::join::{JoinOutcome, ServiceApJoinWlc};
use crate::device::{Ap, WirelessDevice};
use crate::error::Stop;
use crate::model::ApState;
use crate::service::{Service, ServiceContext, names};
use crate::wire::capwap::MessageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverOutcome {
    /// The AP reached RUN.
    Joined,
    /// No controller answered (ARP or Discovery).
    RetriesExhausted,
    /// The controller answered Discovery with a failure code.
    Rejected(u32),
    /// A later step failed and the AP is back in DISCOVER.
    Rollback,
}

#[derive(Debug, Default)]
pub struct ServiceApDiscoverWlc;

impl Service<Ap> for ServiceApDiscoverWlc {
    type Output = DiscoverOutcome;

    const NAME: &'static str = names::AP_DISCOVER;

    async fn run(self, ctx: &mut ServiceContext<Ap>) -> Result<DiscoverOutcome, Stop> {
        let ap = Arc::clone(ctx.device());
        ctx.request_start(true, false).await?;

        let attempt = ap.count_discover_attempt();
        if attempt > 1 {
            restart_session(ctx, &ap);
        }
        ap.set_state(ApState::Discover);
        ctx.add_service_info("attempt", attempt);
        let started = Instant::now();

        if !resolve_wlc_mac(ctx, &ap).await? {
            info!(ap = %ap.mac(), wlc = ?ap.wlc_ip(), "controller MAC unresolved, giving up this attempt");
            ctx.request_stop(true, false, false);
            return Ok(DiscoverOutcome::RetriesExhausted);
        }

        let Some(code) = discover(ctx, &ap).await? else {
            info!(ap = %ap.mac(), "no discovery response, staying in DISCOVER");
            ctx.request_stop(true, false, false);
            return Ok(DiscoverOutcome::RetriesExhausted);
        };
        if let RoundTrip::Error(code) = classify(code) {
            warn!(ap = %ap.mac(), result_code = code, "discovery rejected by controller");
            ap.forget_wlc_mac();
            ctx.request_stop(true, false, false);
            return Ok(DiscoverOutcome::Rejected(code));
        }
        debug!(ap = %ap.mac(), wlc = ?ap.wlc_ip(), ac_name = %ap.ac_name(), "controller discovered");

        ap.set_state(ApState::Dtls);
        if ctx.launch(ServiceApEstablishDtls).await? == DtlsOutcome::Rollback {
            ctx.request_stop(true, false, false);
            return Ok(DiscoverOutcome::Rollback);
        }
        if ctx.launch(ServiceApJoinWlc).await? == JoinOutcome::Rollback {
            ctx.request_stop(true, false, false);
            return Ok(DiscoverOutcome::Rollback);
        }

        let join_duration = started.elapsed();
        ap.set_join_duration(join_duration);
        ctx.add_service_info("join_duration", join_duration.as_secs_f64());
        info!(ap = %ap.mac(), join_secs = join_duration.as_secs_f64(), "AP joined");
        ctx.request_stop(true, true, false);
        Ok(DiscoverOutcome::Joined)
    }
}

/// Close out whatever the previous attempt left and start clean.
fn restart_session(ctx: &ServiceContext<Ap>, ap: &Ap) {
    let goodbye = ap.with_dtls(|session| {
        if session.is_handshake_finished() && !session.is_shutdown() {
            // Best effort: the controller may already be gone.
            let _ = session.shutdown();
            session.drain()
        } else {
            Vec::new()
        }
    });
    for frame in ap.dtls_frames(goodbye) {
        ctx.send(frame);
    }
    ap.renew_dtls();
    ap.reset_session_state();
}

/// ARP for the controller while only its IP is known. Returns false when
/// every request went unanswered.
async fn resolve_wlc_mac(ctx: &ServiceContext<Ap>, ap: &Arc<Ap>) -> Result<bool, Stop> {
    if ap.wlc_mac().is_some() {
        return Ok(true);
    }
    let timers = ctx.config().capwap.clone();
    let mut wait = timers.retransmit_interval;
    for _ in 0..timers.max_retransmit {
        // No controller address: discovery goes out as broadcast.
        let Some(request) = ap.wlc_arp_request() else {
            return Ok(true);
        };
        ctx.send(request);
        let resolved = ctx
            .wait_until(Instant::now() + wait, || ap.wlc_mac())
            .await?;
        if let Some(mac) = resolved {
            debug!(ap = %ap.mac(), wlc_mac = %mac, "controller MAC resolved");
            return Ok(true);
        }
        wait = wait.saturating_mul(2);
    }
    Ok(false)
}

/// Discovery requests with doubling waits. `Some(code)` once a response
/// arrived, `None` when every request went unanswered.
async fn discover(ctx: &ServiceContext<Ap>, ap: &Arc<Ap>) -> Result<Option<Option<u32>>, Stop> {
    let timers = ctx.config().capwap.clone();
    let mut wait = timers.retransmit_interval;
    for attempt in 1..=timers.max_retransmit {
        ap.expect_response(MessageType::DiscoveryResponse);
        ctx.send(ap.discovery_frame());
        let response = ctx
            .wait_until(Instant::now() + wait, || {
                ap.take_response(MessageType::DiscoveryResponse)
            })
            .await?;
        if response.is_some() {
            return Ok(response);
        }
        debug!(ap = %ap.mac(), attempt, "no discovery response");
        wait = wait.saturating_mul(2);
    }
    Ok(None)
}
