// ── Join ──
//
// Strict order: Join, Configuration Status, Change State Event per radio,
// an SSID from the controller, then a data-channel keep-alive. Any step
// failing sends the AP back to DISCOVER.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use super::control::{RoundTrip, control_round_trip};
use crate::device::{Ap, WirelessDevice};
use crate::error::Stop;
use crate::model::ApState;
use crate::service::{Service, ServiceContext, names};
use crate::wire::capwap::{self, MessageType, RADIO_IDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Rollback,
}

#[derive(Debug, Default)]
pub struct ServiceApJoinWlc;

impl Service<Ap> for ServiceApJoinWlc {
    type Output = JoinOutcome;

    const NAME: &'static str = names::AP_JOIN;

    async fn run(self, ctx: &mut ServiceContext<Ap>) -> Result<JoinOutcome, Stop> {
        let ap = Arc::clone(ctx.device());
        ctx.request_start(true, false).await?;

        let join = ap.join_request();
        if !step(ctx, &ap, &join, MessageType::JoinResponse).await? {
            return Ok(rollback(ctx, &ap));
        }

        let status = capwap::config_status_request(ap.next_capwap_seq(), &ap.ac_name());
        if !step(ctx, &ap, &status, MessageType::ConfigStatusResponse).await? {
            return Ok(rollback(ctx, &ap));
        }

        for radio_id in RADIO_IDS {
            let change = capwap::change_state_request(ap.next_capwap_seq(), radio_id);
            if !step(ctx, &ap, &change, MessageType::ChangeStateResponse).await? {
                return Ok(rollback(ctx, &ap));
            }
        }

        let ssid_deadline = Instant::now() + ctx.config().capwap.ssid_timeout;
        let got_ssid = ctx
            .wait_until(ssid_deadline, || {
                if ap.got_disconnect() {
                    return Some(false);
                }
                ap.has_vaps().then_some(true)
            })
            .await?;
        if got_ssid != Some(true) {
            info!(ap = %ap.mac(), "no SSID received from controller");
            return Ok(rollback(ctx, &ap));
        }

        if !keep_alive(ctx, &ap).await? {
            info!(ap = %ap.mac(), "keep-alive unanswered");
            return Ok(rollback(ctx, &ap));
        }

        ap.set_state(ApState::Run);
        ctx.request_stop(true, true, false);
        Ok(JoinOutcome::Joined)
    }
}

async fn step(
    ctx: &mut ServiceContext<Ap>,
    ap: &Ap,
    request: &[u8],
    expected: MessageType,
) -> Result<bool, Stop> {
    let outcome = control_round_trip(ctx, request, expected).await?;
    if outcome != RoundTrip::Good {
        debug!(ap = %ap.mac(), %expected, ?outcome, "join step failed");
    }
    Ok(outcome.is_good())
}

/// Keep-alive with doubling waits until the controller echoes one back.
async fn keep_alive(ctx: &ServiceContext<Ap>, ap: &Arc<Ap>) -> Result<bool, Stop> {
    let timers = ctx.config().capwap.clone();
    let mut wait = timers.retransmit_interval;
    for _ in 0..timers.max_retransmit {
        ap.await_keep_alive();
        ctx.send(ap.keep_alive_frame());
        let answered = ctx
            .wait_until(Instant::now() + wait, || ap.got_keep_alive().then_some(()))
            .await?;
        if answered.is_some() {
            return Ok(true);
        }
        wait = wait.saturating_mul(2);
    }
    Ok(false)
}

fn rollback(ctx: &mut ServiceContext<Ap>, ap: &Ap) -> JoinOutcome {
    ap.set_state(ApState::Discover);
    ctx.request_stop(true, false, false);
    JoinOutcome::Rollback
}
