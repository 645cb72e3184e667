// ── Run ──
//
// Echo keep-alive loop of a joined AP. Ends on a controller-initiated
// disconnect or when echoes go unanswered, taking the clients down too.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use super::control::{RoundTrip, control_round_trip};
use crate::device::{Ap, WirelessDevice};
use crate::error::Stop;
use crate::events::WirelessEvent;
use crate::model::ApState;
use crate::service::{Service, ServiceContext, names};
use crate::wire::capwap::{self, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reset, DTLS alert or a broken session.
    Disconnected,
    /// Echo requests went unanswered `max_retransmit` times.
    EchoTimeout,
}

#[derive(Debug, Default)]
pub struct ServiceApRun;

impl Service<Ap> for ServiceApRun {
    type Output = RunOutcome;

    const NAME: &'static str = names::AP_RUN;

    async fn run(self, ctx: &mut ServiceContext<Ap>) -> Result<RunOutcome, Stop> {
        let ap = Arc::clone(ctx.device());
        ctx.request_start(true, false).await?;
        ctx.raise_event(&WirelessEvent::ap_joined(ap.mac()))?;
        let echo_interval = ctx.config().capwap.echo_interval;

        loop {
            let disconnected = ctx
                .wait_until(Instant::now() + echo_interval, || ap.got_disconnect().then_some(()))
                .await?;
            if disconnected.is_some() {
                return disconnect(ctx, &ap, RunOutcome::Disconnected);
            }

            let echo = capwap::echo_request(ap.next_capwap_seq());
            match control_round_trip(ctx, &echo, MessageType::EchoResponse).await? {
                RoundTrip::Good | RoundTrip::Error(_) => debug!(ap = %ap.mac(), "echo answered"),
                RoundTrip::Timeout => {
                    info!(ap = %ap.mac(), "echo timed out, controller lost");
                    return disconnect(ctx, &ap, RunOutcome::EchoTimeout);
                }
                RoundTrip::DtlsBroke => return disconnect(ctx, &ap, RunOutcome::Disconnected),
            }
        }
    }
}

fn disconnect(ctx: &mut ServiceContext<Ap>, ap: &Ap, outcome: RunOutcome) -> Result<RunOutcome, Stop> {
    ctx.raise_event(&WirelessEvent::ap_disconnected(ap.mac()))?;
    let clients = ap.disconnect_clients();
    ap.set_state(ApState::Discover);
    info!(ap = %ap.mac(), ?outcome, clients, "AP disconnected");
    ctx.request_stop(true, false, false);
    Ok(outcome)
}
