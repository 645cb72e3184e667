// ── Shutdown ──
//
// Orderly teardown requested by the orchestrator. Sends close-notify
// until the session reports shutdown or the retry budget runs out.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::device::{Ap, WirelessDevice};
use crate::dtls::{ShutdownStatus, handshake_wait};
use crate::error::Stop;
use crate::events::WirelessEvent;
use crate::model::ApState;
use crate::service::{Service, ServiceContext, names};

#[derive(Debug, Default)]
pub struct ServiceApShutdown;

impl Service<Ap> for ServiceApShutdown {
    /// Final state, always CLOSED.
    type Output = ApState;

    const NAME: &'static str = names::AP_SHUTDOWN;

    async fn run(self, ctx: &mut ServiceContext<Ap>) -> Result<ApState, Stop> {
        let ap = Arc::clone(ctx.device());
        ctx.request_start(true, false).await?;
        ctx.raise_event(&WirelessEvent::ap_disconnected(ap.mac()))?;
        ap.disconnect_clients();

        let state = ap.state();
        if state <= ApState::Discover || state == ApState::Closed {
            // No session was ever established.
            ap.set_state(ApState::Closed);
            ctx.request_stop(true, true, true);
            return Ok(ApState::Closed);
        }

        ap.set_state(ApState::Closing);
        let retries = ctx.config().dtls.shutdown_max_retransmit;
        let mut closed = false;
        for attempt in 0..=retries {
            let (status, records, suggested) = ap.with_dtls(|session| {
                let status = session.shutdown();
                (status, session.drain(), session.timeout())
            });
            for frame in ap.dtls_frames(records) {
                ctx.send(frame);
            }
            match status {
                Ok(ShutdownStatus::Complete) => {
                    closed = true;
                    break;
                }
                Ok(ShutdownStatus::InProgress) => {}
                Err(e) => {
                    debug!(ap = %ap.mac(), error = %e, "DTLS shutdown failed");
                    break;
                }
            }
            if attempt == retries {
                break;
            }
            let deadline = Instant::now() + handshake_wait(suggested);
            let peer_closed = ctx
                .wait_until(deadline, || ap.with_dtls(|session| session.is_shutdown()).then_some(()))
                .await?;
            if peer_closed.is_some() {
                closed = true;
                break;
            }
        }

        if !closed {
            info!(ap = %ap.mac(), retries, "close-notify unanswered, closing anyway");
        }
        ap.set_state(ApState::Closed);
        ap.reset_session_state();
        ctx.request_stop(true, closed, true);
        Ok(ApState::Closed)
    }
}
