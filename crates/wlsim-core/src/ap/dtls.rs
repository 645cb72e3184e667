// ── DTLS handshake ──
//
// Polls the session with a clamped retransmit timer: every wake without
// input triggers the library's timeout handling and another handshake
// step. Records arrive through this service's receive queue.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::device::{Ap, WirelessDevice};
use crate::dtls::{HandshakeStatus, handshake_wait};
use crate::error::Stop;
use crate::events::WirelessEvent;
use crate::model::ApState;
use crate::service::{Service, ServiceContext, names};
use crate::wire::capwap::{DTLS_HEADER, PREAMBLE_DTLS};
use crate::wire::ether::parse_udp;

const PACKETS_PER_WAKE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsOutcome {
    Established,
    /// Alert, binding failure or timer expiry; the AP is back in DISCOVER.
    Rollback,
}

#[derive(Debug, Default)]
pub struct ServiceApEstablishDtls;

impl Service<Ap> for ServiceApEstablishDtls {
    type Output = DtlsOutcome;

    const NAME: &'static str = names::AP_DTLS;

    async fn run(self, ctx: &mut ServiceContext<Ap>) -> Result<DtlsOutcome, Stop> {
        let ap = Arc::clone(ctx.device());
        ctx.request_start(true, true).await?;
        let deadline = Instant::now() + ctx.config().dtls.timeout;

        loop {
            let (status, records, suggested) = ap.with_dtls(|session| {
                let status = session.do_handshake();
                (status, session.drain(), session.timeout())
            });
            if ap.state() == ApState::Dtls {
                for frame in ap.dtls_frames(records) {
                    ctx.send(frame);
                }
            }
            match status {
                Ok(HandshakeStatus::Finished) => {
                    ap.set_state(ApState::Join);
                    ctx.raise_event(&WirelessEvent::ap_dtls_established(ap.mac()))?;
                    debug!(ap = %ap.mac(), "DTLS established");
                    ctx.request_stop(true, true, true);
                    return Ok(DtlsOutcome::Established);
                }
                Ok(HandshakeStatus::Alert(description)) => {
                    info!(ap = %ap.mac(), alert = %description, "DTLS handshake aborted by peer");
                    return Ok(rollback(ctx, &ap));
                }
                Err(e) => {
                    info!(ap = %ap.mac(), error = %e, "DTLS handshake failed");
                    return Ok(rollback(ctx, &ap));
                }
                Ok(HandshakeStatus::InProgress) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                let timeouts = ap.count_dtls_timeout();
                ctx.add_service_info("dtls_timeouts", timeouts);
                info!(ap = %ap.mac(), timeouts, "DTLS handshake timed out");
                return Ok(rollback(ctx, &ap));
            }
            let wait = handshake_wait(suggested).min(deadline - now);
            let packets = ctx.wait_for_packets(Some(wait), PACKETS_PER_WAKE).await?;
            if packets.is_empty() {
                ap.with_dtls(|session| session.handle_timeout());
                continue;
            }
            ap.with_dtls(|session| {
                for record in packets.iter().filter_map(dtls_record) {
                    session.feed(&record);
                }
            });
        }
    }
}

fn rollback(ctx: &mut ServiceContext<Ap>, ap: &Ap) -> DtlsOutcome {
    ap.set_state(ApState::Discover);
    ctx.request_stop(true, false, true);
    DtlsOutcome::Rollback
}

/// The DTLS record inside a received control frame.
fn dtls_record(frame: &Bytes) -> Option<Bytes> {
    let datagram = parse_udp(frame)?;
    if datagram.payload.first() != Some(&PREAMBLE_DTLS) {
        return None;
    }
    let record = datagram.payload.get(DTLS_HEADER.len()..)?;
    Some(Bytes::copy_from_slice(record))
}
