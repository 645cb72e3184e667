// ── Control round-trip ──
//
// One request, one typed response, exponential backoff. Join,
// Configuration Status, Change State Event and Echo all go through here.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::{Ap, WirelessDevice};
use crate::error::Stop;
use crate::service::ServiceContext;
use crate::wire::capwap::MessageType;

/// Result codes the controller may answer with on success.
const GOOD_RESULT_CODES: [u32; 2] = [0, 2];

/// Outcome of one control exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundTrip {
    Good,
    /// The controller answered with a failure code. Not retried.
    Error(u32),
    /// No answer after every retransmission.
    Timeout,
    /// The session went away while waiting.
    DtlsBroke,
}

impl RoundTrip {
    pub fn is_good(self) -> bool {
        self == Self::Good
    }
}

/// Classify a response's result code. A missing code counts as success.
pub fn classify(code: Option<u32>) -> RoundTrip {
    match code {
        None => RoundTrip::Good,
        Some(code) if GOOD_RESULT_CODES.contains(&code) => RoundTrip::Good,
        Some(code) => RoundTrip::Error(code),
    }
}

/// Send the encrypted `request` until a response of type `expected` comes
/// back. The first wait is `retransmit_interval`, doubled on each retry,
/// for at most `max_retransmit` transmissions.
pub async fn control_round_trip(
    ctx: &mut ServiceContext<Ap>,
    request: &[u8],
    expected: MessageType,
) -> Result<RoundTrip, Stop> {
    let ap = Arc::clone(ctx.device());
    let timers = ctx.config().capwap.clone();
    let mut wait = timers.retransmit_interval;

    for attempt in 1..=timers.max_retransmit {
        if !ap.state().has_dtls_session() || ap.got_disconnect() {
            return Ok(RoundTrip::DtlsBroke);
        }
        ap.expect_response(expected);
        let frames = match ap.encrypt_control(request) {
            Ok(frames) => frames,
            Err(e) => {
                debug!(ap = %ap.mac(), error = %e, "could not encrypt control request");
                return Ok(RoundTrip::DtlsBroke);
            }
        };
        for frame in frames {
            ctx.send(frame);
        }

        let deadline = Instant::now() + wait;
        let reply = ctx
            .wait_until(deadline, || {
                if ap.got_disconnect() {
                    return Some(None);
                }
                ap.take_response(expected).map(Some)
            })
            .await?;
        match reply {
            Some(Some(code)) => {
                let outcome = classify(code);
                if let RoundTrip::Error(code) = outcome {
                    warn!(ap = %ap.mac(), %expected, result_code = code, "controller rejected request");
                }
                return Ok(outcome);
            }
            Some(None) => return Ok(RoundTrip::DtlsBroke),
            None => debug!(ap = %ap.mac(), %expected, attempt, "no response, retransmitting"),
        }
        wait = wait.saturating_mul(2);
    }

    info!(ap = %ap.mac(), %expected, attempts = timers.max_retransmit, "control round-trip timed out");
    Ok(RoundTrip::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_two_and_missing_codes_are_good() {
        assert_eq!(classify(None), RoundTrip::Good);
        assert_eq!(classify(Some(0)), RoundTrip::Good);
        assert_eq!(classify(Some(2)), RoundTrip::Good);
    }

    #[test]
    fn other_codes_are_errors() {
        assert_eq!(classify(Some(1)), RoundTrip::Error(1));
        assert_eq!(classify(Some(5)), RoundTrip::Error(5));
        assert!(!classify(Some(5)).is_good());
    }
}
