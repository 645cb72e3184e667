// ── Core error types ──
//
// Contract violations, codec failures and DTLS binding failures.
// Protocol timeouts and rejected result codes are NOT errors: the state
// machines carry them as outcome values and roll back on their own.

use thiserror::Error;

use crate::model::MacAddress;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Contract violations ──────────────────────────────────────────
    #[error("{service} on {device} may not wait on events of unrelated device {target}")]
    EventOutOfScope {
        service: &'static str,
        device: MacAddress,
        target: MacAddress,
    },

    #[error("{service} waited for packets without requesting them at start")]
    PacketsNotRequested { service: &'static str },

    #[error("device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    #[error("device already registered: {mac}")]
    DuplicateDevice { mac: MacAddress },

    #[error("{service} is already running on {device}")]
    ServiceAlreadyRunning {
        service: &'static str,
        device: MacAddress,
    },

    // ── Codec errors ─────────────────────────────────────────────────
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    // ── DTLS binding ─────────────────────────────────────────────────
    #[error("DTLS session error: {message}")]
    Dtls { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a service left its body early.
///
/// Every suspension point returns this on its error branch so services can
/// unwind with `?`. Cleanup runs through `Drop` on either variant.
#[derive(Debug, Error)]
pub enum Stop {
    /// The device was interrupted (forced shutdown). Not a failure.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Contract(#[from] CoreError),
}
