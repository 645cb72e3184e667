// ── Runtime emulation configuration ──
//
// Timers, retry budgets and admission ceilings consumed by the state
// machines. Read-only to the core, which never touches disk: the embedding
// layer builds a `WirelessConfig` and hands it in.

use std::net::Ipv4Addr;
use std::time::Duration;

/// CAPWAP control-channel timers.
#[derive(Debug, Clone, PartialEq)]
pub struct CapwapTimers {
    /// First wait of every control round-trip; doubled on each retry.
    pub retransmit_interval: Duration,
    /// Transmissions attempted before a round-trip counts as timed out.
    pub max_retransmit: u32,
    /// Spacing of Echo requests in RUN.
    pub echo_interval: Duration,
    /// How long JOIN waits for the controller to push an SSID.
    pub ssid_timeout: Duration,
}

impl Default for CapwapTimers {
    fn default() -> Self {
        Self {
            retransmit_interval: Duration::from_secs(1),
            max_retransmit: 3,
            echo_interval: Duration::from_secs(60),
            ssid_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DtlsTimers {
    /// Overall budget for one handshake attempt.
    pub timeout: Duration,
    /// Close-notify retries before the session is abandoned.
    pub shutdown_max_retransmit: u32,
}

impl Default for DtlsTimers {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            shutdown_max_retransmit: 3,
        }
    }
}

/// Client association backoff: wait `slot_time^(retries + 1)` seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationTimers {
    pub slot_time: f64,
    pub max_retries: u32,
}

impl Default for AssociationTimers {
    fn default() -> Self {
        Self {
            slot_time: 2.0,
            max_retries: 5,
        }
    }
}

/// Client DHCP backoff, on the same slot-time curve as association.
#[derive(Debug, Clone, PartialEq)]
pub struct DhcpTimers {
    pub slot_time: f64,
    /// Unanswered rounds before the exchange starts over from DISCOVER.
    pub max_retries: u32,
    /// Pause after a DHCPNAK before discovering again.
    pub nak_wait: Duration,
}

impl Default for DhcpTimers {
    fn default() -> Self {
        Self {
            slot_time: 2.0,
            max_retries: 3,
            nak_wait: Duration::from_secs(1),
        }
    }
}

/// Per-class admission ceilings. `None` means unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionLimits {
    pub ap_join: Option<usize>,
    pub client_association: Option<usize>,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            ap_join: Some(50),
            client_association: None,
        }
    }
}

/// Identity strings an AP advertises in Discovery and Join requests.
#[derive(Debug, Clone, PartialEq)]
pub struct ApIdentity {
    pub serial_number: String,
    pub model: String,
    pub location: String,
    pub country: String,
    pub software_version: [u8; 4],
}

impl Default for ApIdentity {
    fn default() -> Self {
        Self {
            serial_number: "FCZ1853QQQ".into(),
            model: "AIR-CAP3702I-E-K9".into(),
            location: "default location".into(),
            country: "CH ".into(),
            software_version: [8, 3, 102, 0],
        }
    }
}

/// Everything the emulation core reads at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct WirelessConfig {
    pub capwap: CapwapTimers,
    pub dtls: DtlsTimers,
    pub client: AssociationTimers,
    pub dhcp: DhcpTimers,
    pub concurrency: AdmissionLimits,
    pub identity: ApIdentity,
    /// Controller address. Discovery is broadcast when unset.
    pub wlc_ip: Option<Ipv4Addr>,
    /// Per-service receive queue depth; newer packets are dropped when full.
    pub rx_queue_len: usize,
}

impl Default for WirelessConfig {
    fn default() -> Self {
        Self {
            capwap: CapwapTimers::default(),
            dtls: DtlsTimers::default(),
            client: AssociationTimers::default(),
            dhcp: DhcpTimers::default(),
            concurrency: AdmissionLimits::default(),
            identity: ApIdentity::default(),
            wlc_ip: None,
            rx_queue_len: 100,
        }
    }
}
