// ── Virtual access points ──
//
// A VAP is one SSID served on one radio slot. The AP learns them from
// IEEE 802.11 Add WLAN elements and forgets them on Delete WLAN.

use serde::Serialize;

/// Composite key of a VAP: `(slot_id, vap_id)`.
pub type VapKey = (u8, u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptPolicy {
    /// Open system authentication, no key.
    Open,
    /// Any keyed or non-open authentication.
    Protected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vap {
    pub ssid: String,
    pub slot_id: u8,
    pub vap_id: u8,
    pub encrypt_policy: EncryptPolicy,
}

impl Vap {
    pub fn key(&self) -> VapKey {
        (self.slot_id, self.vap_id)
    }

    pub fn is_open(&self) -> bool {
        self.encrypt_policy == EncryptPolicy::Open
    }
}
