// ── Device state enums ──

use serde::Serialize;
use strum::{Display, IntoStaticStr};

/// CAPWAP join progress of an access point.
///
/// Variants are declared in protocol order, so `Ord` compares progress.
/// The only backwards move is the rollback to [`ApState::Discover`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApState {
    Init,
    Discover,
    Dtls,
    Join,
    Run,
    Closing,
    Closed,
}

impl ApState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Progress is one step at a time. A session in DTLS, JOIN or RUN may
    /// roll back to DISCOVER or start closing; CLOSED is reachable from
    /// anywhere else.
    pub fn can_advance_to(self, next: Self) -> bool {
        let established = matches!(self, Self::Dtls | Self::Join | Self::Run);
        match next {
            Self::Discover => self == Self::Init || established,
            Self::Closing => established,
            Self::Closed => self != Self::Closed,
            _ => next as u8 == self as u8 + 1,
        }
    }

    pub fn is_joined(self) -> bool {
        self == Self::Run
    }

    /// DTLS is up from JOIN until the close-notify has been sent.
    pub fn has_dtls_session(self) -> bool {
        matches!(self, Self::Join | Self::Run | Self::Closing)
    }
}

/// Association progress of a wireless client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    Association,
    IpLearn,
    Run,
}
