// ── Domain model ──
//
// Identity and state types shared by every device and service.

pub mod lease;
pub mod mac;
pub mod state;
pub mod vap;

pub use lease::DhcpLease;
pub use mac::MacAddress;
pub use state::{ApState, ClientState};
pub use vap::{EncryptPolicy, Vap, VapKey};
