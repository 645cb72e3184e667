//! Wireless client state machine: ASSOCIATION → IP_LEARN → RUN, with a
//! DHCP exchange during IP_LEARN for clients without a static address.

mod association;
mod dhcp;

pub use association::{
    AssociationOutcome, ClientServiceAssociation, association_backoff, backoff_seed, slot_backoff,
};
pub use dhcp::{ClientServiceDhcp, DhcpOutcome};
