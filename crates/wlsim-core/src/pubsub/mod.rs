//! Topic-addressed message routing between device services.
//!
//! A single [`Broker`] task owns the subscription registry. Producers talk to
//! it through a cloneable [`BrokerHandle`]; nothing outside the broker task
//! ever touches the registry, so it needs no lock.
//!
//! A message published on topic `a.b.c` reaches every subscription whose
//! topic is a prefix of it (`a`, `a.b`, `a.b.c`) and whose optional
//! predicate accepts the payload.

mod broker;
mod publisher;
mod topic;
mod trie;

pub use broker::{Broker, BrokerHandle, Predicate, PubSubMessage, Subscription, SubscriptionId};
pub use publisher::Publisher;
pub use topic::Topic;
