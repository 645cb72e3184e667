// ── Scoped publisher ──

use serde_json::Value;

use super::broker::BrokerHandle;
use super::topic::Topic;

/// Publishes under a fixed topic prefix, typically a device's namespace.
#[derive(Clone)]
pub struct Publisher {
    bus: BrokerHandle,
    prefix: Topic,
}

impl Publisher {
    pub(super) fn new(bus: BrokerHandle, prefix: Topic) -> Self {
        Self { bus, prefix }
    }

    pub fn prefix(&self) -> &Topic {
        &self.prefix
    }

    /// Publish `value` on `prefix + sub_topic`.
    pub fn publish(&self, sub_topic: &Topic, value: Value) {
        self.bus.publish(self.prefix.join(sub_topic), value);
    }

    /// A publisher one level deeper.
    pub fn sub_publisher(&self, segment: impl Into<String>) -> Self {
        Self {
            bus: self.bus.clone(),
            prefix: self.prefix.child(segment),
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
