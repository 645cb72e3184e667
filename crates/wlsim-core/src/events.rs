// ── Wireless service events ──
//
// Events are published on the raising device's topic namespace as
// `<device-mac>.<service>.<value>` and awaited by the device itself or
// by devices attached to it. New event kinds need no broker changes.

use serde::Serialize;
use serde_json::{Value, json};

use crate::model::MacAddress;
use crate::pubsub::Topic;

/// Service name the AP lifecycle events are raised under.
pub const AP_EVENT_SERVICE: &str = "ServiceAPRun";
/// Service name the client association events are raised under.
pub const CLIENT_EVENT_SERVICE: &str = "ClientServiceAssociation";
/// Service name the client lease event is raised under.
pub const DHCP_EVENT_SERVICE: &str = "ClientServiceDHCP";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WirelessEvent {
    pub service: String,
    pub device: MacAddress,
    pub value: String,
}

impl WirelessEvent {
    pub fn new(service: impl Into<String>, device: MacAddress, value: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            device,
            value: value.into(),
        }
    }

    /// Full topic path, device namespace first.
    pub fn topic(&self) -> Topic {
        Topic::new([self.device.to_string()]).join(&self.sub_topic())
    }

    /// Path below the device namespace.
    pub fn sub_topic(&self) -> Topic {
        Topic::new([self.service.as_str(), self.value.as_str()])
    }

    pub fn payload(&self) -> Value {
        json!({
            "service": self.service,
            "device": self.device.to_string(),
            "value": self.value,
        })
    }

    // ── AP events ──

    pub fn ap_joined(ap: MacAddress) -> Self {
        Self::new(AP_EVENT_SERVICE, ap, "joined")
    }

    pub fn ap_disconnected(ap: MacAddress) -> Self {
        Self::new(AP_EVENT_SERVICE, ap, "disconnected")
    }

    pub fn ap_vap_received(ap: MacAddress) -> Self {
        Self::new(AP_EVENT_SERVICE, ap, "vap_received")
    }

    pub fn ap_dtls_established(ap: MacAddress) -> Self {
        Self::new(AP_EVENT_SERVICE, ap, "established")
    }

    // ── Client events ──

    pub fn client_associated(device: MacAddress) -> Self {
        Self::new(CLIENT_EVENT_SERVICE, device, "associated")
    }

    pub fn client_deassociated(device: MacAddress) -> Self {
        Self::new(CLIENT_EVENT_SERVICE, device, "deassociated")
    }

    pub fn client_dhcp_done(device: MacAddress) -> Self {
        Self::new(DHCP_EVENT_SERVICE, device, "dhcp_done")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_device_then_service_then_value() {
        let mac = MacAddress::new([0, 1, 2, 3, 4, 5]);
        let event = WirelessEvent::ap_joined(mac);
        assert_eq!(
            event.topic(),
            Topic::new(["00:01:02:03:04:05", "ServiceAPRun", "joined"])
        );
        assert_eq!(event.payload()["value"], "joined");
    }
}
