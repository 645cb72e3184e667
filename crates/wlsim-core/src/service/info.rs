// ── Services info bag ──
//
// Per-device, per-service key/value self-reporting. Services write it;
// the orchestrator reads it to report join success, failure and duration.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde_json::{Map, Value};

#[derive(Debug, Default)]
pub struct ServicesInfo {
    services: DashMap<String, Map<String, Value>>,
}

impl ServicesInfo {
    pub fn set(&self, service: &str, key: &str, value: impl Into<Value>) {
        self.services
            .entry(service.to_owned())
            .or_default()
            .insert(key.to_owned(), value.into());
    }

    pub fn get(&self, service: &str, key: &str) -> Option<Value> {
        self.services.get(service)?.get(key).cloned()
    }

    pub fn service(&self, service: &str) -> Option<Map<String, Value>> {
        self.services.get(service).map(|entry| entry.value().clone())
    }

    /// Ordered copy of everything, ready for serialization.
    pub fn snapshot(&self) -> BTreeMap<String, Map<String, Value>> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
