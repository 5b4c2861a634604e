//! C6 — formatter cache. One transformer per `(deviceId, serviceId)` pair,
//! constructed lazily on first use and kept for the life of the owning
//! session.
//!
//! The external transformer library (spec.md §1 calls it out as a black box)
//! is modeled as a trait object so the cache and its invalidation rules are
//! testable without a live dependency. `PassthroughTransformer` is the only
//! concrete implementation — it exists to exercise the cache, not to encode
//! real device-specific transform logic.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::UpstreamError;

/// Transforms values between wire shape and device-native shape. Real
/// implementations would be supplied by the (out of scope) external
/// transformer library, keyed by the device's declared IoT type.
pub trait Transformer: Send + Sync {
    fn to_device(&self, value: &Value) -> Result<Value, UpstreamError>;
    fn from_device(&self, value: &Value) -> Result<Value, UpstreamError>;
}

/// No-op transformer: wire shape is device-native shape.
pub struct PassthroughTransformer;

impl Transformer for PassthroughTransformer {
    fn to_device(&self, value: &Value) -> Result<Value, UpstreamError> {
        Ok(value.clone())
    }

    fn from_device(&self, value: &Value) -> Result<Value, UpstreamError> {
        Ok(value.clone())
    }
}

/// Per-session cache of `deviceId.serviceId` → transformer. No eviction
/// during a session's lifetime: bounded by the client's declared
/// device×service count, which is small and fixed at handshake time.
#[derive(Default)]
pub struct FormatterCache {
    entries: HashMap<String, Arc<dyn Transformer>>,
}

impl FormatterCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(device_id: &str, service_id: &str) -> String {
        format!("{device_id}.{service_id}")
    }

    /// Look up (or lazily construct via `build`) the transformer for this
    /// device/service pair.
    pub fn get_or_build<F>(&mut self, device_id: &str, service_id: &str, build: F) -> Arc<dyn Transformer>
    where
        F: FnOnce() -> Arc<dyn Transformer>,
    {
        let key = Self::key(device_id, service_id);
        self.entries.entry(key).or_insert_with(build).clone()
    }

    /// Construct (if absent) using the default passthrough transformer.
    pub fn get_or_default(&mut self, device_id: &str, service_id: &str) -> Arc<dyn Transformer> {
        self.get_or_build(device_id, service_id, || Arc::new(PassthroughTransformer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_by_device_and_service_pair() {
        let mut cache = FormatterCache::new();
        let a = cache.get_or_default("dev1", "svc1");
        let b = cache.get_or_default("dev1", "svc1");
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.get_or_default("dev1", "svc2");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn passthrough_round_trips() {
        let t = PassthroughTransformer;
        let v = serde_json::json!({"x": 1});
        assert_eq!(t.to_device(&v).unwrap(), v);
        assert_eq!(t.from_device(&v).unwrap(), v);
    }
}
