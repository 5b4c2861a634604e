//! C10 — periodic connection-state reporter. Snapshots the router every
//! `logTime` seconds and publishes a deduplicated `ConnectorLog` on the
//! connector-log topic.
//!
//! Grounded on `examples/original_source/lib/connectionlog.go`'s
//! `getCurrentConnectionLog`/`InitConnectionLog`; the periodic-task shape
//! (spawn + `tokio::time::interval` loop) mirrors `main.rs`'s sweep task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::bus::Publisher;
use crate::config::BusConfig;
use crate::model::{ConnectorLog, DeviceLog, GatewayLog};
use crate::router::Router;

/// Spawn the periodic reporter task. Returns the `JoinHandle` so `main.rs`
/// can abort it during shutdown.
pub fn spawn(router: Arc<Router>, publisher: Publisher, bus: BusConfig, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let log = snapshot(&router, &bus.consumer_name).await;
            match serde_json::to_vec(&log) {
                Ok(payload) => {
                    if let Err(e) = publisher.publish(&bus.connector_log_topic, &payload).await {
                        warn!("reporter: publishing connector log failed: {e}");
                    }
                }
                Err(e) => warn!("reporter: encoding connector log failed: {e}"),
            }
        }
    })
}

/// Build a `ConnectorLog` from every currently-registered session,
/// deduping gateways and devices by id. Sessions with an empty gateway id
/// are skipped with a warning rather than emitting a bogus gateway log.
async fn snapshot(router: &Router, connector: &str) -> ConnectorLog {
    let time = Utc::now().to_rfc3339();
    let mut gateways = Vec::new();
    let mut devices = Vec::new();
    let mut seen_gateways = HashSet::new();
    let mut seen_devices = HashSet::new();

    for session in router.sessions().await {
        if session.gateway_id.is_empty() {
            warn!("reporter: session {} has no gateway id, skipping", session.id);
            continue;
        }
        if seen_gateways.insert(session.gateway_id.clone()) {
            gateways.push(GatewayLog {
                gateway: session.gateway_id.clone(),
                connected: true,
                connector: connector.to_string(),
                time: time.clone(),
            });
        }
        for entity in session.entities().await {
            if seen_devices.insert(entity.device.id.clone()) {
                devices.push(DeviceLog {
                    device: entity.device.id,
                    connected: true,
                    connector: connector.to_string(),
                    time: time.clone(),
                });
            }
        }
    }

    ConnectorLog {
        connected: true,
        connector: connector.to_string(),
        time,
        gateways,
        devices,
    }
}
