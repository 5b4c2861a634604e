//! C5 — PTS client. Three idempotent HTTP operations against the external
//! prefix-topic-routing service. Every success body is literally `ok`; any
//! other body is an error.

use crate::config::{BusConfig, PtsConfig};
use crate::error::UpstreamError;
use crate::http_client::HttpAgent;

const OK_BODY: &str = "ok";

/// Register route `(sourceTopic, device, "*", consumerTopic)`.
pub async fn register(
    pts: &PtsConfig,
    bus: &BusConfig,
    http: &HttpAgent,
    device: &str,
) -> Result<(), UpstreamError> {
    let url = format!(
        "{}/add/route/{}/{device}/*/{}",
        pts.pts_url, bus.protocol_topic, bus.consumer_name
    );
    let resp = http
        .post(&url, &[], Vec::new())
        .await
        .map_err(|e| UpstreamError(e.to_string()))?;
    check_ok(&resp.body)
}

/// Deregister the same route tuple.
pub async fn deregister(
    pts: &PtsConfig,
    bus: &BusConfig,
    http: &HttpAgent,
    device: &str,
) -> Result<(), UpstreamError> {
    let url = format!(
        "{}/remove/route/{}/{device}/*/{}",
        pts.pts_url, bus.protocol_topic, bus.consumer_name
    );
    let resp = http
        .delete(&url, &[], Vec::new())
        .await
        .map_err(|e| UpstreamError(e.to_string()))?;
    check_ok(&resp.body)
}

/// Clear all routes targeting this consumer — run once at router startup to
/// reconcile stale state from a previous process.
pub async fn clear_all(
    pts: &PtsConfig,
    bus: &BusConfig,
    http: &HttpAgent,
) -> Result<(), UpstreamError> {
    let url = format!("{}/remove/target/{}", pts.pts_url, bus.consumer_name);
    let resp = http
        .delete(&url, &[], Vec::new())
        .await
        .map_err(|e| UpstreamError(e.to_string()))?;
    check_ok(&resp.body)
}

fn check_ok(body: &[u8]) -> Result<(), UpstreamError> {
    if body == OK_BODY.as_bytes() {
        Ok(())
    } else {
        Err(UpstreamError(format!(
            "PTS call failed: {}",
            String::from_utf8_lossy(body)
        )))
    }
}
