//! C2 — registry client. Typed calls against the device registry, including
//! precondition-retried gateway manifest commit/clear.

use std::time::Duration;

use hyper::StatusCode;
use tracing::warn;

use crate::config::RegistryConfig;
use crate::credentials::{Credentials, CredentialCallError};
use crate::error::{IotErrorMessage, PreconditionError, UpstreamError};
use crate::model::{
    index_tags, merge_tag_indexes, tag_index_to_tag_list, ConnectorDevice, DeviceInstance,
    DeviceServiceEntity, Gateway, GatewayRef, ShortDeviceType, ShortService,
};

const PRECONDITION_RETRIES: u32 = 30;
const PRECONDITION_BACKOFF: Duration = Duration::from_secs(1);

/// Fetch the full gateway record, including declared devices.
pub async fn get_gateway(
    cfg: &RegistryConfig,
    cred: &mut Credentials,
    id: &str,
) -> Result<Gateway, UpstreamError> {
    let url = format!("{}/gateway/{id}/provide", cfg.iot_repo_url);
    let (status, body) = cred
        .get_with_status(&url)
        .await
        .map_err(to_upstream)?;
    decode_ok(status, &body)
}

/// Clear the gateway manifest, retrying on HTTP 412 (precondition failed).
pub async fn clear_gateway(
    cfg: &RegistryConfig,
    cred: &mut Credentials,
    id: &str,
) -> Result<(), UpstreamError> {
    let url = format!("{}/gateway/{id}", cfg.iot_repo_url);
    retry_on_precondition(cred, PreconditionCall::Delete { url: &url }).await
}

/// Commit a gateway manifest, retrying on HTTP 412 (precondition failed).
pub async fn commit_gateway(
    cfg: &RegistryConfig,
    cred: &mut Credentials,
    id: &str,
    manifest: &GatewayRef,
) -> Result<(), UpstreamError> {
    let url = format!("{}/gateway/{id}", cfg.iot_repo_url);
    let body = serde_json::to_vec(manifest)
        .map_err(|e| UpstreamError(format!("encoding gateway manifest: {e}")))?;
    retry_on_precondition(cred, PreconditionCall::Put { url: &url, body }).await
}

/// A single retried HTTP call, named up front so the retry loop below can
/// own `cred` directly instead of borrowing it from a closure.
enum PreconditionCall<'a> {
    Delete { url: &'a str },
    Put { url: &'a str, body: Vec<u8> },
}

async fn retry_on_precondition(
    cred: &mut Credentials,
    call: PreconditionCall<'_>,
) -> Result<(), UpstreamError> {
    for attempt in 0..PRECONDITION_RETRIES {
        let result = match &call {
            PreconditionCall::Delete { url } => cred.delete_with_status(url, Vec::new()).await,
            PreconditionCall::Put { url, body } => {
                cred.put_with_status(url, "application/json", body.clone()).await
            }
        };
        match result {
            Ok((status, _)) if status.is_success() => return Ok(()),
            Ok((status, body)) if status == StatusCode::PRECONDITION_FAILED => {
                if attempt + 1 == PRECONDITION_RETRIES {
                    return Err(UpstreamError::from(PreconditionError(format!(
                        "precondition failed after {PRECONDITION_RETRIES} retries"
                    ))));
                }
                let _ = body;
                tokio::time::sleep(PRECONDITION_BACKOFF).await;
            }
            Ok((status, body)) => {
                return Err(UpstreamError(format!(
                    "registry call failed with status {status}: {}",
                    String::from_utf8_lossy(&body)
                )));
            }
            Err(e) => return Err(to_upstream(e)),
        }
    }
    Err(UpstreamError::from(PreconditionError(
        "precondition retry loop exhausted".to_string(),
    )))
}

/// Fetch a short device type (id + services).
pub async fn get_device_type(
    cfg: &RegistryConfig,
    cred: &mut Credentials,
    id: &str,
) -> Result<ShortDeviceType, UpstreamError> {
    let url = format!("{}/deviceType/{id}", cfg.iot_repo_url);
    let (status, body) = cred.get_with_status(&url).await.map_err(to_upstream)?;
    decode_ok(status, &body)
}

/// Join a device instance to its services via the type cache (allocated by
/// the caller if `None`).
pub async fn device_instance_to_entity(
    cfg: &RegistryConfig,
    cred: &mut Credentials,
    device: DeviceInstance,
    type_cache: &mut std::collections::HashMap<String, Vec<ShortService>>,
) -> Result<DeviceServiceEntity, UpstreamError> {
    if !type_cache.contains_key(&device.device_type) {
        let dt = get_device_type(cfg, cred, &device.device_type).await?;
        type_cache.insert(device.device_type.clone(), dt.services);
    }
    let services = type_cache
        .get(&device.device_type)
        .cloned()
        .unwrap_or_default();
    Ok(DeviceServiceEntity { device, services })
}

/// Find entities matching a device URL (used to decide create vs update).
pub async fn url_to_devices(
    cfg: &RegistryConfig,
    cred: &mut Credentials,
    url: &str,
) -> Result<Vec<DeviceServiceEntity>, UpstreamError> {
    let encoded = crate::http_client::urlencode_component(url);
    let req_url = format!("{}/url_to_devices/{encoded}", cfg.iot_repo_url);
    let (status, body) = cred.get_with_status(&req_url).await.map_err(to_upstream)?;
    decode_ok(status, &body)
}

/// Create a device instance: fetch a skeleton for the declared IoT type,
/// overlay name/uri/tags, then POST.
pub async fn create_device(
    cfg: &RegistryConfig,
    cred: &mut Credentials,
    declared: &ConnectorDevice,
) -> Result<DeviceServiceEntity, UpstreamError> {
    let skeleton_url = format!("{}/deviceType/{}/skeleton", cfg.iot_repo_url, declared.iot_type);
    let (status, body) = cred.get_with_status(&skeleton_url).await.map_err(to_upstream)?;
    let mut skeleton: DeviceInstance = decode_ok(status, &body)?;

    skeleton.name = declared.name.clone();
    skeleton.url = declared.uri.clone();
    skeleton.tags = declared.tags.clone();

    let payload = serde_json::to_vec(&skeleton)
        .map_err(|e| UpstreamError(format!("encoding device skeleton: {e}")))?;
    let create_url = format!("{}/deviceInstance", cfg.iot_repo_url);
    let (status, body) = cred
        .post_with_status(&create_url, "application/json", payload)
        .await
        .map_err(to_upstream)?;
    let instance: DeviceInstance = decode_ok(status, &body)?;
    device_instance_to_entity(cfg, cred, instance, &mut std::collections::HashMap::new()).await
}

/// Merge tags (client overrides platform) and diff name; only PUTs if
/// something actually changed.
pub async fn update_device(
    cfg: &RegistryConfig,
    cred: &mut Credentials,
    new_decl: &ConnectorDevice,
    old_entity: &DeviceServiceEntity,
) -> Result<DeviceServiceEntity, UpstreamError> {
    let platform_tags = index_tags(&old_entity.device.tags);
    let client_tags = index_tags(&new_decl.tags);
    let merged = merge_tag_indexes(&platform_tags, &client_tags);
    let merged_list = tag_index_to_tag_list(&merged);

    let tags_changed = {
        let mut a = old_entity.device.tags.clone();
        let mut b = merged_list.clone();
        a.sort();
        b.sort();
        a != b
    };
    let name_changed = new_decl.name != old_entity.device.name;

    if !tags_changed && !name_changed {
        return Ok(old_entity.clone());
    }

    let mut updated = old_entity.device.clone();
    updated.tags = merged_list;
    updated.name = new_decl.name.clone();

    let url = format!("{}/deviceInstance/{}", cfg.iot_repo_url, updated.id);
    let payload = serde_json::to_vec(&updated)
        .map_err(|e| UpstreamError(format!("encoding device update: {e}")))?;
    let (status, body) = cred
        .put_with_status(&url, "application/json", payload)
        .await
        .map_err(to_upstream)?;
    let instance: DeviceInstance = decode_ok(status, &body)?;
    device_instance_to_entity(cfg, cred, instance, &mut std::collections::HashMap::new()).await
}

/// Resolve a URL to a unique entity (error if zero or more than one match)
/// then delete it by id.
pub async fn delete_device(
    cfg: &RegistryConfig,
    cred: &mut Credentials,
    uri: &str,
) -> Result<(), UpstreamError> {
    let matches = url_to_devices(cfg, cred, uri).await?;
    let entity = match matches.len() {
        1 => &matches[0],
        0 => return Err(UpstreamError(format!("no device found for uri {uri}"))),
        n => return Err(UpstreamError(format!("ambiguous uri {uri}: {n} devices match"))),
    };
    let url = format!("{}/deviceInstance/{}", cfg.iot_repo_url, entity.device.id);
    cred.delete(&url, Vec::new()).await.map_err(to_upstream)?;
    Ok(())
}

fn to_upstream(e: CredentialCallError) -> UpstreamError {
    UpstreamError(e.to_string())
}

fn decode_ok<T: serde::de::DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, UpstreamError> {
    if !status.is_success() {
        if let Ok(err) = serde_json::from_slice::<IotErrorMessage>(body) {
            return Err(UpstreamError::from(err));
        }
        warn!("registry call failed with status {status}: {}", String::from_utf8_lossy(body));
        return Err(UpstreamError(format!("registry call failed with status {status}")));
    }
    serde_json::from_slice(body).map_err(|e| UpstreamError(format!("decoding registry response: {e}")))
}
