//! C11 — the inbound request handler table. Dispatches a parsed
//! [`crate::model::Request`] to its verb-named handler and always writes
//! exactly one response frame.
//!
//! Grounded on `examples/original_source/lib/messagehandler.go`'s
//! `MessageHandler` map and its per-verb functions.

use std::sync::Arc;

use tracing::warn;

use crate::framing;
use crate::model::{ConnectorDevice, EventMessage, GatewayRef, Message};
use crate::registry;
use crate::session::Session;

/// Parse and dispatch one inbound text frame, writing the resulting
/// response (or error) frame back to the client. Parse failures never
/// reach a handler: they're turned into a user-error response directly.
pub async fn handle_message(session: &Arc<Session>, text: &str) {
    let request = match framing::parse_request(text) {
        Ok(r) => r,
        Err(e) => {
            warn!("session {}: {e}", session.id);
            send_error(session, framing::user_error_response("", &e.to_string())).await;
            return;
        }
    };

    let token = request.token.clone();
    let result = match request.handler.as_str() {
        "clear" => clear(session, &token).await,
        "commit" => commit(session, &request).await,
        "put" => put(session, &request, &token).await,
        "disconnect" => disconnect(session, &request, &token).await,
        "delete" => delete(session, &request, &token).await,
        "event" => event(session, &request, &token).await,
        "response" => response(session, &request, &token).await,
        other => Err(framing::user_error_response(&token, &format!("unknown handler '{other}'"))),
    };

    match result {
        Ok(msg) => {
            if let Err(e) = session.send_response(msg).await {
                warn!("session {}: failed to write response: {e}", session.id);
            }
        }
        Err(msg) => send_error(session, msg).await,
    }
}

async fn send_error(session: &Arc<Session>, msg: Message) {
    if let Err(e) = session.send_error(msg).await {
        warn!("session {}: failed to write error response: {e}", session.id);
    }
}

/// `clear`: drop the gateway manifest, then mute every entity currently
/// in the URI cache.
async fn clear(session: &Arc<Session>, token: &str) -> Result<Message, Message> {
    let config = &session.config;
    {
        let mut cred = session.cred.lock().await;
        registry::clear_gateway(&config.registry, &mut cred, &session.gateway_id)
            .await
            .map_err(|e| framing::error_response(token, &e.to_string()))?;
    }

    for entity in session.entities().await {
        session
            .mute_entity(&entity)
            .await
            .map_err(|e| framing::error_response(token, &e.to_string()))?;
    }

    Ok(framing::respond(token, "ok".into()))
}

/// `commit(hash: string)`: build the gateway manifest from every device
/// currently listened to and commit it.
async fn commit(session: &Arc<Session>, request: &crate::model::Request) -> Result<Message, Message> {
    let token = &request.token;
    let hash = request
        .raw_payload
        .as_str()
        .ok_or_else(|| framing::user_error_response(token, "expect hash as string in payload"))?
        .to_string();

    let devices = session.device_ids().await;
    let manifest = GatewayRef { id: String::new(), devices, hash };

    let config = &session.config;
    let mut cred = session.cred.lock().await;
    registry::commit_gateway(&config.registry, &mut cred, &session.gateway_id, &manifest)
        .await
        .map_err(|e| framing::error_response(token, &e.to_string()))?;

    Ok(framing::respond(token, "ok".into()))
}

/// `put(connectorDevice)`: resolve by uri, create or update, then listen.
/// On an update failure the pre-update entity is kept (best effort, per
/// the original — see DESIGN.md's Open Question #1).
async fn put(session: &Arc<Session>, request: &crate::model::Request, token: &str) -> Result<Message, Message> {
    let declared: ConnectorDevice =
        framing::payload_as(request).map_err(|e| framing::error_response(token, &e.to_string()))?;

    let config = &session.config;
    let matches = {
        let mut cred = session.cred.lock().await;
        registry::url_to_devices(&config.registry, &mut cred, &declared.uri)
            .await
            .map_err(|e| framing::error_response(token, &e.to_string()))?
    };

    if matches.len() > 1 {
        return Err(framing::user_error_response(
            token,
            &format!(
                "found more than one device with the given uri '{}'. please delete duplicate devices or change their URIs.",
                declared.uri
            ),
        ));
    }

    let entity = if matches.is_empty() {
        let mut cred = session.cred.lock().await;
        registry::create_device(&config.registry, &mut cred, &declared)
            .await
            .map_err(|e| framing::error_response(token, &e.to_string()))?
    } else {
        let mut cred = session.cred.lock().await;
        match registry::update_device(&config.registry, &mut cred, &declared, &matches[0]).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!("session {}: put::update_device failed, keeping prior entity: {e}", session.id);
                matches[0].clone()
            }
        }
    };

    session
        .listen_to_entity(entity)
        .await
        .map_err(|e| framing::error_response(token, &e.to_string()))?;

    Ok(framing::respond(token, "ok".into()))
}

/// `disconnect(uri: string)`: resolve the cached entity, then mute it.
async fn disconnect(session: &Arc<Session>, request: &crate::model::Request, token: &str) -> Result<Message, Message> {
    let uri = request
        .raw_payload
        .as_str()
        .ok_or_else(|| framing::user_error_response(token, "expect uri as string in payload"))?;

    let entity = session
        .get_entity(uri)
        .await
        .map_err(|e| framing::error_response(token, &e.to_string()))?;
    session
        .mute_entity(&entity)
        .await
        .map_err(|e| framing::error_response(token, &e.to_string()))?;

    Ok(framing::respond(token, "ok".into()))
}

/// `delete(uri: string)`: mute if cached (not an error if it isn't), then
/// delete the device instance from the registry.
async fn delete(session: &Arc<Session>, request: &crate::model::Request, token: &str) -> Result<Message, Message> {
    let uri = request
        .raw_payload
        .as_str()
        .ok_or_else(|| framing::user_error_response(token, "expect uri as string in payload"))?;

    if let Ok(entity) = session.get_entity(uri).await {
        session
            .mute_entity(&entity)
            .await
            .map_err(|e| framing::error_response(token, &e.to_string()))?;
    }

    let config = &session.config;
    let mut cred = session.cred.lock().await;
    registry::delete_device(&config.registry, &mut cred, uri)
        .await
        .map_err(|e| framing::error_response(token, &e.to_string()))?;

    Ok(framing::respond(token, "ok".into()))
}

/// `event(EventMessage)`: resolve the device by uri, the service within
/// it by uri, transform the value through C6, and publish a
/// [`crate::model::PrefixMessage`] on the event topic.
async fn event(session: &Arc<Session>, request: &crate::model::Request, token: &str) -> Result<Message, Message> {
    let msg: EventMessage =
        framing::payload_as(request).map_err(|e| framing::error_response(token, &e.to_string()))?;

    let entity = session
        .get_entity(&msg.device_uri)
        .await
        .map_err(|_| framing::user_error_response(token, &format!("not listening to this device {}", msg.device_uri)))?;

    let service = entity
        .services
        .iter()
        .find(|s| s.url == msg.service_uri)
        .ok_or_else(|| framing::user_error_response(token, &format!("unknown service uri '{}'", msg.service_uri)))?;

    let device_id = entity.device.id.clone();
    let service_id = service.id.clone();

    let transformed = {
        let mut formatters = session.formatters.lock().await;
        let transformer = formatters.get_or_default(&device_id, &service_id);
        transformer
            .from_device(&msg.value)
            .map_err(|e| framing::error_response(token, &e.to_string()))?
    };

    let prefix_msg = crate::model::PrefixMessage {
        device_id: Some(device_id),
        service_id: Some(service_id),
        value: transformed,
    };
    let payload = serde_json::to_vec(&prefix_msg)
        .map_err(|e| framing::error_response(token, &format!("encoding event: {e}")))?;

    session
        .publisher
        .publish(&session.config.bus.event_topic, &payload)
        .await
        .map_err(|e| framing::error_response(token, &e.to_string()))?;

    Ok(framing::respond(token, "ok".into()))
}

/// `response(value)`: publish the value verbatim on the response topic.
/// Publishes exactly once (see DESIGN.md's Open Question #2).
async fn response(session: &Arc<Session>, request: &crate::model::Request, token: &str) -> Result<Message, Message> {
    let payload = serde_json::to_vec(&request.raw_payload)
        .map_err(|e| framing::user_error_response(token, &format!("cannot parse response msg: {e}")))?;

    session
        .publisher
        .publish(&session.config.bus.response_topic, &payload)
        .await
        .map_err(|e| framing::error_response(token, &e.to_string()))?;

    Ok(framing::respond(token, "ok".into()))
}
