//! C7 — message framing. Parses inbound client text frames into
//! [`crate::model::Request`] and builds outbound response/error frames.
//!
//! Content-type inference mirrors the original's `reflect.TypeOf(...).Kind()`
//! idiom against `serde_json::Value`'s variants, which this crate already
//! uses for untyped wire payloads (see `tunnel/relay.rs`).

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::model::{Message, Request};

/// A raw inbound frame as received from the client. Fields are all optional
/// on the wire; absence is treated the same as JSON `null`.
#[derive(Debug, Clone, serde::Deserialize)]
struct RawRequest {
    #[serde(default)]
    handler: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    payload: Value,
}

/// Infer the wire content-type label for a JSON value.
#[must_use]
pub fn content_type_of(value: &Value) -> String {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

/// Parse a client text frame into a [`Request`]. Malformed JSON is a
/// [`ProtocolError`], surfaced as a 400 by the caller (`handlers.rs`).
pub fn parse_request(text: &str) -> Result<Request, ProtocolError> {
    let raw: RawRequest =
        serde_json::from_str(text).map_err(|e| ProtocolError(format!("malformed request: {e}")))?;
    let content_type = content_type_of(&raw.payload);
    Ok(Request {
        handler: raw.handler,
        token: raw.token,
        content_type,
        raw_payload: raw.payload,
    })
}

/// Lazily round-trip `request.raw_payload` through JSON into a typed value.
/// Returns a [`ProtocolError`] (400) on shape mismatch, not an upstream error.
pub fn payload_as<T: DeserializeOwned>(request: &Request) -> Result<T, ProtocolError> {
    serde_json::from_value(request.raw_payload.clone())
        .map_err(|e| ProtocolError(format!("unexpected payload shape: {e}")))
}

/// Build a successful `response` frame (status 200).
#[must_use]
pub fn respond(token: &str, payload: Value) -> Message {
    let content_type = content_type_of(&payload);
    Message {
        status: 200,
        handler: "response".to_string(),
        token: Some(token.to_string()),
        content_type,
        payload,
    }
}

/// Build an internal-error `response` frame (status 500). Payload is a
/// plain-text diagnostic string, per spec.
#[must_use]
pub fn error_response(token: &str, msg: &str) -> Message {
    Message {
        status: 500,
        handler: "response".to_string(),
        token: Some(token.to_string()),
        content_type: "string".to_string(),
        payload: Value::String(msg.to_string()),
    }
}

/// Build a user-error `response` frame (status 400) — malformed requests,
/// unknown handlers, bad payload shapes.
#[must_use]
pub fn user_error_response(token: &str, msg: &str) -> Message {
    Message {
        status: 400,
        handler: "response".to_string(),
        token: Some(token.to_string()),
        content_type: "string".to_string(),
        payload: Value::String(msg.to_string()),
    }
}

/// Build an outbound `command` frame (platform → client), per
/// `Session::SendCommand`.
#[must_use]
pub fn command(payload: Value) -> Message {
    Message {
        status: 200,
        handler: "command".to_string(),
        token: None,
        content_type: content_type_of(&payload),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_content_type_per_json_variant() {
        assert_eq!(content_type_of(&Value::Null), "nil");
        assert_eq!(content_type_of(&serde_json::json!(true)), "bool");
        assert_eq!(content_type_of(&serde_json::json!(1)), "number");
        assert_eq!(content_type_of(&serde_json::json!("s")), "string");
        assert_eq!(content_type_of(&serde_json::json!([1])), "array");
        assert_eq!(content_type_of(&serde_json::json!({"a":1})), "object");
    }

    #[test]
    fn parses_minimal_request() {
        let req = parse_request(r#"{"handler":"put","token":"t1","payload":{"uri":"x"}}"#).unwrap();
        assert_eq!(req.handler, "put");
        assert_eq!(req.token, "t1");
        assert_eq!(req.content_type, "object");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_request("not json").is_err());
    }

    #[test]
    fn payload_as_reports_shape_mismatch_as_protocol_error() {
        let req = parse_request(r#"{"handler":"put","token":"t1","payload":"oops"}"#).unwrap();
        let result: Result<crate::model::ConnectorDevice, _> = payload_as(&req);
        assert!(result.is_err());
    }
}
