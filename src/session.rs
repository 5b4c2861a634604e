//! C8 — per-client session state machine: `Handshake -> Active -> Closing ->
//! Closed`.
//!
//! Grounded on `examples/original_source/lib/session.go`; the write-mutex and
//! `Arc`-shared-state shape follows the teacher's `tunnel/relay.rs`
//! (`ConnectedDevice`, `handle_device_ws`) rather than the original's raw
//! `*websocket.Conn` + `sync.Mutex`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use hyper::body::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::Publisher;
use crate::config::Config;
use crate::credentials::{Credentials, HandshakeCredentials};
use crate::error::{AuthError, ProtocolError, TransportError, UpstreamError};
use crate::formatter::FormatterCache;
use crate::framing;
use crate::handlers;
use crate::http_client::HttpAgent;
use crate::model::{DeviceLog, DeviceServiceEntity, GatewayLog, Message};
use crate::registry;
use crate::router::Router;

type WsSink = SplitSink<WebSocket, WsMessage>;

struct SessionState {
    uri_cache: HashMap<String, DeviceServiceEntity>,
    prefixes: Vec<String>,
}

/// A connected client. Shared via `Arc` between its reader task, pinger
/// task, and the router (which holds a clone per registered prefix).
pub struct Session {
    pub id: String,
    pub gateway_id: String,
    pub user: String,
    sink: Mutex<WsSink>,
    pub(crate) cred: Mutex<Credentials>,
    state: Mutex<SessionState>,
    pub(crate) formatters: Mutex<FormatterCache>,
    consecutive_errors: AtomicI64,
    active_ping: AtomicBool,
    closing: AtomicBool,
    stop_ping: watch::Sender<bool>,
    pub(crate) router: Arc<Router>,
    pub(crate) publisher: Publisher,
    pub(crate) config: Arc<Config>,
}

/// Accept a freshly-upgraded WebSocket and drive it through the full
/// handshake + active lifecycle. Returns once the session is closed.
pub async fn accept(
    socket: WebSocket,
    router: Arc<Router>,
    publisher: Publisher,
    http: HttpAgent,
    config: Arc<Config>,
) {
    let (sink, mut stream) = socket.split();
    let read_timeout = Duration::from_secs(config.websocket.ws_timeout_secs);

    let first_text = match tokio::time::timeout(read_timeout, stream.next()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            warn!("session handshake: first frame was not text");
            return;
        }
        Ok(Some(Err(e))) => {
            warn!("session handshake: read error: {e}");
            return;
        }
        Ok(None) => {
            warn!("session handshake: socket closed before handshake");
            return;
        }
        Err(_) => {
            warn!("session handshake: timed out waiting for credentials");
            return;
        }
    };

    let handshake: HandshakeCredentials = match serde_json::from_str(&first_text) {
        Ok(h) => h,
        Err(e) => {
            warn!("session handshake: malformed credentials frame: {e}");
            return;
        }
    };

    let mut cred = Credentials::new(
        handshake.user.clone(),
        handshake.pw.clone(),
        handshake.gid.clone(),
        config.auth.clone(),
        http,
    );
    if let Err(e) = cred.ensure_access().await {
        warn!("session handshake: authentication failed for {}: {e}", handshake.user);
        return;
    }

    let gateway = match registry::get_gateway(&config.registry, &mut cred, &handshake.gid).await {
        Ok(g) if !g.id.is_empty() => g,
        Ok(_) => {
            warn!("session handshake: empty gateway for id {}", handshake.gid);
            return;
        }
        Err(e) => {
            warn!("session handshake: get_gateway({}) failed: {e}", handshake.gid);
            return;
        }
    };

    let (stop_ping_tx, stop_ping_rx) = watch::channel(false);
    let session = Arc::new(Session {
        id: Uuid::new_v4().to_string(),
        gateway_id: gateway.id.clone(),
        user: handshake.user.clone(),
        sink: Mutex::new(sink),
        cred: Mutex::new(cred),
        state: Mutex::new(SessionState {
            uri_cache: HashMap::new(),
            prefixes: Vec::new(),
        }),
        formatters: Mutex::new(FormatterCache::new()),
        consecutive_errors: AtomicI64::new(0),
        active_ping: AtomicBool::new(true),
        closing: AtomicBool::new(false),
        stop_ping: stop_ping_tx,
        router: router.clone(),
        publisher,
        config: config.clone(),
    });

    // Wire the credential error-sink to close this session (spec §7): a
    // token refresh failing mid-session surfaces as an auth error, not a
    // 500, the same way a handshake failure never reaches a handler at all.
    let weak_session = Arc::downgrade(&session);
    {
        let mut cred = session.cred.lock().await;
        cred.set_error_handler(Arc::new(move |e: AuthError| {
            if let Some(session) = weak_session.upgrade() {
                tokio::spawn(async move {
                    session.close(&format!("auth error: {e}")).await;
                });
            }
        }));
    }

    session.router.register(session.clone()).await;

    let mut type_cache = HashMap::new();
    for device in gateway.devices {
        let entity = {
            let mut cred = session.cred.lock().await;
            match registry::device_instance_to_entity(&config.registry, &mut cred, device, &mut type_cache).await {
                Ok(e) => e,
                Err(e) => {
                    session.close(&format!("ERROR while creating device-service-entity: {e}")).await;
                    return;
                }
            }
        };
        if let Err(e) = session.listen_to_entity(entity).await {
            session.close(&format!("ERROR: while trying to listen to device-service-entity: {e}")).await;
            return;
        }
    }

    let handshake_reply = framing::respond(
        &handshake.token,
        serde_json::json!({"gid": gateway.id, "hash": gateway.hash}),
    );
    if let Err(e) = session.send_response(handshake_reply).await {
        warn!("session: failed to send handshake response: {e}");
        session.close("write error during handshake").await;
        return;
    }
    session.log_gateway_connect().await;

    let pinger = tokio::spawn(run_pinger(session.clone(), stop_ping_rx));
    run_reader(session.clone(), stream).await;
    pinger.abort();
}

async fn run_reader(session: Arc<Session>, mut stream: futures::stream::SplitStream<WebSocket>) {
    loop {
        let read_timeout = Duration::from_secs(session.config.websocket.ws_timeout_secs);
        let next = match tokio::time::timeout(read_timeout, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                session.close(&format!("read-error: {e}")).await;
                return;
            }
            Ok(None) => {
                session.close("read-error: connection closed").await;
                return;
            }
            Err(_) => {
                session.close("read-error: timed out").await;
                return;
            }
        };

        match next {
            WsMessage::Text(text) => {
                handlers::handle_message(&session, &text).await;
            }
            WsMessage::Ping(payload) => {
                session.active_ping.store(false, Ordering::Relaxed);
                if let Err(e) = session.write_raw(WsMessage::Pong(payload)).await {
                    warn!("session: pong write failed: {e}");
                }
            }
            WsMessage::Close(_) => {
                session.close("read-error: peer closed connection").await;
                return;
            }
            _ => {}
        }
    }
}

async fn run_pinger(session: Arc<Session>, mut stop: watch::Receiver<bool>) {
    let period = Duration::from_secs(session.config.websocket.ws_ping_period_secs);
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stop.changed() => {
                return;
            }
            _ = interval.tick() => {
                if !session.active_ping.load(Ordering::Relaxed) {
                    // peer pinged us during this interval; stay passive
                    continue;
                }
                if let Err(e) = session.write_raw(WsMessage::Ping(Bytes::new())).await {
                    warn!("session: ping write failed: {e}");
                    session.close(&format!("ERROR on ws ping: {e}")).await;
                    return;
                }
            }
        }
    }
}

impl Session {
    async fn write_raw(&self, msg: WsMessage) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(msg).await.map_err(|e| TransportError(e.to_string()))
    }

    /// Write a response/command frame as a text message, serialized against
    /// concurrent pings/pongs/closes by `sink`'s mutex.
    async fn write_message(&self, msg: &Message) -> Result<(), TransportError> {
        let text = serde_json::to_string(msg).map_err(|e| TransportError(format!("encoding frame: {e}")))?;
        self.write_raw(WsMessage::Text(text)).await
    }

    /// Resets the consecutive-error counter.
    pub async fn send_response(&self, msg: Message) -> Result<(), TransportError> {
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.write_message(&msg).await
    }

    /// Increments the consecutive-error counter; closes the session once it
    /// exceeds `maxConsecutiveErrors` (if the kill switch is enabled).
    pub async fn send_error(self: &Arc<Self>, msg: Message) -> Result<(), TransportError> {
        let count = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        let result = self.write_message(&msg).await;
        let max = self.config.errors.max_consecutive_errors;
        if max >= 0 && count > max {
            self.clone().close("ERROR: max consecutive error count exceeded").await;
        }
        result
    }

    /// Inbound platform command, wrapped and forwarded to the client.
    pub async fn send_command(&self, payload: Value) -> Result<(), TransportError> {
        self.write_message(&framing::command(payload)).await
    }

    /// Update the URI cache and prefix set atomically, register the prefix
    /// with the router, and roll back on failure.
    pub async fn listen_to_entity(self: &Arc<Self>, entity: DeviceServiceEntity) -> Result<(), UpstreamError> {
        let prefix = entity.device.id.clone();
        let uri = entity.device.url.clone();
        {
            let mut state = self.state.lock().await;
            state.uri_cache.insert(uri.clone(), entity);
            if !state.prefixes.contains(&prefix) {
                state.prefixes.push(prefix.clone());
            }
        }

        if let Err(e) = self.router.register_prefix(self, &prefix).await {
            let mut state = self.state.lock().await;
            state.uri_cache.remove(&uri);
            state.prefixes.retain(|p| p != &prefix);
            return Err(e);
        }

        self.log_connect_device(&prefix).await;
        Ok(())
    }

    /// Symmetric to `listen_to_entity`: remove from cache/prefixes, ask the
    /// router to deregister, roll back on failure.
    pub async fn mute_entity(self: &Arc<Self>, entity: &DeviceServiceEntity) -> Result<(), UpstreamError> {
        let prefix = entity.device.id.clone();
        let uri = entity.device.url.clone();
        {
            let mut state = self.state.lock().await;
            state.uri_cache.remove(&uri);
            state.prefixes.retain(|p| p != &prefix);
        }

        if let Err(e) = self.router.deregister_prefix(self, &prefix).await {
            let mut state = self.state.lock().await;
            state.uri_cache.insert(uri, entity.clone());
            if !state.prefixes.contains(&prefix) {
                state.prefixes.push(prefix);
            }
            return Err(e);
        }

        self.log_disconnect_device(&prefix).await;
        Ok(())
    }

    pub async fn get_entity(&self, uri: &str) -> Result<DeviceServiceEntity, ProtocolError> {
        let state = self.state.lock().await;
        state
            .uri_cache
            .get(uri)
            .cloned()
            .ok_or_else(|| ProtocolError(format!("not listening to device with uri '{uri}'")))
    }

    /// Snapshot of every entity currently listened to (used by `clear`).
    pub async fn entities(&self) -> Vec<DeviceServiceEntity> {
        self.state.lock().await.uri_cache.values().cloned().collect()
    }

    /// Device ids currently listened to (used by `commit`).
    pub async fn device_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .uri_cache
            .values()
            .map(|e| e.device.id.clone())
            .collect()
    }

    pub async fn held_prefixes(&self) -> Vec<String> {
        self.state.lock().await.prefixes.clone()
    }

    /// Idempotent: the first caller to observe `closing == false` performs
    /// the actual teardown; later callers are no-ops.
    pub async fn close(self: &Arc<Self>, reason: &str) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("session {}: closing ({reason})", self.id);

        let close_frame = WsMessage::Close(Some(axum::extract::ws::CloseFrame {
            code: 1000,
            reason: reason.to_string().into(),
        }));
        if let Err(e) = self.write_raw(close_frame).await {
            warn!("session {}: close frame write failed: {e}", self.id);
        }

        self.log_disconnect().await;
        self.router.deregister(self).await;
        let _ = self.stop_ping.send(true);
    }

    async fn log_gateway_connect(&self) {
        let log = GatewayLog {
            gateway: self.gateway_id.clone(),
            connected: true,
            connector: self.config.bus.consumer_name.clone(),
            time: Utc::now().to_rfc3339(),
        };
        self.publish_log(&self.config.bus.gateway_log_topic.clone(), &log).await;
    }

    async fn log_connect_device(&self, device_id: &str) {
        let log = DeviceLog {
            device: device_id.to_string(),
            connected: true,
            connector: self.config.bus.consumer_name.clone(),
            time: Utc::now().to_rfc3339(),
        };
        self.publish_log(&self.config.bus.device_log_topic.clone(), &log).await;
    }

    async fn log_disconnect_device(&self, device_id: &str) {
        let log = DeviceLog {
            device: device_id.to_string(),
            connected: false,
            connector: self.config.bus.consumer_name.clone(),
            time: Utc::now().to_rfc3339(),
        };
        self.publish_log(&self.config.bus.device_log_topic.clone(), &log).await;
    }

    /// On close: emit a disconnect log for every device still listened to,
    /// plus a gateway-disconnect log.
    async fn log_disconnect(&self) {
        let ids: Vec<String> = self.state.lock().await.uri_cache.values().map(|e| e.device.id.clone()).collect();
        for id in ids {
            self.log_disconnect_device(&id).await;
        }
        let log = GatewayLog {
            gateway: self.gateway_id.clone(),
            connected: false,
            connector: self.config.bus.consumer_name.clone(),
            time: Utc::now().to_rfc3339(),
        };
        self.publish_log(&self.config.bus.gateway_log_topic.clone(), &log).await;
    }

    async fn publish_log<T: serde::Serialize>(&self, topic: &str, log: &T) {
        match serde_json::to_vec(log) {
            Ok(payload) => {
                if let Err(e) = self.publisher.publish(topic, &payload).await {
                    warn!("session {}: publishing log to {topic} failed: {e}", self.id);
                }
            }
            Err(e) => warn!("session {}: encoding log for {topic} failed: {e}", self.id),
        }
    }
}
