//! C9 — session registry / prefix router. One instance per process, built
//! once in `main.rs` and shared via `Arc`.
//!
//! All session bookkeeping lives under a single mutex, matching
//! `examples/original_source/lib/sessions.go`'s `SessionsCollection` (one
//! `sync.Mutex` guarding both the session map and the prefix index) rather
//! than the teacher's `RwLock`-per-field split in `tunnel/relay.rs::RelayState`
//! — the router's maps are always mutated together, so a single `Mutex`
//! matches the access pattern exactly (see spec's lock-ordering rule: router
//! mutex is always acquired before a session's own mutex, never after).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::{Publisher, Subscriber};
use crate::config::{BusConfig, PtsConfig};
use crate::error::UpstreamError;
use crate::http_client::HttpAgent;
use crate::model::ConnectorLog;
use crate::pts;
use crate::session::Session;

struct RouterState {
    sessions: HashMap<String, Arc<Session>>,
    /// prefix (device id) -> session id -> session.
    index: HashMap<String, HashMap<String, Arc<Session>>>,
}

pub struct Router {
    state: Mutex<RouterState>,
    pts: PtsConfig,
    bus: BusConfig,
    http: HttpAgent,
    subscriber: Arc<Subscriber>,
    publisher: Publisher,
}

impl Router {
    /// Construct the singleton router: clears any stale PTS routes left over
    /// from a previous process and emits a connector-up log.
    pub async fn init(
        pts_cfg: PtsConfig,
        bus_cfg: BusConfig,
        http: HttpAgent,
        subscriber: Arc<Subscriber>,
        publisher: Publisher,
    ) -> Result<Arc<Self>, UpstreamError> {
        if let Err(e) = pts::clear_all(&pts_cfg, &bus_cfg, &http).await {
            warn!("router init: clearing stale pts routes failed: {e}");
        }

        let router = Arc::new(Self {
            state: Mutex::new(RouterState {
                sessions: HashMap::new(),
                index: HashMap::new(),
            }),
            pts: pts_cfg,
            bus: bus_cfg,
            http,
            subscriber,
            publisher,
        });

        let log = ConnectorLog {
            connected: true,
            connector: router.bus.consumer_name.clone(),
            time: Utc::now().to_rfc3339(),
            gateways: Vec::new(),
            devices: Vec::new(),
        };
        if let Err(e) = router.publish_connector_log(&log).await {
            warn!("router init: publishing connector-up log failed: {e}");
        }

        Ok(router)
    }

    /// Shared handle to the inbound subscriber, for `main.rs` to drive the
    /// delivery loop (`Subscriber::run`) alongside `register_prefix`'s own
    /// use of the same instance for `bind`/`unbind`.
    #[must_use]
    pub fn subscriber_handle(&self) -> Arc<Subscriber> {
        self.subscriber.clone()
    }

    async fn publish_connector_log(&self, log: &ConnectorLog) -> Result<(), UpstreamError> {
        let payload = serde_json::to_vec(log)
            .map_err(|e| UpstreamError(format!("encoding connector log: {e}")))?;
        self.publisher.publish(&self.bus.connector_log_topic, &payload).await
    }

    pub async fn register(&self, session: Arc<Session>) {
        let mut state = self.state.lock().await;
        state.sessions.insert(session.id.clone(), session);
    }

    /// Register `session` under `prefix`. If the prefix is new, registers it
    /// with PTS first; the prefix is only created on success. Binds the
    /// inbound subscriber to the prefix (idempotent, best-effort).
    pub async fn register_prefix(&self, session: &Arc<Session>, prefix: &str) -> Result<(), UpstreamError> {
        let mut state = self.state.lock().await;
        if !state.index.contains_key(prefix) {
            pts::register(&self.pts, &self.bus, &self.http, prefix).await?;
            state.index.insert(prefix.to_string(), HashMap::new());
        }
        state
            .index
            .get_mut(prefix)
            .expect("prefix just inserted or already present")
            .insert(session.id.clone(), session.clone());
        drop(state);

        if let Err(e) = self.subscriber.bind(prefix).await {
            warn!("router: binding prefix {prefix} failed: {e}");
        }
        Ok(())
    }

    /// Remove `session` from `prefix`'s inner map. If that empties the
    /// prefix, deregisters it from PTS and, only on success, drops the
    /// prefix and unbinds the subscriber.
    pub async fn deregister_prefix(&self, session: &Arc<Session>, prefix: &str) -> Result<(), UpstreamError> {
        let mut state = self.state.lock().await;
        let now_empty = if let Some(inner) = state.index.get_mut(prefix) {
            inner.remove(&session.id);
            inner.is_empty()
        } else {
            false
        };
        drop(state);

        if now_empty {
            pts::deregister(&self.pts, &self.bus, &self.http, prefix).await?;
            let mut state = self.state.lock().await;
            state.index.remove(prefix);
            drop(state);
            if let Err(e) = self.subscriber.unbind(prefix).await {
                warn!("router: unbinding prefix {prefix} failed: {e}");
            }
        }
        Ok(())
    }

    /// Remove `session` entirely: from the session map and from every prefix
    /// it held. Per-prefix failures are logged, not propagated — a single
    /// stuck PTS deregister must not block the rest of teardown.
    pub async fn deregister(&self, session: &Arc<Session>) {
        let prefixes = {
            let mut state = self.state.lock().await;
            state.sessions.remove(&session.id);
            let mut emptied = Vec::new();
            for prefix in session.held_prefixes().await {
                if let Some(inner) = state.index.get_mut(&prefix) {
                    inner.remove(&session.id);
                    if inner.is_empty() {
                        emptied.push(prefix);
                    }
                }
            }
            for prefix in &emptied {
                state.index.remove(prefix);
            }
            emptied
        };

        for prefix in prefixes {
            if let Err(e) = pts::deregister(&self.pts, &self.bus, &self.http, &prefix).await {
                warn!("router: deregistering prefix {prefix} failed: {e}");
                continue;
            }
            if let Err(e) = self.subscriber.unbind(&prefix).await {
                warn!("router: unbinding prefix {prefix} failed: {e}");
            }
        }
    }

    /// Dispatch `payload` to every session listening on `prefix`. Per-session
    /// errors are logged, not propagated — one stuck client must not block
    /// delivery to the rest.
    pub async fn dispatch(&self, prefix: &str, payload: &serde_json::Value) {
        let sessions: Vec<Arc<Session>> = {
            let state = self.state.lock().await;
            match state.index.get(prefix) {
                Some(inner) => inner.values().cloned().collect(),
                None => return,
            }
        };
        for session in sessions {
            if let Err(e) = session.send_command(payload.clone()).await {
                warn!("router: dispatch to session {} failed: {e}", session.id);
            }
        }
    }

    /// Snapshot of currently registered sessions.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    /// Close every registered session and emit a connector-down log.
    pub async fn close(&self) {
        info!("router: shutting down");
        let sessions = self.sessions().await;
        for session in sessions {
            session.close("connector shutdown").await;
        }
        let log = ConnectorLog {
            connected: false,
            connector: self.bus.consumer_name.clone(),
            time: Utc::now().to_rfc3339(),
            gateways: Vec::new(),
            devices: Vec::new(),
        };
        if let Err(e) = self.publish_connector_log(&log).await {
            warn!("router: publishing connector-down log failed: {e}");
        }
    }
}
