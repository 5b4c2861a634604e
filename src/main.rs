#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

//! # platform-connector
//!
//! IoT gateway connector. Bridges WebSocket-connected gateway clients to the
//! device registry (C2), the prefix-topic-routing service (C5), and an AMQP
//! message bus (C3/C4/C10) — see SPEC_FULL.md for the full protocol.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use clap::Parser;
use tracing::{error, info, warn};

use platform_connector::bus::{Publisher, Subscriber};
use platform_connector::config::Config;
use platform_connector::http_client::HttpAgent;
use platform_connector::router::Router;
use platform_connector::{reporter, session};

/// IoT gateway connector.
#[derive(Parser)]
#[command(name = "platform-connector", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[derive(Clone)]
struct AppState {
    router: Arc<Router>,
    publisher: Publisher,
    http: HttpAgent,
    config: Arc<Config>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("platform-connector v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let http = HttpAgent::new();

    let publisher = match Publisher::connect(&config.bus).await {
        Ok(p) => p,
        Err(e) => {
            error!("fatal: connecting publisher to bus: {e}");
            std::process::exit(1);
        }
    };

    let subscriber = match Subscriber::init(&config.bus).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("fatal: initializing subscriber: {e}");
            std::process::exit(1);
        }
    };

    let router = match Router::init(
        config.pts.clone(),
        config.bus.clone(),
        http.clone(),
        subscriber,
        publisher.clone(),
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            error!("fatal: initializing router: {e}");
            std::process::exit(1);
        }
    };

    let reporter_task = reporter::spawn(
        router.clone(),
        publisher.clone(),
        config.bus.clone(),
        std::time::Duration::from_secs(config.logging.log_time_secs),
    );

    let subscriber_task = {
        let subscriber = router.subscriber_handle();
        let router = router.clone();
        let bus_cfg = config.bus.clone();
        tokio::spawn(async move {
            subscriber
                .run(bus_cfg, move |routing_key, payload| {
                    let router = router.clone();
                    let device_id = routing_key.to_string();
                    match serde_json::from_slice::<serde_json::Value>(payload) {
                        Ok(value) => {
                            let envelope_value = value.get("value").cloned().unwrap_or(value);
                            tokio::spawn(async move {
                                router.dispatch(&device_id, &envelope_value).await;
                            });
                        }
                        Err(e) => warn!("main: malformed bus delivery for {device_id}: {e}"),
                    }
                })
                .await;
        })
    };

    let state = AppState {
        router: router.clone(),
        publisher: publisher.clone(),
        http,
        config: config.clone(),
    };

    let app = axum::Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let ws_addr = format!("0.0.0.0:{}", config.websocket.ws_port);
    let ws_listener = tokio::net::TcpListener::bind(&ws_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {ws_addr}: {e}"));
    info!("listening for gateways on ws://{ws_addr}/gateway");

    let wss_task = if !config.websocket.tls_cert_file.is_empty() && !config.websocket.tls_key_file.is_empty() {
        match axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &config.websocket.tls_cert_file,
            &config.websocket.tls_key_file,
        )
        .await
        {
            Ok(tls_config) => {
                let wss_addr: std::net::SocketAddr =
                    format!("0.0.0.0:{}", config.websocket.wss_port).parse().expect("valid wss bind address");
                let wss_app = app.clone();
                info!("listening for gateways on wss://{wss_addr}/gateway");
                Some(tokio::spawn(async move {
                    if let Err(e) = axum_server::bind_rustls(wss_addr, tls_config).serve(wss_app.into_make_service()).await {
                        error!("wss listener stopped: {e}");
                    }
                }))
            }
            Err(e) => {
                error!("failed to load TLS cert/key, wss listener disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    axum::serve(ws_listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .expect("ws server error");

    info!("shutting down");
    if let Some(task) = wss_task {
        task.abort();
    }
    subscriber_task.abort();
    reporter_task.abort();
    router.close().await;
    info!("goodbye");
}

/// Upgrade `/gateway` to a WebSocket and drive it through the session
/// lifecycle (C8). The handshake credentials are read as the first frame,
/// not off query parameters — see `session::accept`.
async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        session::accept(socket, state.router, state.publisher, state.http, state.config).await;
    })
}
