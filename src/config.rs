//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `CONNECTOR_AMQP_URL`, `CONNECTOR_AUTH_CLIENT_SECRET`,
//!    `CONNECTOR_CONSUMER_NAME`
//! 2. **Config file** — path via `--config <path>`, default `config.toml`
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy; see SPEC_FULL.md §6 for a
//! complete example.

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub pts: PtsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub errors: ErrorPolicyConfig,
}

/// AMQP bus connection + named-topic settings (C3/C4/C10).
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_amqp_url")]
    pub amqp_url: String,
    #[serde(default = "default_amqp_reconnect_timeout_secs")]
    pub amqp_reconnect_timeout_secs: u64,
    #[serde(default = "default_connector_log_topic")]
    pub connector_log_topic: String,
    #[serde(default = "default_gateway_log_topic")]
    pub gateway_log_topic: String,
    #[serde(default = "default_device_log_topic")]
    pub device_log_topic: String,
    #[serde(default = "default_event_topic")]
    pub event_topic: String,
    #[serde(default = "default_protocol_topic")]
    pub protocol_topic: String,
    #[serde(default = "default_response_topic")]
    pub response_topic: String,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
}

/// Device registry HTTP API location (C2).
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_iot_repo_url")]
    pub iot_repo_url: String,
}

/// Prefix-topic-routing service location (C5).
#[derive(Debug, Clone, Deserialize)]
pub struct PtsConfig {
    #[serde(default = "default_pts_url")]
    pub pts_url: String,
}

/// Token issuer + credential policy (C1).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_endpoint")]
    pub auth_endpoint: String,
    #[serde(default = "default_auth_client_id")]
    pub auth_client_id: String,
    #[serde(default)]
    pub auth_client_secret: String,
    #[serde(default = "default_auth_expiration_time_buffer")]
    pub auth_expiration_time_buffer_secs: i64,
}

/// Client-facing WebSocket listener settings (C8).
#[derive(Debug, Clone, Deserialize)]
pub struct WebsocketConfig {
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_wss_port")]
    pub wss_port: u16,
    #[serde(default)]
    pub tls_cert_file: String,
    #[serde(default)]
    pub tls_key_file: String,
    #[serde(default = "default_ws_timeout_secs")]
    pub ws_timeout_secs: u64,
    #[serde(default = "default_ws_ping_period_secs")]
    pub ws_ping_period_secs: u64,
}

/// Telemetry reporter period (C10).
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_time_secs")]
    pub log_time_secs: u64,
    /// tracing filter level, overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Consecutive-error kill switch and broker fatality policy (§7).
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPolicyConfig {
    /// Negative disables the kill switch.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: i64,
    #[serde(default)]
    pub fatal_broker_errors: bool,
}

fn default_amqp_url() -> String {
    "amqp://127.0.0.1:5672/%2f".to_string()
}
fn default_amqp_reconnect_timeout_secs() -> u64 {
    5
}
fn default_connector_log_topic() -> String {
    "connector-log".to_string()
}
fn default_gateway_log_topic() -> String {
    "gateway-log".to_string()
}
fn default_device_log_topic() -> String {
    "device-log".to_string()
}
fn default_event_topic() -> String {
    "event".to_string()
}
fn default_protocol_topic() -> String {
    "protocol".to_string()
}
fn default_response_topic() -> String {
    "response".to_string()
}
fn default_consumer_name() -> String {
    "platform-connector".to_string()
}
fn default_iot_repo_url() -> String {
    "http://iot-repo:8080".to_string()
}
fn default_pts_url() -> String {
    "http://pts:8080".to_string()
}
fn default_auth_endpoint() -> String {
    "http://keycloak:8080".to_string()
}
fn default_auth_client_id() -> String {
    "connector".to_string()
}
fn default_auth_expiration_time_buffer() -> i64 {
    30
}
fn default_ws_port() -> u16 {
    8080
}
fn default_wss_port() -> u16 {
    8443
}
fn default_ws_timeout_secs() -> u64 {
    60
}
fn default_ws_ping_period_secs() -> u64 {
    20
}
fn default_log_time_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_consecutive_errors() -> i64 {
    5
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            amqp_url: default_amqp_url(),
            amqp_reconnect_timeout_secs: default_amqp_reconnect_timeout_secs(),
            connector_log_topic: default_connector_log_topic(),
            gateway_log_topic: default_gateway_log_topic(),
            device_log_topic: default_device_log_topic(),
            event_topic: default_event_topic(),
            protocol_topic: default_protocol_topic(),
            response_topic: default_response_topic(),
            consumer_name: default_consumer_name(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            iot_repo_url: default_iot_repo_url(),
        }
    }
}

impl Default for PtsConfig {
    fn default() -> Self {
        Self {
            pts_url: default_pts_url(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_endpoint: default_auth_endpoint(),
            auth_client_id: default_auth_client_id(),
            auth_client_secret: String::new(),
            auth_expiration_time_buffer_secs: default_auth_expiration_time_buffer(),
        }
    }
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            ws_port: default_ws_port(),
            wss_port: default_wss_port(),
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            ws_timeout_secs: default_ws_timeout_secs(),
            ws_ping_period_secs: default_ws_ping_period_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_time_secs: default_log_time_secs(),
            level: default_log_level(),
        }
    }
}

impl Default for ErrorPolicyConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            fatal_broker_errors: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            registry: RegistryConfig::default(),
            pts: PtsConfig::default(),
            auth: AuthConfig::default(),
            websocket: WebsocketConfig::default(),
            logging: LoggingConfig::default(),
            errors: ErrorPolicyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (fatal startup error on failure).
    /// Otherwise looks for `config.toml` in the current directory, falling
    /// back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, crate::error::StartupError> {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| crate::error::StartupError(format!("reading config file {p}: {e}")))?;
            toml::from_str(&content)
                .map_err(|e| crate::error::StartupError(format!("parsing config file {p}: {e}")))?
        } else if std::path::Path::new("config.toml").exists() {
            let content = std::fs::read_to_string("config.toml")
                .map_err(|e| crate::error::StartupError(format!("reading config.toml: {e}")))?;
            toml::from_str(&content)
                .map_err(|e| crate::error::StartupError(format!("parsing config.toml: {e}")))?
        } else {
            Config::default()
        };

        if let Ok(url) = std::env::var("CONNECTOR_AMQP_URL") {
            config.bus.amqp_url = url;
        }
        if let Ok(secret) = std::env::var("CONNECTOR_AUTH_CLIENT_SECRET") {
            config.auth.auth_client_secret = secret;
        }
        if let Ok(name) = std::env::var("CONNECTOR_CONSUMER_NAME") {
            config.bus.consumer_name = name;
        }

        Ok(config)
    }
}
