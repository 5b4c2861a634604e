#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! platform-connector library — exposes the building blocks of the IoT
//! gateway connector.
//!
//! - `config` — configuration loading
//! - `error` — hand-rolled error kinds
//! - `model` — wire and domain data types
//! - `http_client` — shared HTTP client (C1/C2/C5)
//! - `credentials` — token refresh engine (C1)
//! - `registry` — device registry client (C2)
//! - `bus` — AMQP publisher/subscriber (C3/C4)
//! - `pts` — prefix-topic-routing client (C5)
//! - `formatter` — per-device/service transformer cache (C6)
//! - `framing` — request/response wire framing (C7)
//! - `session` — per-client session state machine (C8)
//! - `router` — session registry / prefix router (C9)
//! - `reporter` — periodic connection-state snapshot (C10)
//! - `handlers` — inbound request handler table (C11)

pub mod bus;
pub mod config;
pub mod credentials;
pub mod error;
pub mod formatter;
pub mod framing;
pub mod handlers;
pub mod http_client;
pub mod model;
pub mod pts;
pub mod registry;
pub mod reporter;
pub mod router;
pub mod session;

pub use config::Config;
