//! Error kinds for the connector. Hand-rolled enums with manual `Display`
//! impls, matching this crate's existing convention (no `thiserror`).

use std::fmt;

/// Socket read/write failure. Closes the owning session.
#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Token refresh/issue failure. Routed through a session's credential
/// error-sink, which closes the session with `auth error`.
#[derive(Debug)]
pub struct AuthError(pub String);

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AuthError {}

/// Malformed frame or unknown handler. Produces a 400 response; does not
/// close the session unless the consecutive-error threshold is exceeded.
#[derive(Debug)]
pub struct ProtocolError(pub String);

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ProtocolError {}

/// Registry, PTS, or bus failure. Produces a 500 response; the session
/// continues unless the consecutive-error threshold is exceeded.
#[derive(Debug)]
pub struct UpstreamError(pub String);

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UpstreamError {}

impl From<IotErrorMessage> for UpstreamError {
    fn from(e: IotErrorMessage) -> Self {
        UpstreamError(e.message)
    }
}

/// Registry commit/clear exceeded its 30x1s precondition-retry budget.
/// Callers surface this as an `UpstreamError`.
#[derive(Debug)]
pub struct PreconditionError(pub String);

impl fmt::Display for PreconditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PreconditionError {}

impl From<PreconditionError> for UpstreamError {
    fn from(e: PreconditionError) -> Self {
        UpstreamError(e.0)
    }
}

/// Config load, bus connect, or subscriber init failure at startup.
/// `main` exits with a non-zero status on this kind.
#[derive(Debug)]
pub struct StartupError(pub String);

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StartupError {}

/// Error body shape returned by the registry on non-2xx responses.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct IotErrorMessage {
    #[serde(default)]
    pub status_code: i64,
    pub message: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub detail: Vec<String>,
}

impl fmt::Display for IotErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.error_code)
    }
}
