//! C1 — credential holder. Keeps a bearer token valid across many concurrent
//! outbound calls and signs requests to the registry/PTS.
//!
//! Not thread-safe for mutation: each session owns its own `Credentials` and
//! serializes calls through it (see `session.rs`).

use std::sync::Arc;
use std::time::Instant;

use hyper::StatusCode;
use serde::Deserialize;
use tracing::warn;

use crate::config::AuthConfig;
use crate::error::{AuthError, TransportError};
use crate::http_client::{form_urlencode, HttpAgent};

/// An OAuth2-style access/refresh token pair from the configured issuer.
///
/// `expires_in`/`refresh_expires_in` are seconds, matching the issuer's
/// response shape (these come back as JSON numbers, not integers).
#[derive(Debug, Clone, Deserialize)]
pub struct OpenidToken {
    pub access_token: String,
    pub expires_in: f64,
    pub refresh_expires_in: f64,
    pub refresh_token: String,
    pub token_type: String,
    #[serde(skip, default = "Instant::now")]
    pub request_time: Instant,
}

/// The first frame a client must send on connect: `{user, pw, gid}` plus an
/// optional `token` echoed back on the handshake response.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeCredentials {
    pub user: String,
    pub pw: String,
    pub gid: String,
    #[serde(default)]
    pub token: String,
}

/// Holds a session's credentials and current token, refreshing transparently.
pub struct Credentials {
    user: String,
    pw: String,
    pub gateway_id: String,
    token: Option<OpenidToken>,
    auth: AuthConfig,
    http: HttpAgent,
    /// Invoked when `ensure_access` fails terminally — the owning session
    /// uses this to close itself with `auth error`.
    error_handler: Option<Arc<dyn Fn(AuthError) + Send + Sync>>,
}

impl Credentials {
    #[must_use]
    pub fn new(user: String, pw: String, gateway_id: String, auth: AuthConfig, http: HttpAgent) -> Self {
        Self {
            user,
            pw,
            gateway_id,
            token: None,
            auth,
            http,
            error_handler: None,
        }
    }

    pub fn set_error_handler(&mut self, handler: Arc<dyn Fn(AuthError) + Send + Sync>) {
        self.error_handler = Some(handler);
    }

    /// Policy (spec.md §4.1): refresh if access is near-expiry but refresh is
    /// still valid; return early if access is still valid; otherwise obtain
    /// a fresh token via password grant.
    pub async fn ensure_access(&mut self) -> Result<(), AuthError> {
        let result = self.ensure_access_inner().await;
        if let Err(ref e) = result {
            if let Some(handler) = &self.error_handler {
                handler(AuthError(e.0.clone()));
            }
        }
        result
    }

    async fn ensure_access_inner(&mut self) -> Result<(), AuthError> {
        let buffer = self.auth.auth_expiration_time_buffer_secs as f64;

        if let Some(token) = &self.token {
            let delta = token.request_time.elapsed().as_secs_f64();
            if token.expires_in - buffer > delta {
                return Ok(());
            }
            if token.refresh_expires_in - buffer > delta {
                match self.refresh(&token.refresh_token).await {
                    Ok(new_token) => {
                        self.token = Some(new_token);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("credential refresh failed, falling back to password grant: {e}");
                    }
                }
            }
        }

        match self.password_grant().await {
            Ok(token) => {
                self.token = Some(token);
                Ok(())
            }
            Err(e) => {
                self.token = None;
                Err(e)
            }
        }
    }

    async fn password_grant(&self) -> Result<OpenidToken, AuthError> {
        let request_time = Instant::now();
        let body = form_urlencode(&[
            ("client_id", &self.auth.auth_client_id),
            ("client_secret", &self.auth.auth_client_secret),
            ("username", &self.user),
            ("password", &self.pw),
            ("grant_type", "password"),
        ]);
        self.issue(body, request_time).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OpenidToken, AuthError> {
        let request_time = Instant::now();
        let body = form_urlencode(&[
            ("client_id", &self.auth.auth_client_id),
            ("client_secret", &self.auth.auth_client_secret),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ]);
        self.issue(body, request_time).await
    }

    async fn issue(&self, body: Vec<u8>, request_time: Instant) -> Result<OpenidToken, AuthError> {
        let url = format!(
            "{}/auth/realms/master/protocol/openid-connect/token",
            self.auth.auth_endpoint
        );
        let resp = self
            .http
            .post(
                &url,
                &[("content-type", "application/x-www-form-urlencoded".to_string())],
                body,
            )
            .await
            .map_err(|e| AuthError(e.to_string()))?;

        if resp.status != StatusCode::OK {
            return Err(AuthError("access denied".to_string()));
        }

        let mut token: OpenidToken = serde_json::from_slice(&resp.body)
            .map_err(|e| AuthError(format!("parsing token response: {e}")))?;
        token.request_time = request_time;
        Ok(token)
    }

    fn auth_header(&self) -> Result<String, AuthError> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| AuthError("no token".to_string()))?;
        Ok(format!("{} {}", token.token_type, token.access_token))
    }

    /// `GET url`, signed with the current access token.
    pub async fn get(&mut self, url: &str) -> Result<Vec<u8>, CredentialCallError> {
        self.ensure_access().await?;
        let header = self.auth_header()?;
        let resp = self.http.get(url, &[("authorization", header)]).await?;
        self.check_status(resp)
    }

    /// `POST url` with `content_type`-labeled `body`, signed.
    pub async fn post(
        &mut self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, CredentialCallError> {
        self.ensure_access().await?;
        let header = self.auth_header()?;
        let resp = self
            .http
            .post(
                url,
                &[("authorization", header), ("content-type", content_type.to_string())],
                body,
            )
            .await?;
        self.check_status(resp)
    }

    /// `PUT url` with `content_type`-labeled `body`, signed.
    pub async fn put(
        &mut self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, CredentialCallError> {
        self.ensure_access().await?;
        let header = self.auth_header()?;
        let resp = self
            .http
            .put(
                url,
                &[("authorization", header), ("content-type", content_type.to_string())],
                body,
            )
            .await?;
        self.check_status(resp)
    }

    /// `DELETE url`, signed.
    pub async fn delete(&mut self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, CredentialCallError> {
        self.ensure_access().await?;
        let header = self.auth_header()?;
        let resp = self.http.delete(url, &[("authorization", header)], body).await?;
        self.check_status(resp)
    }

    fn check_status(&self, resp: crate::http_client::HttpResponse) -> Result<Vec<u8>, CredentialCallError> {
        if resp.status == StatusCode::UNAUTHORIZED {
            warn!("registry call returned 401: {}", String::from_utf8_lossy(&resp.body));
            return Err(CredentialCallError::Auth(AuthError("access denied".to_string())));
        }
        Ok(resp.body)
    }

    /// Status code alongside the response body, for callers (C2) that must
    /// decode non-2xx bodies as an `IotErrorMessage`.
    pub async fn get_with_status(&mut self, url: &str) -> Result<(StatusCode, Vec<u8>), CredentialCallError> {
        self.ensure_access().await?;
        let header = self.auth_header()?;
        let resp = self.http.get(url, &[("authorization", header)]).await?;
        self.status_and_body(resp)
    }

    pub async fn post_with_status(
        &mut self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(StatusCode, Vec<u8>), CredentialCallError> {
        self.ensure_access().await?;
        let header = self.auth_header()?;
        let resp = self
            .http
            .post(
                url,
                &[("authorization", header), ("content-type", content_type.to_string())],
                body,
            )
            .await?;
        self.status_and_body(resp)
    }

    pub async fn put_with_status(
        &mut self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(StatusCode, Vec<u8>), CredentialCallError> {
        self.ensure_access().await?;
        let header = self.auth_header()?;
        let resp = self
            .http
            .put(
                url,
                &[("authorization", header), ("content-type", content_type.to_string())],
                body,
            )
            .await?;
        self.status_and_body(resp)
    }

    pub async fn delete_with_status(
        &mut self,
        url: &str,
        body: Vec<u8>,
    ) -> Result<(StatusCode, Vec<u8>), CredentialCallError> {
        self.ensure_access().await?;
        let header = self.auth_header()?;
        let resp = self.http.delete(url, &[("authorization", header)], body).await?;
        self.status_and_body(resp)
    }

    fn status_and_body(
        &self,
        resp: crate::http_client::HttpResponse,
    ) -> Result<(StatusCode, Vec<u8>), CredentialCallError> {
        if resp.status == StatusCode::UNAUTHORIZED {
            warn!("registry call returned 401: {}", String::from_utf8_lossy(&resp.body));
            return Err(CredentialCallError::Auth(AuthError("access denied".to_string())));
        }
        Ok((resp.status, resp.body))
    }
}

/// Error surfaced by a credential-signed call: either auth (401 mapped) or
/// plain transport failure.
#[derive(Debug)]
pub enum CredentialCallError {
    Auth(AuthError),
    Transport(TransportError),
}

impl std::fmt::Display for CredentialCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialCallError::Auth(e) => write!(f, "{e}"),
            CredentialCallError::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CredentialCallError {}

impl From<AuthError> for CredentialCallError {
    fn from(e: AuthError) -> Self {
        CredentialCallError::Auth(e)
    }
}

impl From<TransportError> for CredentialCallError {
    fn from(e: TransportError) -> Self {
        CredentialCallError::Transport(e)
    }
}
