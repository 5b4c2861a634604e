//! Minimal HTTP client shared by C1 (credential holder), C2 (registry), and
//! C5 (PTS) — built on `hyper` + `hyper-util` rather than a higher-level
//! client crate, matching this crate's existing dependency stack.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request as HyperRequest, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::TransportError;

type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>;

/// A thin wrapper around a `hyper` legacy client, cloneable and cheap to share.
#[derive(Clone)]
pub struct HttpAgent {
    client: HttpClient,
}

/// Response body plus status, read fully into memory (registry/PTS/token
/// bodies are small JSON documents).
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl Default for HttpAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAgent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError> {
        let uri: Uri = uri
            .parse()
            .map_err(|e| TransportError(format!("invalid URI {uri}: {e}")))?;

        let mut builder = HyperRequest::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let req = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| TransportError(format!("building request: {e}")))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| TransportError(format!("request failed: {e}")))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError(format!("reading response body: {e}")))?
            .to_bytes()
            .to_vec();

        Ok(HttpResponse { status, body })
    }

    pub async fn get(
        &self,
        uri: &str,
        headers: &[(&str, String)],
    ) -> Result<HttpResponse, TransportError> {
        self.request(Method::GET, uri, headers, Vec::new()).await
    }

    pub async fn post(
        &self,
        uri: &str,
        headers: &[(&str, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError> {
        self.request(Method::POST, uri, headers, body).await
    }

    pub async fn put(
        &self,
        uri: &str,
        headers: &[(&str, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError> {
        self.request(Method::PUT, uri, headers, body).await
    }

    pub async fn delete(
        &self,
        uri: &str,
        headers: &[(&str, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError> {
        self.request(Method::DELETE, uri, headers, body).await
    }
}

/// URL-encode a form body (for the Keycloak-style password/refresh grant).
#[must_use]
pub fn form_urlencode(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = String::new();
    for (i, (k, v)) in fields.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&urlencode(k));
        out.push('=');
        out.push_str(&urlencode(v));
    }
    out.into_bytes()
}

/// URL-encode a single path segment.
#[must_use]
pub fn urlencode_component(s: &str) -> String {
    urlencode(s)
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
