//! Streaming HTTP forwarding shared by the public run proxy and the in-run
//! sidecar.
//!
//! Bodies are never buffered: the request body is streamed to the backend
//! under a byte cap, and the backend response is streamed back as it
//! arrives. Requests are sent once; there are no retries and redirects are
//! passed through to the client.
//!
//! Protocol upgrades (WebSocket and friends) are forwarded with their
//! `Connection`/`Upgrade` headers; once the backend answers 101 both
//! connections are spliced together until either side closes.

pub mod external;
pub mod sidecar;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use repro_core::config::ProxyConfig;
use repro_core::ReproError;

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Why a request was not (fully) proxied. Rendered as short plain-text
/// responses; backend details only go to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFailure {
    /// Unparseable host, bad short id, bad port. All look the same.
    NotFound,
    Forbidden,
    TooLarge,
    BadGateway,
    GatewayTimeout,
}

impl ProxyFailure {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadGateway => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Forbidden => "forbidden",
            Self::TooLarge => "request body too large",
            Self::BadGateway => "backend unavailable",
            Self::GatewayTimeout => "backend timed out",
        }
    }
}

impl From<&ReproError> for ProxyFailure {
    fn from(e: &ReproError) -> Self {
        match e.http_status() {
            404 => Self::NotFound,
            403 => Self::Forbidden,
            413 => Self::TooLarge,
            504 => Self::GatewayTimeout,
            _ => Self::BadGateway,
        }
    }
}

impl IntoResponse for ProxyFailure {
    fn into_response(self) -> Response {
        (self.status_code(), self.message()).into_response()
    }
}

/// Client settings for talking to backends.
pub fn client_builder(cfg: &ProxyConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(cfg.connect_timeout())
        .no_proxy()
}

/// A ready-to-send request: where to connect and what to send.
#[derive(Debug)]
pub struct Outgoing {
    /// `host:port` of the backend.
    pub connect: String,
    pub method: Method,
    pub uri: Uri,
    /// Already filtered and rewritten.
    pub headers: HeaderMap,
}

/// Client half of a protocol switch.
#[derive(Debug)]
pub struct UpgradeRequest {
    /// Value of the client's `Upgrade` header.
    pub protocol: HeaderValue,
    pub on_upgrade: OnUpgrade,
}

/// Takes the pending upgrade out of a request that asks for one
/// (`Connection: upgrade` plus an `Upgrade` header). Requests that did not
/// come through a live connection have nothing to take.
pub fn take_upgrade(parts: &mut Parts) -> Option<UpgradeRequest> {
    let wants_upgrade = parts
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    let protocol = parts.headers.get(header::UPGRADE)?.clone();
    let on_upgrade = parts.extensions.remove::<OnUpgrade>()?;
    Some(UpgradeRequest {
        protocol,
        on_upgrade,
    })
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    max_body_bytes: u64,
    response_timeout: Duration,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, max_body_bytes: u64, response_timeout: Duration) -> Self {
        Self {
            client,
            max_body_bytes,
            response_timeout,
        }
    }

    pub fn from_config(cfg: &ProxyConfig) -> anyhow::Result<Self> {
        let client = client_builder(cfg).build()?;
        Ok(Self::new(
            client,
            cfg.max_body_bytes,
            cfg.response_timeout(),
        ))
    }

    /// Sends `out` with `body` to the backend once and streams the answer back.
    pub async fn forward(&self, out: Outgoing, body: Body) -> Result<Response, ProxyFailure> {
        if declared_length(&out.headers).is_some_and(|n| n > self.max_body_bytes) {
            tracing::info!(event = "proxy.too_large", backend = %out.connect, limit = self.max_body_bytes);
            return Err(ProxyFailure::TooLarge);
        }
        let overflow = Arc::new(AtomicBool::new(false));
        let body = capped_body(body, self.max_body_bytes, overflow.clone());

        let upstream = match self.send(&out, body).await {
            Ok(resp) => resp,
            Err(_) if overflow.load(Ordering::SeqCst) => {
                tracing::info!(event = "proxy.too_large", backend = %out.connect, limit = self.max_body_bytes);
                return Err(ProxyFailure::TooLarge);
            }
            Err(e) => return Err(ProxyFailure::from(&e)),
        };
        streamed(&out, upstream)
    }

    /// Forwards an upgrade request. On `101 Switching Protocols` the client
    /// and backend connections are joined in a background task; any other
    /// answer is relayed as a normal response.
    pub async fn forward_upgrade(
        &self,
        mut out: Outgoing,
        upgrade: UpgradeRequest,
    ) -> Result<Response, ProxyFailure> {
        out.headers
            .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        out.headers.insert(header::UPGRADE, upgrade.protocol.clone());

        let upstream = self
            .send(&out, reqwest::Body::from(bytes::Bytes::new()))
            .await
            .map_err(|e| ProxyFailure::from(&e))?;
        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::info!(
                event = "proxy.upgrade_refused",
                backend = %out.connect,
                status = upstream.status().as_u16(),
            );
            return streamed(&out, upstream);
        }

        let protocol = upstream
            .headers()
            .get(header::UPGRADE)
            .cloned()
            .unwrap_or(upgrade.protocol);
        let mut headers = strip_hop_by_hop(upstream.headers());
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);

        let backend = out.connect.clone();
        let on_upgrade = upgrade.on_upgrade;
        tokio::spawn(async move {
            let (client, server) = tokio::join!(on_upgrade, upstream.upgrade());
            let (client, mut server) = match (client, server) {
                (Ok(client), Ok(server)) => (client, server),
                (Err(e), _) => {
                    tracing::warn!(event = "proxy.upgrade_failed", backend = %backend, side = "client", error = %e);
                    return;
                }
                (_, Err(e)) => {
                    tracing::warn!(event = "proxy.upgrade_failed", backend = %backend, side = "backend", error = %e);
                    return;
                }
            };
            let mut client = TokioIo::new(client);
            match tokio::io::copy_bidirectional(&mut client, &mut server).await {
                Ok((up, down)) => {
                    tracing::debug!(event = "proxy.tunnel_closed", backend = %backend, bytes_up = up, bytes_down = down);
                }
                Err(e) => {
                    tracing::debug!(event = "proxy.tunnel_closed", backend = %backend, error = %e);
                }
            }
        });

        tracing::info!(event = "proxy.upgraded", backend = %out.connect);
        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        if let Some(h) = response.headers_mut() {
            *h = headers;
        }
        response.body(Body::empty()).map_err(|e| {
            tracing::warn!(event = "proxy.bad_response", backend = %out.connect, error = %e);
            ProxyFailure::BadGateway
        })
    }

    /// One attempt at the backend, bounded by the response timeout. Failures
    /// come back as [`ReproError::UnresolvableBackend`], already logged.
    async fn send(
        &self,
        out: &Outgoing,
        body: reqwest::Body,
    ) -> Result<reqwest::Response, ReproError> {
        let path = out
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", out.connect, path);
        let unresolvable = |reason: String, timed_out: bool| ReproError::UnresolvableBackend {
            target: out.connect.clone(),
            reason,
            timed_out,
        };

        let request = self
            .client
            .request(out.method.clone(), &url)
            .headers(out.headers.clone())
            .body(body)
            .build()
            .map_err(|e| {
                let err = unresolvable(e.to_string(), false);
                tracing::warn!(event = "proxy.bad_request", error = %err);
                err
            })?;

        match tokio::time::timeout(self.response_timeout, self.client.execute(request)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                let err = unresolvable(e.to_string(), e.is_timeout());
                tracing::warn!(
                    event = "proxy.backend_failed",
                    method = %out.method,
                    connect = e.is_connect(),
                    error = %err,
                );
                Err(err)
            }
            Err(_) => {
                let err = unresolvable(
                    format!("no response within {}ms", self.response_timeout.as_millis()),
                    true,
                );
                tracing::warn!(event = "proxy.backend_timeout", method = %out.method, error = %err);
                Err(err)
            }
        }
    }
}

/// Relays a backend response, body streamed as it arrives.
fn streamed(out: &Outgoing, upstream: reqwest::Response) -> Result<Response, ProxyFailure> {
    tracing::debug!(
        event = "proxy.forwarded",
        backend = %out.connect,
        method = %out.method,
        status = upstream.status().as_u16(),
    );

    let mut response = Response::builder().status(upstream.status());
    if let Some(headers) = response.headers_mut() {
        *headers = strip_hop_by_hop(upstream.headers());
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| {
            tracing::warn!(event = "proxy.bad_response", backend = %out.connect, error = %e);
            ProxyFailure::BadGateway
        })
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn capped_body(body: Body, limit: u64, overflow: Arc<AtomicBool>) -> reqwest::Body {
    if HttpBody::size_hint(&body).exact() == Some(0) {
        return reqwest::Body::from(bytes::Bytes::new());
    }
    let mut seen = 0u64;
    let stream = body.into_data_stream().map(move |chunk| {
        let chunk = chunk.map_err(std::io::Error::other)?;
        seen += chunk.len() as u64;
        if seen > limit {
            overflow.store(true, Ordering::SeqCst);
            return Err(std::io::Error::other(format!(
                "request body exceeds {limit} bytes"
            )));
        }
        Ok(chunk)
    });
    reqwest::Body::wrap_stream(stream)
}

/// Copy of `headers` without hop-by-hop headers, including any named in
/// `Connection`.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let n = name.as_str();
        if HOP_BY_HOP.contains(&n) || listed.iter().any(|l| l == n) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Host the client asked for: the `Host` header, or the URI authority on
/// HTTP/2.
pub fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
}

pub(crate) fn header_name(name: &str) -> anyhow::Result<HeaderName> {
    Ok(HeaderName::from_bytes(name.as_bytes())?)
}

pub(crate) fn header_value(value: &str) -> anyhow::Result<HeaderValue> {
    Ok(HeaderValue::from_str(value)?)
}
