//! In-run sidecar: accepts traffic from the public proxy only, and hands it
//! to the experiment on `127.0.0.1:<port>`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderName};
use axum::response::{IntoResponse, Response};
use axum::Router;
use repro_core::config::ReproConfig;
use repro_core::run::{first_label, parse_port};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use super::{
    header_name, request_host, strip_hop_by_hop, take_upgrade, Forwarder, Outgoing, ProxyFailure,
};

const LOCAL_HOST: &str = "127.0.0.1";

pub struct SidecarProxy {
    trust_header: HeaderName,
    trust_token: SecretString,
    forwarder: Forwarder,
}

impl SidecarProxy {
    pub fn new(trust_header: HeaderName, trust_token: SecretString, forwarder: Forwarder) -> Self {
        Self {
            trust_header,
            trust_token,
            forwarder,
        }
    }

    pub fn from_config(cfg: &ReproConfig, forwarder: Forwarder) -> anyhow::Result<Self> {
        Ok(Self::new(
            header_name(&cfg.proxy.trust_header)?,
            cfg.trust_token()?.clone(),
            forwarder,
        ))
    }

    pub fn router(self) -> Router {
        Router::new().fallback(handle).with_state(Arc::new(self))
    }

    fn authenticated(&self, headers: &HeaderMap) -> bool {
        let expected = self.trust_token.expose_secret().as_bytes();
        let mut values = headers.get_all(&self.trust_header).iter();
        match (values.next(), values.next()) {
            (Some(v), None) => v.as_bytes().ct_eq(expected).into(),
            _ => false,
        }
    }

    pub async fn proxy(&self, req: Request) -> Result<Response, ProxyFailure> {
        let (mut parts, body) = req.into_parts();
        if !self.authenticated(&parts.headers) {
            tracing::info!(event = "sidecar.unauthenticated", path = %parts.uri.path());
            return Err(ProxyFailure::Forbidden);
        }
        let host = request_host(&parts.headers, &parts.uri).ok_or(ProxyFailure::NotFound)?;
        let port = local_port(&host).ok_or_else(|| {
            tracing::debug!(event = "sidecar.bad_host", host = %host);
            ProxyFailure::NotFound
        })?;

        let upgrade = take_upgrade(&mut parts);
        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(&self.trust_header);

        let out = Outgoing {
            connect: format!("{LOCAL_HOST}:{port}"),
            method: parts.method,
            uri: parts.uri,
            headers,
        };
        match upgrade {
            Some(upgrade) => self.forwarder.forward_upgrade(out, upgrade).await,
            None => self.forwarder.forward(out, body).await,
        }
    }
}

/// Port the experiment listens on, from the forwarded Host header.
///
/// The public proxy sends `run-<id>:<port>`, so an explicit `:port` wins;
/// otherwise the first label is read as `<anything>-<port>`.
pub fn local_port(host: &str) -> Option<u16> {
    let host = host.trim();
    if let Some((_, p)) = host.rsplit_once(':') {
        if let Some(port) = parse_port(p) {
            return Some(port);
        }
    }
    let (_, p) = first_label(host).rsplit_once('-')?;
    parse_port(p)
}

async fn handle(State(proxy): State<Arc<SidecarProxy>>, req: Request<Body>) -> Response {
    match proxy.proxy(req).await {
        Ok(resp) => resp,
        Err(failure) => failure.into_response(),
    }
}
