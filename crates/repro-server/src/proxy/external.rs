//! Public run proxy: `<shortid>-<port>.<domain>` to the run's backend.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Router;
use repro_core::config::ReproConfig;
use repro_core::run::{parse_run_host, BackendConvention};
use repro_core::shortid::ShortIdCodec;
use secrecy::ExposeSecret;

use super::{
    header_name, header_value, request_host, strip_hop_by_hop, take_upgrade, Forwarder, Outgoing,
    ProxyFailure,
};

pub struct ExternalProxy {
    codec: Arc<ShortIdCodec>,
    convention: BackendConvention,
    trust_header: HeaderName,
    trust_token: HeaderValue,
    forwarder: Forwarder,
}

impl ExternalProxy {
    pub fn new(
        codec: Arc<ShortIdCodec>,
        convention: BackendConvention,
        trust_header: HeaderName,
        trust_token: HeaderValue,
        forwarder: Forwarder,
    ) -> Self {
        let mut trust_token = trust_token;
        trust_token.set_sensitive(true);
        Self {
            codec,
            convention,
            trust_header,
            trust_token,
            forwarder,
        }
    }

    pub fn from_config(
        codec: Arc<ShortIdCodec>,
        cfg: &ReproConfig,
        forwarder: Forwarder,
    ) -> anyhow::Result<Self> {
        let token = cfg.trust_token()?;
        Ok(Self::new(
            codec,
            BackendConvention::from(&cfg.proxy),
            header_name(&cfg.proxy.trust_header)?,
            header_value(token.expose_secret())?,
            forwarder,
        ))
    }

    pub fn router(self) -> Router {
        Router::new().fallback(handle).with_state(Arc::new(self))
    }

    /// Decodes the target, rewrites headers, forwards. Nothing is sent to any
    /// backend unless the host decodes to a valid run and port.
    pub async fn proxy(&self, req: Request) -> Result<Response, ProxyFailure> {
        let (mut parts, body) = req.into_parts();
        let host = request_host(&parts.headers, &parts.uri).ok_or(ProxyFailure::NotFound)?;
        let target = parse_run_host(&self.codec, &host).map_err(|e| {
            tracing::debug!(event = "proxy.unknown_host", host = %host, error = %e);
            ProxyFailure::from(&e)
        })?;
        let backend = self.convention.resolve(target);
        let host_header =
            HeaderValue::from_str(&backend.host_header).map_err(|_| ProxyFailure::NotFound)?;

        let upgrade = take_upgrade(&mut parts);
        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.insert(header::HOST, host_header);
        headers.remove(&self.trust_header);
        headers.insert(self.trust_header.clone(), self.trust_token.clone());

        tracing::info!(
            event = "proxy.request",
            run_id = target.run_id,
            port = target.port,
            method = %parts.method,
            path = %parts.uri.path(),
            upgrade = upgrade.is_some(),
        );

        let out = Outgoing {
            connect: backend.connect,
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

async fn handle(State(proxy): State<Arc<ExternalProxy>>, req: Request<Body>) -> Response {
    match proxy.proxy(req).await {
        Ok(resp) => resp,
        Err(failure) => failure.into_response(),
    }
}
