//! Public run addressing: `<shortid>-<port>.<domain>` hostnames and the
//! backend each one maps to.

use crate::config::ProxyConfig;
use crate::errors::{ReproError, Result};
use crate::shortid::{ShortIdCodec, RUN_NAMESPACE};

/// A run and one of its exposed ports, as named by a public hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTarget {
    pub run_id: u64,
    pub port: u16,
}

/// Where to send a request for a [`RunTarget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// `host:port` to open a connection to.
    pub connect: String,
    /// Value for the forwarded `Host` header.
    pub host_header: String,
}

/// First DNS label of a `Host` header value, without any `:port` suffix.
pub fn first_label(host: &str) -> &str {
    let host = host.trim();
    let host = match host.rsplit_once(':') {
        Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    };
    host.split('.').next().unwrap_or_default()
}

/// Decodes `<shortid>-<port>.<anything>` into a run target.
///
/// Every failure is reported as the same `InvalidShortId`/`NotFound` so the
/// response does not reveal which part was wrong.
pub fn parse_run_host(codec: &ShortIdCodec, host: &str) -> Result<RunTarget> {
    let label = first_label(host);
    let (short_id, port) = label
        .split_once('-')
        .ok_or_else(|| ReproError::not_found("run"))?;
    let run_id = codec.decode(RUN_NAMESPACE, short_id)?;
    let port = parse_port(port).ok_or_else(|| ReproError::not_found("run"))?;
    Ok(RunTarget { run_id, port })
}

/// Non-zero decimal port without sign or leading `+`.
pub fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

/// Public hostname label for a run's port.
pub fn public_label(codec: &ShortIdCodec, run_id: u64, port: u16) -> Result<String> {
    Ok(format!("{}-{}", codec.encode(RUN_NAMESPACE, run_id)?, port))
}

/// How run ids map to backend hosts: `<prefix><id>[.<domain>]`, reached either
/// directly on the requested port or through the run's sidecar port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConvention {
    pub prefix: String,
    pub domain: Option<String>,
    pub sidecar_port: Option<u16>,
}

impl Default for BackendConvention {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for BackendConvention {
    fn from(cfg: &ProxyConfig) -> Self {
        Self {
            prefix: cfg.backend_prefix.clone(),
            domain: cfg.backend_domain.clone().filter(|d| !d.is_empty()),
            sidecar_port: cfg.sidecar_port,
        }
    }
}

impl BackendConvention {
    pub fn host(&self, run_id: u64) -> String {
        match &self.domain {
            Some(domain) => format!("{}{}.{}", self.prefix, run_id, domain),
            None => format!("{}{}", self.prefix, run_id),
        }
    }

    pub fn resolve(&self, target: RunTarget) -> Backend {
        let host = self.host(target.run_id);
        let connect_port = self.sidecar_port.unwrap_or(target.port);
        Backend {
            connect: format!("{}:{}", host, connect_port),
            host_header: format!("{}:{}", host, target.port),
        }
    }
}
