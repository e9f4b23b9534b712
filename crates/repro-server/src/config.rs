use std::env;

/// Process-level settings for the server binary: listen addresses and
/// timeouts. Everything about storage, queue and proxy behavior lives in
/// `repro_core::config::ReproConfig`.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub web_addr: String,
    pub proxy_addr: String,
    pub sidecar_addr: String,
    /// Upper bound for a web API request, upload included.
    pub request_timeout_ms: u64,
    /// How long shutdown waits for the build queue to drain.
    pub shutdown_grace_ms: u64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            web_addr: "0.0.0.0:8000".to_string(),
            proxy_addr: "0.0.0.0:8001".to_string(),
            sidecar_addr: "0.0.0.0:5597".to_string(),
            request_timeout_ms: 600_000,
            shutdown_grace_ms: 5_000,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("REPRO_WEB_ADDR") {
            cfg.web_addr = v;
        }
        if let Ok(v) = env::var("REPRO_PROXY_ADDR") {
            cfg.proxy_addr = v;
        }
        if let Ok(v) = env::var("REPRO_SIDECAR_ADDR") {
            cfg.sidecar_addr = v;
        }
        if let Ok(v) = env::var("REPRO_REQUEST_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.request_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("REPRO_SHUTDOWN_GRACE_MS") {
            if let Ok(n) = v.parse() {
                cfg.shutdown_grace_ms = n;
            }
        }
        if let Ok(v) = env::var("REPRO_LOG") {
            cfg.log_level = v;
        }
        cfg
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_grace_ms)
    }
}
