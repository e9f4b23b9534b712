//! Deployment configuration: YAML file, then environment overrides.
//!
//! Secrets (short id salt, proxy trust token) are held as [`SecretString`] and
//! only exposed at the point of use.

use crate::errors::ConfigError;
use crate::shortid::{ShortIdCodec, RUN_NAMESPACE};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TRUST_HEADER: &str = "X-Reproserver-Authenticate";
pub const DEFAULT_QUEUE_NAME: &str = "build_queue";
pub const DEFAULT_SIDECAR_PORT: u16 = 5597;
pub const ONE_GIB: u64 = 1 << 30;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReproConfig {
    pub shortids: ShortIdsConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub proxy: ProxyConfig,
    pub upload: UploadConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShortIdsConfig {
    #[serde(deserialize_with = "secret_opt")]
    pub salt: Option<SecretString>,
    pub namespaces: Vec<String>,
}

impl Default for ShortIdsConfig {
    fn default() -> Self {
        Self {
            salt: None,
            namespaces: vec![RUN_NAMESPACE.to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// `file://`, `memory://` or `s3://` URL; a bare path means a local directory.
    pub blob_url: String,
    /// Where uploads are spooled while hashing. System temp dir when unset.
    pub staging_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".repro/repro.db"),
            blob_url: ".repro/blobs".to_string(),
            staging_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub broker_path: PathBuf,
    pub queue_name: String,
    pub retry_delay_ms: u64,
    pub pending_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub requeue_on_start: bool,
    /// How long a builder holds a received message before it is redelivered.
    pub lease_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            broker_path: PathBuf::from(".repro/broker.db"),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            retry_delay_ms: 1000,
            pending_capacity: 1024,
            enqueue_timeout_ms: 2000,
            requeue_on_start: true,
            lease_secs: 3600,
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub trust_header: String,
    #[serde(deserialize_with = "secret_opt")]
    pub trust_token: Option<SecretString>,
    pub backend_prefix: String,
    pub backend_domain: Option<String>,
    /// In-run sidecar port. `null` connects straight to the requested port.
    pub sidecar_port: Option<u16>,
    pub max_body_bytes: u64,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            trust_header: DEFAULT_TRUST_HEADER.to_string(),
            trust_token: None,
            backend_prefix: "run-".to_string(),
            backend_domain: None,
            sidecar_port: Some(DEFAULT_SIDECAR_PORT),
            max_body_bytes: ONE_GIB,
            connect_timeout_ms: 5000,
            response_timeout_ms: 60_000,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub max_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { max_bytes: ONE_GIB }
    }
}

/// API roots of the hosting providers packages can be fetched from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub osf_api_url: String,
    pub figshare_api_url: String,
    pub timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            osf_api_url: "https://api.osf.io/v2/".to_string(),
            figshare_api_url: "https://api.figshare.com/v2/".to_string(),
            timeout_secs: 300,
        }
    }
}

fn secret_opt<'de, D>(d: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

/// Reads a YAML config. Unknown keys fail in `strict` mode and are logged otherwise.
/// Relative paths are resolved against the config file's directory.
pub fn load_config(path: &Path, strict: bool) -> Result<ReproConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
    let mut cfg = parse_config(&raw, strict)
        .map_err(|e| ConfigError(format!("{} (file: {})", e, path.display())))?;
    let base = path.parent().unwrap_or(Path::new("."));
    cfg.resolve_paths(base);
    Ok(cfg)
}

pub fn parse_config(raw: &str, strict: bool) -> Result<ReproConfig, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(ReproConfig::default());
    }

    let mut ignored_keys = HashSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(raw);
    let cfg: ReproConfig = serde_ignored::deserialize(deserializer, |path| {
        ignored_keys.insert(path.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    let mut unknown: Vec<_> = ignored_keys
        .into_iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();
    unknown.sort();

    if !unknown.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "unknown fields detected in strict mode: {:?}",
                unknown
            )));
        }
        tracing::warn!(event = "config.unknown_fields", fields = ?unknown);
    }
    Ok(cfg)
}

impl ReproConfig {
    /// File (when given) plus environment, validated.
    pub fn load(path: Option<&Path>, strict: bool) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => load_config(p, strict)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("REPRO_SHORTIDS_SALT").filter(|v| !v.is_empty()) {
            self.shortids.salt = Some(SecretString::from(v));
        }
        if let Some(v) = lookup("REPRO_TRUST_TOKEN").filter(|v| !v.is_empty()) {
            self.proxy.trust_token = Some(SecretString::from(v));
        }
        if let Some(v) = lookup("REPRO_DB") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("REPRO_BLOB_URL") {
            self.storage.blob_url = v;
        }
        if let Some(v) = lookup("REPRO_STAGING_DIR") {
            self.storage.staging_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("REPRO_BROKER_DB") {
            self.queue.broker_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("REPRO_QUEUE_NAME") {
            self.queue.queue_name = v;
        }
        if let Some(v) = lookup("REPRO_BACKEND_DOMAIN") {
            self.proxy.backend_domain = Some(v).filter(|d| !d.is_empty());
        }
        if let Some(v) = lookup("REPRO_SIDECAR_PORT") {
            self.proxy.sidecar_port = match v.trim() {
                "" | "none" => None,
                p => Some(p.parse().map_err(|_| {
                    ConfigError(format!("REPRO_SIDECAR_PORT: invalid port {p:?}"))
                })?),
            };
        }
        if let Some(v) = lookup("REPRO_OSF_API_URL") {
            self.providers.osf_api_url = v;
        }
        if let Some(v) = lookup("REPRO_FIGSHARE_API_URL") {
            self.providers.figshare_api_url = v;
        }
        if let Some(v) = lookup("REPRO_MAX_UPLOAD_BYTES") {
            self.upload.max_bytes = v
                .trim()
                .parse()
                .map_err(|_| ConfigError(format!("REPRO_MAX_UPLOAD_BYTES: invalid size {v:?}")))?;
        }
        Ok(())
    }

    /// Structural checks. Secrets are checked where they are needed, see
    /// [`ReproConfig::shortid_codec`] and [`ReproConfig::trust_token`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self
            .shortids
            .namespaces
            .iter()
            .any(|n| n == RUN_NAMESPACE)
        {
            return Err(ConfigError(format!(
                "shortids.namespaces must include {RUN_NAMESPACE:?}"
            )));
        }
        if self.shortids.namespaces.iter().any(|n| n.is_empty()) {
            return Err(ConfigError("shortids.namespaces contains an empty name".into()));
        }
        if self.queue.queue_name.is_empty() {
            return Err(ConfigError("queue.queue_name must not be empty".into()));
        }
        if self.queue.pending_capacity == 0 {
            return Err(ConfigError("queue.pending_capacity must be positive".into()));
        }
        if self.upload.max_bytes == 0 || self.proxy.max_body_bytes == 0 {
            return Err(ConfigError("size limits must be positive".into()));
        }
        if self.proxy.trust_header.is_empty() {
            return Err(ConfigError("proxy.trust_header must not be empty".into()));
        }
        for url in [&self.providers.osf_api_url, &self.providers.figshare_api_url] {
            url::Url::parse(url)
                .map_err(|e| ConfigError(format!("invalid provider API url {url:?}: {e}")))?;
        }
        if self.proxy.sidecar_port == Some(0) {
            return Err(ConfigError("proxy.sidecar_port must be non-zero".into()));
        }
        Ok(())
    }

    pub fn shortid_codec(&self) -> Result<ShortIdCodec, ConfigError> {
        let salt = self.shortids.salt.as_ref().ok_or_else(|| {
            ConfigError("short id salt is not set (shortids.salt or REPRO_SHORTIDS_SALT)".into())
        })?;
        ShortIdCodec::new(salt.expose_secret().as_bytes(), &self.shortids.namespaces)
            .map_err(|e| ConfigError(e.to_string()))
    }

    pub fn trust_token(&self) -> Result<&SecretString, ConfigError> {
        self.proxy.trust_token.as_ref().ok_or_else(|| {
            ConfigError("trust token is not set (proxy.trust_token or REPRO_TRUST_TOKEN)".into())
        })
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.storage.db_path);
        resolve(&mut self.queue.broker_path);
        if let Some(dir) = self.storage.staging_dir.as_mut() {
            resolve(dir);
        }
        if !self.storage.blob_url.contains("://") && Path::new(&self.storage.blob_url).is_relative()
        {
            self.storage.blob_url = base.join(&self.storage.blob_url).to_string_lossy().into_owned();
        }
    }
}
