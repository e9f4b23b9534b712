//! Error types for the build pipeline and run addressing.

use crate::model::BuildStatus;
use crate::queue::QueueError;
use crate::shortid::ShortIdError;
use crate::storage::blob::BlobError;

pub type Result<T> = std::result::Result<T, ReproError>;

/// Configuration could not be read, parsed or validated.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum ReproError {
    /// Malformed or cross-namespace short id. Shown to clients as "not found".
    #[error("invalid short id: {0}")]
    InvalidShortId(#[from] ShortIdError),

    #[error("not found: {what}")]
    NotFound { what: String },

    /// The decoded run/port does not map to a reachable backend, or the
    /// backend did not answer in time.
    #[error("unresolvable backend {target}: {reason}")]
    UnresolvableBackend {
        target: String,
        reason: String,
        timed_out: bool,
    },

    /// Provider id that cannot name a file on that provider.
    #[error("invalid {provider} id {id:?}: {reason}")]
    InvalidProviderId {
        provider: String,
        id: String,
        reason: String,
    },

    /// The hosting provider refused, failed, or answered with unusable data.
    #[error("{provider}: {reason}")]
    ProviderFailed { provider: String, reason: String },

    #[error("build queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),

    #[error("experiment {hash}: cannot move from {from} to {to}")]
    InvalidTransition {
        hash: String,
        from: BuildStatus,
        to: BuildStatus,
    },

    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ReproError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Io(std::io::Error::other(message.into()))
    }

    /// Persistent store or blob store failures: fatal to the request.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Blob(_) | Self::Io(_) | Self::Serde(_)
        )
    }

    /// Stable machine-readable code, used in JSON error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            // Both map to the same code so callers cannot tell them apart.
            Self::InvalidShortId(_) | Self::NotFound { .. } => "E_NOT_FOUND",
            Self::UnresolvableBackend {
                timed_out: true, ..
            } => "E_GATEWAY_TIMEOUT",
            Self::UnresolvableBackend { .. } => "E_BAD_GATEWAY",
            Self::InvalidProviderId { .. } => "E_INVALID_PROVIDER_ID",
            Self::ProviderFailed { .. } => "E_PROVIDER",
            Self::QueueUnavailable(_) => "E_QUEUE_UNAVAILABLE",
            Self::InvalidTransition { .. } => "E_INVALID_TRANSITION",
            Self::PayloadTooLarge { .. } => "E_PAYLOAD_TOO_LARGE",
            Self::Config(_) => "E_CONFIG",
            Self::Database(_) | Self::Blob(_) | Self::Io(_) | Self::Serde(_) => "E_STORAGE",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidShortId(_) | Self::NotFound { .. } => 404,
            Self::UnresolvableBackend {
                timed_out: true, ..
            } => 504,
            Self::UnresolvableBackend { .. } | Self::ProviderFailed { .. } => 502,
            Self::InvalidProviderId { .. } => 400,
            Self::QueueUnavailable(_) => 503,
            Self::InvalidTransition { .. } => 409,
            Self::PayloadTooLarge { .. } => 413,
            Self::Config(_)
            | Self::Database(_)
            | Self::Blob(_)
            | Self::Io(_)
            | Self::Serde(_) => 500,
        }
    }

    /// Message safe to show to an end user. Storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidShortId(_) | Self::NotFound { .. } => "not found".to_string(),
            Self::QueueUnavailable(_) => "build queue is busy, retry later".to_string(),
            Self::UnresolvableBackend {
                timed_out: true, ..
            } => "backend timed out".to_string(),
            Self::UnresolvableBackend { .. } => "backend unavailable".to_string(),
            Self::InvalidTransition { .. }
            | Self::PayloadTooLarge { .. }
            | Self::InvalidProviderId { .. }
            | Self::ProviderFailed { .. } => self.to_string(),
            _ => "internal error".to_string(),
        }
    }
}
