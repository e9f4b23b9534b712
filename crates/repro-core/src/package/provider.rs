//! Resolving packages hosted on OSF and Figshare.
//!
//! A provider id is turned into a download link (plus, for OSF, the file's
//! SHA-256 when the provider knows it) by one JSON API call.

use std::time::Duration;

use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use url::Url;

use crate::config::ProvidersConfig;
use crate::errors::{ConfigError, ReproError, Result};
use crate::model::ContentHash;

const USER_AGENT_VALUE: &str = concat!("repro/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Osf,
    Figshare,
}

impl Provider {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "osf.io" => Ok(Self::Osf),
            "figshare.com" => Ok(Self::Figshare),
            other => Err(ReproError::InvalidProviderId {
                provider: other.to_string(),
                id: String::new(),
                reason: "no such provider".into(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Osf => "osf.io",
            Self::Figshare => "figshare.com",
        }
    }

    /// `<provider>/<id>`, as stored on the upload row.
    pub fn key(&self, id: &str) -> String {
        format!("{}/{}", self.as_str(), id)
    }

    fn invalid(&self, id: &str, reason: &str) -> ReproError {
        ReproError::InvalidProviderId {
            provider: self.as_str().to_string(),
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    fn failed(&self, reason: impl Into<String>) -> ReproError {
        ReproError::ProviderFailed {
            provider: self.as_str().to_string(),
            reason: reason.into(),
        }
    }
}

/// What the provider API said about a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub download_url: String,
    pub filename: String,
    pub sha256: Option<ContentHash>,
}

#[derive(Deserialize)]
struct OsfFile {
    data: OsfData,
}

#[derive(Deserialize)]
struct OsfData {
    links: OsfLinks,
    #[serde(default)]
    attributes: Option<OsfAttributes>,
}

#[derive(Deserialize)]
struct OsfLinks {
    download: String,
}

#[derive(Deserialize)]
struct OsfAttributes {
    name: Option<String>,
    extra: Option<OsfExtra>,
}

#[derive(Deserialize)]
struct OsfExtra {
    hashes: Option<OsfHashes>,
}

#[derive(Deserialize)]
struct OsfHashes {
    sha256: Option<String>,
}

#[derive(Deserialize)]
struct FigshareFile {
    download_url: String,
    name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
    osf_api: Url,
    figshare_api: Url,
}

impl ProviderClient {
    pub fn new(cfg: &ProvidersConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .default_headers(default_headers)
            .build()
            .map_err(|e| ReproError::storage(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            osf_api: api_root(&cfg.osf_api_url)?,
            figshare_api: api_root(&cfg.figshare_api_url)?,
        })
    }

    /// Looks the file up on the provider. Ids are validated before any
    /// request goes out.
    pub async fn resolve(&self, provider: Provider, id: &str) -> Result<RemoteFile> {
        match provider {
            Provider::Osf => self.resolve_osf(id).await,
            Provider::Figshare => self.resolve_figshare(id).await,
        }
    }

    async fn resolve_osf(&self, id: &str) -> Result<RemoteFile> {
        let provider = Provider::Osf;
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(provider.invalid(id, "not in the OSF format"));
        }
        let url = self.endpoint(&self.osf_api, &format!("files/{id}/"), provider)?;
        let body = self.get_json(provider, url).await?;
        let file: OsfFile = serde_json::from_slice(&body)
            .map_err(|e| provider.failed(format!("invalid data returned: {e}")))?;

        let attributes = file.data.attributes;
        let sha256 = attributes
            .as_ref()
            .and_then(|a| a.extra.as_ref())
            .and_then(|e| e.hashes.as_ref())
            .and_then(|h| h.sha256.as_deref())
            .and_then(|h| match ContentHash::parse(h) {
                Ok(hash) => Some(hash),
                Err(_) => {
                    tracing::warn!(event = "provider.bad_hash", provider = provider.as_str(), id, hash = h);
                    None
                }
            });
        let filename = attributes
            .and_then(|a| a.name)
            .unwrap_or_else(|| "unnamed_osf_file".to_string());

        Ok(RemoteFile {
            download_url: file.data.links.download,
            filename,
            sha256,
        })
    }

    async fn resolve_figshare(&self, id: &str) -> Result<RemoteFile> {
        let provider = Provider::Figshare;
        let (article, file) = id
            .split_once('/')
            .and_then(|(a, f)| Some((a.parse::<u64>().ok()?, f.parse::<u64>().ok()?)))
            .ok_or_else(|| provider.invalid(id, "not in 'article_id/file_id' format"))?;
        let url = self.endpoint(
            &self.figshare_api,
            &format!("articles/{article}/files/{file}"),
            provider,
        )?;
        let body = self.get_json(provider, url).await?;
        let file: FigshareFile = serde_json::from_slice(&body)
            .map_err(|e| provider.failed(format!("invalid data returned: {e}")))?;

        Ok(RemoteFile {
            download_url: file.download_url,
            filename: file
                .name
                .unwrap_or_else(|| "unnamed_figshare_file".to_string()),
            sha256: None,
        })
    }

    /// Starts the download and hands back the body as a reader.
    pub async fn open(
        &self,
        provider: Provider,
        file: &RemoteFile,
    ) -> Result<impl AsyncRead + Unpin + Send + 'static> {
        tracing::info!(event = "provider.download", provider = provider.as_str(), url = %file.download_url);
        let response = self
            .client
            .get(&file.download_url)
            .send()
            .await
            .map_err(|e| provider.failed(format!("download failed: {e}")))?;
        if !response.status().is_success() {
            return Err(provider.failed(format!("download returned HTTP {}", response.status())));
        }
        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(StreamReader::new(Box::pin(body)))
    }

    fn endpoint(&self, root: &Url, path: &str, provider: Provider) -> Result<Url> {
        root.join(path)
            .map_err(|e| provider.failed(format!("cannot build API url: {e}")))
    }

    async fn get_json(&self, provider: Provider, url: Url) -> Result<bytes::Bytes> {
        tracing::info!(event = "provider.lookup", provider = provider.as_str(), url = %url);
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| provider.failed(format!("request failed: {e}")))?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            tracing::info!(event = "provider.http_error", provider = provider.as_str(), status = status.as_u16());
            return Err(provider.failed(format!("HTTP error {}", status.as_u16())));
        }
        response
            .bytes()
            .await
            .map_err(|e| provider.failed(format!("failed to read response body: {e}")))
    }
}

/// API roots must end in `/` or `Url::join` drops their last segment.
fn api_root(raw: &str) -> Result<Url> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&with_slash)
        .map_err(|e| ConfigError(format!("invalid provider API url {raw:?}: {e}")).into())
}
