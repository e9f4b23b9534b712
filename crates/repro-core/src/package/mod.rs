//! Content-addressed package ingestion.
//!
//! Uploads are hashed and spooled to a staging file in one pass, then stored
//! in the blob store keyed by hash (once per distinct content) before any row
//! is written.

pub mod filename;
pub mod provider;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::config::ReproConfig;
use crate::digest::{ContentHasher, CHUNK_SIZE};
use crate::errors::{ReproError, Result};
use crate::model::{ContentHash, Experiment, ExperimentCode, Upload};
use crate::storage::{BlobStore, Store};

pub use filename::sanitize_filename;
pub use provider::{Provider, ProviderClient, RemoteFile};

/// Outcome of ingesting one upload.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub hash: ContentHash,
    pub experiment: Experiment,
    pub upload: Upload,
    /// True only for the call that created the experiment.
    pub is_new: bool,
}

impl Ingested {
    pub fn code(&self) -> ExperimentCode {
        ExperimentCode::new(self.hash.clone(), self.upload.filename.clone())
    }
}

struct Staged {
    hash: ContentHash,
    len: u64,
    file: tempfile::NamedTempFile,
}

#[derive(Clone)]
pub struct PackageStore {
    store: Store,
    blobs: Arc<dyn BlobStore>,
    staging_dir: Option<PathBuf>,
    max_upload_bytes: u64,
}

impl PackageStore {
    pub fn new(store: Store, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            blobs,
            staging_dir: None,
            max_upload_bytes: crate::config::ONE_GIB,
        }
    }

    pub fn from_config(store: Store, blobs: Arc<dyn BlobStore>, cfg: &ReproConfig) -> Self {
        let mut pkg = Self::new(store, blobs).with_max_upload_bytes(cfg.upload.max_bytes);
        pkg.staging_dir = cfg.storage.staging_dir.clone();
        pkg
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn with_max_upload_bytes(mut self, limit: u64) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Hashes `reader` and makes sure the experiment and its bytes exist.
    /// Returns the hash and whether this call created the experiment.
    pub async fn ingest<R>(&self, reader: R) -> Result<(ContentHash, bool)>
    where
        R: AsyncRead + Unpin,
    {
        let staged = self.stage(reader).await?;
        self.persist_blob(&staged).await?;
        let is_new = {
            let hash = staged.hash.clone();
            self.store.blocking(move |s| s.ensure_experiment(&hash)).await?
        };
        tracing::info!(event = "package.ingest", hash = %staged.hash, bytes = staged.len, new = is_new);
        Ok((staged.hash, is_new))
    }

    /// Appends an upload record for an already ingested experiment.
    pub fn record_upload(
        &self,
        hash: &ContentHash,
        filename: &str,
        client_addr: &str,
    ) -> Result<Upload> {
        self.store
            .record_upload(hash, &sanitize_filename(filename), client_addr, None)
    }

    /// `ingest` followed by `record_upload`, with both rows written in one
    /// transaction after the blob is stored.
    pub async fn ingest_upload<R>(
        &self,
        reader: R,
        filename: &str,
        client_addr: &str,
    ) -> Result<Ingested>
    where
        R: AsyncRead + Unpin,
    {
        self.ingest_named(reader, &sanitize_filename(filename), client_addr, None)
            .await
    }

    /// Fetches a package from a hosting provider and records the upload with
    /// its `<provider>/<id>` key.
    ///
    /// When the provider reports a SHA-256 that is already stored, nothing is
    /// downloaded.
    pub async fn ingest_from_provider(
        &self,
        providers: &ProviderClient,
        provider: &str,
        id: &str,
        client_addr: &str,
    ) -> Result<Ingested> {
        let provider = Provider::parse(provider)?;
        let remote = providers.resolve(provider, id).await?;
        let key = provider.key(id);
        let filename = sanitize_filename(&remote.filename);

        if let Some(hash) = remote.sha256.clone() {
            let known = {
                let (hash, filename, client, key) =
                    (hash.clone(), filename.clone(), client_addr.to_string(), key.clone());
                self.store
                    .blocking(move |s| {
                        if s.get_experiment(&hash)?.is_none() {
                            return Ok(None);
                        }
                        let upload = s.record_upload(&hash, &filename, &client, Some(&key))?;
                        let experiment = s
                            .get_experiment(&hash)?
                            .ok_or_else(|| ReproError::not_found(format!("experiment {hash}")))?;
                        Ok(Some((experiment, upload)))
                    })
                    .await?
            };
            if let Some((experiment, upload)) = known {
                tracing::info!(
                    event = "package.provider_known",
                    provider = provider.as_str(),
                    id,
                    hash = %hash,
                );
                return Ok(Ingested {
                    hash,
                    experiment,
                    upload,
                    is_new: false,
                });
            }
        }

        let reader = providers.open(provider, &remote).await?;
        self.ingest_named(reader, &filename, client_addr, Some(&key))
            .await
    }

    async fn ingest_named<R>(
        &self,
        reader: R,
        filename: &str,
        client_addr: &str,
        provider_key: Option<&str>,
    ) -> Result<Ingested>
    where
        R: AsyncRead + Unpin,
    {
        let staged = self.stage(reader).await?;
        self.persist_blob(&staged).await?;

        let (experiment, upload, is_new) = {
            let hash = staged.hash.clone();
            let (filename, client) = (filename.to_string(), client_addr.to_string());
            let key = provider_key.map(str::to_string);
            self.store
                .blocking(move |s| {
                    s.insert_experiment_with_upload(&hash, &filename, &client, key.as_deref())
                })
                .await?
        };
        tracing::info!(
            event = "package.upload",
            hash = %staged.hash,
            bytes = staged.len,
            new = is_new,
            filename = %filename,
            client = %client_addr,
            provider_key = ?provider_key,
        );
        Ok(Ingested {
            hash: staged.hash,
            experiment,
            upload,
            is_new,
        })
    }

    /// Streams the package bytes for `hash` into `dest`.
    pub async fn download(&self, hash: &ContentHash, dest: &Path) -> Result<u64> {
        let known = {
            let hash = hash.clone();
            self.store.blocking(move |s| s.get_experiment(&hash)).await?
        };
        if known.is_none() {
            return Err(ReproError::not_found(format!("experiment {hash}")));
        }
        let mut stream = self.blobs.get_stream(hash).await?;
        let mut out = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }

    async fn stage<R>(&self, mut reader: R) -> Result<Staged>
    where
        R: AsyncRead + Unpin,
    {
        let file = match &self.staging_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                tempfile::Builder::new().prefix("upload-").tempfile_in(dir)?
            }
            None => tempfile::Builder::new().prefix("upload-").tempfile()?,
        };
        let mut out = tokio::fs::File::from_std(file.reopen()?);

        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if hasher.len() + n as u64 > self.max_upload_bytes {
                tracing::warn!(
                    event = "package.too_large",
                    limit = self.max_upload_bytes,
                    seen = hasher.len() + n as u64,
                );
                return Err(ReproError::PayloadTooLarge {
                    limit: self.max_upload_bytes,
                });
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
        }
        out.flush().await?;
        out.sync_all().await?;

        let len = hasher.len();
        Ok(Staged {
            hash: hasher.finish(),
            len,
            file,
        })
    }

    async fn persist_blob(&self, staged: &Staged) -> Result<()> {
        let stored = {
            let hash = staged.hash.clone();
            self.store.blocking(move |s| s.get_experiment(&hash)).await?
        };
        if stored.is_some() {
            return Ok(());
        }
        // An earlier ingest may have stored the blob and failed before commit.
        if self.blobs.exists(&staged.hash).await? {
            tracing::debug!(event = "package.blob_reused", hash = %staged.hash);
            return Ok(());
        }
        self.blobs.put_file(&staged.hash, staged.file.path()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_hex;
    use crate::model::BuildStatus;
    use crate::storage::blob::ObjectBlobStore;

    fn packages() -> PackageStore {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        PackageStore::new(store, Arc::new(ObjectBlobStore::memory()))
    }

    #[tokio::test]
    async fn test_ingest_then_record_upload() {
        let pkg = packages();
        let (hash, new) = pkg.ingest(&b"experiment v1"[..]).await.unwrap();
        assert!(new);
        assert_eq!(hash.as_str(), sha256_hex(b"experiment v1"));

        let (again, new) = pkg.ingest(&b"experiment v1"[..]).await.unwrap();
        assert_eq!(again, hash);
        assert!(!new);

        let up = pkg.record_upload(&hash, "../exp.rpz", "192.0.2.1").unwrap();
        assert_eq!(up.filename, "exp.rpz");
        assert_eq!(
            pkg.store().get_experiment(&hash).unwrap().unwrap().status,
            BuildStatus::NoBuild
        );
    }

    #[tokio::test]
    async fn test_ingest_upload_returns_code() {
        let pkg = packages();
        let ing = pkg
            .ingest_upload(&b"bytes"[..], "my exp.rpz", "192.0.2.1")
            .await
            .unwrap();
        let code = ExperimentCode::decode(&ing.code().encode()).unwrap();
        assert_eq!(code.hash, ing.hash);
        assert_eq!(code.filename, "myexp.rpz");
    }

    #[tokio::test]
    async fn test_empty_upload_is_valid_content() {
        let pkg = packages();
        let (hash, _) = pkg.ingest(&b""[..]).await.unwrap();
        assert_eq!(hash.as_str(), sha256_hex(b""));
    }

    #[tokio::test]
    async fn test_oversize_upload_leaves_nothing() {
        let pkg = packages().with_max_upload_bytes(10);
        let err = pkg
            .ingest_upload(&[1u8; 11][..], "big.rpz", "::1")
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 413);
        assert_eq!(pkg.store().count_rows("experiments").unwrap(), 0);
        assert_eq!(pkg.store().count_rows("uploads").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_staging_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = packages().with_staging_dir(dir.path().join("staging"));
        pkg.ingest(&b"abc"[..]).await.unwrap();
        let _ = pkg.with_max_upload_bytes(1).ingest(&b"abc"[..]).await;
        let left = std::fs::read_dir(dir.path().join("staging")).unwrap().count();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn test_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = packages();
        let (hash, _) = pkg.ingest(&b"package body"[..]).await.unwrap();
        let dest = dir.path().join("out.rpz");
        assert_eq!(pkg.download(&hash, &dest).await.unwrap(), 12);
        assert_eq!(std::fs::read(&dest).unwrap(), b"package body");
    }
}
