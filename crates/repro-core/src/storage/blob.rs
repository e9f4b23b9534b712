//! Content-addressed package bytes, keyed by hash.
//!
//! Backed by `object_store`, so the same code writes to a local directory,
//! S3 (or compatible) and memory for tests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, ObjectStoreExt, WriteMultipart};
use tokio::io::AsyncReadExt;

use crate::model::ContentHash;

const PART_SIZE: usize = 8 * 1024 * 1024;
const MAX_CONCURRENT_PARTS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {key}")]
    NotFound { key: String },

    #[error("invalid blob store spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("object store error: {0}")]
    ObjectStore(object_store::Error),
}

impl BlobError {
    pub fn from_object_store(err: object_store::Error, key: &str) -> Self {
        match err {
            object_store::Error::NotFound { .. } => BlobError::NotFound {
                key: key.to_string(),
            },
            other => BlobError::ObjectStore(other),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, hash: &ContentHash) -> Result<bool, BlobError>;

    /// Stores the file's bytes under `hash`. Overwriting an existing blob is
    /// harmless: same hash, same bytes.
    async fn put_file(&self, hash: &ContentHash, path: &Path) -> Result<(), BlobError>;

    async fn get(&self, hash: &ContentHash) -> Result<Bytes, BlobError>;

    async fn get_stream(
        &self,
        hash: &ContentHash,
    ) -> Result<BoxStream<'static, Result<Bytes, BlobError>>, BlobError>;
}

/// Parsed blob store location: `s3://bucket/prefix`, `file:///dir`, `memory://`.
#[derive(Debug, Clone)]
pub struct BlobSpec {
    pub scheme: String,
    pub bucket: Option<String>,
    pub prefix: String,
    pub region: Option<String>,
}

impl BlobSpec {
    /// A value without `://` is taken as a local directory.
    pub fn parse(spec: &str) -> Result<Self, BlobError> {
        if !spec.contains("://") {
            return Ok(Self {
                scheme: "file".to_string(),
                bucket: None,
                prefix: spec.to_string(),
                region: None,
            });
        }

        let url = url::Url::parse(spec).map_err(|e| BlobError::InvalidSpec {
            spec: spec.to_string(),
            reason: e.to_string(),
        })?;
        let region = url
            .query_pairs()
            .find(|(k, _)| k == "region")
            .map(|(_, v)| v.to_string());

        let scheme = url.scheme().to_string();
        let (bucket, prefix) = if scheme == "file" {
            (None, url.path().to_string())
        } else {
            (
                url.host_str().map(|s| s.to_string()),
                url.path().trim_start_matches('/').to_string(),
            )
        };

        Ok(Self {
            scheme,
            bucket,
            prefix,
            region,
        })
    }
}

pub struct ObjectBlobStore {
    inner: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectBlobStore {
    pub fn from_spec(spec: &BlobSpec) -> Result<Self, BlobError> {
        let (inner, prefix): (Arc<dyn ObjectStore>, String) = match spec.scheme.as_str() {
            "memory" => (
                Arc::new(object_store::memory::InMemory::new()),
                String::new(),
            ),
            "file" => {
                let dir = if spec.prefix.is_empty() {
                    ".repro/blobs"
                } else {
                    spec.prefix.as_str()
                };
                std::fs::create_dir_all(dir).map_err(|e| BlobError::Io {
                    message: format!("failed to create blob directory {}: {}", dir, e),
                })?;
                let fs = object_store::local::LocalFileSystem::new_with_prefix(dir).map_err(
                    |e| BlobError::Io {
                        message: format!("failed to open local blob store at {}: {}", dir, e),
                    },
                )?;
                (Arc::new(fs), String::new())
            }
            "s3" => {
                let bucket = spec.bucket.as_ref().ok_or_else(|| BlobError::InvalidSpec {
                    spec: format!("s3:///{}", spec.prefix),
                    reason: "S3 URL must include bucket name".to_string(),
                })?;
                let mut builder = object_store::aws::AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_allow_http(false);
                if let Some(region) = &spec.region {
                    builder = builder.with_region(region);
                }
                let s3 = builder.build().map_err(|e| BlobError::Io {
                    message: format!("failed to create S3 client: {}", e),
                })?;
                (Arc::new(s3), spec.prefix.trim_end_matches('/').to_string())
            }
            scheme => {
                return Err(BlobError::InvalidSpec {
                    spec: spec.scheme.clone(),
                    reason: format!("unsupported scheme: {}", scheme),
                })
            }
        };
        Ok(Self { inner, prefix })
    }

    pub fn memory() -> Self {
        Self {
            inner: Arc::new(object_store::memory::InMemory::new()),
            prefix: String::new(),
        }
    }

    fn key(&self, hash: &ContentHash) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(format!("experiments/{}", hash))
        } else {
            ObjectPath::from(format!("{}/experiments/{}", self.prefix, hash))
        }
    }
}

pub fn open_blob_store(spec: &str) -> Result<Arc<dyn BlobStore>, BlobError> {
    let spec = BlobSpec::parse(spec)?;
    Ok(Arc::new(ObjectBlobStore::from_spec(&spec)?))
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn exists(&self, hash: &ContentHash) -> Result<bool, BlobError> {
        let key = self.key(hash);
        match self.inner.head(&key).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(BlobError::from_object_store(e, key.as_ref())),
        }
    }

    async fn put_file(&self, hash: &ContentHash, path: &Path) -> Result<(), BlobError> {
        let key = self.key(hash);
        let io = |e: std::io::Error| BlobError::Io {
            message: format!("failed to read staged upload {}: {}", path.display(), e),
        };

        let mut file = tokio::fs::File::open(path).await.map_err(io)?;
        let upload = self
            .inner
            .put_multipart(&key)
            .await
            .map_err(|e| BlobError::from_object_store(e, key.as_ref()))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(io(e));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.wait_for_capacity(MAX_CONCURRENT_PARTS).await {
                let _ = writer.abort().await;
                return Err(BlobError::from_object_store(e, key.as_ref()));
            }
            writer.write(&buf[..n]);
        }

        writer
            .finish()
            .await
            .map_err(|e| BlobError::from_object_store(e, key.as_ref()))?;
        tracing::debug!(event = "blob.put", key = %key);
        Ok(())
    }

    async fn get(&self, hash: &ContentHash) -> Result<Bytes, BlobError> {
        let key = self.key(hash);
        let result = self
            .inner
            .get(&key)
            .await
            .map_err(|e| BlobError::from_object_store(e, key.as_ref()))?;
        result
            .bytes()
            .await
            .map_err(|e| BlobError::from_object_store(e, key.as_ref()))
    }

    async fn get_stream(
        &self,
        hash: &ContentHash,
    ) -> Result<BoxStream<'static, Result<Bytes, BlobError>>, BlobError> {
        let key = self.key(hash);
        let result = self
            .inner
            .get(&key)
            .await
            .map_err(|e| BlobError::from_object_store(e, key.as_ref()))?;
        let name = key.to_string();
        Ok(result
            .into_stream()
            .map_err(move |e| BlobError::from_object_store(e, &name))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn hash(c: char) -> ContentHash {
        ContentHash::parse(&c.to_string().repeat(64)).unwrap()
    }

    #[test]
    fn test_parse_specs() {
        let s3 = BlobSpec::parse("s3://packages/repro?region=eu-west-1").unwrap();
        assert_eq!(s3.scheme, "s3");
        assert_eq!(s3.bucket.as_deref(), Some("packages"));
        assert_eq!(s3.prefix, "repro");
        assert_eq!(s3.region.as_deref(), Some("eu-west-1"));

        let file = BlobSpec::parse("file:///var/lib/repro/blobs").unwrap();
        assert_eq!(file.scheme, "file");
        assert_eq!(file.prefix, "/var/lib/repro/blobs");

        let bare = BlobSpec::parse("data/blobs").unwrap();
        assert_eq!(bare.scheme, "file");
        assert_eq!(bare.prefix, "data/blobs");

        assert!(ObjectBlobStore::from_spec(&BlobSpec::parse("ftp://x/y").unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_put_get_exists() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged");
        std::fs::write(&staged, b"package bytes").unwrap();

        let store = ObjectBlobStore::memory();
        let h = hash('a');
        assert!(!store.exists(&h).await.unwrap());
        store.put_file(&h, &staged).await.unwrap();
        assert!(store.exists(&h).await.unwrap());
        assert_eq!(store.get(&h).await.unwrap().as_ref(), b"package bytes");

        let chunks: Vec<Bytes> = store.get_stream(&h).await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"package bytes");

        assert!(matches!(
            store.get(&hash('b')).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_directory_store() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("blobs");
        let store = open_blob_store(&root.to_string_lossy()).unwrap();

        let staged = dir.path().join("staged");
        std::fs::write(&staged, vec![7u8; 200_000]).unwrap();
        let h = hash('c');
        store.put_file(&h, &staged).await.unwrap();

        let on_disk = root.join("experiments").join(h.as_str());
        assert_eq!(std::fs::read(on_disk).unwrap().len(), 200_000);
    }
}
