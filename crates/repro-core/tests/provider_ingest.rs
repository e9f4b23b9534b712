use std::sync::Arc;

use repro_core::config::ProvidersConfig;
use repro_core::digest::sha256_hex;
use repro_core::errors::ReproError;
use repro_core::model::BuildStatus;
use repro_core::package::{PackageStore, ProviderClient};
use repro_core::storage::blob::ObjectBlobStore;
use repro_core::storage::store::Store;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn packages() -> PackageStore {
    let store = Store::memory().unwrap();
    store.init_schema().unwrap();
    PackageStore::new(store, Arc::new(ObjectBlobStore::memory()))
}

fn client(server: &MockServer) -> ProviderClient {
    ProviderClient::new(&ProvidersConfig {
        osf_api_url: format!("{}/osf/v2/", server.uri()),
        figshare_api_url: format!("{}/figshare/v2", server.uri()),
        timeout_secs: 5,
    })
    .unwrap()
}

#[tokio::test]
async fn test_osf_known_hash_skips_download() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let pkg = packages();
    let first = pkg
        .ingest_upload(&b"osf package"[..], "local.rpz", "192.0.2.1")
        .await?;

    Mock::given(method("GET"))
        .and(path("/osf/v2/files/abc123/"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "links": { "download": format!("{}/download/abc123", server.uri()) },
                "attributes": {
                    "name": "remote.rpz",
                    "extra": { "hashes": { "sha256": sha256_hex(b"osf package") } }
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/download/abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"osf package".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let ing = pkg
        .ingest_from_provider(&client(&server), "osf.io", "abc123", "198.51.100.7")
        .await?;
    assert_eq!(ing.hash, first.hash);
    assert!(!ing.is_new);
    assert_eq!(ing.upload.filename, "remote.rpz");
    assert_eq!(ing.upload.provider_key.as_deref(), Some("osf.io/abc123"));

    let uploads = pkg.store().uploads_for(&ing.hash)?;
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].provider_key, None);
    Ok(())
}

#[tokio::test]
async fn test_osf_unknown_hash_downloads_and_stores() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let pkg = packages();

    Mock::given(method("GET"))
        .and(path("/osf/v2/files/xyz/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "links": { "download": format!("{}/download/xyz", server.uri()) },
                "attributes": {
                    "extra": { "hashes": { "sha256": sha256_hex(b"fresh bytes") } }
                }
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/download/xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh bytes".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let ing = pkg
        .ingest_from_provider(&client(&server), "osf.io", "xyz", "::1")
        .await?;
    assert!(ing.is_new);
    assert_eq!(ing.hash.as_str(), sha256_hex(b"fresh bytes"));
    assert_eq!(ing.upload.filename, "unnamed_osf_file");
    assert_eq!(ing.experiment.status, BuildStatus::NoBuild);

    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("pkg.rpz");
    pkg.download(&ing.hash, &dest).await?;
    assert_eq!(std::fs::read(&dest)?, b"fresh bytes");
    Ok(())
}

#[tokio::test]
async fn test_figshare_downloads_by_article_and_file() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let pkg = packages();

    Mock::given(method("GET"))
        .and(path("/figshare/v2/articles/123/files/456"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "download_url": format!("{}/ndownloader/files/456", server.uri()),
            "name": "paper experiment.rpz"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ndownloader/files/456"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"figshare bytes".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let ing = pkg
        .ingest_from_provider(&client(&server), "figshare.com", "123/456", "::1")
        .await?;
    assert_eq!(ing.hash.as_str(), sha256_hex(b"figshare bytes"));
    assert_eq!(ing.upload.filename, "paperexperiment.rpz");
    assert_eq!(
        ing.upload.provider_key.as_deref(),
        Some("figshare.com/123/456")
    );
    Ok(())
}

#[tokio::test]
async fn test_provider_errors_leave_nothing() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let pkg = packages();
    let providers = client(&server);

    Mock::given(method("GET"))
        .and(path("/osf/v2/files/gone/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/osf/v2/files/junk/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/figshare/v2/articles/1/files/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "x.rpz" })))
        .mount(&server)
        .await;

    for (provider, id) in [("osf.io", "gone"), ("osf.io", "junk"), ("figshare.com", "1/2")] {
        let err = pkg
            .ingest_from_provider(&providers, provider, id, "::1")
            .await
            .unwrap_err();
        assert!(matches!(err, ReproError::ProviderFailed { .. }), "{provider}/{id}: {err}");
        assert_eq!(err.http_status(), 502);
    }

    let err = pkg
        .ingest_from_provider(&providers, "osf.io", "../etc", "::1")
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 400);
    let err = pkg
        .ingest_from_provider(&providers, "dropbox.com", "abc", "::1")
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 400);

    assert_eq!(pkg.store().count_rows("experiments")?, 0);
    assert_eq!(pkg.store().count_rows("uploads")?, 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_download_is_provider_error() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let pkg = packages();

    Mock::given(method("GET"))
        .and(path("/figshare/v2/articles/7/files/8"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "download_url": format!("{}/ndownloader/files/8", server.uri()),
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ndownloader/files/8"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = pkg
        .ingest_from_provider(&client(&server), "figshare.com", "7/8", "::1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "E_PROVIDER");
    assert_eq!(pkg.store().count_rows("uploads")?, 0);
    Ok(())
}
