//! Upload and status API.
//!
//! - `POST /upload?filename=<name>`: raw package body, returns `{hash, code, new}`.
//! - `POST /provider/{provider}/{id}`: fetch a package from `osf.io` or
//!   `figshare.com`, same response as `/upload`.
//! - `GET /reproduce/{code}?log_from=N`: status, new log bytes and build
//!   parameters. The first view of an unbuilt experiment requests its build.
//! - `GET /health`

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::TryStreamExt;
use repro_core::build::BuildService;
use repro_core::model::{BuildParameters, BuildStatus, ExperimentCode};
use repro_core::package::{Ingested, PackageStore, ProviderClient};
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;

use crate::error::ApiError;

const DEFAULT_FILENAME: &str = "package.rpz";

#[derive(Clone)]
pub struct WebState {
    pub packages: PackageStore,
    pub builds: BuildService,
    pub providers: ProviderClient,
}

pub fn router(state: WebState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/provider/{provider}/{*id}", post(from_provider))
        .route("/reproduce/{code}", get(reproduce))
        .layer(middleware::from_fn_with_state(request_timeout, with_timeout))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn with_timeout(State(limit): State<Duration>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => {
            tracing::warn!(event = "api.timeout", path = %path, limit_ms = limit.as_millis() as u64);
            (StatusCode::REQUEST_TIMEOUT, "request timed out").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub hash: String,
    pub code: String,
    pub new: bool,
}

async fn upload(
    State(state): State<WebState>,
    Query(query): Query<UploadQuery>,
    req: Request,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let client = client_addr(&req);
    let filename = query
        .filename
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

    let body = req
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let ingested = state
        .packages
        .ingest_upload(StreamReader::new(body), &filename, &client)
        .await?;
    Ok(uploaded(&ingested))
}

async fn from_provider(
    State(state): State<WebState>,
    Path((provider, id)): Path<(String, String)>,
    req: Request,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let client = client_addr(&req);
    let ingested = state
        .packages
        .ingest_from_provider(&state.providers, &provider, &id, &client)
        .await?;
    Ok(uploaded(&ingested))
}

fn client_addr(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn uploaded(ingested: &Ingested) -> (StatusCode, Json<UploadResponse>) {
    let status = if ingested.is_new {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(UploadResponse {
            hash: ingested.hash.to_string(),
            code: ingested.code().encode(),
            new: ingested.is_new,
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct ReproduceQuery {
    #[serde(default)]
    pub log_from: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReproduceResponse {
    pub hash: String,
    pub filename: String,
    pub status: BuildStatus,
    pub log: String,
    pub log_offset: u64,
    pub next_offset: u64,
    pub params: BuildParameters,
    pub triggered: bool,
}

async fn reproduce(
    State(state): State<WebState>,
    Path(code): Path<String>,
    Query(query): Query<ReproduceQuery>,
) -> Result<Json<ReproduceResponse>, ApiError> {
    let code = ExperimentCode::decode(&code)?;
    let poll = state.builds.poll(&code.hash, query.log_from).await?;
    Ok(Json(ReproduceResponse {
        hash: code.hash.to_string(),
        filename: code.filename,
        status: poll.experiment.status,
        log: String::from_utf8_lossy(&poll.log.data).into_owned(),
        log_offset: poll.log.offset,
        next_offset: poll.log.next_offset,
        params: poll.experiment.parameters,
        triggered: poll.triggered,
    }))
}
