//! Process wiring: which listeners run, what they share, and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use futures::future::BoxFuture;
use futures::FutureExt;
use repro_core::build::BuildService;
use repro_core::config::ReproConfig;
use repro_core::package::{PackageStore, ProviderClient};
use repro_core::queue::{BuildQueue, QueueSettings, SqliteBroker};
use repro_core::storage::{open_blob_store, Store};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::proxy::external::ExternalProxy;
use crate::proxy::sidecar::SidecarProxy;
use crate::proxy::Forwarder;
use crate::web::{self, WebState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Upload and status API only.
    Web,
    /// Public run proxy only.
    Proxy,
    /// Web API and public proxy in one process.
    All,
    /// In-run sidecar forwarding to 127.0.0.1.
    Sidecar,
}

impl Mode {
    fn serves_web(self) -> bool {
        matches!(self, Mode::Web | Mode::All)
    }

    fn serves_proxy(self) -> bool {
        matches!(self, Mode::Proxy | Mode::All)
    }
}

/// Opens the store, blob store and build queue, and recovers builds that
/// were QUEUED when the previous process stopped.
pub async fn open_web_state(cfg: &ReproConfig) -> Result<(WebState, Arc<BuildQueue>)> {
    let store = Store::open(&cfg.storage.db_path)
        .with_context(|| format!("cannot open database {}", cfg.storage.db_path.display()))?;
    store.init_schema()?;
    let blobs = open_blob_store(&cfg.storage.blob_url)
        .with_context(|| format!("cannot open blob store {}", cfg.storage.blob_url))?;
    let packages = PackageStore::from_config(store.clone(), blobs, cfg);
    let providers = ProviderClient::new(&cfg.providers)?;

    let broker = Arc::new(SqliteBroker::new(&cfg.queue.broker_path));
    let queue = Arc::new(BuildQueue::start(broker, QueueSettings::from(&cfg.queue)));
    let builds = BuildService::new(store, queue.clone());

    if cfg.queue.requeue_on_start {
        let n = builds
            .requeue_pending()
            .await
            .context("cannot requeue pending builds")?;
        tracing::info!(event = "startup.requeue", count = n);
    }
    Ok((
        WebState {
            packages,
            builds,
            providers,
        },
        queue,
    ))
}

pub struct Server;

impl Server {
    pub async fn run(mode: Mode, cfg: ReproConfig, server: ServerConfig) -> Result<()> {
        let shutdown = CancellationToken::new();
        tokio::spawn(watch_signals(shutdown.clone()));

        let mut tasks: Vec<BoxFuture<'static, Result<()>>> = Vec::new();
        let mut queue = None;

        if mode == Mode::Sidecar {
            let sidecar = SidecarProxy::from_config(&cfg, Forwarder::from_config(&cfg.proxy)?)?;
            tasks.push(
                serve("sidecar", server.sidecar_addr.clone(), sidecar.router(), shutdown.clone())
                    .boxed(),
            );
        }
        if mode.serves_web() {
            let (state, q) = open_web_state(&cfg).await?;
            queue = Some(q);
            let router = web::router(state, server.request_timeout());
            tasks.push(serve("web", server.web_addr.clone(), router, shutdown.clone()).boxed());
        }
        if mode.serves_proxy() {
            let codec = Arc::new(cfg.shortid_codec()?);
            let forwarder = Forwarder::from_config(&cfg.proxy)?;
            let proxy = ExternalProxy::from_config(codec, &cfg, forwarder)?;
            tasks.push(
                serve("proxy", server.proxy_addr.clone(), proxy.router(), shutdown.clone())
                    .boxed(),
            );
        }

        let served = futures::future::try_join_all(tasks).await;
        shutdown.cancel();

        if let Some(queue) = queue {
            let drained = queue.shutdown(server.shutdown_grace()).await;
            tracing::info!(event = "server_stop", queue_drained = drained);
        }
        served.map(|_| ())
    }
}

async fn serve(
    name: &'static str,
    addr: String,
    router: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {name} listener on {addr}"))?;
    tracing::info!(event = "listening", listener = name, addr = %listener.local_addr()?);
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .with_context(|| format!("{name} listener failed"))?;
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(event = "signal_error", error = %e);
        return;
    }
    tracing::info!(event = "shutdown_requested");
    shutdown.cancel();
}
