use super::args::*;
use anyhow::Context;
use repro_core::build::BuildService;
use repro_core::config::ReproConfig;
use repro_core::model::{ContentHash, ExperimentCode};
use repro_core::package::PackageStore;
use repro_core::queue::{BuildQueue, QueueSettings, SqliteBroker};
use repro_core::storage::{open_blob_store, Store};
use std::sync::Arc;
use std::time::Duration;

pub mod builder;
pub mod experiment;
pub mod shortid;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    /// `builder next` found nothing to build.
    pub const NO_WORK: i32 = 3;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let cfg = ReproConfig::load(cli.config.as_deref(), cli.strict)
        .map_err(|e| anyhow::anyhow!("config error: {}", e))?;

    match cli.cmd {
        Command::Encode(args) => shortid::cmd_encode(&cfg, args),
        Command::Decode(args) => shortid::cmd_decode(&cfg, args),
        Command::RunUrl(args) => shortid::cmd_run_url(&cfg, args),
        Command::Ingest(args) => experiment::cmd_ingest(&cfg, args).await,
        Command::Trigger(args) => experiment::cmd_trigger(&cfg, args).await,
        Command::Status(args) => experiment::cmd_status(&cfg, args).await,
        Command::Log(args) => experiment::cmd_log(&cfg, args).await,
        Command::Stats => experiment::cmd_stats(&cfg),
        Command::Builder(args) => match args.cmd {
            BuilderSub::Next(a) => builder::cmd_next(&cfg, a).await,
            BuilderSub::Log(a) => builder::cmd_log(&cfg, a).await,
            BuilderSub::Built(a) => builder::cmd_built(&cfg, a).await,
            BuilderSub::Error(a) => builder::cmd_error(&cfg, a).await,
            BuilderSub::Release(a) => builder::cmd_release(&cfg, a),
        },
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

/// Store, packages and build service for one command. The queue connects to
/// the broker only if something is published.
pub(crate) struct Services {
    pub packages: PackageStore,
    pub builds: BuildService,
    queue: Arc<BuildQueue>,
}

impl Services {
    pub async fn open(cfg: &ReproConfig) -> anyhow::Result<Self> {
        let store = open_store(cfg)?;
        let blobs = open_blob_store(&cfg.storage.blob_url)
            .with_context(|| format!("cannot open blob store {}", cfg.storage.blob_url))?;
        let packages = PackageStore::from_config(store.clone(), blobs, cfg);
        let broker = Arc::new(SqliteBroker::new(&cfg.queue.broker_path));
        let queue = Arc::new(BuildQueue::start(broker, QueueSettings::from(&cfg.queue)));
        let builds = BuildService::new(store, queue.clone());
        Ok(Self {
            packages,
            builds,
            queue,
        })
    }

    /// Waits for published requests to reach the broker.
    pub async fn close(self) -> anyhow::Result<()> {
        if !self.queue.shutdown(Duration::from_secs(10)).await {
            anyhow::bail!("build queue did not drain; pending requests stay QUEUED");
        }
        Ok(())
    }
}

pub(crate) fn open_store(cfg: &ReproConfig) -> anyhow::Result<Store> {
    let store = Store::open(&cfg.storage.db_path)
        .with_context(|| format!("cannot open database {}", cfg.storage.db_path.display()))?;
    store.init_schema()?;
    Ok(store)
}

/// A 64-hex content hash, or an experiment code as shown on upload.
pub(crate) fn parse_reference(reference: &str) -> anyhow::Result<ContentHash> {
    let reference = reference.trim();
    if reference.len() == ContentHash::HEX_LEN {
        if let Ok(hash) = ContentHash::parse(reference) {
            return Ok(hash);
        }
    }
    let code = ExperimentCode::decode(reference)
        .map_err(|_| anyhow::anyhow!("not a content hash or experiment code: {reference}"))?;
    Ok(code.hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_accepts_hash_and_code() {
        let hash = ContentHash::parse(&"ab".repeat(32)).unwrap();
        assert_eq!(parse_reference(hash.as_str()).unwrap(), hash);
        let code = ExperimentCode::new(hash.clone(), "paper.rpz").encode();
        assert_eq!(parse_reference(&code).unwrap(), hash);
        assert!(parse_reference("nope").is_err());
    }
}
