//! Builder side of the pipeline: lease a request, report progress and the
//! outcome, release the delivery.

use crate::cli::args::{
    BuilderBuiltArgs, BuilderErrorArgs, BuilderLogArgs, BuilderNextArgs, BuilderReleaseArgs,
};
use anyhow::Context;
use repro_core::config::ReproConfig;
use repro_core::model::{BuildParameters, ContentHash};
use repro_core::queue::{BrokerConsumer, SqliteBroker};
use repro_core::ReproError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{exit_codes, Services};

const LOG_CHUNK: usize = 64 * 1024;

fn consumer(cfg: &ReproConfig) -> anyhow::Result<BrokerConsumer> {
    let consumer = SqliteBroker::new(&cfg.queue.broker_path)
        .consumer()
        .with_context(|| format!("cannot open broker {}", cfg.queue.broker_path.display()))?;
    consumer.declare_queue(&cfg.queue.queue_name)?;
    Ok(consumer)
}

pub async fn cmd_next(cfg: &ReproConfig, args: BuilderNextArgs) -> anyhow::Result<i32> {
    let mut consumer = consumer(cfg)?;
    let lease = args
        .lease_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| cfg.queue.lease());
    let services = Services::open(cfg).await?;

    let code = loop {
        let Some(delivery) = consumer.receive(&cfg.queue.queue_name, lease)? else {
            eprintln!("no build requested");
            break exit_codes::NO_WORK;
        };
        let Some(hash) = delivery.content_hash() else {
            tracing::warn!(event = "builder.bad_message", delivery = delivery.id);
            consumer.ack(delivery.id)?;
            continue;
        };

        // Only a redelivery may take over a build that is already running.
        let started = if delivery.is_redelivery() {
            services.builds.restart_build(&hash)
        } else {
            services.builds.start_build(&hash)
        };
        let previous = match started {
            Ok(previous) => previous,
            Err(ReproError::InvalidTransition { from, .. }) => {
                // Duplicate of a request that is running or finished.
                eprintln!("skipping {hash}: already {from}");
                consumer.ack(delivery.id)?;
                continue;
            }
            Err(ReproError::NotFound { .. }) => {
                eprintln!("skipping {hash}: unknown experiment");
                consumer.ack(delivery.id)?;
                continue;
            }
            Err(e) => {
                consumer.nack(delivery.id)?;
                return Err(e.into());
            }
        };

        let package = match &args.download {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let dest = dir.join(format!("{hash}.rpz"));
                services.packages.download(&hash, &dest).await?;
                Some(dest)
            }
            None => None,
        };

        let out = serde_json::json!({
            "delivery": delivery.id,
            "hash": hash,
            "redelivery": delivery.is_redelivery(),
            "previous_status": previous,
            "package": package,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        break exit_codes::OK;
    };
    services.close().await?;
    Ok(code)
}

pub async fn cmd_log(cfg: &ReproConfig, args: BuilderLogArgs) -> anyhow::Result<i32> {
    let hash = ContentHash::parse(&args.hash)?;
    let services = Services::open(cfg).await?;
    let len = match &args.file {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            append_stream(&services, &hash, file).await?
        }
        None => append_stream(&services, &hash, tokio::io::stdin()).await?,
    };
    eprintln!("log length: {len}");
    services.close().await?;
    Ok(exit_codes::OK)
}

async fn append_stream<R>(services: &Services, hash: &ContentHash, mut reader: R) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; LOG_CHUNK];
    let mut len = services.builds.get_log(hash, u64::MAX)?.next_offset;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        len = services.builds.append_log(hash, &buf[..n])?;
    }
    Ok(len)
}

pub async fn cmd_built(cfg: &ReproConfig, args: BuilderBuiltArgs) -> anyhow::Result<i32> {
    let hash = ContentHash::parse(&args.hash)?;
    let params = parse_params(&args.params)?;
    let services = Services::open(cfg).await?;
    services.builds.finish_built(&hash, &params)?;
    if let Some(id) = args.delivery {
        consumer(cfg)?.ack(id)?;
    }
    eprintln!("{hash} BUILT");
    services.close().await?;
    Ok(exit_codes::OK)
}

pub async fn cmd_error(cfg: &ReproConfig, args: BuilderErrorArgs) -> anyhow::Result<i32> {
    let hash = ContentHash::parse(&args.hash)?;
    let services = Services::open(cfg).await?;
    services.builds.finish_error(&hash, &args.message)?;
    if let Some(id) = args.delivery {
        consumer(cfg)?.ack(id)?;
    }
    eprintln!("{hash} ERROR");
    services.close().await?;
    Ok(exit_codes::OK)
}

pub fn cmd_release(cfg: &ReproConfig, args: BuilderReleaseArgs) -> anyhow::Result<i32> {
    let consumer = consumer(cfg)?;
    let found = if args.requeue {
        consumer.nack(args.delivery)?
    } else {
        consumer.ack(args.delivery)?
    };
    if !found {
        eprintln!("delivery {} not found", args.delivery);
        return Ok(exit_codes::FAILED);
    }
    Ok(exit_codes::OK)
}

/// `key=value` pairs; a value that parses as JSON is kept as JSON, anything
/// else becomes a string.
pub fn parse_params(pairs: &[String]) -> anyhow::Result<BuildParameters> {
    let mut params = BuildParameters::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("expected key=value, got {pair:?}"))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("empty parameter name in {pair:?}");
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}
