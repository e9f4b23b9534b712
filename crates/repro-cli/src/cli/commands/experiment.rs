use crate::cli::args::{IngestArgs, LogArgs, RefArgs, StatusArgs};
use anyhow::Context;
use repro_core::build::Trigger;
use repro_core::config::ReproConfig;
use tokio::io::AsyncWriteExt;

use super::{exit_codes, open_store, parse_reference, Services};

pub async fn cmd_ingest(cfg: &ReproConfig, args: IngestArgs) -> anyhow::Result<i32> {
    let filename = match args.filename {
        Some(f) => f,
        None => args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("cannot open {}", args.file.display()))?;

    let services = Services::open(cfg).await?;
    let ingested = services
        .packages
        .ingest_upload(file, &filename, &args.submitter)
        .await?;
    let out = serde_json::json!({
        "hash": ingested.hash,
        "code": ingested.code().encode(),
        "filename": ingested.upload.filename,
        "new": ingested.is_new,
        "status": ingested.experiment.status,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    services.close().await?;
    Ok(exit_codes::OK)
}

pub async fn cmd_trigger(cfg: &ReproConfig, args: RefArgs) -> anyhow::Result<i32> {
    let hash = parse_reference(&args.reference)?;
    let services = Services::open(cfg).await?;
    match services.builds.request_build(&hash).await? {
        Trigger::Enqueued => eprintln!("queued {hash}"),
        Trigger::AlreadyRequested(status) => eprintln!("{hash} already {status}"),
    }
    services.close().await?;
    Ok(exit_codes::OK)
}

pub async fn cmd_status(cfg: &ReproConfig, args: StatusArgs) -> anyhow::Result<i32> {
    let hash = parse_reference(&args.reference)?;
    let services = Services::open(cfg).await?;
    let experiment = services.builds.status(&hash)?;

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&experiment)?);
    } else {
        let uploads = services.builds.store().uploads_for(&hash)?;
        println!("hash:     {}", experiment.hash);
        println!("status:   {}", experiment.status);
        println!("log:      {} bytes", experiment.log_len);
        println!("uploads:  {}", uploads.len());
        for (k, v) in &experiment.parameters {
            println!("param:    {k} = {v}");
        }
    }
    services.close().await?;
    Ok(exit_codes::OK)
}

pub async fn cmd_log(cfg: &ReproConfig, args: LogArgs) -> anyhow::Result<i32> {
    let hash = parse_reference(&args.reference)?;
    let services = Services::open(cfg).await?;
    let chunk = services.builds.get_log(&hash, args.from)?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&chunk.data).await?;
    stdout.flush().await?;
    eprintln!("next offset: {}", chunk.next_offset);
    services.close().await?;
    Ok(exit_codes::OK)
}

pub fn cmd_stats(cfg: &ReproConfig) -> anyhow::Result<i32> {
    let stats = open_store(cfg)?.stats()?;
    println!("experiments: {}", stats.experiments);
    println!("uploads:     {}", stats.uploads);
    for (status, n) in stats.by_status {
        println!("  {:<9} {n}", status.as_str());
    }
    Ok(exit_codes::OK)
}
