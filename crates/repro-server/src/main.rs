use anyhow::Result;
use clap::Parser;
use repro_core::config::ReproConfig;
use repro_server::config;
use repro_server::server::{Mode, Server};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML config file; environment variables override it.
    #[arg(long, env = "REPRO_CONFIG")]
    config: Option<PathBuf>,

    /// Fail on unknown config keys instead of warning.
    #[arg(long)]
    strict: bool,

    #[arg(long, value_enum, default_value = "all")]
    mode: Mode,
}

use tracing_subscriber::{fmt, EnvFilter};

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let server_cfg = config::ServerConfig::from_env();

    init_logging(&server_cfg.log_level);

    let cfg = ReproConfig::load(args.config.as_deref(), args.strict)?;

    tracing::info!(
        event = "server_start",
        mode = ?args.mode,
        server = ?server_cfg,
        config = ?cfg
    );

    Server::run(args.mode, cfg, server_cfg).await
}
