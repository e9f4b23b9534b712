use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "repro",
    version,
    about = "Short ids, package ingestion and builder commands for repro"
)]
pub struct Cli {
    /// YAML config file; REPRO_* environment variables override it.
    #[arg(long, global = true, env = "REPRO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Fail on unknown config keys instead of warning.
    #[arg(long, global = true)]
    pub strict: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Encode an integer id as a short id
    Encode(EncodeArgs),
    /// Decode a short id back to its integer id
    Decode(DecodeArgs),
    /// Print the public hostname label for a run's port
    RunUrl(RunUrlArgs),
    /// Store a package file and record the upload
    Ingest(IngestArgs),
    /// Request a build for an uploaded experiment
    Trigger(RefArgs),
    /// Show an experiment's build status
    Status(StatusArgs),
    /// Print build log bytes from an offset
    Log(LogArgs),
    /// Row counts per table and status
    Stats,
    /// Builder side of the build queue
    Builder(BuilderArgs),
    Version,
}

#[derive(clap::Args, Debug, Clone)]
pub struct EncodeArgs {
    pub id: u64,

    #[arg(long, default_value = "run")]
    pub namespace: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DecodeArgs {
    pub short_id: String,

    #[arg(long, default_value = "run")]
    pub namespace: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunUrlArgs {
    pub run_id: u64,
    pub port: u16,

    /// Public domain appended to the label, e.g. `run.example.org`
    #[arg(long, env = "REPRO_PUBLIC_DOMAIN")]
    pub domain: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct IngestArgs {
    pub file: PathBuf,

    /// Name to record; defaults to the file's name
    #[arg(long)]
    pub filename: Option<String>,

    /// Submitter address to record
    #[arg(long, default_value = "cli")]
    pub submitter: String,
}

/// An experiment, by content hash or by experiment code.
#[derive(clap::Args, Debug, Clone)]
pub struct RefArgs {
    pub reference: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct StatusArgs {
    pub reference: String,

    #[arg(long, default_value = "text")]
    pub format: String, // text|json
}

#[derive(clap::Args, Debug, Clone)]
pub struct LogArgs {
    pub reference: String,

    #[arg(long, default_value_t = 0)]
    pub from: u64,
}

#[derive(Parser, Clone)]
pub struct BuilderArgs {
    #[command(subcommand)]
    pub cmd: BuilderSub,
}

#[derive(Subcommand, Clone)]
pub enum BuilderSub {
    /// Lease the next build request and mark it BUILDING
    Next(BuilderNextArgs),
    /// Append build output (from --file or stdin)
    Log(BuilderLogArgs),
    /// Mark a build BUILT with its parameters
    Built(BuilderBuiltArgs),
    /// Mark a build ERROR with a diagnostic
    Error(BuilderErrorArgs),
    /// Acknowledge a delivery, or hand it back with --requeue
    Release(BuilderReleaseArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct BuilderNextArgs {
    /// Directory to download the package into
    #[arg(long)]
    pub download: Option<PathBuf>,

    /// Lease length in seconds; defaults to queue.lease_secs
    #[arg(long)]
    pub lease_secs: Option<u64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BuilderLogArgs {
    pub hash: String,

    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BuilderBuiltArgs {
    pub hash: String,

    /// `key=value`; values are parsed as JSON when possible
    #[arg(long = "param")]
    pub params: Vec<String>,

    /// Acknowledge this delivery once recorded
    #[arg(long)]
    pub delivery: Option<i64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BuilderErrorArgs {
    pub hash: String,

    #[arg(long)]
    pub message: String,

    #[arg(long)]
    pub delivery: Option<i64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BuilderReleaseArgs {
    pub delivery: i64,

    #[arg(long)]
    pub requeue: bool,
}
