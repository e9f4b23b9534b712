use crate::cli::args::{DecodeArgs, EncodeArgs, RunUrlArgs};
use repro_core::config::ReproConfig;
use repro_core::run::public_label;

use super::exit_codes;

pub fn cmd_encode(cfg: &ReproConfig, args: EncodeArgs) -> anyhow::Result<i32> {
    let codec = cfg.shortid_codec()?;
    println!("{}", codec.encode(&args.namespace, args.id)?);
    Ok(exit_codes::OK)
}

pub fn cmd_decode(cfg: &ReproConfig, args: DecodeArgs) -> anyhow::Result<i32> {
    let codec = cfg.shortid_codec()?;
    match codec.decode(&args.namespace, &args.short_id) {
        Ok(id) => {
            println!("{id}");
            Ok(exit_codes::OK)
        }
        Err(e) => {
            eprintln!("error: {e}");
            Ok(exit_codes::FAILED)
        }
    }
}

pub fn cmd_run_url(cfg: &ReproConfig, args: RunUrlArgs) -> anyhow::Result<i32> {
    if args.port == 0 {
        anyhow::bail!("port must be non-zero");
    }
    let codec = cfg.shortid_codec()?;
    let label = public_label(&codec, args.run_id, args.port)?;
    match args.domain.as_deref().map(|d| d.trim_matches('.')) {
        Some(domain) if !domain.is_empty() => println!("{label}.{domain}"),
        _ => println!("{label}"),
    }
    Ok(exit_codes::OK)
}
