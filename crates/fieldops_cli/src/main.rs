//! Operator CLI for local FieldOps data.
//!
//! # Responsibility
//! - Smoke-probe the core crate linkage.
//! - Inspect and export the persisted local snapshots without a session.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use fieldops_core::export::{build_export_from_storage, write_export};
use fieldops_core::{LocalStorage, Sanitizer, SqliteLocalStorage, StateSlot, SyncConfig};
use log::info;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "fieldops")]
#[command(about = "Inspect and export FieldOps local sync data")]
struct Cli {
    /// JSON config file; `FIELDOPS_*` environment overrides still apply.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Absolute directory for rolling log files.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prints core linkage and version.
    Ping,
    /// Lists stored keys with their record counts.
    Inspect {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Bundles persisted collections into one JSON document.
    Export {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
        /// Slot name (e.g. `projects`); repeat for several. Defaults to all.
        #[arg(long = "collection")]
        collections: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    if let Some(log_dir) = cli.log_dir.as_deref() {
        let level = config
            .log_level
            .as_deref()
            .unwrap_or_else(|| fieldops_core::default_log_level());
        fieldops_core::init_logging(level, log_dir)?;
    }

    match cli.command {
        Command::Ping => {
            println!("fieldops_core ping={}", fieldops_core::ping());
            println!("fieldops_core version={}", fieldops_core::core_version());
            Ok(())
        }
        Command::Inspect { db } => inspect(&config, db),
        Command::Export {
            db,
            out,
            collections,
        } => export(&config, db, &out, &collections),
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn open_storage(config: &SyncConfig, db: Option<PathBuf>) -> Result<SqliteLocalStorage> {
    let path = db.unwrap_or_else(|| config.resolved_db_path());
    SqliteLocalStorage::open(&path, config.storage_quota_bytes)
        .with_context(|| format!("failed to open local store `{}`", path.display()))
}

fn inspect(config: &SyncConfig, db: Option<PathBuf>) -> Result<()> {
    let storage = open_storage(config, db)?;
    for key in storage.keys()? {
        let summary = match storage.get(&key)? {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Array(items)) => format!("records={}", items.len()),
                Ok(_) => "object".to_string(),
                Err(_) => "malformed".to_string(),
            },
            None => "missing".to_string(),
        };
        println!("{key} {summary}");
    }
    Ok(())
}

fn export(
    config: &SyncConfig,
    db: Option<PathBuf>,
    out: &Path,
    collections: &[String],
) -> Result<()> {
    let slots = parse_slots(collections)?;
    let storage = open_storage(config, db)?;
    let document = build_export_from_storage(
        &storage,
        &config.storage_key_prefix,
        &Sanitizer::new(config.max_depth),
        &slots,
        Utc::now(),
    );
    write_export(out, &document)?;
    info!(
        "event=cli_export module=cli status=ok slots={} out={}",
        slots.len(),
        out.display()
    );
    println!("exported {} collections to {}", slots.len(), out.display());
    Ok(())
}

fn parse_slots(names: &[String]) -> Result<Vec<StateSlot>> {
    if names.is_empty() {
        return Ok(StateSlot::all().to_vec());
    }
    names
        .iter()
        .map(|name| {
            StateSlot::from_name(name.trim()).ok_or_else(|| anyhow!("unknown collection `{name}`"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::parse_slots;
    use fieldops_core::StateSlot;

    #[test]
    fn parse_slots_defaults_to_every_slot() {
        assert_eq!(parse_slots(&[]).unwrap(), StateSlot::all().to_vec());
    }

    #[test]
    fn parse_slots_rejects_unknown_names() {
        let names = vec!["projects".to_string(), "invoices".to_string()];
        let err = parse_slots(&names).unwrap_err();
        assert!(err.to_string().contains("invoices"));
    }
}
