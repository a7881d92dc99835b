//! Database Backup Tool
//!
//! Dumps a PostgreSQL database, compresses and encrypts the dump, uploads it to
//! S3-compatible storage and removes every local temp file.

// dumpvault/src/main.rs
mod backup;
mod config;
mod errors;
mod observability;
mod utils;

use anyhow::{Context, Result, bail};
use backup::logic::BackupReport;
use config::AppConfig;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    observability::init_tracing();

    match run_app().await {
        Ok(report) if report.is_success() => {
            println!("✅ Backup completed successfully.");
            if let Some(receipt) = &report.receipt {
                println!("   Stored at s3://{}/{}", receipt.bucket, receipt.object_key);
            }
            print_leftovers(&report);
            ExitCode::SUCCESS
        }
        Ok(report) => {
            if let Some(error) = report.error() {
                eprintln!("❌ Backup failed during {}: {}", error.stage(), error);
            }
            print_leftovers(&report);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<BackupReport> {
    dotenv::dotenv().ok();

    let config_path = parse_args(env::args().skip(1))?;
    let app_config = AppConfig::load(config_path.as_deref())
        .context("Failed to load application configuration")?;

    println!("🚀 Starting Backup Process...");
    backup::run_backup_flow(&app_config)
        .await
        .context("Backup process failed")
}

/// `[backup] [--config <path>]`
fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<Option<PathBuf>> {
    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.trim() {
            "backup" | "1" => {}
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => bail!("Unknown argument '{}'. Usage: dumpvault [backup] [--config <path>]", other),
        }
    }
    Ok(config_path)
}

fn print_leftovers(report: &BackupReport) {
    for path in report.leftover_paths() {
        eprintln!("⚠️  Temp file could not be removed: {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(args(&[])).unwrap(), None);
        assert_eq!(parse_args(args(&["backup"])).unwrap(), None);
        assert_eq!(
            parse_args(args(&["backup", "--config", "/etc/dumpvault.json"])).unwrap(),
            Some(PathBuf::from("/etc/dumpvault.json"))
        );
        assert!(parse_args(args(&["--config"])).is_err());
        assert!(parse_args(args(&["restore"])).is_err());
    }
}
