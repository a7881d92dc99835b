pub mod clock;

use anyhow::{Context, Result};
use std::path::PathBuf;
use url::Url;
use which::which;

/// Finds the pg_dump executable in the system PATH.
pub fn find_pg_dump_executable() -> Result<PathBuf> {
    which("pg_dump").context("pg_dump executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.")
}

/// Returns a loggable form of a connection string with the password masked.
///
/// URL-style DSNs keep everything but the password. Anything that does not parse as a URL
/// (libpq `key=value` strings) is replaced entirely, since it may carry `password=`.
pub fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                return "[redacted]".to_string();
            }
            parsed.to_string()
        }
        Err(_) => "[redacted]".to_string(),
    }
}

/// Formats a byte count for humans, e.g. `12.3 MiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
