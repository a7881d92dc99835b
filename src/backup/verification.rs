// dumpvault/src/backup/verification.rs
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use super::transform::TransformConfig;
use crate::errors::{BackupError, Result};

/// Re-opens a sealed artifact and checks that it authenticates, decompresses and
/// yields exactly `expected_bytes` of dump data.
///
/// Blocking; run it off the async runtime.
pub fn verify_artifact(path: &Path, transform: &TransformConfig, expected_bytes: u64) -> Result<()> {
    let file = File::open(path).map_err(|source| BackupError::LocalIo {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = transform
        .open(BufReader::new(file))
        .map_err(|e| BackupError::VerificationFailed {
            cause: format!("cannot open artifact: {}", e),
        })?;
    let restored = io::copy(&mut reader, &mut io::sink()).map_err(|e| BackupError::VerificationFailed {
        cause: format!("artifact does not decode: {}", e),
    })?;

    if restored != expected_bytes {
        return Err(BackupError::VerificationFailed {
            cause: format!(
                "artifact decodes to {} bytes but the dump produced {}",
                restored, expected_bytes
            ),
        });
    }
    Ok(())
}
