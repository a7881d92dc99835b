use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Pipeline stage a failure (or a temp artifact) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Preparing the job, before any stage runs (e.g. locating the dump tool).
    Setup,
    Dump,
    Transform,
    Upload,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Dump => "dump",
            Stage::Transform => "transform",
            Stage::Upload => "upload",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to start dump tool {program}: {source}")]
    DumpSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Dump tool exited with {}: {}", describe_exit(*exit_code), stderr.trim())]
    DumpFailed { exit_code: Option<i32>, stderr: String },

    #[error("Failed to read dump output: {0}")]
    DumpStream(#[source] std::io::Error),

    #[error("Dump did not finish within {0:?}")]
    DumpTimedOut(Duration),

    #[error("Transform failed: {cause}")]
    TransformFailed { cause: String },

    #[error("Local artifact I/O failed for {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact {} is empty", path.display())]
    EmptyArtifact { path: PathBuf },

    #[error("Artifact verification failed: {cause}")]
    VerificationFailed { cause: String },

    #[error("Upload failed: {cause}")]
    UploadFailed { cause: String },
}

impl BackupError {
    /// The stage that produced this error.
    pub fn stage(&self) -> Stage {
        match self {
            BackupError::Config(_) => Stage::Setup,
            BackupError::DumpSpawn { .. }
            | BackupError::DumpFailed { .. }
            | BackupError::DumpStream(_)
            | BackupError::DumpTimedOut(_) => Stage::Dump,
            BackupError::TransformFailed { .. }
            | BackupError::LocalIo { .. }
            | BackupError::EmptyArtifact { .. }
            | BackupError::VerificationFailed { .. } => Stage::Transform,
            BackupError::UploadFailed { .. } => Stage::Upload,
        }
    }

    pub(crate) fn transform(cause: impl fmt::Display) -> Self {
        BackupError::TransformFailed {
            cause: cause.to_string(),
        }
    }

    pub(crate) fn upload(cause: impl fmt::Display) -> Self {
        BackupError::UploadFailed {
            cause: cause.to_string(),
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// A temp file that could not be removed. Never fatal; aggregated into the cleanup report.
#[derive(Error, Debug)]
#[error("Failed to remove {}: {cause}", path.display())]
pub struct CleanupFailure {
    pub path: PathBuf,
    #[source]
    pub cause: std::io::Error,
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_of_each_error_kind() {
        let dump = BackupError::DumpFailed {
            exit_code: Some(1),
            stderr: "connection refused".into(),
        };
        assert_eq!(dump.stage(), Stage::Dump);
        assert_eq!(
            BackupError::EmptyArtifact { path: "/tmp/x".into() }.stage(),
            Stage::Transform
        );
        assert_eq!(BackupError::upload("timeout").stage(), Stage::Upload);
        assert_eq!(Stage::Upload.to_string(), "upload");
        let config = BackupError::Config("pg_dump executable not found in PATH".into());
        assert_eq!(config.stage(), Stage::Setup);
        assert_eq!(config.stage().to_string(), "setup");
    }

    #[test]
    fn test_dump_failed_message_includes_exit_code_and_stderr() {
        let err = BackupError::DumpFailed {
            exit_code: Some(2),
            stderr: "pg_dump: error: connection failed\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "Dump tool exited with exit code 2: pg_dump: error: connection failed"
        );

        let killed = BackupError::DumpFailed {
            exit_code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("terminated by signal"));
    }
}
