// dumpvault/src/backup/job.rs
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{BackupError, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Dumping,
    Transforming,
    Uploading,
    CleaningUp,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Dumping => "dumping",
            JobStatus::Transforming => "transforming",
            JobStatus::Uploading => "uploading",
            JobStatus::CleaningUp => "cleaning-up",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One backup invocation. Only the pipeline mutates it.
#[derive(Debug)]
pub struct BackupJob {
    /// `<project>-<timestamp>`, also the artifact file stem.
    pub id: String,
    /// Connection string with the password masked.
    pub source_dsn: String,
    pub output_path: PathBuf,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub size_bytes: Option<u64>,
    pub error: Option<BackupError>,
}

impl BackupJob {
    pub fn new(
        project_name: &str,
        redacted_dsn: String,
        temp_dir: &Path,
        extension: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        let id = job_id(project_name, created_at);
        let output_path = temp_dir.join(format!("{}{}", id, extension));
        Self {
            id,
            source_dsn: redacted_dsn,
            output_path,
            status: JobStatus::Pending,
            created_at,
            size_bytes: None,
            error: None,
        }
    }

    /// File name of the artifact, which is also the object name.
    pub fn file_name(&self) -> String {
        self.output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// `<project>-<ISO 8601 UTC with millis>` with `:` and `.` replaced by `-`,
/// e.g. `app-2024-01-01T00-00-00-000Z`.
pub fn job_id(project_name: &str, at: DateTime<Utc>) -> String {
    let timestamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{}-{}", project_name, timestamp)
}

/// A local file created by a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempArtifact {
    pub path: PathBuf,
    pub stage: Stage,
    pub deleted: bool,
}

impl TempArtifact {
    pub fn new(path: PathBuf, stage: Stage) -> Self {
        Self {
            path,
            stage,
            deleted: false,
        }
    }
}

/// Remote destination of a job's artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub object_key: String,
}

impl UploadTarget {
    pub fn new(
        bucket: &str,
        region: &str,
        endpoint_url: Option<&str>,
        key_prefix: Option<&str>,
        file_name: &str,
    ) -> Self {
        let object_key = match key_prefix {
            Some(prefix) => format!("{}/{}", prefix, file_name),
            None => file_name.to_string(),
        };
        Self {
            bucket: bucket.to_string(),
            region: region.to_string(),
            endpoint_url: endpoint_url.map(str::to_string),
            object_key,
        }
    }
}
