//! Logging setup and the pipeline's event hooks.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::backup::job::{BackupJob, JobStatus};
use crate::backup::logic::BackupReport;
use crate::errors::Stage;
use crate::utils::format_size;

/// Installs the global fmt subscriber on stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Receives pipeline progress. Purely observational: it cannot influence control flow.
pub trait BackupObserver: Send + Sync {
    fn status_changed(&self, _job: &BackupJob, _from: JobStatus) {}

    fn dump_warning(&self, _job: &BackupJob, _stderr: &str) {}

    fn finished(&self, _report: &BackupReport) {}
}

/// Default observer: structured `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl BackupObserver for TracingObserver {
    fn status_changed(&self, job: &BackupJob, from: JobStatus) {
        tracing::debug!(job_id = %job.id, from = %from, to = %job.status, "job status changed");
        match job.status {
            JobStatus::Dumping => tracing::info!(source = %job.source_dsn, "dumping database"),
            JobStatus::Transforming => tracing::info!("sealing artifact"),
            JobStatus::Uploading => tracing::info!(
                size = %job.size_bytes.map(format_size).unwrap_or_default(),
                "artifact ready for upload"
            ),
            JobStatus::CleaningUp => tracing::debug!("removing local temp files"),
            _ => {}
        }
    }

    fn dump_warning(&self, job: &BackupJob, stderr: &str) {
        tracing::warn!(job_id = %job.id, stderr = %stderr.trim(), "dump tool reported warnings");
    }

    fn finished(&self, report: &BackupReport) {
        let job = &report.job;
        match &job.error {
            None => tracing::info!(
                job_id = %job.id,
                started_at = %job.created_at,
                object_key = ?report.receipt.as_ref().map(|r| r.object_key.as_str()),
                size = %job.size_bytes.map(format_size).unwrap_or_default(),
                sha256 = ?report.sha256,
                "backup complete"
            ),
            Some(error) => tracing::error!(
                job_id = %job.id,
                stage = %error.stage(),
                error = %error,
                "backup failed"
            ),
        }
        for artifact in report.artifacts.iter().filter(|a| !a.deleted) {
            let cause = report
                .cleanup
                .failures
                .iter()
                .find(|f| f.path == artifact.path)
                .map(|f| f.cause.to_string())
                .unwrap_or_default();
            tracing::error!(
                stage = %Stage::Cleanup,
                created_by = %artifact.stage,
                path = %artifact.path.display(),
                error = %cause,
                "temp file may have been left behind"
            );
        }
    }
}
