// dumpvault/src/backup/logic.rs
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Instrument;

use super::cleanup::{self, CleanupReport};
use super::db_dump::{DumpOutput, DumpProducer};
use super::job::{BackupJob, JobStatus, TempArtifact, UploadTarget};
use super::s3_upload::{ArtifactUploader, UploadReceipt};
use super::transform::ArtifactWriter;
use super::verification::verify_artifact;
use crate::config::{BackupConfig, StorageConfig};
use crate::errors::{BackupError, Result, Stage};
use crate::observability::{BackupObserver, TracingObserver};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::{format_size, redact_dsn};

/// Everything known about a finished job.
#[derive(Debug)]
pub struct BackupReport {
    /// Terminal job state; `job.error` holds the primary failure, if any.
    pub job: BackupJob,
    pub artifacts: Vec<TempArtifact>,
    pub cleanup: CleanupReport,
    pub dump_warnings: Option<String>,
    pub receipt: Option<UploadReceipt>,
    pub sha256: Option<String>,
}

impl BackupReport {
    pub fn is_success(&self) -> bool {
        self.job.status == JobStatus::Succeeded
    }

    pub fn error(&self) -> Option<&BackupError> {
        self.job.error.as_ref()
    }

    /// Local files that may have outlived the job (only when cleanup itself failed).
    pub fn leftover_paths(&self) -> Vec<&Path> {
        self.cleanup.leftover_paths().collect()
    }
}

/// Removes registered files if the job future is dropped before cleanup ran.
#[derive(Debug, Default)]
struct AbandonGuard {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::warn!(path = %path.display(), "removed temp file of an abandoned backup job"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to remove temp file of an abandoned backup job"),
            }
        }
    }
}

#[derive(Default)]
struct JobRun {
    artifacts: Vec<TempArtifact>,
    guard: AbandonGuard,
    dump_warnings: Option<String>,
    receipt: Option<UploadReceipt>,
    sha256: Option<String>,
}

impl JobRun {
    /// Must be called before the file is created, so a half-created file is still tracked.
    fn register(&mut self, path: &Path, stage: Stage) {
        self.artifacts.push(TempArtifact::new(path.to_path_buf(), stage));
        self.guard.paths.push(path.to_path_buf());
        self.guard.armed = true;
    }
}

/// Dump → transform → upload → cleanup, one job per [`run_backup`](Self::run_backup) call.
pub struct BackupPipeline {
    config: BackupConfig,
    storage: StorageConfig,
    producer: DumpProducer,
    uploader: Arc<dyn ArtifactUploader>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn BackupObserver>,
}

impl BackupPipeline {
    pub fn new(
        config: BackupConfig,
        storage: StorageConfig,
        producer: DumpProducer,
        uploader: Arc<dyn ArtifactUploader>,
    ) -> Self {
        Self {
            config,
            storage,
            producer,
            uploader,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BackupObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// `.dump.gz.enc` and friends.
    fn extension(&self) -> String {
        format!(
            "{}{}",
            self.producer.format().extension(),
            self.config.transform.extension()
        )
    }

    /// Runs one backup job to a terminal state. Never panics on stage failures; the
    /// outcome, including cleanup problems, is in the returned report.
    pub async fn run_backup(&self) -> BackupReport {
        let job = BackupJob::new(
            &self.config.project_name,
            redact_dsn(self.config.database_url.expose()),
            &self.config.temp_dir,
            &self.extension(),
            self.clock.now(),
        );
        let span = tracing::info_span!("backup", job_id = %job.id);
        self.run_job(job).instrument(span).await
    }

    async fn run_job(&self, mut job: BackupJob) -> BackupReport {
        let mut run = JobRun::default();
        let outcome = self.execute(&mut job, &mut run).await;

        self.transition(&mut job, JobStatus::CleaningUp);
        let cleanup = cleanup::cleanup(run.artifacts.iter().map(|a| a.path.clone())).await;
        run.guard.armed = false;
        for artifact in &mut run.artifacts {
            artifact.deleted = !cleanup.failures.iter().any(|f| f.path == artifact.path);
        }

        match outcome {
            Ok(()) => self.transition(&mut job, JobStatus::Succeeded),
            Err(error) => {
                job.error = Some(error);
                self.transition(&mut job, JobStatus::Failed);
            }
        }

        let report = BackupReport {
            job,
            artifacts: run.artifacts,
            cleanup,
            dump_warnings: run.dump_warnings,
            receipt: run.receipt,
            sha256: run.sha256,
        };
        self.observer.finished(&report);
        report
    }

    async fn execute(&self, job: &mut BackupJob, run: &mut JobRun) -> Result<()> {
        self.transition(job, JobStatus::Dumping);

        let path = job.output_path.clone();
        let local_io = |source| BackupError::LocalIo {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|source| BackupError::LocalIo {
                path: self.config.temp_dir.clone(),
                source,
            })?;
        // No await point between registering and creating, so a dropped job cannot leave a
        // file the guard never saw.
        run.register(&path, Stage::Transform);
        let file = std::fs::File::create(&path).map_err(local_io)?;

        // dump stdout → gzip → cipher → file, as one stream.
        let sink = self.config.transform.wrap(ArtifactWriter::new(file))?;
        let DumpOutput { sink, bytes, warnings } = self
            .producer
            .produce_dump(self.config.database_url.expose(), sink)
            .await?;
        if let Some(stderr) = warnings {
            self.observer.dump_warning(job, &stderr);
            run.dump_warnings = Some(stderr);
        }

        self.transition(job, JobStatus::Transforming);
        let sealed = tokio::task::spawn_blocking(move || -> std::io::Result<_> { sink.finish()?.seal() })
            .await
            .map_err(|e| BackupError::transform(format!("seal task failed: {}", e)))?
            .map_err(|e| BackupError::transform(format!("failed to seal artifact: {}", e)))?;

        let on_disk = tokio::fs::metadata(&path).await.map_err(local_io)?.len();
        if bytes == 0 || on_disk == 0 {
            return Err(BackupError::EmptyArtifact { path });
        }
        if on_disk != sealed.size_bytes {
            return Err(BackupError::transform(format!(
                "artifact size on disk ({}) differs from bytes written ({})",
                on_disk, sealed.size_bytes
            )));
        }
        job.size_bytes = Some(on_disk);
        run.sha256 = Some(sealed.sha256.clone());

        if self.config.verify_artifact {
            let verify_path = path.clone();
            let transform = self.config.transform.clone();
            tokio::task::spawn_blocking(move || verify_artifact(&verify_path, &transform, bytes))
                .await
                .map_err(|e| BackupError::VerificationFailed {
                    cause: format!("verification task failed: {}", e),
                })??;
            tracing::info!(dump_bytes = bytes, "backup archive file is valid");
        }
        tracing::info!(
            size = %format_size(on_disk),
            dump_size = %format_size(bytes),
            sha256 = %sealed.sha256,
            cipher = self.config.transform.cipher.as_str(),
            "backup artifact sealed"
        );

        self.transition(job, JobStatus::Uploading);
        let target = UploadTarget::new(
            &self.storage.bucket,
            &self.storage.region,
            self.storage.endpoint_url.as_deref(),
            self.storage.key_prefix.as_deref(),
            &job.file_name(),
        );
        let receipt = self
            .uploader
            .upload(&path, &sealed.sha256, &target)
            .await
            .map_err(|e| match e {
                BackupError::UploadFailed { .. } => e,
                other => BackupError::upload(other),
            })?;
        run.receipt = Some(receipt);
        Ok(())
    }

    fn transition(&self, job: &mut BackupJob, status: JobStatus) {
        let from = job.status;
        debug_assert!(!from.is_terminal(), "job {} already finished", job.id);
        job.status = status;
        self.observer.status_changed(job, from);
    }
}
