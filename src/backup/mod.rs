pub(crate) mod cipher;
pub(crate) mod cleanup;
pub(crate) mod db_dump;
pub(crate) mod job;
pub(crate) mod logic;
pub(crate) mod s3_upload;
pub(crate) mod transform;
pub(crate) mod verification;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::AppConfig;
use db_dump::DumpProducer;
use logic::{BackupPipeline, BackupReport};
use s3_upload::S3Uploader;

/// Public entry point for the backup process: wires the production collaborators
/// together and runs a single job.
pub async fn run_backup_flow(app_config: &AppConfig) -> Result<BackupReport> {
    let producer = DumpProducer::from_config(&app_config.backup.dump)
        .context("Failed to prepare the database dump tool")?;
    let uploader = Arc::new(S3Uploader::new(&app_config.storage));

    let pipeline = BackupPipeline::new(
        app_config.backup.clone(),
        app_config.storage.clone(),
        producer,
        uploader,
    );
    Ok(pipeline.run_backup().await)
}
