// dumpvault/src/backup/db_dump.rs
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use crate::config::DumpConfig;
use crate::errors::{BackupError, Result};
use crate::utils::find_pg_dump_executable;

/// Copy buffer between the dump's stdout and the transform.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// pg_dump output format (`-F`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
    #[default]
    Custom,
    Tar,
    Plain,
}

impl DumpFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "custom" | "c" => Some(DumpFormat::Custom),
            "tar" | "t" => Some(DumpFormat::Tar),
            "plain" | "p" => Some(DumpFormat::Plain),
            _ => None,
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            DumpFormat::Custom => "-Fc",
            DumpFormat::Tar => "-Ft",
            DumpFormat::Plain => "-Fp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DumpFormat::Custom => ".dump",
            DumpFormat::Tar => ".tar",
            DumpFormat::Plain => ".sql",
        }
    }
}

/// What to do when the dump exits zero but wrote to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrPolicy {
    #[default]
    Warn,
    Fail,
}

impl StderrPolicy {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "warn" => Some(StderrPolicy::Warn),
            "fail" => Some(StderrPolicy::Fail),
            _ => None,
        }
    }
}

/// Result of a dump that exited successfully.
#[derive(Debug)]
pub struct DumpOutput<W> {
    /// The sink handed to [`DumpProducer::produce_dump`], returned for finalization.
    pub sink: W,
    /// Raw bytes read from the dump's stdout.
    pub bytes: u64,
    /// Non-empty stderr of a successful dump.
    pub warnings: Option<String>,
}

enum PumpError {
    Read(std::io::Error),
    Write(std::io::Error),
}

/// Runs the database dump tool and streams its stdout into a sink.
#[derive(Debug, Clone)]
pub struct DumpProducer {
    program: PathBuf,
    leading_args: Vec<OsString>,
    format: DumpFormat,
    extra_args: Vec<String>,
    timeout: Option<Duration>,
    stderr_policy: StderrPolicy,
}

impl DumpProducer {
    /// Builds a producer for `pg_dump`, locating it in PATH unless configured explicitly.
    pub fn from_config(config: &DumpConfig) -> Result<Self> {
        let program = match &config.program {
            Some(path) => path.clone(),
            None => find_pg_dump_executable().map_err(|e| BackupError::Config(format!("{:#}", e)))?,
        };
        Ok(Self {
            program,
            leading_args: Vec::new(),
            format: config.format,
            extra_args: config.extra_args.clone(),
            timeout: config.timeout,
            stderr_policy: config.stderr_policy,
        })
    }

    /// Runs `program` with `leading_args` placed before the pg_dump arguments.
    #[cfg(test)]
    pub fn with_program<I, S>(program: impl Into<PathBuf>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            leading_args: leading_args.into_iter().map(Into::into).collect(),
            format: DumpFormat::default(),
            extra_args: Vec::new(),
            timeout: None,
            stderr_policy: StderrPolicy::default(),
        }
    }

    #[cfg(test)]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[cfg(test)]
    pub fn with_format(mut self, format: DumpFormat) -> Self {
        self.format = format;
        self
    }

    #[cfg(test)]
    pub fn stderr_policy(mut self, policy: StderrPolicy) -> Self {
        self.stderr_policy = policy;
        self
    }

    pub fn format(&self) -> DumpFormat {
        self.format
    }

    /// Argument vector passed to the dump tool. The DSN is a single argument, never shell-parsed.
    fn dump_args(&self, dsn: &str) -> Vec<OsString> {
        let mut args = self.leading_args.clone();
        args.push("-d".into());
        args.push(dsn.into());
        args.push(self.format.flag().into());
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }

    /// Streams the dump of `dsn` into `sink`.
    ///
    /// stderr is drained concurrently and the child is always reaped before this returns,
    /// including on stream errors and timeouts (the child is killed first in those cases).
    pub async fn produce_dump<W>(&self, dsn: &str, sink: W) -> Result<DumpOutput<W>>
    where
        W: Write + Send + 'static,
    {
        let mut child = Command::new(&self.program)
            .args(self.dump_args(dsn))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackupError::DumpSpawn {
                program: self.program.display().to_string(),
                source,
            })?;
        tracing::debug!(program = %self.program.display(), pid = ?child.id(), "dump process started");

        let (stdout, mut stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = reap(&mut child, true).await;
                return Err(BackupError::DumpStream(std::io::Error::other(
                    "dump process pipes were not captured",
                )));
            }
        };

        let stderr_task: JoinHandle<std::io::Result<Vec<u8>>> = tokio::spawn(async move {
            let mut captured = Vec::new();
            stderr.read_to_end(&mut captured).await?;
            Ok(captured)
        });

        let reader = SyncIoBridge::new(stdout);
        let mut copy_task = tokio::task::spawn_blocking(move || pump(reader, sink));

        // The limit covers the whole run: a dump that closes stdout and then hangs still times out.
        let finished = async {
            let pumped = (&mut copy_task).await;
            let stream_failed = !matches!(pumped, Ok(Ok(_)));
            let status = reap(&mut child, stream_failed).await;
            (pumped, status)
        };
        let finished = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.ok(),
            None => Some(finished.await),
        };

        let (pumped, status) = match finished {
            Some(done) => done,
            None => {
                tracing::warn!(timeout = ?self.timeout, "dump timed out, killing dump process");
                let _ = reap(&mut child, true).await;
                // The pipe closes with the process, so the copy task ends promptly.
                if !copy_task.is_finished() {
                    let _ = copy_task.await;
                }
                let _ = stderr_task.await;
                return Err(BackupError::DumpTimedOut(self.timeout.unwrap_or_default()));
            }
        };

        let stderr_text = match stderr_task.await {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Err(e)) => format!("<failed to read stderr: {}>", e),
            Err(e) => format!("<stderr reader failed: {}>", e),
        };

        let (sink, bytes) = match pumped {
            Ok(Ok(done)) => done,
            Ok(Err(PumpError::Read(e))) => return Err(BackupError::DumpStream(e)),
            Ok(Err(PumpError::Write(e))) => return Err(BackupError::transform(e)),
            Err(join_err) => return Err(BackupError::transform(format!("transform task failed: {}", join_err))),
        };

        let status = status.map_err(BackupError::DumpStream)?;
        if !status.success() {
            return Err(BackupError::DumpFailed {
                exit_code: status.code(),
                stderr: stderr_text,
            });
        }

        let warnings = if stderr_text.trim().is_empty() {
            None
        } else {
            Some(stderr_text)
        };
        if let (Some(stderr), StderrPolicy::Fail) = (&warnings, self.stderr_policy) {
            return Err(BackupError::DumpFailed {
                exit_code: status.code(),
                stderr: stderr.clone(),
            });
        }

        Ok(DumpOutput { sink, bytes, warnings })
    }
}

/// Kills the child if asked to, then waits for it so it never outlives the stage.
async fn reap(child: &mut Child, kill: bool) -> std::io::Result<ExitStatus> {
    if kill {
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "dump process already exited before kill");
        }
    }
    child.wait().await
}

/// Blocking copy loop; distinguishes stdout read failures from sink write failures.
fn pump<R: Read, W: Write>(mut reader: R, mut sink: W) -> std::result::Result<(W, u64), PumpError> {
    let mut buffer = vec![0u8; PIPE_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PumpError::Read(e)),
        };
        sink.write_all(&buffer[..n]).map_err(PumpError::Write)?;
        total += n as u64;
    }
    sink.flush().map_err(PumpError::Write)?;
    Ok((sink, total))
}
