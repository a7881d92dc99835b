// dumpvault/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::cipher::{CipherAlgorithm, MAX_KDF_ITERATIONS};
use crate::backup::db_dump::{DumpFormat, StderrPolicy};
use crate::backup::transform::{CompressionAlgorithm, DEFAULT_KDF_ITERATIONS, TransformConfig};

/// Environment variable naming an optional JSON config file.
pub const CONFIG_FILE_ENV: &str = "BACKUP_CONFIG_FILE";

/// A secret string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

// Shape of the optional config.json. Every field can also come from the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub project_name: Option<String>,
    pub encryption_password: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_key_prefix: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub temp_dir: Option<PathBuf>,
    pub pg_dump_path: Option<PathBuf>,
    pub dump_format: Option<String>,
    pub pg_dump_extra_args: Option<Vec<String>>,
    pub compression: Option<String>,
    pub compression_level: Option<u32>,
    pub cipher: Option<String>,
    pub kdf_iterations: Option<u32>,
    pub dump_timeout_secs: Option<u64>,
    pub stderr_policy: Option<String>,
    pub verify_artifact: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: Secret,
}

/// Where artifacts are uploaded.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub key_prefix: Option<String>,
    pub credentials: Option<StaticCredentials>,
}

#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Explicit dump executable; `None` means look up `pg_dump` in PATH.
    pub program: Option<PathBuf>,
    pub format: DumpFormat,
    pub extra_args: Vec<String>,
    pub timeout: Option<Duration>,
    pub stderr_policy: StderrPolicy,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub database_url: Secret,
    pub project_name: String,
    pub temp_dir: PathBuf,
    pub dump: DumpConfig,
    pub transform: TransformConfig,
    pub verify_artifact: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backup: BackupConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Loads the optional JSON file, then lets process environment variables override it.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        let raw = match config_path.map(Path::to_path_buf).or(env_path) {
            Some(path) => load_json(&path)?,
            None => RawJsonConfig::default(),
        };
        Self::from_sources(raw, |key| std::env::var(key).ok())
    }

    /// Resolves settings from a JSON base and a key lookup (the environment, in production).
    pub fn from_sources<F>(raw: RawJsonConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |key: &str, fallback: Option<String>| -> Option<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .or(fallback.filter(|v| !v.trim().is_empty()))
        };

        let database_url = pick("BACKUP_DATABASE_URL", raw.database_url)
            .context("BACKUP_DATABASE_URL (database_url) must be set")?;
        let project_name = pick("BACKUP_PROJECT_NAME", raw.project_name)
            .context("BACKUP_PROJECT_NAME (project_name) must be set")?;
        validate_project_name(&project_name)?;
        let password = pick("BACKUP_ENCRYPTION_PASSWORD", raw.encryption_password)
            .context("BACKUP_ENCRYPTION_PASSWORD (encryption_password) must be set")?;

        let bucket = pick("AWS_S3_BUCKET", raw.s3_bucket)
            .context("AWS_S3_BUCKET (s3_bucket) must be set")?;
        let region = pick("AWS_S3_REGION", raw.s3_region)
            .context("AWS_S3_REGION (s3_region) must be set")?;
        let endpoint_url = pick("AWS_S3_ENDPOINT", raw.s3_endpoint);
        let key_prefix = pick("AWS_S3_KEY_PREFIX", raw.s3_key_prefix)
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        let credentials = match (
            pick("AWS_ACCESS_KEY_ID", raw.s3_access_key_id),
            pick("AWS_SECRET_ACCESS_KEY", raw.s3_secret_access_key),
        ) {
            (Some(access_key_id), Some(secret)) => Some(StaticCredentials {
                access_key_id,
                secret_access_key: Secret::new(secret),
            }),
            (None, None) => None,
            _ => anyhow::bail!(
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set together (or neither, to use the default credential chain)"
            ),
        };

        let temp_dir = pick("BACKUP_TEMP_DIR", raw.temp_dir.map(|p| p.to_string_lossy().into_owned()))
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let format = match pick("BACKUP_DUMP_FORMAT", raw.dump_format) {
            Some(name) => DumpFormat::parse(&name)
                .with_context(|| format!("BACKUP_DUMP_FORMAT: unknown dump format '{}' (expected custom, tar or plain)", name))?,
            None => DumpFormat::default(),
        };
        let extra_args = match lookup("BACKUP_PG_DUMP_EXTRA_ARGS") {
            Some(args) => args.split_whitespace().map(str::to_string).collect(),
            None => raw.pg_dump_extra_args.unwrap_or_default(),
        };
        let timeout = parse_number::<u64>(&pick("BACKUP_DUMP_TIMEOUT_SECS", None), "BACKUP_DUMP_TIMEOUT_SECS")?
            .or(raw.dump_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let stderr_policy = match pick("BACKUP_STDERR_POLICY", raw.stderr_policy) {
            Some(name) => StderrPolicy::parse(&name)
                .with_context(|| format!("BACKUP_STDERR_POLICY: unknown policy '{}' (expected warn or fail)", name))?,
            None => StderrPolicy::default(),
        };

        let level = parse_number::<u32>(&pick("BACKUP_COMPRESSION_LEVEL", None), "BACKUP_COMPRESSION_LEVEL")?
            .or(raw.compression_level)
            .unwrap_or(6);
        if level > 9 {
            anyhow::bail!("BACKUP_COMPRESSION_LEVEL must be between 0 and 9, got {}", level);
        }
        let compression = match pick("BACKUP_COMPRESSION", raw.compression).as_deref() {
            None | Some("gzip") => CompressionAlgorithm::Gzip { level },
            Some("none") => CompressionAlgorithm::None,
            Some(other) => anyhow::bail!("BACKUP_COMPRESSION: unknown compression '{}' (expected gzip or none)", other),
        };
        let cipher = match pick("BACKUP_CIPHER", raw.cipher) {
            Some(name) => CipherAlgorithm::parse(&name).with_context(|| {
                format!("BACKUP_CIPHER: unknown cipher '{}' (expected aes-256-gcm or chacha20-poly1305)", name)
            })?,
            None => CipherAlgorithm::default(),
        };
        let kdf_iterations = parse_number::<u32>(&pick("BACKUP_KDF_ITERATIONS", None), "BACKUP_KDF_ITERATIONS")?
            .or(raw.kdf_iterations)
            .unwrap_or(DEFAULT_KDF_ITERATIONS);
        if kdf_iterations == 0 || kdf_iterations > MAX_KDF_ITERATIONS {
            anyhow::bail!(
                "BACKUP_KDF_ITERATIONS must be between 1 and {}, got {}",
                MAX_KDF_ITERATIONS,
                kdf_iterations
            );
        }

        let verify_artifact = match pick("BACKUP_VERIFY_ARTIFACT", None) {
            Some(value) => parse_bool(&value).with_context(|| {
                format!("BACKUP_VERIFY_ARTIFACT: expected true or false, got '{}'", value)
            })?,
            None => raw.verify_artifact.unwrap_or(true),
        };

        Ok(AppConfig {
            backup: BackupConfig {
                database_url: Secret::new(database_url),
                project_name,
                temp_dir,
                dump: DumpConfig {
                    program: pick("BACKUP_PG_DUMP_PATH", raw.pg_dump_path.map(|p| p.to_string_lossy().into_owned()))
                        .map(PathBuf::from),
                    format,
                    extra_args,
                    timeout,
                    stderr_policy,
                },
                transform: TransformConfig {
                    compression,
                    cipher,
                    secret: Secret::new(password),
                    kdf_iterations,
                },
                verify_artifact,
            },
            storage: StorageConfig {
                bucket,
                region,
                endpoint_url,
                key_prefix,
                credentials,
            },
        })
    }
}

fn load_json(config_path: &Path) -> Result<RawJsonConfig> {
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
    serde_json::from_str(&config_content)
        .with_context(|| format!("Failed to parse JSON from config file at {}", config_path.display()))
}

/// Project names become part of file names and object keys.
fn validate_project_name(name: &str) -> Result<()> {
    if name.chars().any(|c| !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.') {
        anyhow::bail!(
            "BACKUP_PROJECT_NAME may only contain ASCII letters, digits, '_', '-' and '.', got '{}'",
            name
        );
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(value: &Option<String>, key: &str) -> Result<Option<T>> {
    match value {
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, v)),
        None => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
