// backupagent/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Smallest part size accepted by S3-compatible multipart backends.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_FILE_EXTENSION: &str = "bak";
const DEFAULT_KEY_PREFIX: &str = "data";
const DEFAULT_PORT: u16 = 3000;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub destination: Option<String>,
    pub bucket_name: Option<String>,
    pub folder_prefix: Option<String>,
    pub namespace_by_hour: Option<bool>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonNotificationConfig {
    pub endpoint_url: Option<String>,
    pub api_key: Option<String>,
    pub from: Option<String>,
    pub to: Option<Vec<String>>,
    pub cc: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub source_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub archive_mode: Option<String>,
    pub file_extension: Option<String>,
    pub schedule_interval_secs: Option<u64>,
    pub part_size_bytes: Option<usize>,
    pub notification_schedule: Option<String>,
    pub guard_scope: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub listen_addr: Option<String>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub notification: Option<JsonNotificationConfig>,
}

/// How the source directory is split into artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveMode {
    /// All regular files in the directory go into one `backup_<HH>.tar.gz`.
    WholeDirectory,
    /// Every file with the given extension gets its own `<stem>.tar.gz`.
    PerFileExtension { extension: String },
}

/// When the accumulated artifact names are mailed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationSchedule {
    EverySuccess,
    FixedHours(Vec<u32>),
}

/// Span of the single-flight guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardScope {
    /// Only overlapping runs are rejected.
    Process,
    /// Additionally, once a run uploads something, later ticks in the same
    /// hour of the same day are skipped.
    PerHour,
}

/// Object key naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    pub prefix: Option<String>,
    pub namespace_by_hour: bool,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub archive_mode: ArchiveMode,
    pub key_layout: KeyLayout,
    pub part_size: NonZeroUsize,
    pub notification_schedule: NotificationSchedule,
    pub guard_scope: GuardScope,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub endpoint_url: String,
    pub api_key: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub notification: Option<MailConfig>,
    pub server: ServerConfig,
    pub schedule_interval: Duration,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Self::from_raw(raw_json_config, |name| std::env::var(name).ok())
    }

    /// Validates the raw config. `env` resolves fallbacks for values that are
    /// usually kept out of the JSON file (credentials, region, port).
    pub fn from_raw<F>(raw: RawJsonConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source_dir = raw
            .source_dir
            .clone()
            .context("source_dir must be set in config.json")?;
        if source_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("source_dir cannot be empty in config.json."));
        }

        let archive_mode = parse_archive_mode(
            raw.archive_mode.as_deref(),
            raw.file_extension.as_deref(),
        )?;
        let staging_dir = match raw.staging_dir.clone() {
            Some(dir) => dir,
            None => default_staging_dir(&source_dir, &archive_mode),
        };
        if archive_mode == ArchiveMode::WholeDirectory && staging_dir == source_dir {
            return Err(anyhow::anyhow!(
                "staging_dir must differ from source_dir in whole-directory mode, otherwise the archive would be archived and deleted with the sources"
            ));
        }

        let part_size = raw.part_size_bytes.unwrap_or(MIN_PART_SIZE);
        let part_size = NonZeroUsize::new(part_size)
            .filter(|size| size.get() >= MIN_PART_SIZE)
            .with_context(|| {
                format!(
                    "part_size_bytes must be at least {} bytes, got {}",
                    MIN_PART_SIZE, part_size
                )
            })?;

        let notification_schedule = match raw.notification_schedule.as_deref() {
            Some(value) => parse_notification_schedule(value)?,
            None => NotificationSchedule::EverySuccess,
        };
        let guard_scope = match raw.guard_scope.as_deref() {
            Some(value) => parse_guard_scope(value)?,
            None => GuardScope::Process,
        };

        let interval_secs = raw.schedule_interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS);
        if interval_secs == 0 {
            return Err(anyhow::anyhow!("schedule_interval_secs must be greater than zero"));
        }
        let timeout_secs = raw
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(anyhow::anyhow!("request_timeout_secs must be greater than zero"));
        }

        let s3_raw = raw
            .s3_storage
            .clone()
            .context("s3_storage must be defined in config.json")?;
        let (storage, key_layout) = load_storage_config(&s3_raw, &env)?;

        let notification = match &raw.notification {
            Some(mail_raw) => load_mail_config(mail_raw, &env)?,
            None => None,
        };

        let server = ServerConfig {
            listen_addr: resolve_listen_addr(raw.listen_addr.as_deref(), &env)?,
        };

        Ok(AppConfig {
            pipeline: PipelineConfig {
                source_dir,
                staging_dir,
                archive_mode,
                key_layout,
                part_size,
                notification_schedule,
                guard_scope,
                request_timeout: Duration::from_secs(timeout_secs),
            },
            storage,
            notification,
            server,
            schedule_interval: Duration::from_secs(interval_secs),
        })
    }
}

fn default_staging_dir(source_dir: &Path, mode: &ArchiveMode) -> PathBuf {
    match mode {
        ArchiveMode::PerFileExtension { .. } => source_dir.to_path_buf(),
        ArchiveMode::WholeDirectory => match source_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
    }
}

fn load_storage_config<F>(s3_raw: &JsonS3StorageConfig, env: &F) -> Result<(StorageConfig, KeyLayout)>
where
    F: Fn(&str) -> Option<String>,
{
    let (bucket_name, prefix) = match s3_raw.destination.as_deref().filter(|s| !s.is_empty()) {
        Some(uri) => parse_s3_destination(uri)?,
        None => {
            let bucket = non_empty(&s3_raw.bucket_name)
                .context("s3_storage.bucket_name or s3_storage.destination must be set in config.json")?;
            let prefix = match &s3_raw.folder_prefix {
                Some(p) => Some(p.trim_matches('/').to_string()).filter(|p| !p.is_empty()),
                None => Some(DEFAULT_KEY_PREFIX.to_string()),
            };
            (bucket, prefix)
        }
    };

    let region = non_empty(&s3_raw.region)
        .or_else(|| env("AWS_REGION").filter(|s| !s.is_empty()))
        .context("s3_storage.region (or AWS_REGION) must be set")?;
    let access_key_id = non_empty(&s3_raw.access_key_id)
        .or_else(|| env("AWS_ACCESS_KEY_ID").filter(|s| !s.is_empty()))
        .context("s3_storage.access_key_id (or AWS_ACCESS_KEY_ID) must be set")?;
    let secret_access_key = non_empty(&s3_raw.secret_access_key)
        .or_else(|| env("AWS_SECRET_ACCESS_KEY").filter(|s| !s.is_empty()))
        .context("s3_storage.secret_access_key (or AWS_SECRET_ACCESS_KEY) must be set")?;

    let endpoint_url = non_empty(&s3_raw.endpoint_url);
    if let Some(endpoint) = &endpoint_url {
        url::Url::parse(endpoint)
            .with_context(|| format!("Invalid s3_storage.endpoint_url: {}", endpoint))?;
    }

    Ok((
        StorageConfig {
            bucket_name,
            region,
            access_key_id,
            secret_access_key,
            endpoint_url,
            force_path_style: s3_raw.force_path_style.unwrap_or(false),
        },
        KeyLayout {
            prefix,
            namespace_by_hour: s3_raw.namespace_by_hour.unwrap_or(false),
        },
    ))
}

fn load_mail_config<F>(mail_raw: &JsonNotificationConfig, env: &F) -> Result<Option<MailConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let endpoint_url = match non_empty(&mail_raw.endpoint_url) {
        Some(endpoint) => endpoint,
        None => {
            if mail_raw.from.is_some() || mail_raw.to.is_some() {
                warn!("notification section is present in config.json but endpoint_url is missing. Email notifications are disabled.");
            }
            return Ok(None);
        }
    };
    url::Url::parse(&endpoint_url)
        .with_context(|| format!("Invalid notification.endpoint_url: {}", endpoint_url))?;

    let from = non_empty(&mail_raw.from).context("notification.from must be set when notifications are enabled")?;
    let to: Vec<String> = mail_raw
        .to
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect();
    if to.is_empty() {
        return Err(anyhow::anyhow!(
            "notification.to must list at least one recipient when notifications are enabled"
        ));
    }
    let cc = mail_raw
        .cc
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect();

    Ok(Some(MailConfig {
        endpoint_url,
        api_key: non_empty(&mail_raw.api_key).or_else(|| env("MAIL_API_KEY").filter(|s| !s.is_empty())),
        from,
        to,
        cc,
    }))
}

fn resolve_listen_addr<F>(configured: Option<&str>, env: &F) -> Result<SocketAddr>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = configured.filter(|s| !s.is_empty()) {
        return addr
            .parse()
            .with_context(|| format!("Invalid listen_addr: {}", addr));
    }
    let port = match env("PORT") {
        Some(port) => port
            .trim()
            .parse::<u16>()
            .with_context(|| format!("Invalid PORT: {}", port))?,
        None => DEFAULT_PORT,
    };
    Ok(SocketAddr::from(([0, 0, 0, 0], port)))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Parses `whole-directory` or `per-matching-file-extension`.
pub fn parse_archive_mode(mode: Option<&str>, extension: Option<&str>) -> Result<ArchiveMode> {
    match mode.map(str::trim).unwrap_or("whole-directory") {
        "whole-directory" => Ok(ArchiveMode::WholeDirectory),
        "per-matching-file-extension" => {
            let extension = extension
                .unwrap_or(DEFAULT_FILE_EXTENSION)
                .trim()
                .trim_start_matches('.')
                .to_lowercase();
            if extension.is_empty() {
                return Err(anyhow::anyhow!("file_extension cannot be empty in per-matching-file-extension mode"));
            }
            Ok(ArchiveMode::PerFileExtension { extension })
        }
        other => Err(anyhow::anyhow!(
            "archive_mode must be 'whole-directory' or 'per-matching-file-extension', got '{}'",
            other
        )),
    }
}

/// Parses `every-success` or `fixed-hours:9,21` (brackets optional).
pub fn parse_notification_schedule(value: &str) -> Result<NotificationSchedule> {
    let value = value.trim();
    if value == "every-success" {
        return Ok(NotificationSchedule::EverySuccess);
    }
    let hours = value
        .strip_prefix("fixed-hours:")
        .with_context(|| {
            format!(
                "notification_schedule must be 'every-success' or 'fixed-hours:h1,h2,...', got '{}'",
                value
            )
        })?
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']');

    let mut parsed = Vec::new();
    for part in hours.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let hour: u32 = part
            .parse()
            .with_context(|| format!("Invalid hour '{}' in notification_schedule", part))?;
        if hour > 23 {
            return Err(anyhow::anyhow!("Hour {} in notification_schedule is out of range 0-23", hour));
        }
        parsed.push(hour);
    }
    if parsed.is_empty() {
        return Err(anyhow::anyhow!("fixed-hours notification_schedule needs at least one hour"));
    }
    parsed.sort_unstable();
    parsed.dedup();
    Ok(NotificationSchedule::FixedHours(parsed))
}

pub fn parse_guard_scope(value: &str) -> Result<GuardScope> {
    match value.trim() {
        "process" => Ok(GuardScope::Process),
        "per-hour" => Ok(GuardScope::PerHour),
        other => Err(anyhow::anyhow!(
            "guard_scope must be 'process' or 'per-hour', got '{}'",
            other
        )),
    }
}

/// Parses an S3 URI (s3://bucket/prefix) into bucket and optional key prefix.
pub fn parse_s3_destination(s3_uri: &str) -> Result<(String, Option<String>)> {
    let uri = url::Url::parse(s3_uri)
        .with_context(|| format!("Invalid S3 URI format: {}", s3_uri))?;
    if uri.scheme() != "s3" {
        return Err(anyhow::anyhow!("S3 URI must start with s3://"));
    }
    let bucket = uri.host_str().context("S3 URI missing bucket name")?.to_string();
    let prefix = uri.path().trim_matches('/').to_string();
    Ok((bucket, Some(prefix).filter(|p| !p.is_empty())))
}
