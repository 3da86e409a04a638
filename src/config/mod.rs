//! Configuration management for the receiver.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;

use crate::error::{Error, Result};
use crate::pipeline::RecordingWindow;
use crate::scheduler::CronTrigger;
use crate::types::{Provider, ProviderId};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Terminal listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Reading queue and worker pool.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Months during which readings are stored.
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Periodic jobs.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Storage backends.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Providers defined inline, in addition to the seed file.
    #[serde(default)]
    pub providers: Vec<Provider>,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    ///
    /// Out-of-range recording months are not an error here; they fall back
    /// to the default window when the window is built.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addrs.is_empty() {
            return Err(Error::InvalidConfig("No listen addresses".into()));
        }

        if self.server.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections must be positive".into()));
        }

        if self.pipeline.workers == 0 {
            return Err(Error::InvalidConfig("Pipeline needs at least one worker".into()));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(Error::InvalidConfig("Queue capacity must be positive".into()));
        }

        if !(self.schedule.tolerance.is_finite() && self.schedule.tolerance > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "Simplification tolerance must be positive, got {}",
                self.schedule.tolerance
            )));
        }

        let tz = self.schedule.timezone()?;
        CronTrigger::parse(&self.schedule.cache_refresh, tz)?;
        CronTrigger::parse(&self.schedule.simplify, tz)?;

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id) {
                return Err(Error::InvalidConfig(format!(
                    "Duplicate provider id {}",
                    provider.id
                )));
            }
            if provider.ip_patterns.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "Provider {} has no IP patterns",
                    provider.name
                )));
            }
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("ru", "egts", "egts-receiver").map_or_else(
            || PathBuf::from("egts-receiver.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            server: ServerConfig {
                listen_addrs: vec![SocketAddr::from(([0, 0, 0, 0], 6000))],
                connection_ttl: Duration::from_secs(30),
                ..Default::default()
            },
            storage: StorageConfig {
                seed_file: Some(PathBuf::from("vehicles.json")),
                readings_file: Some(PathBuf::from("readings.jsonl")),
            },
            providers: vec![Provider {
                id: ProviderId(1),
                name: "local".into(),
                ip_patterns: vec!["127.0.0.1".into(), "192.168.*".into()],
            }],
            ..Default::default()
        }
    }
}

/// Terminal listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen addresses.
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<SocketAddr>,

    /// Read deadline for each header and body read. Zero disables it.
    #[serde(default, with = "humantime_serde")]
    pub connection_ttl: Duration,

    /// Maximum concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_listen_addrs() -> Vec<SocketAddr> {
    vec![SocketAddr::from(([0, 0, 0, 0], 6000))]
}
fn default_max_connections() -> usize {
    10000
}

impl ServerConfig {
    /// Read deadline, `None` when disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        (!self.connection_ttl.is_zero()).then_some(self.connection_ttl)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            connection_ttl: Duration::ZERO,
            max_connections: default_max_connections(),
        }
    }
}

/// Reading queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Readings buffered before submission blocks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Worker tasks draining the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_queue_capacity() -> usize {
    1024
}
fn default_workers() -> usize {
    4
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
        }
    }
}

/// Recording window configuration (inclusive months, 1-12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_month_start")]
    pub month_start: u32,

    #[serde(default = "default_month_end")]
    pub month_end: u32,
}

fn default_month_start() -> u32 {
    5
}
fn default_month_end() -> u32 {
    9
}

impl RecordingConfig {
    pub fn window(&self) -> RecordingWindow {
        RecordingWindow::new(self.month_start, self.month_end)
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            month_start: default_month_start(),
            month_end: default_month_end(),
        }
    }
}

/// Periodic job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// IANA timezone the expressions are evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// When to reload the last-position cache.
    #[serde(default = "default_cache_refresh")]
    pub cache_refresh: String,

    /// When to simplify recent tracks.
    #[serde(default = "default_simplify")]
    pub simplify: String,

    /// Douglas-Peucker tolerance in degrees.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// How far back each simplification pass looks.
    #[serde(default = "default_lookback", with = "humantime_serde")]
    pub lookback: Duration,
}

fn default_timezone() -> String {
    "Europe/Moscow".into()
}
fn default_cache_refresh() -> String {
    "0 3 * * *".into()
}
fn default_simplify() -> String {
    "0 4 * * *".into()
}
fn default_tolerance() -> f64 {
    crate::geometry::DEFAULT_TOLERANCE
}
fn default_lookback() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl ScheduleConfig {
    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        chrono_tz::Tz::from_str(&self.timezone)
            .map_err(|e| Error::InvalidConfig(format!("Unknown timezone {:?}: {e}", self.timezone)))
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            cache_refresh: default_cache_refresh(),
            simplify: default_simplify(),
            tolerance: default_tolerance(),
            lookback: default_lookback(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file with providers, vehicles and known points loaded at startup.
    pub seed_file: Option<PathBuf>,

    /// JSON-lines file every stored reading is appended to.
    pub readings_file: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path. Rotated daily.
    pub file: Option<PathBuf>,

    /// Rotated files to keep.
    pub max_files: Option<usize>,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            max_files: None,
            color: default_color(),
        }
    }
}

/// Initialize logging.
///
/// When a log file is configured the returned guard must be kept alive for
/// buffered lines to be flushed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (writer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path, config)?);
            (fmt::writer::BoxMakeWriter::new(writer), Some(guard))
        }
        None => (fmt::writer::BoxMakeWriter::new(std::io::stdout), None),
    };
    let ansi = config.color && config.file.is_none();

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json().with_writer(writer))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(ansi).with_writer(writer))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(guard)
}

fn file_appender(
    path: &Path,
    config: &LoggingConfig,
) -> Result<tracing_appender::rolling::RollingFileAppender> {
    use tracing_appender::rolling::{Builder, Rotation};

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let prefix = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("Invalid log file path {}", path.display())))?;

    let mut builder = Builder::new().rotation(Rotation::DAILY).filename_prefix(prefix);
    if let Some(n) = config.max_files {
        builder = builder.max_log_files(n);
    }
    builder
        .build(dir)
        .map_err(|e| Error::Config(format!("Failed to open log file: {e}")))
}
