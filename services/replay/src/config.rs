//! Configuration management for the replay buffer service.
//!
//! Loaded from configuration files and environment variables. Values with a
//! safe fallback (size class, retention class, lookback, quality) are corrected
//! with a warning; structural problems fail [`ReplayConfig::validate`].

use crate::buffer::BufferOptions;
use crate::compressor::{DEFAULT_QUALITY, MAX_QUALITY, MIN_QUALITY};
use crate::disk_store::DiskStoreOptions;
use crate::error::ConfigurationError;
use crate::playback::SeekMode;
use crate::ram_buffer::RamBudget;
use crate::scorer::FocusAlgorithm;
use crate::smart_pause::{SmartPauseSettings, MAX_LOOKBACK, MIN_LOOKBACK};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const MIB: usize = 1024 * 1024;

/// Main configuration for the replay buffer service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub disk: DiskConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub smart_pause: SmartPauseConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    /// Synthetic frame producer used by the service binary
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Prometheus exporter port (disabled when unset)
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Stream identity recorded in the recovery index
    #[serde(default = "default_stream_id")]
    pub id: String,

    /// Nominal source frame rate
    #[serde(default = "default_nominal_fps")]
    pub nominal_fps: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// RAM size class: low, medium or high
    #[serde(default = "default_ram_size_class")]
    pub ram_size_class: String,

    /// Cap on frames held in RAM instead of a byte budget
    #[serde(default)]
    pub ram_max_frames: Option<usize>,

    /// Cap on the capture-time span held in RAM, in seconds
    #[serde(default)]
    pub ram_max_secs: Option<f64>,

    /// JPEG quality, 1-100
    #[serde(default = "default_quality")]
    pub compression_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    /// Total retention: 20, 30 or 40 minutes
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,

    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u64,

    #[serde(default = "default_segment_max_mb")]
    pub segment_max_mb: u64,

    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Indexes older than this are discarded on startup
    #[serde(default = "default_max_index_age_secs")]
    pub max_index_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub algorithm: FocusAlgorithm,

    #[serde(default = "default_score_cache_capacity")]
    pub cache_capacity: usize,

    /// Background scoring cadence; 0 disables it
    #[serde(default = "default_background_interval_ms")]
    pub background_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmartPauseConfig {
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: f64,

    /// Defaults to the expected frame count of the window
    #[serde(default)]
    pub max_scoring_attempts: Option<usize>,

    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,

    #[serde(default)]
    pub scoring_timeout_ms: Option<u64>,

    #[serde(default = "default_backfill")]
    pub backfill: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_width")]
    pub width: u32,

    #[serde(default = "default_source_height")]
    pub height: u32,

    #[serde(default = "default_seek_mode")]
    pub seek_mode: SeekMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_service_name() -> String {
    "replay-buffer".to_string()
}
fn default_stream_id() -> String {
    "default".to_string()
}
fn default_nominal_fps() -> f64 {
    30.0
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_ram_size_class() -> String {
    "medium".to_string()
}
fn default_quality() -> u8 {
    DEFAULT_QUALITY
}
fn default_retention_minutes() -> u64 {
    40
}
fn default_segment_duration_secs() -> u64 {
    60
}
fn default_segment_max_mb() -> u64 {
    256
}
fn default_write_queue_capacity() -> usize {
    1024
}
fn default_snapshot_interval_secs() -> u64 {
    30
}
fn default_max_index_age_secs() -> u64 {
    3600
}
fn default_score_cache_capacity() -> usize {
    1024
}
fn default_background_interval_ms() -> u64 {
    250
}
fn default_lookback_secs() -> f64 {
    2.0
}
fn default_warmup_ms() -> u64 {
    200
}
fn default_backfill() -> bool {
    true
}
fn default_stats_interval_secs() -> u64 {
    10
}
fn default_source_width() -> u32 {
    320
}
fn default_source_height() -> u32 {
    240
}
fn default_seek_mode() -> SeekMode {
    SeekMode::LiveBuffered
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: None,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            id: default_stream_id(),
            nominal_fps: default_nominal_fps(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ram_size_class: default_ram_size_class(),
            ram_max_frames: None,
            ram_max_secs: None,
            compression_quality: default_quality(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            retention_minutes: default_retention_minutes(),
            segment_duration_secs: default_segment_duration_secs(),
            segment_max_mb: default_segment_max_mb(),
            write_queue_capacity: default_write_queue_capacity(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval_secs(),
            max_index_age_secs: default_max_index_age_secs(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            algorithm: FocusAlgorithm::default(),
            cache_capacity: default_score_cache_capacity(),
            background_interval_ms: default_background_interval_ms(),
        }
    }
}

impl Default for SmartPauseConfig {
    fn default() -> Self {
        Self {
            lookback_secs: default_lookback_secs(),
            max_scoring_attempts: None,
            warmup_ms: default_warmup_ms(),
            scoring_timeout_ms: None,
            backfill: default_backfill(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval_secs(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            width: default_source_width(),
            height: default_source_height(),
            seek_mode: default_seek_mode(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// RAM budget presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamSizeClass {
    Low,
    Medium,
    High,
}

impl RamSizeClass {
    pub fn parse(value: &str) -> Result<Self, ConfigurationError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RamSizeClass::Low),
            "medium" => Ok(RamSizeClass::Medium),
            "high" => Ok(RamSizeClass::High),
            _ => Err(ConfigurationError::InvalidSizeClass(value.to_string())),
        }
    }

    /// Compressed-frame byte budget.
    pub fn byte_budget(self) -> usize {
        match self {
            RamSizeClass::Low => 256 * MIB,
            RamSizeClass::Medium => 512 * MIB,
            RamSizeClass::High => 1024 * MIB,
        }
    }
}

impl ReplayConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with REPLAY_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. REPLAY__BUFFER__RAM_SIZE_CLASS=high
            .add_source(
                Environment::with_prefix("REPLAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("REPLAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.stream.id.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("stream.id".to_string()));
        }

        if !(self.stream.nominal_fps > 0.0 && self.stream.nominal_fps.is_finite()) {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.nominal_fps".to_string(),
                message: "FPS must be greater than 0".to_string(),
            });
        }

        if self.buffer.data_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "buffer.data_dir".to_string(),
            ));
        }

        if self.buffer.ram_max_frames == Some(0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "buffer.ram_max_frames".to_string(),
                message: "Frame cap must be greater than 0".to_string(),
            });
        }

        if let Some(secs) = self.buffer.ram_max_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "buffer.ram_max_secs".to_string(),
                    message: "RAM span must be a positive number of seconds".to_string(),
                });
            }
        }

        if self.disk.write_queue_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "disk.write_queue_capacity".to_string(),
                message: "Queue capacity must be greater than 0".to_string(),
            });
        }

        if self.disk.segment_duration_secs == 0 || self.disk.segment_max_mb == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "disk.segment_duration_secs/segment_max_mb".to_string(),
                message: "Segment limits must be greater than 0".to_string(),
            });
        }

        if self.source.width < 3 || self.source.height < 3 {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.width/height".to_string(),
                message: "Dimensions must be at least 3x3".to_string(),
            });
        }

        Ok(())
    }

    /// RAM budget: frame cap, then time span, then size class.
    ///
    /// An unknown size class falls back to Medium.
    pub fn ram_budget(&self) -> RamBudget {
        if let Some(frames) = self.buffer.ram_max_frames {
            return RamBudget::Frames(frames);
        }
        if let Some(secs) = self.buffer.ram_max_secs {
            match Duration::try_from_secs_f64(secs) {
                Ok(span) if !span.is_zero() => return RamBudget::Duration(span),
                _ => warn!(ram_max_secs = secs, "Invalid RAM span, using size class"),
            }
        }
        let class = RamSizeClass::parse(&self.buffer.ram_size_class).unwrap_or_else(|e| {
            warn!(error = %e, fallback = "medium", "Invalid configuration, using default");
            RamSizeClass::Medium
        });
        RamBudget::Bytes(class.byte_budget())
    }

    /// Total retention window, falling back to 40 minutes.
    pub fn retention(&self) -> Duration {
        let minutes = match self.disk.retention_minutes {
            minutes @ (20 | 30 | 40) => minutes,
            other => {
                let e = ConfigurationError::InvalidRetention(other);
                warn!(error = %e, fallback = 40, "Invalid configuration, using default");
                40
            }
        };
        Duration::from_secs(minutes * 60)
    }

    /// Lookback window clamped into 1-5s.
    pub fn lookback(&self) -> Duration {
        let secs = self.smart_pause.lookback_secs;
        if !secs.is_finite() {
            let e = ConfigurationError::LookbackOutOfRange(secs);
            warn!(error = %e, "Invalid configuration, using default");
            return Duration::from_secs_f64(default_lookback_secs());
        }
        let requested = Duration::from_secs_f64(secs.max(0.0));
        if requested < MIN_LOOKBACK || requested > MAX_LOOKBACK {
            let e = ConfigurationError::LookbackOutOfRange(secs);
            warn!(error = %e, "Invalid configuration, clamping");
        }
        requested.clamp(MIN_LOOKBACK, MAX_LOOKBACK)
    }

    /// Compression quality clamped into 1-100.
    pub fn quality(&self) -> u8 {
        let quality = self.buffer.compression_quality;
        if !(MIN_QUALITY..=MAX_QUALITY).contains(&quality) {
            let e = ConfigurationError::InvalidQuality(quality);
            warn!(error = %e, "Invalid configuration, clamping");
        }
        quality.clamp(MIN_QUALITY, MAX_QUALITY)
    }

    pub fn buffer_options(&self) -> BufferOptions {
        let mut disk = DiskStoreOptions::new(self.buffer.data_dir.join("segments"));
        disk.segment_duration = Duration::from_secs(self.disk.segment_duration_secs);
        disk.segment_max_bytes = self.disk.segment_max_mb * MIB as u64;
        disk.retention = self.retention();
        disk.queue_capacity = self.disk.write_queue_capacity;

        BufferOptions {
            stream_id: self.stream.id.clone(),
            data_dir: self.buffer.data_dir.clone(),
            ram_budget: self.ram_budget(),
            disk,
            quality: self.quality(),
            focus_algorithm: self.scoring.algorithm,
            score_cache_capacity: self.scoring.cache_capacity,
            index_max_age: Duration::from_secs(self.recovery.max_index_age_secs),
        }
    }

    pub fn smart_pause_settings(&self) -> SmartPauseSettings {
        let mut settings = SmartPauseSettings::new(self.lookback(), self.stream.nominal_fps);
        settings.max_scoring_attempts = self.smart_pause.max_scoring_attempts;
        settings.warmup = Duration::from_millis(self.smart_pause.warmup_ms);
        settings.scoring_timeout = self.smart_pause.scoring_timeout_ms.map(Duration::from_millis);
        settings.backfill = self.smart_pause.backfill;
        settings
    }
}

impl RecoveryConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl ScoringConfig {
    /// `None` when background scoring is disabled.
    pub fn background_interval(&self) -> Option<Duration> {
        (self.background_interval_ms > 0).then(|| Duration::from_millis(self.background_interval_ms))
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
