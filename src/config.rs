//! Pipeline configuration
//!
//! All tunables live in a TOML file loaded once per run and passed by
//! reference into every stage; there is no process-wide config global.
//!
//! ## Loading Order
//!
//! 1. `RAE_CONFIG` environment variable (path to TOML file)
//! 2. `./rae.toml` in the current working directory
//!
//! Unlike thresholds, credentials have no sane defaults: missing required
//! fields are a hard [`ConfigError`], raised before any network I/O.
//! Secrets may be supplied via `RAE_PASSWORD` / `RAE_SMTP_PASSWORD` instead
//! of the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration loading / validation errors. All fatal: the run aborts
/// before any network I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found (set RAE_CONFIG or create ./rae.toml)")]
    NotFound,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

// ============================================================================
// Sections
// ============================================================================

/// Well-data service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Base URL, e.g. `https://data.welldata.net/api/v1`
    #[serde(default)]
    pub endpoint: String,

    /// Application ID issued by the service
    #[serde(default)]
    pub app_id: String,

    #[serde(default)]
    pub username: String,

    /// Opaque secret; prefer the `RAE_PASSWORD` env var over the file
    #[serde(default)]
    pub password: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            app_id: String::new(),
            username: String::new(),
            password: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Polling window and streaming behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSettings {
    /// Explicit window start (RFC 3339). Both `from` and `to` or neither.
    #[serde(default)]
    pub from: Option<String>,

    /// Explicit window end (RFC 3339)
    #[serde(default)]
    pub to: Option<String>,

    /// Window length when `from`/`to` are absent: `[now - lookback, now]`
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,

    /// Use the event-stream subscription instead of a snapshot pull
    #[serde(default)]
    pub stream: bool,

    /// Bounded read timeout on the stream; exceeding it is a transient
    /// failure, so a stalled upstream never blocks the run forever
    #[serde(default = "default_stream_read_timeout_secs")]
    pub stream_read_timeout_secs: u64,

    /// How long one run consumes the stream before closing it
    #[serde(default = "default_stream_max_secs")]
    pub stream_max_secs: u64,

    /// Channel allow-list; empty means all channels with data
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_lookback_hours() -> u64 {
    24
}

/// Widest accepted lookback: one year. Keeps the window arithmetic well
/// inside `chrono::Duration` range.
pub const MAX_LOOKBACK_HOURS: u64 = 8_760;
fn default_stream_read_timeout_secs() -> u64 {
    120
}
fn default_stream_max_secs() -> u64 {
    300
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            lookback_hours: default_lookback_hours(),
            stream: false,
            stream_read_timeout_secs: default_stream_read_timeout_secs(),
            stream_max_secs: default_stream_max_secs(),
            channels: Vec::new(),
        }
    }
}

/// Retry/backoff policy knobs, shared by API calls and SMTP dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    2_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Time-bucket grouping and the statistics columns emitted per channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSettings {
    /// Bucket width in seconds
    #[serde(default = "default_bucket_secs")]
    pub bucket_secs: i64,

    /// Enabled statistics: any of "sum", "mean", "min", "max"
    #[serde(default = "default_stats")]
    pub stats: Vec<String>,
}

fn default_bucket_secs() -> i64 {
    3_600
}
fn default_stats() -> Vec<String> {
    vec!["mean".to_string(), "min".to_string(), "max".to_string()]
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            bucket_secs: default_bucket_secs(),
            stats: default_stats(),
        }
    }
}

/// Inclusive physical bounds for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelBounds {
    pub min: f64,
    pub max: f64,
}

/// Validation schema: required channels and per-channel bounds.
///
/// The defaults mirror common rig-floor sanity limits; operators override
/// them per deployment once the real channel set is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Channels that must be present on every record
    #[serde(default)]
    pub required_channels: Vec<String>,

    /// Channel name → inclusive bounds; channels without an entry are only
    /// checked for being finite
    #[serde(default = "default_bounds")]
    pub bounds: BTreeMap<String, ChannelBounds>,
}

fn default_bounds() -> BTreeMap<String, ChannelBounds> {
    let mut bounds = BTreeMap::new();
    bounds.insert(
        "HookLoad".to_string(),
        ChannelBounds {
            min: 0.0,
            max: 1_500.0,
        },
    );
    bounds.insert(
        "PumpPressure".to_string(),
        ChannelBounds {
            min: 0.0,
            max: 10_000.0,
        },
    );
    bounds.insert(
        "BlockHeight".to_string(),
        ChannelBounds {
            min: 0.0,
            max: 200.0,
        },
    );
    bounds.insert(
        "RotaryTorque".to_string(),
        ChannelBounds {
            min: 0.0,
            max: 100_000.0,
        },
    );
    bounds.insert(
        "BitPosition".to_string(),
        ChannelBounds {
            min: 0.0,
            max: 45_000.0,
        },
    );
    bounds.insert(
        "Volume".to_string(),
        ChannelBounds {
            min: 0.0,
            max: 1_000_000.0,
        },
    );
    bounds
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            required_channels: Vec::new(),
            bounds: default_bounds(),
        }
    }
}

/// Report artifact output settings. The sheet layout itself is fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSettings {
    /// Directory the artifact (and the run lock) are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Artifact file name prefix; the run date and `.xlsx` are appended
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_file_prefix() -> String {
    "RAE Report".to_string()
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

/// Outbound email settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    /// Disable to produce the report without dispatching it
    #[serde(default = "default_email_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub smtp_username: String,

    /// Prefer the `RAE_SMTP_PASSWORD` env var over the file
    #[serde(default)]
    pub smtp_password: String,

    /// Sender address
    #[serde(default)]
    pub from: String,

    /// One message is sent per recipient
    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default = "default_subject")]
    pub subject: String,
}

fn default_email_enabled() -> bool {
    true
}
fn default_smtp_port() -> u16 {
    587
}
fn default_subject() -> String {
    "RAE Data Report".to_string()
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            enabled: default_email_enabled(),
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            smtp_username: String::new(),
            smtp_password: String::new(),
            from: String::new(),
            recipients: Vec::new(),
            subject: default_subject(),
        }
    }
}

// ============================================================================
// Top-Level Settings
// ============================================================================

/// Root settings for one pipeline run. Read-only after [`Settings::load`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub window: WindowSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub aggregation: AggregationSettings,

    #[serde(default)]
    pub validation: ValidationSettings,

    #[serde(default)]
    pub report: ReportSettings,

    #[serde(default)]
    pub email: EmailSettings,
}

impl Settings {
    /// Load using the standard search order, apply env secret overrides,
    /// then validate.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("RAE_CONFIG") {
            return Self::load_from_file(Path::new(&path));
        }
        let local = Path::new("rae.toml");
        if local.exists() {
            return Self::load_from_file(local);
        }
        Err(ConfigError::NotFound)
    }

    /// Load from a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Settings = toml::from_str(&contents)?;
        settings.apply_env_overrides();
        settings.validate()?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(settings)
    }

    /// Secrets from the environment take precedence over the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RAE_USERNAME") {
            self.api.username = v;
        }
        if let Ok(v) = std::env::var("RAE_PASSWORD") {
            self.api.password = v;
        }
        if let Ok(v) = std::env::var("RAE_SMTP_PASSWORD") {
            self.email.smtp_password = v;
        }
    }

    /// Required-field and range validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField("api.endpoint"));
        }
        if !self.api.endpoint.starts_with("http://") && !self.api.endpoint.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                field: "api.endpoint",
                message: format!("not an http(s) URL: '{}'", self.api.endpoint),
            });
        }
        if self.api.app_id.trim().is_empty() {
            return Err(ConfigError::MissingField("api.app_id"));
        }
        if self.api.username.trim().is_empty() {
            return Err(ConfigError::MissingField("api.username"));
        }
        if self.api.password.is_empty() {
            return Err(ConfigError::MissingField("api.password"));
        }
        if self.api.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.request_timeout_secs",
                message: "must be at least 1".to_string(),
            });
        }

        match (&self.window.from, &self.window.to) {
            (Some(from), Some(to)) => {
                let from = parse_window_bound("window.from", from)?;
                let to = parse_window_bound("window.to", to)?;
                if from >= to {
                    return Err(ConfigError::InvalidValue {
                        field: "window.from",
                        message: "window start must precede window end".to_string(),
                    });
                }
            }
            (None, None) => {
                if self.window.lookback_hours == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "window.lookback_hours",
                        message: "must be at least 1".to_string(),
                    });
                }
            }
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "window.from",
                    message: "`from` and `to` must be set together".to_string(),
                });
            }
        }
        if self.window.lookback_hours > MAX_LOOKBACK_HOURS {
            return Err(ConfigError::InvalidValue {
                field: "window.lookback_hours",
                message: format!("must be at most {MAX_LOOKBACK_HOURS}"),
            });
        }
        if self.window.stream_read_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "window.stream_read_timeout_secs",
                message: "must be at least 1".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.base_delay_ms",
                message: "base delay exceeds max delay".to_string(),
            });
        }

        if self.aggregation.bucket_secs <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "aggregation.bucket_secs",
                message: "must be positive".to_string(),
            });
        }
        for stat in &self.aggregation.stats {
            if !matches!(stat.as_str(), "sum" | "mean" | "min" | "max") {
                return Err(ConfigError::InvalidValue {
                    field: "aggregation.stats",
                    message: format!("unknown statistic '{stat}'"),
                });
            }
        }
        if self.aggregation.stats.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "aggregation.stats",
                message: "at least one statistic required".to_string(),
            });
        }

        for (channel, bounds) in &self.validation.bounds {
            if bounds.min > bounds.max {
                return Err(ConfigError::InvalidValue {
                    field: "validation.bounds",
                    message: format!("channel '{channel}': min exceeds max"),
                });
            }
        }

        if self.email.enabled {
            if self.email.smtp_host.trim().is_empty() {
                return Err(ConfigError::MissingField("email.smtp_host"));
            }
            if self.email.from.trim().is_empty() {
                return Err(ConfigError::MissingField("email.from"));
            }
            if self.email.recipients.is_empty() {
                return Err(ConfigError::MissingField("email.recipients"));
            }
        }

        Ok(())
    }
}

fn parse_window_bound(
    field: &'static str,
    raw: &str,
) -> Result<chrono::DateTime<chrono::Utc>, ConfigError> {
    crate::validator::parse_timestamp(raw).ok_or_else(|| ConfigError::InvalidValue {
        field,
        message: format!("not an RFC 3339 timestamp: '{raw}'"),
    })
}
