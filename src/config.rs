// src/config.rs

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_KEY_COLUMN: &str = "sourcetype";
pub const DEFAULT_EXTENSION: &str = "csv";
pub const DEFAULT_TIME_FIELD: &str = "_time";
pub const DEFAULT_RAW_FIELD: &str = "_raw";

/// Splunk's date decomposition fields, dropped unless the user overrides the list.
pub const DEFAULT_EXCLUDE_FIELDS: &[&str] = &[
    "date_hour",
    "date_mday",
    "date_minute",
    "date_month",
    "date_wday",
    "date_year",
    "date_zone",
];

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_RETRY_COUNT: usize = 3;
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for one split run.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub key_column: String,
    pub extension: String,
}

impl SplitConfig {
    /// Output defaults to the directory holding `input`.
    pub fn new(input: impl Into<PathBuf>, output_dir: Option<PathBuf>) -> Self {
        let input = input.into();
        let output_dir = output_dir.unwrap_or_else(|| {
            input
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        Self {
            input,
            output_dir,
            key_column: DEFAULT_KEY_COLUMN.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    pub fn with_key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = column.into();
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }
}

/// How the time column is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeFormat {
    /// `2024-01-02T03:04:05Z`, with optional fraction and numeric offset.
    Rfc3339,
    /// Seconds since the epoch, integer or fractional.
    Epoch,
    /// Milliseconds since the epoch.
    EpochMillis,
    /// A chrono strftime pattern, interpreted as UTC when it carries no offset.
    Pattern(String),
}

impl TimeFormat {
    /// Parse `raw` into epoch seconds. Values outside chrono's date range are rejected.
    pub fn parse_epoch_seconds(&self, raw: &str) -> Option<i64> {
        let raw = raw.trim();
        match self {
            TimeFormat::Rfc3339 => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.timestamp()),
            TimeFormat::Epoch => raw
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    raw.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                        .map(|f| f.floor() as i64)
                })
                .and_then(representable),
            TimeFormat::EpochMillis => raw
                .parse::<i64>()
                .ok()
                .map(|ms| ms.div_euclid(1000))
                .and_then(representable),
            TimeFormat::Pattern(pattern) => DateTime::parse_from_str(raw, pattern)
                .map(|dt| dt.timestamp())
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(raw, pattern)
                        .map(|naive| Utc.from_utc_datetime(&naive).timestamp())
                })
                .ok(),
        }
    }
}

fn representable(secs: i64) -> Option<i64> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|_| secs)
}

impl Default for TimeFormat {
    fn default() -> Self {
        TimeFormat::Rfc3339
    }
}

impl FromStr for TimeFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "rfc3339" | "iso8601" => Ok(TimeFormat::Rfc3339),
            "epoch" => Ok(TimeFormat::Epoch),
            "epoch_ms" => Ok(TimeFormat::EpochMillis),
            _ if s.contains('%') => Ok(TimeFormat::Pattern(s.trim().to_string())),
            other => Err(anyhow!(
                "unknown time format `{}` (expected rfc3339, epoch, epoch_ms or a strftime pattern)",
                other
            )),
        }
    }
}

/// Row → event conversion settings. Built once, then shared read-only.
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    pub sourcetype: String,
    pub host: String,
    pub source: String,
    pub index: String,
    pub time_field: String,
    pub time_format: TimeFormat,
    pub raw_field: String,
    pub exclude_fields: BTreeSet<String>,
    pub field_mappings: BTreeMap<String, String>,
    pub constant_fields: BTreeMap<String, String>,
    pub strict_mapping: bool,
    pub preserve_nulls: bool,
    pub discard_invalid: bool,
    pub default_timestamp: Option<DateTime<Utc>>,
    pub time_offset: ChronoDuration,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            sourcetype: String::new(),
            host: String::new(),
            source: String::new(),
            index: String::new(),
            time_field: DEFAULT_TIME_FIELD.to_string(),
            time_format: TimeFormat::Rfc3339,
            raw_field: DEFAULT_RAW_FIELD.to_string(),
            exclude_fields: DEFAULT_EXCLUDE_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            field_mappings: BTreeMap::new(),
            constant_fields: BTreeMap::new(),
            strict_mapping: false,
            preserve_nulls: false,
            discard_invalid: false,
            default_timestamp: None,
            time_offset: ChronoDuration::zero(),
        }
    }
}

/// Collector endpoint settings.
#[derive(Debug, Clone)]
pub struct HecConfig {
    pub url: String,
    pub token: String,
    pub insecure: bool,
    pub timeout: Duration,
    pub index: String,
    pub host: String,
    pub source: String,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
}

impl HecConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            insecure: false,
            timeout: DEFAULT_HTTP_TIMEOUT,
            index: String::new(),
            host: String::new(),
            source: String::new(),
            headers: BTreeMap::new(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub retry_count: usize,
    pub retry_wait: Duration,
    pub dry_run: bool,
    pub extension: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_wait: DEFAULT_RETRY_WAIT,
            dry_run: false,
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }
}

impl PublisherConfig {
    /// Replace zero-valued knobs with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.retry_count == 0 {
            self.retry_count = DEFAULT_RETRY_COUNT;
        }
        if self.retry_wait.is_zero() {
            self.retry_wait = DEFAULT_RETRY_WAIT;
        }
        if self.extension.is_empty() {
            self.extension = DEFAULT_EXTENSION.to_string();
        }
        self
    }
}

/// Map-shaped settings read from a YAML file.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub field_mappings: BTreeMap<String, String>,
    pub constant_fields: BTreeMap<String, String>,
    pub exclude_fields: Option<Vec<String>>,
    pub headers: BTreeMap<String, String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Fold the file settings into configs that are still being assembled.
    pub fn apply(self, transformer: &mut TransformerConfig, hec: &mut HecConfig) {
        transformer.field_mappings.extend(self.field_mappings);
        transformer.constant_fields.extend(self.constant_fields);
        if let Some(fields) = self.exclude_fields {
            transformer.exclude_fields = fields.into_iter().collect();
        }
        hec.headers.extend(self.headers);
    }
}

/// Parse a duration such as `-1h`, `+30m` or `90s`.
pub fn parse_signed_duration(raw: &str) -> Result<ChronoDuration> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "0" {
        return Ok(ChronoDuration::zero());
    }
    let (negative, magnitude) = match raw.as_bytes()[0] {
        b'-' => (true, &raw[1..]),
        b'+' => (false, &raw[1..]),
        _ => (false, raw),
    };
    let std = humantime::parse_duration(magnitude.trim())
        .with_context(|| format!("invalid duration `{}`", raw))?;
    let duration = ChronoDuration::from_std(std)
        .with_context(|| format!("duration `{}` out of range", raw))?;
    Ok(if negative { -duration } else { duration })
}

/// `""` and `"auto"` resolve to this machine's hostname when one is known.
pub fn resolve_host(host: &str) -> String {
    if !host.is_empty() && host != "auto" {
        return host.to_string();
    }
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}
