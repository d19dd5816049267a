//! Service configuration: TOML parsing, defaults, and validation.
//!
//! Every section except `[source]` is optional. Durations are strings with a
//! unit suffix (`"90s"`, `"15m"`, `"1h"`, `"30d"`).
//!
//! Entrypoints:
//! - Parse + validate from a TOML string: [`load_settings_str`]
//! - Parse + validate from a file path: [`load_settings_path`]
//!
//! Errors are `anyhow` with context; a bad config is fatal at startup.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, bail, ensure};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::backoff::Backoff;

/// A duration written as `<number><unit>`, unit one of `s`, `m`, `h`, `d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    /// Wrapped value.
    pub fn get(self) -> Duration {
        self.0
    }

    const fn secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }
}

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration {s:?} is missing a unit (s, m, h, d)"))?;
        let (digits, unit) = s.split_at(split);
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("duration {s:?} must start with a whole number"))?;
        let scale = match unit.trim() {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            other => return Err(format!("duration {s:?} has unknown unit {other:?}")),
        };
        amount
            .checked_mul(scale)
            .map(|secs| Self(Duration::from_secs(secs)))
            .ok_or_else(|| format!("duration {s:?} is too large"))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        for (unit, scale) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
            if secs != 0 && secs % scale == 0 {
                return write!(f, "{}{unit}", secs / scale);
            }
        }
        write!(f, "{secs}s")
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Whole service configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Where the dataset comes from.
    pub source: SourceSettings,
    /// Refresh cadence and retry policy.
    #[serde(default)]
    pub refresh: RefreshSettings,
    /// Durable archive.
    #[serde(default)]
    pub archive: ArchiveSettings,
    /// Archive pruning.
    #[serde(default)]
    pub retention: RetentionSettings,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Kind of upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// HTTP(S) endpoint.
    Http,
    /// Local file.
    File,
}

/// `[source]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSettings {
    /// http or file.
    pub kind: SourceKind,
    /// Endpoint, for `http`.
    pub url: Option<String>,
    /// Payload path, for `file`.
    pub path: Option<PathBuf>,
    /// Environment variable holding the API key, if one is needed.
    pub api_key_env: Option<String>,
    /// Header carrying the API key.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// Per-request timeout.
    #[serde(default = "default_timeout")]
    pub timeout: HumanDuration,
}

fn default_api_key_header() -> String {
    epi_source::http::DEFAULT_API_KEY_HEADER.to_string()
}

fn default_timeout() -> HumanDuration {
    HumanDuration::secs(30)
}

/// `[refresh]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshSettings {
    /// Time between cycles.
    #[serde(default = "default_refresh_interval")]
    pub interval: HumanDuration,
    /// Retry policy.
    #[serde(default)]
    pub backoff: BackoffSettings,
}

fn default_refresh_interval() -> HumanDuration {
    HumanDuration::secs(60 * 60)
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval: default_refresh_interval(),
            backoff: BackoffSettings::default(),
        }
    }
}

/// `[refresh.backoff]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSettings {
    /// First retry delay.
    #[serde(default = "default_backoff_base")]
    pub base: HumanDuration,
    /// Delay cap.
    #[serde(default = "default_backoff_max")]
    pub max: HumanDuration,
    /// Fraction in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_backoff_base() -> HumanDuration {
    HumanDuration::secs(5)
}

fn default_backoff_max() -> HumanDuration {
    HumanDuration::secs(10 * 60)
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base: default_backoff_base(),
            max: default_backoff_max(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffSettings {
    /// Runtime policy.
    pub fn to_backoff(&self) -> Backoff {
        Backoff {
            base: self.base.get(),
            max: self.max.get(),
            jitter: self.jitter,
        }
    }
}

/// Archive backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveBackend {
    /// One file per entry under `path`.
    Filesystem,
    /// SQLite database at `path`.
    Sqlite,
    /// In-process only.
    Memory,
    /// No archive.
    #[default]
    Disabled,
}

impl fmt::Display for ArchiveBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveBackend::Filesystem => "filesystem",
            ArchiveBackend::Sqlite => "sqlite",
            ArchiveBackend::Memory => "memory",
            ArchiveBackend::Disabled => "disabled",
        })
    }
}

/// `[archive]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSettings {
    /// Which store.
    #[serde(default)]
    pub backend: ArchiveBackend,
    /// Directory (filesystem) or database file (sqlite).
    pub path: Option<PathBuf>,
    /// Publish the newest archived snapshot before the first refresh.
    #[serde(default = "default_true")]
    pub restore_on_start: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            backend: ArchiveBackend::default(),
            path: None,
            restore_on_start: true,
        }
    }
}

/// `[retention]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionSettings {
    /// Time between cleanup cycles.
    #[serde(default = "default_retention_interval")]
    pub interval: HumanDuration,
    /// Maximum entry age.
    #[serde(default = "default_horizon")]
    pub horizon: HumanDuration,
}

fn default_retention_interval() -> HumanDuration {
    HumanDuration::secs(24 * 60 * 60)
}

fn default_horizon() -> HumanDuration {
    HumanDuration::secs(30 * 24 * 60 * 60)
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            interval: default_retention_interval(),
            horizon: default_horizon(),
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_filter(),
        }
    }
}

impl Settings {
    /// Checks cross-field rules serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.source.kind {
            SourceKind::Http => {
                let Some(url) = self.source.url.as_deref() else {
                    bail!("source.url is required when source.kind = \"http\"");
                };
                ensure!(!url.trim().is_empty(), "source.url cannot be empty");
            }
            SourceKind::File => {
                ensure!(
                    self.source.path.is_some(),
                    "source.path is required when source.kind = \"file\""
                );
            }
        }
        ensure!(!self.source.timeout.get().is_zero(), "source.timeout must be non-zero");
        if let Some(var) = &self.source.api_key_env {
            ensure!(!var.trim().is_empty(), "source.api_key_env cannot be empty");
        }

        ensure!(!self.refresh.interval.get().is_zero(), "refresh.interval must be non-zero");
        let backoff = &self.refresh.backoff;
        ensure!(!backoff.base.get().is_zero(), "refresh.backoff.base must be non-zero");
        ensure!(
            backoff.base <= backoff.max,
            "refresh.backoff.base ({}) must not exceed refresh.backoff.max ({})",
            backoff.base,
            backoff.max
        );
        ensure!(
            (0.0..=1.0).contains(&backoff.jitter),
            "refresh.backoff.jitter must be within [0, 1], got {}",
            backoff.jitter
        );

        if matches!(
            self.archive.backend,
            ArchiveBackend::Filesystem | ArchiveBackend::Sqlite
        ) {
            ensure!(
                self.archive.path.is_some(),
                "archive.path is required when archive.backend = \"{}\"",
                self.archive.backend
            );
        }

        ensure!(!self.retention.interval.get().is_zero(), "retention.interval must be non-zero");
        ensure!(!self.retention.horizon.get().is_zero(), "retention.horizon must be non-zero");
        Ok(())
    }
}

/// Parse + validate settings from a TOML string.
pub fn load_settings_str(toml_str: &str) -> anyhow::Result<Settings> {
    let settings: Settings = toml::from_str(toml_str).context("parse settings TOML")?;
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

/// Parse + validate settings from a file.
pub fn load_settings_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<Settings> {
    let path = path.as_ref();
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read settings file {}", path.display()))?;
    load_settings_str(&s).with_context(|| format!("load settings from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[source]
kind = "http"
url = "https://example.org/covid19/records.json"
api_key_env = "EPI_SOURCE_API_KEY"
timeout = "45s"

[refresh]
interval = "1h"
[refresh.backoff]
base = "5s"
max = "10m"
jitter = 0.2

[archive]
backend = "sqlite"
path = "./archive.db"
restore_on_start = false

[retention]
interval = "1d"
horizon = "30d"

[logging]
format = "json"
filter = "epi_sync=debug"
"#;

    #[test]
    fn parses_durations() {
        assert_eq!("90s".parse(), Ok(HumanDuration::secs(90)));
        assert_eq!(" 15m ".parse(), Ok(HumanDuration::secs(900)));
        assert_eq!("2h".parse(), Ok(HumanDuration::secs(7200)));
        assert_eq!("30d".parse(), Ok(HumanDuration::secs(30 * 86_400)));
        assert!("10".parse::<HumanDuration>().is_err());
        assert!("1w".parse::<HumanDuration>().is_err());
        assert!("-1s".parse::<HumanDuration>().is_err());
        assert!("h".parse::<HumanDuration>().is_err());
    }

    #[test]
    fn renders_durations_in_largest_unit() {
        assert_eq!(HumanDuration::secs(90).to_string(), "90s");
        assert_eq!(HumanDuration::secs(600).to_string(), "10m");
        assert_eq!(HumanDuration::secs(86_400 * 30).to_string(), "30d");
        assert_eq!(HumanDuration::secs(0).to_string(), "0s");
    }

    #[test]
    fn full_file() {
        let s = load_settings_str(FULL).unwrap();
        assert_eq!(s.source.kind, SourceKind::Http);
        assert_eq!(s.source.timeout.get(), Duration::from_secs(45));
        assert_eq!(s.source.api_key_header, "x-api-key");
        assert_eq!(s.refresh.backoff.to_backoff().max, Duration::from_secs(600));
        assert_eq!(s.archive.backend, ArchiveBackend::Sqlite);
        assert!(!s.archive.restore_on_start);
        assert_eq!(s.retention.horizon.get(), Duration::from_secs(30 * 86_400));
        assert_eq!(s.logging.format, LogFormat::Json);
    }

    #[test]
    fn minimal_file_uses_defaults() {
        let s = load_settings_str("[source]\nkind = \"file\"\npath = \"data.json\"\n").unwrap();
        assert_eq!(s.refresh, RefreshSettings::default());
        assert_eq!(s.archive.backend, ArchiveBackend::Disabled);
        assert_eq!(s.retention.interval.get(), Duration::from_secs(86_400));
        assert_eq!(s.logging.filter, "info");
    }

    #[test]
    fn settings_survive_a_toml_round_trip() {
        let s = load_settings_str(FULL).unwrap();
        let again = load_settings_str(&toml::to_string(&s).unwrap()).unwrap();
        assert_eq!(again, s);
    }

    #[test]
    fn rejects_invalid_combinations() {
        let cases = [
            ("[source]\nkind = \"http\"\n", "source.url"),
            ("[source]\nkind = \"file\"\n", "source.path"),
            (
                "[source]\nkind = \"file\"\npath = \"a\"\n[refresh.backoff]\nbase = \"1h\"\nmax = \"1m\"\n",
                "must not exceed",
            ),
            (
                "[source]\nkind = \"file\"\npath = \"a\"\n[refresh.backoff]\njitter = 1.5\n",
                "jitter",
            ),
            ("[source]\nkind = \"file\"\npath = \"a\"\n[archive]\nbackend = \"filesystem\"\n", "archive.path"),
            ("[source]\nkind = \"file\"\npath = \"a\"\n[retention]\nhorizon = \"0d\"\n", "horizon"),
        ];
        for (toml, needle) in cases {
            let err = format!("{:#}", load_settings_str(toml).unwrap_err());
            assert!(err.contains(needle), "{needle:?} not in {err:?}");
        }
    }

    #[test]
    fn unknown_keys_and_bad_units_are_errors() {
        assert!(load_settings_str("[source]\nkind = \"file\"\npath = \"a\"\nbogus = 1\n").is_err());
        assert!(load_settings_str("[source]\nkind = \"file\"\npath = \"a\"\n[refresh]\ninterval = \"1y\"\n").is_err());
        assert!(load_settings_str("[source]\nkind = \"ftp\"\n").is_err());
    }
}
