// src/config.rs

//! Loads and validates the daemon's configuration: a TOML file read once at
//! startup into a [`Config`], following the teacher's `RawConfig` →
//! `Config::from_file` → `validate()` shape (`src/config.rs`).

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Per-source defaults and global scheduling knobs (spec §6's enumerated
/// `Sources.*` keys), loaded under a `[sources]` table.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SourcesConfig {
    /// Global concurrent-download budget (`Sources.DownloadSlots`, ≥1).
    #[serde(default = "default_download_slots")]
    pub download_slots: u32,
    /// Per-source concurrent-download cap; `0` means unlimited
    /// (`Sources.MaxSlotsPerSource`).
    #[serde(default)]
    pub max_slots_per_source: u32,
    /// Per-source request pacing in req/s; `0` means unlimited
    /// (`Sources.MaxRatePerSource`).
    #[serde(default)]
    pub max_rate_per_source: f64,
    /// How often a feed is re-checked for new advisory locations
    /// (`Sources.FeedRefresh`).
    #[serde(default = "default_feed_refresh", with = "humantime_serde")]
    pub feed_refresh: Duration,
    /// How long a worker waits for a download before giving up
    /// (`Sources.FeedRefresh`'s deadline companion, spec §4.3).
    #[serde(default = "default_refresh_deadline", with = "humantime_serde")]
    pub refresh_deadline: Duration,
    /// Skip advisories older than this when first discovered; `0` disables
    /// the filter (`Sources.DefaultAge`).
    #[serde(default = "default_zero_duration", with = "humantime_serde")]
    pub default_age: Duration,
    /// Hard ceiling on advisory age regardless of `default_age`; `0`
    /// disables it (`Sources.MaxAge`).
    #[serde(default = "default_zero_duration", with = "humantime_serde")]
    pub max_age: Duration,
    /// Default per-feed log verbosity (`Sources.FeedLogLevel`), one of
    /// `debug`/`info`/`warn`/`error`.
    #[serde(default = "default_feed_log_level")]
    pub feed_log_level: String,
    /// Default `strict_mode` a source inherits when it doesn't override it.
    #[serde(default)]
    pub strict_mode: bool,
    /// Default TLS posture; `true` skips certificate verification
    /// (`Sources.Secure` is the safe-by-default knob this inverts).
    #[serde(default)]
    pub insecure: bool,
    /// Default signature-check requirement (`Sources.SignatureCheck`).
    #[serde(default)]
    pub signature_check: bool,
    /// TTL for the OpenPGP keys cache (`Sources.OpenPGPCaching`).
    #[serde(default = "default_openpgp_caching", with = "humantime_serde")]
    pub openpgp_caching: Duration,
    /// Retention window for feed log rows (`Sources.KeepFeedLogs`).
    #[serde(default = "default_keep_feed_logs", with = "humantime_serde")]
    pub keep_feed_logs: Duration,
    /// Symmetric key material for the at-rest credential crypto box (spec
    /// §4.8). Required; there is no sane default for secret material.
    pub crypto_secret: String,
    /// Per-request timeout applied to every download/refresh worker.
    #[serde(default = "default_worker_http_timeout", with = "humantime_serde")]
    pub worker_http_timeout: Duration,
    /// Number of concurrent download workers draining the job queue (spec
    /// §4.4).
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Optional remote validator endpoint every download must additionally
    /// pass (spec §4's "Remote validator port"). `None` disables the check.
    #[serde(default)]
    pub remote_validation_url: Option<String>,
}

fn default_download_slots() -> u32 {
    16
}
fn default_feed_refresh() -> Duration {
    Duration::from_secs(3600)
}
fn default_refresh_deadline() -> Duration {
    Duration::from_secs(30)
}
fn default_zero_duration() -> Duration {
    Duration::from_secs(0)
}
fn default_feed_log_level() -> String {
    "info".to_string()
}
fn default_openpgp_caching() -> Duration {
    Duration::from_secs(6 * 3600)
}
fn default_keep_feed_logs() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}
fn default_worker_http_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_worker_count() -> usize {
    4
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            download_slots: default_download_slots(),
            max_slots_per_source: 0,
            max_rate_per_source: 0.0,
            feed_refresh: default_feed_refresh(),
            refresh_deadline: default_refresh_deadline(),
            default_age: default_zero_duration(),
            max_age: default_zero_duration(),
            feed_log_level: default_feed_log_level(),
            strict_mode: false,
            insecure: false,
            signature_check: false,
            openpgp_caching: default_openpgp_caching(),
            keep_feed_logs: default_keep_feed_logs(),
            crypto_secret: String::new(),
            worker_http_timeout: default_worker_http_timeout(),
            worker_count: default_worker_count(),
            remote_validation_url: None,
        }
    }
}

/// Configuration for the Prometheus metrics exporter (spec §1.1 ambient
/// stack, mirroring the teacher's `MetricsConfig`).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server is started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9898
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A raw representation of the config file before validation (teacher's
/// `RawConfig` split: every field optional/defaulted, nothing resolved yet).
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    database_url: String,
    #[serde(default)]
    sources: SourcesConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

/// The final, validated configuration the rest of the process reads from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    pub database_url: String,
    pub sources: SourcesConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database_url: String::new(),
            sources: SourcesConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents).with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            log_level: raw.log_level,
            database_url: raw.database_url,
            sources: raw.sources,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the loaded configuration (spec §6.1: non-zero slots,
    /// non-empty `database_url`, a real metrics port when metrics are on).
    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(anyhow!("database_url cannot be empty"));
        }
        if self.sources.download_slots == 0 {
            return Err(anyhow!("sources.download_slots cannot be 0"));
        }
        if self.sources.crypto_secret.trim().is_empty() {
            return Err(anyhow!("sources.crypto_secret cannot be empty"));
        }
        if self.sources.worker_count == 0 {
            return Err(anyhow!("sources.worker_count cannot be 0"));
        }
        if self.sources.feed_log_level.parse::<crate::core::model::LogLevel>().is_err() {
            return Err(anyhow!("sources.feed_log_level must be one of debug/info/warn/error"));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0 when metrics are enabled"));
        }
        if let Some(url) = &self.sources.remote_validation_url {
            if url::Url::parse(url).is_err() {
                return Err(anyhow!("sources.remote_validation_url is not a valid URL"));
            }
        }
        Ok(())
    }

    /// Builds the [`crate::core::manager::ManagerDefaults`] this config
    /// implies, the bridge between the TOML surface and the manager's
    /// runtime knobs.
    pub fn manager_defaults(&self) -> crate::core::manager::ManagerDefaults {
        crate::core::manager::ManagerDefaults {
            strict_mode: self.sources.strict_mode,
            insecure: self.sources.insecure,
            signature_check: self.sources.signature_check,
            slots_per_source: self.sources.max_slots_per_source,
            global_slots: self.sources.download_slots,
            refresh_interval: self.sources.feed_refresh,
            refresh_deadline: self.sources.refresh_deadline,
            worker_count: self.sources.worker_count,
            max_rate_per_source: self.sources.max_rate_per_source,
            default_age: self.sources.default_age,
            max_age: self.sources.max_age,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_a_minimal_config_with_defaults() {
        let file = write_config(
            r#"
            database_url = "postgres://localhost/csaf"

            [sources]
            crypto_secret = "super-secret"
            "#,
        );
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.sources.download_slots, 16);
        assert_eq!(config.sources.feed_refresh, Duration::from_secs(3600));
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn rejects_an_empty_database_url() {
        let file = write_config(
            r#"
            database_url = ""

            [sources]
            crypto_secret = "super-secret"
            "#,
        );
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_zero_download_slots() {
        let file = write_config(
            r#"
            database_url = "postgres://localhost/csaf"

            [sources]
            crypto_secret = "super-secret"
            download_slots = 0
            "#,
        );
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_metrics_enabled_with_a_zero_port() {
        let file = write_config(
            r#"
            database_url = "postgres://localhost/csaf"

            [sources]
            crypto_secret = "super-secret"

            [metrics]
            enabled = true
            port = 0
            "#,
        );
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_an_unparseable_feed_log_level() {
        let file = write_config(
            r#"
            database_url = "postgres://localhost/csaf"

            [sources]
            crypto_secret = "super-secret"
            feed_log_level = "verbose"
            "#,
        );
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_an_unparseable_remote_validation_url() {
        let file = write_config(
            r#"
            database_url = "postgres://localhost/csaf"

            [sources]
            crypto_secret = "super-secret"
            remote_validation_url = "not a url"
            "#,
        );
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn accepts_a_well_formed_remote_validation_url() {
        let file = write_config(
            r#"
            database_url = "postgres://localhost/csaf"

            [sources]
            crypto_secret = "super-secret"
            remote_validation_url = "https://validator.example/csaf"
            "#,
        );
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.sources.remote_validation_url.as_deref(), Some("https://validator.example/csaf"));
    }
}
