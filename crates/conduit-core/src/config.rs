use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::SourceKind;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_SECS: u64 = 60;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY_SECS: u64 = 3600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600; // hourly
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 2 * 3600;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_DISPATCH_BUFFER: usize = 256;

/// Top-level config (conduit.toml + CONDUIT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Command adapter per source kind, keyed by kind name.
    #[serde(default)]
    pub adapters: BTreeMap<String, AdapterCommandConfig>,
    /// Sources registered on startup when the store does not know them yet.
    #[serde(default)]
    pub sources: Vec<SourceSeed>,
}

/// Timing and retry policy of the sync scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for a single backoff delay.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Runs older than this are presumed hung and reaped by the sweeper.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    /// Execution window for kinds without an entry in `timeouts`.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Per-kind execution window in seconds, keyed by kind name.
    #[serde(default)]
    pub timeouts: BTreeMap<String, u64>,
    /// How long `shutdown` waits for in-flight runs.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Capacity of the fire/retry dispatch queue.
    #[serde(default = "default_dispatch_buffer")]
    pub dispatch_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_secs: DEFAULT_BASE_DELAY_SECS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            stuck_threshold_secs: DEFAULT_STUCK_THRESHOLD_SECS,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            timeouts: BTreeMap::new(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            dispatch_buffer: DEFAULT_DISPATCH_BUFFER,
        }
    }
}

impl SchedulerConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Execution window for one run of a source of `kind`.
    pub fn timeout_for(&self, kind: SourceKind) -> Duration {
        let secs = self
            .timeouts
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(CoreError::Config(format!(
                "scheduler.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(CoreError::Config(
                "scheduler.sweep_interval_secs must be > 0".to_string(),
            ));
        }
        if self.stuck_threshold_secs == 0 {
            return Err(CoreError::Config(
                "scheduler.stuck_threshold_secs must be > 0".to_string(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(CoreError::Config(
                "scheduler.default_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.dispatch_buffer == 0 {
            return Err(CoreError::Config(
                "scheduler.dispatch_buffer must be > 0".to_string(),
            ));
        }
        for (kind, secs) in &self.timeouts {
            kind.parse::<SourceKind>()?;
            if *secs == 0 {
                return Err(CoreError::Config(format!(
                    "scheduler.timeouts.{kind} must be > 0"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// External program that performs the pull for one source kind.
///
/// The source id is appended as the final argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A source declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSeed {
    pub id: String,
    pub kind: SourceKind,
    pub schedule: String,
    #[serde(default)]
    pub timezone: String,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_secs() -> u64 {
    DEFAULT_BASE_DELAY_SECS
}
fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}
fn default_max_delay_secs() -> u64 {
    DEFAULT_MAX_DELAY_SECS
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_stuck_threshold_secs() -> u64 {
    DEFAULT_STUCK_THRESHOLD_SECS
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_dispatch_buffer() -> usize {
    DEFAULT_DISPATCH_BUFFER
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conduit/conduit.db", home)
}

impl ConduitConfig {
    /// Load config from a TOML file with CONDUIT_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.conduit/conduit.toml
    ///
    /// Nested keys use a double underscore, e.g. `CONDUIT_SCHEDULER__MAX_ATTEMPTS=5`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading config");

        let config: ConduitConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONDUIT_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        for kind in self.adapters.keys() {
            kind.parse::<SourceKind>()?;
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conduit/conduit.toml", home)
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_documented_policy() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.base_delay(), Duration::from_secs(60));
        assert_eq!(cfg.backoff_multiplier, 2.0);
        assert_eq!(cfg.stuck_threshold(), Duration::from_secs(7200));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(3600));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn per_kind_timeout_falls_back_to_default() {
        let mut cfg = SchedulerConfig::default();
        cfg.timeouts.insert("database".to_string(), 900);
        assert_eq!(cfg.timeout_for(SourceKind::Database), Duration::from_secs(900));
        assert_eq!(
            cfg.timeout_for(SourceKind::Spreadsheet),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        let cfg = SchedulerConfig {
            backoff_multiplier: 0.5,
            ..SchedulerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn validate_rejects_unknown_timeout_kind() {
        let mut cfg = SchedulerConfig::default();
        cfg.timeouts.insert("crm".to_string(), 10);
        assert!(matches!(cfg.validate(), Err(CoreError::UnknownKind(_))));
    }

    #[test]
    fn load_merges_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "conduit.toml",
                r#"
                [scheduler]
                max_attempts = 5
                base_delay_secs = 30

                [scheduler.timeouts]
                payments = 45

                [adapters.spreadsheet]
                command = "sheets-sync"
                args = ["--quiet"]

                [[sources]]
                id = "ds-1"
                kind = "spreadsheet"
                schedule = "*/5 * * * *"
                "#,
            )?;
            jail.set_env("CONDUIT_SCHEDULER__BASE_DELAY_SECS", "15");

            let cfg = ConduitConfig::load(Some("conduit.toml")).expect("load");
            assert_eq!(cfg.scheduler.max_attempts, 5);
            assert_eq!(cfg.scheduler.base_delay_secs, 15);
            assert_eq!(
                cfg.scheduler.timeout_for(SourceKind::Payments),
                Duration::from_secs(45)
            );
            assert_eq!(cfg.adapters["spreadsheet"].args, vec!["--quiet"]);
            assert_eq!(cfg.sources[0].kind, SourceKind::Spreadsheet);
            assert!(cfg.sources[0].timezone.is_empty());
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let cfg = ConduitConfig::load(Some("does-not-exist.toml")).expect("load");
            assert_eq!(cfg.scheduler.max_attempts, DEFAULT_MAX_ATTEMPTS);
            assert!(cfg.sources.is_empty());
            Ok(())
        });
    }
}
