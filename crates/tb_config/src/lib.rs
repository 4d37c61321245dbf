//! `tb_config` - Campaign configuration for throttlebench
//!
//! This crate provides:
//! - TOML configuration parsing with per-section defaults
//! - `TB_*` environment variable overrides
//! - Path expansion (`~/` to home directory)
//! - Auto-discovery from standard config paths
//! - Degradation level parsing
//!
//! A [`CampaignConfig`] is built once at startup and handed to every component
//! by reference. Nothing mutates it after construction.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize TOML: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid degradation level '{entry}': {reason}")]
    InvalidLevel { entry: String, reason: String },

    #[error("No hosts configured")]
    NoHosts,
}

/// Percentage of compute capacity withheld from every workload unit during
/// one benchmark pass. `0` is the unconstrained baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DegradationLevel(u8);

impl DegradationLevel {
    pub const BASELINE: Self = Self(0);
    pub const MAX_PERCENT: u8 = 100;

    /// Create a level, rejecting percentages above 100.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidLevel`] when `percent > 100`.
    pub fn new(percent: u8) -> Result<Self, ConfigError> {
        if percent > Self::MAX_PERCENT {
            return Err(ConfigError::InvalidLevel {
                entry: percent.to_string(),
                reason: "must be between 0 and 100".to_string(),
            });
        }
        Ok(Self(percent))
    }

    #[must_use]
    pub fn percent(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn is_baseline(self) -> bool {
        self.0 == 0
    }

    /// Share of capacity left available, in percent
    #[must_use]
    pub fn availability(self) -> u8 {
        Self::MAX_PERCENT.saturating_sub(self.0)
    }

    /// Name of the per-level run directory (`cpu_<pct>`)
    #[must_use]
    pub fn dir_name(self) -> String {
        format!("cpu_{}", self.0)
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

impl FromStr for DegradationLevel {
    type Err = ConfigError;

    /// Parses entries such as `25`, `25%`, ` +25 `. Percent signs, whitespace
    /// and sign characters are stripped before numeric parsing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = normalize_level_entry(s);
        if cleaned.is_empty() {
            return Err(ConfigError::InvalidLevel {
                entry: s.to_string(),
                reason: "empty entry".to_string(),
            });
        }
        let value: u16 = cleaned.parse().map_err(|e| ConfigError::InvalidLevel {
            entry: s.to_string(),
            reason: format!("{e}"),
        })?;
        let percent = u8::try_from(value)
            .ok()
            .filter(|p| *p <= Self::MAX_PERCENT)
            .ok_or_else(|| ConfigError::InvalidLevel {
                entry: s.to_string(),
                reason: "must be between 0 and 100".to_string(),
            })?;
        Ok(Self(percent))
    }
}

fn normalize_level_entry(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '%' | '+' | '-'))
        .collect()
}

/// Parse a comma-separated degradation list such as `"0, 25%, 50"`.
///
/// Entries that are empty after normalization are skipped. Order is kept.
///
/// # Errors
/// Returns [`ConfigError::InvalidLevel`] for the first entry that is not a
/// percentage between 0 and 100.
pub fn parse_levels(csv: &str) -> Result<Vec<DegradationLevel>, ConfigError> {
    csv.split(',')
        .filter(|entry| !normalize_level_entry(entry).is_empty())
        .map(str::parse)
        .collect()
}

/// Host-key verification policy handed to the ssh client.
///
/// `AcceptNew` is the default for lab automation: unknown hosts are trusted on
/// first contact, changed keys are still rejected. `Insecure` disables
/// verification entirely and must be chosen explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    Strict,
    #[default]
    AcceptNew,
    Insecure,
}

impl HostKeyPolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::AcceptNew => "accept-new",
            Self::Insecure => "insecure",
        }
    }
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostKeyPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" | "yes" => Ok(Self::Strict),
            "accept-new" | "accept_new" => Ok(Self::AcceptNew),
            "insecure" | "no" | "off" => Ok(Self::Insecure),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown host key policy '{other}'. Must be one of: strict, accept-new, insecure"
            ))),
        }
    }
}

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CampaignConfig {
    /// Global settings
    pub global: GlobalConfig,

    /// Remote connection policy
    pub connection: ConnectionConfig,

    /// Cluster layout and bring-up settings
    pub cluster: ClusterConfig,

    /// Keyspace and table created on bring-up
    pub schema: SchemaConfig,

    /// Load generator settings
    pub workload: WorkloadConfig,

    /// Degradation campaign settings
    pub campaign: CampaignSettings,

    /// External summarizer settings
    pub summarizer: SummarizerConfig,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Root directory for per-level run directories and the aggregate table
    pub results_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Enable JSON logging
    pub json_logs: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Remote connection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Default SSH user for hosts given without `user@`
    pub user: String,

    /// Default SSH port
    pub port: u16,

    /// SSH private key (optional)
    pub key_path: Option<PathBuf>,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Per-command timeout in seconds
    pub command_timeout_secs: u64,

    /// Host-key verification policy
    pub host_key_policy: HostKeyPolicy,

    /// Maximum hosts contacted concurrently within one step
    pub max_concurrent: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            port: 22,
            key_path: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 120,
            host_key_policy: HostKeyPolicy::default(),
            max_concurrent: 8,
        }
    }
}

/// Cluster layout and bring-up settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Hosts in `host`, `user@host` or `user@host:port` form. The first host
    /// is the seed.
    pub hosts: Vec<String>,

    /// Workload unit (container) name prefix, suffixed with the 1-based index
    pub unit_prefix: String,

    /// Data volume name prefix, suffixed with the 1-based index
    pub volume_prefix: String,

    /// Database container image
    pub image: String,

    /// Cluster name passed to every node
    pub cluster_name: String,

    /// Readiness poll attempts per node
    pub ready_attempts: u32,

    /// Seconds between readiness polls
    pub ready_interval_secs: u64,

    /// Skip keyspace/table creation
    pub skip_schema: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            unit_prefix: "cass-node".to_string(),
            volume_prefix: "cass-data".to_string(),
            image: "cassandra:4.1".to_string(),
            cluster_name: "tb-cluster".to_string(),
            ready_attempts: 60,
            ready_interval_secs: 10,
            skip_schema: false,
        }
    }
}

/// Keyspace and table created on bring-up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub keyspace: String,
    pub table: String,
    pub replication_factor: u32,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            keyspace: "ycsb".to_string(),
            table: "usertable".to_string(),
            replication_factor: 3,
        }
    }
}

/// Load generator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Load generator binary
    pub binary: String,

    /// Workload kind (binding name), e.g. `cassandra-cql`
    pub kind: String,

    /// CQL port on every node
    pub port: u16,

    /// Client thread count
    pub threads: u32,

    /// Records loaded and addressed by the workload
    pub record_count: u64,

    /// Operation cap per run
    pub operation_count: u64,

    /// Run duration in seconds
    pub duration_secs: u64,

    pub read_proportion: f64,
    pub update_proportion: f64,
    pub insert_proportion: f64,
    pub scan_proportion: f64,

    /// Prefix for result files; the level is appended
    pub output_prefix: String,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            binary: "ycsb".to_string(),
            kind: "cassandra-cql".to_string(),
            port: 9042,
            threads: 16,
            record_count: 1_000_000,
            operation_count: 100_000_000,
            duration_secs: 180,
            read_proportion: 0.5,
            update_proportion: 0.5,
            insert_proportion: 0.0,
            scan_proportion: 0.0,
            output_prefix: "ycsb".to_string(),
        }
    }
}

/// Degradation campaign settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignSettings {
    /// Levels in execution order
    pub levels: Vec<DegradationLevel>,

    /// Seconds to wait after applying a constraint before measuring
    pub settle_secs: u64,

    /// Smallest CPU quota ever applied, in CPUs
    pub cpu_floor: f64,

    /// Optional overall deadline for the level loop, in seconds
    pub deadline_secs: Option<u64>,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            levels: [0, 25, 50, 75].into_iter().map(DegradationLevel).collect(),
            settle_secs: 30,
            cpu_floor: 0.1,
            deadline_secs: None,
        }
    }
}

/// External summarizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub binary: String,
    pub warmup_windows: u32,
    pub timeout_secs: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            binary: "ycsb-sumstat".to_string(),
            warmup_windows: 2,
            timeout_secs: 300,
        }
    }
}

/// Expand tilde in path to home directory
#[must_use]
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    path.to_path_buf()
}

fn is_cql_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl CampaignConfig {
    /// Standard config file paths, in order of precedence
    #[must_use]
    pub fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("tb.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("tb").join("tb.toml"));
        }

        paths.push(PathBuf::from("/etc/tb/tb.toml"));

        paths
    }

    /// Discover and load configuration from standard paths.
    ///
    /// Returns defaults if no config file is found.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if a discovered config file cannot be loaded.
    pub fn discover() -> Result<Self, ConfigError> {
        for path in Self::config_paths() {
            if path.exists() {
                info!(path = %path.display(), "Loading config from");
                return Self::load(&path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Discover config and apply environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if discovery, an override, or validation fails.
    pub fn discover_with_env() -> Result<Self, ConfigError> {
        let mut config = Self::discover()?;
        config.apply_env_overrides()?;
        config.expand_all_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: CampaignConfig = toml::from_str(&content)?;
        config.expand_all_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        config.expand_all_paths();
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    /// Returns [`ConfigError::SerializeError`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Expand all paths in configuration (resolve `~/` to home directory)
    pub fn expand_all_paths(&mut self) {
        self.global.results_dir = expand_path(&self.global.results_dir);
        if let Some(ref mut key_path) = self.connection.key_path {
            *key_path = expand_path(key_path);
        }
    }

    /// Apply `TB_*` environment variable overrides
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when an override value cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when an override value cannot be parsed.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn num<T: FromStr>(key: &str, val: &str) -> Result<T, ConfigError> {
            val.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("{key} must be numeric, got '{val}'"))
            })
        }
        fn flag(key: &str, val: &str) -> Result<bool, ConfigError> {
            parse_bool(val).ok_or_else(|| {
                ConfigError::ValidationError(format!("{key} must be a boolean, got '{val}'"))
            })
        }

        if let Some(val) = lookup("TB_HOSTS") {
            self.cluster.hosts = val
                .split([',', ' '])
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(val) = lookup("TB_LEVELS") {
            self.campaign.levels = parse_levels(&val)?;
        }
        if let Some(val) = lookup("TB_SSH_USER") {
            self.connection.user = val;
        }
        if let Some(val) = lookup("TB_SSH_PORT") {
            self.connection.port = num("TB_SSH_PORT", &val)?;
        }
        if let Some(val) = lookup("TB_SSH_KEY") {
            self.connection.key_path = Some(expand_path(&PathBuf::from(val)));
        }
        if let Some(val) = lookup("TB_CONNECT_TIMEOUT") {
            self.connection.connect_timeout_secs = num("TB_CONNECT_TIMEOUT", &val)?;
        }
        if let Some(val) = lookup("TB_HOST_KEY_POLICY") {
            self.connection.host_key_policy = val.parse()?;
        }
        if let Some(val) = lookup("TB_UNIT_PREFIX") {
            self.cluster.unit_prefix = val;
        }
        if let Some(val) = lookup("TB_VOLUME_PREFIX") {
            self.cluster.volume_prefix = val;
        }
        if let Some(val) = lookup("TB_READY_ATTEMPTS") {
            self.cluster.ready_attempts = num("TB_READY_ATTEMPTS", &val)?;
        }
        if let Some(val) = lookup("TB_READY_INTERVAL") {
            self.cluster.ready_interval_secs = num("TB_READY_INTERVAL", &val)?;
        }
        if let Some(val) = lookup("TB_SKIP_SCHEMA") {
            self.cluster.skip_schema = flag("TB_SKIP_SCHEMA", &val)?;
        }
        if let Some(val) = lookup("TB_KEYSPACE") {
            self.schema.keyspace = val;
        }
        if let Some(val) = lookup("TB_TABLE") {
            self.schema.table = val;
        }
        if let Some(val) = lookup("TB_REPLICATION_FACTOR") {
            self.schema.replication_factor = num("TB_REPLICATION_FACTOR", &val)?;
        }
        if let Some(val) = lookup("TB_THREADS") {
            self.workload.threads = num("TB_THREADS", &val)?;
        }
        if let Some(val) = lookup("TB_RECORD_COUNT") {
            self.workload.record_count = num("TB_RECORD_COUNT", &val)?;
        }
        if let Some(val) = lookup("TB_OPERATION_COUNT") {
            self.workload.operation_count = num("TB_OPERATION_COUNT", &val)?;
        }
        if let Some(val) = lookup("TB_DURATION") {
            self.workload.duration_secs = num("TB_DURATION", &val)?;
        }
        if let Some(val) = lookup("TB_SETTLE_SECS") {
            self.campaign.settle_secs = num("TB_SETTLE_SECS", &val)?;
        }
        if let Some(val) = lookup("TB_RESULTS_DIR") {
            self.global.results_dir = expand_path(&PathBuf::from(val));
        }
        if let Some(val) = lookup("TB_LOG_LEVEL") {
            self.global.log_level = val;
        }
        Ok(())
    }

    /// Validate structural settings. Host count is checked separately by
    /// [`Self::validate_for_campaign`] and [`Self::validate_for_bringup`].
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when validation rules are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.global.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.global.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.connection.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connection.connect_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.connection.command_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connection.command_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.connection.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "connection.max_concurrent must be > 0".to_string(),
            ));
        }

        if self.cluster.ready_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "cluster.ready_attempts must be > 0".to_string(),
            ));
        }
        if self.cluster.unit_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "cluster.unit_prefix must not be empty".to_string(),
            ));
        }
        if self.schema.replication_factor == 0 {
            return Err(ConfigError::ValidationError(
                "schema.replication_factor must be > 0".to_string(),
            ));
        }
        for (key, ident) in [("schema.keyspace", &self.schema.keyspace), ("schema.table", &self.schema.table)] {
            if !is_cql_identifier(ident) {
                return Err(ConfigError::ValidationError(format!(
                    "{key} '{ident}' must be letters, digits and underscores"
                )));
            }
        }

        if self.workload.threads == 0 {
            return Err(ConfigError::ValidationError(
                "workload.threads must be > 0".to_string(),
            ));
        }
        let proportions = [
            self.workload.read_proportion,
            self.workload.update_proportion,
            self.workload.insert_proportion,
            self.workload.scan_proportion,
        ];
        if proportions.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(ConfigError::ValidationError(
                "workload proportions must be between 0.0 and 1.0".to_string(),
            ));
        }
        if proportions.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::ValidationError(
                "workload proportions must not all be zero".to_string(),
            ));
        }

        if self.campaign.levels.is_empty() {
            return Err(ConfigError::ValidationError(
                "campaign.levels must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for level in &self.campaign.levels {
            if level.percent() > DegradationLevel::MAX_PERCENT {
                return Err(ConfigError::InvalidLevel {
                    entry: level.percent().to_string(),
                    reason: "must be between 0 and 100".to_string(),
                });
            }
            if !seen.insert(*level) {
                return Err(ConfigError::ValidationError(format!(
                    "campaign.levels lists {level} more than once"
                )));
            }
        }
        if !self.campaign.cpu_floor.is_finite() || self.campaign.cpu_floor <= 0.0 {
            return Err(ConfigError::ValidationError(
                "campaign.cpu_floor must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate for a benchmark campaign: at least one host.
    ///
    /// # Errors
    /// Returns [`ConfigError::NoHosts`] or any structural validation error.
    pub fn validate_for_campaign(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.cluster.hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        Ok(())
    }

    /// Validate for cluster bring-up: exactly three hosts.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when the host count is not three.
    pub fn validate_for_bringup(&self) -> Result<(), ConfigError> {
        self.validate_for_campaign()?;
        if self.cluster.hosts.len() != 3 {
            return Err(ConfigError::ValidationError(format!(
                "cluster bring-up needs exactly 3 hosts, got {}",
                self.cluster.hosts.len()
            )));
        }
        Ok(())
    }

    /// Workload unit name for the host at `index` (0-based)
    #[must_use]
    pub fn unit_name(&self, index: usize) -> String {
        format!("{}{}", self.cluster.unit_prefix, index + 1)
    }

    /// Volume name for the host at `index` (0-based)
    #[must_use]
    pub fn volume_name(&self, index: usize) -> String {
        format!("{}{}", self.cluster.volume_prefix, index + 1)
    }

    /// Run directory for one degradation level
    #[must_use]
    pub fn run_dir(&self, level: DegradationLevel) -> PathBuf {
        self.global.results_dir.join(level.dir_name())
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.command_timeout_secs)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.campaign.settle_secs)
    }

    #[must_use]
    pub fn ready_interval(&self) -> Duration {
        Duration::from_secs(self.cluster.ready_interval_secs)
    }

    #[must_use]
    pub fn campaign_deadline(&self) -> Option<Duration> {
        self.campaign.deadline_secs.map(Duration::from_secs)
    }

    /// Upper bound for one load-generator run: the workload duration plus a
    /// fixed grace period for startup and shutdown.
    #[must_use]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.workload.duration_secs.saturating_add(300))
    }

    #[must_use]
    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.summarizer.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn levels(pcts: &[u8]) -> Vec<DegradationLevel> {
        pcts.iter().map(|p| DegradationLevel::new(*p).unwrap()).collect()
    }

    #[test]
    fn test_default_config() {
        let config = CampaignConfig::default();
        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.campaign.levels, levels(&[0, 25, 50, 75]));
        assert_eq!(config.connection.host_key_policy, HostKeyPolicy::AcceptNew);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_levels_strips_decorations() {
        let parsed = parse_levels(" 0, 25% ,+50, -75 ").unwrap();
        assert_eq!(parsed, levels(&[0, 25, 50, 75]));
    }

    #[test]
    fn test_parse_levels_keeps_order_and_skips_empty() {
        let parsed = parse_levels("50,,0, %, 25").unwrap();
        assert_eq!(parsed, levels(&[50, 0, 25]));
    }

    #[test]
    fn test_parse_levels_rejects_garbage() {
        let err = parse_levels("0,abc").unwrap_err();
        assert!(err.to_string().contains("abc"));

        let err = parse_levels("150").unwrap_err();
        assert!(err.to_string().contains("between 0 and 100"));
    }

    #[test]
    fn test_level_helpers() {
        let level: DegradationLevel = "40%".parse().unwrap();
        assert_eq!(level.percent(), 40);
        assert_eq!(level.availability(), 60);
        assert_eq!(level.dir_name(), "cpu_40");
        assert_eq!(level.to_string(), "40%");
        assert!(!level.is_baseline());
        assert!(DegradationLevel::BASELINE.is_baseline());
        assert!(DegradationLevel::new(101).is_err());
    }

    #[test]
    fn test_host_key_policy_parse() {
        assert_eq!("strict".parse::<HostKeyPolicy>().unwrap(), HostKeyPolicy::Strict);
        assert_eq!("no".parse::<HostKeyPolicy>().unwrap(), HostKeyPolicy::Insecure);
        assert_eq!(
            "Accept-New".parse::<HostKeyPolicy>().unwrap(),
            HostKeyPolicy::AcceptNew
        );
        assert!("sometimes".parse::<HostKeyPolicy>().is_err());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TB_HOSTS", "10.0.0.1, 10.0.0.2,admin@10.0.0.3:2222"),
            ("TB_LEVELS", "0,50%"),
            ("TB_SKIP_SCHEMA", "yes"),
            ("TB_THREADS", "64"),
            ("TB_HOST_KEY_POLICY", "strict"),
        ]);
        let mut config = CampaignConfig::default();
        config
            .apply_overrides_from(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(
            config.cluster.hosts,
            vec!["10.0.0.1", "10.0.0.2", "admin@10.0.0.3:2222"]
        );
        assert_eq!(config.campaign.levels, levels(&[0, 50]));
        assert!(config.cluster.skip_schema);
        assert_eq!(config.workload.threads, 64);
        assert_eq!(config.connection.host_key_policy, HostKeyPolicy::Strict);
    }

    #[test]
    fn test_overrides_reject_bad_numbers() {
        let mut config = CampaignConfig::default();
        let result = config.apply_overrides_from(|k| {
            (k == "TB_THREADS").then(|| "many".to_string())
        });
        assert!(result.unwrap_err().to_string().contains("TB_THREADS"));
    }

    #[test]
    fn test_validation_duplicate_levels() {
        let mut config = CampaignConfig::default();
        config.campaign.levels = levels(&[0, 50, 0]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validation_floor_and_threads() {
        let mut config = CampaignConfig::default();
        config.campaign.cpu_floor = 0.0;
        assert!(config.validate().unwrap_err().to_string().contains("cpu_floor"));

        let mut config = CampaignConfig::default();
        config.workload.threads = 0;
        assert!(config.validate().unwrap_err().to_string().contains("threads"));
    }

    #[test]
    fn test_validation_log_level() {
        let mut config = CampaignConfig::default();
        config.global.log_level = "chatty".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("log_level"));
    }

    #[test]
    fn test_validation_schema_identifiers() {
        let mut config = CampaignConfig::default();
        config.schema.table = "user table; DROP".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("schema.table"));

        config.schema.table = "usertable_2".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_host_counts() {
        let mut config = CampaignConfig::default();
        assert!(matches!(
            config.validate_for_campaign(),
            Err(ConfigError::NoHosts)
        ));

        config.cluster.hosts = vec!["a".into()];
        assert!(config.validate_for_campaign().is_ok());
        assert!(config.validate_for_bringup().is_err());

        config.cluster.hosts = vec!["a".into(), "b".into(), "c".into()];
        assert!(config.validate_for_bringup().is_ok());
    }

    #[test]
    fn test_names_and_dirs() {
        let mut config = CampaignConfig::default();
        config.global.results_dir = PathBuf::from("/tmp/out");
        assert_eq!(config.unit_name(0), "cass-node1");
        assert_eq!(config.volume_name(2), "cass-data3");
        assert_eq!(
            config.run_dir(DegradationLevel::new(25).unwrap()),
            PathBuf::from("/tmp/out/cpu_25")
        );
    }

    #[test]
    fn test_run_timeout_saturates() {
        let mut config = CampaignConfig::default();
        assert_eq!(config.run_timeout(), Duration::from_secs(480));
        config.workload.duration_secs = u64::MAX;
        assert_eq!(config.run_timeout(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_path_expansion_tilde() {
        let expanded = expand_path(&PathBuf::from("~/keys/id"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("keys/id"));
        }
        assert_eq!(
            expand_path(&PathBuf::from("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }

    #[test]
    fn test_load_from_toml() {
        let toml_content = r#"
[global]
results_dir = "/tmp/tb-results"
log_level = "debug"

[connection]
user = "bench"
host_key_policy = "insecure"

[cluster]
hosts = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
skip_schema = true

[campaign]
levels = [50, 0, 25]
settle_secs = 5
"#;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = CampaignConfig::load(file.path()).unwrap();
        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.connection.user, "bench");
        assert_eq!(config.connection.host_key_policy, HostKeyPolicy::Insecure);
        assert_eq!(config.cluster.hosts.len(), 3);
        assert!(config.cluster.skip_schema);
        assert_eq!(config.campaign.levels, levels(&[50, 0, 25]));
        assert_eq!(config.settle_delay(), Duration::from_secs(5));
        // untouched sections keep defaults
        assert_eq!(config.schema.keyspace, "ycsb");
    }

    #[test]
    fn test_load_rejects_out_of_range_level() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[campaign]\nlevels = [0, 120]\n").unwrap();
        assert!(matches!(
            CampaignConfig::load(file.path()),
            Err(ConfigError::InvalidLevel { .. })
        ));
    }

    #[test]
    fn test_toml_round_trip_keeps_levels() {
        let mut config = CampaignConfig::default();
        config.cluster.hosts = vec!["a".into(), "b".into()];
        let text = config.to_toml().unwrap();
        let back: CampaignConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.campaign.levels, config.campaign.levels);
        assert_eq!(back.cluster.hosts, config.cluster.hosts);
    }

    #[test]
    fn test_config_paths() {
        let paths = CampaignConfig::config_paths();
        assert_eq!(paths[0], PathBuf::from("tb.toml"));
    }

    proptest! {
        #[test]
        fn test_level_parse_ignores_decorations(pct in 0u8..=100, pad in " {0,3}", pct_sign in proptest::bool::ANY) {
            let entry = format!("{pad}{pct}{}{pad}", if pct_sign { "%" } else { "" });
            let level: DegradationLevel = entry.parse().unwrap();
            prop_assert_eq!(level.percent(), pct);
        }
    }
}
