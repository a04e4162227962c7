use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TRIAGE_DIR_NAME: &str = ".triage";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_DATABASE_FILE: &str = "triage.sqlite";
pub const DEFAULT_RULES_REFRESH_INTERVAL_SECS: u64 = 120;
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_JOIN_STATS_HOURS: u32 = 24;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TriageConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub join_stats: JoinStatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

/// Rewrites test names before test-name clustering so related tests
/// (e.g. instances of one parameterized test) share a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestNameRuleConfig {
    pub name: String,
    /// Regular expression over the test ID. Named groups may be referenced
    /// from `like_template`.
    pub pattern: String,
    /// LIKE expression template; `${group}` substitutes a capture, `$$` a
    /// literal `$`.
    pub like_template: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub test_name_rules: Vec<TestNameRuleConfig>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            test_name_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinStatsConfig {
    #[serde(default = "default_join_stats_hours")]
    pub hours: u32,
}

impl Default for JoinStatsConfig {
    fn default() -> Self {
        Self {
            hours: default_join_stats_hours(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Human,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn triage_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(TRIAGE_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    triage_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn database_path(workspace_root: impl AsRef<Path>, config: &TriageConfig) -> PathBuf {
    triage_dir(workspace_root).join(&config.store.database)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<TriageConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(TriageConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: TriageConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<TriageConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(triage_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = TriageConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Non-fatal problems with a loaded config. Values that would break the
/// pipeline are already replaced with defaults by normalization.
pub fn validate_config(config: &TriageConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.rules.refresh_interval_secs > 3600 {
        warnings.push(ConfigWarning {
            code: "rules_refresh_slow",
            message: format!(
                "[rules].refresh_interval_secs={} means rule edits may take over an hour to apply",
                config.rules.refresh_interval_secs
            ),
        });
    }

    let mut seen = std::collections::BTreeSet::new();
    for rule in &config.clustering.test_name_rules {
        if !seen.insert(rule.name.as_str()) {
            warnings.push(ConfigWarning {
                code: "duplicate_test_name_rule",
                message: format!("test name rule '{}' is defined more than once", rule.name),
            });
        }
        if rule.pattern.trim().is_empty() {
            warnings.push(ConfigWarning {
                code: "empty_test_name_pattern",
                message: format!("test name rule '{}' has an empty pattern", rule.name),
            });
        }
    }

    warnings
}

fn default_database() -> String {
    DEFAULT_DATABASE_FILE.to_owned()
}

fn default_refresh_interval_secs() -> u64 {
    DEFAULT_RULES_REFRESH_INTERVAL_SECS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_join_stats_hours() -> u32 {
    DEFAULT_JOIN_STATS_HOURS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_owned()
}

fn normalize_config(mut config: TriageConfig) -> TriageConfig {
    let database = config.store.database.trim();
    config.store.database = if database.is_empty() {
        default_database()
    } else {
        database.to_owned()
    };

    if config.rules.refresh_interval_secs == 0 {
        config.rules.refresh_interval_secs = default_refresh_interval_secs();
    }
    if config.clustering.chunk_size == 0 {
        config.clustering.chunk_size = default_chunk_size();
    }
    if config.join_stats.hours == 0 {
        config.join_stats.hours = default_join_stats_hours();
    }

    let level = config.logging.level.trim();
    config.logging.level = if level.is_empty() {
        default_log_level()
    } else {
        level.to_owned()
    };

    config
}
