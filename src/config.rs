use anyhow::{anyhow, Context, Result};
use dirs::{config_dir, data_dir};
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for headwatch
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Repository being watched
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Trigger channel settings
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Remote manifest service
    #[serde(default)]
    pub manifest: ManifestConfig,

    /// Scan pipeline invocation
    #[serde(default)]
    pub scan: ScanConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Transition journal
    #[serde(default)]
    pub journal: JournalConfig,
}

/// Repository location
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RepositoryConfig {
    /// Working tree root (the directory containing `.git`)
    #[serde(default = "default_root")]
    pub root: String,
}

/// Trigger channel configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatcherConfig {
    /// Poll interval, e.g. "3s", "500ms"
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Subscribe to native file-change notifications
    #[serde(default = "default_true")]
    pub push_enabled: bool,

    /// Re-check once after a reconciliation that discarded triggers
    #[serde(default = "default_true")]
    pub catch_up: bool,
}

/// Remote manifest service configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ManifestConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Service base URL, e.g. "https://index.example.com/api"
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub org_id: String,

    #[serde(default)]
    pub project_id: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

/// Scan pipeline configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ScanConfig {
    /// Program and arguments; empty means no pipeline is configured
    #[serde(default)]
    pub command: Vec<String>,

    /// Extra environment passed to the pipeline process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "json"
}

/// Transition journal configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JournalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SQLite database location
    #[serde(default = "default_journal_path")]
    pub path: String,

    /// Days of history kept when pruning
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

// Default value functions
fn default_root() -> String {
    ".".to_string()
}
fn default_true() -> bool {
    true
}
fn default_poll_interval() -> String {
    "3s".to_string()
}
fn default_token_env() -> String {
    "HEADWATCH_TOKEN".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}
fn default_retention_days() -> u32 {
    30
}
fn default_journal_path() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/headwatch/events.db", data_home)
    } else if let Some(dir) = data_dir() {
        dir.join("headwatch")
            .join("events.db")
            .to_string_lossy()
            .into_owned()
    } else {
        "/tmp/headwatch-events.db".to_string()
    }
}

// Default implementations
impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            push_enabled: default_true(),
            catch_up: default_true(),
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            org_id: String::new(),
            project_id: String::new(),
            token_env: default_token_env(),
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

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_journal_path(),
            retention_days: default_retention_days(),
        }
    }
}

/// Parse duration strings like "500ms", "3s", "5m", "1h" or bare seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let duration = if let Some(value) = duration_str.strip_suffix("ms") {
        value
            .parse::<u64>()
            .map(Duration::from_millis)
            .context("Invalid milliseconds value")?
    } else if let Some(value) = duration_str.strip_suffix('s') {
        value
            .parse::<u64>()
            .map(Duration::from_secs)
            .context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value
            .parse::<u64>()
            .map(|v| Duration::from_secs(v * 60))
            .context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value
            .parse::<u64>()
            .map(|v| Duration::from_secs(v * 3600))
            .context("Invalid hours value")?
    } else {
        duration_str
            .parse::<u64>()
            .map(Duration::from_secs)
            .context("Invalid duration format. Use format like '500ms', '3s', '1m'")?
    };

    if duration.is_zero() {
        return Err(anyhow!("Duration must be greater than zero"));
    }

    Ok(duration)
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!("No configuration at {:?}, using defaults", config_path);
            let mut config = Self::default();
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("headwatch").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.repository.root = shellexpand::full(&self.repository.root)
            .context("Failed to expand repository root")?
            .into_owned();

        self.journal.path = shellexpand::full(&self.journal.path)
            .context("Failed to expand journal path")?
            .into_owned();

        Ok(())
    }

    /// Absolute, normalised repository root
    pub fn repository_root(&self) -> Result<PathBuf> {
        let root = PathBuf::from(&self.repository.root);
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .context("Failed to resolve current directory")?
                .join(root)
        };
        Ok(root.clean())
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.watcher.poll_interval).context("Invalid watcher.poll_interval")
    }

    /// Manifest bearer token read from the configured environment variable
    pub fn manifest_token(&self) -> Option<String> {
        std::env::var(&self.manifest.token_env)
            .ok()
            .filter(|token| !token.is_empty())
    }

    /// Check the combination of settings before starting a watcher
    pub fn validate(&self) -> Result<()> {
        self.poll_interval()?;

        if self.manifest.enabled {
            if self.manifest.base_url.is_empty() {
                return Err(anyhow!("manifest.base_url is required when manifest is enabled"));
            }
            if self.manifest.org_id.is_empty() || self.manifest.project_id.is_empty() {
                return Err(anyhow!(
                    "manifest.org_id and manifest.project_id are required when manifest is enabled"
                ));
            }
        }

        Ok(())
    }
}
