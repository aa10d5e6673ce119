use logger_redacted::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RoundingError, RoundingResult};
use crate::store::{ListKind, RetryPolicy};

/// Environment variable prefix, e.g. `ROUNDING__SYNC__POLL_INTERVAL_SECS=30`
pub const ENV_PREFIX: &str = "ROUNDING";

/// Top-level configuration for the rounding engine and CLI
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoundingConfig {
    #[serde(default)]
    pub graph: GraphConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub logging: LoggerConfig,
}

/// Microsoft Graph connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,

    /// SharePoint site hosting the lists
    #[serde(default)]
    pub site_id: String,

    #[serde(default)]
    pub lists: ListIds,

    /// Per-request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Remote list identifiers, one per [`ListKind`]
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ListIds {
    #[serde(default)]
    pub patients: String,
    #[serde(default)]
    pub on_call: String,
    #[serde(default)]
    pub settings: String,
    #[serde(default)]
    pub audit: String,
}

impl ListIds {
    pub fn get(&self, list: ListKind) -> &str {
        match list {
            ListKind::Patients => &self.patients,
            ListKind::OnCall => &self.on_call,
            ListKind::Settings => &self.settings,
            ListKind::Audit => &self.audit,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Poll interval while connected, in seconds (default: 15)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds; doubles per attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    /// OneDrive folder receiving exported workbooks
    #[serde(default = "default_export_folder")]
    pub folder: String,

    /// File name of the continuously overwritten copy
    #[serde(default = "default_latest_name")]
    pub latest_name: String,
}

// Default value functions

fn default_graph_base_url() -> String { "https://graph.microsoft.com/v1.0".to_string() }
fn default_request_timeout() -> u64 { 30 }
fn default_poll_interval() -> u64 { 15 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_cache_path() -> PathBuf { PathBuf::from("rounding-cache.db") }
fn default_export_folder() -> String { "/Clinical Rounding".to_string() }
fn default_latest_name() -> String { "Rounding List - Latest.xlsx".to_string() }

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: default_graph_base_url(),
            site_id: String::new(),
            lists: ListIds::default(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { poll_interval_secs: default_poll_interval() }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { path: default_cache_path() }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            folder: default_export_folder(),
            latest_name: default_latest_name(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }
}

impl GraphConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RoundingConfig {
    /// Load from an optional file, then `ROUNDING__*` environment overrides.
    ///
    /// # Errors
    ///
    /// `Config` when the file is unreadable or a value has the wrong type.
    pub fn load(path: Option<&Path>) -> RoundingResult<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                builder = builder.add_source(config::File::with_name("rounding").required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RoundingConfig = builder.build()?.try_deserialize()?;
        tracing::debug!(
            site = %config.graph.site_id,
            poll_secs = config.sync.poll_interval_secs,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// # Errors
    ///
    /// `Config` describing the first invalid value.
    pub fn validate(&self, require_graph: bool) -> RoundingResult<()> {
        if self.sync.poll_interval_secs == 0 {
            return Err(RoundingError::Config("sync.poll_interval_secs must be greater than zero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(RoundingError::Config("retry.max_attempts must be at least 1".into()));
        }
        if require_graph {
            if self.graph.site_id.trim().is_empty() {
                return Err(RoundingError::Config("graph.site_id is required".into()));
            }
            for list in [ListKind::Patients, ListKind::OnCall, ListKind::Settings, ListKind::Audit] {
                if self.graph.lists.get(list).trim().is_empty() {
                    return Err(RoundingError::Config(format!(
                        "graph.lists.{} is required",
                        list.as_str()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RoundingConfig::default();
        assert_eq!(config.sync.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.export.folder, "/Clinical Rounding");
        assert_eq!(config.export.latest_name, "Rounding List - Latest.xlsx");
        assert!(config.validate(false).is_ok());
        assert!(config.validate(true).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rounding.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[graph]
site_id = "site-1"

[graph.lists]
patients = "p"
on_call = "o"
settings = "s"
audit = "a"

[sync]
poll_interval_secs = 30
"#
        )
        .unwrap();

        let config = RoundingConfig::load(Some(&path)).unwrap();
        assert_eq!(config.graph.site_id, "site-1");
        assert_eq!(config.graph.lists.get(ListKind::OnCall), "o");
        assert_eq!(config.sync.poll_interval_secs, 30);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = RoundingConfig::default();
        config.sync.poll_interval_secs = 0;
        assert!(matches!(config.validate(false), Err(RoundingError::Config(_))));
    }
}
