// Logger configuration
use serde::{Deserialize, Serialize};

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one line per event
    #[default]
    Pretty,
    /// Structured JSON, one object per event
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Redact PHI from free-text messages routed through the redacted macros
    #[serde(default = "default_true")]
    pub redaction_enabled: bool,
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Include the event target (module path) in output
    #[serde(default)]
    pub with_target: bool,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            redaction_enabled: true,
            log_level: default_log_level(),
            format: LogFormat::Pretty,
            with_target: false,
        }
    }
}

impl LoggerConfig {
    /// Same configuration with the level raised to `debug`.
    pub fn verbose(mut self) -> Self {
        self.log_level = "debug".to_string();
        self
    }
}
