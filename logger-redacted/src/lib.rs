//! PHI-aware logging for the clinical rounding list
//!
//! Patient visits carry names, MRNs and dates of birth, and remote errors
//! often echo the query that produced them. Everything that may carry such
//! text is logged through the `redacted_*` macros, and identifiers that are
//! needed for correlation are logged as [`hash_identifier`] output.
//!
//! # Example
//!
//! ```rust,no_run
//! use logger_redacted::{init_tracing, LoggerConfig, hash_identifier};
//!
//! init_tracing(&LoggerConfig::default()).unwrap();
//! tracing::info!(mrn_hash = %hash_identifier("MRN123"), "visit saved");
//! logger_redacted::redacted_warn!("remote rejected filter MRN eq '{}'", "MRN123");
//! ```

pub mod redactor;
pub mod macros;
pub mod config;

pub use redactor::*;
pub use config::*;

use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static REDACTION_ENABLED: AtomicBool = AtomicBool::new(true);

lazy_static::lazy_static! {
    static ref DEFAULT_REDACTOR: PiiRedactor = PiiRedactor::default();
}

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Tracing subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Redact PHI from a free-text message using the default patterns.
///
/// Returns the input unchanged when redaction was disabled through
/// [`init_tracing`].
pub fn redact(text: &str) -> String {
    if REDACTION_ENABLED.load(Ordering::Relaxed) {
        DEFAULT_REDACTOR.redact(text)
    } else {
        text.to_string()
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.log_level` when set.
///
/// # Errors
///
/// Fails when the level directive does not parse or a global subscriber is
/// already installed.
pub fn init_tracing(config: &LoggerConfig) -> Result<(), LoggerError> {
    REDACTION_ENABLED.store(config.redaction_enabled, Ordering::Relaxed);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| LoggerError::InvalidFilter {
            filter: config.log_level.clone(),
            reason: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().with_target(config.with_target).with_ansi(false).json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(config.with_target))
            .try_init(),
    };

    result.map_err(|e| LoggerError::AlreadyInitialized(e.to_string()))
}
