//! Logging setup for the viewer.
//!
//! Installs a global `tracing` subscriber writing to stderr. The `log` macros
//! used throughout the crate are bridged into it, so `CASESCOPE_LOG` controls
//! both.

use std::sync::OnceLock;

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{fmt, EnvFilter};

const FILTER_ENV: &str = "CASESCOPE_LOG";
const DEFAULT_FILTER: &str = "casescope=info";

static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid {FILTER_ENV} filter '{directive}': {source}")]
    Filter {
        directive: String,
        source: ParseError,
    },
    #[error("Failed to install global tracing subscriber: {0}")]
    Install(String),
}

/// Installs the subscriber. Later calls are no-ops; failures are returned so
/// startup can continue without logging.
pub fn init() -> Result<(), LoggingError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let directive = std::env::var(FILTER_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty());
    let filter = build_filter(directive.as_deref())?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))?;
    let _ = INSTALLED.set(());
    log::debug!("Logging initialized");
    Ok(())
}

fn build_filter(directive: Option<&str>) -> Result<EnvFilter, LoggingError> {
    let directive = directive.unwrap_or(DEFAULT_FILTER).trim();
    EnvFilter::try_new(directive).map_err(|source| LoggingError::Filter {
        directive: directive.to_string(),
        source,
    })
}
