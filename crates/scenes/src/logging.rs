#![forbid(unsafe_code)]

//! Logging bootstrap.
//!
//! The library crates only emit `tracing` events. Applications that do not
//! install their own subscriber can call [`init`]:
//!
//! - `SCENES_LOG` sets the filter (`EnvFilter` syntax, default `warn`);
//! - `SCENES_LOG_FORMAT=json` switches to one JSON object per line.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "SCENES_LOG";
/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "SCENES_LOG_FORMAT";

/// Output format of [`init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// JSON lines.
    Json,
}

impl LogFormat {
    /// Read [`LOG_FORMAT_ENV`].
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install a global subscriber configured from the environment.
///
/// Returns `false` when a subscriber was already installed.
pub fn init() -> bool {
    init_with(LogFormat::from_env())
}

/// Install a global subscriber with an explicit format.
pub fn init_with(format: LogFormat) -> bool {
    let builder = tracing_subscriber::fmt().with_env_filter(filter());
    match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}
