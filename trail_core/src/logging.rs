//! Tracing setup shared by the CLI and tests.
//!
//! Log lines go to stderr so command output on stdout stays parseable.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter directive for a run: RUST_LOG wins, then `--verbose`, then the
/// configured level
pub fn directive(config: &LoggingConfig, verbose: bool, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim).filter(|env| !env.is_empty()) {
        Some(env) => env.to_string(),
        None if verbose => "debug".to_string(),
        None => config.level.clone(),
    }
}

/// Install the global subscriber
///
/// An unparsable directive falls back to `warn` instead of aborting the run.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = directive(config, verbose, rust_log.as_deref());
    let (filter, rejected) = match EnvFilter::try_new(&directive) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new("warn"), Some(e)),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
    if installed.is_err() {
        return;
    }
    if let Some(e) = rejected {
        tracing::warn!("Ignoring log filter {:?}: {}", directive, e);
    }
}

/// Initialize logging for testing (captures logs for test output)
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_precedence() {
        let config = LoggingConfig {
            level: "info".into(),
        };
        assert_eq!(directive(&config, false, None), "info");
        assert_eq!(directive(&config, true, None), "debug");
        assert_eq!(directive(&config, true, Some("trail_core=trace")), "trail_core=trace");
        // A blank RUST_LOG does not mask the other sources
        assert_eq!(directive(&config, false, Some("  ")), "info");
    }

    #[test]
    fn test_init_tolerates_bad_directive_and_repeat_calls() {
        let config = LoggingConfig {
            level: "not a [valid directive".into(),
        };
        init(&config, false);
        init(&LoggingConfig::default(), true);
    }
}
