//! Logging configuration built on tracing_subscriber.

use std::{io::IsTerminal, sync::Once};

use tracing_subscriber::{self, EnvFilter, filter::LevelFilter};

static TRACEDB_LOG_ENV_VAR: &str = "TRACEDB_LOG";

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();
    });
}

/// List of crates in the workspace.
const TRACEDB_CRATES: &[&str] = &["backend", "blocklist", "monitoring"];

fn env_filter() -> EnvFilter {
    // Parse directives from RUST_LOG
    let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = log_filter.parse(&directive_string).unwrap();

    let log_level = std::env::var(TRACEDB_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in TRACEDB_CRATES {
        // Add directives for each workspace crate, unless overridden by RUST_LOG
        if !directive_string.contains(&format!("{crate_name}=")) {
            env_filter =
                env_filter.add_directive(format!("{crate_name}={log_level}").parse().unwrap());
        }
    }

    env_filter
}

/// Collect the error source chain as a vector of strings for tracing.
///
/// Walks the `.source()` chain of the provided error and collects each source's
/// Display representation into a vector. Returns an empty vector if the error
/// has no source chain.
pub fn error_source(err: &dyn std::error::Error) -> tracing::field::DebugValue<Vec<String>> {
    let mut sources = Vec::new();
    let mut current = err.source();

    while let Some(curr) = current {
        sources.push(curr.to_string());
        current = curr.source();
    }

    tracing::field::debug(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_source_collects_the_full_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("connection refused")]
        struct ConnectionError;

        #[derive(Debug, thiserror::Error)]
        #[error("pull failed")]
        struct PullError(#[source] ConnectionError);

        let err = PullError(ConnectionError);
        let sources = format!("{:?}", error_source(&err));
        assert!(sources.contains("connection refused"));
    }
}
