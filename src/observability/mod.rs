//! Observability and telemetry.
//!
//! Mengram is an embedded library, not a long-running server, so there is no
//! OTLP exporter or metrics HTTP listener here - just a single entry point
//! that wires `tracing` output to the process's standard error, configurable
//! through the standard `RUST_LOG` filter syntax.

use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber.
///
/// Safe to call more than once; subsequent calls are no-ops (the global
/// subscriber can only be set once per process).
///
/// Honors `RUST_LOG` if set, otherwise defaults to `info` for this crate and
/// `warn` for dependencies.
pub fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mengram={default_directive},warn")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_does_not_panic() {
        init_logging(false);
        init_logging(true);
    }
}
