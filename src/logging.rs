//! Diagnostic logging for the binary.
//!
//! Traces go to stderr so that stdout carries only result lines.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is unset: `info`, or `debug` with `--debug`.
#[must_use]
pub fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(debug))
}

fn default_filter(debug: bool) -> EnvFilter {
    EnvFilter::new(if debug { "debug" } else { "info" })
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns [`TryInitError`] when a subscriber is already installed.
pub fn init(debug: bool) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter(debug))
        .try_init()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(false, "info")]
    #[case(true, "debug")]
    fn debug_flag_selects_the_level(#[case] debug: bool, #[case] expected: &str) {
        assert_eq!(default_filter(debug).to_string(), expected);
    }
}
