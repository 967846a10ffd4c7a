//! Tracing setup for the `cbcpack` binary.
//!
//! The verification report is the program's output and goes to stdout, so
//! every log line goes to stderr. Piping `cbcpack run` into a file or `jq`
//! therefore captures only the report.
//!
//! Without `RUST_LOG`, only cbcpack's own crates log at the requested level;
//! everything else is held at `warn`. Subprocess output is never logged
//! line-by-line; failures surface through the diagnostics tail instead.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose events the default filter admits at the requested level.
const OWN_TARGETS: &[&str] = &["cbcpack_core", "cbcpack"];

/// Default filter directive when `RUST_LOG` is unset.
fn default_directive(level: Level) -> String {
    let mut directive = String::from("warn");
    for target in OWN_TARGETS {
        directive.push_str(&format!(",{target}={}", level.as_str().to_lowercase()));
    }
    directive
}

/// Install the global subscriber.
///
/// `json` switches to newline-delimited JSON lines, whose `event` fields
/// come from [`crate::obs`]. A second call is a no-op: the first subscriber
/// stays installed.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if json {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_scopes_own_crates() {
        assert_eq!(
            default_directive(Level::DEBUG),
            "warn,cbcpack_core=debug,cbcpack=debug"
        );
        assert!(EnvFilter::try_new(default_directive(Level::INFO)).is_ok());
    }

    #[test]
    fn test_second_init_keeps_first_subscriber() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}
