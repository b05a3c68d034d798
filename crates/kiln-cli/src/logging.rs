//! Diagnostic logging setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding a filter directive, e.g. `KILN_LOG=kiln_engine=debug`.
pub const LOG_ENV: &str = "KILN_LOG";

/// Install a stderr subscriber.
///
/// `KILN_LOG` wins when set. Otherwise only warnings are shown, or debug
/// output from the Kiln crates with `verbose`.
///
/// # Errors
/// Returns an error if `KILN_LOG` is not a valid filter or a subscriber is
/// already installed.
pub fn init(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::try_new(default_directives(verbose))?,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(filter)
        .try_init()?;
    Ok(())
}

fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "warn,kiln_engine=debug,kiln_cli=debug"
    } else {
        "warn"
    }
}
