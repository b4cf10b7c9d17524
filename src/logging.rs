//! Process-wide tracing setup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSection};

/// Filter directive used when `RUST_LOG` is unset.
///
/// `verbose` forces debug output for the crate regardless of the configured level.
pub fn default_directive(logging: &LoggingSection, verbose: bool) -> String {
    if verbose {
        format!("{},numberhub=debug", logging.level)
    } else {
        logging.level.clone()
    }
}

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init(logging: &LoggingSection, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(logging, verbose)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
