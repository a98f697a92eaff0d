use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable output for interactive commands.
    Human,
    /// One JSON object per line for boot and the failover listener, where
    /// output ends up in the instance console log.
    Json,
}

/// Install the global subscriber. `RUST_LOG` wins over the default
/// `nodeward=info,warn`.
pub fn init(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("nodeward=info,warn"));

    match format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact();
            tracing_subscriber::registry().with(env_filter).with(layer).init();
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(env_filter).with(layer).init();
        }
    }
}
