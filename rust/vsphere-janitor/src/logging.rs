use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{JanitorError, JanitorResult};

const DEFAULT_DIRECTIVE: &str = "vsphere_janitor=info";

/// Output format for log lines, selected with `--log-format` or `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_logging(format: LogFormat) -> JanitorResult<()> {
    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_DIRECTIVE.into()),
    );

    let result = match format {
        LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Text => subscriber.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    result.map_err(|e| JanitorError::Configuration(format!("Failed to initialize logging: {e}")))
}
