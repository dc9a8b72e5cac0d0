//! Logging setup shared by the control-plane binaries

use clap::{Args, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogEncoding {
    #[default]
    Console,
    Json,
}

/// Logging flags
#[derive(Args, Clone, Debug)]
pub struct LogArgs {
    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output encoding
    #[arg(long, value_enum, default_value_t = LogEncoding::Console)]
    pub log_encoding: LogEncoding,
}

impl Default for LogArgs {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_encoding: LogEncoding::Console,
        }
    }
}

/// Install the global tracing subscriber
pub fn init(args: &LogArgs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_encoding {
        LogEncoding::Console => registry.with(fmt::layer()).init(),
        LogEncoding::Json => registry.with(fmt::layer().json()).init(),
    }
}
