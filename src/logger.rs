use tracing_subscriber::{EnvFilter, fmt};

pub use tracing::{debug, error, info, warn};

const DEFAULT_FILTER: &str = "vmshift=info";
const VERBOSE_FILTER: &str = "vmshift=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber. `RUST_LOG` wins over the default filter.
pub fn init_logger() {
    init_logger_with(LogFormat::Text, false);
}

/// As [`init_logger`], with `verbose` lowering the default filter to debug.
pub fn init_logger_with(format: LogFormat, verbose: bool) {
    let default = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = fmt().with_env_filter(filter).with_target(false);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::logger::info!($($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::logger::warn!($($arg)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::logger::error!($($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::logger::debug!($($arg)*) };
}
