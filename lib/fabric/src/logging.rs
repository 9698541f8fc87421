pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the process-wide terminal logger from the embedded default config.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("default logger config must parse");
    config.build_logger().expect("default logger must build")
}

/// A logger that swallows everything. Used as the fallback when a component
/// is constructed without a parent logger.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
