pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Logger description used when the caller does not supply one.
const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds a stderr terminal logger at debug level.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("default logger description must build")
}

/// Builds a logger from a TOML description understood by `sloggers`
/// (`type`, `level`, `destination`, ...).
pub fn from_toml(description: &str) -> Result<Logger, String> {
    let config: LoggerConfig =
        serdeconv::from_toml_str(description).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// Null logger for tests and detached components.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_description_builds() {
        let _ = from_toml(DEFAULT_CONFIG).unwrap();
    }

    #[test]
    fn test_garbage_description_rejected() {
        assert!(from_toml("type = \"carrier-pigeon\"").is_err());
    }
}
