//! Process-wide logging bootstrap. Every component receives a child of the
//! root logger built here, so records can be filtered by origin.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the root logger for the process: human-readable output on stderr.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Logging config must parse");

    config.build_logger().expect("Logger construction failed")
}
