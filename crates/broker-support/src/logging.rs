use slog::Logger;
use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};

/// Verbosity to `slog` severity, matching the repeatable `-v` CLI flag: no flags means
/// `info`, one `-v` drops to `debug`, two or more to `trace`.
fn severity_for(verbosity: u64) -> Severity {
    match verbosity {
        0 => Severity::Info,
        1 => Severity::Debug,
        _ => Severity::Trace,
    }
}

/// Builds the process-wide root logger. Defaults to a terminal drain on stderr; the
/// level string is interpolated into the same `sloggers::LoggerConfig` TOML shape this
/// config type already reads, so a config file could override it later without changing
/// the call site.
pub fn init(verbosity: u64) -> Logger {
    let toml = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        severity_name(severity_for(verbosity))
    );

    let config: LoggerConfig = serdeconv::from_toml_str(&toml).expect("invalid logger config");

    config.build_logger().expect("failed to build logger")
}

/// Root logger with no output, used by unit tests that don't care what gets logged.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

fn severity_name(severity: Severity) -> &'static str {
    match severity {
        Severity::Trace => "trace",
        Severity::Debug => "debug",
        Severity::Info => "info",
        Severity::Warning => "warning",
        Severity::Error => "error",
        Severity::Critical => "critical",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_escalates_with_verbosity() {
        assert_eq!(severity_for(0), Severity::Info);
        assert_eq!(severity_for(1), Severity::Debug);
        assert_eq!(severity_for(2), Severity::Trace);
        assert_eq!(severity_for(99), Severity::Trace);
    }

    #[test]
    fn init_builds_a_working_logger() {
        let logger = init(0);
        slog::info!(logger, "logger smoke test");
    }

    #[test]
    fn discard_swallows_everything() {
        let logger = discard();
        slog::info!(logger, "nobody hears this");
    }
}
