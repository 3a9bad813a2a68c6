use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::AppConfig;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }

    fn as_colored_str(self) -> &'static str {
        match self {
            Self::Error => "\x1b[31mERROR\x1b[0m",
            Self::Warn => "\x1b[33mWARN\x1b[0m",
            Self::Info => "\x1b[32mINFO\x1b[0m",
            Self::Debug => "\x1b[36mDEBUG\x1b[0m",
            Self::Verbose => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
        }
    }
}

impl LoggerConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Option<Self> {
        Some(Self {
            min_level: LogLevel::from_config_value(&app_config.logging.level)?,
            human_friendly: app_config.logging.human_friendly,
        })
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Discards everything; handy for embedding the worker where the host owns logging.
#[derive(Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write_line(&self, _line: &str) {}
}

pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn silent() -> Self {
        Self::with_sink(LoggerConfig::default(), Arc::new(NullSink))
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn verbose(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Verbose, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.is_enabled(level) {
            return;
        }

        let line = self.format_line(level, context, message, payload.as_ref());
        self.sink.write_line(&line);
    }

    fn format_line(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let rendered_level = if self.config.human_friendly {
            level.as_colored_str()
        } else {
            level.as_str()
        };

        let context_part = match context {
            Some(ctx) if !ctx.is_empty() => format!(" [{ctx}]"),
            _ => String::new(),
        };

        let payload_part = match payload {
            Some(value) => format!(" payload={value}"),
            None => String::new(),
        };

        // Worker, acceptor and peer reader threads all share one logger.
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");

        format!("{timestamp} [{rendered_level}] ({thread_name}){context_part} {message}{payload_part}")
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::config::AppConfig;

    use super::{LogLevel, LogSink, Logger, LoggerConfig};

    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub(crate) lines: Mutex<Vec<String>>,
    }

    impl MemorySink {
        pub(crate) fn contains(&self, needle: &str) -> bool {
            self.lines
                .lock()
                .expect("memory sink mutex poisoned")
                .iter()
                .any(|line| line.contains(needle))
        }
    }

    impl LogSink for MemorySink {
        fn write_line(&self, line: &str) {
            self.lines
                .lock()
                .expect("memory sink mutex poisoned")
                .push(line.to_owned());
        }
    }

    pub(crate) fn memory_logger(min_level: LogLevel) -> (Arc<Logger>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(
            LoggerConfig {
                min_level,
                human_friendly: false,
            },
            sink.clone(),
        );
        (Arc::new(logger), sink)
    }

    #[test]
    fn parses_config_levels_case_insensitively() {
        assert_eq!(LogLevel::from_config_value("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_config_value(" warn "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_config_value("trace"), Some(LogLevel::Verbose));
        assert_eq!(LogLevel::from_config_value("loud"), None);
    }

    #[test]
    fn builds_from_app_config() {
        let mut app_config = AppConfig::default();
        app_config.logging.level = "error".to_owned();
        app_config.logging.human_friendly = true;

        let config = LoggerConfig::from_app_config(&app_config).expect("level should parse");
        assert_eq!(config.min_level, LogLevel::Error);
        assert!(config.human_friendly);

        app_config.logging.level = "nope".to_owned();
        assert!(LoggerConfig::from_app_config(&app_config).is_none());
    }

    #[test]
    fn info_threshold_excludes_debug_logs() {
        let (logger, sink) = memory_logger(LogLevel::Info);

        logger.info(Some("tests::logger"), "info message");
        logger.debug(Some("tests::logger"), "debug message");

        let lines = sink.lines.lock().expect("memory sink mutex poisoned");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[INFO]"));
        assert!(!logger.is_enabled(LogLevel::Debug));
    }

    #[test]
    fn log_supports_optional_json_payload() {
        let (logger, sink) = memory_logger(LogLevel::Debug);

        logger.log(
            LogLevel::Info,
            Some("tests::payload"),
            "request received",
            Some(json!({"command":"echo","bytes":2})),
        );

        let lines = sink.lines.lock().expect("memory sink mutex poisoned");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[tests::payload]"));
        assert!(lines[0].contains("payload={\"bytes\":2,\"command\":\"echo\"}"));
        assert!(lines[0].starts_with("20"));
        assert!(lines[0].contains(") [tests::payload] request received"));
    }

    #[test]
    fn silent_logger_writes_nothing_visible() {
        let logger = Logger::silent();
        logger.error(None, "dropped");
        assert!(logger.is_enabled(LogLevel::Error));
    }
}
