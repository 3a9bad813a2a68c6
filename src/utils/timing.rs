use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Logs how long the enclosing scope took when dropped. Runs on unwind too,
/// so a panicking handler still gets its timing line.
pub struct ScopedExecutionTimer<'a> {
    task_name: &'a str,
    context: Option<&'a str>,
    started_at: Instant,
    logger: &'a Logger,
}

impl<'a> ScopedExecutionTimer<'a> {
    pub fn new(task_name: &'a str, context: Option<&'a str>, logger: &'a Logger) -> Self {
        Self {
            task_name,
            context,
            started_at: Instant::now(),
            logger,
        }
    }
}

impl Drop for ScopedExecutionTimer<'_> {
    fn drop(&mut self) {
        if !self.logger.is_enabled(LogLevel::Debug) {
            return;
        }

        let elapsed = self.started_at.elapsed();
        self.logger.log(
            LogLevel::Debug,
            self.context,
            &format!(
                "task '{}' finished in {}",
                self.task_name,
                format_duration_human_friendly(elapsed)
            ),
            Some(json!({ "elapsed_us": elapsed.as_micros() as u64 })),
        );
    }
}

pub fn measure_execution<T>(
    task_name: &str,
    context: Option<&str>,
    logger: &Logger,
    task: impl FnOnce() -> T,
) -> T {
    let _timer = ScopedExecutionTimer::new(task_name, context, logger);
    task()
}

fn format_duration_human_friendly(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = total_ms / 1_000.0;
    if total_seconds < 60.0 {
        return format!("{total_ms:.2} ms ({total_seconds:.2} s)");
    }

    let minutes = (total_seconds / 60.0).floor();
    let seconds_remainder = total_seconds - (minutes * 60.0);
    format!(
        "{total_ms:.2} ms ({:.0}m {:.2}s)",
        minutes, seconds_remainder
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::logging::tests::memory_logger;
    use crate::logging::LogLevel;

    use super::{format_duration_human_friendly, measure_execution};

    #[test]
    fn formats_sub_second_duration_in_milliseconds() {
        let rendered = format_duration_human_friendly(Duration::from_millis(250));
        assert!(rendered.ends_with("ms"));
        assert!(rendered.contains("250"));
    }

    #[test]
    fn formats_minutes_with_remainder() {
        let rendered = format_duration_human_friendly(Duration::from_millis(61_500));
        assert!(rendered.contains("1m 1.50s"));
    }

    #[test]
    fn measure_execution_logs_debug_with_task_name() {
        let (logger, sink) = memory_logger(LogLevel::Debug);

        let value = measure_execution("command 'echo'", Some("tests::timing"), &logger, || 7);
        assert_eq!(value, 7);

        let lines = sink.lines.lock().expect("memory sink mutex poisoned");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[DEBUG]"));
        assert!(lines[0].contains("task 'command 'echo'' finished in"));
    }

    #[test]
    fn measure_execution_is_quiet_above_debug() {
        let (logger, sink) = memory_logger(LogLevel::Info);
        measure_execution("ignored", None, &logger, || ());
        assert!(sink.lines.lock().expect("memory sink mutex poisoned").is_empty());
    }
}
