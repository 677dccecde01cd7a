//! Trace logger for the test endpoint.
//!
//! Every line is `<timestamp><sep><level><sep><category><sep><file>:<line><sep><message>`
//! with a configurable column separator (the tool uses `\t`). Filters may
//! inspect each line and emit additional canonical lines through the same
//! logger; lines emitted from within a filter are not filtered again.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use chrono::Utc;

/// Importance of a trace line. A line is written when its level is at or
/// above the configured level; `Off` disables the trace entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off,
    Low,
    Medium,
    High,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Off => "OFF",
            LogLevel::Low => "LOW",
            LogLevel::Medium => "MEDIUM",
            LogLevel::High => "HIGH",
        };
        write!(f, "{}", name)
    }
}

/// A log filter receives `(logger, level, origin category, message)` and may
/// emit zero or more lines through the logger.
pub type LogFilter = Box<dyn FnMut(&Logger, LogLevel, &str, &str) + Send>;

struct Inner {
    sink: Box<dyn Write + Send>,
    level: LogLevel,
    column_separator: String,
    filters: Vec<LogFilter>,
}

/// Clonable handle to the shared trace sink.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Mutex<Inner>>,
}

impl Logger {
    pub fn new(sink: Box<dyn Write + Send>) -> Logger {
        Logger {
            inner: Arc::new(Mutex::new(Inner {
                sink,
                level: LogLevel::High,
                column_separator: "\t".to_string(),
                filters: Vec::new(),
            })),
        }
    }

    /// Logger writing to a buffered stdout. The buffer is only flushed via
    /// [`Logger::flush`] or on drop of the process's stdout.
    pub fn to_stdout() -> Logger {
        Logger::new(Box::new(io::BufWriter::new(io::stdout())))
    }

    /// Logger writing into a shared byte buffer, for inspection in tests.
    pub fn capturing() -> (Logger, CapturedTrace) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let logger = Logger::new(Box::new(BufferSink(buffer.clone())));
        (logger, CapturedTrace(buffer))
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.lock().unwrap().level = level;
    }

    pub fn log_level(&self) -> LogLevel {
        self.inner.lock().unwrap().level
    }

    pub fn set_column_separator(&self, separator: &str) {
        self.inner.lock().unwrap().column_separator = separator.to_string();
    }

    /// Attach a filter. Filters run in registration order on every line.
    pub fn add_filter(&self, filter: LogFilter) {
        self.inner.lock().unwrap().filters.push(filter);
    }

    pub fn log(&self, level: LogLevel, category: &str, file: &str, line: u32, message: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            if level != LogLevel::Off && inner.level != LogLevel::Off && level >= inner.level {
                let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.9fZ");
                let sep = inner.column_separator.clone();
                let _ = writeln!(
                    inner.sink,
                    "{ts}{sep}{level}{sep}{category}{sep}{file}:{line}{sep}{message}",
                    ts = timestamp,
                    sep = sep,
                    level = level,
                    category = category,
                    file = file,
                    line = line,
                    message = message,
                );
            }
        }
        // Filters run outside the lock so they can log through this handle.
        // While they run the filter list is empty, so their own lines are
        // written verbatim.
        let mut filters = std::mem::take(&mut self.inner.lock().unwrap().filters);
        for filter in filters.iter_mut() {
            filter(self, level, category, message);
        }
        let mut inner = self.inner.lock().unwrap();
        let added = std::mem::take(&mut inner.filters);
        inner.filters = filters;
        inner.filters.extend(added);
    }

    pub fn flush(&self) {
        let _ = self.inner.lock().unwrap().sink.flush();
    }
}

/// Emit a trace line with the caller's file and line.
#[macro_export]
macro_rules! trace_line {
    ($logger:expr, $level:expr, $category:expr, $($arg:tt)*) => {
        $logger.log($level, $category, file!(), line!(), &format!($($arg)*))
    };
}

struct BufferSink(Arc<Mutex<Vec<u8>>>);

impl Write for BufferSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Handle onto the trace captured by [`Logger::capturing`].
pub struct CapturedTrace(Arc<Mutex<Vec<u8>>>);

impl CapturedTrace {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Messages only (the last tab-separated column of each line).
    pub fn messages(&self) -> Vec<String> {
        self.contents()
            .lines()
            .map(|line| line.rsplit('\t').next().unwrap_or("").to_string())
            .collect()
    }

    pub fn contains_message(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m == needle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format_has_five_columns() {
        let (logger, trace) = Logger::capturing();
        logger.log(LogLevel::High, "Tool", "main.rs", 42, "hello");
        let contents = trace.contents();
        let columns: Vec<&str> = contents.trim_end().split('\t').collect();
        assert_eq!(columns.len(), 5);
        assert_eq!(columns[1], "HIGH");
        assert_eq!(columns[2], "Tool");
        assert_eq!(columns[3], "main.rs:42");
        assert_eq!(columns[4], "hello");
    }

    #[test]
    fn level_gate_suppresses_below_configured() {
        let (logger, trace) = Logger::capturing();
        logger.set_log_level(LogLevel::Medium);
        logger.log(LogLevel::Low, "Tool", "f", 1, "hidden");
        logger.log(LogLevel::Medium, "Tool", "f", 2, "shown");
        logger.log(LogLevel::High, "Tool", "f", 3, "also shown");
        assert!(!trace.contains_message("hidden"));
        assert!(trace.contains_message("shown"));
        assert!(trace.contains_message("also shown"));
    }

    #[test]
    fn off_disables_everything() {
        let (logger, trace) = Logger::capturing();
        logger.set_log_level(LogLevel::Off);
        logger.log(LogLevel::High, "Tool", "f", 1, "nope");
        assert!(trace.contents().is_empty());
    }

    #[test]
    fn filters_see_suppressed_lines_and_may_emit() {
        let (logger, trace) = Logger::capturing();
        logger.set_log_level(LogLevel::High);
        logger.add_filter(Box::new(|logger: &Logger, _level, _origin, message: &str| {
            if message == "native line" {
                trace_line!(logger, LogLevel::High, "TLS", "canonical line");
            }
        }));
        // Below the gate, but the filter still runs.
        logger.log(LogLevel::Low, "backend", "f", 1, "native line");
        assert!(!trace.contains_message("native line"));
        assert!(trace.contains_message("canonical line"));
    }

    #[test]
    fn filter_emissions_are_not_refiltered() {
        let (logger, trace) = Logger::capturing();
        logger.add_filter(Box::new(|logger: &Logger, _level, _origin, message: &str| {
            if message.starts_with("ping") {
                trace_line!(logger, LogLevel::High, "TLS", "ping again");
            }
        }));
        logger.log(LogLevel::High, "backend", "f", 1, "ping");
        let count = trace
            .messages()
            .iter()
            .filter(|m| m.starts_with("ping"))
            .count();
        assert_eq!(count, 2);
    }
}
