//! A per-invocation logger that buffers lines for shipping to S3.
//!
//! Every line is also forwarded to [tracing], so it still reaches CloudWatch Logs.

use chrono::{SecondsFormat, Utc};
use derive_more::Display;
use std::sync::{Arc, Mutex, PoisonError};

/// Severity of a buffered log line.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[display("debug")]
    Debug,
    #[display("info")]
    Info,
    #[display("warn")]
    Warn,
    #[display("error")]
    Error,
    #[display("fatal")]
    Fatal,
}

/// Buffered logger handed to a service for the duration of one invocation.
///
/// Lines are formatted as `[<timestamp>] [<level>] [<function name>] <message>` and kept in
/// the order they were written. Cloning a `Logger` shares the buffer.
#[derive(Debug, Clone)]
pub struct Logger {
    function_name: Arc<str>,
    lines: Arc<Mutex<Vec<String>>>,
}

impl Logger {
    pub fn new(function_name: impl AsRef<str>) -> Self {
        Logger {
            function_name: Arc::from(function_name.as_ref()),
            lines: Arc::default(),
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(Level::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(Level::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(Level::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(Level::Error, message.as_ref());
    }

    pub fn fatal(&self, message: impl AsRef<str>) {
        self.log(Level::Fatal, message.as_ref());
    }

    /// Append one line at `level`.
    pub fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => tracing::debug!(function = %self.function_name, "{message}"),
            Level::Info => tracing::info!(function = %self.function_name, "{message}"),
            Level::Warn => tracing::warn!(function = %self.function_name, "{message}"),
            Level::Error | Level::Fatal => {
                tracing::error!(function = %self.function_name, level = %level, "{message}")
            }
        }
        let line = format!(
            "[{}] [{level}] [{}] {message}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            self.function_name
        );
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// A snapshot of the lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// The buffered lines joined into a single newline separated document.
    pub fn contents(&self) -> String {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .join("\n")
    }
}
