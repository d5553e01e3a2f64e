//! The log sink capability.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use super::LogLevel;
use crate::error::DiagnosticRecord;
use crate::interceptor::{CallOutcome, CallSummary};

/// Leveled log writes, injected into each interceptor.
///
/// The formatted variants of the writes are the `format_args!` call sites; implementors
/// only need [`LogSink::log`]. The structured hooks have plain-text defaults.
pub trait LogSink: Send + Sync {
    /// Writes one line at `level`.
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>);

    /// Writes an info line.
    fn info(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Info, args);
    }

    /// Writes a warning line.
    fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Warn, args);
    }

    /// Writes an error line.
    fn error(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, args);
    }

    /// Writes a line about a failure that stops the process. Only used around startup and
    /// shutdown; the caller decides how to exit.
    fn fatal(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, format_args!("FATAL {args}"));
    }

    /// Records the summary of one finished call.
    fn call_completed(&self, summary: &CallSummary) {
        match summary.outcome {
            CallOutcome::Ok => self.info(format_args!("{summary}")),
            CallOutcome::Failed { .. } => self.error(format_args!("{summary}")),
        }
    }

    /// Records a diagnostic for a masked failure.
    fn diagnostic(&self, record: &DiagnosticRecord) {
        self.error(format_args!("{}", record.headline()));
        for line in record.detail_lines() {
            self.error(format_args!("{line}"));
        }
    }
}

/// Runs a sink write, swallowing any panic raised by the sink.
pub(crate) fn write_guarded<F: FnOnce()>(write: F) {
    let _ = catch_unwind(AssertUnwindSafe(write));
}

/// Sink that emits `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TracingSink {
    /// Creates a new tracing sink.
    pub fn new() -> Self {
        Self
    }
}

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        match level {
            LogLevel::Trace => tracing::trace!("{}", args),
            LogLevel::Debug => tracing::debug!("{}", args),
            LogLevel::Info => tracing::info!("{}", args),
            LogLevel::Warn => tracing::warn!("{}", args),
            LogLevel::Error => tracing::error!("{}", args),
            LogLevel::Off => {}
        }
    }

    fn fatal(&self, args: fmt::Arguments<'_>) {
        tracing::error!(fatal = true, "{}", args);
    }

    fn call_completed(&self, summary: &CallSummary) {
        let duration_ms = summary.duration.as_secs_f64() * 1000.0;
        match &summary.outcome {
            CallOutcome::Ok => tracing::info!(
                method = %summary.method,
                duration_ms,
                status = "OK",
                "{summary}"
            ),
            CallOutcome::Failed { code, message } => tracing::error!(
                method = %summary.method,
                duration_ms,
                code = ?code,
                error = %message,
                "{summary}"
            ),
        }
    }

    fn diagnostic(&self, record: &DiagnosticRecord) {
        tracing::error!(
            origin = ?record.origin,
            method = %record.method,
            server = %record.owner,
            error_type = %record.type_name,
            error_message = %record.message,
            location = ?record.location,
            deadline_remaining = ?record.deadline_remaining,
            cancellation = ?record.cancellation,
            panic_shape = ?record.panic_shape,
            trace = %record.trace.join("\n"),
            "{}",
            record.headline()
        );
    }
}

/// One line captured by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Level the line was written at.
    pub level: LogLevel,
    /// Rendered text.
    pub message: String,
}

/// Sink that keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<LogLine>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every captured line.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lock().clone()
    }

    /// Returns the messages captured at `level`.
    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|line| line.level == level)
            .map(|line| line.message.clone())
            .collect()
    }

    /// Returns true if any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|line| line.message.contains(needle))
    }

    /// Returns the number of captured lines.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every captured line.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogLine>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        self.lock().push(LogLine {
            level,
            message: args.to_string(),
        });
    }
}
