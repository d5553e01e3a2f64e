//! Operator-facing diagnostic records
//!
//! A record is built when a failure has to be masked from the caller, written once to the
//! log sink, then dropped.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use super::classification::AppError;
use super::detector::PanicShape;
use crate::interceptor::{CallContext, CancelReason};

/// Why a diagnostic record was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticOrigin {
    /// The failure carried no source chain and matched no known shape.
    Unwrapped,
    /// The failure was wrapped but its cause is not a recognised category.
    Unhandled,
    /// The handler panicked.
    Panic,
}

impl DiagnosticOrigin {
    /// Returns the headline written before the detail lines.
    pub fn headline(self) -> &'static str {
        match self {
            DiagnosticOrigin::Unwrapped => {
                "UNWRAPPED ERROR DETECTED - attach a source to the error or return an AppError"
            }
            DiagnosticOrigin::Unhandled => "unhandled wrapped error, masking from caller",
            DiagnosticOrigin::Panic => "PANIC RECOVERED in gRPC handler",
        }
    }
}

/// Full detail about a masked failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiagnosticRecord {
    /// Why the record exists.
    pub origin: DiagnosticOrigin,
    /// Full gRPC method name.
    pub method: String,
    /// Type name of the service owning the handler.
    pub owner: String,
    /// Dynamic type of the failure or panic payload.
    pub type_name: String,
    /// The failure's own message.
    pub message: String,
    /// Unwrap chain (outermost first) or captured backtrace lines.
    pub trace: Vec<String>,
    /// Source location of a panic, when known.
    pub location: Option<String>,
    /// Time left until the call's deadline; zero once it passed.
    pub deadline_remaining: Option<Duration>,
    /// Whether the call had been cancelled when the record was made.
    pub cancellation: Option<CancelReason>,
    /// Shape of the panic payload.
    pub panic_shape: Option<PanicShape>,
}

impl DiagnosticRecord {
    /// Builds a record for a returned failure.
    pub fn for_failure(
        origin: DiagnosticOrigin,
        failure: &(dyn StdError + 'static),
        ctx: &CallContext,
    ) -> Self {
        let mut record = Self::base(origin, ctx);
        record.type_name = describe_type(failure);
        record.message = failure.to_string();
        record.trace = unwrap_chain(failure);
        if origin == DiagnosticOrigin::Unwrapped {
            // Nothing to unwrap, so the debug rendering is the most detail available.
            record.trace = vec![format!("{failure:?}")];
        }
        record
    }

    /// Builds a record for a recovered panic.
    pub fn for_panic(
        ctx: &CallContext,
        type_name: impl Into<String>,
        message: impl Into<String>,
        shape: PanicShape,
    ) -> Self {
        let mut record = Self::base(DiagnosticOrigin::Panic, ctx);
        record.type_name = type_name.into();
        record.message = message.into();
        record.panic_shape = Some(shape);
        record
    }

    /// Attaches a panic location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Replaces the trace.
    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }

    fn base(origin: DiagnosticOrigin, ctx: &CallContext) -> Self {
        Self {
            origin,
            method: ctx.method().full_method().to_string(),
            owner: ctx.method().owner().to_string(),
            type_name: String::new(),
            message: String::new(),
            trace: Vec::new(),
            location: None,
            deadline_remaining: ctx.deadline_remaining(),
            cancellation: ctx.cancellation_reason(),
            panic_shape: None,
        }
    }

    /// Returns the headline for this record.
    pub fn headline(&self) -> &'static str {
        self.origin.headline()
    }

    /// Renders the detail lines written after the headline.
    pub fn detail_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(8 + self.trace.len());
        let subject = if self.origin == DiagnosticOrigin::Panic {
            "panic"
        } else {
            "error"
        };
        lines.push(format!("gRPC method: {}", self.method));
        lines.push(format!("server: {}", self.owner));
        lines.push(format!("{subject} type: {}", self.type_name));
        lines.push(format!("{subject} value: {}", self.message));
        if let Some(location) = &self.location {
            lines.push(format!("location: {location}"));
        }
        if let Some(remaining) = self.deadline_remaining {
            lines.push(format!("context deadline: {remaining:?} remaining"));
        }
        if let Some(reason) = self.cancellation {
            lines.push(format!("context error: {reason}"));
        }
        if let Some(shape) = self.panic_shape {
            lines.push(shape.description().to_string());
        }
        if !self.trace.is_empty() {
            lines.push("trace:".to_string());
            lines.extend(self.trace.iter().map(|line| format!("  {line}")));
        }
        lines
    }
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.headline())?;
        for line in self.detail_lines() {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

/// Returns the display text of each level of the source chain, outermost first.
pub fn unwrap_chain(failure: &(dyn StdError + 'static)) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = Some(failure);
    while let Some(error) = current {
        chain.push(error.to_string());
        current = error.source();
    }
    chain
}

/// Best-effort name of a failure's dynamic type.
///
/// Known types are resolved by downcast. Otherwise the leading path of the `Debug`
/// rendering is used, which is the type name for derived implementations.
pub fn describe_type(failure: &(dyn StdError + 'static)) -> String {
    if failure.is::<tonic::Status>() {
        return "tonic::Status".to_string();
    }
    if failure.is::<AppError>() {
        return "callguard::AppError".to_string();
    }
    if failure.is::<serde_json::Error>() {
        return "serde_json::Error".to_string();
    }
    if failure.is::<std::io::Error>() {
        return "std::io::Error".to_string();
    }
    if failure.is::<validator::ValidationErrors>() {
        return "validator::ValidationErrors".to_string();
    }
    if failure.is::<tokio::time::error::Elapsed>() {
        return "tokio::time::error::Elapsed".to_string();
    }

    let debug = format!("{failure:?}");
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    match name.chars().next() {
        Some(first) if first.is_alphabetic() => name,
        _ => "dyn Error".to_string(),
    }
}
