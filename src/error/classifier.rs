//! Failure classifier
//!
//! Maps an arbitrary handler failure onto the error taxonomy. The decision order is fixed
//! and the first matching rule wins:
//!
//! 1. a `tonic::Status` passes through unchanged
//! 2. an [`AppError`] is already classified by the business layer
//! 3. a failure without a source chain is "unwrapped": whatever its type, it is masked and
//!    a diagnostic is produced so the call site that skipped wrapping can be found
//! 4. the source chain is walked root-first and every cause is matched against the known
//!    shapes in priority order; anything unrecognised is masked with a diagnostic
//!
//! Classification is pure. Diagnostics are returned to the caller, which decides where
//! to write them.

use std::error::Error as StdError;
use std::io;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::error::Category;
use serde_path_to_error::Path;
use tonic::Status;
use validator::{ValidationError, ValidationErrors, ValidationErrorsKind};

use super::classification::{AppError, ClassifiedFailure};
use super::detector::is_transport_reset;
use super::diagnostic::{DiagnosticOrigin, DiagnosticRecord};
use crate::interceptor::CallContext;

/// Message for malformed JSON payloads.
pub const INVALID_JSON_MESSAGE: &str = "invalid json";
/// Message for an empty request body.
pub const MISSING_BODY_MESSAGE: &str = "missing request body";
/// Message for the transport-reset family.
pub const CONNECTION_ERROR_MESSAGE: &str = "connection error";
/// Message for a payload value of the wrong shape when no field can be named.
pub const INVALID_VALUE_MESSAGE: &str = "invalid value in request body";

/// The result of classifying one failure.
#[derive(Clone, Debug)]
pub struct Classification {
    /// What the caller will see.
    pub failure: ClassifiedFailure,
    /// Present whenever detail was masked from the caller.
    pub diagnostic: Option<DiagnosticRecord>,
}

impl Classification {
    fn clean(failure: ClassifiedFailure) -> Self {
        Self {
            failure,
            diagnostic: None,
        }
    }

    /// Returns true if the caller-visible failure hides diagnostic detail.
    pub fn is_masked(&self) -> bool {
        self.diagnostic.is_some()
    }

    /// Consumes the classification and produces the status sent to the caller.
    pub fn into_status(self) -> Status {
        self.failure.into_status()
    }
}

/// Classifies handler failures.
#[derive(Clone, Debug, Default)]
pub struct Classifier {
    internal_message: Option<String>,
}

impl Classifier {
    /// Creates a classifier using the default masked message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the message shown to callers for masked failures.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Returns the masked error this classifier produces.
    pub fn internal_error(&self) -> AppError {
        match &self.internal_message {
            Some(message) => AppError::internal_server_with(message),
            None => AppError::internal_server(),
        }
    }

    /// Classifies a failure returned by the handler of the call described by `ctx`.
    pub fn classify(&self, failure: &(dyn StdError + 'static), ctx: &CallContext) -> Classification {
        if let Some(status) = failure.downcast_ref::<Status>() {
            return Classification::clean(ClassifiedFailure::Status(status.clone()));
        }
        if let Some(error) = failure.downcast_ref::<AppError>() {
            return Classification::clean(ClassifiedFailure::App(error.clone()));
        }

        if failure.source().is_none() {
            return self.masked(DiagnosticOrigin::Unwrapped, failure, ctx);
        }

        for cause in causes_root_first(failure) {
            if let Some(classified) = match_cause(cause) {
                return Classification::clean(classified);
            }
        }
        self.masked(DiagnosticOrigin::Unhandled, failure, ctx)
    }

    fn masked(
        &self,
        origin: DiagnosticOrigin,
        failure: &(dyn StdError + 'static),
        ctx: &CallContext,
    ) -> Classification {
        Classification {
            failure: ClassifiedFailure::App(self.internal_error()),
            diagnostic: Some(DiagnosticRecord::for_failure(origin, failure, ctx)),
        }
    }
}

/// Classifies a failure with the default classifier.
pub fn classify(failure: &(dyn StdError + 'static), ctx: &CallContext) -> Classification {
    Classifier::new().classify(failure, ctx)
}

/// Returns the source chain innermost-first, ending with `failure` itself.
fn causes_root_first<'a>(failure: &'a (dyn StdError + 'static)) -> Vec<&'a (dyn StdError + 'static)> {
    let mut chain = Vec::new();
    let mut current = Some(failure);
    while let Some(error) = current {
        chain.push(error);
        // A path-tracking decode error is matched as a whole, with its inner error.
        if error.is::<serde_path_to_error::Error<serde_json::Error>>() {
            break;
        }
        current = error.source();
    }
    chain.reverse();
    chain
}

/// Matches one cause against the known shapes in priority order.
fn match_cause(cause: &(dyn StdError + 'static)) -> Option<ClassifiedFailure> {
    if let Some(status) = cause.downcast_ref::<Status>() {
        return Some(ClassifiedFailure::Status(status.clone()));
    }
    if let Some(error) = cause.downcast_ref::<AppError>() {
        return Some(ClassifiedFailure::App(error.clone()));
    }
    if let Some(errors) = cause.downcast_ref::<ValidationErrors>() {
        return Some(ClassifiedFailure::App(AppError::validation(
            validation_messages(errors),
        )));
    }
    if let Some(error) = cause.downcast_ref::<serde_path_to_error::Error<serde_json::Error>>() {
        if let Some(app) = match_json(error.inner(), Some(error.path())) {
            return Some(ClassifiedFailure::App(app));
        }
    }
    if let Some(error) = cause.downcast_ref::<serde_json::Error>() {
        if let Some(app) = match_json(error, None) {
            return Some(ClassifiedFailure::App(app));
        }
    }
    if let Some(error) = cause.downcast_ref::<io::Error>() {
        if let Some(app) = match_io(error) {
            return Some(ClassifiedFailure::App(app));
        }
    }
    if cause.is::<tokio::time::error::Elapsed>() {
        return Some(ClassifiedFailure::App(AppError::bad_request(
            CONNECTION_ERROR_MESSAGE,
        )));
    }

    let text = cause.to_string();
    if text == "EOF" {
        return Some(ClassifiedFailure::App(AppError::bad_request(
            MISSING_BODY_MESSAGE,
        )));
    }
    if is_transport_reset(&text) {
        return Some(ClassifiedFailure::App(AppError::bad_request(
            CONNECTION_ERROR_MESSAGE,
        )));
    }
    None
}

/// `path` is the location of the offending value when the payload was decoded through
/// `serde_path_to_error`.
fn match_json(error: &serde_json::Error, path: Option<&Path>) -> Option<AppError> {
    match error.classify() {
        Category::Syntax => Some(AppError::bad_request(INVALID_JSON_MESSAGE)),
        Category::Data => {
            let field = field_named_in(&error.to_string()).or_else(|| {
                path.filter(|path| path.iter().next().is_some())
                    .map(Path::to_string)
            });
            Some(AppError::bad_request(match field {
                Some(field) => format!("invalid value for field {field}"),
                None => INVALID_VALUE_MESSAGE.to_string(),
            }))
        }
        // End of input before a single byte was read means there was no body at all.
        Category::Eof if error.line() == 1 && error.column() == 0 => {
            Some(AppError::bad_request(MISSING_BODY_MESSAGE))
        }
        Category::Eof => Some(AppError::bad_request(INVALID_JSON_MESSAGE)),
        Category::Io => None,
    }
}

fn match_io(error: &io::Error) -> Option<AppError> {
    match error.kind() {
        io::ErrorKind::UnexpectedEof => Some(AppError::bad_request(MISSING_BODY_MESSAGE)),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut => Some(AppError::bad_request(CONNECTION_ERROR_MESSAGE)),
        _ => None,
    }
}

/// Extracts the field from serde's missing, unknown and duplicate field messages.
///
/// Type mismatches back-quote the offending value rather than the field, so they name
/// nothing here.
fn field_named_in(message: &str) -> Option<String> {
    static FIELD: OnceLock<Option<Regex>> = OnceLock::new();
    let regex = FIELD
        .get_or_init(|| Regex::new(r"^(?:missing|unknown|duplicate) field `([^`]+)`").ok())
        .as_ref()?;
    regex
        .captures(message)
        .and_then(|captures| captures.get(1))
        .map(|field| field.as_str().to_string())
}

/// Flattens validation errors into one message per violated constraint, ordered by path.
pub fn validation_messages(errors: &ValidationErrors) -> Vec<String> {
    let mut messages = Vec::new();
    collect_violations(errors, "", &mut messages);
    messages
}

fn collect_violations(errors: &ValidationErrors, prefix: &str, out: &mut Vec<String>) {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in fields {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(violations) => {
                out.extend(violations.iter().map(|v| violation_message(&path, v)));
            }
            ValidationErrorsKind::Struct(nested) => collect_violations(nested, &path, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_violations(nested, &format!("{path}[{index}]"), out);
                }
            }
        }
    }
}

fn violation_message(path: &str, violation: &ValidationError) -> String {
    match &violation.message {
        Some(message) => format!("{path}: {message}"),
        None => format!("{path} failed on the '{}' constraint", violation.code),
    }
}
