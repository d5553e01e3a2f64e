//! Error taxonomy for normalised call failures
//!
//! Every failure that leaves the interceptor boundary is one of a small, closed set of
//! kinds. Each kind maps to a gRPC status code and carries a message that is safe to show
//! to the caller.

use tonic::{Code, Status};

/// Message returned to callers for every masked internal failure.
pub const INTERNAL_SERVER_MESSAGE: &str = "internal server error";

/// The semantic kind of a classified failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// One or more field-level constraint violations.
    Validation,
    /// Malformed payload, missing body, or a connection dropped mid-call.
    BadRequest,
    /// Anything unrecognised. Detail is logged server-side and withheld from the caller.
    InternalServer,
}

impl ErrorKind {
    /// Returns the gRPC status code for this kind.
    pub fn code(self) -> Code {
        match self {
            ErrorKind::Validation | ErrorKind::BadRequest => Code::InvalidArgument,
            ErrorKind::InternalServer => Code::Internal,
        }
    }
}

/// An application-level error: a kind plus caller-visible messages.
///
/// Business code may return this directly (boxed) from a handler; the error interceptor
/// treats it as already classified and maps it without further inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppError {
    kind: ErrorKind,
    messages: Vec<String>,
}

impl AppError {
    /// Creates an error of the given kind with a single message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            messages: vec![message.into()],
        }
    }

    /// Creates a validation error carrying one message per violation.
    ///
    /// An empty list still yields a usable error with a generic message.
    pub fn validation<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut messages: Vec<String> = messages.into_iter().map(Into::into).collect();
        if messages.is_empty() {
            messages.push("validation failed".to_string());
        }
        Self {
            kind: ErrorKind::Validation,
            messages,
        }
    }

    /// Creates a bad-request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    /// Creates the masked internal error with the default message.
    pub fn internal_server() -> Self {
        Self::new(ErrorKind::InternalServer, INTERNAL_SERVER_MESSAGE)
    }

    /// Creates the masked internal error with a configured message.
    pub fn internal_server_with(message: &str) -> Self {
        if message.trim().is_empty() {
            Self::internal_server()
        } else {
            Self::new(ErrorKind::InternalServer, message)
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the gRPC status code for this error.
    pub fn code(&self) -> Code {
        self.kind.code()
    }

    /// Returns the individual caller-visible messages.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Returns the caller-visible message, joining multiple violations with `"; "`.
    pub fn message(&self) -> String {
        self.messages.join("; ")
    }

    /// Converts this error into a transport status.
    pub fn to_status(&self) -> Status {
        Status::new(self.code(), self.message())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AppError {}

impl From<AppError> for Status {
    fn from(error: AppError) -> Self {
        error.to_status()
    }
}

/// The outcome of classifying one failure.
#[derive(Clone, Debug)]
pub enum ClassifiedFailure {
    /// The failure already was a transport status and passes through untouched.
    Status(Status),
    /// The failure was mapped onto the taxonomy.
    App(AppError),
}

impl ClassifiedFailure {
    /// Returns the taxonomy kind, or `None` for a passed-through transport status.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClassifiedFailure::Status(_) => None,
            ClassifiedFailure::App(error) => Some(error.kind()),
        }
    }

    /// Returns the gRPC status code.
    pub fn code(&self) -> Code {
        match self {
            ClassifiedFailure::Status(status) => status.code(),
            ClassifiedFailure::App(error) => error.code(),
        }
    }

    /// Returns the caller-visible message.
    pub fn message(&self) -> String {
        match self {
            ClassifiedFailure::Status(status) => status.message().to_string(),
            ClassifiedFailure::App(error) => error.message(),
        }
    }

    /// Consumes the classification and produces the status sent to the caller.
    pub fn into_status(self) -> Status {
        match self {
            ClassifiedFailure::Status(status) => status,
            ClassifiedFailure::App(error) => error.to_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        assert_eq!(ErrorKind::Validation.code(), Code::InvalidArgument);
        assert_eq!(ErrorKind::BadRequest.code(), Code::InvalidArgument);
        assert_eq!(ErrorKind::InternalServer.code(), Code::Internal);
    }

    #[test]
    fn test_codes_match_grpc_numbering() {
        assert_eq!(ErrorKind::BadRequest.code() as i32, 3);
        assert_eq!(ErrorKind::InternalServer.code() as i32, 13);
    }

    #[test]
    fn test_validation_keeps_every_message() {
        let error = AppError::validation(["email: invalid", "name: required"]);

        assert_eq!(error.kind(), ErrorKind::Validation);
        assert_eq!(error.messages().len(), 2);
        assert_eq!(error.message(), "email: invalid; name: required");
    }

    #[test]
    fn test_validation_empty_list_has_message() {
        let error = AppError::validation(Vec::<String>::new());
        assert_eq!(error.message(), "validation failed");
    }

    #[test]
    fn test_internal_server_message() {
        assert_eq!(AppError::internal_server().message(), INTERNAL_SERVER_MESSAGE);
        assert_eq!(
            AppError::internal_server_with("  ").message(),
            INTERNAL_SERVER_MESSAGE
        );
        assert_eq!(
            AppError::internal_server_with("something went wrong").message(),
            "something went wrong"
        );
    }

    #[test]
    fn test_to_status() {
        let status = AppError::bad_request("invalid json").to_status();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "invalid json");
    }

    #[test]
    fn test_display_matches_message() {
        let error = AppError::bad_request("missing request body");
        assert_eq!(format!("{}", error), "missing request body");
    }

    #[test]
    fn test_classified_failure_status_passthrough() {
        let failure = ClassifiedFailure::Status(Status::not_found("no such order"));

        assert_eq!(failure.kind(), None);
        assert_eq!(failure.code(), Code::NotFound);
        assert_eq!(failure.message(), "no such order");
    }

    #[test]
    fn test_classified_failure_app() {
        let failure = ClassifiedFailure::App(AppError::internal_server());

        assert_eq!(failure.kind(), Some(ErrorKind::InternalServer));
        let status = failure.into_status();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), INTERNAL_SERVER_MESSAGE);
    }
}
