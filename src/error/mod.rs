//! Error taxonomy and failure classification
//!
//! This module turns whatever a handler failed with into one of a closed set of
//! caller-safe errors, and describes masked failures in full for operators.

pub mod classification;
pub mod classifier;
pub(crate) mod detector;
pub mod diagnostic;

// Re-export main types for convenient access
pub use classification::{AppError, ClassifiedFailure, ErrorKind, INTERNAL_SERVER_MESSAGE};
pub use classifier::{classify, validation_messages, Classification, Classifier};
pub use detector::PanicShape;
pub use diagnostic::{DiagnosticOrigin, DiagnosticRecord};
