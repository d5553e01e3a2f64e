//! Callguard - error-classifying and logging interceptors for tonic gRPC servers
//!
//! Every unary call runs through an [`InterceptorChain`]: a logging interceptor that
//! records method, duration and outcome, wrapped around an error interceptor that turns
//! any handler failure, panics included, into one of a small set of caller-safe statuses.
//! Unrecognised failures are masked for the caller and described in full to the log sink.
//!
//! The [`server`] module owns the process side: binding, registration, graceful shutdown
//! and cleanup.

pub mod config;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod server;

pub use config::{CallguardConfig, ErrorSettings};
pub use error::{classify, AppError, Classification, Classifier, ErrorKind};
pub use interceptor::{into_status, CallContext, InterceptorChain, MethodInfo, UnaryCall};
pub use logging::{LogSink, MemorySink, TracingSink};
pub use server::{GrpcServer, ServerError};
