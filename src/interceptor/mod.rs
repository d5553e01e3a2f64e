//! Unary call interceptors
//!
//! Handlers and interceptors are `tower` services over [`UnaryCall`] whose failure channel
//! is [`tower::BoxError`]. The error interceptor guarantees the failure leaving it is a
//! boxed `tonic::Status`; [`into_status`] recovers it at the edge of the chain.

pub mod chain;
pub mod context;
pub mod error;
pub mod logging;
pub mod panic_guard;

use tonic::Status;
use tower::BoxError;

use crate::error::AppError;

pub use chain::{ChainBuilder, InterceptorChain};
pub use context::{
    parse_grpc_timeout, CallContext, CancelReason, MethodInfo, UnaryCall, GRPC_TIMEOUT_HEADER,
};
pub use error::{ErrorLayer, ErrorService};
pub use logging::{CallOutcome, CallSummary, LoggingLayer, LoggingService};
pub use panic_guard::{GuardOutcome, Guarded, PanicGuard, RecoveredPanic};

/// Converts a chain failure into the status sent to the caller.
///
/// Failures that never went through the error interceptor are not trusted: anything other
/// than a `Status` or an [`AppError`] becomes the masked internal error.
pub fn into_status(failure: BoxError) -> Status {
    match failure.downcast::<Status>() {
        Ok(status) => *status,
        Err(failure) => match failure.downcast::<AppError>() {
            Ok(error) => error.to_status(),
            Err(_) => AppError::internal_server().to_status(),
        },
    }
}
