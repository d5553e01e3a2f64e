//! Error interceptor
//!
//! Runs the wrapped handler under a [`PanicGuard`] and normalises every failure into a
//! boxed `tonic::Status`:
//!
//! - a recovered panic becomes the masked internal error directly, without going through
//!   cause matching
//! - a failure that already is a `tonic::Status` is returned as is
//! - anything else goes through the [`Classifier`]; masked failures have their diagnostic
//!   written to the sink
//!
//! Successful responses pass through untouched. No retries are attempted.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tonic::Status;
use tower::{BoxError, Layer, Service};

use super::panic_guard::{GuardOutcome, PanicGuard};
use super::{CallContext, UnaryCall};
use crate::config::ErrorSettings;
use crate::error::Classifier;
use crate::logging::sink::write_guarded;
use crate::logging::LogSink;

/// Layer producing [`ErrorService`]s.
#[derive(Clone)]
pub struct ErrorLayer {
    classifier: Classifier,
    guard: PanicGuard,
    sink: Arc<dyn LogSink>,
}

impl ErrorLayer {
    /// Creates a layer with default settings writing diagnostics to `sink`.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            classifier: Classifier::new(),
            guard: PanicGuard::new(),
            sink,
        }
    }

    /// Creates a layer from configuration.
    pub fn from_settings(sink: Arc<dyn LogSink>, settings: &ErrorSettings) -> Self {
        Self {
            classifier: Classifier::new().with_internal_message(settings.internal_message()),
            guard: PanicGuard::new().with_backtrace(settings.capture_backtrace),
            sink,
        }
    }

    /// Replaces the classifier.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }
}

impl std::fmt::Debug for ErrorLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorLayer")
            .field("classifier", &self.classifier)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for ErrorLayer {
    type Service = ErrorService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorService {
            inner,
            classifier: self.classifier.clone(),
            guard: self.guard,
            sink: Arc::clone(&self.sink),
        }
    }
}

/// Service normalising the failures of its inner handler.
#[derive(Clone)]
pub struct ErrorService<S> {
    inner: S,
    classifier: Classifier,
    guard: PanicGuard,
    sink: Arc<dyn LogSink>,
}

impl<S, Req> Service<UnaryCall<Req>> for ErrorService<S>
where
    S: Service<UnaryCall<Req>, Error = BoxError>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: UnaryCall<Req>) -> Self::Future {
        let ctx = call.context().clone();
        let inner = &mut self.inner;
        let guarded = self.guard.run(|| inner.call(call));
        let classifier = self.classifier.clone();
        let sink = Arc::clone(&self.sink);

        Box::pin(async move {
            match guarded.await {
                GuardOutcome::Completed(Ok(response)) => Ok(response),
                GuardOutcome::Completed(Err(failure)) => {
                    Err(normalize(&classifier, sink.as_ref(), failure, &ctx))
                }
                GuardOutcome::Panicked(recovered) => {
                    let record = recovered.diagnostic(&ctx);
                    write_guarded(|| sink.diagnostic(&record));
                    Err(Box::new(classifier.internal_error().to_status()) as BoxError)
                }
            }
        })
    }
}

/// Turns a handler failure into a boxed status, logging masked detail.
fn normalize(
    classifier: &Classifier,
    sink: &dyn LogSink,
    failure: BoxError,
    ctx: &CallContext,
) -> BoxError {
    if failure.is::<Status>() {
        return failure;
    }
    let classification = classifier.classify(failure.as_ref(), ctx);
    if let Some(record) = &classification.diagnostic {
        write_guarded(|| sink.diagnostic(record));
    }
    Box::new(classification.into_status())
}
