//! Ordered interceptor chain
//!
//! The chain composes the two interceptors in a fixed order: logging outermost, the error
//! interceptor innermost. Logging therefore observes the already normalised status, and a
//! recovered panic is logged as an internal error.

use std::future::Future;
use std::sync::Arc;

use tonic::Status;
use tower::{service_fn, BoxError, Layer, ServiceExt};

use super::error::{ErrorLayer, ErrorService};
use super::logging::{LoggingLayer, LoggingService};
use super::{into_status, UnaryCall};
use crate::config::ErrorSettings;
use crate::error::Classifier;
use crate::logging::LogSink;

/// The interceptor chain installed on a server.
///
/// ```
/// use std::sync::Arc;
/// use callguard::interceptor::{CallContext, InterceptorChain, MethodInfo, UnaryCall};
/// use callguard::logging::MemorySink;
/// use callguard::AppError;
///
/// # #[tokio::main]
/// # async fn main() {
/// let sink = Arc::new(MemorySink::new());
/// let chain = InterceptorChain::builder(sink.clone()).build();
///
/// let ctx = CallContext::new(MethodInfo::new("/users.v1.Users/Create", "UserService"));
/// let status = chain
///     .invoke(UnaryCall::new(ctx, "bob"), |_call| async {
///         Err::<(), tower::BoxError>(Box::new(AppError::bad_request("name taken")))
///     })
///     .await
///     .unwrap_err();
///
/// assert_eq!(status.message(), "name taken");
/// assert!(sink.contains("status=InvalidArgument error=name taken"));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InterceptorChain {
    logging: LoggingLayer,
    errors: ErrorLayer,
}

/// Builder for [`InterceptorChain`].
pub struct ChainBuilder {
    sink: Arc<dyn LogSink>,
    logging: bool,
    settings: ErrorSettings,
    classifier: Option<Classifier>,
}

impl ChainBuilder {
    /// Turns the per-call summary line on or off. On by default.
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Applies error interceptor settings.
    pub fn errors(mut self, settings: ErrorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Uses a custom classifier in the error interceptor.
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> InterceptorChain {
        let mut errors = ErrorLayer::from_settings(Arc::clone(&self.sink), &self.settings);
        if let Some(classifier) = self.classifier {
            errors = errors.with_classifier(classifier);
        }
        InterceptorChain {
            logging: LoggingLayer::new(self.sink).enabled(self.logging),
            errors,
        }
    }
}

impl InterceptorChain {
    /// Starts a chain writing to `sink`.
    pub fn builder(sink: Arc<dyn LogSink>) -> ChainBuilder {
        ChainBuilder {
            sink,
            logging: true,
            settings: ErrorSettings::default(),
            classifier: None,
        }
    }

    /// Chain with default settings.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self::builder(sink).build()
    }

    /// Runs one call through the chain and `handler`, producing what the caller receives.
    pub async fn invoke<Req, Resp, H, Fut>(
        &self,
        call: UnaryCall<Req>,
        handler: H,
    ) -> Result<Resp, Status>
    where
        H: FnMut(UnaryCall<Req>) -> Fut,
        Fut: Future<Output = Result<Resp, BoxError>> + Send + 'static,
        Resp: Send + 'static,
    {
        self.layer(service_fn(handler))
            .oneshot(call)
            .await
            .map_err(into_status)
    }
}

impl<S> Layer<S> for InterceptorChain {
    type Service = LoggingService<ErrorService<S>>;

    fn layer(&self, handler: S) -> Self::Service {
        self.logging.layer(self.errors.layer(handler))
    }
}
