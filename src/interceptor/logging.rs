//! Logging interceptor
//!
//! Times each call and writes one summary line once it finishes. The handler's result is
//! forwarded untouched.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tonic::{Code, Status};
use tower::{BoxError, Layer, Service};

use super::UnaryCall;
use crate::logging::sink::write_guarded;
use crate::logging::LogSink;

/// How a call ended, as seen by the logging interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The handler returned a response.
    Ok,
    /// The handler failed. Failures that are not a `tonic::Status` carry
    /// [`Code::Unknown`] and their display text.
    Failed { code: Code, message: String },
}

impl CallOutcome {
    /// Derives the outcome from a handler result.
    pub fn of<T>(result: &Result<T, BoxError>) -> Self {
        match result {
            Ok(_) => CallOutcome::Ok,
            Err(failure) => match failure.downcast_ref::<Status>() {
                Some(status) => CallOutcome::Failed {
                    code: status.code(),
                    message: status.message().to_string(),
                },
                None => CallOutcome::Failed {
                    code: Code::Unknown,
                    message: failure.to_string(),
                },
            },
        }
    }

    /// Returns the status code of the outcome.
    pub fn code(&self) -> Code {
        match self {
            CallOutcome::Ok => Code::Ok,
            CallOutcome::Failed { code, .. } => *code,
        }
    }
}

/// Summary of one finished call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub method: String,
    pub duration: Duration,
    pub outcome: CallOutcome,
}

impl fmt::Display for CallSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[gRPC] method={} duration={:?}",
            self.method, self.duration
        )?;
        match &self.outcome {
            CallOutcome::Ok => write!(f, " status=OK"),
            CallOutcome::Failed { code, message } => {
                write!(f, " status={code:?} error={message}")
            }
        }
    }
}

/// Layer producing [`LoggingService`]s.
#[derive(Clone)]
pub struct LoggingLayer {
    sink: Arc<dyn LogSink>,
    enabled: bool,
}

impl LoggingLayer {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            enabled: true,
        }
    }

    /// A disabled layer forwards calls without timing or logging them.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl fmt::Debug for LoggingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingLayer")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            sink: Arc::clone(&self.sink),
            enabled: self.enabled,
        }
    }
}

/// Service logging the method, duration and outcome of every call.
#[derive(Clone)]
pub struct LoggingService<S> {
    inner: S,
    sink: Arc<dyn LogSink>,
    enabled: bool,
}

impl<S, Req> Service<UnaryCall<Req>> for LoggingService<S>
where
    S: Service<UnaryCall<Req>, Error = BoxError>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: UnaryCall<Req>) -> Self::Future {
        if !self.enabled {
            return Box::pin(self.inner.call(call));
        }
        let method = call.context().method().full_method().to_string();
        let sink = Arc::clone(&self.sink);
        let start = Instant::now();
        let response = self.inner.call(call);

        Box::pin(async move {
            let result = response.await;
            let summary = CallSummary {
                method,
                duration: start.elapsed(),
                outcome: CallOutcome::of(&result),
            };
            write_guarded(|| sink.call_completed(&summary));
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{CallContext, MethodInfo};
    use crate::logging::{LogLevel, LogSink, MemorySink};
    use std::fmt;
    use std::sync::Mutex;
    use tower::{service_fn, ServiceExt};

    #[derive(Default)]
    struct SummarySink(Mutex<Vec<CallSummary>>);

    impl LogSink for SummarySink {
        fn log(&self, _level: LogLevel, _args: fmt::Arguments<'_>) {}

        fn call_completed(&self, summary: &CallSummary) {
            self.0.lock().unwrap().push(summary.clone());
        }
    }

    fn call() -> UnaryCall<u32> {
        UnaryCall::new(
            CallContext::new(MethodInfo::new("/billing.v1.Invoices/Get", "InvoiceService")),
            7,
        )
    }

    #[test]
    fn test_summary_format() {
        let ok = CallSummary {
            method: "/billing.v1.Invoices/Get".to_string(),
            duration: Duration::from_millis(12),
            outcome: CallOutcome::Ok,
        };
        assert_eq!(
            ok.to_string(),
            "[gRPC] method=/billing.v1.Invoices/Get duration=12ms status=OK"
        );

        let failed = CallSummary {
            outcome: CallOutcome::Failed {
                code: Code::InvalidArgument,
                message: "invalid json".to_string(),
            },
            ..ok
        };
        assert_eq!(
            failed.to_string(),
            "[gRPC] method=/billing.v1.Invoices/Get duration=12ms status=InvalidArgument error=invalid json"
        );
    }

    #[test]
    fn test_outcome_of_plain_error() {
        let result: Result<(), BoxError> = Err("socket closed".into());
        let outcome = CallOutcome::of(&result);
        assert_eq!(outcome.code(), Code::Unknown);
        assert_eq!(
            outcome,
            CallOutcome::Failed {
                code: Code::Unknown,
                message: "socket closed".to_string()
            }
        );
        assert_eq!(CallOutcome::of(&Ok::<_, BoxError>(1)).code(), Code::Ok);
    }

    #[tokio::test]
    async fn test_success_logged_at_info() {
        let sink = Arc::new(MemorySink::new());
        let svc = LoggingLayer::new(sink.clone()).layer(service_fn(|call: UnaryCall<u32>| {
            async move { Ok::<_, BoxError>(*call.request() * 2) }
        }));

        assert_eq!(svc.oneshot(call()).await.unwrap(), 14);

        let info = sink.messages_at(LogLevel::Info);
        assert_eq!(info.len(), 1);
        assert!(info[0].starts_with("[gRPC] method=/billing.v1.Invoices/Get duration="));
        assert!(info[0].ends_with("status=OK"));
        assert!(sink.messages_at(LogLevel::Error).is_empty());
    }

    #[tokio::test]
    async fn test_failure_forwarded_unchanged() {
        let sink = Arc::new(MemorySink::new());
        let svc = LoggingLayer::new(sink.clone()).layer(service_fn(|_call: UnaryCall<u32>| {
            async move { Err::<u32, BoxError>(Box::new(Status::not_found("invoice 7"))) }
        }));

        let failure = svc.oneshot(call()).await.unwrap_err();
        let status = failure.downcast_ref::<Status>().unwrap();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "invoice 7");

        let errors = sink.messages_at(LogLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("status=NotFound error=invoice 7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_covers_handler() {
        let sink = Arc::new(SummarySink::default());
        let svc = LoggingLayer::new(sink.clone()).layer(service_fn(|_call: UnaryCall<u32>| {
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, BoxError>(())
            }
        }));

        svc.oneshot(call()).await.unwrap();
        let summaries = sink.0.lock().unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].duration >= Duration::from_millis(50));
    }
}
