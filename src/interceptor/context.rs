//! Per-call metadata shared by every interceptor in a chain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;

/// Metadata header carrying the client's timeout.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Identifies the method being called and the service that owns it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    full_method: String,
    owner: String,
}

impl MethodInfo {
    /// Creates method metadata from a full method name (`/package.Service/Method`) and the
    /// owning service's name.
    pub fn new(full_method: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            full_method: full_method.into(),
            owner: owner.into(),
        }
    }

    /// Creates method metadata using the type name of `S` as the owner.
    pub fn for_service<S: ?Sized>(full_method: impl Into<String>) -> Self {
        Self::new(full_method, std::any::type_name::<S>())
    }

    /// Returns the full method name, used verbatim in logs.
    pub fn full_method(&self) -> &str {
        &self.full_method
    }

    /// Returns the owning service's name.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the `package.Service` part of the full method name.
    pub fn service(&self) -> Option<&str> {
        self.split().map(|(service, _)| service)
    }

    /// Returns the bare method name.
    pub fn method(&self) -> Option<&str> {
        self.split().map(|(_, method)| method)
    }

    fn split(&self) -> Option<(&str, &str)> {
        self.full_method
            .strip_prefix('/')
            .and_then(|rest| rest.split_once('/'))
    }
}

impl fmt::Display for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_method)
    }
}

/// Why a call stopped being wanted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The call was cancelled explicitly.
    Canceled,
    /// The call's deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Canceled => f.write_str("context canceled"),
            CancelReason::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

/// Metadata for one in-flight call.
///
/// Interceptors only read the context: the deadline and cancellation state are consulted
/// to enrich diagnostics and never alter control flow.
#[derive(Clone, Debug)]
pub struct CallContext {
    method: Arc<MethodInfo>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallContext {
    /// Creates a context with no deadline and a fresh cancellation token.
    pub fn new(method: MethodInfo) -> Self {
        Self {
            method: Arc::new(method),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Creates a context from request metadata, reading the `grpc-timeout` header.
    pub fn from_metadata(method: MethodInfo, metadata: &MetadataMap) -> Self {
        let timeout = metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout);
        let ctx = Self::new(method);
        match timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Returns the method metadata.
    pub fn method(&self) -> &MethodInfo {
        &self.method
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the time left until the deadline, zero once it passed.
    pub fn deadline_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the cancellation token for this call.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Reports whether, and why, the call is no longer wanted.
    pub fn cancellation_reason(&self) -> Option<CancelReason> {
        if self.cancellation.is_cancelled() {
            return Some(CancelReason::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }
}

/// Parses a `grpc-timeout` header value such as `100m` or `5S`.
///
/// Returns `None` for anything outside the wire format (empty, more than eight digits,
/// unknown unit).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// One unary call travelling through the interceptor chain.
#[derive(Debug)]
pub struct UnaryCall<Req> {
    ctx: CallContext,
    request: Req,
}

impl<Req> UnaryCall<Req> {
    /// Creates a call from a context and a decoded request message.
    pub fn new(ctx: CallContext, request: Req) -> Self {
        Self { ctx, request }
    }

    /// Creates a call from a tonic request, deriving the deadline from its metadata.
    pub fn from_tonic(request: tonic::Request<Req>, method: MethodInfo) -> Self {
        let ctx = CallContext::from_metadata(method, request.metadata());
        Self::new(ctx, request.into_inner())
    }

    /// Returns the call context.
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Returns the request message.
    pub fn request(&self) -> &Req {
        &self.request
    }

    /// Splits the call into its context and request.
    pub fn into_parts(self) -> (CallContext, Req) {
        (self.ctx, self.request)
    }
}
