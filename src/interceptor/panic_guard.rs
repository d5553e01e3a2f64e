//! Per-call panic containment
//!
//! [`PanicGuard`] runs one handler invocation so that a panic, whether raised while
//! building the handler future or while polling it, comes back as a
//! [`GuardOutcome::Panicked`] value instead of unwinding into the server.
//!
//! The panic location and backtrace are only available at the moment of the panic, so a
//! process-wide hook records them into thread-local storage while a guarded poll is on
//! the stack. Panics outside guarded code are handed to the previously installed hook.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use tower::BoxError;

use crate::error::detector::panic_message_detector;
use crate::error::{AppError, DiagnosticRecord, PanicShape};
use crate::interceptor::CallContext;

thread_local! {
    static GUARD_DEPTH: Cell<u32> = const { Cell::new(0) };
    static GUARD_BACKTRACE: Cell<bool> = const { Cell::new(true) };
    static CAPTURED: RefCell<Option<PanicCapture>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// What the hook saw at the moment of the panic.
#[derive(Debug, Default)]
struct PanicCapture {
    location: Option<String>,
    backtrace: Option<String>,
}

fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARD_DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let backtrace = GUARD_BACKTRACE
                .with(Cell::get)
                .then(|| Backtrace::force_capture().to_string());
            let capture = PanicCapture {
                location: info.location().map(ToString::to_string),
                backtrace,
            };
            CAPTURED.with(|slot| *slot.borrow_mut() = Some(capture));
        }));
    });
}

fn take_capture() -> PanicCapture {
    CAPTURED
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_default()
}

/// Marks the current thread as running guarded code until dropped.
struct GuardScope {
    previous_backtrace: bool,
}

impl GuardScope {
    fn enter(capture_backtrace: bool) -> Self {
        let depth = GUARD_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth
        });
        if depth == 0 {
            CAPTURED.with(|slot| slot.borrow_mut().take());
        }
        let previous_backtrace = GUARD_BACKTRACE.with(|b| b.replace(capture_backtrace));
        Self { previous_backtrace }
    }
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        GUARD_BACKTRACE.with(|b| b.set(self.previous_backtrace));
    }
}

/// A panic recovered from a guarded handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredPanic {
    /// Type of the panic payload.
    pub type_name: &'static str,
    /// Text of the payload, or a placeholder for opaque payloads.
    pub message: String,
    /// Best-effort shape of the payload.
    pub shape: PanicShape,
    /// Where the panic was raised.
    pub location: Option<String>,
    /// Backtrace captured when the panic was raised.
    pub backtrace: Option<String>,
}

impl RecoveredPanic {
    fn from_payload(payload: Box<dyn Any + Send>, capture: PanicCapture) -> Self {
        let (type_name, message, shape) = describe_payload(payload.as_ref());
        Self {
            type_name,
            message,
            shape,
            location: capture.location,
            backtrace: capture.backtrace,
        }
    }

    /// Builds the diagnostic record for this panic.
    pub fn diagnostic(&self, ctx: &CallContext) -> DiagnosticRecord {
        let mut record =
            DiagnosticRecord::for_panic(ctx, self.type_name, self.message.clone(), self.shape);
        if let Some(location) = &self.location {
            record = record.with_location(location.clone());
        }
        if let Some(backtrace) = &self.backtrace {
            record = record.with_trace(backtrace.lines().map(str::to_string).collect());
        }
        record
    }
}

fn describe_payload(payload: &(dyn Any + Send)) -> (&'static str, String, PanicShape) {
    let text_shape = |text: &str| {
        panic_message_detector()
            .category_of(text)
            .unwrap_or(PanicShape::Message)
    };

    if let Some(text) = payload.downcast_ref::<&'static str>() {
        return ("&str", text.to_string(), text_shape(text));
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return ("String", text.clone(), text_shape(text));
    }
    if let Some(error) = payload.downcast_ref::<BoxError>() {
        return (
            "Box<dyn Error + Send + Sync>",
            error.to_string(),
            PanicShape::RuntimeFault,
        );
    }
    if let Some(error) = payload.downcast_ref::<std::io::Error>() {
        return ("std::io::Error", error.to_string(), PanicShape::RuntimeFault);
    }
    if let Some(status) = payload.downcast_ref::<tonic::Status>() {
        return (
            "tonic::Status",
            status.message().to_string(),
            PanicShape::RuntimeFault,
        );
    }
    if let Some(error) = payload.downcast_ref::<AppError>() {
        return ("callguard::AppError", error.message(), PanicShape::RuntimeFault);
    }
    (
        "Box<dyn Any + Send>",
        "<non-text panic payload>".to_string(),
        PanicShape::Opaque,
    )
}

/// Result of a guarded invocation.
#[derive(Debug)]
pub enum GuardOutcome<T> {
    /// The handler ran to completion.
    Completed(T),
    /// The handler panicked.
    Panicked(RecoveredPanic),
}

impl<T> GuardOutcome<T> {
    /// Returns true if the handler panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, GuardOutcome::Panicked(_))
    }
}

/// Contains panics raised by one handler invocation.
#[derive(Debug, Clone, Copy)]
pub struct PanicGuard {
    capture_backtrace: bool,
}

impl Default for PanicGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl PanicGuard {
    /// Creates a guard that captures backtraces.
    pub fn new() -> Self {
        install_hook();
        Self {
            capture_backtrace: true,
        }
    }

    /// Sets whether a backtrace is captured for each panic.
    pub fn with_backtrace(mut self, enabled: bool) -> Self {
        self.capture_backtrace = enabled;
        self
    }

    /// Starts the invocation: `start` builds the handler future, and both it and every
    /// poll of the future run under the guard.
    pub fn run<F, Fut>(&self, start: F) -> Guarded<Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let started = {
            let _scope = GuardScope::enter(self.capture_backtrace);
            panic::catch_unwind(AssertUnwindSafe(start))
        };
        let state = match started {
            Ok(future) => GuardedState::Running(Box::pin(future)),
            Err(payload) => GuardedState::Panicked(Some(RecoveredPanic::from_payload(
                payload,
                take_capture(),
            ))),
        };
        Guarded {
            state,
            capture_backtrace: self.capture_backtrace,
        }
    }
}

enum GuardedState<Fut> {
    Running(Pin<Box<Fut>>),
    Panicked(Option<RecoveredPanic>),
    Done,
}

/// Future returned by [`PanicGuard::run`].
pub struct Guarded<Fut> {
    state: GuardedState<Fut>,
    capture_backtrace: bool,
}

impl<Fut: Future> Future for Guarded<Fut> {
    type Output = GuardOutcome<Fut::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            GuardedState::Running(future) => {
                let polled = {
                    let _scope = GuardScope::enter(this.capture_backtrace);
                    panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)))
                };
                match polled {
                    Ok(Poll::Pending) => Poll::Pending,
                    Ok(Poll::Ready(output)) => {
                        this.state = GuardedState::Done;
                        Poll::Ready(GuardOutcome::Completed(output))
                    }
                    Err(payload) => {
                        this.state = GuardedState::Done;
                        Poll::Ready(GuardOutcome::Panicked(RecoveredPanic::from_payload(
                            payload,
                            take_capture(),
                        )))
                    }
                }
            }
            GuardedState::Panicked(recovered) => {
                let recovered = recovered.take();
                this.state = GuardedState::Done;
                match recovered {
                    Some(recovered) => Poll::Ready(GuardOutcome::Panicked(recovered)),
                    None => Poll::Pending,
                }
            }
            // Polled after completion.
            GuardedState::Done => Poll::Pending,
        }
    }
}
