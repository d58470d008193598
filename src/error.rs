//! Error types and error handling strategy for effect-fiber.
//!
//! Every failure that flows through a fiber is an [`Error`]. Error handling
//! follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Host faults (panics inside user code) are caught at the step boundary
//!   and converted to [`ErrorKind::ExternalFault`]
//! - Interrupts are ordinary values of kind [`ErrorKind::Interrupted`] (or
//!   [`ErrorKind::ParallelAborted`]) so they can flow through release
//!   handlers and completion listeners
//!
//! # Error Categories
//!
//! - **Fault**: host faults raised by user code
//! - **Program**: failures raised explicitly by the effect program
//! - **Cancellation**: interrupts delivered by `kill`
//! - **Internal**: runtime invariant breaches and configuration errors

use core::fmt;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use crate::types::FiberId;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// A panic escaped user code (a thunk, continuation, handler or
    /// registration function).
    ExternalFault,
    /// The program failed explicitly.
    Failure,
    /// An asynchronous operation reported failure through its resolver.
    AsyncFailure,
    /// The fiber was killed.
    Interrupted,
    /// A parallel branch was cancelled because its sibling decided the
    /// result first.
    ParallelAborted,
    /// An awaited operation exceeded its deadline.
    TimedOut,
    /// Runtime invariant breach (for example a value of the wrong type
    /// reaching a typed boundary).
    Internal,
    /// Invalid runtime configuration.
    Config,
}

impl ErrorKind {
    /// Returns the category for this error kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::ExternalFault => ErrorCategory::Fault,
            Self::Failure | Self::AsyncFailure | Self::TimedOut => ErrorCategory::Program,
            Self::Interrupted | Self::ParallelAborted => ErrorCategory::Cancellation,
            Self::Internal | Self::Config => ErrorCategory::Internal,
        }
    }

    /// Returns true if this kind describes an interrupt.
    #[must_use]
    pub const fn is_interrupt(&self) -> bool {
        matches!(self.category(), ErrorCategory::Cancellation)
    }

    /// Returns a stable lowercase name for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalFault => "external_fault",
            Self::Failure => "failure",
            Self::AsyncFailure => "async_failure",
            Self::Interrupted => "interrupted",
            Self::ParallelAborted => "parallel_aborted",
            Self::TimedOut => "timed_out",
            Self::Internal => "internal",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// High-level error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCategory {
    /// Host faults.
    Fault,
    /// Program-level failures.
    Program,
    /// Interrupts.
    Cancellation,
    /// Runtime bugs and configuration.
    Internal,
}

/// The main error type for effect-fiber operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    trace: Option<Arc<str>>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    fiber: Option<FiberId>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            trace: None,
            source: None,
            fiber: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns true if this error is an interrupt.
    #[must_use]
    pub const fn is_interrupt(&self) -> bool {
        self.kind.is_interrupt()
    }

    /// Returns true if this error is a host fault.
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        matches!(self.kind, ErrorKind::ExternalFault)
    }

    /// Adds a message to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Attaches a diagnostic trace.
    #[must_use]
    pub fn with_trace(mut self, trace: impl Into<Arc<str>>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Records the fiber the error was observed on.
    #[must_use]
    pub const fn with_fiber(mut self, fiber: FiberId) -> Self {
        self.fiber = Some(fiber);
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the diagnostic trace, if one was captured.
    #[must_use]
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    /// Returns the fiber the error was observed on, if recorded.
    #[must_use]
    pub const fn fiber(&self) -> Option<FiberId> {
        self.fiber
    }

    /// An explicit program failure.
    #[must_use]
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failure).with_message(msg)
    }

    /// A failure delivered by an asynchronous operation.
    #[must_use]
    pub fn async_failure(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::AsyncFailure).with_message(msg)
    }

    /// A host fault with the given description.
    #[must_use]
    pub fn external_fault(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalFault).with_message(msg)
    }

    /// An interrupt carrying the given reason.
    #[must_use]
    pub fn interrupted(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interrupted).with_message(reason)
    }

    /// The interrupt used to cancel the losing or doomed side of a
    /// parallel composition.
    #[must_use]
    pub fn parallel_aborted() -> Self {
        Self::new(ErrorKind::ParallelAborted).with_message("[par] early exit")
    }

    /// A deadline was exceeded.
    #[must_use]
    pub fn timed_out(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut).with_message(msg)
    }

    /// Internal runtime error.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    /// Converts a panic payload into a host fault.
    ///
    /// The diagnostic trace is attached when backtraces are enabled for the
    /// process (`RUST_BACKTRACE`).
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let err = Self::external_fault(msg);
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            err.with_trace(backtrace.to_string())
        } else {
            err
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for effect-fiber operations.
#[allow(clippy::result_large_err)]
pub type Result<T> = core::result::Result<T, Error>;

/// Runs user code, converting an escaping panic into an
/// [`ErrorKind::ExternalFault`].
pub(crate) fn catch_fault<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(Error::from_panic(payload.as_ref())),
    }
}
