//! effect-fiber: a cancel-correct fiber runtime for effect programs.
//!
//! # Overview
//!
//! An [`Effect`] is an immutable description of a suspendable computation.
//! A [`Fiber`] executes one effect with a trampolined state machine: it runs
//! synchronously on whichever thread drives it until the program suspends on
//! an asynchronous registration or finishes. External completions re-enter
//! the fiber from the thread they occur on.
//!
//! # Core Guarantees
//!
//! - **Single delivery**: every fiber produces exactly one outcome; stale or
//!   duplicate async completions are discarded by a generation guard
//! - **Release always runs**: the release handlers of a bracket run exactly
//!   once, uninterrupted, whether the body completed, failed or was killed
//! - **Cancellation wins**: recovery handlers never swallow an unmasked
//!   interrupt
//! - **No silent failures**: unobserved fiber failures are reported on a
//!   detached execution context
//! - **Structured parallelism**: [`Par`] trees fork one fiber per leaf and
//!   cancel losing or doomed branches before propagating a result
//!
//! # Module Structure
//!
//! - [`effect`]: Effect programs, parallel composition trees, bracket conditions
//! - [`fiber`]: Fiber handles and the trampoline interpreter
//! - [`supervisor`]: Registries of child fibers supporting bulk cancellation
//! - [`runtime`]: Runtime context, scheduler, configuration
//! - [`combinator`]: Derived effects (delay, timeout, race, supervise, ...)
//! - [`types`]: Identifiers and the erased value carrier
//! - [`error`](mod@error): Error types
//! - [`tracing_compat`]: Tracing integration behind the default `tracing-integration` feature

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::significant_drop_tightening)]

pub mod combinator;
pub mod effect;
pub mod error;
pub mod fiber;
mod parallel;
pub mod runtime;
pub mod supervisor;
pub mod tracing_compat;
pub mod types;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use combinator::{both, delay, par_all, par_traverse, race, supervise, timeout};
pub use effect::{BracketConditions, Canceler, Effect, Par, ParFn, Resolver};
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use fiber::{Fiber, FiberRef, FiberSnapshot, FiberStatus, Listener, ListenerToken};
pub use runtime::{
    ConfigError, Runtime, RuntimeBuilder, RuntimeConfig, Scheduler, StatsSnapshot,
    UnhandledFaultPolicy,
};
pub use supervisor::Supervisor;
pub use types::{AnyValue, FiberId, FiberValue, SupervisorId};
