//! Tracing compatibility layer for structured logging.
//!
//! This module provides a unified interface for logging that works whether or
//! not the `tracing-integration` feature is enabled:
//!
//! - **With feature enabled**: Re-exports from the `tracing` crate.
//! - **Without feature**: No-op macros that compile to nothing.
//!
//! # Usage
//!
//! ```rust,ignore
//! use effect_fiber::tracing_compat::{debug, trace};
//!
//! // These compile to no-ops when tracing-integration is disabled
//! trace!(fiber = %id, "fiber suspended");
//! debug!(fiber = %id, cause = %err, "kill requested");
//! ```
//!
//! # Levels used by the runtime
//!
//! | Level | Events |
//! |-------|--------|
//! | `trace` | step transitions, stale completions, scheduler overflow |
//! | `debug` | fiber start and completion, kills, supervisor bulk kills |
//! | `warn` | failures raised by release handlers and finalizers |
//! | `error` | unhandled fiber failures, panicking listeners |
//!
//! Fault reports (the `warn` and `error` rows) go through `fault_event!`,
//! which writes to stderr when the `tracing-integration` feature is off.

#[cfg(feature = "tracing-integration")]
pub use tracing::{Level, debug, error, info, trace, warn};

// When tracing is disabled, provide no-op macros
#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op implementations when tracing is disabled.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

/// Reports a fiber fault that must never vanish silently.
///
/// Goes through `tracing` when it is compiled in and falls back to stderr
/// otherwise.
#[cfg(feature = "tracing-integration")]
macro_rules! fault_event {
    (error, $fiber:expr, $err:expr, $msg:literal) => {
        ::tracing::error!(fiber = %$fiber, error = %$err, $msg)
    };
    (warn, $fiber:expr, $err:expr, $msg:literal) => {
        ::tracing::warn!(fiber = %$fiber, error = %$err, $msg)
    };
}

#[cfg(not(feature = "tracing-integration"))]
macro_rules! fault_event {
    ($level:ident, $fiber:expr, $err:expr, $msg:literal) => {
        ::std::eprintln!(
            concat!("effect-fiber ", stringify!($level), ": ", $msg, " fiber={} error={}"),
            $fiber,
            $err
        )
    };
}

pub(crate) use fault_event;

/// Stand-in for `tracing::Level` when tracing is disabled.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Trace level.
    TRACE,
    /// Debug level.
    DEBUG,
    /// Info level.
    INFO,
    /// Warn level.
    WARN,
    /// Error level.
    ERROR,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_accept_structured_fields() {
        let id = 3_u64;
        trace!(fiber = %id, "trace event");
        debug!(fiber = id, cause = "boom", "debug event");
        info!("info event");
        warn!(reason = ?Some(1), "warn event");
        error!(fiber = %id, "error event");
        let _ = id;
    }

    #[test]
    fn level_is_available() {
        let level = Level::DEBUG;
        assert_eq!(level, Level::DEBUG);
    }
}
