//! Test utilities for effect-fiber.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Outcome slots that capture a fiber's result across threads
//! - Hand-driven asynchronous operations ([`AsyncProbe`])
//! - A runtime whose unhandled faults are recorded instead of logged
//! - An in-memory log sink ([`LogCapture`])
//!
//! # Example
//! ```
//! use effect_fiber::test_utils::{init_test_logging, OutcomeSlot};
//! use effect_fiber::{Effect, Runtime};
//!
//! init_test_logging();
//! let runtime = Runtime::new();
//! let slot = OutcomeSlot::new();
//! let _fiber = runtime.run_with(Effect::pure(1_u8), slot.sink());
//! assert_eq!(slot.take().unwrap().unwrap(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing_subscriber::fmt::format::FmtSpan;

use crate::effect::{Canceler, Effect, Resolver};
use crate::error::{Error, Result};
use crate::runtime::{Runtime, RuntimeBuilder, UnhandledFaultPolicy};
use crate::types::FiberValue;

static INIT_LOGGING: Once = Once::new();
static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// How long [`OutcomeSlot::take`] waits for an outcome.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Acquire the global environment lock for tests that read env vars.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock()
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

struct SlotState<T> {
    outcome: Option<Result<T>>,
    deliveries: usize,
}

/// Captures the outcome delivered to a completion callback.
pub struct OutcomeSlot<T> {
    state: Arc<(Mutex<SlotState<T>>, Condvar)>,
}

impl<T> Clone for OutcomeSlot<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl OutcomeSlot<()> {
    /// A kill acknowledgement storing `Ok(())` in this slot.
    pub fn ack(&self) -> impl FnOnce() + Send + 'static {
        let sink = self.sink();
        move || sink(Ok(()))
    }
}

impl<T: Send + 'static> Default for OutcomeSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> OutcomeSlot<T> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new((
                Mutex::new(SlotState {
                    outcome: None,
                    deliveries: 0,
                }),
                Condvar::new(),
            )),
        }
    }

    /// A callback storing its argument in this slot.
    pub fn sink(&self) -> impl FnOnce(Result<T>) + Send + 'static {
        let state = Arc::clone(&self.state);
        move |outcome| {
            let (lock, cvar) = &*state;
            let mut guard = lock.lock();
            guard.deliveries += 1;
            guard.outcome = Some(outcome);
            cvar.notify_all();
        }
    }

    /// Waits up to `timeout` for an outcome and removes it.
    pub fn wait(&self, timeout: Duration) -> Option<Result<T>> {
        let (lock, cvar) = &*self.state;
        let deadline = Instant::now() + timeout;
        let mut guard = lock.lock();
        while guard.outcome.is_none() {
            if cvar.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        guard.outcome.take()
    }

    /// Waits up to [`DEFAULT_WAIT`] for an outcome and removes it.
    pub fn take(&self) -> Option<Result<T>> {
        self.wait(DEFAULT_WAIT)
    }

    /// Number of times the sink has been invoked.
    #[must_use]
    pub fn deliveries(&self) -> usize {
        self.state.0.lock().deliveries
    }
}

impl<T: Clone + Send + 'static> OutcomeSlot<T> {
    /// Returns a copy of the outcome without waiting or removing it.
    #[must_use]
    pub fn get(&self) -> Option<Result<T>> {
        self.state.0.lock().outcome.clone()
    }
}

struct ProbeState<T> {
    resolvers: Vec<Resolver<T>>,
    cancellations: usize,
    registrations: usize,
}

/// An asynchronous operation completed by hand.
///
/// Every fiber running [`effect`](Self::effect) registers a resolver with
/// the probe; [`resolve`](Self::resolve) completes all of them. Killing a
/// fiber suspended on the probe counts as a cancellation.
pub struct AsyncProbe<T> {
    state: Arc<Mutex<ProbeState<T>>>,
}

impl<T> Clone for AsyncProbe<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: FiberValue> Default for AsyncProbe<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FiberValue> AsyncProbe<T> {
    /// Creates a probe with no registrations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProbeState {
                resolvers: Vec::new(),
                cancellations: 0,
                registrations: 0,
            })),
        }
    }

    /// An effect that suspends until the probe is resolved.
    pub fn effect(&self) -> Effect<T> {
        let state = Arc::clone(&self.state);
        Effect::async_effect(move |resolver| {
            {
                let mut guard = state.lock();
                guard.registrations += 1;
                guard.resolvers.push(resolver);
            }
            Ok(Canceler::from_fn(move || {
                state.lock().cancellations += 1;
            }))
        })
    }

    /// Delivers `outcome` to every registered resolver. Returns false if
    /// nothing has registered yet.
    pub fn resolve(&self, outcome: Result<T>) -> bool {
        let resolvers = self.state.lock().resolvers.clone();
        if resolvers.is_empty() {
            return false;
        }
        for resolver in resolvers {
            resolver.resolve(outcome.clone());
        }
        true
    }

    /// Number of cancellations run so far.
    #[must_use]
    pub fn cancellations(&self) -> usize {
        self.state.lock().cancellations
    }

    /// Number of registrations so far.
    #[must_use]
    pub fn registrations(&self) -> usize {
        self.state.lock().registrations
    }
}

/// Unhandled faults recorded by [`runtime_with_fault_log`].
#[derive(Clone, Default)]
pub struct FaultLog {
    faults: Arc<Mutex<Vec<Error>>>,
}

impl FaultLog {
    /// Removes and returns the recorded faults.
    #[must_use]
    pub fn take(&self) -> Vec<Error> {
        std::mem::take(&mut *self.faults.lock())
    }

    /// Number of recorded faults.
    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.lock().is_empty()
    }
}

/// A runtime that records unhandled faults instead of logging them.
#[must_use]
pub fn runtime_with_fault_log() -> (Runtime, FaultLog) {
    let log = FaultLog::default();
    let sink = Arc::clone(&log.faults);
    let runtime = RuntimeBuilder::new()
        .unhandled_fault_policy(UnhandledFaultPolicy::Ignore)
        .fault_hook(move |_, err| sink.lock().push(err.clone()))
        .build()
        .unwrap_or_default();
    (runtime, log)
}

/// Counts how many times a callback ran.
#[derive(Clone, Default)]
pub struct HitCounter(Arc<AtomicUsize>);

impl HitCounter {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one hit.
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Hits recorded so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-memory log sink for asserting on emitted events.
///
/// Only events raised on the thread running [`LogCapture::scoped`] are
/// captured.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Creates an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with a subscriber that formats every event into this
    /// capture.
    pub fn scoped<R>(&self, f: impl FnOnce() -> R) -> R {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    /// Everything captured so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
