//! Runtime context: configuration, scheduler, identifiers and fault
//! reporting shared by every fiber it creates.
//!
//! # Quick Start
//!
//! ```
//! use effect_fiber::{Effect, Runtime};
//!
//! let runtime = Runtime::new();
//! let answer = runtime.block_on(Effect::pure(20).map(|x: i32| x + 22));
//! assert_eq!(answer.unwrap(), 42);
//! ```
//!
//! Use [`RuntimeBuilder`] for custom configuration:
//!
//! ```
//! use effect_fiber::{RuntimeBuilder, UnhandledFaultPolicy};
//!
//! let runtime = RuntimeBuilder::new()
//!     .scheduler_queue_limit(256)
//!     .unhandled_fault_policy(UnhandledFaultPolicy::Ignore)
//!     .build()
//!     .unwrap();
//! assert_eq!(runtime.config().scheduler_queue_limit, 256);
//! ```

pub mod builder;
pub mod config;
pub mod env_config;
pub mod scheduler;

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

use serde::Serialize;

use crate::effect::Effect;
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberRef};
use crate::supervisor::Supervisor;
use crate::tracing_compat::{debug, fault_event};
use crate::types::id::IdAllocator;
use crate::types::{FiberId, FiberValue, SupervisorId};

pub use builder::RuntimeBuilder;
pub use config::{RuntimeConfig, UnhandledFaultPolicy};
pub use scheduler::Scheduler;

/// Callback observing every unhandled fault.
pub type FaultHook = Arc<dyn Fn(FiberId, &Error) + Send + Sync>;

/// Error raised while assembling a runtime configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds an unparseable value.
    #[error("invalid value for {var}: {detail}")]
    InvalidEnv {
        /// Variable name.
        var: String,
        /// What was wrong with it.
        detail: String,
    },
    /// A config file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        /// File path.
        path: std::path::PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A config file is not valid TOML for this schema.
    #[cfg(feature = "config-file")]
    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is outside its accepted set.
    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::new(crate::error::ErrorKind::Config)
            .with_message(err.to_string())
            .with_source(err)
    }
}

/// Live counters.
#[derive(Debug, Default)]
pub(crate) struct RuntimeStats {
    spawned: AtomicU64,
    completed: AtomicU64,
    unhandled: AtomicU64,
}

impl RuntimeStats {
    pub(crate) fn record_spawned(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_unhandled(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fibers_spawned: self.spawned.load(Ordering::Relaxed),
            fibers_completed: self.completed.load(Ordering::Relaxed),
            unhandled_faults: self.unhandled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time runtime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Fibers created (including parallel leaves).
    pub fibers_spawned: u64,
    /// Fibers that delivered their outcome.
    pub fibers_completed: u64,
    /// Failures reported as unhandled.
    pub unhandled_faults: u64,
}

impl StatsSnapshot {
    /// Fibers created but not yet completed.
    #[must_use]
    pub const fn live(&self) -> u64 {
        self.fibers_spawned.saturating_sub(self.fibers_completed)
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    scheduler: Scheduler,
    ids: IdAllocator,
    stats: RuntimeStats,
    fault_hook: Option<FaultHook>,
}

/// Shared context for fibers: scheduler, configuration and fault reporting.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("scheduler", &self.inner.scheduler)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(RuntimeConfig::default(), None)
    }

    /// Returns a builder for custom configuration.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub(crate) fn from_parts(mut config: RuntimeConfig, fault_hook: Option<FaultHook>) -> Self {
        config.normalize();
        debug!(
            queue_limit = config.scheduler_queue_limit,
            defer_start = config.defer_start,
            policy = %config.unhandled_fault_policy,
            "runtime created"
        );
        Self {
            inner: Arc::new(RuntimeInner {
                scheduler: Scheduler::new(config.scheduler_queue_limit),
                config,
                ids: IdAllocator::new(),
                stats: RuntimeStats::default(),
                fault_hook,
            }),
        }
    }

    /// Returns the resolved configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Returns the scheduler shared by this runtime's fibers.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Returns a snapshot of the runtime counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub(crate) fn next_fiber_id(&self) -> FiberId {
        self.inner.ids.next_fiber()
    }

    pub(crate) fn next_supervisor_id(&self) -> SupervisorId {
        self.inner.ids.next_supervisor()
    }

    pub(crate) fn stats_recorder(&self) -> &RuntimeStats {
        &self.inner.stats
    }

    /// Reports a failure nobody observed, according to the configured
    /// policy.
    pub(crate) fn report_unhandled(&self, fiber: FiberId, err: Error) {
        self.inner.stats.record_unhandled();
        if let Some(hook) = &self.inner.fault_hook {
            hook(fiber, &err);
        }
        match self.inner.config.unhandled_fault_policy {
            UnhandledFaultPolicy::Log => {
                fault_event!(error, fiber, err, "unhandled fiber failure");
            }
            UnhandledFaultPolicy::Panic => {
                let name = format!("{}-{}", self.inner.config.thread_name_prefix, fiber);
                let spawned = thread::Builder::new()
                    .name(name)
                    .spawn(move || panic!("unhandled failure in fiber {fiber}: {err}"));
                if let Err(spawn_err) = spawned {
                    fault_event!(error, fiber, spawn_err, "failed to spawn fault thread");
                }
            }
            UnhandledFaultPolicy::Ignore => {}
        }
    }

    /// Creates a suspended fiber for `effect`.
    pub fn fiber<T: FiberValue>(&self, effect: Effect<T>) -> Fiber<T> {
        Fiber::from_raw(FiberRef::new(self, None, effect.into_program()))
    }

    /// Creates a fiber for `effect` and starts it.
    pub fn launch<T: FiberValue>(&self, effect: Effect<T>) -> Fiber<T> {
        let fiber = self.fiber(effect);
        fiber.run();
        fiber
    }

    /// Starts `effect`, invoking `callback` with its outcome.
    ///
    /// The callback counts as an observer: a failure delivered to it is
    /// not reported as unhandled.
    pub fn run_with<T, F>(&self, effect: Effect<T>, callback: F) -> Fiber<T>
    where
        T: FiberValue,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let fiber = self.fiber(effect);
        let _ = fiber.on_complete(false, callback);
        fiber.run();
        fiber
    }

    /// Runs `effect` and blocks the calling thread until it completes.
    ///
    /// If the fiber can never complete because nothing holds a reference
    /// to it any more, an [`ErrorKind::Internal`](crate::error::ErrorKind::Internal)
    /// error is returned instead of blocking forever.
    pub fn block_on<T: FiberValue>(&self, effect: Effect<T>) -> Result<T> {
        let (tx, rx) = mpsc::sync_channel(1);
        drop(self.run_with(effect, move |outcome| {
            let _ = tx.send(outcome);
        }));
        rx.recv()
            .unwrap_or_else(|_| Err(Error::internal("fiber abandoned before completing")))
    }

    /// Creates a suspended fiber under a fresh supervisor. Fibers it spawns
    /// register with that supervisor.
    pub fn spawn_supervised<T: FiberValue>(&self, effect: Effect<T>) -> (Fiber<T>, Supervisor) {
        let supervisor = Supervisor::new(self);
        let raw = FiberRef::new(self, Some(supervisor.clone()), effect.into_program());
        (Fiber::from_raw(raw), supervisor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{AsyncProbe, init_test_logging, runtime_with_fault_log};
    use parking_lot::Mutex;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn stats_track_lifecycle() {
        init_test("stats_track_lifecycle");
        let runtime = Runtime::new();
        let probe = AsyncProbe::<u8>::new();
        let _done = runtime.launch(Effect::pure(1_u8));
        let pending = runtime.launch(probe.effect());
        let stats = runtime.stats();
        crate::assert_with_log!(stats.fibers_spawned == 2, "spawned", 2, stats.fibers_spawned);
        assert_eq!(stats.fibers_completed, 1);
        assert_eq!(stats.live(), 1);
        probe.resolve(Ok(2));
        assert!(pending.is_completed());
        assert_eq!(runtime.stats().live(), 0);
        crate::test_complete!("stats_track_lifecycle");
    }

    #[test]
    fn unobserved_failure_is_reported_once() {
        init_test("unobserved_failure_is_reported_once");
        let (runtime, faults) = runtime_with_fault_log();
        let _fiber = runtime.launch(Effect::<u8>::fail(Error::failure("nobody listens")));
        let recorded = faults.take();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].message(), Some("nobody listens"));
        assert_eq!(runtime.stats().unhandled_faults, 1);
        crate::test_complete!("unobserved_failure_is_reported_once");
    }

    #[cfg(feature = "tracing-integration")]
    #[test]
    fn unobserved_failure_is_logged_by_default() {
        init_test("unobserved_failure_is_logged_by_default");
        let capture = crate::test_utils::LogCapture::new();
        let runtime = Runtime::new();
        assert_eq!(
            runtime.config().unhandled_fault_policy,
            UnhandledFaultPolicy::Log
        );
        let fiber = capture.scoped(|| {
            runtime.launch(Effect::<u8>::fail(Error::failure("nobody listens")))
        });
        let logged = capture.contents();
        assert!(logged.contains("unhandled fiber failure"), "{logged}");
        assert!(logged.contains("nobody listens"), "{logged}");
        assert!(logged.contains(&fiber.id().to_string()), "{logged}");
        assert_eq!(runtime.stats().unhandled_faults, 1);
        crate::test_complete!("unobserved_failure_is_logged_by_default");
    }

    #[test]
    fn observed_failure_is_not_reported() {
        init_test("observed_failure_is_not_reported");
        let (runtime, faults) = runtime_with_fault_log();
        let out = runtime.block_on(Effect::<u8>::fail(Error::failure("seen")));
        assert!(out.is_err());
        assert!(faults.take().is_empty());
        crate::test_complete!("observed_failure_is_not_reported");
    }

    #[test]
    fn block_on_abandoned_fiber_errors() {
        init_test("block_on_abandoned_fiber_errors");
        let runtime = Runtime::new();
        let err = runtime.block_on(Effect::<u8>::never()).expect_err("abandoned");
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
        crate::test_complete!("block_on_abandoned_fiber_errors");
    }

    #[test]
    fn fault_hook_sees_fiber_id() {
        init_test("fault_hook_sees_fiber_id");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let runtime = RuntimeBuilder::new()
            .unhandled_fault_policy(UnhandledFaultPolicy::Ignore)
            .fault_hook(move |fiber, _| sink.lock().push(fiber))
            .build()
            .expect("build");
        let fiber = runtime.launch(Effect::<u8>::fail(Error::failure("x")));
        assert_eq!(*seen.lock(), vec![fiber.id()]);
        crate::test_complete!("fault_hook_sees_fiber_id");
    }

    #[test]
    fn config_error_converts() {
        let err: Error = ConfigError::Invalid("bad".into()).into();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert_eq!(err.message(), Some("bad"));
    }
}
