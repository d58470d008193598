//! Fibers: lightweight interpreters for effect programs.
//!
//! A fiber runs one program on whichever thread drives it: the caller of
//! [`FiberRef::run`], or the thread delivering an asynchronous completion.
//! It never blocks; it suspends only while waiting on an asynchronous
//! registration.
//!
//! # Lifecycle
//!
//! ```text
//! Suspended ──run──► Continue ◄──► StepBind / StepResult ──► Return ──► Completed
//!                       │                                      ▲
//!                       └──► Pending ──completion / kill───────┘
//! ```
//!
//! Every fiber produces exactly one outcome, delivered to all completion
//! listeners in registration order.

mod machine;

use core::fmt;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::effect::{Effect, Program};
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::supervisor::Supervisor;
use crate::tracing_compat::{debug, error};
use crate::types::value::{Exit, unerase_exit};
use crate::types::{AnyValue, FiberId, FiberValue};

use machine::Machine;

/// Execution status of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FiberStatus {
    /// Created but not yet started.
    Suspended,
    /// Interpreting the next instruction.
    Continue,
    /// A success value is about to be fed to the next continuation.
    StepBind,
    /// A step outcome is about to be interpreted.
    StepResult,
    /// Waiting on an asynchronous operation.
    Pending,
    /// Unwinding the attempt stack with an outcome.
    Return,
    /// Finished; the outcome is final.
    Completed,
}

impl FiberStatus {
    /// Returns a stable lowercase name for this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Suspended => "suspended",
            Self::Continue => "continue",
            Self::StepBind => "step_bind",
            Self::StepResult => "step_result",
            Self::Pending => "pending",
            Self::Return => "return",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a fiber's interpreter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FiberSnapshot {
    /// Fiber identifier.
    pub id: FiberId,
    /// Current status.
    pub status: FiberStatus,
    /// Nesting depth of protected (uninterruptible) regions.
    pub bracket_depth: usize,
    /// Pending continuations.
    pub continuations: usize,
    /// Pending attempt frames.
    pub attempts: usize,
    /// Whether an interrupt has been recorded.
    pub interrupted: bool,
    /// Registered completion listeners.
    pub listeners: usize,
}

/// A completion listener.
///
/// A listener with `rethrow == false` marks the fiber's failure as observed:
/// it will not be reported as unhandled.
pub struct Listener {
    rethrow: bool,
    handler: Box<dyn FnOnce(Result<AnyValue>) + Send>,
}

impl Listener {
    /// Creates a listener.
    pub fn new<F>(rethrow: bool, handler: F) -> Self
    where
        F: FnOnce(Result<AnyValue>) + Send + 'static,
    {
        Self {
            rethrow,
            handler: Box::new(handler),
        }
    }

    /// Returns whether this listener leaves failures unobserved.
    #[must_use]
    pub const fn rethrow(&self) -> bool {
        self.rethrow
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("rethrow", &self.rethrow)
            .finish_non_exhaustive()
    }
}

/// Registration handle returned by listener-installing operations.
///
/// Dropping the token keeps the registration; [`revoke`](Self::revoke)
/// removes it if it has not fired yet.
#[derive(Debug)]
pub struct ListenerToken {
    fiber: Weak<FiberInner>,
    id: Option<u64>,
}

impl ListenerToken {
    pub(crate) const fn inert() -> Self {
        Self {
            fiber: Weak::new(),
            id: None,
        }
    }

    /// Withdraws the registration.
    pub fn revoke(self) {
        let (Some(id), Some(fiber)) = (self.id, self.fiber.upgrade()) else {
            return;
        };
        let mut machine = fiber.machine.lock();
        if let Some(listeners) = machine.listeners.as_mut() {
            listeners.remove(&id);
        }
    }
}

pub(crate) struct FiberInner {
    id: FiberId,
    runtime: Runtime,
    supervisor: Option<Supervisor>,
    generation: AtomicU64,
    machine: Mutex<Machine>,
}

impl FiberInner {
    fn add_listener(self: &Arc<Self>, machine: &mut Machine, listener: Listener) -> ListenerToken {
        let Some(listeners) = machine.listeners.as_mut() else {
            return ListenerToken::inert();
        };
        let id = machine.next_listener;
        machine.next_listener += 1;
        listeners.insert(id, listener);
        ListenerToken {
            fiber: Arc::downgrade(self),
            id: Some(id),
        }
    }

    fn notify(&self, listener: Listener, outcome: Exit) {
        let handler = listener.handler;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || handler(outcome))) {
            let fault = Error::from_panic(payload.as_ref()).with_fiber(self.id);
            error!(fiber = %self.id, error = %fault, "completion listener panicked");
            self.runtime.report_unhandled(self.id, fault);
        }
    }
}

/// Untyped handle to a fiber.
#[derive(Clone)]
pub struct FiberRef {
    inner: Arc<FiberInner>,
}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl FiberRef {
    pub(crate) fn new(runtime: &Runtime, supervisor: Option<Supervisor>, program: Program) -> Self {
        let id = runtime.next_fiber_id();
        runtime.stats_recorder().record_spawned();
        Self {
            inner: Arc::new(FiberInner {
                id,
                runtime: runtime.clone(),
                supervisor,
                generation: AtomicU64::new(0),
                machine: Mutex::new(Machine::new(program)),
            }),
        }
    }

    /// Returns the fiber identifier.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> FiberStatus {
        self.inner.machine.lock().status
    }

    /// Returns true once listeners have been notified of the outcome.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.machine.lock().listeners.is_none()
    }

    /// Returns a point-in-time view of the interpreter state.
    #[must_use]
    pub fn snapshot(&self) -> FiberSnapshot {
        let machine = self.inner.machine.lock();
        FiberSnapshot {
            id: self.inner.id,
            status: machine.status,
            bracket_depth: machine.bracket_depth,
            continuations: machine.continuation_depth(),
            attempts: machine.attempt_depth(),
            interrupted: machine.interrupt.is_some(),
            listeners: machine.listeners.as_ref().map_or(0, BTreeMap::len),
        }
    }

    /// Returns true if both handles refer to the same fiber.
    #[must_use]
    pub fn same_fiber(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Starts a suspended fiber. No-op in any other status.
    pub fn run(&self) {
        {
            let mut machine = self.inner.machine.lock();
            if machine.status != FiberStatus::Suspended || machine.running {
                return;
            }
            machine.running = true;
        }
        debug!(fiber = %self.inner.id, "fiber started");
        let scheduler = self.inner.runtime.scheduler();
        if self.inner.runtime.config().defer_start && !scheduler.is_draining() {
            let inner = Arc::clone(&self.inner);
            scheduler.enqueue(Box::new(move || inner.drive()));
        } else {
            self.inner.drive();
        }
    }

    /// Registers a completion listener.
    ///
    /// If the fiber has already completed the listener is invoked
    /// immediately on the calling thread.
    pub fn on_complete(&self, listener: Listener) -> ListenerToken {
        let mut machine = self.inner.machine.lock();
        if machine.listeners.is_some() {
            return self.inner.add_listener(&mut machine, listener);
        }
        machine.rethrow = machine.rethrow && listener.rethrow;
        let outcome = machine
            .outcome
            .clone()
            .unwrap_or_else(|| Err(Error::internal("completed fiber has no outcome")));
        drop(machine);
        self.inner.notify(listener, outcome);
        ListenerToken::inert()
    }

    /// Registers a non-rethrowing listener and starts the fiber if it is
    /// still suspended.
    pub fn join<F>(&self, callback: F) -> ListenerToken
    where
        F: FnOnce(Result<AnyValue>) + Send + 'static,
    {
        let token = self.on_complete(Listener::new(false, callback));
        if self.status() == FiberStatus::Suspended {
            self.run();
        }
        token
    }

    /// Interrupts the fiber with `cause`.
    ///
    /// `callback` is invoked exactly once, after the fiber has completed
    /// (immediately if it already has). Release handlers of protected
    /// regions still run to completion first.
    pub fn kill<F>(&self, cause: Error, callback: F) -> ListenerToken
    where
        F: FnOnce() + Send + 'static,
    {
        let mut machine = self.inner.machine.lock();
        if machine.listeners.is_none() {
            drop(machine);
            callback();
            return ListenerToken::inert();
        }
        debug!(
            fiber = %self.inner.id,
            status = %machine.status,
            cause = %cause,
            "kill requested"
        );
        let token = self
            .inner
            .add_listener(&mut machine, Listener::new(false, move |_| callback()));
        match machine.status {
            FiberStatus::Suspended if !machine.running => {
                let abandoned = machine.take_step();
                machine.interrupt = Some(cause.clone());
                machine.outcome = Some(Err(cause));
                machine.status = FiberStatus::Completed;
                machine.running = true;
                drop(machine);
                drop(abandoned);
                self.inner.drive();
            }
            FiberStatus::Completed => {}
            _ => {
                if machine.interrupt.is_none() {
                    machine.interrupt = Some(cause);
                }
                if machine.bracket_depth == 0 {
                    machine.kill_requested = true;
                    if !machine.running {
                        machine.running = true;
                        drop(machine);
                        self.inner.drive();
                    }
                }
            }
        }
        token
    }
}

/// Typed handle to a fiber producing a `T`.
pub struct Fiber<T> {
    raw: FiberRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Fiber<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Fiber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fiber").field(&self.raw).finish()
    }
}

impl<T: FiberValue> Fiber<T> {
    pub(crate) const fn from_raw(raw: FiberRef) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Returns the untyped handle.
    #[must_use]
    pub const fn raw(&self) -> &FiberRef {
        &self.raw
    }

    /// Consumes the typed handle, returning the untyped one.
    #[must_use]
    pub fn into_raw(self) -> FiberRef {
        self.raw
    }

    /// Returns the fiber identifier.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.raw.id()
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> FiberStatus {
        self.raw.status()
    }

    /// Returns true once the outcome has been delivered.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.raw.is_completed()
    }

    /// Returns a point-in-time view of the interpreter state.
    #[must_use]
    pub fn snapshot(&self) -> FiberSnapshot {
        self.raw.snapshot()
    }

    /// Starts the fiber if it is suspended.
    pub fn run(&self) {
        self.raw.run();
    }

    /// Registers a typed completion listener.
    pub fn on_complete<F>(&self, rethrow: bool, handler: F) -> ListenerToken
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        self.raw
            .on_complete(Listener::new(rethrow, move |exit| handler(unerase_exit(exit))))
    }

    /// Waits for the outcome, starting the fiber if needed.
    pub fn join<F>(&self, callback: F) -> ListenerToken
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        self.raw.join(move |exit| callback(unerase_exit(exit)))
    }

    /// Interrupts the fiber; see [`FiberRef::kill`].
    pub fn kill<F>(&self, cause: Error, callback: F) -> ListenerToken
    where
        F: FnOnce() + Send + 'static,
    {
        self.raw.kill(cause, callback)
    }

    /// The outcome of this fiber as an effect.
    pub fn join_effect(&self) -> Effect<T> {
        Effect::join_fiber(self)
    }

    /// Killing this fiber as an effect.
    pub fn kill_effect(&self, cause: Error) -> Effect<()> {
        Effect::kill_fiber(cause, self)
    }
}
