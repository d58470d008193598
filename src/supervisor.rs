//! Supervisors: registries of live child fibers.
//!
//! Fibers spawned under a supervisor register themselves on creation and
//! deregister on completion. [`Supervisor::kill_all`] interrupts every fiber
//! still registered and reports once all of them have acknowledged.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::effect::{Canceler, Effect};
use crate::error::Error;
use crate::fiber::{FiberRef, Listener};
use crate::runtime::Runtime;
use crate::tracing_compat::{debug, trace};
use crate::types::SupervisorId;

struct Inner {
    id: SupervisorId,
    fibers: Mutex<BTreeMap<u64, FiberRef>>,
    next: AtomicU64,
}

/// A registry of child fibers that can be killed together.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.inner.id)
            .field("live", &self.len())
            .finish()
    }
}

impl Supervisor {
    pub(crate) fn new(runtime: &Runtime) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: runtime.next_supervisor_id(),
                fibers: Mutex::new(BTreeMap::new()),
                next: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the supervisor identifier.
    #[must_use]
    pub fn id(&self) -> SupervisorId {
        self.inner.id
    }

    /// Number of registered fibers that have not completed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.fibers.lock().len()
    }

    /// Returns true if no registered fiber is still live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.fibers.lock().is_empty()
    }

    /// Adds `fiber` to the registry. It is removed again when it completes.
    pub fn register(&self, fiber: &FiberRef) {
        let key = self.inner.next.fetch_add(1, Ordering::Relaxed);
        self.inner.fibers.lock().insert(key, fiber.clone());
        trace!(supervisor = %self.inner.id, fiber = %fiber.id(), "fiber registered");
        // Completion may be immediate, so the entry must exist first.
        let inner = Arc::clone(&self.inner);
        let _ = fiber.on_complete(Listener::new(true, move |_| {
            inner.fibers.lock().remove(&key);
        }));
    }

    /// Kills every live registered fiber with `cause`.
    ///
    /// `on_done` is invoked exactly once, after every fiber has acknowledged
    /// (immediately if none are live). The returned canceler withdraws the
    /// pending acknowledgements.
    pub fn kill_all<F>(&self, cause: &Error, on_done: F) -> Canceler
    where
        F: FnOnce() + Send + 'static,
    {
        let fibers = std::mem::take(&mut *self.inner.fibers.lock());
        debug!(supervisor = %self.inner.id, live = fibers.len(), cause = %cause, "killing supervised fibers");
        if fibers.is_empty() {
            on_done();
            return Canceler::none();
        }
        let remaining = Arc::new(AtomicUsize::new(fibers.len()));
        let on_done = Arc::new(Mutex::new(Some(on_done)));
        let tokens: Vec<_> = fibers
            .into_values()
            .map(|fiber| {
                let remaining = Arc::clone(&remaining);
                let on_done = Arc::clone(&on_done);
                fiber.kill(cause.clone(), move || {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let done = on_done.lock().take();
                        if let Some(done) = done {
                            done();
                        }
                    }
                })
            })
            .collect();
        Canceler::from_fn(move || {
            for token in tokens {
                token.revoke();
            }
        })
    }

    /// [`kill_all`](Self::kill_all) as an effect that resumes once every
    /// fiber has acknowledged.
    #[must_use]
    pub fn kill_all_effect(&self, cause: Error) -> Effect<()> {
        let supervisor = self.clone();
        Effect::async_effect(move |resolver| {
            Ok(supervisor.kill_all(&cause, move || resolver.succeed(())))
        })
    }
}
