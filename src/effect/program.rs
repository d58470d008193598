//! Erased program representation interpreted by fibers.
//!
//! A [`Program`] is a closed sum type: the interpreter matches it
//! exhaustively and never needs to know the types of the values flowing
//! through it. The typed [`Effect`](super::Effect) façade is the only way to
//! build one from outside the crate.

use core::fmt;
use core::mem;
use core::ops::Deref;
use std::sync::Arc;

use crate::effect::par::ParTree;
use crate::error::{Error, Result};
use crate::types::AnyValue;
use crate::types::value::{Exit, unit};

/// Deferred synchronous computation.
pub(crate) type Thunk = Box<dyn FnOnce() -> Result<AnyValue> + Send>;
/// Continuation applied to the success value of a step.
pub(crate) type Bind = Box<dyn FnOnce(AnyValue) -> Program + Send>;
/// Recovery handler applied to a failure.
pub(crate) type Handler = Box<dyn FnOnce(Error) -> Program + Send>;
/// Body of a bracket, applied to the acquired resource.
pub(crate) type UseFn = Box<dyn FnOnce(AnyValue) -> Program + Send>;
/// Registration function of an asynchronous operation.
pub(crate) type Register = Box<dyn FnOnce(Completion) -> Result<Canceler> + Send>;

/// One instruction of an effect program.
pub(crate) enum Program {
    /// Immediate success.
    Done(AnyValue),
    /// Immediate failure.
    Failed(Error),
    /// Run a thunk; a panic becomes an external fault.
    Sync(Thunk),
    /// Register an asynchronous operation and suspend until it completes.
    Async(Register),
    /// Run `base`, then feed its success value to the continuation.
    Chain(Link, Bind),
    /// Run `base`; on failure run the handler instead.
    Recover(Link, Handler),
    /// Acquire a resource, use it, and release it exactly once.
    Acquire(Link, ReleaseSpec, UseFn),
    /// Create a child fiber and yield its handle. A `supervised` child gets
    /// a fresh supervisor and the step yields the handle with it.
    Spawn {
        immediate: bool,
        supervised: bool,
        inner: Link,
    },
    /// Evaluate a parallel composition tree.
    Par(ParTree),
}

impl Program {
    pub(crate) fn unit() -> Self {
        Self::Done(unit())
    }

    /// Placeholder left behind when a nested program is moved out of its
    /// link. Never allocates.
    pub(crate) fn vacant() -> Self {
        Self::Sync(Box::new(vacant_step))
    }

    const fn has_links(&self) -> bool {
        matches!(
            self,
            Self::Chain(..) | Self::Recover(..) | Self::Acquire(..) | Self::Spawn { .. } | Self::Par(_)
        )
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Done(_) => "Done",
            Self::Failed(_) => "Failed",
            Self::Sync(_) => "Sync",
            Self::Async(_) => "Async",
            Self::Chain(..) => "Chain",
            Self::Recover(..) => "Recover",
            Self::Acquire(..) => "Acquire",
            Self::Spawn { .. } => "Spawn",
            Self::Par(_) => "Par",
        }
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
            Self::Spawn {
                immediate,
                supervised,
                ..
            } => f
                .debug_struct("Spawn")
                .field("immediate", immediate)
                .field("supervised", supervised)
                .finish_non_exhaustive(),
            other => f.write_str(other.name()),
        }
    }
}

fn vacant_step() -> Result<AnyValue> {
    Err(Error::internal("vacated program step"))
}

/// Owning pointer from a program node to the program it wraps.
///
/// Left-nested chains built by repeated `and_then` can be arbitrarily deep,
/// so dropping one tears the nested nodes down with a work list instead of
/// recursing.
pub(crate) struct Link(Box<Program>);

impl Link {
    pub(crate) fn new(program: Program) -> Self {
        Self(Box::new(program))
    }

    pub(crate) fn into_inner(mut self) -> Program {
        self.take()
    }

    fn take(&mut self) -> Program {
        mem::replace(&mut *self.0, Program::vacant())
    }
}

impl Deref for Link {
    type Target = Program;

    fn deref(&self) -> &Program {
        &self.0
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if self.0.has_links() {
            teardown(Detached::Program(self.take()));
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// A node detached from its parent, waiting to be dropped.
pub(crate) enum Detached {
    Program(Program),
    Tree(ParTree),
}

/// Drops a program or parallel tree of any depth with bounded stack use.
pub(crate) fn teardown(root: Detached) {
    let mut work = vec![root];
    while let Some(node) = work.pop() {
        match node {
            Detached::Program(program) => match program {
                Program::Chain(mut link, _)
                | Program::Recover(mut link, _)
                | Program::Acquire(mut link, ..)
                | Program::Spawn {
                    inner: mut link, ..
                } => work.push(Detached::Program(link.take())),
                Program::Par(tree) => work.push(Detached::Tree(tree)),
                Program::Done(_) | Program::Failed(_) | Program::Sync(_) | Program::Async(_) => {}
            },
            Detached::Tree(tree) => match tree {
                ParTree::Leaf(mut link) => work.push(Detached::Program(link.take())),
                ParTree::Map(_, mut child) => work.push(Detached::Tree(child.take())),
                ParTree::Apply(_, mut lhs, mut rhs) | ParTree::Alt(mut lhs, mut rhs) => {
                    work.push(Detached::Tree(lhs.take()));
                    work.push(Detached::Tree(rhs.take()));
                }
            },
        }
    }
}

/// Release handlers of a bracket. Exactly one of them runs.
pub(crate) struct ReleaseSpec {
    pub(crate) killed: Box<dyn FnOnce(Error, AnyValue) -> Program + Send>,
    pub(crate) failed: Box<dyn FnOnce(Error, AnyValue) -> Program + Send>,
    pub(crate) completed: Box<dyn FnOnce(AnyValue, AnyValue) -> Program + Send>,
}

/// Completion handler passed to an asynchronous registration.
///
/// Callable from any thread, any number of times; the fiber's generation
/// guard honours only the first call.
#[derive(Clone)]
pub(crate) struct Completion(Arc<dyn Fn(Exit) + Send + Sync>);

impl Completion {
    pub(crate) fn new(f: impl Fn(Exit) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn complete(&self, exit: Exit) {
        (self.0)(exit);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// Cancellation action returned by an asynchronous registration.
///
/// When the fiber waiting on the operation is killed, the canceler is
/// invoked with the interrupt cause and the effect it returns runs as an
/// uninterruptible finalizer.
pub struct Canceler(Box<dyn FnOnce(Error) -> Program + Send>);

impl Canceler {
    /// Creates a canceler from a function producing the cleanup effect.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Error) -> super::Effect<()> + Send + 'static,
    {
        Self(Box::new(move |cause| f(cause).into_program()))
    }

    /// A canceler with nothing to clean up.
    #[must_use]
    pub fn none() -> Self {
        Self(Box::new(|_| Program::unit()))
    }

    /// A canceler that runs a plain synchronous action.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(move |_| {
            Program::Sync(Box::new(move || {
                f();
                Ok(unit())
            }))
        }))
    }

    pub(crate) fn from_program<F>(f: F) -> Self
    where
        F: FnOnce(Error) -> Program + Send + 'static,
    {
        Self(Box::new(f))
    }

    pub(crate) fn cancel(self, cause: Error) -> Program {
        (self.0)(cause)
    }
}

impl fmt::Debug for Canceler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Canceler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::value::{erase, unerase};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn debug_names_variants() {
        assert_eq!(format!("{:?}", Program::unit()), "Done");
        let spawn = Program::Spawn {
            immediate: true,
            supervised: false,
            inner: Link::new(Program::unit()),
        };
        assert!(format!("{spawn:?}").starts_with("Spawn { immediate: true"));
        let failed = Program::Failed(Error::failure("x"));
        assert!(format!("{failed:?}").contains("Failure"));
    }

    #[test]
    fn canceler_none_yields_unit() {
        match Canceler::none().cancel(Error::interrupted("stop")) {
            Program::Done(v) => unerase::<()>(v).expect("unit"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn canceler_from_fn_defers_action() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let program = Canceler::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .cancel(Error::interrupted("stop"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        match program {
            Program::Sync(thunk) => {
                thunk().expect("thunk");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_is_callable_repeatedly() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let completion = Completion::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let copy = completion.clone();
        completion.complete(Ok(erase(1_u8)));
        copy.complete(Err(Error::failure("late")));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
