//! Effect programs.
//!
//! An [`Effect<T>`] is an immutable description of a computation that
//! eventually produces a `T` or fails with an [`Error`]. Nothing happens
//! until the effect is handed to a fiber (see
//! [`Runtime::launch`](crate::runtime::Runtime::launch)).
//!
//! # Building blocks
//!
//! | Constructor | Meaning |
//! |-------------|---------|
//! | [`Effect::pure`] / [`Effect::fail`] | immediate outcome |
//! | [`Effect::sync`] / [`Effect::try_sync`] | deferred synchronous work; panics become [`ErrorKind::ExternalFault`](crate::error::ErrorKind::ExternalFault) |
//! | [`Effect::async_effect`] | register an asynchronous operation and suspend |
//! | [`Effect::and_then`] / [`Effect::map`] | sequencing |
//! | [`Effect::recover`] / [`Effect::attempt`] | failure handling |
//! | [`Effect::general_bracket`] / [`Effect::bracket`] / [`Effect::finally`] | resource safety |
//! | [`Effect::spawn`] / [`Effect::spawn_suspended`] | child fibers |
//! | [`Effect::par`] | parallel composition |

pub mod par;
pub(crate) mod program;

use core::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberRef};
use crate::supervisor::Supervisor;
use crate::types::FiberValue;
use crate::types::value::{erase, unerase};

pub use par::{Par, ParFn};
pub use program::Canceler;
pub(crate) use program::{Completion, Link, Program, ReleaseSpec};

/// Description of a computation producing a `T`.
#[must_use = "effects do nothing unless run by a fiber"]
pub struct Effect<T> {
    program: Program,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Effect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.program).finish()
    }
}

impl<T> Effect<T> {
    pub(crate) const fn from_program(program: Program) -> Self {
        Self {
            program,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_program(self) -> Program {
        self.program
    }
}

/// Typed continuation: recovers the `T` and feeds it to `f`.
fn bind<T, U, F>(f: F) -> program::Bind
where
    T: FiberValue,
    F: FnOnce(T) -> Effect<U> + Send + 'static,
{
    Box::new(move |value| match unerase::<T>(value) {
        Ok(typed) => f(typed).program,
        Err(err) => Program::Failed(err),
    })
}

impl<T: FiberValue> Effect<T> {
    /// An effect that succeeds immediately.
    pub fn pure(value: T) -> Self {
        Self::from_program(Program::Done(erase(value)))
    }

    /// An effect that fails immediately.
    pub fn fail(error: Error) -> Self {
        Self::from_program(Program::Failed(error))
    }

    /// Defers a synchronous computation.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::from_program(Program::Sync(Box::new(move || Ok(erase(f())))))
    }

    /// Defers a fallible synchronous computation.
    pub fn try_sync<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self::from_program(Program::Sync(Box::new(move || f().map(erase))))
    }

    /// Registers an asynchronous operation.
    ///
    /// `register` runs when the fiber reaches this step. It receives a
    /// [`Resolver`] that may be invoked from any thread; only the first
    /// invocation is honoured. It returns the [`Canceler`] used if the fiber
    /// is killed while waiting. An `Err` from `register` fails the step.
    pub fn async_effect<F>(register: F) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<Canceler> + Send + 'static,
    {
        Self::from_program(Program::Async(Box::new(move |completion| {
            register(Resolver::new(completion))
        })))
    }

    /// An effect that never completes on its own.
    pub fn never() -> Self {
        Self::from_program(Program::Async(Box::new(|_| Ok(Canceler::none()))))
    }

    /// Defers construction of an effect until it runs.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        Self::from_program(Program::Chain(
            Link::new(Program::unit()),
            Box::new(move |_| f().program),
        ))
    }

    /// Sequences a dependent effect after this one.
    pub fn and_then<U, F>(self, f: F) -> Effect<U>
    where
        U: FiberValue,
        F: FnOnce(T) -> Effect<U> + Send + 'static,
    {
        Effect::from_program(Program::Chain(Link::new(self.program), bind(f)))
    }

    /// Transforms the success value.
    pub fn map<U, F>(self, f: F) -> Effect<U>
    where
        U: FiberValue,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(move |value| Effect::pure(f(value)))
    }

    /// Runs `next` after this effect, discarding this effect's value.
    pub fn then<U: FiberValue>(self, next: Effect<U>) -> Effect<U> {
        self.and_then(move |_| next)
    }

    /// Discards the success value.
    pub fn void(self) -> Effect<()> {
        self.map(|_| ())
    }

    /// Handles a failure by switching to another effect.
    ///
    /// Interrupts delivered by `kill` outside a protected region are never
    /// handed to `f`.
    pub fn recover<F>(self, f: F) -> Self
    where
        F: FnOnce(Error) -> Self + Send + 'static,
    {
        Self::from_program(Program::Recover(
            Link::new(self.program),
            Box::new(move |err| f(err).program),
        ))
    }

    /// Transforms the failure.
    pub fn map_err<F>(self, f: F) -> Self
    where
        F: FnOnce(Error) -> Error + Send + 'static,
    {
        self.recover(move |err| Self::fail(f(err)))
    }

    /// Reifies the outcome as a value.
    pub fn attempt(self) -> Effect<Result<T>> {
        let succeeded = self.map(Ok::<T, Error>);
        Effect::from_program(Program::Recover(
            Link::new(succeeded.program),
            Box::new(|err| Program::Done(erase(Err::<T, Error>(err)))),
        ))
    }

    /// Acquires a resource, uses it, and releases it exactly once.
    ///
    /// `acquire` and the release handlers run with interrupts masked. The
    /// handler picked by [`BracketConditions`] depends on how `use_fn`
    /// concluded: killed, failed, or completed (in that priority).
    pub fn general_bracket<R, U>(
        acquire: Effect<R>,
        conditions: BracketConditions<R, T>,
        use_fn: U,
    ) -> Self
    where
        R: FiberValue,
        U: FnOnce(R) -> Self + Send + 'static,
    {
        Self::from_program(Program::Acquire(
            Link::new(acquire.program),
            conditions.into_spec(),
            bind(use_fn),
        ))
    }

    /// [`general_bracket`](Self::general_bracket) with one release action for
    /// every outcome.
    pub fn bracket<R, Rel, U>(acquire: Effect<R>, release: Rel, use_fn: U) -> Self
    where
        R: FiberValue,
        Rel: Fn(R) -> Effect<()> + Send + Sync + 'static,
        U: FnOnce(R) -> Self + Send + 'static,
    {
        Self::general_bracket(acquire, BracketConditions::uniform(release), use_fn)
    }

    /// Runs `finalizer` after this effect however it concludes.
    pub fn finally(self, finalizer: Effect<()>) -> Self {
        let slot = Arc::new(Mutex::new(Some(finalizer)));
        Self::bracket(
            Effect::pure(()),
            move |()| slot.lock().take().unwrap_or_else(|| Effect::pure(())),
            move |()| self,
        )
    }

    /// Forks this effect into a child fiber that starts immediately.
    pub fn spawn(self) -> Effect<Fiber<T>> {
        self.spawn_with(true)
    }

    /// Forks this effect into a child fiber that starts when first joined or
    /// run.
    pub fn spawn_suspended(self) -> Effect<Fiber<T>> {
        self.spawn_with(false)
    }

    fn spawn_with(self, immediate: bool) -> Effect<Fiber<T>> {
        Effect::from_program(Program::Chain(
            Link::new(Program::Spawn {
                immediate,
                supervised: false,
                inner: Link::new(self.program),
            }),
            bind(|raw: FiberRef| Effect::pure(Fiber::<T>::from_raw(raw))),
        ))
    }

    /// Forks this effect, suspended, under a fresh supervisor.
    pub(crate) fn spawn_supervised(self) -> Effect<(Fiber<T>, Supervisor)> {
        Effect::from_program(Program::Chain(
            Link::new(Program::Spawn {
                immediate: false,
                supervised: true,
                inner: Link::new(self.program),
            }),
            bind(|(raw, supervisor): (FiberRef, Supervisor)| {
                Effect::pure((Fiber::<T>::from_raw(raw), supervisor))
            }),
        ))
    }

    /// Sequences a parallel composition tree.
    pub fn par(tree: Par<T>) -> Self {
        tree.sequential()
    }

    /// Waits for a fiber's outcome.
    ///
    /// If the joining fiber is killed, the join registration is withdrawn.
    pub fn join_fiber(fiber: &Fiber<T>) -> Self {
        let fiber = fiber.clone();
        Self::async_effect(move |resolver| {
            let token = fiber.join(move |outcome| resolver.resolve(outcome));
            Ok(Canceler::from_fn(move || token.revoke()))
        })
    }
}

impl Effect<()> {
    /// The unit effect.
    pub fn unit() -> Self {
        Self::from_program(Program::unit())
    }

    /// Kills a fiber and waits until it has concluded.
    pub fn kill_fiber<U: FiberValue>(cause: Error, fiber: &Fiber<U>) -> Self {
        let fiber = fiber.clone();
        Self::async_effect(move |resolver| {
            let token = fiber.kill(cause, move || resolver.resolve(Ok(())));
            Ok(Canceler::from_fn(move || token.revoke()))
        })
    }
}

/// Delivers the outcome of an asynchronous operation to its fiber.
///
/// Cloneable and callable from any thread. Only the first delivery for a
/// given suspension is honoured; later ones are ignored.
pub struct Resolver<T> {
    completion: Completion,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            completion: self.completion.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Resolver")
    }
}

impl<T: FiberValue> Resolver<T> {
    pub(crate) const fn new(completion: Completion) -> Self {
        Self {
            completion,
            _marker: PhantomData,
        }
    }

    /// Delivers an outcome.
    pub fn resolve(&self, outcome: Result<T>) {
        self.completion.complete(outcome.map(erase));
    }

    /// Delivers a success.
    pub fn succeed(&self, value: T) {
        self.resolve(Ok(value));
    }

    /// Delivers a failure.
    pub fn fail(&self, error: Error) {
        self.resolve(Err(error));
    }
}

type ReleaseWithError<R> = Box<dyn FnOnce(Error, R) -> Effect<()> + Send>;

/// Release handlers for [`Effect::general_bracket`].
pub struct BracketConditions<R, A> {
    killed: ReleaseWithError<R>,
    failed: ReleaseWithError<R>,
    completed: Box<dyn FnOnce(A, R) -> Effect<()> + Send>,
}

impl<R, A> fmt::Debug for BracketConditions<R, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BracketConditions")
    }
}

impl<R: FiberValue, A: FiberValue> BracketConditions<R, A> {
    /// Creates conditions from one handler per outcome.
    pub fn new<K, F, C>(killed: K, failed: F, completed: C) -> Self
    where
        K: FnOnce(Error, R) -> Effect<()> + Send + 'static,
        F: FnOnce(Error, R) -> Effect<()> + Send + 'static,
        C: FnOnce(A, R) -> Effect<()> + Send + 'static,
    {
        Self {
            killed: Box::new(killed),
            failed: Box::new(failed),
            completed: Box::new(completed),
        }
    }

    /// Uses the same release action for every outcome.
    pub fn uniform<F>(release: F) -> Self
    where
        F: Fn(R) -> Effect<()> + Send + Sync + 'static,
    {
        let release = Arc::new(release);
        let on_killed = Arc::clone(&release);
        let on_failed = Arc::clone(&release);
        Self::new(
            move |_, resource| on_killed(resource),
            move |_, resource| on_failed(resource),
            move |_, resource| release(resource),
        )
    }

    fn into_spec(self) -> ReleaseSpec {
        let Self {
            killed,
            failed,
            completed,
        } = self;
        ReleaseSpec {
            killed: Box::new(move |err, resource| match unerase::<R>(resource) {
                Ok(resource) => killed(err, resource).program,
                Err(mismatch) => Program::Failed(mismatch),
            }),
            failed: Box::new(move |err, resource| match unerase::<R>(resource) {
                Ok(resource) => failed(err, resource).program,
                Err(mismatch) => Program::Failed(mismatch),
            }),
            completed: Box::new(move |value, resource| {
                match (unerase::<A>(value), unerase::<R>(resource)) {
                    (Ok(value), Ok(resource)) => completed(value, resource).program,
                    (Err(mismatch), _) | (_, Err(mismatch)) => Program::Failed(mismatch),
                }
            }),
        }
    }
}
