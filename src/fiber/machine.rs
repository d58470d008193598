//! The trampoline interpreter.
//!
//! Each iteration of [`FiberInner::drive`] computes the next transition while
//! holding the fiber lock, releases the lock to run user code (thunks,
//! continuations, handlers, registrations), then re-acquires it to store the
//! result. The `running` flag guarantees a single driver, so transitions of
//! one fiber are strictly sequential even though completions may arrive on
//! any thread.
//!
//! Interrupt masking follows the attempt frames: every frame remembers
//! whether an interrupt had been recorded when it was pushed. An interrupt
//! is "unmasked" for a frame if it arrived after the frame was pushed and no
//! protected region is active.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::MutexGuard;
use smallvec::SmallVec;

use super::{FiberInner, FiberRef, FiberStatus, Listener};
use crate::effect::program::{Bind, Handler, Register, UseFn};
use crate::effect::{Canceler, Completion, Program, ReleaseSpec};
use crate::error::{Error, catch_fault};
use crate::parallel;
use crate::supervisor::Supervisor;
use crate::tracing_compat::{debug, fault_event, trace};
use crate::types::AnyValue;
use crate::types::value::{Exit, erase, unit};

type Continuations = SmallVec<[Bind; 8]>;

/// The operand of the current status.
pub(super) enum Step {
    Empty,
    Program(Program),
    Value(AnyValue),
    Result(Exit),
}

enum Frame {
    Recover(Handler),
    Resume(Continuations),
    Acquire {
        release: ReleaseSpec,
        use_fn: UseFn,
    },
    Release {
        release: ReleaseSpec,
        resource: AnyValue,
    },
    Finalizer(Program),
    Finalized {
        value: Option<AnyValue>,
        fail: Option<Error>,
    },
}

struct Attempt {
    frame: Frame,
    /// Whether an interrupt had been recorded when the frame was pushed.
    interrupted: bool,
}

impl Attempt {
    const fn new(frame: Frame, interrupted: bool) -> Self {
        Self { frame, interrupted }
    }
}

enum ReleaseCase {
    Killed(Error),
    Failed(Error),
    Completed(AnyValue),
}

pub(crate) struct Machine {
    pub(super) status: FiberStatus,
    step: Step,
    fail: Option<Error>,
    pub(super) interrupt: Option<Error>,
    canceler: Option<Canceler>,
    conts: Continuations,
    attempts: SmallVec<[Attempt; 4]>,
    pub(super) bracket_depth: usize,
    pub(super) outcome: Option<Exit>,
    /// `None` once listeners have been notified.
    pub(super) listeners: Option<BTreeMap<u64, Listener>>,
    pub(super) next_listener: u64,
    pub(super) rethrow: bool,
    pub(super) running: bool,
    pub(super) kill_requested: bool,
}

impl Machine {
    pub(super) fn new(program: Program) -> Self {
        Self {
            status: FiberStatus::Suspended,
            step: Step::Program(program),
            fail: None,
            interrupt: None,
            canceler: None,
            conts: SmallVec::new(),
            attempts: SmallVec::new(),
            bracket_depth: 0,
            outcome: None,
            listeners: Some(BTreeMap::new()),
            next_listener: 0,
            rethrow: true,
            running: false,
            kill_requested: false,
        }
    }

    pub(super) fn continuation_depth(&self) -> usize {
        self.conts.len()
    }

    pub(super) fn attempt_depth(&self) -> usize {
        self.attempts.len()
    }

    pub(super) fn take_step(&mut self) -> Step {
        mem::replace(&mut self.step, Step::Empty)
    }

    fn take_value(&mut self) -> Option<AnyValue> {
        match self.take_step() {
            Step::Value(value) => Some(value),
            other => {
                self.step = other;
                None
            }
        }
    }

    fn succeed(&mut self, value: AnyValue) {
        self.status = if self.conts.is_empty() {
            FiberStatus::Return
        } else {
            FiberStatus::StepBind
        };
        self.step = Step::Value(value);
    }

    fn fail_with(&mut self, err: Error) {
        self.status = FiberStatus::Return;
        self.step = Step::Empty;
        self.fail = Some(err);
    }

    /// Moves the current continuations into a resume frame so a recovery or
    /// bracket body starts with an empty stack.
    fn save_continuations(&mut self) {
        if !self.conts.is_empty() {
            let saved = mem::take(&mut self.conts);
            let tag = self.interrupt.is_some();
            self.attempts.push(Attempt::new(Frame::Resume(saved), tag));
        }
    }

    fn complete(&mut self) {
        let outcome = if let Some(cause) = &self.interrupt {
            Err(cause.clone())
        } else if let Some(err) = &self.fail {
            Err(err.clone())
        } else {
            Ok(self.take_value().unwrap_or_else(unit))
        };
        self.outcome = Some(outcome);
        self.status = FiberStatus::Completed;
    }
}

impl FiberInner {
    /// Runs the trampoline until the fiber suspends or completes.
    ///
    /// The caller must have set `running` while holding the lock.
    pub(super) fn drive(self: &Arc<Self>) {
        loop {
            let mut m = self.machine.lock();

            if m.kill_requested {
                m.kill_requested = false;
                if m.bracket_depth == 0 && m.status != FiberStatus::Completed {
                    let canceler = if m.status == FiberStatus::Pending {
                        self.generation.fetch_add(1, Ordering::AcqRel);
                        m.canceler.take()
                    } else {
                        None
                    };
                    trace!(fiber = %self.id, status = %m.status, "applying kill");
                    m.status = FiberStatus::Return;
                    m.step = Step::Empty;
                    m.fail = None;
                    if let Some(canceler) = canceler {
                        let cause = m
                            .interrupt
                            .clone()
                            .unwrap_or_else(|| Error::interrupted("killed"));
                        drop(m);
                        let finalizer = catch_fault(|| Ok(canceler.cancel(cause)))
                            .unwrap_or_else(Program::Failed);
                        let mut m = self.machine.lock();
                        m.attempts
                            .push(Attempt::new(Frame::Finalizer(finalizer), true));
                        continue;
                    }
                }
            }

            let status = m.status;
            match status {
                FiberStatus::Suspended => m.status = FiberStatus::Continue,
                FiberStatus::Continue => {
                    let Step::Program(program) = m.take_step() else {
                        m.fail_with(Error::internal("no instruction to continue with"));
                        continue;
                    };
                    match program {
                        Program::Chain(base, k) => {
                            m.conts.push(k);
                            m.step = Step::Program(base.into_inner());
                        }
                        Program::Done(value) => m.succeed(value),
                        Program::Failed(err) => m.fail_with(err),
                        Program::Sync(thunk) => {
                            drop(m);
                            let result = catch_fault(thunk);
                            let mut m = self.machine.lock();
                            m.status = FiberStatus::StepResult;
                            m.step = Step::Result(result);
                        }
                        Program::Async(register) => {
                            let generation = self.generation.load(Ordering::Acquire);
                            m.status = FiberStatus::Pending;
                            drop(m);
                            if self.register_async(generation, register) {
                                return;
                            }
                        }
                        Program::Recover(base, handler) => {
                            m.save_continuations();
                            let tag = m.interrupt.is_some();
                            m.attempts.push(Attempt::new(Frame::Recover(handler), tag));
                            m.step = Step::Program(base.into_inner());
                        }
                        Program::Acquire(acquire, release, use_fn) => {
                            m.bracket_depth += 1;
                            m.save_continuations();
                            let tag = m.interrupt.is_some();
                            m.attempts
                                .push(Attempt::new(Frame::Acquire { release, use_fn }, tag));
                            m.step = Step::Program(acquire.into_inner());
                        }
                        Program::Spawn {
                            immediate,
                            supervised,
                            inner,
                        } => {
                            drop(m);
                            let spawned = if supervised {
                                let supervisor = Supervisor::new(&self.runtime);
                                let child = FiberRef::new(
                                    &self.runtime,
                                    Some(supervisor.clone()),
                                    inner.into_inner(),
                                );
                                trace!(
                                    parent = %self.id,
                                    child = %child.id(),
                                    supervisor = %supervisor.id(),
                                    "supervised fiber spawned"
                                );
                                erase((child, supervisor))
                            } else {
                                erase(self.spawn_child(inner.into_inner(), immediate))
                            };
                            let mut m = self.machine.lock();
                            m.status = FiberStatus::StepResult;
                            m.step = Step::Result(Ok(spawned));
                        }
                        Program::Par(tree) => {
                            m.step = Step::Program(parallel::sequential(
                                &self.runtime,
                                self.supervisor.clone(),
                                tree,
                            ));
                        }
                    }
                }
                FiberStatus::StepBind => {
                    let value = m.take_value();
                    let (Some(k), Some(value)) = (m.conts.pop(), value) else {
                        m.fail_with(Error::internal("no value to bind"));
                        continue;
                    };
                    drop(m);
                    let next = catch_fault(|| Ok(k(value)));
                    let mut m = self.machine.lock();
                    match next {
                        Ok(program) => {
                            m.status = FiberStatus::Continue;
                            m.step = Step::Program(program);
                        }
                        Err(fault) => m.fail_with(fault),
                    }
                }
                FiberStatus::StepResult => match m.take_step() {
                    Step::Result(Ok(value)) => m.succeed(value),
                    Step::Result(Err(err)) => m.fail_with(err),
                    _ => m.fail_with(Error::internal("no step result to interpret")),
                },
                FiberStatus::Pending => {
                    m.running = false;
                    return;
                }
                FiberStatus::Return => self.unwind(m),
                FiberStatus::Completed => {
                    self.finish(m);
                    return;
                }
            }
        }
    }

    /// Pops one attempt frame while in `Return`.
    fn unwind(self: &Arc<Self>, mut m: MutexGuard<'_, Machine>) {
        m.conts.clear();
        let Some(Attempt { frame, interrupted }) = m.attempts.pop() else {
            m.complete();
            return;
        };
        let unmasked = m.interrupt.is_some() && !interrupted && m.bracket_depth == 0;
        match frame {
            Frame::Recover(handler) => {
                if unmasked {
                    return;
                }
                if let Some(err) = m.fail.take() {
                    drop(m);
                    let next = catch_fault(|| Ok(handler(err)));
                    let mut m = self.machine.lock();
                    match next {
                        Ok(program) => {
                            m.status = FiberStatus::Continue;
                            m.step = Step::Program(program);
                        }
                        Err(fault) => m.fail = Some(fault),
                    }
                }
            }
            Frame::Resume(saved) => {
                if !unmasked && m.fail.is_none() && matches!(m.step, Step::Value(_)) {
                    m.conts = saved;
                    m.status = FiberStatus::StepBind;
                }
            }
            Frame::Acquire { release, use_fn } => {
                m.bracket_depth = m.bracket_depth.saturating_sub(1);
                if m.fail.is_some() {
                    return;
                }
                let Some(resource) = m.take_value() else {
                    return;
                };
                m.attempts.push(Attempt::new(
                    Frame::Release {
                        release,
                        resource: Arc::clone(&resource),
                    },
                    interrupted,
                ));
                if m.interrupt.is_some() == interrupted || m.bracket_depth > 0 {
                    m.status = FiberStatus::Continue;
                    drop(m);
                    let next = catch_fault(|| Ok(use_fn(resource)));
                    let mut m = self.machine.lock();
                    match next {
                        Ok(program) => m.step = Step::Program(program),
                        Err(fault) => m.fail_with(fault),
                    }
                }
            }
            Frame::Release { release, resource } => {
                let value = m.take_value();
                let fail = m.fail.take();
                let case = match (&m.interrupt, &fail) {
                    (Some(cause), _) if unmasked => ReleaseCase::Killed(cause.clone()),
                    (_, Some(err)) => ReleaseCase::Failed(err.clone()),
                    _ => ReleaseCase::Completed(value.clone().unwrap_or_else(unit)),
                };
                let tag = m.interrupt.is_some();
                m.attempts
                    .push(Attempt::new(Frame::Finalized { value, fail }, tag));
                m.status = FiberStatus::Continue;
                m.bracket_depth += 1;
                drop(m);
                let next = catch_fault(|| {
                    Ok(match case {
                        ReleaseCase::Killed(cause) => (release.killed)(cause, resource),
                        ReleaseCase::Failed(err) => (release.failed)(err, resource),
                        ReleaseCase::Completed(value) => (release.completed)(value, resource),
                    })
                });
                let mut m = self.machine.lock();
                match next {
                    Ok(program) => m.step = Step::Program(program),
                    Err(fault) => m.fail_with(fault),
                }
            }
            Frame::Finalizer(program) => {
                m.bracket_depth += 1;
                let value = m.take_value();
                let fail = m.fail.take();
                let tag = m.interrupt.is_some();
                m.attempts
                    .push(Attempt::new(Frame::Finalized { value, fail }, tag));
                m.status = FiberStatus::Continue;
                m.step = Step::Program(program);
            }
            Frame::Finalized { value, fail } => {
                m.bracket_depth = m.bracket_depth.saturating_sub(1);
                if let Some(err) = m.fail.take() {
                    fault_event!(warn, self.id, err, "release handler failed");
                }
                m.step = value.map_or(Step::Empty, Step::Value);
                m.fail = fail;
            }
        }
    }

    /// Delivers the outcome to listeners and reports unobserved failures.
    fn finish(self: &Arc<Self>, mut m: MutexGuard<'_, Machine>) {
        let outcome = m
            .outcome
            .clone()
            .unwrap_or_else(|| Err(Error::internal("fiber completed without an outcome")));
        let listeners = m.listeners.take().unwrap_or_default();
        let observed = listeners.values().all(Listener::rethrow);
        m.rethrow = m.rethrow && observed;
        let escaped = if m.interrupt.is_some() {
            m.fail.clone()
        } else {
            None
        };
        m.running = false;
        drop(m);

        self.runtime.stats_recorder().record_completed();
        debug!(
            fiber = %self.id,
            ok = outcome.is_ok(),
            listeners = listeners.len(),
            "fiber completed"
        );
        for listener in listeners.into_values() {
            self.notify(listener, outcome.clone());
        }

        if let Some(err) = escaped {
            self.runtime.report_unhandled(self.id, err);
        } else if let Err(err) = outcome {
            // Listeners registered right after completion may still observe
            // the failure; check again once the current scheduler pass ends.
            let inner = Arc::clone(self);
            self.runtime.scheduler().enqueue(Box::new(move || {
                let rethrow = inner.machine.lock().rethrow;
                if rethrow {
                    inner.runtime.report_unhandled(inner.id, err);
                }
            }));
        }
    }

    /// Calls an async registration. Returns true if the fiber suspended.
    fn register_async(self: &Arc<Self>, generation: u64, register: Register) -> bool {
        let completion = self.completion(generation);
        let canceler = match catch_fault(|| register(completion.clone())) {
            Ok(canceler) => canceler,
            Err(err) => {
                completion.complete(Err(err));
                Canceler::none()
            }
        };
        let mut m = self.machine.lock();
        if m.status == FiberStatus::Pending
            && self.generation.load(Ordering::Acquire) == generation
        {
            m.canceler = Some(canceler);
            if !m.kill_requested {
                m.running = false;
                trace!(fiber = %self.id, generation, "fiber suspended");
                return true;
            }
        }
        false
    }

    /// Builds the completion handler for the suspension at `generation`.
    fn completion(self: &Arc<Self>, generation: u64) -> Completion {
        let inner = Arc::clone(self);
        Completion::new(move |exit| {
            if inner
                .generation
                .compare_exchange(generation, generation + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                trace!(fiber = %inner.id, generation, "stale completion ignored");
                return;
            }
            let target = Arc::clone(&inner);
            inner
                .runtime
                .scheduler()
                .enqueue(Box::new(move || target.resume(generation + 1, exit)));
        })
    }

    fn resume(self: &Arc<Self>, generation: u64, exit: Exit) {
        let mut m = self.machine.lock();
        if self.generation.load(Ordering::Acquire) != generation
            || m.status != FiberStatus::Pending
        {
            trace!(fiber = %self.id, generation, "resume superseded");
            return;
        }
        m.status = FiberStatus::StepResult;
        m.step = Step::Result(exit);
        m.canceler = None;
        if m.running {
            return;
        }
        m.running = true;
        drop(m);
        self.drive();
    }

    fn spawn_child(self: &Arc<Self>, program: Program, immediate: bool) -> FiberRef {
        let child = FiberRef::new(&self.runtime, self.supervisor.clone(), program);
        if let Some(supervisor) = &self.supervisor {
            supervisor.register(&child);
        }
        trace!(parent = %self.id, child = %child.id(), immediate, "fiber spawned");
        if immediate {
            child.run();
        }
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use crate::runtime::Runtime;
    use crate::test_utils::{AsyncProbe, OutcomeSlot, init_test_logging};
    use std::sync::atomic::AtomicUsize;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn done_completes_synchronously() {
        init_test("done_completes_synchronously");
        let runtime = Runtime::new();
        let slot = OutcomeSlot::new();
        let _fiber = runtime.run_with(Effect::pure(7_i32), slot.sink());
        let value = slot.take().expect("completed").expect("ok");
        crate::assert_with_log!(value == 7, "value", 7, value);
        crate::test_complete!("done_completes_synchronously");
    }

    #[test]
    fn chain_feeds_continuation() {
        init_test("chain_feeds_continuation");
        let runtime = Runtime::new();
        let out = runtime.block_on(Effect::pure(10_i32).and_then(|x| Effect::pure(x * 2)));
        assert_eq!(out.expect("ok"), 20);
        crate::test_complete!("chain_feeds_continuation");
    }

    #[test]
    fn failure_skips_continuation() {
        init_test("failure_skips_continuation");
        let runtime = Runtime::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let out = runtime.block_on(Effect::<i32>::fail(Error::failure("boom")).map(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x
        }));
        assert_eq!(out.expect_err("failed").message(), Some("boom"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        crate::test_complete!("failure_skips_continuation");
    }

    #[test]
    fn recover_catches_failure() {
        init_test("recover_catches_failure");
        let runtime = Runtime::new();
        let out = runtime.block_on(
            Effect::<&str>::fail(Error::failure("boom")).recover(|_| Effect::pure("caught")),
        );
        assert_eq!(out.expect("recovered"), "caught");
        crate::test_complete!("recover_catches_failure");
    }

    #[test]
    fn recover_resumes_outer_continuations() {
        init_test("recover_resumes_outer_continuations");
        let runtime = Runtime::new();
        let program = Effect::pure(1_i32)
            .and_then(|x| {
                Effect::<i32>::fail(Error::failure("inner"))
                    .recover(move |_| Effect::pure(x + 10))
            })
            .map(|x| x * 3);
        assert_eq!(runtime.block_on(program).expect("ok"), 33);
        crate::test_complete!("recover_resumes_outer_continuations");
    }

    #[test]
    fn thunk_panic_becomes_fault() {
        init_test("thunk_panic_becomes_fault");
        let runtime = Runtime::new();
        let out = runtime.block_on(Effect::<u8>::sync(|| panic!("thunk exploded")));
        let err = out.expect_err("fault");
        assert!(err.is_fault());
        assert_eq!(err.message(), Some("thunk exploded"));
        crate::test_complete!("thunk_panic_becomes_fault");
    }

    #[test]
    fn continuation_panic_becomes_fault() {
        init_test("continuation_panic_becomes_fault");
        let runtime = Runtime::new();
        let out = runtime.block_on(Effect::pure(1_u8).map(|_| -> u8 { panic!("bind exploded") }));
        assert!(out.expect_err("fault").is_fault());
        crate::test_complete!("continuation_panic_becomes_fault");
    }

    #[test]
    fn registration_error_fails_step() {
        init_test("registration_error_fails_step");
        let runtime = Runtime::new();
        let out = runtime.block_on(Effect::<u8>::async_effect(|_| {
            Err(Error::async_failure("refused"))
        }));
        assert_eq!(out.expect_err("failed").message(), Some("refused"));
        crate::test_complete!("registration_error_fails_step");
    }

    #[test]
    fn duplicate_completion_is_ignored() {
        init_test("duplicate_completion_is_ignored");
        let runtime = Runtime::new();
        let probe = AsyncProbe::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let effect = probe.effect().map(move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            v
        });
        let slot = OutcomeSlot::new();
        let fiber = runtime.run_with(effect, slot.sink());
        assert_eq!(fiber.status(), FiberStatus::Pending);
        assert!(probe.resolve(Ok(1)));
        assert!(probe.resolve(Ok(2)));
        assert!(probe.resolve(Err(Error::failure("late"))));
        assert_eq!(slot.take().expect("done").expect("ok"), 1);
        let count = hits.load(Ordering::SeqCst);
        crate::assert_with_log!(count == 1, "continuation ran once", 1, count);
        crate::test_complete!("duplicate_completion_is_ignored");
    }

    #[test]
    fn synchronous_completion_inside_register() {
        init_test("synchronous_completion_inside_register");
        let runtime = Runtime::new();
        let out = runtime.block_on(
            Effect::<u32>::async_effect(|resolver| {
                resolver.succeed(5);
                Ok(Canceler::none())
            })
            .map(|v| v + 1),
        );
        assert_eq!(out.expect("ok"), 6);
        crate::test_complete!("synchronous_completion_inside_register");
    }

    #[test]
    fn kill_pending_runs_canceler_once() {
        init_test("kill_pending_runs_canceler_once");
        let runtime = Runtime::new();
        let probe = AsyncProbe::<u32>::new();
        let slot = OutcomeSlot::new();
        let fiber = runtime.run_with(probe.effect(), slot.sink());
        let acked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&acked);
        let _ = fiber.kill(Error::interrupted("stop"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(acked.load(Ordering::SeqCst), 1);
        assert_eq!(probe.cancellations(), 1);
        let err = slot.take().expect("done").expect_err("killed");
        assert_eq!(err.message(), Some("stop"));
        // A completion arriving after the kill is stale.
        probe.resolve(Ok(9));
        assert_eq!(probe.cancellations(), 1);
        crate::test_complete!("kill_pending_runs_canceler_once");
    }

    #[test]
    fn interrupt_is_not_recovered() {
        init_test("interrupt_is_not_recovered");
        let runtime = Runtime::new();
        let probe = AsyncProbe::<u32>::new();
        let recovered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&recovered);
        let effect = probe.effect().recover(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Effect::pure(0)
        });
        let slot = OutcomeSlot::new();
        let fiber = runtime.run_with(effect, slot.sink());
        let _ = fiber.kill(Error::interrupted("stop"), || {});
        assert!(slot.take().expect("done").expect_err("killed").is_interrupt());
        assert_eq!(recovered.load(Ordering::SeqCst), 0);
        crate::test_complete!("interrupt_is_not_recovered");
    }

    #[cfg(feature = "tracing-integration")]
    #[test]
    fn release_failure_is_logged() {
        init_test("release_failure_is_logged");
        let capture = crate::test_utils::LogCapture::new();
        let runtime = Runtime::new();
        let effect = Effect::bracket(
            Effect::pure(2_u32),
            |_| Effect::fail(Error::failure("release broke")),
            |r| Effect::pure(r * 3),
        );
        let slot = OutcomeSlot::new();
        capture.scoped(|| {
            let _fiber = runtime.run_with(effect, slot.sink());
        });
        assert_eq!(slot.take().expect("done").expect("completed"), 6);
        let logged = capture.contents();
        assert!(logged.contains("release handler failed"), "{logged}");
        assert!(logged.contains("release broke"), "{logged}");
        crate::test_complete!("release_failure_is_logged");
    }

    #[test]
    fn kill_inside_bracket_defers_to_release() {
        init_test("kill_inside_bracket_defers_to_release");
        let runtime = Runtime::new();
        let acquire_probe = AsyncProbe::<u32>::new();
        let released = Arc::new(AtomicUsize::new(0));
        let used = Arc::new(AtomicUsize::new(0));
        let release_counter = Arc::clone(&released);
        let use_counter = Arc::clone(&used);
        let effect = Effect::bracket(
            acquire_probe.effect(),
            move |_| {
                release_counter.fetch_add(1, Ordering::SeqCst);
                Effect::unit()
            },
            move |r| {
                use_counter.fetch_add(1, Ordering::SeqCst);
                Effect::pure(r)
            },
        );
        let slot = OutcomeSlot::new();
        let fiber = runtime.run_with(effect, slot.sink());
        let _ = fiber.kill(Error::interrupted("stop"), || {});
        // Still waiting on the protected acquisition.
        assert!(slot.get().is_none());
        assert_eq!(acquire_probe.cancellations(), 0);
        acquire_probe.resolve(Ok(4));
        let err = slot.take().expect("done").expect_err("killed");
        assert!(err.is_interrupt());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(used.load(Ordering::SeqCst), 0);
        crate::test_complete!("kill_inside_bracket_defers_to_release");
    }
}
