//! End-to-end fiber lifecycle: sequencing, recovery, async completion from
//! foreign threads, joining, and unhandled fault reporting.

use std::thread;
use std::time::Duration;

use effect_fiber::test_utils::{
    AsyncProbe, HitCounter, OutcomeSlot, init_test_logging, runtime_with_fault_log,
};
use effect_fiber::{Effect, Error, ErrorKind, FiberStatus, Par, Runtime};

fn init_test(name: &str) {
    init_test_logging();
    effect_fiber::test_phase!(name);
}

#[test]
fn long_synchronous_chain_does_not_grow_the_stack() {
    init_test("long_synchronous_chain_does_not_grow_the_stack");
    let runtime = Runtime::new();
    let mut effect = Effect::pure(0_u64);
    for _ in 0..100_000 {
        effect = effect.and_then(|n| Effect::pure(n + 1));
    }
    let out = runtime.block_on(effect);
    assert_eq!(out.expect("chain result"), 100_000);
    effect_fiber::test_complete!("long_synchronous_chain_does_not_grow_the_stack");
}

#[test]
fn dropping_unrun_long_chain_is_stack_safe() {
    init_test("dropping_unrun_long_chain_is_stack_safe");
    let mut effect = Effect::pure(0_u64);
    for _ in 0..100_000 {
        effect = effect.and_then(|n| Effect::pure(n + 1));
    }
    drop(effect);

    let mut tree = Par::new(Effect::pure(0_u64));
    for i in 1..100_000 {
        tree = tree.alt(Par::new(Effect::pure(i)));
    }
    drop(tree);
    effect_fiber::test_complete!("dropping_unrun_long_chain_is_stack_safe");
}

#[test]
fn killed_suspended_fiber_releases_its_program() {
    init_test("killed_suspended_fiber_releases_its_program");
    let runtime = Runtime::new();
    let mut effect = Effect::pure(0_u64);
    for _ in 0..100_000 {
        effect = effect.and_then(|n| Effect::pure(n + 1));
    }
    let fiber = runtime.fiber(effect);
    let _ = fiber.kill(Error::interrupted("never started"), || {});
    assert_eq!(fiber.status(), FiberStatus::Completed);
    assert_eq!(fiber.snapshot().continuations, 0);
    drop(fiber);
    effect_fiber::test_complete!("killed_suspended_fiber_releases_its_program");
}

#[test]
fn rerunning_a_completed_fiber_is_inert() {
    init_test("rerunning_a_completed_fiber_is_inert");
    let runtime = Runtime::new();
    let thunk_hits = HitCounter::new();
    let listener_hits = HitCounter::new();
    let counter = thunk_hits.clone();
    let fiber = runtime.fiber(Effect::sync(move || {
        counter.hit();
        7_u32
    }));
    let first = listener_hits.clone();
    let _token = fiber.on_complete(false, move |outcome| {
        assert_eq!(outcome.expect("value"), 7);
        first.hit();
    });
    fiber.run();
    assert!(fiber.is_completed());
    assert_eq!(thunk_hits.count(), 1);
    assert_eq!(listener_hits.count(), 1);

    fiber.run();
    let joined = OutcomeSlot::new();
    let _ = fiber.join(joined.sink());
    assert_eq!(joined.take().expect("joined").expect("value"), 7);
    fiber.run();
    assert_eq!(thunk_hits.count(), 1);
    assert_eq!(listener_hits.count(), 1);
    effect_fiber::test_complete!("rerunning_a_completed_fiber_is_inert");
}

#[test]
fn deep_recursion_through_suspend() {
    init_test("deep_recursion_through_suspend");
    fn count_down(n: u32) -> Effect<u32> {
        if n == 0 {
            Effect::pure(0)
        } else {
            Effect::suspend(move || count_down(n - 1)).map(|acc| acc + 1)
        }
    }
    let runtime = Runtime::new();
    let out = runtime.block_on(count_down(50_000));
    assert_eq!(out.expect("recursion result"), 50_000);
    effect_fiber::test_complete!("deep_recursion_through_suspend");
}

#[test]
fn recovery_resumes_the_chain() {
    init_test("recovery_resumes_the_chain");
    let runtime = Runtime::new();
    let effect = Effect::<u32>::fail(Error::failure("boom"))
        .map(|n| n + 100)
        .recover(|err| {
            assert_eq!(err.message(), Some("boom"));
            Effect::pure(1)
        })
        .map(|n| n * 10);
    assert_eq!(runtime.block_on(effect).expect("recovered"), 10);
    effect_fiber::test_complete!("recovery_resumes_the_chain");
}

#[test]
fn attempt_and_map_err_shape_failures() {
    init_test("attempt_and_map_err_shape_failures");
    let runtime = Runtime::new();
    let reified = runtime
        .block_on(
            Effect::<u8>::fail(Error::failure("inner"))
                .map_err(|err| err.with_message("outer"))
                .attempt(),
        )
        .expect("attempt never fails");
    let err = reified.expect_err("still a failure");
    assert_eq!(err.message(), Some("outer"));
    assert_eq!(err.kind(), ErrorKind::Failure);
    effect_fiber::test_complete!("attempt_and_map_err_shape_failures");
}

#[test]
fn panics_in_user_code_become_faults() {
    init_test("panics_in_user_code_become_faults");
    let runtime = Runtime::new();
    let out = runtime.block_on(Effect::sync(|| -> u8 { panic!("thunk exploded") }));
    let err = out.expect_err("panic is captured");
    assert!(err.to_string().contains("thunk exploded"));
    effect_fiber::test_complete!("panics_in_user_code_become_faults");
}

#[test]
fn completion_from_another_thread_resumes_the_fiber() {
    init_test("completion_from_another_thread_resumes_the_fiber");
    let runtime = Runtime::new();
    let probe = AsyncProbe::<u32>::new();
    let slot = OutcomeSlot::new();
    let fiber = runtime.run_with(probe.effect().map(|n| n + 1), slot.sink());
    assert_eq!(fiber.status(), FiberStatus::Pending);

    let remote = probe.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        remote.resolve(Ok(41))
    });
    assert!(worker.join().expect("worker thread"));

    assert_eq!(slot.take().expect("completed").expect("success"), 42);
    assert_eq!(fiber.status(), FiberStatus::Completed);
    effect_fiber::test_complete!("completion_from_another_thread_resumes_the_fiber");
}

#[test]
fn second_resolution_is_ignored() {
    init_test("second_resolution_is_ignored");
    let runtime = Runtime::new();
    let probe = AsyncProbe::<u32>::new();
    let slot = OutcomeSlot::new();
    let _fiber = runtime.run_with(probe.effect(), slot.sink());
    assert!(probe.resolve(Ok(1)));
    assert!(probe.resolve(Ok(2)));
    assert_eq!(slot.take().expect("completed").expect("success"), 1);
    assert_eq!(slot.deliveries(), 1);
    effect_fiber::test_complete!("second_resolution_is_ignored");
}

#[test]
fn spawned_child_is_joined() {
    init_test("spawned_child_is_joined");
    let runtime = Runtime::new();
    let probe = AsyncProbe::<u32>::new();
    let child_effect = probe.effect().map(|n| n * 2);
    let slot = OutcomeSlot::new();
    let _parent = runtime.run_with(
        child_effect
            .spawn()
            .and_then(|child| child.join_effect())
            .map(|n| n + 1),
        slot.sink(),
    );
    assert_eq!(probe.registrations(), 1);
    probe.resolve(Ok(10));
    assert_eq!(slot.take().expect("completed").expect("joined"), 21);
    effect_fiber::test_complete!("spawned_child_is_joined");
}

#[test]
fn suspended_child_starts_on_first_join() {
    init_test("suspended_child_starts_on_first_join");
    let runtime = Runtime::new();
    let started = HitCounter::new();
    let counter = started.clone();
    let effect = Effect::sync(move || {
        counter.hit();
        5_u8
    })
    .spawn_suspended()
    .and_then(|child| {
        assert_eq!(child.status(), FiberStatus::Suspended);
        child.join_effect()
    });
    assert_eq!(runtime.block_on(effect).expect("joined"), 5);
    assert_eq!(started.count(), 1);
    effect_fiber::test_complete!("suspended_child_starts_on_first_join");
}

#[test]
fn unobserved_child_failure_is_reported() {
    init_test("unobserved_child_failure_is_reported");
    let (runtime, faults) = runtime_with_fault_log();
    let out = runtime.block_on(
        Effect::<u8>::fail(Error::failure("orphan"))
            .spawn()
            .map(|_| ()),
    );
    assert!(out.is_ok());
    let recorded = faults.take();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].message(), Some("orphan"));
    effect_fiber::test_complete!("unobserved_child_failure_is_reported");
}

#[test]
fn joined_child_failure_is_not_reported() {
    init_test("joined_child_failure_is_not_reported");
    let (runtime, faults) = runtime_with_fault_log();
    let out = runtime.block_on(
        Effect::<u8>::fail(Error::failure("observed"))
            .spawn_suspended()
            .and_then(|child| child.join_effect())
            .attempt(),
    );
    assert!(out.expect("attempt").is_err());
    assert!(faults.is_empty());
    effect_fiber::test_complete!("joined_child_failure_is_not_reported");
}

#[test]
fn stats_count_spawned_children() {
    init_test("stats_count_spawned_children");
    let runtime = Runtime::new();
    let effect = Effect::pure(1_u8)
        .spawn()
        .and_then(|_| Effect::pure(2_u8).spawn())
        .map(|_| ());
    runtime.block_on(effect).expect("spawned");
    let stats = runtime.stats();
    assert_eq!(stats.fibers_spawned, 3);
    assert_eq!(stats.fibers_completed, 3);
    assert_eq!(stats.live(), 0);
    effect_fiber::test_complete!("stats_count_spawned_children");
}
