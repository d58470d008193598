//! Scoped child fibers.

use crate::effect::{BracketConditions, Effect, Par};
use crate::error::Error;
use crate::fiber::Fiber;
use crate::supervisor::Supervisor;
use crate::types::FiberValue;

/// Runs `effect` in a fiber of its own under a fresh [`Supervisor`].
///
/// Every fiber spawned while it runs, directly or transitively, is
/// registered with that supervisor and killed once `effect` concludes.
/// The outcome of `effect` is delivered only after those kills have been
/// acknowledged. Killing the supervising fiber kills `effect` and its
/// children together.
pub fn supervise<T: FiberValue>(effect: Effect<T>) -> Effect<T> {
    let acquire = effect.spawn_supervised().and_then(|(fiber, supervisor)| {
        Effect::sync(move || {
            fiber.run();
            (fiber, supervisor)
        })
    });
    Effect::general_bracket(
        acquire,
        BracketConditions::new(
            |cause: Error, (fiber, supervisor): (Fiber<T>, Supervisor)| {
                Par::new(fiber.kill_effect(cause.clone()))
                    .zip(Par::new(supervisor.kill_all_effect(cause)))
                    .sequential()
                    .void()
            },
            |_, (_, supervisor): (Fiber<T>, Supervisor)| supervisor.kill_all_effect(outlived()),
            |_, (_, supervisor): (Fiber<T>, Supervisor)| supervisor.kill_all_effect(outlived()),
        ),
        |(fiber, _)| fiber.join_effect(),
    )
}

fn outlived() -> Error {
    Error::interrupted("child fiber outlived its supervisor")
}
