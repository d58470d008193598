//! Parallel sequencing of many effects.

use super::balanced;
use crate::effect::{Effect, Par};
use crate::types::FiberValue;

/// Runs every effect in parallel and collects the successes in input order.
///
/// The first failure kills every branch still running and is reported once
/// they have all concluded.
pub fn par_all<T, I>(effects: I) -> Effect<Vec<T>>
where
    T: FiberValue,
    I: IntoIterator<Item = Effect<T>>,
{
    let leaves = effects
        .into_iter()
        .map(|effect| Par::new(effect).map(|value| vec![value]))
        .collect();
    balanced(leaves, |left, right| {
        left.zip_with(right, |mut items, rest| {
            items.extend(rest);
            items
        })
    })
    .map_or_else(|| Effect::pure(Vec::new()), Par::sequential)
}

/// Applies `f` to every item and runs the resulting effects in parallel.
pub fn par_traverse<A, B, I, F>(items: I, f: F) -> Effect<Vec<B>>
where
    B: FiberValue,
    I: IntoIterator<Item = A>,
    F: FnMut(A) -> Effect<B>,
{
    par_all(items.into_iter().map(f))
}

/// Runs two effects in parallel and pairs their successes.
pub fn both<A: FiberValue, B: FiberValue>(left: Effect<A>, right: Effect<B>) -> Effect<(A, B)> {
    Par::new(left).zip(Par::new(right)).sequential()
}
