//! N-ary race: first success wins.

use super::balanced;
use crate::effect::{Effect, Par};
use crate::types::FiberValue;

/// Runs every effect in parallel; the first success wins and the others
/// are killed.
///
/// If every branch fails, the failure of the left-most branch of the final
/// pairing is reported. An empty race never completes.
pub fn race<T, I>(effects: I) -> Effect<T>
where
    T: FiberValue,
    I: IntoIterator<Item = Effect<T>>,
{
    let leaves = effects.into_iter().map(Par::new).collect();
    balanced(leaves, Par::alt).map_or_else(Effect::never, Par::sequential)
}
