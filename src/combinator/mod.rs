//! Derived effects built from the core primitives.
//!
//! This module provides:
//!
//! - [`delay`](fn@delay): Suspend for a duration on a helper timer thread
//! - [`timeout`](fn@timeout): Race an effect against a deadline
//! - [`race`](fn@race): N-ary parallel alternative, first success wins
//! - [`par_all`] / [`par_traverse`] / [`both`]: Parallel sequencing
//! - [`supervise`](fn@supervise): Kill every fiber an effect spawned once it concludes

pub mod delay;
pub mod join;
pub mod race;
pub mod supervise;
pub mod timeout;

pub use delay::delay;
pub use join::{both, par_all, par_traverse};
pub use race::race;
pub use supervise::supervise;
pub use timeout::timeout;

use crate::effect::Par;
use crate::types::FiberValue;

/// Folds `level` pairwise into a balanced tree, preserving left-to-right
/// order. Returns `None` for an empty input.
pub(crate) fn balanced<T, F>(mut level: Vec<Par<T>>, combine: F) -> Option<Par<T>>
where
    T: FiberValue,
    F: Fn(Par<T>, Par<T>) -> Par<T>,
{
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut pairs = level.into_iter();
        while let Some(left) = pairs.next() {
            match pairs.next() {
                Some(right) => next.push(combine(left, right)),
                None => next.push(left),
            }
        }
        level = next;
    }
    level.pop()
}
