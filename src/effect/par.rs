//! Parallel composition trees.
//!
//! A [`Par`] describes work whose leaves run concurrently, each in its own
//! fiber, once the tree is sequenced back into an [`Effect`]. Interior nodes
//! combine results:
//!
//! | Node | Semantics |
//! |------|-----------|
//! | [`Par::map`] | transform the child's success |
//! | [`Par::zip_with`], [`Par::apply`] | both must succeed; the first failure cancels the other side |
//! | [`Par::alt`] | the first success wins and cancels the other side; if both fail the left error is kept |

use core::fmt;
use core::mem;
use core::ops::Deref;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::effect::Effect;
use crate::effect::program::{Detached, Link, Program, teardown};
use crate::error::{Result, catch_fault};
use crate::types::value::{erase, unerase};
use crate::types::{AnyValue, FiberValue};

pub(crate) type MapFn = Box<dyn FnOnce(AnyValue) -> Result<AnyValue> + Send>;
pub(crate) type ApplyFn = Box<dyn FnOnce(AnyValue, AnyValue) -> Result<AnyValue> + Send>;

/// Erased parallel composition tree.
pub(crate) enum ParTree {
    Leaf(Link),
    Map(MapFn, Branch),
    Apply(ApplyFn, Branch, Branch),
    Alt(Branch, Branch),
}

impl ParTree {
    fn vacant() -> Self {
        Self::Leaf(Link::new(Program::vacant()))
    }
}

/// Owning pointer to a subtree, dropped without recursion.
pub(crate) struct Branch(Box<ParTree>);

impl Branch {
    fn new(tree: ParTree) -> Self {
        Self(Box::new(tree))
    }

    pub(crate) fn into_inner(mut self) -> ParTree {
        self.take()
    }

    pub(crate) fn take(&mut self) -> ParTree {
        mem::replace(&mut *self.0, ParTree::vacant())
    }
}

impl Deref for Branch {
    type Target = ParTree;

    fn deref(&self) -> &ParTree {
        &self.0
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        if !matches!(*self.0, ParTree::Leaf(_)) {
            teardown(Detached::Tree(self.take()));
        }
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Debug for ParTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(program) => f.debug_tuple("Leaf").field(program).finish(),
            Self::Map(_, child) => f.debug_tuple("Map").field(child).finish(),
            Self::Apply(_, lhs, rhs) => f.debug_tuple("Apply").field(lhs).field(rhs).finish(),
            Self::Alt(lhs, rhs) => f.debug_tuple("Alt").field(lhs).field(rhs).finish(),
        }
    }
}

/// A function value that can flow through a parallel tree.
pub type ParFn<A, B> = Arc<dyn Fn(A) -> B + Send + Sync>;

/// A typed parallel composition tree producing a `T`.
#[must_use = "a Par does nothing until sequenced and run"]
pub struct Par<T> {
    tree: ParTree,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Par<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Par").field(&self.tree).finish()
    }
}

impl<T: FiberValue> Par<T> {
    const fn from_tree(tree: ParTree) -> Self {
        Self {
            tree,
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn into_tree(self) -> ParTree {
        self.tree
    }

    /// Lifts an effect into a leaf that runs in its own fiber.
    pub fn new(effect: Effect<T>) -> Self {
        Self::from_tree(ParTree::Leaf(Link::new(effect.into_program())))
    }

    /// Transforms the success value.
    pub fn map<U, F>(self, f: F) -> Par<U>
    where
        U: FiberValue,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Par::from_tree(ParTree::Map(
            Box::new(move |value| {
                let typed = unerase::<T>(value)?;
                catch_fault(|| Ok(erase(f(typed))))
            }),
            Branch::new(self.tree),
        ))
    }

    /// Runs both trees in parallel and combines their successes.
    ///
    /// The first failure from either side cancels the other side.
    pub fn zip_with<U, V, F>(self, other: Par<U>, f: F) -> Par<V>
    where
        U: FiberValue,
        V: FiberValue,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        Par::from_tree(ParTree::Apply(
            Box::new(move |lhs, rhs| {
                let left = unerase::<T>(lhs)?;
                let right = unerase::<U>(rhs)?;
                catch_fault(|| Ok(erase(f(left, right))))
            }),
            Branch::new(self.tree),
            Branch::new(other.tree),
        ))
    }

    /// Runs both trees in parallel and pairs their successes.
    pub fn zip<U: FiberValue>(self, other: Par<U>) -> Par<(T, U)> {
        self.zip_with(other, |a, b| (a, b))
    }

    /// Runs both trees in parallel; the first success wins.
    pub fn alt(self, other: Self) -> Self {
        Self::from_tree(ParTree::Alt(Branch::new(self.tree), Branch::new(other.tree)))
    }

    /// Sequences the tree back into an effect.
    pub fn sequential(self) -> Effect<T> {
        Effect::from_program(Program::Par(self.tree))
    }
}

impl<A: FiberValue, B: FiberValue> Par<ParFn<A, B>> {
    /// Applies a function computed in parallel to an argument computed in
    /// parallel.
    pub fn apply(self, arg: Par<A>) -> Par<B> {
        self.zip_with(arg, |f, a| f(a))
    }
}
