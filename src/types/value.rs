//! The erased value carrier.
//!
//! Programs are interpreted without knowing the types of the values that flow
//! through them. Values are carried as [`AnyValue`] and recovered at typed
//! boundaries with [`unerase`]. The typed [`Effect`](crate::effect::Effect)
//! API guarantees the recovered type matches; a mismatch is reported as an
//! [`ErrorKind::Internal`](crate::error::ErrorKind::Internal) error rather
//! than a panic.

use std::any::{Any, type_name};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A type-erased, shareable value.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// The outcome of a fiber or step, in erased form.
pub(crate) type Exit = Result<AnyValue>;

/// Bound for values produced by effects.
///
/// Outcomes are delivered to every completion listener, so values must be
/// cloneable and shareable across threads.
pub trait FiberValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> FiberValue for T {}

/// Erases a value.
pub(crate) fn erase<T: Send + Sync + 'static>(value: T) -> AnyValue {
    Arc::new(value)
}

/// The erased unit value.
pub(crate) fn unit() -> AnyValue {
    erase(())
}

/// Recovers a typed value, cloning only when the value is shared.
pub(crate) fn unerase<T: FiberValue>(value: AnyValue) -> Result<T> {
    match value.downcast::<T>() {
        Ok(typed) => Ok(Arc::try_unwrap(typed).unwrap_or_else(|shared| (*shared).clone())),
        Err(_) => Err(Error::internal(format!(
            "value reaching a typed boundary is not a {}",
            type_name::<T>()
        ))),
    }
}

/// Recovers a typed outcome.
pub(crate) fn unerase_exit<T: FiberValue>(exit: Exit) -> Result<T> {
    exit.and_then(unerase)
}
