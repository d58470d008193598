//! Core types for the fiber runtime.
//!
//! - [`FiberId`], [`SupervisorId`]: identifiers for runtime entities
//! - [`AnyValue`], [`FiberValue`]: the erased value carrier and the bound on
//!   values produced by effects

pub mod id;
pub mod value;

pub use id::{FiberId, SupervisorId};
pub use value::{AnyValue, FiberValue};
