//! Deadline for an effect.

use std::time::Duration;

use super::delay;
use crate::effect::{Effect, Par};
use crate::error::{Error, Result};
use crate::types::FiberValue;

/// Runs `effect`, failing with [`ErrorKind::TimedOut`](crate::error::ErrorKind::TimedOut)
/// if it has not concluded within `duration`.
///
/// The effect and a timer run as two parallel branches. Whichever
/// concludes first, success or failure, decides the outcome and the other
/// branch is killed before this effect resumes.
pub fn timeout<T: FiberValue>(duration: Duration, effect: Effect<T>) -> Effect<T> {
    let timer = delay(duration).map(move |()| -> Result<T> {
        Err(Error::timed_out(format!("no outcome within {duration:?}")))
    });
    Par::new(effect.attempt())
        .alt(Par::new(timer))
        .sequential()
        .and_then(|outcome| outcome.map_or_else(Effect::fail, Effect::pure))
}
