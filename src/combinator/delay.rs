//! Timer effect.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::effect::{Canceler, Effect};
use crate::error::Error;
use crate::tracing_compat::trace;

const TIMER_THREAD_NAME: &str = "effect-fiber-delay";

/// Cancellation flag shared between a timer thread and its canceler.
struct TimerFlag {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl TimerFlag {
    /// Sleeps until `deadline` or cancellation. Returns true if the timer
    /// should fire.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.wake.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        !*cancelled
    }

    fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.wake.notify_all();
    }
}

/// Completes after `duration`.
///
/// The timer runs on a helper thread; killing the waiting fiber wakes the
/// thread and the completion is never delivered. A zero duration completes
/// immediately.
pub fn delay(duration: Duration) -> Effect<()> {
    Effect::async_effect(move |resolver| {
        if duration.is_zero() {
            resolver.succeed(());
            return Ok(Canceler::none());
        }
        let flag = Arc::new(TimerFlag {
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        });
        let timer = Arc::clone(&flag);
        let deadline = Instant::now() + duration;
        thread::Builder::new()
            .name(TIMER_THREAD_NAME.to_string())
            .spawn(move || {
                if timer.sleep_until(deadline) {
                    trace!(?duration, "delay elapsed");
                    resolver.succeed(());
                }
            })
            .map_err(|e| Error::async_failure(format!("failed to start timer thread: {e}")))?;
        Ok(Canceler::from_fn(move || flag.cancel()))
    })
}
