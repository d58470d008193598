//! Runtime configuration types.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ConfigError;

const DEFAULT_QUEUE_LIMIT: usize = 1024;
const DEFAULT_THREAD_NAME_PREFIX: &str = "effect-fiber-fault";

/// What the runtime does with a failure no listener observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnhandledFaultPolicy {
    /// Log the fault at error level and continue.
    #[default]
    Log,
    /// Re-raise the fault as a panic on a detached thread.
    Panic,
    /// Drop the fault (still counted in the runtime stats).
    Ignore,
}

impl UnhandledFaultPolicy {
    /// Returns the lowercase name used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Panic => "panic",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for UnhandledFaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnhandledFaultPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "panic" => Ok(Self::Panic),
            "ignore" => Ok(Self::Ignore),
            other => Err(ConfigError::Invalid(format!(
                "unknown unhandled fault policy {other:?} (expected log, panic or ignore)"
            ))),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    /// Capacity of the scheduler queue. When full, the oldest task runs
    /// inline before the new one is queued.
    pub scheduler_queue_limit: usize,
    /// Route fiber starts through the scheduler instead of driving them on
    /// the caller's stack.
    pub defer_start: bool,
    /// Handling of failures that no listener observed.
    pub unhandled_fault_policy: UnhandledFaultPolicy,
    /// Name prefix for the detached threads that re-raise faults.
    pub thread_name_prefix: String,
}

impl RuntimeConfig {
    /// Replaces unusable values with their defaults.
    pub fn normalize(&mut self) {
        if self.scheduler_queue_limit == 0 {
            self.scheduler_queue_limit = 1;
        }
        if self.thread_name_prefix.trim().is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler_queue_limit: DEFAULT_QUEUE_LIMIT,
            defer_start: true,
            unhandled_fault_policy: UnhandledFaultPolicy::Log,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}
