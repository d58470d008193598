//! Runtime builder.

use std::sync::Arc;

use super::config::{RuntimeConfig, UnhandledFaultPolicy};
use super::{ConfigError, FaultHook, Runtime, env_config};
use crate::error::Error;
use crate::types::FiberId;

/// Programmatic settings; each one beats every other source.
#[derive(Debug, Default, Clone)]
struct Overrides {
    scheduler_queue_limit: Option<usize>,
    defer_start: Option<bool>,
    unhandled_fault_policy: Option<UnhandledFaultPolicy>,
    thread_name_prefix: Option<String>,
}

/// Builder for [`Runtime`].
///
/// Sources are layered at [`build`](Self::build) time regardless of the
/// order the builder methods were called in: programmatic values, then
/// environment variables (if [`with_env_overrides`](Self::with_env_overrides)
/// was called), then the config file, then defaults.
#[derive(Default)]
pub struct RuntimeBuilder {
    overrides: Overrides,
    use_env: bool,
    #[cfg(feature = "config-file")]
    file: Option<env_config::RuntimeTomlConfig>,
    fault_hook: Option<FaultHook>,
}

impl RuntimeBuilder {
    /// Create a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduler queue capacity.
    #[must_use]
    pub fn scheduler_queue_limit(mut self, limit: usize) -> Self {
        self.overrides.scheduler_queue_limit = Some(limit);
        self
    }

    /// Route fiber starts through the scheduler (`true`) or drive them on
    /// the caller's stack.
    #[must_use]
    pub fn defer_start(mut self, defer: bool) -> Self {
        self.overrides.defer_start = Some(defer);
        self
    }

    /// Set the policy for failures no listener observed.
    #[must_use]
    pub fn unhandled_fault_policy(mut self, policy: UnhandledFaultPolicy) -> Self {
        self.overrides.unhandled_fault_policy = Some(policy);
        self
    }

    /// Set the name prefix of detached fault threads.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.overrides.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Register a callback invoked for every unhandled fault before the
    /// policy is applied.
    #[must_use]
    pub fn fault_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(FiberId, &Error) + Send + Sync + 'static,
    {
        self.fault_hook = Some(Arc::new(hook));
        self
    }

    /// Read `EFFECT_FIBER_*` environment variables when building.
    ///
    /// Variables are validated eagerly so a malformed value is reported
    /// here rather than at [`build`](Self::build).
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        env_config::apply_env_overrides(&mut RuntimeConfig::default())?;
        self.use_env = true;
        Ok(self)
    }

    /// Load settings from a TOML file.
    #[cfg(feature = "config-file")]
    pub fn config_file(mut self, path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        self.file = Some(env_config::parse_toml_file(path.as_ref())?);
        Ok(self)
    }

    /// Load settings from a TOML string.
    #[cfg(feature = "config-file")]
    pub fn config_toml(mut self, source: &str) -> Result<Self, ConfigError> {
        self.file = Some(env_config::parse_toml_str(source)?);
        Ok(self)
    }

    /// Resolves the layered configuration.
    pub fn resolve(&self) -> Result<RuntimeConfig, ConfigError> {
        let mut config = RuntimeConfig::default();
        #[cfg(feature = "config-file")]
        if let Some(file) = &self.file {
            env_config::apply_toml_config(&mut config, file);
        }
        if self.use_env {
            env_config::apply_env_overrides(&mut config)?;
        }
        let Overrides {
            scheduler_queue_limit,
            defer_start,
            unhandled_fault_policy,
            thread_name_prefix,
        } = self.overrides.clone();
        if let Some(v) = scheduler_queue_limit {
            config.scheduler_queue_limit = v;
        }
        if let Some(v) = defer_start {
            config.defer_start = v;
        }
        if let Some(v) = unhandled_fault_policy {
            config.unhandled_fault_policy = v;
        }
        if let Some(v) = thread_name_prefix {
            config.thread_name_prefix = v;
        }
        config.normalize();
        Ok(config)
    }

    /// Build a runtime from this configuration.
    pub fn build(self) -> Result<Runtime, ConfigError> {
        let config = self.resolve()?;
        Ok(Runtime::from_parts(config, self.fault_hook))
    }
}
