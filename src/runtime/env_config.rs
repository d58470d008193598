//! Environment variable and config file support for [`RuntimeBuilder`](super::builder::RuntimeBuilder).
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set via builder methods (`scheduler_queue_limit(64)`)
//! 2. **Environment variables**: values from `EFFECT_FIBER_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: built-in defaults from [`RuntimeConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `EFFECT_FIBER_SCHEDULER_QUEUE_LIMIT` | `usize` | `scheduler_queue_limit` |
//! | `EFFECT_FIBER_DEFER_START` | `bool` | `defer_start` |
//! | `EFFECT_FIBER_UNHANDLED_FAULT_POLICY` | `log`/`panic`/`ignore` | `unhandled_fault_policy` |
//! | `EFFECT_FIBER_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |

use super::ConfigError;
use super::config::{RuntimeConfig, UnhandledFaultPolicy};

/// Environment variable name for the scheduler queue capacity.
pub const ENV_SCHEDULER_QUEUE_LIMIT: &str = "EFFECT_FIBER_SCHEDULER_QUEUE_LIMIT";
/// Environment variable name for the deferred-start toggle.
pub const ENV_DEFER_START: &str = "EFFECT_FIBER_DEFER_START";
/// Environment variable name for the unhandled fault policy.
pub const ENV_UNHANDLED_FAULT_POLICY: &str = "EFFECT_FIBER_UNHANDLED_FAULT_POLICY";
/// Environment variable name for the fault thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "EFFECT_FIBER_THREAD_NAME_PREFIX";

/// Apply environment variable overrides to a [`RuntimeConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<(), ConfigError> {
    apply_overrides_from(config, |name| std::env::var(name).ok())
}

/// Like [`apply_env_overrides`], reading variables through `lookup`.
pub fn apply_overrides_from<F>(config: &mut RuntimeConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup(ENV_SCHEDULER_QUEUE_LIMIT) {
        config.scheduler_queue_limit = parse_usize(ENV_SCHEDULER_QUEUE_LIMIT, &val)?;
    }
    if let Some(val) = lookup(ENV_DEFER_START) {
        config.defer_start = parse_bool(ENV_DEFER_START, &val)?;
    }
    if let Some(val) = lookup(ENV_UNHANDLED_FAULT_POLICY) {
        config.unhandled_fault_policy =
            val.parse::<UnhandledFaultPolicy>()
                .map_err(|e| ConfigError::InvalidEnv {
                    var: ENV_UNHANDLED_FAULT_POLICY.to_string(),
                    detail: e.to_string(),
                })?;
    }
    if let Some(val) = lookup(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    Ok(())
}

fn parse_usize(var_name: &str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidEnv {
            var: var_name.to_string(),
            detail: format!("expected unsigned integer, got {val:?} ({e})"),
        })
}

fn parse_bool(var_name: &str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var_name.to_string(),
            detail: format!("expected bool (true/false/1/0/yes/no), got {val:?}"),
        }),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable runtime configuration.
///
/// ```toml
/// [scheduler]
/// queue_limit = 256
/// defer_start = true
///
/// [faults]
/// policy = "panic"
/// thread_name_prefix = "myapp-fault"
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct RuntimeTomlConfig {
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerToml,
    /// Unhandled fault settings.
    #[serde(default)]
    pub faults: FaultsToml,
}

/// Scheduler section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct SchedulerToml {
    /// Scheduler queue capacity.
    pub queue_limit: Option<usize>,
    /// Route fiber starts through the scheduler.
    pub defer_start: Option<bool>,
}

/// Faults section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct FaultsToml {
    /// Unhandled fault policy.
    pub policy: Option<UnhandledFaultPolicy>,
    /// Name prefix for fault threads.
    pub thread_name_prefix: Option<String>,
}

/// Apply a parsed TOML config to a [`RuntimeConfig`].
///
/// Only fields that are `Some` in the TOML struct override the config.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut RuntimeConfig, toml: &RuntimeTomlConfig) {
    if let Some(v) = toml.scheduler.queue_limit {
        config.scheduler_queue_limit = v;
    }
    if let Some(v) = toml.scheduler.defer_start {
        config.defer_start = v;
    }
    if let Some(v) = toml.faults.policy {
        config.unhandled_fault_policy = v;
    }
    if let Some(ref v) = toml.faults.thread_name_prefix {
        config.thread_name_prefix.clone_from(v);
    }
}

/// Parse a TOML string into a [`RuntimeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<RuntimeTomlConfig, ConfigError> {
    Ok(toml::from_str(toml_str)?)
}

/// Read and parse a TOML file into a [`RuntimeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<RuntimeTomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn parse_usize_valid() {
        assert_eq!(super::parse_usize("TEST", "42").unwrap(), 42);
        assert_eq!(super::parse_usize("TEST", " 100 ").unwrap(), 100);
    }

    #[test]
    fn parse_usize_invalid() {
        assert!(super::parse_usize("TEST", "abc").is_err());
        assert!(super::parse_usize("TEST", "-1").is_err());
        assert!(super::parse_usize("TEST", "").is_err());
    }

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE", "On"] {
            assert!(super::parse_bool("TEST", val).unwrap(), "expected true for {val}");
        }
        for val in &["false", "0", "no", "off", "FALSE"] {
            assert!(!super::parse_bool("TEST", val).unwrap(), "expected false for {val}");
        }
        assert!(super::parse_bool("TEST", "maybe").is_err());
    }

    #[test]
    fn unset_variables_leave_defaults() {
        let mut config = RuntimeConfig::default();
        apply_overrides_from(&mut config, lookup_in(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn every_variable_applies() {
        let mut config = RuntimeConfig::default();
        apply_overrides_from(
            &mut config,
            lookup_in(&[
                (ENV_SCHEDULER_QUEUE_LIMIT, "64"),
                (ENV_DEFER_START, "off"),
                (ENV_UNHANDLED_FAULT_POLICY, "Ignore"),
                (ENV_THREAD_NAME_PREFIX, "svc-fault"),
            ]),
        )
        .unwrap();
        assert_eq!(config.scheduler_queue_limit, 64);
        assert!(!config.defer_start);
        assert_eq!(config.unhandled_fault_policy, UnhandledFaultPolicy::Ignore);
        assert_eq!(config.thread_name_prefix, "svc-fault");
    }

    #[test]
    fn invalid_value_names_the_variable() {
        let mut config = RuntimeConfig::default();
        let err = apply_overrides_from(&mut config, lookup_in(&[(ENV_DEFER_START, "sometimes")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DEFER_START));
        let err = apply_overrides_from(
            &mut config,
            lookup_in(&[(ENV_UNHANDLED_FAULT_POLICY, "abort")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref var, .. } if var == ENV_UNHANDLED_FAULT_POLICY));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_sections_apply() {
        let parsed = parse_toml_str(
            "[scheduler]\nqueue_limit = 8\n\n[faults]\npolicy = \"panic\"\n",
        )
        .unwrap();
        let mut config = RuntimeConfig::default();
        apply_toml_config(&mut config, &parsed);
        assert_eq!(config.scheduler_queue_limit, 8);
        assert!(config.defer_start);
        assert_eq!(config.unhandled_fault_policy, UnhandledFaultPolicy::Panic);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn toml_parse_error_is_reported() {
        assert!(matches!(
            parse_toml_str("[scheduler\nqueue_limit = 8"),
            Err(ConfigError::Parse(_))
        ));
    }
}
