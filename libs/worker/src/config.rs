//! Configuration for the worker core.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::version::Version;

/// Default mount path of the per-container scratch volume.
pub const DEFAULT_SCRATCH_PATH: &str = "/scratch";

/// Worker core configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Reserved mount path for the scratch volume every container gets.
    pub scratch_path: String,

    /// Version every selected worker must be compatible with, if any.
    pub required_worker_version: Option<Version>,

    /// SQLite database for container records.
    pub state_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scratch_path: DEFAULT_SCRATCH_PATH.to_string(),
            required_worker_version: None,
            state_path: PathBuf::from("/var/lib/stevedore/state.db"),
            log_level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let scratch_path = lookup("STEVEDORE_SCRATCH_PATH").unwrap_or(defaults.scratch_path);

        let required_worker_version = lookup("STEVEDORE_REQUIRED_WORKER_VERSION")
            .map(|raw| {
                raw.parse::<Version>()
                    .with_context(|| format!("invalid STEVEDORE_REQUIRED_WORKER_VERSION {raw:?}"))
            })
            .transpose()?;

        let state_path = lookup("STEVEDORE_STATE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_path);

        let log_level = lookup("STEVEDORE_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            scratch_path,
            required_worker_version,
            state_path,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.scratch_path, "/scratch");
        assert!(config.required_worker_version.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_config_overrides() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("STEVEDORE_SCRATCH_PATH", "/tmp/scratch"),
            ("STEVEDORE_REQUIRED_WORKER_VERSION", "2.1"),
            ("STEVEDORE_STATE_PATH", "/tmp/state.db"),
        ]))
        .unwrap();

        assert_eq!(config.scratch_path, "/tmp/scratch");
        assert_eq!(config.state_path, PathBuf::from("/tmp/state.db"));
        assert_eq!(
            config.required_worker_version.unwrap().to_string(),
            "2.1"
        );
    }

    #[test]
    fn test_config_rejects_bad_version() {
        let result = WorkerConfig::from_lookup(lookup_from(&[(
            "STEVEDORE_REQUIRED_WORKER_VERSION",
            "2..1",
        )]));
        assert!(result.is_err());
    }
}
