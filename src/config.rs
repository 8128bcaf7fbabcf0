//! Engine configuration
//!
//! Configuration for the validation engine, loaded from the environment or set
//! explicitly by the embedding application.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

/// Prefix of every job workspace created in the system temporary directory
pub const WORKSPACE_PREFIX: &str = "lms_validator_";

/// Validation engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Free space required on the target file system before unpacking (default: 50MB)
    pub min_free_disk_bytes: u64,
    /// Name prefix for job workspaces
    pub workspace_prefix: String,
    /// Timeout used for configure/make/compiler steps when a caller has no own value
    pub compile_timeout: Duration,
    /// Timeout used for student programs when a caller has no own value
    pub run_timeout: Duration,
    /// Additional compiler profile definitions, merged over the built-in ones
    pub compilers_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_free_disk_bytes: 50 * 1024 * 1024,
            workspace_prefix: WORKSPACE_PREFIX.to_string(),
            compile_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(30),
            compilers_path: None,
        }
    }
}

impl EngineConfig {
    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `LMS_VALIDATOR_MIN_FREE_MB`, `LMS_VALIDATOR_COMPILE_TIMEOUT`,
    /// `LMS_VALIDATOR_RUN_TIMEOUT` (seconds) and `LMS_VALIDATOR_COMPILERS`.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(mb) = env_u64("LMS_VALIDATOR_MIN_FREE_MB")? {
            config.min_free_disk_bytes = mb * 1024 * 1024;
        }
        if let Some(secs) = env_u64("LMS_VALIDATOR_COMPILE_TIMEOUT")? {
            config.compile_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LMS_VALIDATOR_RUN_TIMEOUT")? {
            config.run_timeout = Duration::from_secs(secs);
        }
        if let Ok(path) = std::env::var("LMS_VALIDATOR_COMPILERS") {
            config.compilers_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }
}

fn env_u64(key: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {}", key, value)),
        Err(_) => Ok(None),
    }
}

/// Global engine configuration
static ENGINE_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Initialize the engine configuration
pub fn init_config(config: EngineConfig) -> anyhow::Result<()> {
    ENGINE_CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Engine configuration already initialized"))?;

    Ok(())
}

/// Get engine configuration
pub fn get_config() -> &'static EngineConfig {
    ENGINE_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<EngineConfig> = OnceLock::new();

        DEFAULT.get_or_init(|| {
            warn!("Engine configuration not initialized, using default");
            EngineConfig::default()
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.min_free_disk_bytes, 50 * 1024 * 1024);
        assert_eq!(config.workspace_prefix, "lms_validator_");
        assert_eq!(config.compile_timeout, Duration::from_secs(30));
        assert!(config.compilers_path.is_none());
    }

    #[test]
    fn test_env_u64_missing_is_none() {
        assert_eq!(env_u64("LMS_VALIDATOR_TEST_SURELY_UNSET").unwrap(), None);
    }
}
