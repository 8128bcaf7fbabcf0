//! Validator module - instructor-supplied grading logic
//!
//! A validator is anything implementing [`Validator`]. The validator file of
//! an assignment is staged into the job workspace, where it must provide the
//! entry point `validator.toml`. Its `validator` key names a registered
//! validator, all other keys are that validator's parameters:
//!
//! ```toml
//! validator = "script"
//!
//! [[step]]
//! action = "prepare"
//!
//! [[step]]
//! action = "build"
//! compiler = "gcc"
//! inputs = ["hello.c"]
//! output = "hello"
//! ```

pub mod script;
pub mod search_path;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use crate::core::JobError;
use crate::job::ValidationJob;
pub use script::ScriptValidator;

/// File name every staged validator must provide
pub const VALIDATOR_ENTRY_POINT: &str = "validator.toml";

/// Validator used when the entry point names none
pub const DEFAULT_VALIDATOR: &str = "script";

/// Grading logic for one assignment.
///
/// `validate` drives the job: it must call
/// [`ValidationJob::prepare_student_files`] before anything else, and may send
/// a result itself. Returning `Ok` without a result counts as a pass. Any
/// expected [`JobError`] becomes a fail result.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, job: &mut ValidationJob) -> Result<(), JobError>;
}

type Factory = Arc<dyn Fn(&toml::Table) -> anyhow::Result<Arc<dyn Validator>> + Send + Sync>;

/// Validators known by name
#[derive(Clone)]
pub struct ValidatorRegistry {
    factories: HashMap<String, Factory>,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ValidatorRegistry {
    /// A registry without any validator
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the step-script validator
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register_factory(DEFAULT_VALIDATOR, |params| {
            let validator: Arc<dyn Validator> = Arc::new(ScriptValidator::from_table(params)?);
            Ok(validator)
        });
        registry
    }

    /// Register a validator that takes no parameters
    pub fn register(&mut self, name: &str, validator: impl Validator + 'static) {
        let validator: Arc<dyn Validator> = Arc::new(validator);
        self.register_factory(name, move |_| Ok(validator.clone()));
    }

    /// Register a validator built from the entry point parameters
    pub fn register_factory<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&toml::Table) -> anyhow::Result<Arc<dyn Validator>> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.trim().to_lowercase(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the validator described by an entry point file
    pub fn load_entry_point(&self, path: &Path) -> anyhow::Result<Arc<dyn Validator>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Validator entry point {:?} is missing or unreadable", path))?;
        let params: toml::Table = toml::from_str(&content)
            .with_context(|| format!("Validator entry point {:?} is not valid TOML", path))?;

        let name = match params.get("validator") {
            None => DEFAULT_VALIDATOR.to_string(),
            Some(toml::Value::String(name)) => name.trim().to_lowercase(),
            Some(other) => anyhow::bail!("Validator name must be a string, got {}", other),
        };
        debug!("Loading validator '{}' from {:?}", name, path);

        let factory = self
            .factories
            .get(&name)
            .with_context(|| format!("Unknown validator '{}'", name))?;
        factory(&params).with_context(|| format!("Failed to set up validator '{}'", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Validator for Noop {
        async fn validate(&self, _job: &mut ValidationJob) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn entry_point(content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VALIDATOR_ENTRY_POINT), content).unwrap();
        dir
    }

    #[test]
    fn test_registered_validator_is_found() {
        let mut registry = ValidatorRegistry::with_builtins();
        registry.register("Noop", Noop);
        assert_eq!(registry.names(), vec!["noop", "script"]);

        let dir = entry_point("validator = \"noop\"\n");
        assert!(registry
            .load_entry_point(&dir.path().join(VALIDATOR_ENTRY_POINT))
            .is_ok());
    }

    #[test]
    fn test_default_is_script() {
        let registry = ValidatorRegistry::default();
        let dir = entry_point("[[step]]\naction = \"prepare\"\n");
        assert!(registry
            .load_entry_point(&dir.path().join(VALIDATOR_ENTRY_POINT))
            .is_ok());
    }

    #[test]
    fn test_unknown_validator() {
        let registry = ValidatorRegistry::with_builtins();
        let dir = entry_point("validator = \"python\"\n");
        let err = registry
            .load_entry_point(&dir.path().join(VALIDATOR_ENTRY_POINT))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unknown validator 'python'"));
    }

    #[test]
    fn test_missing_entry_point() {
        let registry = ValidatorRegistry::with_builtins();
        let dir = tempfile::tempdir().unwrap();
        assert!(registry
            .load_entry_point(&dir.path().join(VALIDATOR_ENTRY_POINT))
            .is_err());
    }

    #[test]
    fn test_broken_toml() {
        let registry = ValidatorRegistry::with_builtins();
        let dir = entry_point("validator = \n");
        assert!(registry
            .load_entry_point(&dir.path().join(VALIDATOR_ENTRY_POINT))
            .is_err());
    }
}
