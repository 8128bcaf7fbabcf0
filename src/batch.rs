//! Batch validation
//!
//! Pairs validator files with assignments by name and validates every
//! gradable submission, one job after the other. `hello.zip` or `Hello.toml`
//! validate the assignment named `hello`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::files::{Submission, SubmissionFile};
use crate::job::{ResultSink, ValidationJob};
use crate::validator::ValidatorRegistry;

/// An assignment with its submissions
#[derive(Debug, Clone)]
pub struct Assignment {
    pub id: String,
    pub name: String,
    pub submissions: Vec<Submission>,
}

impl Assignment {
    /// Read an assignment from a directory with one subdirectory per submission.
    ///
    /// The directory name is the assignment name, subdirectory names are the
    /// submission ids.
    pub fn from_local_dir(dir: &Path) -> anyhow::Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("Not a directory path: {:?}", dir))?;

        let mut submission_dirs = Vec::new();
        for entry in
            std::fs::read_dir(dir).with_context(|| format!("Failed to read directory {:?}", dir))?
        {
            let path = entry?.path();
            if path.is_dir() {
                submission_dirs.push(path);
            }
        }
        submission_dirs.sort();

        let submissions = submission_dirs
            .iter()
            .map(|path| {
                let id = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Submission::from_local_dir(id, path)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            id: name.clone(),
            name,
            submissions,
        })
    }

    /// All assignments below `root`, sorted by name
    pub fn all_from_local_dir(root: &Path) -> anyhow::Result<Vec<Self>> {
        let mut dirs = Vec::new();
        for entry in
            std::fs::read_dir(root).with_context(|| format!("Failed to read directory {:?}", root))?
        {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        dirs.iter().map(|d| Self::from_local_dir(d)).collect()
    }
}

/// Totals of a batch run
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchSummary {
    pub jobs: usize,
    pub passed: usize,
    pub failed: usize,
    /// Jobs whose validator could not be loaded
    pub not_loaded: usize,
    /// Submissions whose job was aborted
    pub faults: Vec<String>,
    /// Assignments without a matching validator
    pub skipped_assignments: Vec<String>,
}

/// Matching key of an assignment or validator name
pub fn match_key(name: &str) -> String {
    let name = name.trim();
    let stem = name.split('.').next().unwrap_or(name);
    stem.trim().to_lowercase()
}

/// Validator files in `dir`, by matching key
pub fn find_validators(dir: &Path) -> anyhow::Result<HashMap<String, PathBuf>> {
    let mut validators = HashMap::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("Failed to read directory {:?}", dir))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        validators.insert(match_key(&name), path);
    }
    Ok(validators)
}

/// Validate every gradable submission of the assignments that have a validator
pub async fn run_batch(
    validators_dir: &Path,
    assignments: &[Assignment],
    registry: &ValidatorRegistry,
    sink: Arc<dyn ResultSink>,
) -> anyhow::Result<BatchSummary> {
    let validators = find_validators(validators_dir)?;
    info!(
        "Found {} validators in {:?}",
        validators.len(),
        validators_dir
    );

    let mut summary = BatchSummary::default();

    for assignment in assignments {
        let Some(path) = validators.get(&match_key(&assignment.name)) else {
            info!("No validator for assignment '{}', skipping", assignment.name);
            summary.skipped_assignments.push(assignment.name.clone());
            continue;
        };
        let validator_file = SubmissionFile::from_local_file(path, None)?;

        let gradable: Vec<&Submission> = assignment
            .submissions
            .iter()
            .filter(|s| s.is_gradable())
            .collect();
        info!(
            "Assignment '{}': {} of {} submissions to validate with {}",
            assignment.name,
            gradable.len(),
            assignment.submissions.len(),
            validator_file.name
        );

        for submission in gradable {
            summary.jobs += 1;
            let job = ValidationJob::new(submission.clone(), validator_file.clone(), sink.clone());

            match job.start(registry).await {
                Ok(outcome) => match &outcome.result {
                    Some(result) if result.passed => summary.passed += 1,
                    Some(_) => summary.failed += 1,
                    None => {
                        warn!(
                            "No result for submission {}: {}",
                            outcome.submission_id,
                            outcome.load_error.as_deref().unwrap_or("unknown reason")
                        );
                        summary.not_loaded += 1;
                    }
                },
                Err(fault) => {
                    error!("{}: {:#}", fault, fault.error);
                    summary.faults.push(fault.submission);
                }
            }
        }
    }

    info!(
        "Batch finished: {} jobs, {} passed, {} failed, {} not loaded, {} aborted",
        summary.jobs,
        summary.passed,
        summary.failed,
        summary.not_loaded,
        summary.faults.len()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_key() {
        assert_eq!(match_key(" Hello World.zip"), "hello world");
        assert_eq!(match_key("calc.tar.gz"), "calc");
        assert_eq!(match_key("CALC"), "calc");
    }

    #[test]
    fn test_find_validators() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Hello.toml"), "").unwrap();
        std::fs::write(dir.path().join("calc.tar.gz"), "").unwrap();
        std::fs::create_dir(dir.path().join("ignored")).unwrap();

        let validators = find_validators(dir.path()).unwrap();
        assert_eq!(validators.len(), 2);
        assert!(validators["hello"].ends_with("Hello.toml"));
        assert!(validators.contains_key("calc"));
    }

    #[test]
    fn test_assignment_from_local_dir() {
        let root = tempfile::tempdir().unwrap();
        let assignment_dir = root.path().join("hello");
        std::fs::create_dir_all(assignment_dir.join("s2")).unwrap();
        std::fs::create_dir_all(assignment_dir.join("s1")).unwrap();
        std::fs::write(assignment_dir.join("s1/hello.c"), "int main;").unwrap();

        let assignments = Assignment::all_from_local_dir(root.path()).unwrap();
        assert_eq!(assignments.len(), 1);
        let ids: Vec<_> = assignments[0]
            .submissions
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert!(assignments[0].submissions[0].is_gradable());
        assert!(!assignments[0].submissions[1].is_gradable());
    }
}
