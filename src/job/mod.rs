//! Validation job
//!
//! One job validates one submission with one validator:
//!
//! 1. a fresh workspace is created
//! 2. the validator file is staged and its entry point loaded
//! 3. the validator runs and calls back into the job
//! 4. exactly one result reaches the result sink
//! 5. the workspace is removed, whatever happened before
//!
//! Expected failures of the submission end up as fail results. Validator
//! protocol violations and internal errors abort the job with a [`JobFault`].

mod sink;

pub use sink::{LogSink, MemorySink, ResultSink};

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use regex::bytes::Regex;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::compiler::CompilerProfile;
use crate::config::get_config;
use crate::core::{
    JobError, JobFault, JobOutcome, JobState, ValidationResult, DEFAULT_PASS_STUDENT,
    DEFAULT_PASS_TUTOR,
};
use crate::files::{unpack, Submission, SubmissionFile};
use crate::runner::{ProgramSpec, RunningProgram};
use crate::validator::{search_path, Validator, ValidatorRegistry, VALIDATOR_ENTRY_POINT};

const CONFIGURE: &str = "configure";
const MAKEFILE: &str = "Makefile";

pub struct ValidationJob {
    submission: Submission,
    validator_file: SubmissionFile,
    sink: Arc<dyn ResultSink>,
    workspace: Option<TempDir>,
    prepared: bool,
    /// Top-level names written by `prepare_student_files`
    student_files: BTreeSet<String>,
    result: Option<ValidationResult>,
    state: JobState,
}

impl ValidationJob {
    pub fn new(
        submission: Submission,
        validator_file: SubmissionFile,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            submission,
            validator_file,
            sink,
            workspace: None,
            prepared: false,
            student_files: BTreeSet::new(),
            result: None,
            state: JobState::Created,
        }
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// The result sent so far, if any
    pub fn result(&self) -> Option<&ValidationResult> {
        self.result.as_ref()
    }

    /// Directory the job works in
    pub fn workspace_path(&self) -> Result<&Path, JobError> {
        self.workspace
            .as_ref()
            .map(|w| w.path())
            .ok_or_else(|| JobError::Protocol("the job has no workspace yet".to_string()))
    }

    fn prepared_workspace(&self) -> Result<PathBuf, JobError> {
        let dir = self.workspace_path()?;
        if !self.prepared {
            return Err(JobError::Protocol(
                "prepare_student_files() was not called before".to_string(),
            ));
        }
        Ok(dir.to_path_buf())
    }

    /// Run the job to completion.
    ///
    /// A validator that cannot be loaded ends the job without a result. A
    /// validator that panics unwinds out of this call; the workspace is still
    /// removed.
    pub async fn start(mut self, registry: &ValidatorRegistry) -> Result<JobOutcome, JobFault> {
        info!("Validating {}", self.submission);

        let workspace = tempfile::Builder::new()
            .prefix(&get_config().workspace_prefix)
            .tempdir()
            .context("Failed to create job workspace");
        let workspace = match workspace {
            Ok(workspace) => workspace,
            Err(e) => return Err(self.fault(JobError::Internal(e))),
        };
        debug!("Workspace for submission {}: {:?}", self.submission.id, workspace.path());
        let dir = workspace.path().to_path_buf();
        self.workspace = Some(workspace);
        self.state = JobState::WorkspaceStaged;

        let validator = match self.load_validator(&dir, registry) {
            Ok(validator) => validator,
            Err(e) => {
                error!(
                    "Internal problem, validator for submission {} could not be loaded: {:#}",
                    self.submission.id, e
                );
                let outcome = self.outcome(Some(format!("{:#}", e)));
                self.teardown();
                return Ok(outcome);
            }
        };
        self.state = JobState::ValidatorLoaded;

        let validation = {
            let _scope = search_path::enter(&dir).await;
            self.state = JobState::Executing;
            validator.validate(&mut self).await
        };

        let fault = match validation {
            Ok(()) => {
                if self.result.is_none() {
                    debug!("Validator sent no result, using default pass");
                    self.send_pass_result(DEFAULT_PASS_STUDENT, DEFAULT_PASS_TUTOR)
                        .await;
                }
                None
            }
            Err(e) => match e.messages() {
                Some((student, tutor)) => {
                    info!("Validation of submission {} failed: {}", self.submission.id, e);
                    self.send_fail_result(student, tutor).await;
                    None
                }
                None => Some(e),
            },
        };

        let outcome = self.outcome(None);
        match fault {
            Some(error) => {
                error!("Validation of submission {} aborted: {:#}", self.submission.id, error);
                let fault = self.fault(error);
                self.teardown();
                Err(fault)
            }
            None => {
                self.teardown();
                Ok(outcome)
            }
        }
    }

    fn load_validator(
        &self,
        dir: &Path,
        registry: &ValidatorRegistry,
    ) -> anyhow::Result<Arc<dyn Validator>> {
        if self.validator_file.is_archive() {
            unpack(&self.validator_file, dir, false, false)?;
        } else {
            self.validator_file
                .save_as(dir, VALIDATOR_ENTRY_POINT)
                .with_context(|| format!("Failed to stage validator {}", self.validator_file))?;
        }

        registry.load_entry_point(&dir.join(VALIDATOR_ENTRY_POINT))
    }

    fn outcome(&self, load_error: Option<String>) -> JobOutcome {
        JobOutcome {
            submission_id: self.submission.id.clone(),
            reached: self.state,
            result: self.result.clone(),
            load_error,
        }
    }

    fn fault(&self, error: JobError) -> JobFault {
        JobFault {
            submission: self.submission.id.clone(),
            error,
        }
    }

    fn teardown(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            let path = workspace.path().to_path_buf();
            if let Err(e) = workspace.close() {
                warn!("Failed to remove workspace {:?}: {}", path, e);
            }
        }
        self.state = JobState::TornDown;
    }

    /// Stage the submission files into the workspace.
    ///
    /// Archives are extracted, flat when `remove_directories` is set. With
    /// `recode`, text files are converted to UTF-8.
    pub fn prepare_student_files(
        &mut self,
        remove_directories: bool,
        recode: bool,
    ) -> Result<(), JobError> {
        let dir = self.workspace_path()?.to_path_buf();

        if self.submission.files.is_empty() {
            return Err(JobError::NoFiles);
        }

        for file in &self.submission.files {
            debug!("Staging student file {}", file);
            let written = unpack(file, &dir, remove_directories, recode)?;
            self.student_files.extend(written);
        }

        info!(
            "Staged {} student files for submission {}",
            self.student_files.len(),
            self.submission.id
        );
        self.prepared = true;
        Ok(())
    }

    /// Run `./configure` if present. A missing script fails only when `mandatory`.
    pub async fn run_configure(&mut self, mandatory: bool, timeout: Duration) -> Result<(), JobError> {
        let dir = self.prepared_workspace()?;
        let script = dir.join(CONFIGURE);

        if !script.exists() {
            if mandatory {
                return Err(JobError::FileNotFound(CONFIGURE.to_string()));
            }
            debug!("No configure script, skipping");
            return Ok(());
        }

        make_executable(&script)?;
        let mut program = self.spawn("./configure", Vec::new(), timeout, None)?;
        program.expect_exit_status(0).await?;
        Ok(())
    }

    /// Run `make` if a Makefile is present. A missing Makefile fails only when `mandatory`.
    pub async fn run_make(&mut self, mandatory: bool, timeout: Duration) -> Result<(), JobError> {
        let dir = self.prepared_workspace()?;

        if !dir.join(MAKEFILE).exists() {
            if mandatory {
                return Err(JobError::FileNotFound(MAKEFILE.to_string()));
            }
            debug!("No Makefile, skipping");
            return Ok(());
        }

        let mut program = self.spawn("make", Vec::new(), timeout, None)?;
        program.expect_exit_status(0).await?;
        Ok(())
    }

    /// Compile with the given profile and require exit status 0.
    ///
    /// Returns the compiler output.
    pub async fn run_compiler(
        &mut self,
        profile: &CompilerProfile,
        inputs: &[String],
        output: Option<&str>,
        timeout: Duration,
    ) -> Result<String, JobError> {
        self.prepared_workspace()?;
        let (program, args) = profile.build_cmdline(inputs, output)?;

        info!("Compiling {:?} with {}", inputs, profile.name);
        let mut compiler = self.spawn(&program, args, timeout, None)?;
        compiler.expect_exit_status(0).await
    }

    /// Optional configure, optional make, then the compiler
    pub async fn run_build(
        &mut self,
        profile: &CompilerProfile,
        inputs: &[String],
        output: Option<&str>,
        timeout: Duration,
    ) -> Result<String, JobError> {
        self.prepared_workspace()?;
        info!("Running build steps for submission {}", self.submission.id);

        self.run_configure(false, timeout).await?;
        self.run_make(false, timeout).await?;
        self.run_compiler(profile, inputs, output, timeout).await
    }

    /// Start a program in the workspace for interaction
    pub fn spawn_program(
        &self,
        name: &str,
        args: &[String],
        timeout: Duration,
        encoding: Option<&str>,
    ) -> Result<RunningProgram, JobError> {
        self.prepared_workspace()?;
        self.spawn(name, args.to_vec(), timeout, encoding)
    }

    /// Run a program to its end. Returns exit code and output.
    pub async fn run_program(
        &self,
        name: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<(Option<i32>, String), JobError> {
        let mut program = self.spawn_program(name, args, timeout, None)?;
        program.wait_for_end().await
    }

    fn spawn(
        &self,
        name: &str,
        args: Vec<String>,
        timeout: Duration,
        encoding: Option<&str>,
    ) -> Result<RunningProgram, JobError> {
        let mut spec = ProgramSpec::new(name)
            .with_args(args)
            .with_work_dir(self.workspace_path()?)
            .with_timeout(timeout);
        if let Some(label) = encoding {
            spec = spec.with_encoding(label);
        }
        RunningProgram::spawn(spec)
    }

    /// Staged student files whose content matches `pattern`.
    ///
    /// Directories are searched recursively. Returns sorted paths relative to
    /// the workspace.
    pub fn grep(&self, pattern: &str) -> Result<Vec<String>, JobError> {
        let dir = self.prepared_workspace()?;
        let regex = Regex::new(pattern).map_err(|e| {
            JobError::InvalidConfiguration(format!("invalid grep pattern '{}': {}", pattern, e))
        })?;

        let mut matches = Vec::new();
        for name in &self.student_files {
            grep_path(&regex, &dir, &dir.join(name), &mut matches)?;
        }
        matches.sort();
        debug!("Pattern '{}' found in {:?}", pattern, matches);
        Ok(matches)
    }

    /// Whether every name exists directly in the workspace.
    ///
    /// Only plain entries of the workspace root count; paths with separators,
    /// `..` or absolute paths never match.
    pub fn ensure_files(&self, names: &[&str]) -> Result<bool, JobError> {
        let dir = self.prepared_workspace()?;
        let present = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory {:?}", dir))?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<BTreeSet<String>, _>>()
            .with_context(|| format!("Failed to read directory {:?}", dir))?;

        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| !present.contains(*name))
            .collect();

        if !missing.is_empty() {
            debug!("Missing files in workspace: {:?}", missing);
        }
        Ok(missing.is_empty())
    }

    pub async fn send_pass_result(&mut self, student: impl Into<String>, tutor: impl Into<String>) {
        self.send_result(ValidationResult::pass(student, tutor)).await;
    }

    pub async fn send_fail_result(&mut self, student: impl Into<String>, tutor: impl Into<String>) {
        self.send_result(ValidationResult::fail(student, tutor)).await;
    }

    async fn send_result(&mut self, result: ValidationResult) {
        if let Some(sent) = &self.result {
            warn!(
                "Ignoring redundant {} result for submission {}, already sent {}: {}",
                result.verdict(),
                self.submission.id,
                sent.verdict(),
                result.tutor_message
            );
            return;
        }

        info!(
            "Sending {} result for submission {}: {}",
            result.verdict(),
            self.submission.id,
            result.tutor_message
        );
        if let Err(e) = self.sink.save_feedback(&self.submission, &result).await {
            error!(
                "Failed to save feedback for submission {}: {:#}",
                self.submission.id, e
            );
        }
        self.result = Some(result);
        self.state = JobState::ResultSent;
    }
}

fn make_executable(path: &Path) -> Result<(), JobError> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)
        .with_context(|| format!("Failed to read permissions of {:?}", path))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("Failed to make {:?} executable", path))?;
    Ok(())
}

fn grep_path(
    regex: &Regex,
    root: &Path,
    path: &Path,
    matches: &mut Vec<String>,
) -> Result<(), JobError> {
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", path))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let content = fs::read(entry.path())
            .with_context(|| format!("Failed to read {:?}", entry.path()))?;
        if regex.is_match(&content) {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            matches.push(relative.to_string_lossy().into_owned());
        }
    }
    Ok(())
}
