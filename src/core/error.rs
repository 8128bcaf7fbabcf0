//! Failure taxonomy of a validation job
//!
//! Every failure a validator can run into is a [`JobError`]. Most variants are
//! *expected*: they describe a problem with the student submission and are
//! turned into a fail result by the job. [`JobError::Protocol`] and
//! [`JobError::Internal`] are not; they abort the job as a [`JobFault`].

use std::io;

use thiserror::Error;

/// Student text used whenever the problem is on the course side
pub const CONTACT_STAFF: &str =
    "Internal error with the validator. Please contact your course responsible.";

#[derive(Debug, Error)]
pub enum JobError {
    /// The submission has no files to stage
    #[error("the submission contains no files")]
    NoFiles,

    /// The program exited while it was still expected to interact
    #[error("'{program}' terminated unexpectedly")]
    ProcessTerminated { program: String, output: String },

    /// The program did not respond within its timeout
    #[error("'{program}' did not finish within its timeout")]
    ProcessTimeout { program: String, output: String },

    /// The program ended with another exit status than expected
    #[error("'{program}' exited with status {}, expected {expected}", display_status(.got))]
    WrongExitStatus {
        program: String,
        expected: i32,
        got: Option<i32>,
        output: String,
    },

    /// Spawning or talking to the program failed on the OS level
    #[error("failed to execute '{program}': {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: io::Error,
        output: String,
    },

    /// Raised by validator authors with their own texts
    #[error("{tutor}")]
    Custom { student: String, tutor: String },

    /// Not enough resources on the executing host
    #[error("{tutor}")]
    ResourceExhausted { student: String, tutor: String },

    /// A submitted archive could not be read
    #[error("archive '{name}' could not be unpacked: {reason}")]
    BrokenArchive { name: String, reason: String },

    /// A required file is not part of the workspace
    #[error("missing file: {0}")]
    FileNotFound(String),

    /// A profile, pattern or script step is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The validator called the job in the wrong order
    #[error("validator protocol violated: {0}")]
    Protocol(String),

    /// Anything the engine does not know how to classify
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn display_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "unknown".to_string(),
    }
}

impl JobError {
    /// Error raised by validator code with separate student and tutor texts
    pub fn custom(student: impl Into<String>, tutor: impl Into<String>) -> Self {
        JobError::Custom {
            student: student.into(),
            tutor: tutor.into(),
        }
    }

    /// Whether the job turns this error into a fail result
    pub fn is_expected(&self) -> bool {
        !matches!(self, JobError::Protocol(_) | JobError::Internal(_))
    }

    /// Program output captured up to the failure, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            JobError::ProcessTerminated { output, .. }
            | JobError::ProcessTimeout { output, .. }
            | JobError::WrongExitStatus { output, .. }
            | JobError::SpawnFailure { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Student and tutor texts for an expected failure.
    ///
    /// Returns `None` for the kinds that must not be reported to students.
    pub fn messages(&self) -> Option<(String, String)> {
        let messages = match self {
            JobError::NoFiles => {
                let text = "Your submission contains no files.".to_string();
                (text.clone(), text)
            }
            JobError::ProcessTerminated { program, output } => {
                let text = with_output(
                    format!("The execution of '{}' terminated unexpectedly.", program),
                    output,
                );
                (text.clone(), text)
            }
            JobError::ProcessTimeout { program, output } => (
                with_output(
                    format!(
                        "The execution of '{}' was cancelled, since it took too long.",
                        program
                    ),
                    output,
                ),
                with_output(
                    format!("The execution of '{}' was cancelled due to timeout.", program),
                    output,
                ),
            ),
            JobError::WrongExitStatus {
                program,
                got,
                output,
                ..
            } => {
                let text = with_output(
                    format!(
                        "The execution of '{}' resulted in the unexpected exit status {}.",
                        program,
                        display_status(got)
                    ),
                    output,
                );
                (text.clone(), text)
            }
            JobError::SpawnFailure {
                program,
                source,
                output,
            } => (
                format!(
                    "Unexpected problem during the execution of '{}'. Please contact the course responsible.",
                    program
                ),
                with_output(
                    format!("Unknown error during the execution of '{}': {}", program, source),
                    output,
                ),
            ),
            JobError::Custom { student, tutor } | JobError::ResourceExhausted { student, tutor } => {
                (student.clone(), tutor.clone())
            }
            JobError::BrokenArchive { name, reason } => (
                format!("The archive '{}' in your submission could not be unpacked.", name),
                format!("Broken archive '{}': {}", name, reason),
            ),
            JobError::FileNotFound(name) => (
                format!("A file is missing: {}", name),
                format!("Missing file: {}", name),
            ),
            JobError::InvalidConfiguration(detail) => (
                CONTACT_STAFF.to_string(),
                format!("Validator configuration problem: {}", detail),
            ),
            JobError::Protocol(_) | JobError::Internal(_) => return None,
        };
        Some(messages)
    }
}

fn with_output(text: String, output: &str) -> String {
    format!("{}\n\nOutput so far:\n{}", text, output)
}

/// A validation job that could not be completed.
///
/// Carries one of the non-reportable [`JobError`] kinds. Operators must look
/// at these; they point at a broken validator or a library defect.
#[derive(Debug, Error)]
#[error("validation of submission {submission} aborted")]
pub struct JobFault {
    pub submission: String,
    #[source]
    pub error: JobError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_kinds() {
        assert!(JobError::NoFiles.is_expected());
        assert!(JobError::FileNotFound("Makefile".into()).is_expected());
        assert!(JobError::custom("a", "b").is_expected());
        assert!(!JobError::Protocol("early".into()).is_expected());
        assert!(!JobError::Internal(anyhow::anyhow!("boom")).is_expected());
    }

    #[test]
    fn test_no_files_message() {
        let (student, tutor) = JobError::NoFiles.messages().unwrap();
        assert_eq!(student, "Your submission contains no files.");
        assert_eq!(student, tutor);
    }

    #[test]
    fn test_wrong_exit_status_message_contains_output() {
        let err = JobError::WrongExitStatus {
            program: "gcc".into(),
            expected: 0,
            got: Some(1),
            output: "error: expected ';'".into(),
        };
        let (student, _) = err.messages().unwrap();
        assert!(student.contains("unexpected exit status 1"));
        assert!(student.contains("error: expected ';'"));
        assert_eq!(err.output(), Some("error: expected ';'"));
    }

    #[test]
    fn test_timeout_messages_differ() {
        let err = JobError::ProcessTimeout {
            program: "./a.out".into(),
            output: String::new(),
        };
        let (student, tutor) = err.messages().unwrap();
        assert!(student.contains("took too long"));
        assert!(tutor.contains("due to timeout"));
    }

    #[test]
    fn test_file_not_found_names_file() {
        let (student, tutor) = JobError::FileNotFound("Makefile".into()).messages().unwrap();
        assert_eq!(student, "A file is missing: Makefile");
        assert_eq!(tutor, "Missing file: Makefile");
    }

    #[test]
    fn test_fatal_kinds_have_no_messages() {
        assert!(JobError::Protocol("x".into()).messages().is_none());
        assert!(JobError::Internal(anyhow::anyhow!("x")).messages().is_none());
    }

    #[test]
    fn test_unknown_status_display() {
        let err = JobError::WrongExitStatus {
            program: "p".into(),
            expected: 0,
            got: None,
            output: String::new(),
        };
        assert_eq!(err.to_string(), "'p' exited with status unknown, expected 0");
    }
}
