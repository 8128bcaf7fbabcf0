use serde::{Deserialize, Serialize};
use std::fmt;

/// Default texts of a pass result when the validator sent none
pub const DEFAULT_PASS_STUDENT: &str = "All tests passed. Awesome!";
pub const DEFAULT_PASS_TUTOR: &str = "All tests passed.";
/// Default tutor text of a fail result
pub const DEFAULT_FAIL_TUTOR: &str = "Test failed.";

/// Outcome reported for one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    /// Text shown to the student(s)
    pub student_message: String,
    /// Diagnostic text for tutors and logs
    pub tutor_message: String,
}

impl ValidationResult {
    pub fn pass(student: impl Into<String>, tutor: impl Into<String>) -> Self {
        Self {
            passed: true,
            student_message: student.into(),
            tutor_message: tutor.into(),
        }
    }

    pub fn fail(student: impl Into<String>, tutor: impl Into<String>) -> Self {
        Self {
            passed: false,
            student_message: student.into(),
            tutor_message: tutor.into(),
        }
    }

    pub fn verdict(&self) -> &'static str {
        if self.passed {
            "pass"
        } else {
            "fail"
        }
    }
}

/// Lifecycle of a validation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    WorkspaceStaged,
    ValidatorLoaded,
    Executing,
    ResultSent,
    TornDown,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Created => "created",
            JobState::WorkspaceStaged => "workspace_staged",
            JobState::ValidatorLoaded => "validator_loaded",
            JobState::Executing => "executing",
            JobState::ResultSent => "result_sent",
            JobState::TornDown => "torn_down",
        };
        write!(f, "{}", s)
    }
}

/// What a finished job reports back to its caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub submission_id: String,
    /// Last state reached before teardown
    pub reached: JobState,
    /// `None` if the validator could not be loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ValidationResult>,
    /// Why the validator could not be loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
}

impl JobOutcome {
    pub fn passed(&self) -> bool {
        self.result.as_ref().map(|r| r.passed).unwrap_or(false)
    }
}
