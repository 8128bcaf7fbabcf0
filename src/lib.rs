//! Submission validation engine
//!
//! Validates student submissions with instructor-supplied validators: the
//! submission is staged into a private workspace, the validator compiles and
//! runs the student programs, and exactly one pass/fail result with separate
//! student and tutor texts is reported back.

pub mod batch;
pub mod compiler;
pub mod config;
pub mod core;
pub mod files;
pub mod job;
pub mod runner;
pub mod testing;
pub mod validator;

pub use crate::core::{JobError, JobFault, JobOutcome, ValidationResult};
pub use crate::files::{Submission, SubmissionFile};
pub use crate::job::{ResultSink, ValidationJob};
pub use crate::validator::{Validator, ValidatorRegistry};
