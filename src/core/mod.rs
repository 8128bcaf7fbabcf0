pub mod error;
pub mod outcome;

pub use error::{JobError, JobFault, CONTACT_STAFF};
pub use outcome::{
    JobOutcome, JobState, ValidationResult, DEFAULT_FAIL_TUTOR, DEFAULT_PASS_STUDENT,
    DEFAULT_PASS_TUTOR,
};
