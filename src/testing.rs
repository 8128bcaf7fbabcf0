//! Helpers for testing validators
//!
//! ```
//! use lms_validator::core::JobError;
//! use lms_validator::testing::{assert_fails, assert_succeeds};
//!
//! let err = assert_fails::<()>(Err(JobError::NoFiles));
//! assert!(matches!(err, JobError::NoFiles));
//! assert_eq!(assert_succeeds(Ok::<_, JobError>(3)), 3);
//! ```

use std::fmt::Debug;

use crate::core::JobError;

/// Panics unless `result` is a failure, returns the error
#[track_caller]
pub fn assert_fails<T: Debug>(result: Result<T, JobError>) -> JobError {
    match result {
        Ok(value) => panic!("expected a failure, got success: {:?}", value),
        Err(e) => e,
    }
}

/// Panics unless `result` is a success, returns the value
#[track_caller]
pub fn assert_succeeds<T>(result: Result<T, JobError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("expected success, got failure: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "expected a failure")]
    fn test_assert_fails_on_success() {
        assert_fails(Ok::<_, JobError>(1));
    }

    #[test]
    #[should_panic(expected = "expected success")]
    fn test_assert_succeeds_on_failure() {
        assert_succeeds::<()>(Err(JobError::FileNotFound("x".into())));
    }
}
