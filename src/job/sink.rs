//! Result sinks
//!
//! A sink persists the result of a job, e.g. as feedback in the learning
//! platform. The job calls it at most once.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::core::ValidationResult;
use crate::files::Submission;

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save_feedback(
        &self,
        submission: &Submission,
        result: &ValidationResult,
    ) -> anyhow::Result<()>;
}

/// Keeps every result in memory, in the order received
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<(String, ValidationResult)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// (submission id, result) pairs
    pub fn results(&self) -> Vec<(String, ValidationResult)> {
        self.results
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.results().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn save_feedback(
        &self,
        submission: &Submission,
        result: &ValidationResult,
    ) -> anyhow::Result<()> {
        let mut results = self
            .results
            .lock()
            .map_err(|_| anyhow::anyhow!("Result store is poisoned"))?;
        results.push((submission.id.clone(), result.clone()));
        Ok(())
    }
}

/// Only writes the student feedback to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn save_feedback(
        &self,
        submission: &Submission,
        result: &ValidationResult,
    ) -> anyhow::Result<()> {
        info!(
            "Feedback for submission {} to {:?}: {}",
            submission.id,
            submission.feedback_recipients(),
            result.student_message
        );
        Ok(())
    }
}
