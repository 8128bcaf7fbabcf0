use std::sync::Arc;

use lms_validator::batch::{run_batch, Assignment};
use lms_validator::files::{GradingStatus, Owner};
use lms_validator::job::MemorySink;
use lms_validator::{Submission, SubmissionFile, ValidatorRegistry};

fn submission(id: &str, content: &str) -> Submission {
    Submission::new(
        id,
        Owner::User(1),
        vec![SubmissionFile::from_local_data("answer.txt", content, None)],
    )
}

#[tokio::test]
async fn batch_validates_gradable_submissions_only() {
    let validators = tempfile::tempdir().unwrap();
    std::fs::write(
        validators.path().join("Answer.toml"),
        r#"
[[step]]
action = "prepare"

[[step]]
action = "grep"
pattern = "42"
student = "Wrong answer."
"#,
    )
    .unwrap();

    let assignments = vec![
        Assignment {
            id: "1".into(),
            name: " answer ".into(),
            submissions: vec![
                submission("right", "The answer is 42"),
                submission("wrong", "The answer is 7"),
                submission("graded", "42").with_status(GradingStatus::Graded),
                Submission::new("empty", Owner::User(2), vec![]),
            ],
        },
        Assignment {
            id: "2".into(),
            name: "essay".into(),
            submissions: vec![submission("s", "text")],
        },
    ];

    let sink = Arc::new(MemorySink::new());
    let summary = run_batch(
        validators.path(),
        &assignments,
        &ValidatorRegistry::with_builtins(),
        sink.clone(),
    )
    .await
    .unwrap();

    assert_eq!(summary.jobs, 2);
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.failed, 1);
    assert!(summary.faults.is_empty());
    assert_eq!(summary.skipped_assignments, vec!["essay"]);

    let results = sink.results();
    assert_eq!(results.len(), 2);
    let wrong = results.iter().find(|(id, _)| id == "wrong").unwrap();
    assert_eq!(wrong.1.student_message, "Wrong answer.");
}
