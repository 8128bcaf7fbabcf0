use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::SubmissionFile;

/// Who handed a submission in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    User(i64),
    Group { group_id: i64, members: Vec<i64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GradingStatus {
    #[default]
    #[serde(rename = "notgraded")]
    Ungraded,
    #[serde(rename = "graded")]
    Graded,
}

impl fmt::Display for GradingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GradingStatus::Ungraded => write!(f, "notgraded"),
            GradingStatus::Graded => write!(f, "graded"),
        }
    }
}

/// A student submission: uploaded files plus optional inline text
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub owner: Owner,
    pub status: GradingStatus,
    pub text: Option<String>,
    pub files: Vec<SubmissionFile>,
}

impl Submission {
    pub fn new(id: impl Into<String>, owner: Owner, files: Vec<SubmissionFile>) -> Self {
        Self {
            id: id.into(),
            owner,
            status: GradingStatus::Ungraded,
            text: None,
            files,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_status(mut self, status: GradingStatus) -> Self {
        self.status = status;
        self
    }

    /// Submission made of a single local file, owned by a placeholder user
    pub fn from_local_file(id: impl Into<String>, path: &Path) -> anyhow::Result<Self> {
        let file = SubmissionFile::from_local_file(path, None)?;
        Ok(Self::new(id, Owner::User(0), vec![file]))
    }

    /// Submission made of every regular file directly inside `dir`, sorted by name
    pub fn from_local_dir(id: impl Into<String>, dir: &Path) -> anyhow::Result<Self> {
        let mut paths = Vec::new();
        for entry in
            std::fs::read_dir(dir).with_context(|| format!("Failed to read directory {:?}", dir))?
        {
            let path = entry?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let files = paths
            .iter()
            .map(|p| SubmissionFile::from_local_file(p, None))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self::new(id, Owner::User(0), files))
    }

    /// No files and no inline text
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.text.as_deref().map_or(true, str::is_empty)
    }

    pub fn is_group_submission(&self) -> bool {
        matches!(self.owner, Owner::Group { .. })
    }

    /// Users that receive the feedback of this submission.
    ///
    /// Group feedback goes to every member of the group.
    pub fn feedback_recipients(&self) -> Vec<i64> {
        match &self.owner {
            Owner::User(id) => vec![*id],
            Owner::Group { members, .. } => members.clone(),
        }
    }

    /// Not graded yet and has something to grade
    pub fn is_gradable(&self) -> bool {
        self.status == GradingStatus::Ungraded && !self.is_empty()
    }
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = match &self.owner {
            Owner::User(id) => format!("user {}", id),
            Owner::Group { group_id, .. } => format!("group {}", group_id),
        };
        write!(
            f,
            "Submission {} by {} ({}), {} files, {}",
            self.id,
            owner,
            self.status,
            self.files.len(),
            if self.text.is_some() {
                "with text"
            } else {
                "without text"
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> SubmissionFile {
        SubmissionFile::from_local_data(name, "content", None)
    }

    #[test]
    fn test_empty_submission() {
        let s = Submission::new("1", Owner::User(7), vec![]);
        assert!(s.is_empty());
        assert!(!s.is_gradable());

        let s = s.with_text("my answer");
        assert!(!s.is_empty());
        assert!(s.is_gradable());
    }

    #[test]
    fn test_graded_is_not_gradable() {
        let s = Submission::new("2", Owner::User(7), vec![file("a.c")])
            .with_status(GradingStatus::Graded);
        assert!(!s.is_gradable());
    }

    #[test]
    fn test_group_recipients() {
        let s = Submission::new(
            "3",
            Owner::Group {
                group_id: 4,
                members: vec![10, 11, 12],
            },
            vec![file("a.c")],
        );
        assert!(s.is_group_submission());
        assert_eq!(s.feedback_recipients(), vec![10, 11, 12]);

        let s = Submission::new("4", Owner::User(9), vec![]);
        assert!(!s.is_group_submission());
        assert_eq!(s.feedback_recipients(), vec![9]);
    }

    #[test]
    fn test_display() {
        let s = Submission::new("5", Owner::User(1), vec![file("a.c"), file("b.c")]);
        assert_eq!(
            s.to_string(),
            "Submission 5 by user 1 (notgraded), 2 files, without text"
        );
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&GradingStatus::Ungraded).unwrap();
        assert_eq!(json, "\"notgraded\"");
        let status: GradingStatus = serde_json::from_str("\"graded\"").unwrap();
        assert_eq!(status, GradingStatus::Graded);
    }

    #[test]
    fn test_from_local_dir_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.c"), "b").unwrap();
        std::fs::write(dir.path().join("a.c"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let s = Submission::from_local_dir("6", dir.path()).unwrap();
        let names: Vec<_> = s.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.c", "b.c"]);
    }
}
