//! Staging of submission and validator files into a directory

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use nix::sys::statvfs::statvfs;
use tracing::{debug, info};

use super::archive;
use super::{Content, SubmissionFile};
use crate::config::get_config;
use crate::core::{JobError, CONTACT_STAFF};

/// Writes files into a target directory after checking for free space
#[derive(Debug, Clone, Copy)]
pub struct Unpacker {
    pub min_free_bytes: u64,
}

impl Default for Unpacker {
    fn default() -> Self {
        Self {
            min_free_bytes: get_config().min_free_disk_bytes,
        }
    }
}

impl Unpacker {
    pub fn new(min_free_bytes: u64) -> Self {
        Self { min_free_bytes }
    }

    /// Write `file` into `target_dir`.
    ///
    /// Archives are extracted, flat with `remove_directories`. Other files are
    /// stored under their name; with `recode` their text is converted to UTF-8.
    /// Returns the top-level names written.
    pub fn unpack(
        &self,
        file: &SubmissionFile,
        target_dir: &Path,
        remove_directories: bool,
        recode: bool,
    ) -> Result<BTreeSet<String>, JobError> {
        self.check_free_space(target_dir)?;

        if let Some(kind) = archive::probe(file.bytes()).filter(|_| file.is_archive()) {
            info!("Unpacking {} into {:?}", file.name, target_dir);
            return archive::extract(kind, &file.name, file.bytes(), target_dir, remove_directories);
        }

        if file.is_archive() {
            // Declared as archive but the content says otherwise
            return Err(JobError::BrokenArchive {
                name: file.name.clone(),
                reason: format!("content does not match declared type {}", file.content_type()),
            });
        }

        let target = target_dir.join(&file.name);
        debug!("Storing {} as {:?}", file.name, target);

        let result = match (recode, file.content()) {
            (true, Content::Bytes(_)) => std::fs::write(&target, file.as_text()),
            _ => file.save_as(target_dir, &file.name),
        };
        result
            .with_context(|| format!("Failed to write {:?}", target))
            .map_err(JobError::Internal)?;

        Ok(BTreeSet::from([file.name.clone()]))
    }

    fn check_free_space(&self, target_dir: &Path) -> Result<(), JobError> {
        let stat = statvfs(target_dir)
            .with_context(|| format!("Failed to query free space of {:?}", target_dir))
            .map_err(JobError::Internal)?;
        let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;

        if free < self.min_free_bytes {
            return Err(JobError::ResourceExhausted {
                student: CONTACT_STAFF.to_string(),
                tutor: format!(
                    "Not enough free disk space for unpacking the student files: {} bytes available in {:?}, {} required",
                    free,
                    target_dir,
                    self.min_free_bytes
                ),
            });
        }
        Ok(())
    }
}

/// Unpack with the configured disk-space threshold
pub fn unpack(
    file: &SubmissionFile,
    target_dir: &Path,
    remove_directories: bool,
    recode: bool,
) -> Result<BTreeSet<String>, JobError> {
    Unpacker::default().unpack(file, target_dir, remove_directories, recode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::archive::tests::build_zip;

    #[test]
    fn test_plain_file_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let file = SubmissionFile::from_local_data("main.c", "int main() {}", None);

        let written = Unpacker::new(0).unpack(&file, dir.path(), true, false).unwrap();

        assert_eq!(written, BTreeSet::from(["main.c".to_string()]));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("main.c")).unwrap(),
            "int main() {}"
        );
    }

    #[test]
    fn test_zip_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let zip = build_zip(&[("project/src/a.c", "a"), ("project/b.c", "b")]);
        let file = SubmissionFile::from_local_data("project.zip", zip, None);

        let written = Unpacker::new(0).unpack(&file, dir.path(), true, false).unwrap();

        assert_eq!(
            written,
            BTreeSet::from(["a.c".to_string(), "b.c".to_string()])
        );
        assert!(dir.path().join("a.c").is_file());
        assert!(!dir.path().join("project").exists());
    }

    #[test]
    fn test_recode_windows_1252() {
        let dir = tempfile::tempdir().unwrap();
        let (bytes, _, _) = encoding_rs::WINDOWS_1252.encode("Grüße");
        let file = SubmissionFile::from_local_data("greeting.txt", bytes.into_owned(), None)
            .with_encoding("windows-1252");

        Unpacker::new(0).unpack(&file, dir.path(), true, true).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("greeting.txt")).unwrap(),
            "Grüße"
        );
    }

    #[test]
    fn test_without_recode_bytes_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let file = SubmissionFile::from_local_data("raw.txt", vec![0xfcu8], None);

        Unpacker::new(0).unpack(&file, dir.path(), true, false).unwrap();

        assert_eq!(std::fs::read(dir.path().join("raw.txt")).unwrap(), vec![0xfc]);
    }

    #[test]
    fn test_not_enough_space() {
        let dir = tempfile::tempdir().unwrap();
        let file = SubmissionFile::from_local_data("main.c", "x", None);

        let err = Unpacker::new(u64::MAX)
            .unpack(&file, dir.path(), true, false)
            .unwrap_err();

        match err {
            JobError::ResourceExhausted { student, .. } => assert_eq!(student, CONTACT_STAFF),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!dir.path().join("main.c").exists());
    }

    #[test]
    fn test_declared_archive_with_other_content() {
        let dir = tempfile::tempdir().unwrap();
        let file =
            SubmissionFile::from_local_data("fake.zip", "plain text", Some("application/zip"));

        let err = Unpacker::new(0)
            .unpack(&file, dir.path(), true, false)
            .unwrap_err();
        assert!(matches!(err, JobError::BrokenArchive { .. }));
    }
}
