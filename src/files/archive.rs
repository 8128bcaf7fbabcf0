//! Archive probing and extraction
//!
//! Supports ZIP, TAR and gzip-compressed TAR. Entries whose path would leave
//! the destination directory are skipped.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::core::JobError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const TAR_MAGIC_OFFSET: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "application/zip",
            ArchiveKind::Tar => "application/x-tar",
            ArchiveKind::TarGz => "application/gzip",
        }
    }
}

/// Detect an archive by its signature
pub fn probe(bytes: &[u8]) -> Option<ArchiveKind> {
    if bytes.starts_with(&ZIP_MAGIC) || bytes.starts_with(&ZIP_EMPTY_MAGIC) {
        return Some(ArchiveKind::Zip);
    }

    if has_tar_magic(bytes) {
        return Some(ArchiveKind::Tar);
    }

    if bytes.starts_with(&GZIP_MAGIC) {
        // Only the first header block is needed to tell a tarball from a plain .gz
        let mut head = Vec::with_capacity(512);
        let decoder = GzDecoder::new(Cursor::new(bytes));
        if decoder.take(512).read_to_end(&mut head).is_ok() && has_tar_magic(&head) {
            return Some(ArchiveKind::TarGz);
        }
    }

    None
}

fn has_tar_magic(bytes: &[u8]) -> bool {
    bytes.len() >= TAR_MAGIC_OFFSET + 5 && &bytes[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
}

/// Extract every regular file of an archive into `dest`.
///
/// With `flatten`, entries are written under their base name only and later
/// entries overwrite earlier ones of the same name. Returns the top-level
/// names written.
pub fn extract(
    kind: ArchiveKind,
    name: &str,
    bytes: &[u8],
    dest: &Path,
    flatten: bool,
) -> Result<BTreeSet<String>, JobError> {
    debug!("Extracting {:?} archive {} to {:?}", kind, name, dest);

    match kind {
        ArchiveKind::Zip => extract_zip(name, bytes, dest, flatten),
        ArchiveKind::Tar => extract_tar(name, Cursor::new(bytes), dest, flatten),
        ArchiveKind::TarGz => extract_tar(name, GzDecoder::new(Cursor::new(bytes)), dest, flatten),
    }
}

fn broken(name: &str, reason: impl ToString) -> JobError {
    JobError::BrokenArchive {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn write_failed(path: &Path, e: io::Error) -> JobError {
    JobError::Internal(anyhow::Error::new(e).context(format!("Failed to write {:?}", path)))
}

fn extract_zip(
    name: &str,
    bytes: &[u8],
    dest: &Path,
    flatten: bool,
) -> Result<BTreeSet<String>, JobError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| broken(name, e))?;
    let mut written = BTreeSet::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| broken(name, e))?;

        if entry.is_dir() {
            continue;
        }

        // ZIP Slip protection
        let entry_path = match entry.enclosed_name() {
            Some(path) => path,
            None => {
                warn!("Skipping unsafe archive entry {:?} in {}", entry.name(), name);
                continue;
            }
        };

        let Some(relative) = target_path(&entry_path, flatten) else {
            continue;
        };
        let outpath = dest.join(&relative);

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;
        }
        let mut outfile = fs::File::create(&outpath).map_err(|e| write_failed(&outpath, e))?;
        io::copy(&mut entry, &mut outfile).map_err(|e| broken(name, e))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o777))
                .map_err(|e| write_failed(&outpath, e))?;
        }

        if let Some(top) = top_level_name(&relative) {
            written.insert(top);
        }
    }

    Ok(written)
}

fn extract_tar<R: Read>(
    name: &str,
    reader: R,
    dest: &Path,
    flatten: bool,
) -> Result<BTreeSet<String>, JobError> {
    let mut archive = tar::Archive::new(reader);
    let mut written = BTreeSet::new();

    for entry in archive.entries().map_err(|e| broken(name, e))? {
        let mut entry = entry.map_err(|e| broken(name, e))?;

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let entry_path = entry.path().map_err(|e| broken(name, e))?.into_owned();
        if !is_enclosed(&entry_path) {
            warn!("Skipping unsafe archive entry {:?} in {}", entry_path, name);
            continue;
        }

        let Some(relative) = target_path(&entry_path, flatten) else {
            continue;
        };
        let outpath = dest.join(&relative);

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;
        }
        entry
            .unpack(&outpath)
            .map_err(|e| write_failed(&outpath, e))?;

        if let Some(top) = top_level_name(&relative) {
            written.insert(top);
        }
    }

    Ok(written)
}

fn is_enclosed(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn target_path(entry_path: &Path, flatten: bool) -> Option<PathBuf> {
    if flatten {
        entry_path.file_name().map(PathBuf::from)
    } else {
        let cleaned: PathBuf = entry_path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        if cleaned.as_os_str().is_empty() {
            None
        } else {
            Some(cleaned)
        }
    }
}

fn top_level_name(relative: &Path) -> Option<String> {
    relative
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
}
