//! Archive expansion for uploaded DICOM containers.
//!
//! A ZIP upload is extracted into a request-scoped scratch directory, the
//! extracted tree is walked recursively, and every file is sniffed for the
//! DICM signature. Non-matching members are sidecar files and are dropped
//! silently. The scratch directory is removed on every exit path.

use std::fs::{self, File};
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use dicom_ct_common::{has_dicm_magic, ProcessingError};
use thiserror::Error;
use tracing::{debug, warn};
use zip::ZipArchive;

/// Archive handling errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid ZIP archive: {0}")]
    InvalidZip(#[from] zip::result::ZipError),

    #[error("archive is password protected")]
    PasswordProtected,
}

impl From<ArchiveError> for ProcessingError {
    fn from(err: ArchiveError) -> Self {
        ProcessingError::Archive(err.to_string())
    }
}

/// Result type for archive operations
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// How one upload enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// ZIP container, expanded into its DICOM-signed members.
    Archive,
    /// Single payload, sniffed directly.
    Direct,
}

/// Classify an upload by its original filename. Archive detection happens
/// at the boundary by suffix only; content is never inspected here.
#[must_use]
pub fn classify_upload(filename: Option<&str>) -> UploadKind {
    match filename {
        Some(name) if name.to_ascii_lowercase().ends_with(".zip") => UploadKind::Archive,
        _ => UploadKind::Direct,
    }
}

/// Expand a ZIP container into the bytes of its DICOM-signed members.
///
/// Members are returned in deterministic path order regardless of archive
/// layout. Nested subdirectories are walked; entries with unsafe paths are
/// skipped.
///
/// # Errors
///
/// Returns an [`ArchiveError`] when the container cannot be opened or read,
/// or when a member is password protected.
pub fn expand_archive(container: &[u8]) -> Result<Vec<Vec<u8>>> {
    let scratch = tempfile::tempdir()?;
    let mut archive = ZipArchive::new(Cursor::new(container))?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        if entry.encrypted() {
            return Err(ArchiveError::PasswordProtected);
        }

        let Some(relative) = sanitize_entry_path(entry.name()) else {
            warn!("skipping archive entry with unsafe path: {}", entry.name());
            continue;
        };

        let destination = scratch.path().join(relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&destination)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    let mut paths = Vec::new();
    collect_files(scratch.path(), &mut paths)?;
    paths.sort();

    let mut candidates = Vec::new();
    for path in paths {
        let bytes = fs::read(&path)?;
        if has_dicm_magic(&bytes) {
            candidates.push(bytes);
        } else {
            debug!("dropping non-DICOM archive member: {}", path.display());
        }
    }
    debug!("archive expansion produced {} candidate(s)", candidates.len());
    Ok(candidates)
}

/// Resolve an archive entry name to a relative path with no parent or root
/// components. Returns `None` for entries that would escape the scratch dir.
fn sanitize_entry_path(name: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn dicm_stub(fill: u8) -> Vec<u8> {
        let mut bytes = vec![fill; 200];
        bytes[128..132].copy_from_slice(b"DICM");
        bytes
    }

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options: FileOptions<()> = FileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_classify_upload_by_suffix() {
        assert_eq!(classify_upload(Some("study.zip")), UploadKind::Archive);
        assert_eq!(classify_upload(Some("STUDY.ZIP")), UploadKind::Archive);
        assert_eq!(classify_upload(Some("scan.dcm")), UploadKind::Direct);
        assert_eq!(classify_upload(Some("zipper.txt")), UploadKind::Direct);
        assert_eq!(classify_upload(None), UploadKind::Direct);
    }

    #[test]
    fn test_expand_keeps_only_dicom_signed_members() {
        let dicom = dicm_stub(0);
        let container = build_zip(&[
            ("image.dcm", dicom.as_slice()),
            ("readme.txt", b"not an image"),
        ]);

        let candidates = expand_archive(&container).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0], dicom);
    }

    #[test]
    fn test_expand_walks_nested_directories() {
        let first = dicm_stub(1);
        let second = dicm_stub(2);
        let container = build_zip(&[
            ("series/a/slice1.dcm", first.as_slice()),
            ("series/b/slice2.dcm", second.as_slice()),
            ("series/notes.json", b"{}"),
        ]);

        let candidates = expand_archive(&container).unwrap();
        assert_eq!(candidates.len(), 2);
        // Path order: series/a before series/b.
        assert_eq!(candidates[0], first);
        assert_eq!(candidates[1], second);
    }

    #[test]
    fn test_expand_rejects_corrupt_container() {
        let err = expand_archive(b"definitely not a zip archive").unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidZip(_)));
    }

    #[test]
    fn test_expand_empty_archive_yields_no_candidates() {
        let container = build_zip(&[]);
        let candidates = expand_archive(&container).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_sanitize_entry_path() {
        assert_eq!(
            sanitize_entry_path("series/slice.dcm"),
            Some(PathBuf::from("series/slice.dcm"))
        );
        assert_eq!(
            sanitize_entry_path("./series/./slice.dcm"),
            Some(PathBuf::from("series/slice.dcm"))
        );
        assert_eq!(sanitize_entry_path("../escape.dcm"), None);
        assert_eq!(sanitize_entry_path("/absolute.dcm"), None);
        assert_eq!(sanitize_entry_path(""), None);
    }
}
