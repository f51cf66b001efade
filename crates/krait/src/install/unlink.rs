//! Removing an installed package from a prefix.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use krait_types::PrefixRecord;

/// Errors that can occur while unlinking a package.
#[derive(Debug, thiserror::Error)]
pub enum UnlinkError {
    /// A file could not be removed.
    #[error("failed to remove '{0}'")]
    FailedToRemoveFile(PathBuf, #[source] std::io::Error),

    /// A directory could not be removed.
    #[error("failed to remove directory '{0}'")]
    FailedToRemoveDirectory(PathBuf, #[source] std::io::Error),

    /// The conda-meta record could not be removed.
    #[error("failed to remove the package record '{0}'")]
    FailedToRemoveRecord(PathBuf, #[source] std::io::Error),
}

/// Removes every file of the given record from the prefix, sweeps the
/// directories that became empty, and deletes the `conda-meta` record.
pub fn unlink_package(prefix: &Path, record: &PrefixRecord) -> Result<(), UnlinkError> {
    let mut parent_dirs = HashSet::new();

    for file in &record.files {
        let path = prefix.join(file);
        match fs_err::remove_file(&path) {
            Ok(()) => {}
            // A file the user already deleted is not an error.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} was already gone", path.display());
            }
            Err(e) => return Err(UnlinkError::FailedToRemoveFile(path, e)),
        }
        if let Some(parent) = file.parent() {
            parent_dirs.insert(parent.to_path_buf());
        }
    }

    for dir in parent_dirs {
        recursively_remove_empty_directories(&prefix.join(&dir), prefix)?;
    }

    let record_path = prefix
        .join("conda-meta")
        .join(record.file_name());
    match fs_err::remove_file(&record_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UnlinkError::FailedToRemoveRecord(record_path, e)),
    }
}

/// Removes `directory` if it is empty, then walks up towards `root` removing
/// every directory that became empty on the way. `root` itself is never
/// removed.
pub fn recursively_remove_empty_directories(
    directory: &Path,
    root: &Path,
) -> Result<(), UnlinkError> {
    let mut current = directory.to_path_buf();
    loop {
        if current == root || !current.starts_with(root) {
            return Ok(());
        }
        match fs_err::read_dir(&current) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Ok(());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(UnlinkError::FailedToRemoveDirectory(current, e));
            }
        }
        fs_err::remove_dir(&current)
            .map_err(|e| UnlinkError::FailedToRemoveDirectory(current.clone(), e))?;
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return Ok(()),
        }
    }
}
