//! Crash reconciliation: bringing a prefix back in sync with its journal.
//!
//! After an abnormal termination the prefix may hold files that no record
//! owns (a link phase that never finished), or records may point at files
//! that are gone. The former are removed; the latter are a hard error since
//! silently missing files mean the environment is broken in ways krait
//! cannot repair.

use std::{collections::HashSet, path::PathBuf};

use crate::{
    ops::OpError,
    prefix::{Prefix, PrefixData},
};

/// The outcome of a reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Unowned files that were removed from the prefix.
    pub removed: Vec<PathBuf>,
}

/// Walks the prefix and removes every file that no installed record owns.
/// Returns an error if a recorded file is missing from disk.
pub fn reconcile(prefix: &Prefix) -> Result<ReconcileReport, OpError> {
    let data = PrefixData::from_prefix(prefix)?;

    let mut owned: HashSet<PathBuf> = HashSet::new();
    for record in data.records() {
        for file in &record.files {
            let path = prefix.path().join(file);
            if !path.exists() {
                return Err(OpError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "'{}' is recorded for {} but missing from the prefix",
                        file.display(),
                        record.repodata_record.package_record
                    ),
                )));
            }
            owned.insert(path);
        }
    }

    let mut report = ReconcileReport::default();
    let meta_dir = prefix.conda_meta_dir();
    for entry in walkdir::WalkDir::new(prefix.path())
        .into_iter()
        .filter_entry(|e| !e.path().starts_with(&meta_dir))
    {
        let entry = entry.map_err(|e| {
            OpError::IoError(std::io::Error::other(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_path_buf();
        if !owned.contains(&path) {
            tracing::info!("removing unowned file {}", path.display());
            fs_err::remove_file(&path)?;
            report.removed.push(path);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod test {
    use krait_types::{PackageRecord, PrefixRecord, RepoDataRecord};
    use url::Url;

    use super::*;

    fn record_with_files(files: &[&str]) -> PrefixRecord {
        let mut record = PrefixRecord::from_repodata_record(RepoDataRecord {
            package_record: PackageRecord::for_test("foo", "1.0", "0", 0),
            file_name: "foo-1.0-0.conda".to_owned(),
            url: Url::parse("https://repo.example.com/linux-64/foo-1.0-0.conda").unwrap(),
            channel: "test".to_owned(),
        });
        record.files = files.iter().map(PathBuf::from).collect();
        record
    }

    #[test]
    fn test_unowned_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = Prefix::create(dir.path()).unwrap();

        fs_err::create_dir_all(prefix.path().join("bin")).unwrap();
        fs_err::write(prefix.path().join("bin/owned"), "x").unwrap();
        fs_err::write(prefix.path().join("bin/stray"), "y").unwrap();

        let record = record_with_files(&["bin/owned"]);
        record
            .write_to_path(prefix.conda_meta_dir().join(record.file_name()))
            .unwrap();

        let report = reconcile(&prefix).unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(prefix.path().join("bin/owned").exists());
        assert!(!prefix.path().join("bin/stray").exists());
    }

    #[test]
    fn test_missing_recorded_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = Prefix::create(dir.path()).unwrap();
        let record = record_with_files(&["bin/never-linked"]);
        record
            .write_to_path(prefix.conda_meta_dir().join(record.file_name()))
            .unwrap();

        assert!(reconcile(&prefix).is_err());
    }
}
