//! Validation of an extracted package directory against the record that is
//! supposed to live there.

use std::path::Path;

use krait_types::{
    package::{PackageFile, PathType, PathsJson},
    RepoDataRecord,
};
use thiserror::Error;

/// The name of the file that records which archive a directory was extracted
/// from.
pub const REPODATA_RECORD_FILE: &str = "repodata_record.json";

/// Why an extracted package directory failed validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The directory does not contain a `repodata_record.json`.
    #[error("the package directory has no {}", REPODATA_RECORD_FILE)]
    MissingRecord(#[source] std::io::Error),

    /// The recorded identity does not match the expected record.
    #[error("the package directory belongs to a different package: {0}")]
    RecordMismatch(String),

    /// A file listed in `info/paths.json` is missing.
    #[error("'{0}' is missing from the package directory")]
    MissingFile(std::path::PathBuf),

    /// A file's content does not match its recorded SHA-256.
    #[error("'{0}' does not match its recorded checksum")]
    FileChecksumMismatch(std::path::PathBuf),

    /// The `info/paths.json` could not be read.
    #[error("failed to read info/paths.json")]
    InvalidPathsJson(#[source] std::io::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Reads the record stored in an extracted package directory.
pub fn read_stored_record(path: &Path) -> Result<RepoDataRecord, ValidationError> {
    let content = fs_err::read_to_string(path.join(REPODATA_RECORD_FILE))
        .map_err(ValidationError::MissingRecord)?;
    serde_json::from_str(&content)
        .map_err(|e| ValidationError::RecordMismatch(e.to_string()))
}

/// Writes the record into an extracted package directory so later operations
/// can validate the contents without re-downloading.
pub fn write_stored_record(
    path: &Path,
    record: &RepoDataRecord,
) -> Result<(), std::io::Error> {
    let file = fs_err::File::create(path.join(REPODATA_RECORD_FILE))?;
    serde_json::to_writer_pretty(file, record).map_err(std::io::Error::other)
}

/// Validates an extracted package directory against the expected record.
///
/// Identity is checked via the stored `repodata_record.json`: name, version,
/// build, url and — when both sides know them — the archive checksums. With
/// `extra_safety_checks` every file listed in `info/paths.json` is re-hashed.
pub fn validate_package_directory(
    path: &Path,
    expected: &RepoDataRecord,
    extra_safety_checks: bool,
) -> Result<(), ValidationError> {
    let stored = read_stored_record(path)?;

    let mismatch = |what: &str| Err(ValidationError::RecordMismatch(what.to_owned()));
    let stored_record = &stored.package_record;
    let expected_record = &expected.package_record;
    if stored_record.name != expected_record.name {
        return mismatch("name");
    }
    if stored_record.version != expected_record.version {
        return mismatch("version");
    }
    if stored_record.build != expected_record.build {
        return mismatch("build");
    }
    if stored.url != expected.url {
        return mismatch("url");
    }
    match (&stored_record.sha256, &expected_record.sha256) {
        (Some(stored), Some(expected)) if stored != expected => return mismatch("sha256"),
        _ => {}
    }
    match (&stored_record.md5, &expected_record.md5) {
        (Some(stored), Some(expected)) if stored != expected => return mismatch("md5"),
        _ => {}
    }

    if extra_safety_checks {
        validate_package_files(path)?;
    }

    Ok(())
}

/// Re-hashes every file listed in `info/paths.json` and compares it against
/// the recorded digest. Mismatches abort.
pub fn validate_package_files(path: &Path) -> Result<(), ValidationError> {
    let paths_json = PathsJson::from_package_directory(path)
        .map_err(ValidationError::InvalidPathsJson)?;

    for entry in &paths_json.paths {
        let file_path = path.join(&entry.relative_path);
        match entry.path_type {
            PathType::Directory => {
                if !file_path.is_dir() {
                    return Err(ValidationError::MissingFile(entry.relative_path.clone()));
                }
            }
            PathType::Hardlink | PathType::Softlink => {
                if !file_path.exists() {
                    return Err(ValidationError::MissingFile(entry.relative_path.clone()));
                }
                if let Some(expected) = &entry.sha256 {
                    let actual = krait_digest::compute_file_digest::<krait_digest::Sha256>(
                        &file_path,
                    )?;
                    if &actual != expected {
                        return Err(ValidationError::FileChecksumMismatch(
                            entry.relative_path.clone(),
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use krait_types::PackageRecord;
    use url::Url;

    use super::*;

    fn record() -> RepoDataRecord {
        RepoDataRecord {
            package_record: PackageRecord::for_test("foo", "1.0", "0", 0),
            file_name: "foo-1.0-0.conda".to_owned(),
            url: Url::parse("https://repo.example.com/linux-64/foo-1.0-0.conda").unwrap(),
            channel: "https://repo.example.com".to_owned(),
        }
    }

    #[test]
    fn test_stored_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_stored_record(dir.path(), &record()).unwrap();
        validate_package_directory(dir.path(), &record(), false).unwrap();
    }

    #[test]
    fn test_missing_record() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches::assert_matches!(
            validate_package_directory(dir.path(), &record(), false),
            Err(ValidationError::MissingRecord(_))
        );
    }

    #[test]
    fn test_identity_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_stored_record(dir.path(), &record()).unwrap();

        let mut other = record();
        other.package_record = PackageRecord::for_test("foo", "2.0", "0", 0);
        assert_matches::assert_matches!(
            validate_package_directory(dir.path(), &other, false),
            Err(ValidationError::RecordMismatch(_))
        );
    }

    #[test]
    fn test_extra_checks_catch_tampering() {
        let dir = tempfile::tempdir().unwrap();
        write_stored_record(dir.path(), &record()).unwrap();

        // A package with one file whose hash is recorded in paths.json.
        fs_err::create_dir_all(dir.path().join("info")).unwrap();
        fs_err::create_dir_all(dir.path().join("bin")).unwrap();
        fs_err::write(dir.path().join("bin/tool"), "payload").unwrap();
        let digest =
            krait_digest::compute_bytes_digest::<krait_digest::Sha256>("payload");
        fs_err::write(
            dir.path().join("info/paths.json"),
            format!(
                r#"{{"paths_version": 1, "paths": [{{"_path": "bin/tool", "path_type": "hardlink", "sha256": "{digest:x}"}}]}}"#
            ),
        )
        .unwrap();

        validate_package_directory(dir.path(), &record(), true).unwrap();

        // Tamper with the file; only the extra checks notice.
        fs_err::write(dir.path().join("bin/tool"), "tampered").unwrap();
        validate_package_directory(dir.path(), &record(), false).unwrap();
        assert_matches::assert_matches!(
            validate_package_directory(dir.path(), &record(), true),
            Err(ValidationError::FileChecksumMismatch(_))
        );
    }
}
