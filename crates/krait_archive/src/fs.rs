//! Extraction of package archives from the local filesystem.

use std::path::Path;

use krait_digest::{compute_file_digest, Md5, Sha256};
use krait_types::package::ArchiveType;

use crate::{read, ArchiveDigests, ExtractError};

/// Extracts a package archive at `archive` into `destination`, dispatching on
/// the file extension. Returns the digests of the archive file.
pub fn extract(archive: &Path, destination: &Path) -> Result<ArchiveDigests, ExtractError> {
    let archive_type = ArchiveType::try_from_path(archive).ok_or_else(|| {
        ExtractError::UnsupportedArchiveType(archive.display().to_string())
    })?;

    let file = fs_err::File::open(archive)?;
    match archive_type {
        ArchiveType::TarBz2 => read::extract_tar_bz2(file, destination)?,
        ArchiveType::Conda => read::extract_conda(file, destination)?,
    }

    Ok(ArchiveDigests {
        md5: compute_file_digest::<Md5>(archive)?,
        sha256: compute_file_digest::<Sha256>(archive)?,
    })
}

/// Extracts into a staging directory next to `destination` and atomically
/// renames it into place, replacing whatever was there before.
pub fn extract_staged(archive: &Path, destination: &Path) -> Result<ArchiveDigests, ExtractError> {
    let staging = staging_path(destination)?;
    if staging.exists() {
        fs_err::remove_dir_all(&staging)?;
    }

    let digests = match extract(archive, &staging) {
        Ok(digests) => digests,
        Err(e) => {
            let _ = fs_err::remove_dir_all(&staging);
            return Err(e);
        }
    };

    if destination.exists() {
        fs_err::remove_dir_all(destination)?;
    }
    fs_err::rename(&staging, destination)?;
    Ok(digests)
}

fn staging_path(destination: &Path) -> Result<std::path::PathBuf, ExtractError> {
    let file_name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ExtractError::UnsupportedArchiveType(destination.display().to_string()))?;
    Ok(destination.with_file_name(format!(".{file_name}.staging")))
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn write_tar_bz2(path: &Path) {
        let file = fs_err::File::create(path).unwrap();
        let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            let content = b"hello";
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "data.txt", &content[..])
                .unwrap();
            builder.finish().unwrap();
        }
        encoder.finish().unwrap().flush().unwrap();
    }

    #[test]
    fn test_extract_staged_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg-1.0-0.tar.bz2");
        write_tar_bz2(&archive);

        let destination = dir.path().join("pkg-1.0-0");
        fs_err::create_dir_all(&destination).unwrap();
        fs_err::write(destination.join("stale.txt"), "old").unwrap();

        extract_staged(&archive, &destination).unwrap();

        assert!(destination.join("data.txt").is_file());
        assert!(!destination.join("stale.txt").exists());
        // No staging directory is left behind.
        assert!(!dir.path().join(".pkg-1.0-0.staging").exists());
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        fs_err::write(&archive, "junk").unwrap();
        assert_matches::assert_matches!(
            extract(&archive, &dir.path().join("out")),
            Err(ExtractError::UnsupportedArchiveType(_))
        );
    }
}
