//! Extraction of package archives from readers.

use std::{ffi::OsStr, io::Read, path::Path};

use zip::read::read_zipfile_from_stream;

use crate::ExtractError;

/// Wraps a `.tar.bz2` stream as a decompressed `tar::Archive`.
pub fn stream_tar_bz2(reader: impl Read) -> tar::Archive<impl Read + Sized> {
    tar::Archive::new(bzip2::read::BzDecoder::new(reader))
}

/// Wraps a `.tar.zst` stream as a decompressed `tar::Archive`.
fn stream_tar_zst(
    reader: impl Read,
) -> Result<tar::Archive<impl Read + Sized>, ExtractError> {
    Ok(tar::Archive::new(zstd::stream::read::Decoder::new(reader)?))
}

/// Extracts a `.tar.bz2` package archive into the destination directory.
pub fn extract_tar_bz2(reader: impl Read, destination: &Path) -> Result<(), ExtractError> {
    std::fs::create_dir_all(destination).map_err(ExtractError::CouldNotCreateDestination)?;
    let mut archive = stream_tar_bz2(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(destination)?;
    Ok(())
}

/// Extracts a `.conda` package archive into the destination directory.
///
/// A `.conda` file is a zip container holding `info-…​.tar.zst` and
/// `pkg-…​.tar.zst` members plus a small `metadata.json`. Both tarballs are
/// unpacked into the same destination.
pub fn extract_conda(mut reader: impl Read, destination: &Path) -> Result<(), ExtractError> {
    std::fs::create_dir_all(destination).map_err(ExtractError::CouldNotCreateDestination)?;

    while let Some(file) = read_zipfile_from_stream(&mut reader)? {
        let is_inner_tarball = file
            .mangled_name()
            .file_name()
            .map(OsStr::to_string_lossy)
            .map_or(false, |name| name.ends_with(".tar.zst"));
        if is_inner_tarball {
            let mut archive = stream_tar_zst(file)?;
            archive.set_preserve_permissions(true);
            archive.unpack(destination)?;
        }
    }

    Ok(())
}
