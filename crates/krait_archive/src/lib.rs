#![deny(missing_docs)]

//! Extraction and verified download of conda package archives.
//!
//! Two archive formats exist: the legacy `.tar.bz2` (a bzip2-compressed
//! tarball) and `.conda` (a zip file containing zstd-compressed inner
//! tarballs). Extraction always goes through a staging directory next to the
//! destination and is moved into place with a final rename, so a crashed
//! extraction never leaves a half-populated package directory behind.

pub mod download;
pub mod fs;
pub mod read;

use krait_digest::{Md5Hash, Sha256Hash};

/// The digests of a package archive, computed while it streamed by.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveDigests {
    /// The MD5 digest of the archive.
    pub md5: Md5Hash,

    /// The SHA-256 digest of the archive.
    pub sha256: Sha256Hash,
}

/// An error that can occur when downloading or extracting a package archive.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// An I/O error occurred.
    #[error("an io error occurred")]
    IoError(#[from] std::io::Error),

    /// The destination directory could not be created.
    #[error("could not create the destination path")]
    CouldNotCreateDestination(#[source] std::io::Error),

    /// The `.conda` zip container is invalid.
    #[error("invalid zip archive")]
    ZipError(#[from] zip::result::ZipError),

    /// The archive bytes do not match the expected checksum. This is always
    /// fatal for a download.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The checksum the record promised.
        expected: String,
        /// The checksum of the downloaded bytes.
        actual: String,
    },

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] reqwest_middleware::Error),

    /// The server replied with a non-success status.
    #[error("unexpected status {status} while downloading {url}")]
    HttpStatus {
        /// The response status.
        status: reqwest::StatusCode,

        /// The url that was requested.
        url: url::Url,

        /// The delay the server asked for via `Retry-After`, bounded to a
        /// sane maximum.
        retry_after: Option<std::time::Duration>,
    },

    /// The file name does not carry a known archive extension.
    #[error("'{0}' is not a supported package archive")]
    UnsupportedArchiveType(String),
}

/// Returns whether the given [`ExtractError`] is worth retrying: transport
/// hiccups are, checksum mismatches and malformed archives are not unless a
/// different mirror can serve different bytes.
pub fn is_transient_error(error: &ExtractError) -> bool {
    match error {
        ExtractError::Transport(reqwest_middleware::Error::Reqwest(e)) => {
            e.is_timeout() || e.is_connect() || e.is_request()
        }
        ExtractError::Transport(_) => false,
        ExtractError::HttpStatus { status, .. } => {
            status.is_server_error()
                || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || *status == reqwest::StatusCode::PAYLOAD_TOO_LARGE
        }
        _ => false,
    }
}
