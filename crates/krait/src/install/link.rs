//! Linking a single file from an extracted package into a prefix.

use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
};

use krait_digest::{HashingWriter, Sha256, Sha256Hash};
use krait_types::package::{FileMode, PathType, PathsEntry};

/// How a file is materialized in the prefix.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum LinkMethod {
    /// A hard link into the package cache.
    Hardlink,

    /// A symbolic link into the package cache.
    Softlink,

    /// A plain copy.
    Copy,

    /// A copy with the prefix placeholder rewritten.
    Patched(FileMode),
}

impl fmt::Display for LinkMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMethod::Hardlink => write!(f, "hardlink"),
            LinkMethod::Softlink => write!(f, "softlink"),
            LinkMethod::Copy => write!(f, "copy"),
            LinkMethod::Patched(FileMode::Text) => write!(f, "text patched"),
            LinkMethod::Patched(FileMode::Binary) => write!(f, "binary patched"),
        }
    }
}

/// The configured link behavior. Validated combinations only; contradictions
/// are rejected at configuration load.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    /// Permit falling back to symbolic links.
    pub allow_softlinks: bool,

    /// Copy everything, never link.
    pub always_copy: bool,

    /// Symbolic-link everything that can be linked.
    pub always_softlink: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            allow_softlinks: true,
            always_copy: false,
            always_softlink: false,
        }
    }
}

impl LinkOptions {
    /// The method to use for a paths entry. Files with a placeholder are
    /// always copied and patched; `always_copy` beats `always_softlink`;
    /// otherwise hard links are the default, with softlink and copy as
    /// fallbacks applied at link time.
    pub fn method_for(&self, entry: &PathsEntry) -> LinkMethod {
        if let Some(file_mode) = entry.file_mode {
            if entry.prefix_placeholder.is_some() {
                return LinkMethod::Patched(file_mode);
            }
        }
        if entry.no_link || self.always_copy {
            return LinkMethod::Copy;
        }
        if self.always_softlink {
            return LinkMethod::Softlink;
        }
        if entry.path_type == PathType::Softlink {
            return LinkMethod::Softlink;
        }
        LinkMethod::Hardlink
    }
}

/// Errors that can occur when calling [`link_file`].
#[derive(Debug, thiserror::Error)]
pub enum LinkFileError {
    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The parent directory of the destination could not be created.
    #[error("failed to create parent directory")]
    FailedToCreateParentDirectory(#[source] std::io::Error),

    /// The source file could not be opened.
    #[error("could not open source file for reading")]
    FailedToOpenSourceFile(#[source] std::io::Error),

    /// Creating the link failed.
    #[error("failed to {0} file into the prefix")]
    FailedToLink(LinkMethod, #[source] std::io::Error),

    /// The destination already exists and clobbering is not allowed.
    #[error("'{0}' already exists in the prefix")]
    LinkConflict(PathBuf),
}

/// The result of linking one file.
pub struct LinkedFile {
    /// Whether an existing file was overwritten.
    pub clobbered: bool,

    /// The SHA-256 of the file as it exists in the prefix. `None` when the
    /// file was hard linked without modification and the source hash applies
    /// unchanged.
    pub sha256_in_prefix: Option<Sha256Hash>,

    /// The size of the installed file in bytes.
    pub file_size: u64,

    /// The method that was used.
    pub method: LinkMethod,
}

/// Links a single file from an extracted package directory into the prefix,
/// rewriting the prefix placeholder where required.
///
/// `target_prefix` is the absolute path rendered into patched files, which
/// can differ from `target_dir` when building relocatable environments.
pub fn link_file(
    entry: &PathsEntry,
    destination: &Path,
    package_dir: &Path,
    target_prefix: &str,
    method: LinkMethod,
    allow_clobber: bool,
) -> Result<LinkedFile, LinkFileError> {
    let source = package_dir.join(&entry.relative_path);

    if let Some(parent) = destination.parent() {
        if !parent.is_dir() {
            fs_err::create_dir_all(parent)
                .map_err(LinkFileError::FailedToCreateParentDirectory)?;
        }
    }

    let clobbered = destination.exists();
    if clobbered {
        if !allow_clobber {
            return Err(LinkFileError::LinkConflict(destination.to_path_buf()));
        }
        // Hard links refuse to overwrite; clear the slot first.
        fs_err::remove_file(destination)?;
    }

    let (sha256_in_prefix, file_size) = match method {
        LinkMethod::Patched(file_mode) => {
            let contents = fs_err::read(&source).map_err(LinkFileError::FailedToOpenSourceFile)?;
            let placeholder = entry
                .prefix_placeholder
                .as_deref()
                .expect("patched files always carry a placeholder");
            let patched = replace_placeholder(&contents, placeholder, target_prefix, file_mode);

            let file = fs_err::File::create(destination)?;
            let mut writer = HashingWriter::<_, Sha256>::new(file);
            writer.write_all(&patched)?;
            let (file, digest) = writer.finalize();
            copy_permissions(&source, file.file())?;
            (Some(digest), patched.len() as u64)
        }
        LinkMethod::Copy => {
            fs_err::copy(&source, destination)
                .map_err(|e| LinkFileError::FailedToLink(LinkMethod::Copy, e))?;
            let size = fs_err::metadata(destination)?.len();
            (entry.sha256, size)
        }
        LinkMethod::Softlink => {
            symlink(&source, destination)
                .map_err(|e| LinkFileError::FailedToLink(LinkMethod::Softlink, e))?;
            (entry.sha256, entry.size_in_bytes.unwrap_or_default())
        }
        LinkMethod::Hardlink => {
            match fs_err::hard_link(&source, destination) {
                Ok(()) => {}
                Err(e) => {
                    // Cross-device links fail; fall back to a copy.
                    tracing::debug!(
                        "hard link of {} failed ({}), copying instead",
                        source.display(),
                        e
                    );
                    fs_err::copy(&source, destination)
                        .map_err(|e| LinkFileError::FailedToLink(LinkMethod::Hardlink, e))?;
                }
            }
            let size = fs_err::metadata(destination)?.len();
            (entry.sha256, size)
        }
    };

    Ok(LinkedFile {
        clobbered,
        sha256_in_prefix,
        file_size,
        method,
    })
}

/// Replaces every occurrence of the placeholder with the target prefix.
///
/// In text mode this is a straight substitution. In binary mode the
/// surrounding c-string must keep its length: the new prefix (which must not
/// be longer than the placeholder) is written and the remainder of the
/// original string is shifted left, padded with `\0`.
pub fn replace_placeholder(
    contents: &[u8],
    placeholder: &str,
    target_prefix: &str,
    file_mode: FileMode,
) -> Vec<u8> {
    let placeholder_bytes = placeholder.as_bytes();
    let target_bytes = target_prefix.as_bytes();

    match file_mode {
        FileMode::Text => {
            let mut result = Vec::with_capacity(contents.len());
            let mut rest = contents;
            while let Some(position) = find(rest, placeholder_bytes) {
                result.extend_from_slice(&rest[..position]);
                result.extend_from_slice(target_bytes);
                rest = &rest[position + placeholder_bytes.len()..];
            }
            result.extend_from_slice(rest);
            result
        }
        FileMode::Binary => {
            if target_bytes.len() > placeholder_bytes.len() {
                tracing::warn!(
                    "target prefix is longer than the placeholder, patching as text"
                );
                return replace_placeholder(
                    contents,
                    placeholder,
                    target_prefix,
                    FileMode::Text,
                );
            }
            let mut result = contents.to_vec();
            let mut search_start = 0;
            while let Some(position) = find(&result[search_start..], placeholder_bytes) {
                let position = search_start + position;
                // The padded c-string ends at the original nul terminator.
                let string_end = result[position..]
                    .iter()
                    .position(|&b| b == 0)
                    .map_or(result.len(), |nul| position + nul);

                let suffix: Vec<u8> =
                    result[position + placeholder_bytes.len()..string_end].to_vec();
                let mut replacement = Vec::with_capacity(string_end - position);
                replacement.extend_from_slice(target_bytes);
                replacement.extend_from_slice(&suffix);
                replacement.resize(string_end - position, 0);
                result.splice(position..string_end, replacement);
                search_start = position + target_bytes.len();
            }
            result
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(unix)]
fn symlink(source: &Path, destination: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, destination)
}

#[cfg(windows)]
fn symlink(source: &Path, destination: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(source, destination)
}

#[cfg(unix)]
fn copy_permissions(source: &Path, destination: &std::fs::File) -> std::io::Result<()> {
    let permissions = std::fs::metadata(source)?.permissions();
    destination.set_permissions(permissions)
}

#[cfg(not(unix))]
fn copy_permissions(_source: &Path, _destination: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}
