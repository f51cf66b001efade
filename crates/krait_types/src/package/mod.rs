//! Types that describe the contents of a package archive: the metadata files
//! under `info/` and the archive naming conventions.

use std::path::{Path, PathBuf};

use krait_digest::{serde::SerializableHash, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};

use crate::NoArchType;

/// The supported package archive formats.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ArchiveType {
    /// The legacy bzip2-compressed tarball format (`.tar.bz2`).
    TarBz2,

    /// The newer zip-of-zstd-tarballs format (`.conda`).
    Conda,
}

impl ArchiveType {
    /// Returns the file extension of the archive type, including the dot.
    pub const fn extension(self) -> &'static str {
        match self {
            ArchiveType::TarBz2 => ".tar.bz2",
            ArchiveType::Conda => ".conda",
        }
    }

    /// Determines the archive type from a file name.
    pub fn try_from_path(path: impl AsRef<Path>) -> Option<ArchiveType> {
        path.as_ref()
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(|f| Self::split_str(f).map(|(_, ty)| ty))
    }

    /// Splits a file name into its stem and archive type.
    pub fn split_str(file_name: &str) -> Option<(&str, ArchiveType)> {
        if let Some(stem) = file_name.strip_suffix(".conda") {
            Some((stem, ArchiveType::Conda))
        } else {
            file_name
                .strip_suffix(".tar.bz2")
                .map(|stem| (stem, ArchiveType::TarBz2))
        }
    }
}

/// The identity encoded in a package archive file name:
/// `<name>-<version>-<build><ext>`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ArchiveIdentifier {
    /// The package name.
    pub name: String,

    /// The version string.
    pub version: String,

    /// The build string.
    pub build_string: String,

    /// The type of the archive.
    pub archive_type: ArchiveType,
}

impl ArchiveIdentifier {
    /// Parses an identifier from an archive file name.
    pub fn try_from_filename(file_name: &str) -> Option<Self> {
        let (stem, archive_type) = ArchiveType::split_str(file_name)?;
        // The build string and version never contain dashes, the name might.
        let (rest, build_string) = stem.rsplit_once('-')?;
        let (name, version) = rest.rsplit_once('-')?;
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_owned(),
            version: version.to_owned(),
            build_string: build_string.to_owned(),
            archive_type,
        })
    }

    /// Parses an identifier from a path to an archive.
    pub fn try_from_path(path: impl AsRef<Path>) -> Option<Self> {
        Self::try_from_filename(path.as_ref().file_name()?.to_str()?)
    }

    /// The directory name for the extracted archive.
    pub fn dist_str(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.build_string)
    }
}

impl std::fmt::Display for ArchiveIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.dist_str(), self.archive_type.extension())
    }
}

/// A metadata file stored in the `info/` directory of a package.
pub trait PackageFile: Sized + serde::de::DeserializeOwned {
    /// The path of the file relative to the package root.
    fn package_path() -> &'static Path;

    /// Parses the file from a string.
    fn from_str(str: &str) -> Result<Self, std::io::Error> {
        serde_json::from_str(str).map_err(std::io::Error::other)
    }

    /// Reads the file from an extracted package directory.
    fn from_package_directory(path: &Path) -> Result<Self, std::io::Error> {
        let path = path.join(Self::package_path());
        let content = fs_err::read_to_string(path)?;
        Self::from_str(&content)
    }
}

/// The `info/index.json` file of a package.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJson {
    /// The architecture of the package.
    pub arch: Option<String>,

    /// The build string.
    pub build: String,

    /// The build number.
    #[serde(default)]
    pub build_number: u64,

    /// The package constraints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constrains: Vec<String>,

    /// The package dependencies.
    #[serde(default)]
    pub depends: Vec<String>,

    /// The license of the package.
    pub license: Option<String>,

    /// The license family.
    pub license_family: Option<String>,

    /// The package name.
    pub name: String,

    /// The noarch kind of the package.
    #[serde(default, skip_serializing_if = "NoArchType::is_none")]
    pub noarch: NoArchType,

    /// The platform of the package.
    pub platform: Option<String>,

    /// The subdir of the package.
    pub subdir: Option<String>,

    /// The creation timestamp in milliseconds.
    pub timestamp: Option<u64>,

    /// The version string.
    pub version: String,
}

impl PackageFile for IndexJson {
    fn package_path() -> &'static Path {
        Path::new("info/index.json")
    }
}

/// How a file must be installed into a prefix.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    /// Link the file from the package cache.
    Hardlink,

    /// Create a symbolic link.
    Softlink,

    /// Create an (empty) directory.
    Directory,
}

/// Whether a prefix placeholder is stored as text or as part of a binary.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    /// The file is a binary; the placeholder is padded with `\0` on rewrite.
    Binary,

    /// The file is text; the placeholder is replaced verbatim.
    Text,
}

/// A single entry of the `info/paths.json` file.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsEntry {
    /// The location of the file in the package, relative to the package root.
    #[serde(rename = "_path")]
    pub relative_path: PathBuf,

    /// How the file should be installed.
    pub path_type: PathType,

    /// The SHA-256 of the file as stored in the package.
    #[serde_as(as = "Option<SerializableHash<krait_digest::Sha256>>")]
    #[serde(default)]
    pub sha256: Option<Sha256Hash>,

    /// The size of the file in bytes.
    #[serde(default)]
    pub size_in_bytes: Option<u64>,

    /// The placeholder prefix the file was built against, if any. Files with
    /// a placeholder must be rewritten with the real prefix on install.
    #[serde(default)]
    pub prefix_placeholder: Option<String>,

    /// Whether the placeholder is inside text or binary content.
    #[serde(default)]
    pub file_mode: Option<FileMode>,

    /// Whether this file must never be linked (always copied).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_link: bool,
}

/// The `info/paths.json` file: every file contained in a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsJson {
    /// The version of the file format.
    pub paths_version: u64,

    /// The entries of the package.
    #[serde(default)]
    pub paths: Vec<PathsEntry>,
}

impl Default for PathsJson {
    fn default() -> Self {
        Self {
            paths_version: 1,
            paths: Vec::new(),
        }
    }
}

impl PackageFile for PathsJson {
    fn package_path() -> &'static Path {
        Path::new("info/paths.json")
    }
}

/// The `info/about.json` file of a package.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AboutJson {
    /// The channels the package was built from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,

    /// A description of the package.
    pub description: Option<String>,

    /// The url of the development page.
    pub dev_url: Option<serde_json::Value>,

    /// The url of the documentation.
    pub doc_url: Option<serde_json::Value>,

    /// The homepage of the package.
    pub home: Option<serde_json::Value>,

    /// The license of the package.
    pub license: Option<String>,

    /// The license family.
    pub license_family: Option<String>,

    /// A short summary.
    pub summary: Option<String>,
}

impl PackageFile for AboutJson {
    fn package_path() -> &'static Path {
        Path::new("info/about.json")
    }
}
