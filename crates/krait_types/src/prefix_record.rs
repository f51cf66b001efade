//! Defines [`PrefixRecord`]: the on-disk record of a package installed into a
//! prefix, stored as `conda-meta/<name>-<version>-<build>.json`.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use krait_digest::{serde::SerializableHash, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};

use crate::{package::FileMode, RepoDataRecord};

/// How a file ended up inside a prefix.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixPathType {
    /// The file is a hard link to the package cache.
    Hardlink,

    /// The file is a symbolic link.
    Softlink,

    /// An empty directory created at install time.
    Directory,

    /// A python byte-code file compiled after linking.
    PycFile,

    /// A python entry point script generated at install time.
    UnixPythonEntryPoint,
}

/// Information about a single file installed for a package.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixPathsEntry {
    /// The path relative to the root of the prefix.
    #[serde(rename = "_path")]
    pub relative_path: PathBuf,

    /// How the file was installed.
    pub path_type: PrefixPathType,

    /// The SHA-256 of the file as it was in the package.
    #[serde_as(as = "Option<SerializableHash<krait_digest::Sha256>>")]
    #[serde(default)]
    pub sha256: Option<Sha256Hash>,

    /// The SHA-256 of the file as it exists in the prefix. Differs from
    /// `sha256` when a prefix placeholder was rewritten.
    #[serde_as(as = "Option<SerializableHash<krait_digest::Sha256>>")]
    #[serde(default)]
    pub sha256_in_prefix: Option<Sha256Hash>,

    /// The size of the installed file in bytes.
    #[serde(default)]
    pub size_in_bytes: Option<u64>,

    /// The placeholder prefix that was rewritten, if any.
    #[serde(default)]
    pub prefix_placeholder: Option<String>,

    /// The file mode used for placeholder rewriting.
    #[serde(default)]
    pub file_mode: Option<FileMode>,
}

/// The `paths_data` section of a prefix record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixPaths {
    /// The version of this file format.
    pub paths_version: u64,

    /// The files installed for the package.
    #[serde(default)]
    pub paths: Vec<PrefixPathsEntry>,
}

impl Default for PrefixPaths {
    fn default() -> Self {
        Self {
            paths_version: 1,
            paths: Vec::new(),
        }
    }
}

/// The type of link that was used to install a package.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Hard linked from the package cache.
    Hardlink,

    /// Soft linked from the package cache.
    Softlink,

    /// Copied from the package cache.
    Copy,
}

/// Information about the source location a package was linked from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    /// The directory in the package cache the package was linked from.
    pub source: PathBuf,

    /// The type of link that was predominantly used.
    #[serde(rename = "type")]
    pub link_type: LinkType,
}

/// A record of a single package installed within a prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixRecord {
    /// The repodata record the package was installed from.
    #[serde(flatten)]
    pub repodata_record: RepoDataRecord,

    /// The path to the package archive in the package cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_tarball_full_path: Option<PathBuf>,

    /// The path to the extracted package in the package cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_package_dir: Option<PathBuf>,

    /// The files installed for the package, relative to the prefix root.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Detailed information about every installed file.
    #[serde(default)]
    pub paths_data: PrefixPaths,

    /// How the package was linked into the prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Link>,

    /// The spec the user originally requested, if this package was an
    /// explicit request rather than a dependency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_spec: Option<String>,
}

impl PrefixRecord {
    /// Constructs a new instance from a repodata record with no installed
    /// files.
    pub fn from_repodata_record(repodata_record: RepoDataRecord) -> Self {
        Self {
            repodata_record,
            package_tarball_full_path: None,
            extracted_package_dir: None,
            files: Vec::new(),
            paths_data: PrefixPaths::default(),
            link: None,
            requested_spec: None,
        }
    }

    /// The file name this record is stored under inside `conda-meta`.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.repodata_record.package_record.dist_str())
    }

    /// Parses a prefix record from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let content = fs_err::read_to_string(path.as_ref())?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }

    /// Writes the record to the given path as pretty-printed json.
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), std::io::Error> {
        let mut file = fs_err::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(&mut file, self).map_err(std::io::Error::other)?;
        file.flush()
    }

    /// Reads all prefix records from the `conda-meta` directory of a prefix.
    /// A missing directory yields an empty set.
    pub fn collect_from_prefix(prefix: &Path) -> Result<Vec<Self>, std::io::Error> {
        let meta_dir = prefix.join("conda-meta");
        let entries = match fs_err::read_dir(&meta_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                records.push(Self::from_path(&path)?);
            }
        }
        records.sort_by(|a, b| {
            a.repodata_record
                .package_record
                .name
                .cmp(&b.repodata_record.package_record.name)
        });
        Ok(records)
    }
}

impl AsRef<RepoDataRecord> for PrefixRecord {
    fn as_ref(&self) -> &RepoDataRecord {
        &self.repodata_record
    }
}

impl AsRef<crate::PackageRecord> for PrefixRecord {
    fn as_ref(&self) -> &crate::PackageRecord {
        &self.repodata_record.package_record
    }
}
