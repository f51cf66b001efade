//! Information about the python interpreter in an environment, used to place
//! noarch python files.

use std::path::PathBuf;

use krait_types::{Platform, Version, VersionWithSource};
use thiserror::Error;

/// An error constructing [`PythonInfo`].
#[derive(Debug, Error)]
pub enum PythonInfoError {
    /// The python version lacks a major or minor component.
    #[error("invalid python version '{0}'")]
    InvalidVersion(String),
}

/// Describes where python keeps its files inside a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonInfo {
    /// The major version.
    pub major: u64,

    /// The minor version.
    pub minor: u64,

    /// The `site-packages` directory, relative to the prefix root.
    pub site_packages_path: PathBuf,

    /// The directory executables live in, relative to the prefix root.
    pub bin_dir: PathBuf,
}

impl PythonInfo {
    /// Computes the layout for the given python version and platform.
    pub fn from_version(
        version: &VersionWithSource,
        platform: Platform,
    ) -> Result<Self, PythonInfoError> {
        let version: &Version = version.version();
        let (Some(major), Some(minor)) = (version.major(), version.minor()) else {
            return Err(PythonInfoError::InvalidVersion(version.to_string()));
        };
        let (site_packages_path, bin_dir) = if platform.is_windows() {
            (PathBuf::from("Lib/site-packages"), PathBuf::from("Scripts"))
        } else {
            (
                PathBuf::from(format!("lib/python{major}.{minor}/site-packages")),
                PathBuf::from("bin"),
            )
        };
        Ok(Self {
            major,
            minor,
            site_packages_path,
            bin_dir,
        })
    }

    /// Returns true when noarch python packages installed for `other` must
    /// be relinked for `self`: the site-packages location moves whenever the
    /// major or minor version changes.
    pub fn is_relink_required(&self, other: &PythonInfo) -> bool {
        self.major != other.major || self.minor != other.minor
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn version(s: &str) -> VersionWithSource {
        VersionWithSource::from_str(s).unwrap()
    }

    #[test]
    fn test_unix_layout() {
        let info = PythonInfo::from_version(&version("3.11.2"), Platform::Linux64).unwrap();
        assert_eq!(
            info.site_packages_path,
            PathBuf::from("lib/python3.11/site-packages")
        );
        assert_eq!(info.bin_dir, PathBuf::from("bin"));
    }

    #[test]
    fn test_windows_layout() {
        let info = PythonInfo::from_version(&version("3.11.2"), Platform::Win64).unwrap();
        assert_eq!(info.site_packages_path, PathBuf::from("Lib/site-packages"));
    }

    #[test]
    fn test_relink_rule() {
        let old = PythonInfo::from_version(&version("3.10.8"), Platform::Linux64).unwrap();
        let patch = PythonInfo::from_version(&version("3.10.12"), Platform::Linux64).unwrap();
        let minor = PythonInfo::from_version(&version("3.11.0"), Platform::Linux64).unwrap();
        assert!(!patch.is_relink_required(&old));
        assert!(minor.is_relink_required(&old));
    }

    #[test]
    fn test_invalid_version() {
        assert_matches::assert_matches!(
            PythonInfo::from_version(&version("rc"), Platform::Linux64),
            Err(PythonInfoError::InvalidVersion(_))
        );
    }
}
