//! Parsing of `@EXPLICIT` environment lock files.
//!
//! An explicit file lists package urls (optionally with an `#<hash>`
//! fragment) in installation order. No solve is needed to apply one, which
//! makes them the fastest way to reproduce an environment.

use std::{path::Path, str::FromStr};

use krait_digest::{Md5Hash, Sha256Hash};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{ParsePlatformError, Platform};

/// The parsed contents of an explicit environment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplicitEnvironmentSpec {
    /// The platform the environment was exported for, from a
    /// `# platform: <p>` comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// The package urls, in installation order.
    pub packages: Vec<ExplicitEnvironmentEntry>,
}

/// A single package url in an explicit environment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "Url", from = "Url")]
pub struct ExplicitEnvironmentEntry {
    /// The url to download the package from. The fragment, if present, is the
    /// expected hash of the archive.
    pub url: Url,
}

/// The expected hash of a package archive, from the url fragment.
#[derive(Debug, Clone)]
pub enum PackageArchiveHash {
    /// An MD5 hash (32 hex characters, the conda default).
    Md5(Md5Hash),
    /// A SHA-256 hash (64 hex characters or a `sha256:` prefix).
    Sha256(Sha256Hash),
}

/// An error that can occur when parsing a [`PackageArchiveHash`].
#[derive(Debug, Clone, Error)]
pub enum ParsePackageArchiveHashError {
    /// The value is not valid hex of the expected length.
    #[error("'{0}' is not a valid md5 or sha256 hash")]
    InvalidHash(String),
}

impl FromStr for PackageArchiveHash {
    type Err = ParsePackageArchiveHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParsePackageArchiveHashError::InvalidHash(s.to_owned());
        if let Some(rest) = s.strip_prefix("sha256:") {
            return krait_digest::parse_digest_from_hex::<krait_digest::Sha256>(rest)
                .map(PackageArchiveHash::Sha256)
                .ok_or_else(invalid);
        }
        if s.len() == 64 {
            krait_digest::parse_digest_from_hex::<krait_digest::Sha256>(s)
                .map(PackageArchiveHash::Sha256)
                .ok_or_else(invalid)
        } else {
            krait_digest::parse_digest_from_hex::<krait_digest::Md5>(s)
                .map(PackageArchiveHash::Md5)
                .ok_or_else(invalid)
        }
    }
}

impl ExplicitEnvironmentEntry {
    /// The expected hash of the package archive, if the url carries one.
    pub fn package_archive_hash(
        &self,
    ) -> Result<Option<PackageArchiveHash>, ParsePackageArchiveHashError> {
        self.url
            .fragment()
            .map_or(Ok(None), |f| PackageArchiveHash::from_str(f).map(Some))
    }

    /// The url without its hash fragment.
    pub fn url_without_fragment(&self) -> Url {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url
    }
}

impl From<Url> for ExplicitEnvironmentEntry {
    fn from(url: Url) -> Self {
        Self { url }
    }
}

impl From<ExplicitEnvironmentEntry> for Url {
    fn from(entry: ExplicitEnvironmentEntry) -> Self {
        entry.url
    }
}

/// An error that can occur when parsing an [`ExplicitEnvironmentSpec`].
#[derive(Debug, Error)]
pub enum ParseExplicitEnvironmentSpecError {
    /// The `@EXPLICIT` marker is missing.
    #[error("the @EXPLICIT marker is missing")]
    MissingExplicitTag,

    /// A line could not be parsed as a url.
    #[error("failed to parse url '{0}'")]
    InvalidUrl(String, #[source] url::ParseError),

    /// The platform comment could not be parsed.
    #[error(transparent)]
    InvalidPlatform(#[from] ParsePlatformError),

    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl ExplicitEnvironmentSpec {
    /// Parses an explicit environment file from disk.
    pub fn from_path(path: &Path) -> Result<Self, ParseExplicitEnvironmentSpecError> {
        Self::from_str(&fs_err::read_to_string(path)?)
    }

    /// Renders the spec back into the file format.
    pub fn to_spec_string(&self) -> String {
        let mut out = String::new();
        if let Some(platform) = self.platform {
            out.push_str(&format!("# platform: {platform}\n"));
        }
        out.push_str("@EXPLICIT\n");
        for package in &self.packages {
            out.push_str(package.url.as_str());
            out.push('\n');
        }
        out
    }

    /// Writes the spec to a file.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), std::io::Error> {
        fs_err::write(path.as_ref(), self.to_spec_string())
    }
}

impl FromStr for ExplicitEnvironmentSpec {
    type Err = ParseExplicitEnvironmentSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut platform = None;
        let mut seen_explicit_tag = false;
        let mut packages = Vec::new();

        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                if let Some(platform_str) = comment.trim_start().strip_prefix("platform:") {
                    platform = Some(Platform::from_str(platform_str.trim())?);
                }
            } else if line == "@EXPLICIT" {
                seen_explicit_tag = true;
            } else if !seen_explicit_tag {
                return Err(ParseExplicitEnvironmentSpecError::MissingExplicitTag);
            } else {
                let url = Url::parse(line).map_err(|e| {
                    ParseExplicitEnvironmentSpecError::InvalidUrl(line.to_owned(), e)
                })?;
                packages.push(url.into());
            }
        }

        if !seen_explicit_tag {
            return Err(ParseExplicitEnvironmentSpecError::MissingExplicitTag);
        }

        Ok(Self { platform, packages })
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    const EXPLICIT: &str = "\
# This file may be used to create an environment using:
# platform: linux-64
@EXPLICIT
https://repo.example.com/linux-64/foo-1.0-hbld_0.conda#d41d8cd98f00b204e9800998ecf8427e
https://repo.example.com/noarch/bar-2.0-0.tar.bz2
";

    #[test]
    fn test_parse() {
        let spec = ExplicitEnvironmentSpec::from_str(EXPLICIT).unwrap();
        assert_eq!(spec.platform, Some(Platform::Linux64));
        assert_eq!(spec.packages.len(), 2);
        assert_matches!(
            spec.packages[0].package_archive_hash(),
            Ok(Some(PackageArchiveHash::Md5(_)))
        );
        assert_matches!(spec.packages[1].package_archive_hash(), Ok(None));
        assert_eq!(
            spec.packages[0].url_without_fragment().as_str(),
            "https://repo.example.com/linux-64/foo-1.0-hbld_0.conda"
        );
    }

    #[test]
    fn test_missing_tag() {
        assert_matches!(
            ExplicitEnvironmentSpec::from_str("https://repo.example.com/a-1-0.conda"),
            Err(ParseExplicitEnvironmentSpecError::MissingExplicitTag)
        );
        assert_matches!(
            ExplicitEnvironmentSpec::from_str(""),
            Err(ParseExplicitEnvironmentSpecError::MissingExplicitTag)
        );
    }

    #[test]
    fn test_invalid_url() {
        assert_matches!(
            ExplicitEnvironmentSpec::from_str("@EXPLICIT\nnot a url"),
            Err(ParseExplicitEnvironmentSpecError::InvalidUrl(s, _)) if s == "not a url"
        );
    }

    #[test]
    fn test_round_trip() {
        let spec = ExplicitEnvironmentSpec::from_str(EXPLICIT).unwrap();
        let rendered = spec.to_spec_string();
        let reparsed = ExplicitEnvironmentSpec::from_str(&rendered).unwrap();
        assert_eq!(reparsed.platform, spec.platform);
        assert_eq!(
            reparsed.packages.iter().map(|p| &p.url).collect::<Vec<_>>(),
            spec.packages.iter().map(|p| &p.url).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_sha256_fragment() {
        let entry: ExplicitEnvironmentEntry = Url::parse(
            "https://repo.example.com/linux-64/foo-1.0-0.conda#sha256:315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3",
        )
        .unwrap()
        .into();
        assert_matches!(
            entry.package_archive_hash(),
            Ok(Some(PackageArchiveHash::Sha256(_)))
        );
    }
}
