//! Defines [`PackageRecord`] and [`RepoDataRecord`].

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use krait_digest::{serde::SerializableHash, Md5Hash, Sha256Hash};
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use url::Url;

use crate::{NoArchType, PackageName, VersionWithSource};

/// A single record in the channel index, fully identifying one installable
/// artifact by `(name, version, build, build_number, subdir)` plus payload
/// metadata.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Optionally the architecture the package supports.
    pub arch: Option<String>,

    /// The build string of the package.
    pub build: String,

    /// The build number of the package.
    pub build_number: u64,

    /// Additional constraints on packages: a spec in `constrains` restricts
    /// the allowed versions of the named package if it is installed, without
    /// requiring it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constrains: Vec<String>,

    /// Specifications of packages this package depends on.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Features are a deprecated way to specify different feature sets for
    /// the conda solver. Kept for serialization compatibility.
    pub features: Option<String>,

    /// The specific license of the package.
    pub license: Option<String>,

    /// The license family of the package.
    pub license_family: Option<String>,

    /// Optionally the MD5 hash of the package archive.
    #[serde_as(as = "Option<SerializableHash<krait_digest::Md5>>")]
    #[serde(default)]
    pub md5: Option<Md5Hash>,

    /// The name of the package.
    pub name: PackageName,

    /// If this package is independent of architecture this field specifies in
    /// what way. See [`NoArchType`].
    #[serde(default, skip_serializing_if = "NoArchType::is_none")]
    pub noarch: NoArchType,

    /// Optionally the platform the package supports.
    pub platform: Option<String>,

    /// Optionally the SHA-256 hash of the package archive.
    #[serde_as(as = "Option<SerializableHash<krait_digest::Sha256>>")]
    #[serde(default)]
    pub sha256: Option<Sha256Hash>,

    /// Optionally the size of the package archive in bytes.
    pub size: Option<u64>,

    /// The subdirectory (platform) this record belongs to.
    #[serde(default)]
    pub subdir: String,

    /// The date this entry was created.
    #[serde_as(as = "Option<crate::utils::serde::TimestampMilliseconds>")]
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Track features are nameless features that downweight a record in the
    /// solver without otherwise constraining it.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "deserialize_track_features"
    )]
    pub track_features: Vec<String>,

    /// The version of the package.
    pub version: VersionWithSource,
}

impl PackageRecord {
    /// Constructs a record with the given identity and empty payload.
    pub fn new(name: PackageName, version: impl Into<VersionWithSource>, build: String) -> Self {
        Self {
            arch: None,
            build,
            build_number: 0,
            constrains: Vec::new(),
            depends: Vec::new(),
            features: None,
            license: None,
            license_family: None,
            md5: None,
            name,
            noarch: NoArchType::none(),
            platform: None,
            sha256: None,
            size: None,
            subdir: "unknown".to_owned(),
            timestamp: None,
            track_features: Vec::new(),
            version: version.into(),
        }
    }

    /// A test helper that parses the name, version and build from strings.
    #[doc(hidden)]
    pub fn for_test(name: &str, version: &str, build: &str, build_number: u64) -> Self {
        let mut record = Self::new(
            name.parse().expect("invalid name"),
            version
                .parse::<VersionWithSource>()
                .expect("invalid version"),
            build.to_owned(),
        );
        record.build_number = build_number;
        record
    }

    /// The canonical directory name for this record:
    /// `<name>-<version>-<build>`.
    pub fn dist_str(&self) -> String {
        format!("{}-{}-{}", self.name.as_normalized(), self.version, self.build)
    }
}

impl Display for PackageRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}={}", self.name.as_normalized(), self.version, self.build)
    }
}

impl AsRef<PackageRecord> for PackageRecord {
    fn as_ref(&self) -> &PackageRecord {
        self
    }
}

/// Track features are serialized either as a comma/space separated string or
/// as a list of strings.
fn deserialize_track_features<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        String(String),
        List(Vec<String>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::String(s) => s
            .split([',', ' '])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect(),
        Raw::List(list) => list,
    })
}

/// Information about a package from repodata, along with where it came from:
/// the filename, download url and the canonical name of its channel.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepoDataRecord {
    /// The data stored in the repodata.json.
    #[serde(flatten)]
    pub package_record: PackageRecord,

    /// The filename of the package archive.
    #[serde(rename = "fn")]
    pub file_name: String,

    /// The url to download the package from.
    pub url: Url,

    /// The canonical name of the channel this record came from.
    pub channel: String,
}

impl AsRef<PackageRecord> for RepoDataRecord {
    fn as_ref(&self) -> &PackageRecord {
        &self.package_record
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const RECORD_JSON: &str = r#"{
        "build": "pyhd8ed1ab_0",
        "build_number": 0,
        "depends": ["python >=3.5", "six"],
        "license": "Apache-2.0",
        "license_family": "Apache",
        "md5": "bf7f54dd0f25c3f06ecb82a07341841a",
        "name": "asttokens",
        "noarch": "python",
        "sha256": "7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c",
        "size": 27831,
        "subdir": "noarch",
        "timestamp": 1670264089059,
        "version": "2.2.1"
    }"#;

    #[test]
    fn test_deserialize() {
        let record: PackageRecord = serde_json::from_str(RECORD_JSON).unwrap();
        assert_eq!(record.name.as_normalized(), "asttokens");
        assert_eq!(record.version.to_string(), "2.2.1");
        assert_eq!(record.build_number, 0);
        assert!(record.noarch.is_python());
        assert_eq!(record.depends.len(), 2);
        assert_eq!(
            format!("{:x}", record.md5.unwrap()),
            "bf7f54dd0f25c3f06ecb82a07341841a"
        );
        assert_eq!(
            record.timestamp.unwrap().timestamp_millis(),
            1670264089059
        );
    }

    #[test]
    fn test_round_trip() {
        let record: PackageRecord = serde_json::from_str(RECORD_JSON).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let back: PackageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn test_track_features_from_string() {
        let record: PackageRecord = serde_json::from_str(
            r#"{"name": "foo", "version": "1", "build": "0", "build_number": 0,
                "track_features": "feat1 feat2"}"#,
        )
        .unwrap();
        assert_eq!(record.track_features, vec!["feat1", "feat2"]);
    }

    #[test]
    fn test_dist_str() {
        let record = PackageRecord::for_test("foo", "1.0", "hbld_0", 0);
        assert_eq!(record.dist_str(), "foo-1.0-hbld_0");
    }
}
