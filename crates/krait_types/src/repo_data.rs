//! Defines [`RepoData`], the parsed form of a channel subdirectory index
//! (`repodata.json`).

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{package::ArchiveType, Channel, PackageRecord, RepoDataRecord};

/// The content of a `repodata.json` file: all packages of one channel
/// subdirectory, keyed by archive file name.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RepoData {
    /// The channel information contained in the repodata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ChannelInfo>,

    /// The `.tar.bz2` packages in the repodata.
    #[serde(default, serialize_with = "sorted_map")]
    pub packages: IndexMap<String, PackageRecord>,

    /// The `.conda` packages in the repodata.
    #[serde(
        default,
        rename = "packages.conda",
        serialize_with = "sorted_map",
        skip_serializing_if = "IndexMap::is_empty"
    )]
    pub conda_packages: IndexMap<String, PackageRecord>,

    /// File names that have been removed from the repodata.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed: BTreeSet<String>,

    /// The version of the repodata format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Information about the channel a `repodata.json` belongs to.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// The subdirectory the repodata describes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,

    /// The base url of the channel, if the channel serves one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Serializes a map with its keys in sorted order so that written repodata is
/// deterministic.
fn sorted_map<S: serde::Serializer>(
    map: &IndexMap<String, PackageRecord>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut sorted: Vec<_> = map.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    serializer.collect_map(sorted)
}

impl RepoData {
    /// Parses repodata from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Converts this instance into [`RepoDataRecord`]s by adding the download
    /// url and canonical channel name to every record.
    ///
    /// When the same package is available both as `.tar.bz2` and as `.conda`
    /// only the `.conda` variant is kept.
    pub fn into_repo_data_records(self, channel: &Channel) -> Vec<RepoDataRecord> {
        let mut records = Vec::with_capacity(self.packages.len() + self.conda_packages.len());
        let mut conda_stems = BTreeSet::new();
        let base_url = self.base_url(channel);
        let channel_name = channel.canonical_name();

        for (file_name, package_record) in self.conda_packages {
            if self.removed.contains(&file_name) {
                continue;
            }
            if let Some((stem, _)) = ArchiveType::split_str(&file_name) {
                conda_stems.insert(stem.to_owned());
            }
            if let Some(record) =
                make_record(file_name, package_record, &base_url, &channel_name)
            {
                records.push(record);
            }
        }

        for (file_name, package_record) in self.packages {
            if self.removed.contains(&file_name) {
                continue;
            }
            // Prefer the `.conda` variant of the same archive.
            if let Some((stem, _)) = ArchiveType::split_str(&file_name) {
                if conda_stems.contains(stem) {
                    continue;
                }
            }
            if let Some(record) =
                make_record(file_name, package_record, &base_url, &channel_name)
            {
                records.push(record);
            }
        }

        records
    }

    /// The url that package file names are resolved against: the channel's
    /// subdir url, unless the repodata overrides it with a `base_url`.
    fn base_url(&self, channel: &Channel) -> Url {
        let subdir = self
            .info
            .as_ref()
            .and_then(|info| info.subdir.as_deref())
            .unwrap_or("noarch");
        let subdir_url = channel
            .base_url
            .join(&format!("{subdir}/"))
            .unwrap_or_else(|_| channel.base_url.clone());
        match self.info.as_ref().and_then(|info| info.base_url.as_deref()) {
            Some(base) => {
                let base = if base.ends_with('/') {
                    base.to_owned()
                } else {
                    format!("{base}/")
                };
                subdir_url.join(&base).unwrap_or(subdir_url)
            }
            None => subdir_url,
        }
    }
}

fn make_record(
    file_name: String,
    package_record: PackageRecord,
    base_url: &Url,
    channel_name: &str,
) -> Option<RepoDataRecord> {
    let url = base_url.join(&file_name).ok()?;
    Some(RepoDataRecord {
        package_record,
        file_name,
        url,
        channel: channel_name.to_owned(),
    })
}
