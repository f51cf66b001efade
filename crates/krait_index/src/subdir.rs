//! [`SubdirData`]: the loaded index of one `(channel, platform)` pair.

use std::path::PathBuf;

use reqwest_middleware::ClientWithMiddleware;
use thiserror::Error;
use url::Url;

use krait_types::{Channel, Platform, RepoData, RepoDataRecord};

use crate::{
    fetch_repo_data, CacheAction, CacheResult, FetchRepoDataError, FetchRepoDataOptions,
};

/// Errors that can occur while loading a subdir index.
#[derive(Debug, Error)]
pub enum LoadRepoDataError {
    /// The index could not be fetched.
    #[error(transparent)]
    Fetch(#[from] FetchRepoDataError),

    /// The cached index could not be parsed, even after refetching it.
    #[error("the repodata for {0} is corrupted")]
    Corrupted(Url, #[source] serde_json::Error),

    /// An I/O error occurred while reading the cached index.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// The index of one channel subdirectory: knows where the remote index lives,
/// where it is cached, and how to load it into records.
pub struct SubdirData {
    channel: Channel,
    platform: Platform,
    cache_path: PathBuf,
    client: ClientWithMiddleware,
}

impl SubdirData {
    /// Creates a handle for one `(channel, platform)` pair.
    pub fn new(
        channel: Channel,
        platform: Platform,
        client: ClientWithMiddleware,
        cache_path: PathBuf,
    ) -> Self {
        Self {
            channel,
            platform,
            cache_path,
            client,
        }
    }

    /// The channel this subdir belongs to.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The platform of this subdir.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The remote url of this subdir.
    pub fn subdir_url(&self) -> Url {
        self.channel.platform_url(self.platform)
    }

    /// Fetches (or revalidates) the index and parses it into records.
    ///
    /// A cache that fails to parse is deleted and, unless operating offline,
    /// fetched once more; a second parse failure is fatal for this channel.
    pub async fn load(
        &self,
        options: FetchRepoDataOptions,
    ) -> Result<Vec<RepoDataRecord>, LoadRepoDataError> {
        let offline = options.cache_action == CacheAction::UseCacheOnly;
        let fetched = fetch_repo_data(
            self.subdir_url(),
            self.client.clone(),
            self.cache_path.clone(),
            options,
        )
        .await?;

        let bytes = tokio::fs::read(&fetched.path).await?;
        match RepoData::from_slice(&bytes) {
            Ok(repo_data) => Ok(repo_data.into_repo_data_records(&self.channel)),
            Err(parse_error) => {
                tracing::warn!(
                    "failed to parse cached repodata for {}: {}",
                    self.subdir_url(),
                    parse_error
                );
                if offline || !fetched.path.starts_with(&self.cache_path) {
                    return Err(LoadRepoDataError::Corrupted(self.subdir_url(), parse_error));
                }

                // Drop the corrupted cache and fetch once more.
                let _ = std::fs::remove_file(&fetched.path);
                let refetched = fetch_repo_data(
                    self.subdir_url(),
                    self.client.clone(),
                    self.cache_path.clone(),
                    FetchRepoDataOptions {
                        cache_action: CacheAction::ForceFetch,
                        ..FetchRepoDataOptions::default()
                    },
                )
                .await?;
                debug_assert!(matches!(
                    refetched.cache_result,
                    CacheResult::CacheNotPresent | CacheResult::CacheOutdated
                ));

                let bytes = tokio::fs::read(&refetched.path).await?;
                RepoData::from_slice(&bytes)
                    .map(|repo_data| repo_data.into_repo_data_records(&self.channel))
                    .map_err(|e| LoadRepoDataError::Corrupted(self.subdir_url(), e))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use krait_types::ChannelConfig;

    use super::*;

    const REPODATA: &str = r#"{
        "info": { "subdir": "linux-64" },
        "packages": {
            "foo-1.0-0.tar.bz2": {
                "build": "0", "build_number": 0, "depends": [],
                "name": "foo", "subdir": "linux-64", "version": "1.0"
            }
        }
    }"#;

    fn local_channel(dir: &std::path::Path) -> Channel {
        let config = ChannelConfig::default_with_root_dir(PathBuf::from("/"));
        Channel::from_str(dir.to_str().unwrap(), &config).unwrap()
    }

    #[tokio::test]
    async fn test_load_local_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let subdir = dir.path().join("linux-64");
        fs_err::create_dir_all(&subdir).unwrap();
        fs_err::write(subdir.join("repodata.json"), REPODATA).unwrap();

        let channel = local_channel(dir.path());
        let client = ClientWithMiddleware::from(reqwest::Client::new());
        let subdir_data = SubdirData::new(
            channel,
            Platform::Linux64,
            client,
            dir.path().join("cache"),
        );

        let records = subdir_data
            .load(FetchRepoDataOptions::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].package_record.name.as_normalized(), "foo");
        assert!(records[0].url.as_str().ends_with("linux-64/foo-1.0-0.tar.bz2"));
    }

    #[tokio::test]
    async fn test_corrupted_local_subdir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let subdir = dir.path().join("linux-64");
        fs_err::create_dir_all(&subdir).unwrap();
        fs_err::write(subdir.join("repodata.json"), "not json at all").unwrap();

        let channel = local_channel(dir.path());
        let client = ClientWithMiddleware::from(reqwest::Client::new());
        let subdir_data = SubdirData::new(
            channel,
            Platform::Linux64,
            client,
            dir.path().join("cache"),
        );

        let result = subdir_data.load(FetchRepoDataOptions::default()).await;
        assert_matches::assert_matches!(result, Err(LoadRepoDataError::Corrupted(_, _)));
    }
}
