//! The [`PackageCache`] itself.

use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use krait_archive::{download::download_and_extract, is_transient_error, ExtractError};
use krait_net::retry::{RetryDecision, RetryPolicy};
use krait_types::{package::ArchiveIdentifier, RepoDataRecord};
use reqwest_middleware::ClientWithMiddleware;
use url::Url;

use crate::validation::{validate_package_directory, write_stored_record, ValidationError};

/// Identifies one entry in the cache: `<name>-<version>-<build>`.
#[derive(Debug, Hash, Clone, Eq, PartialEq)]
pub struct CacheKey {
    name: String,
    version: String,
    build_string: String,
}

impl From<&RepoDataRecord> for CacheKey {
    fn from(record: &RepoDataRecord) -> Self {
        let package = &record.package_record;
        Self {
            name: package.name.as_normalized().to_owned(),
            version: package.version.to_string(),
            build_string: package.build.clone(),
        }
    }
}

impl From<ArchiveIdentifier> for CacheKey {
    fn from(identifier: ArchiveIdentifier) -> Self {
        Self {
            name: identifier.name,
            version: identifier.version,
            build_string: identifier.build_string,
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.name, self.version, self.build_string)
    }
}

/// An error that might be returned by the cache.
#[derive(Debug, thiserror::Error)]
pub enum PackageCacheError {
    /// Downloading or extracting the artifact failed, after exhausting the
    /// retry budget for transient failures.
    #[error(transparent)]
    Fetch(#[from] ExtractError),

    /// The freshly fetched artifact still fails validation.
    #[error("the fetched package failed validation")]
    Validation(#[source] ValidationError),

    /// The cache lock could not be acquired.
    #[error("failed to lock the package cache")]
    LockError(#[source] std::io::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// A cache of extracted packages, shared across prefixes.
///
/// Mutation of an entry is serialized twice: per-process through an entry
/// mutex (so concurrent tasks coalesce onto one download) and cross-process
/// through a lock file at the cache root.
#[derive(Clone)]
pub struct PackageCache {
    inner: Arc<PackageCacheInner>,
}

struct PackageCacheInner {
    path: PathBuf,
    entries: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
}

impl PackageCache {
    /// Constructs a new cache rooted at the given directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(PackageCacheInner {
                path: path.into(),
                entries: DashMap::new(),
            }),
        }
    }

    /// The root directory of the cache.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The directory an extracted record lives in.
    pub fn package_dir(&self, key: &CacheKey) -> PathBuf {
        self.inner.path.join(key.to_string())
    }

    /// Ensures the given record is present and valid in the cache, returning
    /// the extracted directory.
    ///
    /// A valid extracted directory is returned without taking the cache lock.
    /// Otherwise the archive is downloaded (with retries for transient
    /// failures), verified against the record's checksums, extracted and
    /// revalidated.
    pub async fn ensure(
        &self,
        record: &RepoDataRecord,
        client: ClientWithMiddleware,
        retry_policy: impl RetryPolicy,
        extra_safety_checks: bool,
    ) -> Result<PathBuf, PackageCacheError> {
        let key = CacheKey::from(record);
        let path = self.package_dir(&key);

        // Serialize tasks interested in the same entry.
        let entry = self
            .inner
            .entries
            .entry(key.clone())
            .or_default()
            .clone();
        let _guard = entry.lock().await;

        // Fast path: the directory is already valid.
        if path.is_dir() {
            match validate_package_directory(&path, record, extra_safety_checks) {
                Ok(()) => return Ok(path),
                Err(e) => {
                    tracing::warn!(
                        "cached package {} is invalid ({}), refetching",
                        key,
                        e
                    );
                }
            }
        }

        // Mutating the cache requires the cross-process lock.
        let _lock = self.acquire_write_lock().await?;

        self.fetch_with_retry(record, &path, client, retry_policy)
            .await?;
        write_stored_record(&path, record)?;
        validate_package_directory(&path, record, extra_safety_checks)
            .map_err(PackageCacheError::Validation)?;

        Ok(path)
    }

    async fn fetch_with_retry(
        &self,
        record: &RepoDataRecord,
        path: &Path,
        client: ClientWithMiddleware,
        retry_policy: impl RetryPolicy,
    ) -> Result<(), PackageCacheError> {
        let request_start = SystemTime::now();
        let mut current_try = 0;
        loop {
            current_try += 1;
            tracing::debug!("downloading {} to {}", record.url, path.display());

            let result = download_and_extract(
                client.clone(),
                record.url.clone(),
                path,
                record.package_record.sha256,
                record.package_record.md5,
            )
            .await;

            let Err(error) = result else {
                return Ok(());
            };

            if !is_transient_error(&error) {
                return Err(error.into());
            }

            let execute_after = match retry_policy.should_retry(request_start, current_try) {
                RetryDecision::Retry { execute_after } => execute_after,
                RetryDecision::DoNotRetry => return Err(error.into()),
            };
            let mut duration = execute_after
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            // The server's Retry-After wish wins over the computed backoff.
            if let ExtractError::HttpStatus {
                retry_after: Some(retry_after),
                ..
            } = &error
            {
                duration = duration.max(*retry_after);
            }
            tracing::warn!(
                "failed to download {}: {}. Retry #{} in {:?}",
                record.url,
                error,
                current_try,
                duration
            );
            tokio::time::sleep(duration).await;
        }
    }

    /// Acquires the lock file at the cache root without blocking the runtime.
    async fn acquire_write_lock(&self) -> Result<fslock::LockFile, PackageCacheError> {
        fs_err::create_dir_all(&self.inner.path)?;
        let lock_path = self.inner.path.join(".lock");
        tokio::task::spawn_blocking(move || {
            let mut lock = fslock::LockFile::open(&lock_path)?;
            lock.lock()?;
            Ok(lock)
        })
        .await
        .map_err(|e| PackageCacheError::LockError(std::io::Error::other(e)))?
        .map_err(PackageCacheError::LockError)
    }

    /// Removes all downloaded archive files, keeping extracted directories.
    pub fn clean_tarballs(&self) -> Result<u64, std::io::Error> {
        let mut removed = 0;
        for entry in read_dir_or_empty(&self.inner.path)? {
            let path = entry.path();
            if path.is_file() && ArchiveIdentifier::try_from_path(&path).is_some() {
                fs_err::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes extracted package directories that are not in the given in-use
    /// set (of directory names).
    pub fn clean_unused_packages(
        &self,
        in_use: &std::collections::HashSet<String>,
    ) -> Result<u64, std::io::Error> {
        let mut removed = 0;
        for entry in read_dir_or_empty(&self.inner.path)? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() && !name.starts_with('.') && !in_use.contains(name) {
                fs_err::remove_dir_all(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes stale lock files.
    pub fn clean_locks(&self) -> Result<u64, std::io::Error> {
        let mut removed = 0;
        for entry in read_dir_or_empty(&self.inner.path)? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "lock")
                || path.file_name().map_or(false, |name| name == ".lock")
            {
                fs_err::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Reads a directory, treating a missing directory as empty.
fn read_dir_or_empty(path: &Path) -> Result<Vec<fs_err::DirEntry>, std::io::Error> {
    match fs_err::read_dir(path) {
        Ok(entries) => entries.collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
