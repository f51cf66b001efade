//! Downloading of `repodata.json` with HTTP caching.

use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::TryStreamExt;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use thiserror::Error;
use tokio_util::io::StreamReader;
use tracing::instrument;
use url::Url;

use crate::{
    cache::{mtime_ns, CacheHeaders, Expiring, RepoDataState},
    url_to_cache_key,
};

/// How long a remembered "does the server have a `.zst`?" answer stays valid.
fn variant_probe_expiration() -> chrono::Duration {
    chrono::Duration::days(14)
}

/// How the on-disk cache participates in a fetch.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum CacheAction {
    /// Use the cache when fresh, revalidate when stale, fetch when absent.
    #[default]
    CacheOrFetch,

    /// Never touch the network; fail if the cache is absent.
    UseCacheOnly,

    /// Skip the freshness check and always revalidate against the server.
    ForceFetch,
}

/// The index cache TTL configured by the user. The numeric configuration
/// value overloads `0` and `1`; the variants make that explicit.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum LocalTtl {
    /// Use the `max-age` the server sent (config value `1`).
    #[default]
    RespectHeader,

    /// Treat the cache as always stale (config value `0`).
    AlwaysUpdate,

    /// Override the server with a fixed number of seconds.
    Seconds(u64),
}

impl LocalTtl {
    /// Interprets the overloaded numeric config value.
    pub fn from_config_value(value: u64) -> Self {
        match value {
            0 => LocalTtl::AlwaysUpdate,
            1 => LocalTtl::RespectHeader,
            seconds => LocalTtl::Seconds(seconds),
        }
    }
}

/// Options for [`fetch_repo_data`].
#[derive(Debug, Clone, Default)]
pub struct FetchRepoDataOptions {
    /// How the cache participates in the fetch.
    pub cache_action: CacheAction,

    /// The freshness policy.
    pub local_ttl: LocalTtl,
}

/// How the returned repodata relates to the cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheResult {
    /// The cache was fresh and the network was not consulted.
    CacheHit,

    /// The server confirmed the cache is still valid (`304`).
    CacheHitAfterFetch,

    /// The cache existed but was replaced by newer data.
    CacheOutdated,

    /// There was no cache; the data was fetched for the first time.
    CacheNotPresent,
}

/// The successful result of [`fetch_repo_data`].
#[derive(Debug)]
pub struct CachedRepoData {
    /// The path of the cached `repodata.json`.
    pub path: PathBuf,

    /// The sidecar state of the cache.
    pub state: RepoDataState,

    /// How the cache participated.
    pub cache_result: CacheResult,
}

/// Errors that can occur while fetching repodata.
#[derive(Debug, Error)]
pub enum FetchRepoDataError {
    /// The subdir does not exist on the server.
    #[error("the channel subdirectory at {0} does not exist")]
    NotFound(Url),

    /// The server replied with an unexpected status.
    #[error("unexpected status {1} while fetching {0}")]
    HttpStatus(Url, StatusCode),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] reqwest_middleware::Error),

    /// Reading or writing the cache failed.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The cache is required (offline) but absent.
    #[error("repodata for {0} is not available in the cache")]
    NoCacheAvailable(Url),

    /// The cache directory lock could not be acquired.
    #[error("failed to lock the repodata cache")]
    LockError(#[source] std::io::Error),
}

/// The compressed repodata variants, in order of preference.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Variant {
    Zst,
    Bz2,
    Identity,
}

impl Variant {
    fn file_name(self) -> &'static str {
        match self {
            Variant::Zst => "repodata.json.zst",
            Variant::Bz2 => "repodata.json.bz2",
            Variant::Identity => "repodata.json",
        }
    }
}

/// Ensures a subdir url ends with a `/` so that joins treat it as a
/// directory.
pub(crate) fn normalize_subdir_url(url: Url) -> Url {
    if url.path().ends_with('/') {
        url
    } else {
        let mut url = url;
        let path = format!("{}/", url.path());
        url.set_path(&path);
        url
    }
}

/// Returns whether the cached state is still fresh under the given TTL
/// policy.
fn cache_is_fresh(state: &RepoDataState, ttl: LocalTtl) -> bool {
    let age = Utc::now().signed_duration_since(state.fetched_at);
    let max_age = match ttl {
        LocalTtl::AlwaysUpdate => return false,
        LocalTtl::Seconds(seconds) => seconds,
        LocalTtl::RespectHeader => match state.cache_headers.max_age() {
            Some(seconds) => seconds,
            None => return false,
        },
    };
    age < chrono::Duration::seconds(max_age as i64)
}

/// Fetches the `repodata.json` for one channel subdirectory into the cache
/// directory, honoring the freshness policy described in the module docs.
#[instrument(err, skip(client, options), fields(cache_path = %cache_path.display()))]
pub async fn fetch_repo_data(
    subdir_url: Url,
    client: ClientWithMiddleware,
    cache_path: PathBuf,
    options: FetchRepoDataOptions,
) -> Result<CachedRepoData, FetchRepoDataError> {
    let subdir_url = normalize_subdir_url(subdir_url);

    // Local channels are served straight from the filesystem.
    if subdir_url.scheme() == "file" {
        return fetch_local_repo_data(&subdir_url);
    }

    let cache_key = url_to_cache_key(&subdir_url);
    let payload_path = cache_path.join(format!("{cache_key}.json"));
    let state_path = cache_path.join(format!("{cache_key}.info.json"));

    // Load the previous state, discarding it if it no longer matches the
    // payload on disk.
    let mut old_state = RepoDataState::from_path(&state_path).ok();
    if let Some(state) = &old_state {
        if !state.matches_payload(&payload_path) {
            tracing::warn!(
                "repodata state at {} does not match its payload, ignoring cache",
                state_path.display()
            );
            old_state = None;
        }
    }

    match options.cache_action {
        CacheAction::UseCacheOnly => {
            return match old_state {
                Some(state) => Ok(CachedRepoData {
                    path: payload_path,
                    state,
                    cache_result: CacheResult::CacheHit,
                }),
                None => Err(FetchRepoDataError::NoCacheAvailable(subdir_url)),
            };
        }
        CacheAction::CacheOrFetch => {
            if let Some(state) = &old_state {
                if cache_is_fresh(state, options.local_ttl) {
                    tracing::debug!("repodata cache for {} is fresh", subdir_url);
                    return Ok(CachedRepoData {
                        path: payload_path,
                        state: state.clone(),
                        cache_result: CacheResult::CacheHit,
                    });
                }
            }
        }
        CacheAction::ForceFetch => {}
    }

    fs_err::create_dir_all(&cache_path)?;

    // Writers of an individual index hold an exclusive lock on its cache
    // slot so concurrent operations do not interleave partial writes.
    let lock_path = cache_path.join(format!("{cache_key}.lock"));
    let _lock = acquire_lock(&lock_path).await?;

    // Determine which variant to download, remembering probe results.
    let (variant, has_zst, has_bz2) =
        select_variant(&client, &subdir_url, old_state.as_ref()).await;

    let request_url = subdir_url
        .join(variant.file_name())
        .expect("variant file name is a valid url fragment");

    let mut request = client.get(request_url.clone());
    if old_state.is_some() {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(state) = &old_state {
            state.cache_headers.add_to_request(&mut headers);
        }
        request = request.headers(headers);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            // A dead server is tolerated as long as a cache exists.
            return serve_stale_or_fail(old_state, payload_path, subdir_url, error.into());
        }
    };

    match response.status() {
        StatusCode::NOT_MODIFIED => {
            let mut state = old_state.expect("conditional headers are only sent with a cache");
            state.fetched_at = Utc::now();
            state.has_zst = has_zst;
            state.has_bz2 = has_bz2;
            state.to_path(&state_path)?;
            Ok(CachedRepoData {
                path: payload_path,
                state,
                cache_result: CacheResult::CacheHitAfterFetch,
            })
        }
        status if status.is_success() => {
            let cache_headers = CacheHeaders::from_response(&response);
            write_payload(&cache_path, &payload_path, variant, response).await?;

            let metadata = std::fs::metadata(&payload_path)?;
            let state = RepoDataState {
                url: request_url,
                cache_headers,
                cache_last_modified_ns: mtime_ns(&metadata).unwrap_or_default(),
                cache_size: metadata.len(),
                fetched_at: Utc::now(),
                has_zst,
                has_bz2,
            };
            state.to_path(&state_path)?;

            let cache_result = if old_state.is_some() {
                CacheResult::CacheOutdated
            } else {
                CacheResult::CacheNotPresent
            };
            Ok(CachedRepoData {
                path: payload_path,
                state,
                cache_result,
            })
        }
        StatusCode::NOT_FOUND => Err(FetchRepoDataError::NotFound(subdir_url)),
        status => serve_stale_or_fail(
            old_state,
            payload_path,
            subdir_url.clone(),
            FetchRepoDataError::HttpStatus(subdir_url, status),
        ),
    }
}

/// When a fetch fails but a cache exists, the cache is served with a warning
/// rather than failing the whole operation.
fn serve_stale_or_fail(
    old_state: Option<RepoDataState>,
    payload_path: PathBuf,
    subdir_url: Url,
    error: FetchRepoDataError,
) -> Result<CachedRepoData, FetchRepoDataError> {
    match old_state {
        Some(state) => {
            tracing::warn!(
                "failed to refresh repodata for {} ({}), serving the cached copy",
                subdir_url,
                error
            );
            Ok(CachedRepoData {
                path: payload_path,
                state,
                cache_result: CacheResult::CacheHit,
            })
        }
        None => Err(error),
    }
}

/// Serves repodata for a `file://` channel directly from disk.
fn fetch_local_repo_data(subdir_url: &Url) -> Result<CachedRepoData, FetchRepoDataError> {
    let dir = subdir_url
        .to_file_path()
        .map_err(|()| FetchRepoDataError::NotFound(subdir_url.clone()))?;
    let payload = dir.join("repodata.json");
    let metadata =
        std::fs::metadata(&payload).map_err(|_| FetchRepoDataError::NotFound(subdir_url.clone()))?;
    let state = RepoDataState {
        url: subdir_url
            .join("repodata.json")
            .expect("repodata.json is a valid url fragment"),
        cache_headers: CacheHeaders::default(),
        cache_last_modified_ns: mtime_ns(&metadata).unwrap_or_default(),
        cache_size: metadata.len(),
        fetched_at: Utc::now(),
        has_zst: None,
        has_bz2: None,
    };
    Ok(CachedRepoData {
        path: payload,
        state,
        cache_result: CacheResult::CacheHit,
    })
}

/// Acquires the cache slot lock without blocking the async runtime.
async fn acquire_lock(path: &Path) -> Result<fslock::LockFile, FetchRepoDataError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut lock = fslock::LockFile::open(&path)?;
        lock.lock()?;
        Ok(lock)
    })
    .await
    .map_err(|e| FetchRepoDataError::LockError(std::io::Error::other(e)))?
    .map_err(FetchRepoDataError::LockError)
}

/// Decides which repodata variant to download: `.zst` is preferred, then
/// `.bz2`, then the plain file. Probe results expire after a while.
async fn select_variant(
    client: &ClientWithMiddleware,
    subdir_url: &Url,
    old_state: Option<&RepoDataState>,
) -> (Variant, Option<Expiring<bool>>, Option<Expiring<bool>>) {
    let remembered = |probe: Option<&Expiring<bool>>| {
        probe.and_then(|e| e.value(variant_probe_expiration()).copied())
    };

    let mut has_zst = old_state.and_then(|s| s.has_zst.clone());
    let mut has_bz2 = old_state.and_then(|s| s.has_bz2.clone());

    let zst = match remembered(has_zst.as_ref()) {
        Some(value) => value,
        None => {
            let value = probe_variant(client, subdir_url, Variant::Zst).await;
            has_zst = Some(Expiring::now(value));
            value
        }
    };
    if zst {
        return (Variant::Zst, has_zst, has_bz2);
    }

    let bz2 = match remembered(has_bz2.as_ref()) {
        Some(value) => value,
        None => {
            let value = probe_variant(client, subdir_url, Variant::Bz2).await;
            has_bz2 = Some(Expiring::now(value));
            value
        }
    };
    if bz2 {
        return (Variant::Bz2, has_zst, has_bz2);
    }

    (Variant::Identity, has_zst, has_bz2)
}

/// Issues a HEAD request to check whether a variant exists.
async fn probe_variant(client: &ClientWithMiddleware, subdir_url: &Url, variant: Variant) -> bool {
    let url = subdir_url
        .join(variant.file_name())
        .expect("variant file name is a valid url fragment");
    match client.head(url.clone()).send().await {
        Ok(response) => response.status().is_success(),
        Err(error) => {
            tracing::debug!("HEAD probe for {} failed: {}", url, error);
            false
        }
    }
}

/// Streams the response body into the cache, decompressing on the fly, and
/// atomically replaces the payload file.
async fn write_payload(
    cache_dir: &Path,
    payload_path: &Path,
    variant: Variant,
    response: reqwest::Response,
) -> Result<(), std::io::Error> {
    let temp = tempfile::NamedTempFile::new_in(cache_dir)?;
    let temp_path = temp.path().to_path_buf();

    let stream = response
        .bytes_stream()
        .map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);

    let mut file = tokio::fs::File::create(&temp_path).await?;
    match variant {
        Variant::Zst => {
            let mut decoder =
                async_compression::tokio::bufread::ZstdDecoder::new(tokio::io::BufReader::new(
                    reader,
                ));
            tokio::io::copy(&mut decoder, &mut file).await?;
        }
        Variant::Bz2 => {
            let mut decoder =
                async_compression::tokio::bufread::BzDecoder::new(tokio::io::BufReader::new(
                    reader,
                ));
            tokio::io::copy(&mut decoder, &mut file).await?;
        }
        Variant::Identity => {
            let mut reader = tokio::io::BufReader::new(reader);
            tokio::io::copy(&mut reader, &mut file).await?;
        }
    }
    file.sync_all().await?;
    drop(file);

    temp.persist(payload_path).map_err(|e| e.error)?;
    Ok(())
}
