#![deny(missing_docs)]

//! Fetching and caching of channel indexes.
//!
//! Every `(channel, platform)` pair maps to one `repodata.json` on a remote
//! server. This crate downloads those files into a local cache directory and
//! keeps them fresh using the server's HTTP cache headers: as long as the
//! recorded `max-age` has not expired the cache is served without touching
//! the network; after that a conditional request revalidates it. Compressed
//! variants (`repodata.json.zst`, `.bz2`) are preferred when the server
//! offers them and are decompressed while writing to the cache.

mod cache;
mod fetch;
mod subdir;

pub use cache::{CacheHeaders, Expiring, RepoDataState};
pub use fetch::{
    fetch_repo_data, CacheAction, CacheResult, CachedRepoData, FetchRepoDataError,
    FetchRepoDataOptions, LocalTtl,
};
pub use subdir::{LoadRepoDataError, SubdirData};

/// Returns the file name (without extension) under which the index of the
/// given subdir url is cached.
pub fn url_to_cache_key(url: &url::Url) -> String {
    let mut canonical = url.as_str().trim_end_matches('/').to_owned();
    // Strip the scheme so that http/https variants of a channel share a key.
    if let Some((_, rest)) = canonical.split_once("://") {
        canonical = rest.to_owned();
    }
    let digest = krait_digest::compute_bytes_digest::<krait_digest::Sha256>(&canonical);
    format!("{:x}", digest)[..16].to_owned()
}
