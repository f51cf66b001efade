//! The on-disk state that accompanies a cached `repodata.json`.

use std::{path::Path, str::FromStr, time::SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// The HTTP response headers that drive revalidation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheHeaders {
    /// The `ETag` of the cached response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// The `Last-Modified` date of the cached response.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mod")]
    pub last_modified: Option<String>,

    /// The `Cache-Control` value of the cached response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
}

impl CacheHeaders {
    /// Extracts the relevant headers from a response.
    pub fn from_response(response: &reqwest::Response) -> Self {
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned)
        };
        Self {
            etag: header(reqwest::header::ETAG),
            last_modified: header(reqwest::header::LAST_MODIFIED),
            cache_control: header(reqwest::header::CACHE_CONTROL),
        }
    }

    /// Adds conditional headers to a request so the server can reply `304`.
    pub fn add_to_request(&self, headers: &mut reqwest::header::HeaderMap) {
        if let Some(etag) = self
            .etag
            .as_deref()
            .and_then(|etag| reqwest::header::HeaderValue::from_str(etag).ok())
        {
            headers.insert(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = self
            .last_modified
            .as_deref()
            .and_then(|value| reqwest::header::HeaderValue::from_str(value).ok())
        {
            headers.insert(reqwest::header::IF_MODIFIED_SINCE, last_modified);
        }
    }

    /// The `max-age` the server asked for, if any.
    pub fn max_age(&self) -> Option<u64> {
        let value = self.cache_control.as_deref()?;
        cache_control::CacheControl::from_value(value)?
            .max_age
            .map(|age| age.as_secs())
    }
}

/// A boolean (or other value) that is only trusted for a limited time, used
/// to remember whether a subdir offers compressed repodata variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expiring<T> {
    /// The remembered value.
    pub value: T,

    /// When the value was established.
    pub last_checked: DateTime<Utc>,
}

impl<T> Expiring<T> {
    /// Wraps a freshly determined value.
    pub fn now(value: T) -> Self {
        Self {
            value,
            last_checked: Utc::now(),
        }
    }

    /// Returns the value unless it has expired.
    pub fn value(&self, expiration: chrono::Duration) -> Option<&T> {
        if Utc::now().signed_duration_since(self.last_checked) >= expiration {
            None
        } else {
            Some(&self.value)
        }
    }
}

/// The `.info.json` sidecar of a cached `repodata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoDataState {
    /// The url the payload was downloaded from, including the
    /// `repodata.json[.zst|.bz2]` file name.
    pub url: Url,

    /// The cache-relevant response headers.
    #[serde(flatten)]
    pub cache_headers: CacheHeaders,

    /// The modification time of the cached payload when it was written.
    #[serde(rename = "mtime_ns")]
    pub cache_last_modified_ns: u128,

    /// The size of the cached payload in bytes.
    #[serde(rename = "size")]
    pub cache_size: u64,

    /// When the last (conditional or full) fetch was performed. A `304`
    /// response refreshes this without touching the payload.
    pub fetched_at: DateTime<Utc>,

    /// Whether the subdir offers a `.zst` variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_zst: Option<Expiring<bool>>,

    /// Whether the subdir offers a `.bz2` variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_bz2: Option<Expiring<bool>>,
}

impl RepoDataState {
    /// Reads and parses a state file from disk.
    pub fn from_path(path: &Path) -> Result<Self, std::io::Error> {
        let content = fs_err::read_to_string(path)?;
        Self::from_str(&content).map_err(std::io::Error::other)
    }

    /// Writes the state file to disk.
    pub fn to_path(&self, path: &Path) -> Result<(), std::io::Error> {
        let file = fs_err::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(std::io::Error::other)
    }

    /// Returns whether the payload file still matches this state: same size
    /// and same modification time as when the state was written.
    pub fn matches_payload(&self, payload: &Path) -> bool {
        let Ok(metadata) = std::fs::metadata(payload) else {
            return false;
        };
        if metadata.len() != self.cache_size {
            return false;
        }
        mtime_ns(&metadata).map_or(false, |mtime| mtime == self.cache_last_modified_ns)
    }
}

/// The modification time of a file in nanoseconds since the epoch.
pub(crate) fn mtime_ns(metadata: &std::fs::Metadata) -> Option<u128> {
    metadata
        .modified()
        .ok()?
        .duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_nanos())
}

impl FromStr for RepoDataState {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const STATE: &str = r#"{
        "url": "https://repo.example.com/test/linux-64/repodata.json.zst",
        "etag": "\"bec332621e00fc4ad87ba185171bcf46\"",
        "mod": "Mon, 13 Feb 2023 13:49:56 GMT",
        "cache_control": "public, max-age=1200",
        "mtime_ns": 1676297333020928000,
        "size": 156627374,
        "fetched_at": "2023-02-13T14:08:50Z",
        "has_zst": {
            "value": true,
            "last_checked": "2023-02-13T14:08:50Z"
        }
    }"#;

    #[test]
    fn test_parse_state() {
        let state = RepoDataState::from_str(STATE).unwrap();
        assert_eq!(state.cache_size, 156627374);
        assert_eq!(state.cache_headers.max_age(), Some(1200));
        assert_eq!(
            state.cache_headers.etag.as_deref(),
            Some("\"bec332621e00fc4ad87ba185171bcf46\"")
        );
        assert!(state.has_zst.as_ref().unwrap().value);
    }

    #[test]
    fn test_round_trip() {
        let state = RepoDataState::from_str(STATE).unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let back = RepoDataState::from_str(&json).unwrap();
        assert_eq!(back.cache_size, state.cache_size);
        assert_eq!(back.cache_headers.etag, state.cache_headers.etag);
        assert_eq!(back.fetched_at, state.fetched_at);
    }

    #[test]
    fn test_expiring() {
        let expiring = Expiring::now(true);
        assert_eq!(expiring.value(chrono::Duration::hours(1)), Some(&true));
        assert_eq!(expiring.value(chrono::Duration::zero()), None);
    }
}
