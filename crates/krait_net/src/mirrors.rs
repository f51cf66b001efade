//! Middleware that rewrites request urls onto a configured set of mirrors.
//!
//! Every mirror keeps a running failure and success count. Selection prefers
//! mirrors that have not failed yet; a mirror with no successes and at least
//! `max_failures` failures is considered bad and is only used again when no
//! healthy mirror remains. Because transient-error retries re-enter this
//! middleware, every retry pass naturally re-selects the currently best
//! mirror.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use url::Url;

/// A single mirror for a channel base url.
#[derive(Debug)]
pub struct Mirror {
    url: Url,
    failures: AtomicUsize,
    successes: AtomicUsize,
    max_failures: usize,
}

impl Mirror {
    /// Creates a mirror with the default failure budget.
    pub fn new(url: Url) -> Self {
        Self::with_max_failures(url, 3)
    }

    /// Creates a mirror that is considered bad after `max_failures` failures
    /// without a single success.
    pub fn with_max_failures(url: Url, max_failures: usize) -> Self {
        let url = if url.path().ends_with('/') {
            url
        } else {
            let mut url = url;
            url.set_path(&format!("{}/", url.path()));
            url
        };
        Self {
            url,
            failures: AtomicUsize::new(0),
            successes: AtomicUsize::new(0),
            max_failures,
        }
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn failure_count(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// A mirror is bad when it has never succeeded and exhausted its failure
    /// budget.
    fn is_bad(&self) -> bool {
        self.successes.load(Ordering::Relaxed) == 0
            && self.failure_count() >= self.max_failures
    }
}

/// Middleware that maps url prefixes onto mirror sets.
pub struct MirrorMiddleware {
    mirror_map: HashMap<String, Vec<Mirror>>,
}

impl MirrorMiddleware {
    /// Creates the middleware from a map of `url prefix -> mirror urls`.
    pub fn from_map(map: HashMap<String, Vec<Url>>) -> Self {
        let mirror_map = map
            .into_iter()
            .map(|(key, urls)| {
                let key = key.trim_end_matches('/').to_owned();
                (key, urls.into_iter().map(Mirror::new).collect())
            })
            .collect();
        Self { mirror_map }
    }

    fn select(mirrors: &[Mirror]) -> &Mirror {
        // Healthy mirrors first, fewest failures wins; fall back to the least
        // broken one if everything is bad.
        mirrors
            .iter()
            .filter(|m| !m.is_bad())
            .min_by_key(|m| m.failure_count())
            .unwrap_or_else(|| {
                mirrors
                    .iter()
                    .min_by_key(|m| m.failure_count())
                    .expect("mirror sets are never empty")
            })
    }
}

#[async_trait::async_trait]
impl Middleware for MirrorMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let url_str = req.url().to_string();

        for (key, mirrors) in &self.mirror_map {
            let Some(rest) = url_str.strip_prefix(key) else {
                continue;
            };
            let rest = rest.trim_start_matches('/');

            let mirror = Self::select(mirrors);
            let selected = mirror
                .url
                .join(rest)
                .map_err(|e| reqwest_middleware::Error::middleware(e))?;
            tracing::debug!("mirroring {} to {}", url_str, selected);
            *req.url_mut() = selected;

            let result = next.run(req, extensions).await;
            match result.as_ref() {
                Ok(response) if response.status().is_server_error() => mirror.record_failure(),
                Ok(_) => mirror.record_success(),
                Err(_) => mirror.record_failure(),
            }
            return result;
        }

        next.run(req, extensions).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mirror(url: &str) -> Mirror {
        Mirror::new(Url::parse(url).unwrap())
    }

    #[test]
    fn test_select_prefers_fewest_failures() {
        let mirrors = vec![mirror("https://a.example.com"), mirror("https://b.example.com")];
        mirrors[0].record_failure();
        let selected = MirrorMiddleware::select(&mirrors);
        assert_eq!(selected.url.host_str(), Some("b.example.com"));
    }

    #[test]
    fn test_bad_mirror_is_skipped() {
        let mirrors = vec![mirror("https://a.example.com"), mirror("https://b.example.com")];
        for _ in 0..3 {
            mirrors[0].record_failure();
        }
        assert!(mirrors[0].is_bad());
        // Even when b has more failures than a, a is bad and is skipped.
        for _ in 0..5 {
            mirrors[1].record_failure();
            mirrors[1].record_success();
        }
        let selected = MirrorMiddleware::select(&mirrors);
        assert_eq!(selected.url.host_str(), Some("b.example.com"));
    }

    #[test]
    fn test_all_bad_falls_back_to_least_broken() {
        let mirrors = vec![mirror("https://a.example.com"), mirror("https://b.example.com")];
        for _ in 0..3 {
            mirrors[0].record_failure();
        }
        for _ in 0..4 {
            mirrors[1].record_failure();
        }
        let selected = MirrorMiddleware::select(&mirrors);
        assert_eq!(selected.url.host_str(), Some("a.example.com"));
    }

    #[test]
    fn test_success_resets_badness() {
        let m = mirror("https://a.example.com");
        for _ in 0..3 {
            m.record_failure();
        }
        assert!(m.is_bad());
        m.record_success();
        assert!(!m.is_bad());
    }
}
