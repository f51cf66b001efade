//! Assembly of the configured HTTP client used by every download in krait.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use reqwest_middleware::ClientWithMiddleware;
use thiserror::Error;
use url::Url;

use crate::{AuthenticationMiddleware, AuthenticationStore, MirrorMiddleware};

/// How server certificates are verified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SslVerify {
    /// Use the system trust store.
    #[default]
    System,

    /// Disable certificate verification entirely.
    Insecure,

    /// Verify against an explicit CA bundle.
    CaBundle(PathBuf),
}

/// Proxy configuration, keyed by scheme (`http`, `https`) with `all` as the
/// fallback. An empty map means direct connections.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// The scheme to proxy url map.
    pub servers: HashMap<String, Url>,
}

/// Options for [`build_client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// TLS verification mode.
    pub ssl_verify: SslVerify,

    /// Proxy servers per scheme.
    pub proxies: ProxyConfig,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Abort a transfer when no data arrives for this long.
    pub read_timeout: Duration,

    /// Mirrors per channel base url.
    pub mirrors: HashMap<String, Vec<Url>>,

    /// The user agent to send.
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            ssl_verify: SslVerify::System,
            proxies: ProxyConfig::default(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            mirrors: HashMap::new(),
            user_agent: concat!("krait/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

/// Errors that can occur while constructing the client.
#[derive(Debug, Error)]
pub enum ClientBuildError {
    /// The CA bundle could not be read or parsed.
    #[error("failed to load CA bundle from '{0}'")]
    InvalidCaBundle(PathBuf, #[source] std::io::Error),

    /// A proxy url was rejected.
    #[error("invalid proxy '{0}'")]
    InvalidProxy(Url, #[source] reqwest::Error),

    /// The underlying client could not be constructed.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

/// Builds the middleware-wrapped HTTP client: TLS policy, proxies, timeouts,
/// mirror rewriting and authentication.
pub fn build_client(
    options: &ClientOptions,
    auth_store: Arc<AuthenticationStore>,
) -> Result<ClientWithMiddleware, ClientBuildError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(options.user_agent.clone())
        .connect_timeout(options.connect_timeout)
        .read_timeout(options.read_timeout)
        .pool_max_idle_per_host(20);

    match &options.ssl_verify {
        SslVerify::System => {}
        SslVerify::Insecure => {
            tracing::warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        SslVerify::CaBundle(path) => {
            let pem = fs_err::read(path)
                .map_err(|e| ClientBuildError::InvalidCaBundle(path.clone(), e))?;
            let certificate = reqwest::Certificate::from_pem(&pem)?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(certificate);
        }
    }

    // Scheme-specific proxies first, `all` as the fallback. No entries means
    // direct connections.
    for (scheme, url) in &options.proxies.servers {
        let proxy = match scheme.as_str() {
            "http" => reqwest::Proxy::http(url.clone()),
            "https" => reqwest::Proxy::https(url.clone()),
            "all" => reqwest::Proxy::all(url.clone()),
            other => {
                tracing::warn!("ignoring proxy for unknown scheme '{}'", other);
                continue;
            }
        }
        .map_err(|e| ClientBuildError::InvalidProxy(url.clone(), e))?;
        builder = builder.proxy(proxy);
    }

    let client = builder.build()?;

    let mut middleware = reqwest_middleware::ClientBuilder::new(client);
    if !options.mirrors.is_empty() {
        middleware = middleware.with(MirrorMiddleware::from_map(options.mirrors.clone()));
    }
    if !auth_store.is_empty() {
        middleware = middleware.with(AuthenticationMiddleware::new(auth_store));
    }
    Ok(middleware.build())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_build_default_client() {
        let client = build_client(
            &ClientOptions::default(),
            Arc::new(AuthenticationStore::empty()),
        );
        assert!(client.is_ok());
    }

    #[test]
    fn test_invalid_ca_bundle_is_an_error() {
        let options = ClientOptions {
            ssl_verify: SslVerify::CaBundle(PathBuf::from("/does/not/exist.pem")),
            ..ClientOptions::default()
        };
        let result = build_client(&options, Arc::new(AuthenticationStore::empty()));
        assert_matches::assert_matches!(result, Err(ClientBuildError::InvalidCaBundle(_, _)));
    }
}
