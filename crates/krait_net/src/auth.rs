//! The in-memory credential store.
//!
//! Credentials are keyed by `host[:port][/path]` and looked up by
//! longest-prefix match, so an entry for `example.com/private` shadows one
//! for `example.com` on urls below `/private`. The store is loaded once per
//! operation and treated as immutable afterwards.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

/// A credential for a host or host prefix.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Authentication {
    /// An anaconda.org style token, rendered into the url path as
    /// `/t/<token>/…`.
    CondaToken(String),

    /// A bearer token, sent as an `Authorization: Bearer …` header.
    BearerToken(String),

    /// Basic HTTP authentication, rendered into the url userinfo.
    BasicHttp {
        /// The username.
        username: String,
        /// The password.
        password: String,
    },
}

impl Authentication {
    /// At equal key specificity, bearer tokens win over conda tokens which
    /// win over basic auth.
    fn kind_rank(&self) -> u8 {
        match self {
            Authentication::BearerToken(_) => 2,
            Authentication::CondaToken(_) => 1,
            Authentication::BasicHttp { .. } => 0,
        }
    }
}

/// An immutable credential database keyed by `host[:port][/path]`.
#[derive(Debug, Clone, Default)]
pub struct AuthenticationStore {
    entries: Vec<(String, Authentication)>,
}

impl AuthenticationStore {
    /// Constructs an empty store.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Constructs a store from `key -> credential` pairs. Keys are
    /// `host[:port]` optionally followed by a path prefix.
    pub fn from_map(map: impl IntoIterator<Item = (String, Authentication)>) -> Self {
        let entries = map
            .into_iter()
            .map(|(key, auth)| (key.trim_matches('/').to_owned(), auth))
            .collect();
        Self { entries }
    }

    /// Loads a store from a json file of the form
    /// `{"example.com": {"CondaToken": "…"}, …}`.
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let content = fs_err::read_to_string(path)?;
        let map: HashMap<String, Authentication> =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;
        Ok(Self::from_map(map))
    }

    /// Returns true if the store holds no credentials at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the credential for a url by longest-prefix match on
    /// `host[:port]/path`. Ties on specificity are broken by credential kind.
    pub fn lookup(&self, url: &Url) -> Option<&Authentication> {
        let host = url.host_str()?;
        let target = match url.port() {
            Some(port) => format!("{host}:{port}{}", url.path()),
            None => format!("{host}{}", url.path()),
        };
        let target = target.trim_end_matches('/');

        let mut best: Option<(usize, &Authentication)> = None;
        for (key, auth) in &self.entries {
            if !key_matches(key, target) {
                continue;
            }
            let better = match &best {
                None => true,
                Some((len, current)) => {
                    key.len() > *len
                        || (key.len() == *len && auth.kind_rank() > current.kind_rank())
                }
            };
            if better {
                best = Some((key.len(), auth));
            }
        }
        best.map(|(_, auth)| auth)
    }
}

/// A key matches when it is a prefix of the target ending on a component
/// boundary.
fn key_matches(key: &str, target: &str) -> bool {
    match target.strip_prefix(key) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> AuthenticationStore {
        AuthenticationStore::from_map([
            (
                "example.com".to_owned(),
                Authentication::CondaToken("outer".to_owned()),
            ),
            (
                "example.com/private".to_owned(),
                Authentication::BearerToken("inner".to_owned()),
            ),
            (
                "other.com:8080".to_owned(),
                Authentication::BasicHttp {
                    username: "user".to_owned(),
                    password: "pass".to_owned(),
                },
            ),
        ])
    }

    #[test]
    fn test_longest_prefix_wins() {
        let store = store();
        let url = Url::parse("https://example.com/private/linux-64/repodata.json").unwrap();
        assert_eq!(
            store.lookup(&url),
            Some(&Authentication::BearerToken("inner".to_owned()))
        );

        let url = Url::parse("https://example.com/public/repodata.json").unwrap();
        assert_eq!(
            store.lookup(&url),
            Some(&Authentication::CondaToken("outer".to_owned()))
        );
    }

    #[test]
    fn test_component_boundaries() {
        let store = store();
        // `example.com/privateer` must not match the `/private` entry.
        let url = Url::parse("https://example.com/privateer/repodata.json").unwrap();
        assert_eq!(
            store.lookup(&url),
            Some(&Authentication::CondaToken("outer".to_owned()))
        );
    }

    #[test]
    fn test_port_is_part_of_the_key() {
        let store = store();
        let url = Url::parse("http://other.com:8080/x").unwrap();
        assert_matches::assert_matches!(
            store.lookup(&url),
            Some(Authentication::BasicHttp { .. })
        );
        // Without the port there is no match.
        let url = Url::parse("http://other.com/x").unwrap();
        assert_eq!(store.lookup(&url), None);
    }

    #[test]
    fn test_kind_breaks_specificity_ties() {
        let store = AuthenticationStore::from_map([
            (
                "example.com".to_owned(),
                Authentication::BasicHttp {
                    username: "u".to_owned(),
                    password: "p".to_owned(),
                },
            ),
            (
                "example.com".to_owned(),
                Authentication::CondaToken("token".to_owned()),
            ),
        ]);
        let url = Url::parse("https://example.com/x").unwrap();
        assert_eq!(
            store.lookup(&url),
            Some(&Authentication::CondaToken("token".to_owned()))
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        fs_err::write(
            &path,
            r#"{"example.com": {"CondaToken": "secret-token"}}"#,
        )
        .unwrap();
        let store = AuthenticationStore::from_file(&path).unwrap();
        let url = Url::parse("https://example.com/channel").unwrap();
        assert_eq!(
            store.lookup(&url),
            Some(&Authentication::CondaToken("secret-token".to_owned()))
        );
    }
}
