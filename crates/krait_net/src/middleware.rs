//! `reqwest` middleware that authenticates outgoing requests from the
//! [`AuthenticationStore`].

use std::sync::Arc;

use base64::{prelude::BASE64_STANDARD, Engine};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use url::Url;

use crate::{Authentication, AuthenticationStore};

/// Applies the credential matching a request's url: conda tokens are rendered
/// into the path (`/t/<token>/…`), basic credentials into the userinfo, and
/// bearer tokens into the `Authorization` header.
#[derive(Clone)]
pub struct AuthenticationMiddleware {
    store: Arc<AuthenticationStore>,
}

impl AuthenticationMiddleware {
    /// Constructs a middleware around the given store.
    pub fn new(store: Arc<AuthenticationStore>) -> Self {
        Self { store }
    }

    /// Applies a credential to a url, returning the rewritten url.
    pub fn authenticate_url(url: Url, auth: &Authentication) -> Url {
        match auth {
            Authentication::CondaToken(token) => {
                // Avoid stacking tokens when the url already carries one.
                if url.path().starts_with("/t/") {
                    return url;
                }
                let mut url = url;
                let new_path = format!("/t/{token}{}", url.path());
                url.set_path(&new_path);
                url
            }
            Authentication::BasicHttp { username, password } => {
                let mut url = url;
                if url.set_username(username).is_err()
                    || url.set_password(Some(password)).is_err()
                {
                    tracing::warn!("could not set credentials on {}", url);
                }
                url
            }
            Authentication::BearerToken(_) => url,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for AuthenticationMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        // An explicit Authorization header always wins.
        if req.headers().get(reqwest::header::AUTHORIZATION).is_some() {
            return next.run(req, extensions).await;
        }

        let Some(auth) = self.store.lookup(req.url()) else {
            return next.run(req, extensions).await;
        };

        match auth {
            Authentication::BearerToken(token) => {
                let value = format!("Bearer {token}")
                    .parse()
                    .map_err(|e| reqwest_middleware::Error::middleware(BadToken(e)))?;
                req.headers_mut().insert(reqwest::header::AUTHORIZATION, value);
            }
            other => {
                let url = Self::authenticate_url(req.url().clone(), other);
                *req.url_mut() = url;
            }
        }

        next.run(req, extensions).await
    }
}

#[derive(Debug, thiserror::Error)]
#[error("bearer token is not a valid header value")]
struct BadToken(#[source] http::header::InvalidHeaderValue);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_conda_token_goes_into_the_path() {
        let url = Url::parse("https://example.com/channel/noarch/repodata.json").unwrap();
        let auth = Authentication::CondaToken("abc-def".to_owned());
        let authenticated = AuthenticationMiddleware::authenticate_url(url, &auth);
        assert_eq!(
            authenticated.as_str(),
            "https://example.com/t/abc-def/channel/noarch/repodata.json"
        );

        // Applying the token twice does not stack.
        let again = AuthenticationMiddleware::authenticate_url(authenticated.clone(), &auth);
        assert_eq!(again, authenticated);
    }

    #[test]
    fn test_basic_auth_goes_into_userinfo() {
        let url = Url::parse("https://example.com/channel").unwrap();
        let auth = Authentication::BasicHttp {
            username: "user".to_owned(),
            password: "secret".to_owned(),
        };
        let authenticated = AuthenticationMiddleware::authenticate_url(url, &auth);
        assert_eq!(authenticated.username(), "user");
        assert_eq!(authenticated.password(), Some("secret"));
    }

    #[test]
    fn test_bearer_token_leaves_url_untouched() {
        let url = Url::parse("https://example.com/channel").unwrap();
        let auth = Authentication::BearerToken("token".to_owned());
        let authenticated = AuthenticationMiddleware::authenticate_url(url.clone(), &auth);
        assert_eq!(authenticated, url);
    }
}
