#![deny(missing_docs)]

//! Networking support for krait.
//!
//! This crate provides the pieces that sit between the rest of the workspace
//! and `reqwest`: the in-memory credential store and the middleware that
//! applies it to outgoing requests, mirror selection, the retry policy for
//! transient failures, secret redaction for log output, and the assembly of a
//! fully configured HTTP client (TLS mode, proxies, timeouts).

mod auth;
mod client;
mod middleware;
mod mirrors;
mod redact;
pub mod retry;

pub use auth::{Authentication, AuthenticationStore};
pub use client::{build_client, ClientBuildError, ClientOptions, ProxyConfig, SslVerify};
pub use middleware::AuthenticationMiddleware;
pub use mirrors::{Mirror, MirrorMiddleware};
pub use redact::redact_url_secrets;
