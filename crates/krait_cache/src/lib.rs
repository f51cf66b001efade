#![deny(missing_docs)]

//! The shared package cache.
//!
//! Artifacts are stored under a single `pkgs/` directory: the original
//! compressed archive next to one extracted directory per package, named
//! `<name>-<version>-<build>`. The cache is shared between prefixes and
//! between concurrent operations; all mutations happen under a lock file at
//! the cache root, while readers only revalidate the extracted contents
//! against the record they expect.

mod package_cache;
pub mod validation;

pub use package_cache::{CacheKey, PackageCache, PackageCacheError};
