#![deny(missing_docs)]

//! The krait engine: the pipeline behind the command line tool.
//!
//! An operation (`install`, `create`, `update`, `remove`) flows through the
//! same stages: resolve the configured channels, load their indexes, solve
//! the user's specs against the installed records and the host's virtual
//! packages, and apply the resulting transaction to the prefix — fetch and
//! extract into the shared package cache, unlink what goes away, link what
//! comes in, and record everything in the prefix journal.

pub mod config;
pub mod execution;
pub mod install;
pub mod ops;
pub mod prefix;

pub use config::{Config, ConfigError, SafetyChecks};
pub use prefix::{Prefix, PrefixData, PrefixError};
