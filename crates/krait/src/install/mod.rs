//! Applying a transaction to a prefix: fetch, extract, unlink, link.

mod installer;
mod link;
mod python;
mod transaction;
mod unlink;

pub use installer::{Installer, InstallerError, InstallerResult, RequestDescription};
pub use link::{link_file, LinkFileError, LinkMethod, LinkOptions, LinkedFile};
pub use python::{PythonInfo, PythonInfoError};
pub use transaction::{Transaction, TransactionError, TransactionOperation};
pub use unlink::{recursively_remove_empty_directories, unlink_package, UnlinkError};
