//! `clean`: purging the caches.

use std::collections::HashSet;

use crate::ops::{OpContext, OpError};

/// What to purge.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanOptions {
    /// Remove the index caches.
    pub index_cache: bool,

    /// Remove extracted package directories that are not referenced by the
    /// given prefixes.
    pub packages: bool,

    /// Remove downloaded package archives.
    pub tarballs: bool,

    /// Remove stale lock files.
    pub locks: bool,
}

impl CleanOptions {
    /// Everything at once (`clean --all`).
    pub fn all() -> Self {
        Self {
            index_cache: true,
            packages: true,
            tarballs: true,
            locks: true,
        }
    }
}

/// What a clean pass removed.
#[derive(Debug, Default)]
pub struct CleanReport {
    /// The number of removed index cache files.
    pub index_cache_files: u64,

    /// The number of removed extracted package directories.
    pub package_dirs: u64,

    /// The number of removed archives.
    pub tarballs: u64,

    /// The number of removed lock files.
    pub locks: u64,
}

/// Purges the selected caches. `in_use` lists the extracted directory names
/// (`<name>-<version>-<build>`) that installed prefixes still link from;
/// those are never removed.
pub fn clean(
    ctx: &OpContext,
    options: &CleanOptions,
    in_use: &HashSet<String>,
) -> Result<CleanReport, OpError> {
    let mut report = CleanReport::default();

    if options.index_cache {
        match fs_err::read_dir(&ctx.index_cache_dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if path.is_file() {
                        fs_err::remove_file(&path)?;
                        report.index_cache_files += 1;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    if options.tarballs {
        report.tarballs = ctx.package_cache.clean_tarballs()?;
    }
    if options.packages {
        report.package_dirs = ctx.package_cache.clean_unused_packages(in_use)?;
    }
    if options.locks {
        report.locks = ctx.package_cache.clean_locks()?;
    }

    Ok(report)
}
