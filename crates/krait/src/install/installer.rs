//! Executing a [`Transaction`] against a prefix.
//!
//! The phases run in strict order under the prefix lock: every artifact is
//! fetched into the package cache first (no prefix mutation happens until
//! all of them are present), then removals are unlinked in reverse
//! dependency order, then installs are linked in dependency order. The
//! `conda-meta` record of a package is written only after all of its files
//! are in place, and one journal entry describing the whole transaction is
//! appended at the end. A failure during linking rolls the transaction's own
//! changes back as far as possible.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use futures::{stream, StreamExt, TryStreamExt};
use krait_cache::{PackageCache, PackageCacheError};
use krait_net::retry::ExponentialBackoff;
use krait_solve::sort_topologically;
use krait_types::{
    package::{PackageFile, PathType, PathsJson},
    HistoryEntry, HistoryError, Link, LinkType, MatchSpec, PrefixPathType, PrefixPaths,
    PrefixPathsEntry, PrefixRecord, RepoDataRecord,
};
use reqwest_middleware::ClientWithMiddleware;
use tokio_util::sync::CancellationToken;

use crate::{
    config::SafetyChecks,
    install::{
        link_file, unlink_package, LinkFileError, LinkMethod, LinkOptions, PythonInfo,
        Transaction, TransactionOperation, UnlinkError,
    },
    prefix::{Prefix, PrefixError},
};

/// An error produced while executing a transaction.
#[derive(Debug, thiserror::Error)]
pub enum InstallerError {
    /// The operation was interrupted by the user.
    #[error("the operation was cancelled")]
    Cancelled,

    /// Fetching an artifact failed; the prefix was not touched.
    #[error("failed to fetch {0}")]
    FetchFailed(String, #[source] PackageCacheError),

    /// One or more packages could not be unlinked; the link phase was not
    /// entered.
    #[error("failed to unlink {} package(s): {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    UnlinkFailed(Vec<UnlinkError>),

    /// Linking failed; the transaction was rolled back.
    #[error("failed to link {record}: {error} (rolled back: {rolled_back})")]
    LinkFailed {
        /// The record that failed to link.
        record: String,

        /// The underlying error.
        #[source]
        error: LinkFileError,

        /// Whether the rollback succeeded.
        rolled_back: bool,
    },

    /// The prefix could not be locked or read.
    #[error(transparent)]
    Prefix(#[from] PrefixError),

    /// The journal could not be written.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// The configuration of a transaction executor.
pub struct Installer {
    /// The shared package cache.
    pub package_cache: PackageCache,

    /// The HTTP client used for downloads.
    pub client: ClientWithMiddleware,

    /// How files are linked into the prefix.
    pub link_options: LinkOptions,

    /// Link-time verification level.
    pub safety_checks: SafetyChecks,

    /// Whether extraction re-hashes every file.
    pub extra_safety_checks: bool,

    /// The number of parallel downloads.
    pub download_concurrency: usize,

    /// The retry policy for transient download failures.
    pub retry_policy: ExponentialBackoff,

    /// The process-wide interrupt flag.
    pub cancellation: CancellationToken,
}

/// The outcome of a successfully executed transaction.
#[derive(Debug, Default)]
pub struct InstallerResult {
    /// The records that were linked.
    pub linked: Vec<PrefixRecord>,

    /// The records that were unlinked.
    pub unlinked: Vec<PrefixRecord>,
}

/// The request description recorded in the journal.
#[derive(Debug, Default, Clone)]
pub struct RequestDescription {
    /// The command line of the operation.
    pub command: String,

    /// The action name (`install`, `remove`, `create`, `update`).
    pub action: String,

    /// The specs the user asked to install or update.
    pub update_specs: Vec<MatchSpec>,

    /// The specs the user asked to remove.
    pub remove_specs: Vec<MatchSpec>,
}

impl Installer {
    /// Executes the transaction against the prefix.
    pub async fn execute(
        &self,
        prefix: &Prefix,
        transaction: Transaction,
        request: RequestDescription,
    ) -> Result<InstallerResult, InstallerError> {
        if transaction.is_empty() {
            return Ok(InstallerResult::default());
        }

        let _prefix_lock = prefix.lock()?;

        // Phase 1: make sure every artifact is present in the cache. Any
        // failure aborts before the prefix is mutated in any way.
        let cached_dirs = self.fetch_all(&transaction).await?;

        // Phase 2: unlink removals, most-dependent first. Failures are
        // collected so the remaining packages still get their chance, but
        // the link phase is refused afterwards.
        let removals = order_removals(transaction.records_to_unlink().cloned().collect());
        let mut unlink_failures = Vec::new();
        let mut unlinked = Vec::new();
        for record in removals {
            if self.cancellation.is_cancelled() {
                return Err(InstallerError::Cancelled);
            }
            match unlink_package(prefix.path(), &record) {
                Ok(()) => unlinked.push(record),
                Err(e) => {
                    tracing::error!(
                        "failed to unlink {}: {}",
                        record.repodata_record.package_record,
                        e
                    );
                    unlink_failures.push(e);
                }
            }
        }
        if !unlink_failures.is_empty() {
            return Err(InstallerError::UnlinkFailed(unlink_failures));
        }

        // Phase 3: link installs in dependency order.
        let installs =
            sort_topologically(transaction.records_to_fetch().cloned().collect());
        let mut linked: Vec<PrefixRecord> = Vec::new();
        for record in installs {
            if self.cancellation.is_cancelled() {
                self.rollback(prefix, &linked);
                return Err(InstallerError::Cancelled);
            }
            let package_dir = cached_dirs
                .get(&record.package_record.dist_str())
                .expect("every install was fetched in phase 1");
            match self.link_package(
                prefix,
                &record,
                package_dir,
                transaction.python_info.as_ref(),
            ) {
                Ok(prefix_record) => linked.push(prefix_record),
                Err(error) => {
                    let rolled_back = self.rollback(prefix, &linked);
                    return Err(InstallerError::LinkFailed {
                        record: record.package_record.to_string(),
                        error,
                        rolled_back,
                    });
                }
            }
        }

        // Phase 4: journal the transaction.
        let history = krait_types::History::from_prefix(prefix.path());
        history.append_entry(&HistoryEntry {
            timestamp: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            cmd: Some(request.command),
            action: Some(request.action),
            update_specs: request
                .update_specs
                .iter()
                .map(ToString::to_string)
                .collect(),
            remove_specs: request
                .remove_specs
                .iter()
                .map(ToString::to_string)
                .collect(),
            link_dists: linked
                .iter()
                .map(|r| r.repodata_record.package_record.dist_str())
                .collect(),
            unlink_dists: unlinked
                .iter()
                .map(|r| r.repodata_record.package_record.dist_str())
                .collect(),
        })?;

        Ok(InstallerResult { linked, unlinked })
    }

    /// Downloads and extracts every record the transaction installs,
    /// returning the cache directory per dist.
    async fn fetch_all(
        &self,
        transaction: &Transaction,
    ) -> Result<HashMap<String, PathBuf>, InstallerError> {
        let records: Vec<RepoDataRecord> = transaction.records_to_fetch().cloned().collect();
        let fetches = stream::iter(records.into_iter().map(|record| {
            let cache = self.package_cache.clone();
            let client = self.client.clone();
            let retry_policy = self.retry_policy.clone();
            let extra_checks = self.extra_safety_checks;
            let cancellation = self.cancellation.clone();
            async move {
                let dist = record.package_record.dist_str();
                tokio::select! {
                    () = cancellation.cancelled() => {
                        // The aborted transfer may have left a partial
                        // archive behind.
                        let _ = fs_err::remove_file(
                            cache.path().join(&record.file_name),
                        );
                        Err(InstallerError::Cancelled)
                    }
                    result = cache.ensure(&record, client, retry_policy, extra_checks) => {
                        match result {
                            Ok(path) => Ok((dist, path)),
                            Err(e) => Err(InstallerError::FetchFailed(dist, e)),
                        }
                    }
                }
            }
        }))
        .buffer_unordered(self.download_concurrency.max(1));

        fetches.try_collect().await
    }

    /// Links one package into the prefix and writes its `conda-meta` record.
    fn link_package(
        &self,
        prefix: &Prefix,
        record: &RepoDataRecord,
        package_dir: &Path,
        python_info: Option<&PythonInfo>,
    ) -> Result<PrefixRecord, LinkFileError> {
        let paths_json = PathsJson::from_package_directory(package_dir).unwrap_or_default();
        let target_prefix = prefix.path().to_string_lossy().into_owned();
        let is_noarch_python = record.package_record.noarch.is_python();

        let mut prefix_record = PrefixRecord::from_repodata_record(record.clone());
        let mut linked_files: Vec<PathBuf> = Vec::new();
        let mut entries: Vec<PrefixPathsEntry> = Vec::new();
        let mut predominant_method = LinkType::Hardlink;

        let result: Result<(), LinkFileError> = (|| {
            for entry in &paths_json.paths {
                let relative_destination = if is_noarch_python {
                    remap_noarch_python_path(&entry.relative_path, python_info)
                } else {
                    entry.relative_path.clone()
                };
                let destination = prefix.path().join(&relative_destination);

                if entry.path_type == PathType::Directory {
                    fs_err::create_dir_all(&destination)?;
                    entries.push(PrefixPathsEntry {
                        relative_path: relative_destination,
                        path_type: PrefixPathType::Directory,
                        sha256: None,
                        sha256_in_prefix: None,
                        size_in_bytes: None,
                        prefix_placeholder: None,
                        file_mode: None,
                    });
                    continue;
                }

                let allow_clobber = match self.safety_checks {
                    SafetyChecks::Disabled => true,
                    SafetyChecks::Warn => {
                        if destination.exists() {
                            tracing::warn!(
                                "{} clobbers an existing file",
                                destination.display()
                            );
                        }
                        true
                    }
                    SafetyChecks::Enabled => false,
                };

                let method = self.link_options.method_for(entry);
                let linked = link_file(
                    entry,
                    &destination,
                    package_dir,
                    &target_prefix,
                    method,
                    allow_clobber,
                )?;

                let path_type = match linked.method {
                    LinkMethod::Softlink => PrefixPathType::Softlink,
                    _ => PrefixPathType::Hardlink,
                };
                if matches!(linked.method, LinkMethod::Copy | LinkMethod::Patched(_)) {
                    predominant_method = LinkType::Copy;
                } else if linked.method == LinkMethod::Softlink {
                    predominant_method = LinkType::Softlink;
                }

                entries.push(PrefixPathsEntry {
                    relative_path: relative_destination.clone(),
                    path_type,
                    sha256: entry.sha256,
                    sha256_in_prefix: linked.sha256_in_prefix,
                    size_in_bytes: Some(linked.file_size),
                    prefix_placeholder: entry.prefix_placeholder.clone(),
                    file_mode: entry.file_mode,
                });
                linked_files.push(relative_destination);
            }
            Ok(())
        })();

        if let Err(error) = result {
            // Remove the files this record already created before bailing.
            for file in &linked_files {
                let _ = fs_err::remove_file(prefix.path().join(file));
            }
            return Err(error);
        }

        prefix_record.files = linked_files;
        prefix_record.paths_data = PrefixPaths {
            paths_version: 1,
            paths: entries,
        };
        prefix_record.extracted_package_dir = Some(package_dir.to_path_buf());
        prefix_record.link = Some(Link {
            source: package_dir.to_path_buf(),
            link_type: predominant_method,
        });

        // The record is written only after every file is in place.
        let meta_dir = prefix.conda_meta_dir();
        fs_err::create_dir_all(&meta_dir)?;
        prefix_record.write_to_path(meta_dir.join(prefix_record.file_name()))?;

        Ok(prefix_record)
    }

    /// Best-effort removal of the records this transaction already linked.
    /// Returns whether every rollback step succeeded.
    fn rollback(&self, prefix: &Prefix, linked: &[PrefixRecord]) -> bool {
        let mut complete = true;
        for record in linked.iter().rev() {
            if let Err(e) = unlink_package(prefix.path(), record) {
                tracing::error!(
                    "rollback of {} failed: {}",
                    record.repodata_record.package_record,
                    e
                );
                complete = false;
            }
        }
        complete
    }
}

/// Orders removals so that dependents are unlinked before their
/// dependencies: the reverse of the topological install order.
fn order_removals(records: Vec<PrefixRecord>) -> Vec<PrefixRecord> {
    let mut by_dist: HashMap<String, PrefixRecord> = records
        .into_iter()
        .map(|record| (record.repodata_record.package_record.dist_str(), record))
        .collect();
    let repodata: Vec<RepoDataRecord> = by_dist
        .values()
        .map(|record| record.repodata_record.clone())
        .collect();
    let mut ordered: Vec<PrefixRecord> = sort_topologically(repodata)
        .into_iter()
        .filter_map(|record| by_dist.remove(&record.package_record.dist_str()))
        .collect();
    ordered.reverse();
    ordered
}

/// Maps the paths of a noarch python package onto the target python layout:
/// `site-packages/…` moves into the interpreter's site-packages directory
/// and `python-scripts/…` into the executable directory.
fn remap_noarch_python_path(path: &Path, python_info: Option<&PythonInfo>) -> PathBuf {
    let Some(python_info) = python_info else {
        return path.to_path_buf();
    };
    if let Ok(rest) = path.strip_prefix("site-packages") {
        python_info.site_packages_path.join(rest)
    } else if let Ok(rest) = path.strip_prefix("python-scripts") {
        python_info.bin_dir.join(rest)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use krait_net::retry::default_retry_policy;
    use krait_types::PackageRecord;
    use url::Url;

    use super::*;
    use crate::prefix::PrefixData;

    /// Builds a package archive with an `info/paths.json` covering the given
    /// files.
    fn write_package(dir: &Path, name: &str, version: &str, files: &[(&str, &str)]) -> PathBuf {
        let mut paths = Vec::new();
        for (path, content) in files {
            let digest =
                krait_digest::compute_bytes_digest::<krait_digest::Sha256>(content);
            paths.push(format!(
                r#"{{"_path": "{path}", "path_type": "hardlink", "sha256": "{digest:x}", "size_in_bytes": {}}}"#,
                content.len()
            ));
        }
        let paths_json = format!(
            r#"{{"paths_version": 1, "paths": [{}]}}"#,
            paths.join(", ")
        );
        let index_json = format!(
            r#"{{"name": "{name}", "version": "{version}", "build": "0", "build_number": 0, "depends": [], "subdir": "linux-64"}}"#
        );

        let archive = dir.join(format!("{name}-{version}-0.tar.bz2"));
        let file = fs_err::File::create(&archive).unwrap();
        let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            let mut append = |path: &str, content: &str| {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(&mut header, path, content.as_bytes())
                    .unwrap();
            };
            append("info/index.json", &index_json);
            append("info/paths.json", &paths_json);
            for (path, content) in files {
                append(path, content);
            }
            builder.finish().unwrap();
        }
        encoder.finish().unwrap().flush().unwrap();
        archive
    }

    fn record_for(archive: &Path, name: &str, version: &str) -> RepoDataRecord {
        let mut package_record = PackageRecord::for_test(name, version, "0", 0);
        package_record.sha256 = Some(
            krait_digest::compute_file_digest::<krait_digest::Sha256>(archive).unwrap(),
        );
        RepoDataRecord {
            package_record,
            file_name: archive.file_name().unwrap().to_string_lossy().into_owned(),
            url: Url::from_file_path(archive).unwrap(),
            channel: "local".to_owned(),
        }
    }

    fn installer(cache_dir: &Path) -> Installer {
        Installer {
            package_cache: PackageCache::new(cache_dir),
            client: ClientWithMiddleware::from(reqwest::Client::new()),
            link_options: LinkOptions::default(),
            safety_checks: SafetyChecks::Warn,
            extra_safety_checks: false,
            download_concurrency: 4,
            retry_policy: default_retry_policy(),
            cancellation: CancellationToken::new(),
        }
    }

    fn request(action: &str, specs: &[&str]) -> RequestDescription {
        RequestDescription {
            command: format!("krait {action}"),
            action: action.to_owned(),
            update_specs: specs.iter().map(|s| s.parse().unwrap()).collect(),
            remove_specs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_install_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_package(
            dir.path(),
            "foo",
            "1.0",
            &[("bin/foo", "#!/bin/sh\n"), ("share/foo/data", "payload")],
        );
        let record = record_for(&archive, "foo", "1.0");

        let prefix = Prefix::create(dir.path().join("env")).unwrap();
        let installer = installer(&dir.path().join("pkgs"));

        // Install.
        let transaction = Transaction::from_current_and_desired(
            vec![],
            vec![record.clone()],
            krait_types::Platform::Linux64,
        )
        .unwrap();
        let result = installer
            .execute(&prefix, transaction, request("install", &["foo"]))
            .await
            .unwrap();

        assert_eq!(result.linked.len(), 1);
        assert!(prefix.path().join("bin/foo").is_file());
        assert!(prefix
            .path()
            .join("conda-meta/foo-1.0-0.json")
            .is_file());

        // The journal has one entry naming the request and the dist.
        let data = PrefixData::from_prefix(&prefix).unwrap();
        let entries = data.history().entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].update_specs, vec!["foo"]);
        assert!(entries[0].link_dists.contains(&"foo-1.0-0".to_owned()));

        // Re-reading the prefix yields the installed record.
        assert_eq!(data.records().count(), 1);

        // Remove.
        let transaction = Transaction::from_current_and_desired(
            data.installed_repodata_records()
                .into_iter()
                .map(|r| data.get(r.package_record.name.as_normalized()).unwrap().clone())
                .collect(),
            vec![],
            krait_types::Platform::Linux64,
        )
        .unwrap();
        let result = installer
            .execute(&prefix, transaction, request("remove", &[]))
            .await
            .unwrap();
        assert_eq!(result.unlinked.len(), 1);
        assert!(!prefix.path().join("bin/foo").exists());
        assert!(!prefix.path().join("conda-meta/foo-1.0-0.json").exists());
    }

    #[tokio::test]
    async fn test_empty_transaction_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = Prefix::create(dir.path().join("env")).unwrap();
        let installer = installer(&dir.path().join("pkgs"));

        let transaction = Transaction::from_current_and_desired(
            vec![],
            vec![],
            krait_types::Platform::Linux64,
        )
        .unwrap();
        let result = installer
            .execute(&prefix, transaction, request("install", &[]))
            .await
            .unwrap();
        assert!(result.linked.is_empty());
        // No journal entry is written for a no-op.
        let data = PrefixData::from_prefix(&prefix).unwrap();
        assert!(data.history().entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_applying_same_state_twice_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_package(dir.path(), "foo", "1.0", &[("bin/foo", "x")]);
        let record = record_for(&archive, "foo", "1.0");

        let prefix = Prefix::create(dir.path().join("env")).unwrap();
        let installer = installer(&dir.path().join("pkgs"));

        let transaction = Transaction::from_current_and_desired(
            vec![],
            vec![record.clone()],
            krait_types::Platform::Linux64,
        )
        .unwrap();
        installer
            .execute(&prefix, transaction, request("install", &["foo"]))
            .await
            .unwrap();

        // Diffing the installed state against the same desired state yields
        // an empty transaction, so a second apply is a no-op.
        let data = PrefixData::from_prefix(&prefix).unwrap();
        let transaction = Transaction::from_current_and_desired(
            data.records().cloned().collect(),
            vec![record],
            krait_types::Platform::Linux64,
        )
        .unwrap();
        assert!(transaction.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_prefix_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut package_record = PackageRecord::for_test("ghost", "1.0", "0", 0);
        package_record.sha256 = None;
        let record = RepoDataRecord {
            package_record,
            file_name: "ghost-1.0-0.tar.bz2".to_owned(),
            url: Url::from_file_path(dir.path().join("missing.tar.bz2")).unwrap(),
            channel: "local".to_owned(),
        };

        let prefix = Prefix::create(dir.path().join("env")).unwrap();
        let installer = installer(&dir.path().join("pkgs"));
        let transaction = Transaction::from_current_and_desired(
            vec![],
            vec![record],
            krait_types::Platform::Linux64,
        )
        .unwrap();
        let result = installer
            .execute(&prefix, transaction, request("install", &["ghost"]))
            .await;
        assert_matches::assert_matches!(result, Err(InstallerError::FetchFailed(_, _)));

        let data = PrefixData::from_prefix(&prefix).unwrap();
        assert_eq!(data.records().count(), 0);
        assert!(data.history().entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_unlinks_before_linking() {
        let dir = tempfile::tempdir().unwrap();
        let old_archive = write_package(dir.path(), "foo", "1.0", &[("bin/foo", "old")]);
        let new_archive = write_package(dir.path(), "foo", "2.0", &[("bin/foo", "new")]);
        let old_record = record_for(&old_archive, "foo", "1.0");
        let new_record = record_for(&new_archive, "foo", "2.0");

        let prefix = Prefix::create(dir.path().join("env")).unwrap();
        let installer = installer(&dir.path().join("pkgs"));

        let transaction = Transaction::from_current_and_desired(
            vec![],
            vec![old_record],
            krait_types::Platform::Linux64,
        )
        .unwrap();
        installer
            .execute(&prefix, transaction, request("install", &["foo"]))
            .await
            .unwrap();

        let data = PrefixData::from_prefix(&prefix).unwrap();
        let transaction = Transaction::from_current_and_desired(
            data.records().cloned().collect(),
            vec![new_record],
            krait_types::Platform::Linux64,
        )
        .unwrap();
        let result = installer
            .execute(&prefix, transaction, request("install", &["foo >=2"]))
            .await
            .unwrap();

        assert_eq!(result.unlinked.len(), 1);
        assert_eq!(result.linked.len(), 1);
        assert_eq!(
            fs_err::read_to_string(prefix.path().join("bin/foo")).unwrap(),
            "new"
        );
        let data = PrefixData::from_prefix(&prefix).unwrap();
        assert_eq!(
            data.get("foo")
                .unwrap()
                .repodata_record
                .package_record
                .version
                .to_string(),
            "2.0"
        );
    }
}
