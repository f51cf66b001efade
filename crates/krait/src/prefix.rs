//! The target prefix: its installed records and its journal.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use krait_types::{History, HistoryError, MatchSpec, PrefixRecord, RepoDataRecord};
use thiserror::Error;

/// An error that can occur while working with a prefix.
#[derive(Debug, Error)]
pub enum PrefixError {
    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The prefix journal could not be read.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// The prefix is locked by another operation.
    #[error("the prefix at '{0}' is in use by another operation")]
    PrefixInUse(PathBuf),
}

/// A self-contained directory that behaves as an installation root.
#[derive(Debug, Clone)]
pub struct Prefix {
    path: PathBuf,
}

impl Prefix {
    /// Creates a handle to a prefix, creating the directory (and its
    /// `conda-meta`) if it does not exist yet.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, PrefixError> {
        let path = path.into();
        fs_err::create_dir_all(path.join("conda-meta"))?;
        Ok(Self { path })
    }

    /// Wraps an existing prefix without touching the filesystem.
    pub fn existing(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The root directory of the prefix.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `conda-meta` directory of the prefix.
    pub fn conda_meta_dir(&self) -> PathBuf {
        self.path.join("conda-meta")
    }

    /// Acquires the exclusive prefix lock for the duration of a transaction.
    /// Fails immediately with [`PrefixError::PrefixInUse`] when another
    /// operation holds it.
    pub fn lock(&self) -> Result<fslock::LockFile, PrefixError> {
        fs_err::create_dir_all(self.conda_meta_dir())?;
        let lock_path = self.conda_meta_dir().join(".krait.lock");
        let mut lock = fslock::LockFile::open(&lock_path)?;
        if !lock.try_lock()? {
            return Err(PrefixError::PrefixInUse(self.path.clone()));
        }
        Ok(lock)
    }
}

/// The authoritative state of one prefix: every installed record plus the
/// journal. Records are read from disk once and cached for the lifetime of
/// the operation.
#[derive(Debug)]
pub struct PrefixData {
    prefix: Prefix,
    records: BTreeMap<String, PrefixRecord>,
    history: History,
}

impl PrefixData {
    /// Reads the installed records of the given prefix.
    pub fn from_prefix(prefix: &Prefix) -> Result<Self, PrefixError> {
        let records = PrefixRecord::collect_from_prefix(prefix.path())?
            .into_iter()
            .map(|record| {
                (
                    record
                        .repodata_record
                        .package_record
                        .name
                        .as_normalized()
                        .to_owned(),
                    record,
                )
            })
            .collect();
        Ok(Self {
            prefix: prefix.clone(),
            records,
            history: History::from_prefix(prefix.path()),
        })
    }

    /// The prefix these records belong to.
    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    /// The installed records, sorted by package name.
    pub fn records(&self) -> impl Iterator<Item = &PrefixRecord> + '_ {
        self.records.values()
    }

    /// The installed record for the given (normalized) name.
    pub fn get(&self, name: &str) -> Option<&PrefixRecord> {
        self.records.get(name)
    }

    /// The installed records as repodata records, for feeding the solver.
    pub fn installed_repodata_records(&self) -> Vec<RepoDataRecord> {
        self.records
            .values()
            .map(|record| record.repodata_record.clone())
            .collect()
    }

    /// The journal of the prefix.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// The specs the user has requested over the lifetime of the prefix,
    /// derived by replaying the journal.
    pub fn requested_specs(&self) -> Result<Vec<MatchSpec>, PrefixError> {
        Ok(self
            .history
            .requested_specs_map()?
            .into_values()
            .collect())
    }
}
