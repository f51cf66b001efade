//! Computing the operations that bring a prefix from its current state to a
//! desired state.

use std::collections::HashMap;

use krait_types::{PackageRecord, Platform, PrefixRecord, RepoDataRecord};

use super::{PythonInfo, PythonInfoError};

/// An error that can occur while constructing a transaction.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// The python version in the environment could not be interpreted.
    #[error(transparent)]
    PythonInfoError(#[from] PythonInfoError),
}

/// A single operation of a transaction.
#[derive(Debug, Clone)]
pub enum TransactionOperation {
    /// Install a new package.
    Install(RepoDataRecord),

    /// Replace an installed package with another record.
    Change {
        /// The installed record to remove.
        old: PrefixRecord,

        /// The record to install in its place.
        new: RepoDataRecord,
    },

    /// Remove and relink the same record; required for noarch python
    /// packages when the python version changes.
    Reinstall(PrefixRecord),

    /// Remove an installed package.
    Remove(PrefixRecord),
}

impl TransactionOperation {
    /// The record that will be present after the operation, if any.
    pub fn record_to_install(&self) -> Option<&RepoDataRecord> {
        match self {
            TransactionOperation::Install(record) => Some(record),
            TransactionOperation::Change { new, .. } => Some(new),
            TransactionOperation::Reinstall(record) => Some(&record.repodata_record),
            TransactionOperation::Remove(_) => None,
        }
    }

    /// The installed record that will be removed first, if any.
    pub fn record_to_remove(&self) -> Option<&PrefixRecord> {
        match self {
            TransactionOperation::Install(_) => None,
            TransactionOperation::Change { old, .. } => Some(old),
            TransactionOperation::Reinstall(record) => Some(record),
            TransactionOperation::Remove(record) => Some(record),
        }
    }
}

/// The ordered plan that brings a prefix from one state to another.
pub struct Transaction {
    /// The operations to perform.
    pub operations: Vec<TransactionOperation>,

    /// The python layout of the target state, if python is part of it.
    pub python_info: Option<PythonInfo>,

    /// The platform of the target prefix.
    pub platform: Platform,
}

impl Transaction {
    /// Diffs the current state of a prefix against the desired record set.
    pub fn from_current_and_desired(
        current: Vec<PrefixRecord>,
        desired: Vec<RepoDataRecord>,
        platform: Platform,
    ) -> Result<Self, TransactionError> {
        let current_python = find_python_info(
            current.iter().map(|r| &r.repodata_record.package_record),
            platform,
        )?;
        let desired_python =
            find_python_info(desired.iter().map(|r| &r.package_record), platform)?;
        let needs_python_relink = match (&current_python, &desired_python) {
            (Some(current), Some(desired)) => desired.is_relink_required(current),
            _ => false,
        };

        let mut desired_by_name: HashMap<String, RepoDataRecord> = desired
            .into_iter()
            .map(|record| {
                (
                    record.package_record.name.as_normalized().to_owned(),
                    record,
                )
            })
            .collect();

        let mut operations = Vec::new();

        for installed in current {
            let name = installed
                .repodata_record
                .package_record
                .name
                .as_normalized()
                .to_owned();
            match desired_by_name.remove(&name) {
                None => operations.push(TransactionOperation::Remove(installed)),
                Some(desired) => {
                    if desired.package_record != installed.repodata_record.package_record {
                        operations.push(TransactionOperation::Change {
                            old: installed,
                            new: desired,
                        });
                    } else if desired.package_record.noarch.is_python() && needs_python_relink {
                        operations.push(TransactionOperation::Reinstall(installed));
                    }
                }
            }
        }

        for record in desired_by_name.into_values() {
            operations.push(TransactionOperation::Install(record));
        }

        // Deterministic order: removals first, then by name.
        operations.sort_by_key(|op| {
            let name = op
                .record_to_install()
                .map(|r| r.package_record.name.as_normalized().to_owned())
                .or_else(|| {
                    op.record_to_remove().map(|r| {
                        r.repodata_record
                            .package_record
                            .name
                            .as_normalized()
                            .to_owned()
                    })
                })
                .unwrap_or_default();
            (op.record_to_install().is_some(), name)
        });

        Ok(Self {
            operations,
            python_info: desired_python,
            platform,
        })
    }

    /// Returns true when the transaction performs no operation at all.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The records that must be present in the package cache before the
    /// transaction can run.
    pub fn records_to_fetch(&self) -> impl Iterator<Item = &RepoDataRecord> + '_ {
        self.operations.iter().filter_map(|op| op.record_to_install())
    }

    /// The installed records the transaction removes (including the old half
    /// of every change).
    pub fn records_to_unlink(&self) -> impl Iterator<Item = &PrefixRecord> + '_ {
        self.operations.iter().filter_map(|op| op.record_to_remove())
    }

    /// Renders a one-line-per-operation summary of the plan.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for op in &self.operations {
            match op {
                TransactionOperation::Install(record) => {
                    out.push_str(&format!("  + {}\n", record.package_record));
                }
                TransactionOperation::Change { old, new } => {
                    out.push_str(&format!(
                        "  ~ {} -> {}\n",
                        old.repodata_record.package_record, new.package_record
                    ));
                }
                TransactionOperation::Reinstall(record) => {
                    out.push_str(&format!(
                        "  * {}\n",
                        record.repodata_record.package_record
                    ));
                }
                TransactionOperation::Remove(record) => {
                    out.push_str(&format!(
                        "  - {}\n",
                        record.repodata_record.package_record
                    ));
                }
            }
        }
        out
    }
}

/// Finds the python record in a record set and computes its layout.
fn find_python_info<'a>(
    records: impl IntoIterator<Item = &'a PackageRecord>,
    platform: Platform,
) -> Result<Option<PythonInfo>, PythonInfoError> {
    records
        .into_iter()
        .find(|record| record.name.as_normalized() == "python")
        .map(|record| PythonInfo::from_version(&record.version, platform))
        .transpose()
}

#[cfg(test)]
mod test {
    use krait_types::NoArchType;
    use url::Url;

    use super::*;

    fn repodata_record(name: &str, version: &str) -> RepoDataRecord {
        RepoDataRecord {
            package_record: PackageRecord::for_test(name, version, "0", 0),
            file_name: format!("{name}-{version}-0.conda"),
            url: Url::parse(&format!(
                "https://repo.example.com/linux-64/{name}-{version}-0.conda"
            ))
            .unwrap(),
            channel: "https://repo.example.com".to_owned(),
        }
    }

    fn prefix_record(name: &str, version: &str) -> PrefixRecord {
        PrefixRecord::from_repodata_record(repodata_record(name, version))
    }

    #[test]
    fn test_fresh_install() {
        let transaction = Transaction::from_current_and_desired(
            vec![],
            vec![repodata_record("foo", "1.0")],
            Platform::Linux64,
        )
        .unwrap();
        assert_eq!(transaction.operations.len(), 1);
        assert!(matches!(
            transaction.operations[0],
            TransactionOperation::Install(_)
        ));
    }

    #[test]
    fn test_upgrade_produces_change() {
        let transaction = Transaction::from_current_and_desired(
            vec![prefix_record("foo", "1.0")],
            vec![repodata_record("foo", "2.0")],
            Platform::Linux64,
        )
        .unwrap();
        assert_eq!(transaction.operations.len(), 1);
        assert!(matches!(
            transaction.operations[0],
            TransactionOperation::Change { .. }
        ));
    }

    #[test]
    fn test_identical_state_is_empty() {
        let transaction = Transaction::from_current_and_desired(
            vec![prefix_record("foo", "1.0")],
            vec![repodata_record("foo", "1.0")],
            Platform::Linux64,
        )
        .unwrap();
        assert!(transaction.is_empty());
    }

    #[test]
    fn test_removal() {
        let transaction = Transaction::from_current_and_desired(
            vec![prefix_record("foo", "1.0")],
            vec![],
            Platform::Linux64,
        )
        .unwrap();
        assert!(matches!(
            transaction.operations[0],
            TransactionOperation::Remove(_)
        ));
    }

    #[test]
    fn test_python_version_change_relinks_noarch() {
        let mut noarch = repodata_record("helper", "1.0");
        noarch.package_record.noarch = NoArchType::python();

        let current = vec![
            prefix_record("python", "3.10.0"),
            PrefixRecord::from_repodata_record(noarch.clone()),
        ];
        let desired = vec![repodata_record("python", "3.11.0"), noarch];

        let transaction =
            Transaction::from_current_and_desired(current, desired, Platform::Linux64).unwrap();

        let reinstalls = transaction
            .operations
            .iter()
            .filter(|op| matches!(op, TransactionOperation::Reinstall(_)))
            .count();
        assert_eq!(reinstalls, 1);
        // The python upgrade itself is a change.
        let changes = transaction
            .operations
            .iter()
            .filter(|op| matches!(op, TransactionOperation::Change { .. }))
            .count();
        assert_eq!(changes, 1);
    }
}
