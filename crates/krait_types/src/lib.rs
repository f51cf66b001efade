#![deny(missing_docs)]

//! `krait_types` defines the data model of the krait package manager.
//!
//! This crate is purely about representation: versions and their ordering,
//! match specs, channels, package records, the contents of a prefix and the
//! file formats krait consumes (`repodata.json`, `@EXPLICIT` lock files,
//! environment YAML files, the `conda-meta/history` journal). It contains no
//! I/O beyond reading and writing those formats.

pub mod channel;
mod environment_yaml;
mod explicit_spec;
mod generic_virtual_package;
mod history;
mod match_spec;
mod no_arch_type;
pub mod package;
mod package_name;
mod package_record;
mod platform;
mod prefix_record;
mod repo_data;
mod utils;
mod version;
mod version_spec;

pub use channel::{Channel, ChannelConfig, Containment, ParseChannelError, UnresolvedChannel};
pub use environment_yaml::{EnvironmentYaml, MatchSpecOrSubSection, ParseEnvironmentYamlError};
pub use explicit_spec::{
    ExplicitEnvironmentEntry, ExplicitEnvironmentSpec, PackageArchiveHash,
    ParseExplicitEnvironmentSpecError, ParsePackageArchiveHashError,
};
pub use generic_virtual_package::GenericVirtualPackage;
pub use history::{History, HistoryEntry, HistoryError};
pub use match_spec::{MatchSpec, ParseMatchSpecError, StringMatcher};
pub use no_arch_type::NoArchType;
pub use package_name::{PackageName, ParsePackageNameError};
pub use package_record::{PackageRecord, RepoDataRecord};
pub use platform::{Arch, ParsePlatformError, Platform};
pub use prefix_record::{Link, LinkType, PrefixPaths, PrefixPathType, PrefixPathsEntry, PrefixRecord};
pub use repo_data::{ChannelInfo, RepoData};
pub use version::{Component, ParseVersionError, Version, VersionWithSource};
pub use version_spec::{
    EqualityOperator, LogicalOperator, ParseVersionSpecError, RangeOperator, StrictRangeOperator,
    VersionSpec,
};
