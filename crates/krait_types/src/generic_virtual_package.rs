//! Defines [`GenericVirtualPackage`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{PackageName, Version};

/// A virtual package: a synthetic record describing a capability of the host
/// system (e.g. `__glibc=2.35`). Virtual packages only exist at solve time;
/// they are never downloaded or linked.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GenericVirtualPackage {
    /// The name of the package, always starting with `__`.
    pub name: PackageName,

    /// The version of the capability.
    pub version: Version,

    /// The build string, used to carry extra detail such as the
    /// micro-architecture name.
    pub build_string: String,
}

impl Display for GenericVirtualPackage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={}={}",
            &self.name.as_normalized(),
            &self.version,
            &self.build_string
        )
    }
}
