#![deny(missing_docs)]

//! Detection of virtual packages.
//!
//! Virtual packages describe capabilities of the host system (`__linux`,
//! `__glibc`, `__osx`, `__win`, `__unix`, `__cuda`, `__archspec`) as records
//! the solver can match against. They are never downloaded or installed.
//!
//! Every detected value can be overridden through an environment variable
//! (`CONDA_OVERRIDE_CUDA=11.2`); an override set to the empty string disables
//! the package entirely.

pub mod cuda;
pub mod libc;
pub mod linux;
pub mod osx;

use std::str::FromStr;

use krait_types::{GenericVirtualPackage, PackageName, ParseVersionError, Version};
use thiserror::Error;

/// The source of an override value for one virtual package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Override {
    /// Use the default `CONDA_OVERRIDE_*` environment variable.
    #[default]
    DefaultEnvVar,

    /// Use a custom environment variable.
    EnvVar(String),

    /// Use this value directly.
    String(String),
}

impl Override {
    /// Resolves the override to a value: `None` means "no override, detect",
    /// `Some("")` means "disable the package".
    fn resolve(&self, default_env_var: &str) -> Option<String> {
        match self {
            Override::DefaultEnvVar => std::env::var(default_env_var).ok(),
            Override::EnvVar(name) => std::env::var(name).ok(),
            Override::String(value) => Some(value.clone()),
        }
    }
}

/// Overrides for all overridable virtual packages.
#[derive(Debug, Clone, Default)]
pub struct VirtualPackageOverrides {
    /// Override for `__cuda`.
    pub cuda: Override,

    /// Override for `__glibc`.
    pub libc: Override,

    /// Override for `__linux`.
    pub linux: Override,

    /// Override for `__osx`.
    pub osx: Override,
}

/// An error that can occur during virtual package detection.
#[derive(Debug, Error)]
pub enum DetectVirtualPackageError {
    /// A version (from the system or from an override) did not parse.
    #[error(transparent)]
    ParseVersion(#[from] ParseVersionError),

    /// The linux version could not be detected.
    #[error(transparent)]
    Linux(#[from] linux::ParseLinuxVersionError),

    /// The libc version could not be detected.
    #[error(transparent)]
    LibC(#[from] libc::DetectLibCError),

    /// The osx version could not be detected.
    #[error(transparent)]
    Osx(#[from] osx::ParseOsxVersionError),
}

/// A virtual package provided by the host system.
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualPackage {
    /// The host runs Windows.
    Win,

    /// The host runs a unix-like operating system.
    Unix,

    /// The host runs a Linux kernel of this version.
    Linux(Linux),

    /// The host provides this libc family and version.
    LibC(LibC),

    /// The host runs macOS of this version.
    Osx(Osx),

    /// The host provides a Cuda driver of this version.
    Cuda(Cuda),

    /// The micro-architecture of the host CPU.
    Archspec(Archspec),
}

/// The `__linux` virtual package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linux {
    /// The kernel version.
    pub version: Version,
}

/// The `__glibc` (or other libc family) virtual package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibC {
    /// The family, e.g. `glibc`.
    pub family: String,

    /// The version of the libc.
    pub version: Version,
}

/// The `__osx` virtual package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Osx {
    /// The macOS product version.
    pub version: Version,
}

/// The `__cuda` virtual package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cuda {
    /// The maximum Cuda version supported by the driver.
    pub version: Version,
}

/// The `__archspec` virtual package, whose build string carries the CPU
/// micro-architecture name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archspec {
    /// The name of the micro-architecture, e.g. `x86_64_v3`.
    pub spec: String,
}

impl Archspec {
    /// Detects the micro-architecture of the current CPU.
    pub fn current() -> Option<Self> {
        archspec::cpu::host()
            .ok()
            .map(|arch| Self {
                spec: arch.name().to_owned(),
            })
    }
}

impl From<VirtualPackage> for GenericVirtualPackage {
    fn from(package: VirtualPackage) -> Self {
        let name = |n: &str| PackageName::new_unchecked(n.to_owned());
        let zero = Version::from_str("0").expect("0 is a valid version");
        match package {
            VirtualPackage::Win => GenericVirtualPackage {
                name: name("__win"),
                version: zero,
                build_string: "0".to_owned(),
            },
            VirtualPackage::Unix => GenericVirtualPackage {
                name: name("__unix"),
                version: zero,
                build_string: "0".to_owned(),
            },
            VirtualPackage::Linux(linux) => GenericVirtualPackage {
                name: name("__linux"),
                version: linux.version,
                build_string: "0".to_owned(),
            },
            VirtualPackage::LibC(libc) => GenericVirtualPackage {
                name: name(&format!("__{}", libc.family.to_lowercase())),
                version: libc.version,
                build_string: "0".to_owned(),
            },
            VirtualPackage::Osx(osx) => GenericVirtualPackage {
                name: name("__osx"),
                version: osx.version,
                build_string: "0".to_owned(),
            },
            VirtualPackage::Cuda(cuda) => GenericVirtualPackage {
                name: name("__cuda"),
                version: cuda.version,
                build_string: "0".to_owned(),
            },
            VirtualPackage::Archspec(archspec) => GenericVirtualPackage {
                name: name("__archspec"),
                version: Version::from_str("1").expect("1 is a valid version"),
                build_string: archspec.spec,
            },
        }
    }
}

/// Resolves an overridable detection: the override wins over the detected
/// value, the empty string disables the package.
fn apply_override(
    override_: &Override,
    env_var: &str,
    detect: impl FnOnce() -> Result<Option<Version>, DetectVirtualPackageError>,
) -> Result<Option<Version>, DetectVirtualPackageError> {
    match override_.resolve(env_var) {
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => Ok(Some(Version::from_str(&value)?)),
        None => detect(),
    }
}

impl VirtualPackage {
    /// Detects all virtual packages of the host, applying the given
    /// overrides.
    pub fn detect(
        overrides: &VirtualPackageOverrides,
    ) -> Result<Vec<VirtualPackage>, DetectVirtualPackageError> {
        let mut result = Vec::new();

        if cfg!(windows) {
            result.push(VirtualPackage::Win);
        }
        if cfg!(unix) {
            result.push(VirtualPackage::Unix);
        }

        if cfg!(target_os = "linux") {
            if let Some(version) = apply_override(&overrides.linux, "CONDA_OVERRIDE_LINUX", || {
                Ok(linux::linux_version()?)
            })? {
                result.push(VirtualPackage::Linux(Linux { version }));
            }

            let family_and_version = match overrides.libc.resolve("CONDA_OVERRIDE_GLIBC") {
                Some(value) if value.is_empty() => None,
                Some(value) => Some(("glibc".to_owned(), Version::from_str(&value)?)),
                None => libc::libc_family_and_version()?,
            };
            if let Some((family, version)) = family_and_version {
                result.push(VirtualPackage::LibC(LibC { family, version }));
            }
        }

        if cfg!(target_os = "macos") {
            if let Some(version) = apply_override(&overrides.osx, "CONDA_OVERRIDE_OSX", || {
                Ok(osx::osx_version()?)
            })? {
                result.push(VirtualPackage::Osx(Osx { version }));
            }
        }

        if let Some(version) = apply_override(&overrides.cuda, "CONDA_OVERRIDE_CUDA", || {
            Ok(cuda::cuda_version())
        })? {
            result.push(VirtualPackage::Cuda(Cuda { version }));
        }

        if let Some(archspec) = Archspec::current() {
            result.push(VirtualPackage::Archspec(archspec));
        }

        Ok(result)
    }

    /// Detects all virtual packages as [`GenericVirtualPackage`]s.
    pub fn detect_generic(
        overrides: &VirtualPackageOverrides,
    ) -> Result<Vec<GenericVirtualPackage>, DetectVirtualPackageError> {
        Ok(Self::detect(overrides)?
            .into_iter()
            .map(Into::into)
            .collect())
    }
}
