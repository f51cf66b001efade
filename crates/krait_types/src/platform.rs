//! Defines the [`Platform`] enum, the set of subdirectories a channel serves.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A platform supported by conda-style channels.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Platform {
    NoArch,
    Linux32,
    Linux64,
    LinuxAarch64,
    LinuxArmV6l,
    LinuxArmV7l,
    LinuxPpc64le,
    LinuxPpc64,
    LinuxS390X,
    LinuxRiscV64,
    Osx64,
    OsxArm64,
    Win32,
    Win64,
    WinArm64,
}

/// An error that occurs when parsing an unknown platform string.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("'{string}' is not a known platform")]
pub struct ParsePlatformError {
    /// The platform string that could not be parsed.
    pub string: String,
}

/// The architecture of a platform, e.g. `x86_64` or `aarch64`.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Arch {
    X86,
    X86_64,
    Aarch64,
    ArmV6l,
    ArmV7l,
    Ppc64le,
    Ppc64,
    S390X,
    RiscV64,
}

impl Platform {
    /// Returns the platform for which the current binary was built.
    pub const fn current() -> Platform {
        #[cfg(all(target_os = "linux", target_arch = "x86"))]
        return Platform::Linux32;
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        return Platform::Linux64;
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        return Platform::LinuxAarch64;
        #[cfg(all(target_os = "linux", target_arch = "arm", target_feature = "v7"))]
        return Platform::LinuxArmV7l;
        #[cfg(all(target_os = "linux", target_arch = "arm", not(target_feature = "v7")))]
        return Platform::LinuxArmV6l;
        #[cfg(all(target_os = "linux", target_arch = "powerpc64le"))]
        return Platform::LinuxPpc64le;
        #[cfg(all(target_os = "linux", target_arch = "powerpc64"))]
        return Platform::LinuxPpc64;
        #[cfg(all(target_os = "linux", target_arch = "s390x"))]
        return Platform::LinuxS390X;
        #[cfg(all(target_os = "linux", target_arch = "riscv64"))]
        return Platform::LinuxRiscV64;
        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        return Platform::Osx64;
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        return Platform::OsxArm64;
        #[cfg(all(target_os = "windows", target_arch = "x86"))]
        return Platform::Win32;
        #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
        return Platform::Win64;
        #[cfg(all(target_os = "windows", target_arch = "aarch64"))]
        return Platform::WinArm64;

        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "windows"
        )))]
        compile_error!("unsupported target platform");
    }

    /// Returns a string representation of the platform, e.g. `linux-64`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Platform::NoArch => "noarch",
            Platform::Linux32 => "linux-32",
            Platform::Linux64 => "linux-64",
            Platform::LinuxAarch64 => "linux-aarch64",
            Platform::LinuxArmV6l => "linux-armv6l",
            Platform::LinuxArmV7l => "linux-armv7l",
            Platform::LinuxPpc64le => "linux-ppc64le",
            Platform::LinuxPpc64 => "linux-ppc64",
            Platform::LinuxS390X => "linux-s390x",
            Platform::LinuxRiscV64 => "linux-riscv64",
            Platform::Osx64 => "osx-64",
            Platform::OsxArm64 => "osx-arm64",
            Platform::Win32 => "win-32",
            Platform::Win64 => "win-64",
            Platform::WinArm64 => "win-arm64",
        }
    }

    /// Returns true for any of the `linux-*` platforms.
    pub const fn is_linux(self) -> bool {
        matches!(
            self,
            Platform::Linux32
                | Platform::Linux64
                | Platform::LinuxAarch64
                | Platform::LinuxArmV6l
                | Platform::LinuxArmV7l
                | Platform::LinuxPpc64le
                | Platform::LinuxPpc64
                | Platform::LinuxS390X
                | Platform::LinuxRiscV64
        )
    }

    /// Returns true for any of the `osx-*` platforms.
    pub const fn is_osx(self) -> bool {
        matches!(self, Platform::Osx64 | Platform::OsxArm64)
    }

    /// Returns true for any of the `win-*` platforms.
    pub const fn is_windows(self) -> bool {
        matches!(self, Platform::Win32 | Platform::Win64 | Platform::WinArm64)
    }

    /// Returns true for linux and osx platforms.
    pub const fn is_unix(self) -> bool {
        self.is_linux() || self.is_osx()
    }

    /// Returns the architecture of the platform, or `None` for `noarch`.
    pub const fn arch(self) -> Option<Arch> {
        match self {
            Platform::NoArch => None,
            Platform::Linux32 | Platform::Win32 => Some(Arch::X86),
            Platform::Linux64 | Platform::Osx64 | Platform::Win64 => Some(Arch::X86_64),
            Platform::LinuxAarch64 | Platform::OsxArm64 | Platform::WinArm64 => Some(Arch::Aarch64),
            Platform::LinuxArmV6l => Some(Arch::ArmV6l),
            Platform::LinuxArmV7l => Some(Arch::ArmV7l),
            Platform::LinuxPpc64le => Some(Arch::Ppc64le),
            Platform::LinuxPpc64 => Some(Arch::Ppc64),
            Platform::LinuxS390X => Some(Arch::S390X),
            Platform::LinuxRiscV64 => Some(Arch::RiscV64),
        }
    }
}

impl Arch {
    /// Returns the conda name for the architecture, e.g. `x86_64`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::ArmV6l => "armv6l",
            Arch::ArmV7l => "armv7l",
            Arch::Ppc64le => "ppc64le",
            Arch::Ppc64 => "ppc64",
            Arch::S390X => "s390x",
            Arch::RiscV64 => "riscv64",
        }
    }
}

impl FromStr for Platform {
    type Err = ParsePlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "noarch" => Platform::NoArch,
            "linux-32" => Platform::Linux32,
            "linux-64" => Platform::Linux64,
            "linux-aarch64" => Platform::LinuxAarch64,
            "linux-armv6l" => Platform::LinuxArmV6l,
            "linux-armv7l" => Platform::LinuxArmV7l,
            "linux-ppc64le" => Platform::LinuxPpc64le,
            "linux-ppc64" => Platform::LinuxPpc64,
            "linux-s390x" => Platform::LinuxS390X,
            "linux-riscv64" => Platform::LinuxRiscV64,
            "osx-64" => Platform::Osx64,
            "osx-arm64" => Platform::OsxArm64,
            "win-32" => Platform::Win32,
            "win-64" => Platform::Win64,
            "win-arm64" => Platform::WinArm64,
            string => {
                return Err(ParsePlatformError {
                    string: string.to_owned(),
                })
            }
        })
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.parse().map_err(serde::de::Error::custom)
    }
}
