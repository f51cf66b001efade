//! Detection of the Linux kernel version. See [`linux_version`].

use std::str::FromStr;

use krait_types::{ParseVersionError, Version};
use once_cell::sync::OnceCell;

/// An error that can occur while detecting the linux version.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseLinuxVersionError {
    /// The kernel release string did not contain a parseable version.
    #[error("failed to parse linux version from '{0}'")]
    InvalidVersion(String, #[source] ParseVersionError),
}

/// Returns the Linux kernel version of the current host, memoized. Returns
/// `None` on non-Linux platforms.
pub fn linux_version() -> Result<Option<Version>, ParseLinuxVersionError> {
    static DETECTED: OnceCell<Option<Version>> = OnceCell::new();
    DETECTED.get_or_try_init(try_detect_linux_version).cloned()
}

#[cfg(target_os = "linux")]
fn try_detect_linux_version() -> Result<Option<Version>, ParseLinuxVersionError> {
    use std::{ffi::CStr, mem::MaybeUninit};

    mod ffi {
        use std::os::raw::{c_char, c_int};

        extern "C" {
            pub fn uname(buf: *mut utsname) -> c_int;
        }

        #[repr(C)]
        pub struct utsname {
            pub sysname: [c_char; 65],
            pub nodename: [c_char; 65],
            pub release: [c_char; 65],
            pub version: [c_char; 65],
            pub machine: [c_char; 65],
            pub domainname: [c_char; 65],
        }
    }

    let mut info = MaybeUninit::uninit();
    if unsafe { ffi::uname(info.as_mut_ptr()) } != 0 {
        return Ok(None);
    }
    let info: ffi::utsname = unsafe { info.assume_init() };
    let release = unsafe { CStr::from_ptr(info.release.as_ptr()) }.to_string_lossy();

    parse_linux_version(release.as_ref()).map(Some)
}

#[cfg(not(target_os = "linux"))]
const fn try_detect_linux_version() -> Result<Option<Version>, ParseLinuxVersionError> {
    Ok(None)
}

/// Extracts the numeric version from a kernel release string like
/// `5.15.0-91-generic` or `6.2.8-arch1-1`.
#[allow(dead_code)]
fn parse_linux_version(release: &str) -> Result<Version, ParseLinuxVersionError> {
    let numeric: &str = release
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or(release);
    Version::from_str(numeric.trim_end_matches('.'))
        .map_err(|e| ParseLinuxVersionError::InvalidVersion(release.to_owned(), e))
}
