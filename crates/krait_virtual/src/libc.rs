//! Detection of the libc family and version. See [`libc_family_and_version`].

use krait_types::{ParseVersionError, Version};
use once_cell::sync::OnceCell;

/// An error that can occur while detecting the libc version.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DetectLibCError {
    /// The version string reported by the system did not parse.
    #[error("failed to parse the libc version reported by the system")]
    ParseLibCVersion(#[from] ParseVersionError),
}

/// Returns the libc family and version of the current host, memoized.
/// Returns `None` when the platform does not expose a libc version.
pub fn libc_family_and_version() -> Result<Option<(String, Version)>, DetectLibCError> {
    static DETECTED: OnceCell<Option<(String, Version)>> = OnceCell::new();
    DETECTED.get_or_try_init(try_detect_libc_version).cloned()
}

#[cfg(unix)]
mod ffi {
    use std::os::raw::{c_char, c_int};

    pub const CS_GNU_LIBC_VERSION: c_int = 2;
    pub const CS_GNU_LIBPTHREAD_VERSION: c_int = 3;

    extern "C" {
        pub fn confstr(name: c_int, buf: *mut c_char, length: usize) -> usize;
    }
}

#[cfg(unix)]
fn try_detect_libc_version() -> Result<Option<(String, Version)>, DetectLibCError> {
    use std::str::FromStr;

    let version = match [ffi::CS_GNU_LIBC_VERSION, ffi::CS_GNU_LIBPTHREAD_VERSION]
        .into_iter()
        .find_map(|name| confstr(name).flatten())
    {
        Some(version) => version,
        None => return Ok(None),
    };

    // The string is of the form `glibc 2.35` or `NPTL 2.35`.
    let Some((family, version)) = version.split_once(' ') else {
        return Ok(None);
    };
    let family = match family {
        "NPTL" => String::from("glibc"),
        other => other.to_owned(),
    };
    Ok(Some((family, Version::from_str(version.trim())?)))
}

#[cfg(not(unix))]
const fn try_detect_libc_version() -> Result<Option<(String, Version)>, DetectLibCError> {
    Ok(None)
}

/// Calls `confstr` with the given name, returning `None` when the system does
/// not know the variable.
#[cfg(unix)]
fn confstr(name: std::os::raw::c_int) -> Option<Option<String>> {
    let len = match unsafe { ffi::confstr(name, std::ptr::null_mut(), 0) } {
        0 => return Some(None),
        len => len,
    };
    let mut bytes = vec![0u8; len];
    if unsafe { ffi::confstr(name, bytes.as_mut_ptr().cast(), bytes.len()) } == 0 {
        return Some(None);
    }
    // Drop the trailing nul.
    bytes.pop();
    String::from_utf8(bytes).ok().map(Some)
}

#[cfg(test)]
mod test {
    #[test]
    fn test_detection_does_not_crash() {
        let result = super::libc_family_and_version();
        #[cfg(target_os = "linux")]
        if let Ok(Some((family, _version))) = &result {
            assert_eq!(family, "glibc");
        }
        let _ = result;
    }
}
