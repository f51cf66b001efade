//! Detection of the macOS version. See [`osx_version`].

use krait_types::{ParseVersionError, Version};
use once_cell::sync::OnceCell;

/// An error that can occur while detecting the macOS version.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseOsxVersionError {
    /// The system version file did not contain a product version.
    #[error("could not determine the macOS product version")]
    Missing,

    /// The product version did not parse.
    #[error(transparent)]
    InvalidVersion(#[from] ParseVersionError),
}

/// Returns the macOS product version, memoized. Returns `None` on other
/// platforms.
pub fn osx_version() -> Result<Option<Version>, ParseOsxVersionError> {
    static DETECTED: OnceCell<Option<Version>> = OnceCell::new();
    DETECTED.get_or_try_init(try_detect_osx_version).cloned()
}

#[cfg(target_os = "macos")]
fn try_detect_osx_version() -> Result<Option<Version>, ParseOsxVersionError> {
    let content =
        std::fs::read_to_string("/System/Library/CoreServices/SystemVersion.plist")
            .map_err(|_| ParseOsxVersionError::Missing)?;
    parse_product_version(&content).map(Some)
}

#[cfg(not(target_os = "macos"))]
const fn try_detect_osx_version() -> Result<Option<Version>, ParseOsxVersionError> {
    Ok(None)
}

/// Extracts `ProductVersion` from the `SystemVersion.plist` XML.
#[allow(dead_code)]
fn parse_product_version(plist: &str) -> Result<Version, ParseOsxVersionError> {
    use std::str::FromStr;

    let key_pos = plist
        .find("<key>ProductVersion</key>")
        .ok_or(ParseOsxVersionError::Missing)?;
    let rest = &plist[key_pos..];
    let start = rest
        .find("<string>")
        .ok_or(ParseOsxVersionError::Missing)?
        + "<string>".len();
    let end = rest[start..]
        .find("</string>")
        .ok_or(ParseOsxVersionError::Missing)?;
    Ok(Version::from_str(rest[start..start + end].trim())?)
}
