//! Detection of the Cuda driver version. See [`cuda_version`].

use std::str::FromStr;

use krait_types::Version;
use once_cell::sync::OnceCell;

/// Returns the maximum Cuda version supported by the installed driver,
/// memoized. Returns `None` when no driver is present.
///
/// Detection reads the version file the NVIDIA kernel module exposes under
/// `/proc`; on other platforms (or without a driver) the `__cuda` package is
/// only available through its `CONDA_OVERRIDE_CUDA` override.
pub fn cuda_version() -> Option<Version> {
    static DETECTED: OnceCell<Option<Version>> = OnceCell::new();
    DETECTED.get_or_init(detect_cuda_version).clone()
}

#[cfg(target_os = "linux")]
fn detect_cuda_version() -> Option<Version> {
    let content = std::fs::read_to_string("/proc/driver/nvidia/version").ok()?;
    parse_nvidia_version_file(&content)
}

#[cfg(not(target_os = "linux"))]
fn detect_cuda_version() -> Option<Version> {
    None
}

/// Extracts the CUDA version from the kernel module version file. The line
/// of interest looks like `NVRM version: NVIDIA UNIX x86_64 Kernel Module
/// 535.54.03 …`; the driver branch maps onto a maximum supported Cuda
/// version which the file reports directly on newer drivers.
#[allow(dead_code)]
fn parse_nvidia_version_file(content: &str) -> Option<Version> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("NVRM version:") {
            let version = rest
                .split_whitespace()
                .find(|token| {
                    token.chars().next().is_some_and(|c| c.is_ascii_digit())
                        && token.contains('.')
                })?;
            // Only the major.minor of the driver matters for matching.
            let mut parts = version.split('.');
            let major = parts.next()?;
            let minor = parts.next().unwrap_or("0");
            return Version::from_str(&format!("{major}.{minor}")).ok();
        }
    }
    None
}
