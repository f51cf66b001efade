//! `info`: a description of the environment krait operates in.

use std::path::PathBuf;

use krait_types::{GenericVirtualPackage, Platform};
use krait_virtual::{VirtualPackage, VirtualPackageOverrides};
use serde::Serialize;

use crate::ops::{OpContext, OpError};

/// The data behind `krait info`.
#[derive(Debug, Serialize)]
pub struct Info {
    /// The target platform.
    pub platform: Platform,

    /// The active prefix, if any.
    pub active_prefix: Option<PathBuf>,

    /// The package cache location.
    pub pkgs_dir: PathBuf,

    /// The configured channels, resolved to urls.
    pub channels: Vec<String>,

    /// The virtual packages of the host.
    pub virtual_packages: Vec<String>,
}

/// Collects the information.
pub fn info(ctx: &OpContext, active_prefix: Option<PathBuf>) -> Result<Info, OpError> {
    let channels = ctx
        .resolve_channels(&[])?
        .iter()
        .map(|channel| channel.base_url.to_string())
        .collect();

    let virtual_packages = VirtualPackage::detect_generic(&VirtualPackageOverrides::default())?
        .into_iter()
        .map(|package: GenericVirtualPackage| package.to_string())
        .collect();

    Ok(Info {
        platform: ctx.config.target_platform(),
        active_prefix,
        pkgs_dir: ctx.package_cache.path().to_path_buf(),
        channels,
        virtual_packages,
    })
}

impl std::fmt::Display for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "       platform : {}", self.platform)?;
        match &self.active_prefix {
            Some(prefix) => writeln!(f, "  active prefix : {}", prefix.display())?,
            None => writeln!(f, "  active prefix : (none)")?,
        }
        writeln!(f, "       pkgs dir : {}", self.pkgs_dir.display())?;
        writeln!(f, "       channels :")?;
        for channel in &self.channels {
            writeln!(f, "                  {channel}")?;
        }
        writeln!(f, "   virtual pkgs :")?;
        for package in &self.virtual_packages {
            writeln!(f, "                  {package}")?;
        }
        Ok(())
    }
}
