//! Installing from `@EXPLICIT` lock files and plain spec files.

use std::{path::Path, str::FromStr};

use krait_types::{
    package::ArchiveIdentifier, ExplicitEnvironmentSpec, MatchSpec, PackageArchiveHash,
    PackageRecord, RepoDataRecord, VersionWithSource,
};

use crate::{
    install::{InstallerResult, Transaction},
    ops::{OpContext, OpError},
    prefix::{Prefix, PrefixData},
};

/// Installs the packages of an explicit environment spec, in file order,
/// without consulting a solver or any index.
pub async fn install_explicit(
    ctx: &OpContext,
    prefix: &Prefix,
    spec: &ExplicitEnvironmentSpec,
) -> Result<InstallerResult, OpError> {
    if let Some(platform) = spec.platform {
        let target = ctx.config.target_platform();
        if platform != target && platform != krait_types::Platform::NoArch {
            tracing::warn!(
                "the explicit file was exported for {} but the target platform is {}",
                platform,
                target
            );
        }
    }

    let mut records = Vec::with_capacity(spec.packages.len());
    let mut specs = Vec::with_capacity(spec.packages.len());
    for entry in &spec.packages {
        let url = entry.url_without_fragment();
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_owned();
        let identifier = ArchiveIdentifier::try_from_filename(&file_name)
            .ok_or_else(|| OpError::InvalidSpec(entry.url.to_string()))?;

        let mut package_record = PackageRecord::new(
            identifier
                .name
                .parse()
                .map_err(|_| OpError::InvalidSpec(entry.url.to_string()))?,
            VersionWithSource::from_str(&identifier.version)
                .map_err(|_| OpError::InvalidSpec(entry.url.to_string()))?,
            identifier.build_string.clone(),
        );

        // The subdir is the parent directory of the archive.
        if let Some(subdir) = url
            .path_segments()
            .and_then(|segments| segments.rev().nth(1))
        {
            package_record.subdir = subdir.to_owned();
        }

        match entry
            .package_archive_hash()
            .map_err(|_| OpError::InvalidSpec(entry.url.to_string()))?
        {
            Some(PackageArchiveHash::Md5(md5)) => package_record.md5 = Some(md5),
            Some(PackageArchiveHash::Sha256(sha256)) => package_record.sha256 = Some(sha256),
            None => {}
        }

        specs.push(
            MatchSpec::from_str(&format!(
                "{}={}={}",
                package_record.name.as_normalized(),
                package_record.version,
                package_record.build,
            ))
            .expect("a record identity is a valid spec"),
        );
        records.push(RepoDataRecord {
            package_record,
            file_name,
            channel: {
                let mut channel = url.clone();
                channel.set_fragment(None);
                channel
                    .as_str()
                    .rsplit_once('/')
                    .map(|(base, _)| base.to_owned())
                    .unwrap_or_default()
            },
            url,
        });
    }

    let prefix_data = PrefixData::from_prefix(prefix)?;
    let transaction = Transaction::from_current_and_desired(
        prefix_data.records().cloned().collect(),
        records,
        ctx.config.target_platform(),
    )?;

    ctx.installer()
        .execute(prefix, transaction, ctx.request("install", &specs, &[]))
        .await
        .map_err(Into::into)
}

/// Parses a plain requirements file: one spec per line, `#` comments
/// ignored.
pub fn parse_spec_file(path: &Path) -> Result<Vec<MatchSpec>, OpError> {
    let content = fs_err::read_to_string(path)?;
    let mut specs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        specs.push(
            MatchSpec::from_str(line).map_err(|_| OpError::InvalidSpec(line.to_owned()))?,
        );
    }
    Ok(specs)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_spec_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        fs_err::write(&path, "# a comment\npython >=3.9\n\nnumpy\n").unwrap();
        let specs = parse_spec_file(&path).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].to_string(), "python >=3.9");
    }

    #[test]
    fn test_parse_spec_file_invalid_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        fs_err::write(&path, "=!=bogus\n").unwrap();
        assert!(matches!(
            parse_spec_file(&path),
            Err(OpError::InvalidSpec(_))
        ));
    }
}
