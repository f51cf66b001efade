//! `env export`: rendering an installed prefix back into an environment
//! file.

use std::collections::BTreeSet;

use crate::{
    ops::OpError,
    prefix::{Prefix, PrefixData},
};

/// Options for [`export_environment`].
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Produce an `@EXPLICIT` url list instead of YAML.
    pub explicit: bool,

    /// Leave the `#md5` fragments off explicit urls.
    pub no_md5: bool,

    /// Leave the build string off YAML specs.
    pub no_build: bool,

    /// Export the historically requested specs instead of the full installed
    /// set.
    pub from_history: bool,

    /// Prefix specs with `channel/subdir::` instead of `channel::`.
    pub channel_subdir: bool,
}

/// Renders the environment of a prefix as a YAML environment file or an
/// explicit url list.
pub fn export_environment(
    prefix: &Prefix,
    name: Option<&str>,
    options: &ExportOptions,
) -> Result<String, OpError> {
    let data = PrefixData::from_prefix(prefix)?;

    if options.explicit {
        let mut out = String::new();
        out.push_str("# This file may be used to create an environment using:\n");
        out.push_str("# $ krait create --name <env> --file <this file>\n");
        out.push_str("@EXPLICIT\n");
        for record in data.records() {
            let repodata = &record.repodata_record;
            out.push_str(repodata.url.as_str());
            if !options.no_md5 {
                if let Some(md5) = &repodata.package_record.md5 {
                    out.push_str(&format!("#{md5:x}"));
                }
            }
            out.push('\n');
        }
        return Ok(out);
    }

    let mut out = String::new();
    if let Some(name) = name {
        out.push_str(&format!("name: {name}\n"));
    }

    let mut channels: BTreeSet<String> = BTreeSet::new();
    for record in data.records() {
        channels.insert(record.repodata_record.channel.clone());
    }
    if !channels.is_empty() {
        out.push_str("channels:\n");
        for channel in &channels {
            out.push_str(&format!("  - {channel}\n"));
        }
    }

    out.push_str("dependencies:\n");
    if options.from_history {
        for (_, spec) in data.history().requested_specs_map()? {
            out.push_str(&format!("  - {spec}\n"));
        }
    } else {
        for record in data.records() {
            let package = &record.repodata_record.package_record;
            let channel_part = if options.channel_subdir {
                format!("{}/{}::", record.repodata_record.channel, package.subdir)
            } else {
                String::new()
            };
            if options.no_build {
                out.push_str(&format!(
                    "  - {channel_part}{}={}\n",
                    package.name.as_normalized(),
                    package.version
                ));
            } else {
                out.push_str(&format!(
                    "  - {channel_part}{}={}={}\n",
                    package.name.as_normalized(),
                    package.version,
                    package.build
                ));
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use krait_types::{PackageRecord, PrefixRecord, RepoDataRecord};
    use url::Url;

    use super::*;

    fn setup_prefix(dir: &std::path::Path) -> Prefix {
        let prefix = Prefix::create(dir).unwrap();
        let mut package_record = PackageRecord::for_test("foo", "1.0", "hbld_0", 0);
        package_record.md5 = krait_digest::parse_digest_from_hex::<krait_digest::Md5>(
            "d41d8cd98f00b204e9800998ecf8427e",
        );
        package_record.subdir = "linux-64".to_owned();
        let record = PrefixRecord::from_repodata_record(RepoDataRecord {
            package_record,
            file_name: "foo-1.0-hbld_0.conda".to_owned(),
            url: Url::parse("https://repo.example.com/ch/linux-64/foo-1.0-hbld_0.conda")
                .unwrap(),
            channel: "https://repo.example.com/ch".to_owned(),
        });
        record
            .write_to_path(prefix.conda_meta_dir().join(record.file_name()))
            .unwrap();
        prefix
    }

    #[test]
    fn test_yaml_export() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = setup_prefix(dir.path());
        let out = export_environment(
            &prefix,
            Some("test-env"),
            &ExportOptions::default(),
        )
        .unwrap();
        assert!(out.contains("name: test-env"));
        assert!(out.contains("- foo=1.0=hbld_0"));
        assert!(out.contains("https://repo.example.com/ch"));
    }

    #[test]
    fn test_yaml_export_no_build() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = setup_prefix(dir.path());
        let out = export_environment(
            &prefix,
            None,
            &ExportOptions {
                no_build: true,
                ..ExportOptions::default()
            },
        )
        .unwrap();
        assert!(out.contains("- foo=1.0\n"));
    }

    #[test]
    fn test_explicit_export() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = setup_prefix(dir.path());
        let out = export_environment(
            &prefix,
            None,
            &ExportOptions {
                explicit: true,
                ..ExportOptions::default()
            },
        )
        .unwrap();
        assert!(out.contains("@EXPLICIT"));
        assert!(out.contains(
            "https://repo.example.com/ch/linux-64/foo-1.0-hbld_0.conda#d41d8cd98f00b204e9800998ecf8427e"
        ));

        let without_md5 = export_environment(
            &prefix,
            None,
            &ExportOptions {
                explicit: true,
                no_md5: true,
                ..ExportOptions::default()
            },
        )
        .unwrap();
        assert!(!without_md5.contains('#') || !without_md5.contains("d41d8cd"));
    }

    #[test]
    fn test_channel_subdir_export() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = setup_prefix(dir.path());
        let out = export_environment(
            &prefix,
            None,
            &ExportOptions {
                channel_subdir: true,
                ..ExportOptions::default()
            },
        )
        .unwrap();
        assert!(out.contains("- https://repo.example.com/ch/linux-64::foo=1.0=hbld_0"));
    }
}
