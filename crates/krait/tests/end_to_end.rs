//! End-to-end tests driving the full pipeline against a local channel:
//! resolve channels, load repodata, solve, fetch into the package cache and
//! link into a prefix.

use std::io::Write;
use std::path::{Path, PathBuf};

use krait::{
    ops::{self, OpContext},
    Config, Prefix, PrefixData,
};
use krait_types::{ExplicitEnvironmentSpec, MatchSpec, Platform};

/// Builds a package archive and returns `(file name, sha256 hex)`.
fn write_package(
    subdir: &Path,
    name: &str,
    version: &str,
    depends: &[&str],
    files: &[(&str, &str)],
) -> (String, String) {
    let index_json = format!(
        r#"{{"name": "{name}", "version": "{version}", "build": "0", "build_number": 0, "depends": [{}], "subdir": "linux-64"}}"#,
        depends
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let paths = files
        .iter()
        .map(|(path, content)| {
            let digest = krait_digest::compute_bytes_digest::<krait_digest::Sha256>(content);
            format!(
                r#"{{"_path": "{path}", "path_type": "hardlink", "sha256": "{digest:x}", "size_in_bytes": {}}}"#,
                content.len()
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    let paths_json = format!(r#"{{"paths_version": 1, "paths": [{paths}]}}"#);

    let file_name = format!("{name}-{version}-0.tar.bz2");
    let archive_path = subdir.join(&file_name);
    let file = fs_err::File::create(&archive_path).unwrap();
    let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
    {
        let mut builder = tar::Builder::new(&mut encoder);
        let mut append = |path: &str, content: &str| {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        };
        append("info/index.json", &index_json);
        append("info/paths.json", &paths_json);
        for (path, content) in files {
            append(path, content);
        }
        builder.finish().unwrap();
    }
    encoder.finish().unwrap().flush().unwrap();

    let sha256 =
        krait_digest::compute_file_digest::<krait_digest::Sha256>(&archive_path).unwrap();
    (file_name, format!("{sha256:x}"))
}

/// Writes a `repodata.json` for the packages in a subdir.
fn write_repodata(subdir: &Path, packages: &[(String, String, &str, &str, Vec<&str>)]) {
    let entries = packages
        .iter()
        .map(|(file_name, sha256, name, version, depends)| {
            format!(
                r#""{file_name}": {{"build": "0", "build_number": 0, "depends": [{}], "name": "{name}", "sha256": "{sha256}", "subdir": "linux-64", "version": "{version}"}}"#,
                depends
                    .iter()
                    .map(|d| format!("\"{d}\""))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    let repodata =
        format!(r#"{{"info": {{"subdir": "linux-64"}}, "packages": {{{entries}}}}}"#);
    fs_err::write(subdir.join("repodata.json"), repodata).unwrap();
}

struct TestSetup {
    _root: tempfile::TempDir,
    channel_dir: PathBuf,
    ctx: OpContext,
    prefix_path: PathBuf,
}

fn setup() -> TestSetup {
    let root = tempfile::tempdir().unwrap();
    let channel_dir = root.path().join("channel");
    let subdir = channel_dir.join("linux-64");
    fs_err::create_dir_all(&subdir).unwrap();

    let lib = write_package(&subdir, "lib", "2.0", &[], &[("lib/liblib.so", "library")]);
    let lib_old = write_package(&subdir, "lib", "1.0", &[], &[("lib/liblib.so", "old library")]);
    let app = write_package(
        &subdir,
        "app",
        "1.0",
        &["lib >=2"],
        &[("bin/app", "#!/bin/sh\necho app\n")],
    );
    write_repodata(
        &subdir,
        &[
            (lib.0, lib.1, "lib", "2.0", vec![]),
            (lib_old.0, lib_old.1, "lib", "1.0", vec![]),
            (app.0, app.1, "app", "1.0", vec!["lib >=2"]),
        ],
    );

    let config = Config {
        platform: Some(Platform::Linux64),
        channels: vec![channel_dir.to_str().unwrap().to_owned()],
        ..Config::default()
    };
    let ctx = OpContext::new(config, root.path(), "krait test".to_owned()).unwrap();
    let prefix_path = root.path().join("envs/test");

    TestSetup {
        channel_dir,
        ctx,
        prefix_path,
        _root: root,
    }
}

#[tokio::test]
async fn test_create_install_remove_cycle() {
    let setup = setup();

    // Create an environment with `app`; `lib` comes along as a dependency.
    let result = ops::create(
        &setup.ctx,
        &setup.prefix_path,
        &[],
        vec!["app".parse::<MatchSpec>().unwrap()],
    )
    .await
    .unwrap();
    assert_eq!(result.linked.len(), 2);

    let prefix = Prefix::existing(&setup.prefix_path);
    assert!(setup.prefix_path.join("bin/app").is_file());
    assert!(setup.prefix_path.join("lib/liblib.so").is_file());

    let data = PrefixData::from_prefix(&prefix).unwrap();
    assert_eq!(data.records().count(), 2);
    // The newer lib was selected.
    assert_eq!(
        data.get("lib")
            .unwrap()
            .repodata_record
            .package_record
            .version
            .to_string(),
        "2.0"
    );

    // The journal records the request.
    let entries = data.history().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].update_specs, vec!["app"]);

    // Installing the same spec again is a no-op.
    let result = ops::install(
        &setup.ctx,
        &prefix,
        &[],
        vec!["app".parse::<MatchSpec>().unwrap()],
    )
    .await
    .unwrap();
    assert!(result.linked.is_empty());
    assert!(result.unlinked.is_empty());

    // Removing `app` also removes the now-orphaned `lib`.
    let result = ops::remove(&setup.ctx, &prefix, &[], vec!["app".to_owned()], false)
        .await
        .unwrap();
    assert_eq!(result.unlinked.len(), 2);
    assert!(!setup.prefix_path.join("bin/app").exists());

    let data = PrefixData::from_prefix(&prefix).unwrap();
    assert_eq!(data.records().count(), 0);
}

#[tokio::test]
async fn test_unsolvable_spec_reports_explanation() {
    let setup = setup();
    let error = ops::create(
        &setup.ctx,
        &setup.prefix_path,
        &[],
        vec!["app >=99".parse::<MatchSpec>().unwrap()],
    )
    .await
    .unwrap_err();
    let message = error.to_string();
    assert!(message.contains("app"), "unexpected message: {message}");
}

#[tokio::test]
async fn test_explicit_install() {
    let setup = setup();

    // Export-style explicit file pointing straight at the archive.
    let archive = setup.channel_dir.join("linux-64/app-1.0-0.tar.bz2");
    let url = url::Url::from_file_path(&archive).unwrap();
    let spec_text = format!("# platform: linux-64\n@EXPLICIT\n{url}\n");
    let spec: ExplicitEnvironmentSpec = spec_text.parse().unwrap();

    let prefix = Prefix::create(&setup.prefix_path).unwrap();
    let result = ops::install_explicit(&setup.ctx, &prefix, &spec)
        .await
        .unwrap();
    assert_eq!(result.linked.len(), 1);
    assert!(setup.prefix_path.join("bin/app").is_file());

    let data = PrefixData::from_prefix(&prefix).unwrap();
    assert!(data.get("app").is_some());
    let entries = data.history().entries().unwrap();
    assert!(entries[0]
        .link_dists
        .contains(&"app-1.0-0".to_owned()));
}

#[tokio::test]
async fn test_update_picks_newer_version() {
    let setup = setup();

    // Install the old lib explicitly.
    let result = ops::create(
        &setup.ctx,
        &setup.prefix_path,
        &[],
        vec!["lib ==1.0".parse::<MatchSpec>().unwrap()],
    )
    .await
    .unwrap();
    assert_eq!(result.linked.len(), 1);

    let prefix = Prefix::existing(&setup.prefix_path);

    // `update lib` relaxes the historical `lib ==1.0` request and unlocks
    // the installed version, so the solver moves to 2.0.
    let result = ops::update(&setup.ctx, &prefix, &[], vec!["lib".to_owned()])
        .await
        .unwrap();
    assert_eq!(result.linked.len(), 1);
    assert_eq!(result.unlinked.len(), 1);
    let data = PrefixData::from_prefix(&prefix).unwrap();
    assert_eq!(
        data.get("lib")
            .unwrap()
            .repodata_record
            .package_record
            .version
            .to_string(),
        "2.0"
    );
}

#[tokio::test]
async fn test_export_round_trip() {
    let setup = setup();
    ops::create(
        &setup.ctx,
        &setup.prefix_path,
        &[],
        vec!["app".parse::<MatchSpec>().unwrap()],
    )
    .await
    .unwrap();

    let prefix = Prefix::existing(&setup.prefix_path);
    let explicit = ops::export_environment(
        &prefix,
        None,
        &ops::ExportOptions {
            explicit: true,
            ..ops::ExportOptions::default()
        },
    )
    .unwrap();
    assert!(explicit.contains("@EXPLICIT"));
    assert!(explicit.contains("app-1.0-0.tar.bz2"));

    // The explicit export can be parsed back and applied to a fresh prefix.
    let spec: ExplicitEnvironmentSpec = explicit.parse().unwrap();
    let other_prefix_path = setup.prefix_path.with_file_name("clone");
    let other_prefix = Prefix::create(&other_prefix_path).unwrap();
    let result = ops::install_explicit(&setup.ctx, &other_prefix, &spec)
        .await
        .unwrap();
    assert_eq!(result.linked.len(), 2);
    assert!(other_prefix_path.join("bin/app").is_file());
}

#[tokio::test]
async fn test_from_history_export() {
    let setup = setup();
    ops::create(
        &setup.ctx,
        &setup.prefix_path,
        &[],
        vec!["app".parse::<MatchSpec>().unwrap()],
    )
    .await
    .unwrap();

    let prefix = Prefix::existing(&setup.prefix_path);
    let exported = ops::export_environment(
        &prefix,
        Some("test"),
        &ops::ExportOptions {
            from_history: true,
            ..ops::ExportOptions::default()
        },
    )
    .unwrap();
    // Only the requested spec appears, not the dependency.
    assert!(exported.contains("- app"));
    assert!(!exported.contains("- lib"));
}
