//! The command implementations: argument structs plus the glue that calls
//! into the library.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use clap::Parser;
use krait::{
    execution::InterruptGuard,
    install::InstallerResult,
    ops::{self, CleanOptions, ExportOptions, OpContext},
    Config, Prefix, PrefixData,
};
use krait_types::{EnvironmentYaml, ExplicitEnvironmentSpec, MatchSpec};

/// Builds the operation context from configuration and environment.
pub fn build_context(
    rc_file: Option<&Path>,
    command_line: String,
) -> anyhow::Result<OpContext> {
    let mut config = match rc_file {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let default_path = root_prefix().join(".kraitrc");
            if default_path.is_file() {
                Config::from_path(&default_path)
                    .with_context(|| format!("failed to load {}", default_path.display()))?
            } else {
                Config::default()
            }
        }
    };
    config.apply_env_overrides();
    OpContext::new(config, &root_prefix(), command_line).map_err(Into::into)
}

/// The root prefix: `$KRAIT_ROOT_PREFIX` or `~/.krait`.
fn root_prefix() -> PathBuf {
    if let Some(root) = std::env::var_os("KRAIT_ROOT_PREFIX") {
        return PathBuf::from(root);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".krait")
}

/// The active prefix: `--prefix`, `--name`, `$KRAIT_PREFIX` or the root
/// prefix's base environment.
fn target_prefix(name: Option<&str>, prefix: Option<&Path>) -> PathBuf {
    if let Some(prefix) = prefix {
        return prefix.to_path_buf();
    }
    if let Some(name) = name {
        return root_prefix().join("envs").join(name);
    }
    if let Some(prefix) = std::env::var_os("KRAIT_PREFIX") {
        return PathBuf::from(prefix);
    }
    root_prefix()
}

fn parse_specs(specs: &[String]) -> anyhow::Result<Vec<MatchSpec>> {
    specs
        .iter()
        .map(|spec| {
            MatchSpec::from_str(spec).with_context(|| format!("invalid spec '{spec}'"))
        })
        .collect()
}

fn print_result(result: &InstallerResult, json: bool) {
    if json {
        let payload = serde_json::json!({
            "success": true,
            "linked": result.linked.iter()
                .map(|r| r.repodata_record.package_record.dist_str())
                .collect::<Vec<_>>(),
            "unlinked": result.unlinked.iter()
                .map(|r| r.repodata_record.package_record.dist_str())
                .collect::<Vec<_>>(),
        });
        println!("{payload}");
        return;
    }
    if result.linked.is_empty() && result.unlinked.is_empty() {
        println!("nothing to do");
        return;
    }
    for record in &result.unlinked {
        println!("- {}", record.repodata_record.package_record);
    }
    for record in &result.linked {
        println!("+ {}", record.repodata_record.package_record);
    }
}

/// Arguments for `krait install`.
#[derive(Debug, Parser)]
pub struct InstallOpt {
    /// The specs to install.
    specs: Vec<String>,

    /// The channels to use.
    #[clap(short, long)]
    channel: Vec<String>,

    /// The name of the target environment.
    #[clap(short, long)]
    name: Option<String>,

    /// The path of the target environment.
    #[clap(short, long)]
    prefix: Option<PathBuf>,

    /// Read specs from files (`@EXPLICIT`, YAML or plain lists).
    #[clap(short, long)]
    file: Vec<PathBuf>,
}

pub async fn install(ctx: &OpContext, opt: InstallOpt, json: bool) -> anyhow::Result<()> {
    let _guard = interrupt_guard(ctx);
    let prefix = Prefix::create(target_prefix(opt.name.as_deref(), opt.prefix.as_deref()))?;

    let mut channels = opt.channel.clone();
    let mut specs = parse_specs(&opt.specs)?;
    for file in &opt.file {
        if let Some(result) =
            install_from_file(ctx, &prefix, file, &mut channels, &mut specs).await?
        {
            print_result(&result, json);
            return Ok(());
        }
    }

    let result = ops::install(ctx, &prefix, &channels, specs).await?;
    print_result(&result, json);
    Ok(())
}

/// Handles one `--file` argument. `@EXPLICIT` files short-circuit the solve
/// entirely; YAML and plain files contribute channels and specs.
async fn install_from_file(
    ctx: &OpContext,
    prefix: &Prefix,
    file: &Path,
    channels: &mut Vec<String>,
    specs: &mut Vec<MatchSpec>,
) -> anyhow::Result<Option<InstallerResult>> {
    let content = fs_err::read_to_string(file)?;
    if content.lines().any(|line| line.trim() == "@EXPLICIT") {
        let explicit = ExplicitEnvironmentSpec::from_str(&content)?;
        return Ok(Some(ops::install_explicit(ctx, prefix, &explicit).await?));
    }
    if file
        .extension()
        .is_some_and(|ext| ext == "yml" || ext == "yaml")
    {
        let environment =
            EnvironmentYaml::from_yaml_str(&content, ctx.config.target_platform())?;
        channels.extend(environment.channels.iter().cloned());
        specs.extend(environment.match_specs().cloned());
        if let Some(pip) = environment.pip_requirements() {
            tracing::warn!(
                "{} pip requirement(s) in {} are not installed by krait",
                pip.len(),
                file.display()
            );
        }
    } else {
        specs.extend(ops::parse_spec_file(file)?);
    }
    Ok(None)
}

/// Arguments for `krait create`.
#[derive(Debug, Parser)]
pub struct CreateOpt {
    #[clap(flatten)]
    install: InstallOpt,
}

pub async fn create(ctx: &OpContext, opt: CreateOpt, json: bool) -> anyhow::Result<()> {
    install(ctx, opt.install, json).await
}

/// Arguments for `krait update`.
#[derive(Debug, Parser)]
pub struct UpdateOpt {
    /// The packages to update.
    packages: Vec<String>,

    /// Update every non-pinned package.
    #[clap(long, conflicts_with = "packages")]
    all: bool,

    /// The channels to use.
    #[clap(short, long)]
    channel: Vec<String>,

    /// The name of the target environment.
    #[clap(short, long)]
    name: Option<String>,

    /// The path of the target environment.
    #[clap(short, long)]
    prefix: Option<PathBuf>,
}

pub async fn update(ctx: &OpContext, opt: UpdateOpt, json: bool) -> anyhow::Result<()> {
    let _guard = interrupt_guard(ctx);
    let prefix = Prefix::existing(target_prefix(opt.name.as_deref(), opt.prefix.as_deref()));
    let names = if opt.all { Vec::new() } else { opt.packages };
    let result = ops::update(ctx, &prefix, &opt.channel, names).await?;
    print_result(&result, json);
    Ok(())
}

/// Arguments for `krait remove`.
#[derive(Debug, Parser)]
pub struct RemoveOpt {
    /// The packages to remove.
    packages: Vec<String>,

    /// Remove every package and delete the prefix.
    #[clap(long, conflicts_with = "packages")]
    all: bool,

    /// The name of the target environment.
    #[clap(short, long)]
    name: Option<String>,

    /// The path of the target environment.
    #[clap(short, long)]
    prefix: Option<PathBuf>,
}

pub async fn remove(ctx: &OpContext, opt: RemoveOpt, json: bool) -> anyhow::Result<()> {
    let _guard = interrupt_guard(ctx);
    let prefix = Prefix::existing(target_prefix(opt.name.as_deref(), opt.prefix.as_deref()));
    let result = ops::remove(ctx, &prefix, &[], opt.packages, opt.all).await?;
    print_result(&result, json);
    Ok(())
}

/// Arguments for `krait list`.
#[derive(Debug, Parser)]
pub struct ListOpt {
    /// Only list packages whose name matches this regular expression.
    regex: Option<String>,

    /// The name of the target environment.
    #[clap(short, long)]
    name: Option<String>,

    /// The path of the target environment.
    #[clap(short, long)]
    prefix: Option<PathBuf>,
}

pub fn list(opt: ListOpt, json: bool) -> anyhow::Result<()> {
    let prefix = Prefix::existing(target_prefix(opt.name.as_deref(), opt.prefix.as_deref()));
    let records = ops::list(&prefix, opt.regex.as_deref())?;
    if json {
        let payload: Vec<_> = records
            .iter()
            .map(|r| &r.repodata_record.package_record)
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for record in records {
            let package = &record.repodata_record.package_record;
            println!(
                "{:<30} {:<15} {:<20} {}",
                package.name.as_normalized(),
                package.version,
                package.build,
                record.repodata_record.channel,
            );
        }
    }
    Ok(())
}

/// Arguments for `krait clean`.
#[derive(Debug, Parser)]
pub struct CleanOpt {
    /// Purge everything.
    #[clap(long)]
    all: bool,

    /// Purge the index caches.
    #[clap(long)]
    index_cache: bool,

    /// Purge unused extracted packages.
    #[clap(long)]
    packages: bool,

    /// Purge downloaded archives.
    #[clap(long)]
    tarballs: bool,

    /// Purge stale lock files.
    #[clap(long)]
    locks: bool,
}

pub fn clean(ctx: &OpContext, opt: CleanOpt) -> anyhow::Result<()> {
    let options = if opt.all {
        CleanOptions::all()
    } else {
        CleanOptions {
            index_cache: opt.index_cache,
            packages: opt.packages,
            tarballs: opt.tarballs,
            locks: opt.locks,
        }
    };

    // Packages still linked from existing environments are preserved.
    let mut in_use = HashSet::new();
    let envs_dir = root_prefix().join("envs");
    if let Ok(entries) = fs_err::read_dir(&envs_dir) {
        for entry in entries.flatten() {
            let prefix = Prefix::existing(entry.path());
            if let Ok(data) = PrefixData::from_prefix(&prefix) {
                for record in data.records() {
                    in_use.insert(record.repodata_record.package_record.dist_str());
                }
            }
        }
    }

    let report = ops::clean(ctx, &options, &in_use)?;
    println!(
        "removed {} index cache file(s), {} package dir(s), {} tarball(s), {} lock(s)",
        report.index_cache_files, report.package_dirs, report.tarballs, report.locks
    );
    Ok(())
}

/// Arguments for `krait info`.
#[derive(Debug, Parser)]
pub struct InfoOpt {
    /// Print information about the base (root) prefix instead of the active
    /// one.
    #[clap(long)]
    base: bool,
}

pub fn info(ctx: &OpContext, opt: InfoOpt, json: bool) -> anyhow::Result<()> {
    let active = if opt.base {
        Some(root_prefix())
    } else {
        std::env::var_os("KRAIT_PREFIX").map(PathBuf::from)
    };
    let info = ops::info(ctx, active)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print!("{info}");
    }
    Ok(())
}

/// The `krait env` subcommands.
#[derive(Debug, clap::Subcommand)]
pub enum EnvCommand {
    /// Export a prefix as an environment file.
    Export(EnvExportOpt),

    /// List the known environments.
    List,

    /// Create an environment from an environment file.
    Create(InstallOpt),

    /// Update an environment from an environment file.
    Update(InstallOpt),

    /// Remove an entire environment.
    Remove(RemoveOpt),
}

/// Arguments for `krait env export`.
#[derive(Debug, Parser)]
pub struct EnvExportOpt {
    /// The name of the environment to export.
    #[clap(short, long)]
    name: Option<String>,

    /// The path of the environment to export.
    #[clap(short, long)]
    prefix: Option<PathBuf>,

    /// Produce an `@EXPLICIT` url list.
    #[clap(short, long)]
    explicit: bool,

    /// Leave md5 hashes off explicit urls.
    #[clap(long)]
    no_md5: bool,

    /// Leave build strings off the specs.
    #[clap(long)]
    no_build: bool,

    /// Export the requested history instead of the full installed set.
    #[clap(long)]
    from_history: bool,

    /// Include `channel/subdir::` prefixes in the specs.
    #[clap(long)]
    channel_subdir: bool,
}

pub async fn env(ctx: &OpContext, command: EnvCommand, json: bool) -> anyhow::Result<()> {
    match command {
        EnvCommand::Export(opt) => {
            let prefix =
                Prefix::existing(target_prefix(opt.name.as_deref(), opt.prefix.as_deref()));
            let rendered = ops::export_environment(
                &prefix,
                opt.name.as_deref(),
                &ExportOptions {
                    explicit: opt.explicit,
                    no_md5: opt.no_md5,
                    no_build: opt.no_build,
                    from_history: opt.from_history,
                    channel_subdir: opt.channel_subdir,
                },
            )?;
            print!("{rendered}");
            Ok(())
        }
        EnvCommand::List => {
            let envs_dir = root_prefix().join("envs");
            println!("{}", root_prefix().display());
            if let Ok(entries) = fs_err::read_dir(&envs_dir) {
                for entry in entries.flatten() {
                    println!("{}", entry.path().display());
                }
            }
            Ok(())
        }
        EnvCommand::Create(opt) | EnvCommand::Update(opt) => install(ctx, opt, json).await,
        EnvCommand::Remove(opt) => remove(ctx, opt, json).await,
    }
}

/// Wires Ctrl-C into the context's cancellation token for the duration of an
/// operation.
fn interrupt_guard(ctx: &OpContext) -> InterruptGuard {
    let guard = InterruptGuard::new();
    let token = guard.token();
    let cancellation = ctx.cancellation.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        cancellation.cancel();
    });
    guard
}
