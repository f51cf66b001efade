//! The high-level operations: one function per user-facing command.
//!
//! Every operation follows the same request-driven shape: resolve channels,
//! load their indexes, solve, build one transaction and execute it. The
//! parallelism lives below (concurrent index loads and downloads); control
//! flow up here is strictly sequential.

mod clean;
mod explicit;
mod export;
mod info;
mod list;
mod reconcile;

use std::{path::PathBuf, str::FromStr, sync::Arc};

use futures::future::try_join_all;
use krait_cache::PackageCache;
use krait_index::{CacheAction, FetchRepoDataOptions, LoadRepoDataError, SubdirData};
use krait_net::AuthenticationStore;
use krait_solve::{ChannelPriority, SolveError, SolverTask};
use krait_types::{
    Channel, MatchSpec, ParseChannelError, Platform, RepoDataRecord, UnresolvedChannel,
};
use krait_virtual::{DetectVirtualPackageError, VirtualPackage, VirtualPackageOverrides};
use reqwest_middleware::ClientWithMiddleware;
use tokio_util::sync::CancellationToken;

pub use clean::{clean, CleanOptions, CleanReport};
pub use explicit::{install_explicit, parse_spec_file};
pub use export::{export_environment, ExportOptions};
pub use info::{info, Info};
pub use list::list;
pub use reconcile::reconcile;

use crate::{
    config::{Config, ConfigError},
    install::{
        Installer, InstallerError, InstallerResult, RequestDescription, Transaction,
        TransactionError,
    },
    prefix::{Prefix, PrefixData, PrefixError},
};

/// An error produced by one of the operations.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A channel could not be resolved.
    #[error(transparent)]
    Channel(#[from] ParseChannelError),

    /// A channel index could not be loaded.
    #[error(transparent)]
    RepoData(#[from] LoadRepoDataError),

    /// The solver failed.
    #[error(transparent)]
    Solve(#[from] SolveError),

    /// The transaction could not be constructed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// The transaction failed to execute.
    #[error(transparent)]
    Installer(#[from] InstallerError),

    /// The prefix could not be read or locked.
    #[error(transparent)]
    Prefix(#[from] PrefixError),

    /// The prefix journal could not be read.
    #[error(transparent)]
    History(#[from] krait_types::HistoryError),

    /// Virtual package detection failed.
    #[error(transparent)]
    VirtualPackages(#[from] DetectVirtualPackageError),

    /// The HTTP client could not be constructed.
    #[error(transparent)]
    Client(#[from] krait_net::ClientBuildError),

    /// An invalid spec was supplied.
    #[error("invalid spec '{0}'")]
    InvalidSpec(String),

    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
}

/// Everything one operation needs: configuration, client, caches and the
/// interrupt flag. Constructed once per command invocation.
pub struct OpContext {
    /// The loaded configuration.
    pub config: Config,

    /// The channel resolution configuration.
    pub channel_config: krait_types::ChannelConfig,

    /// The shared HTTP client.
    pub client: ClientWithMiddleware,

    /// The shared package cache.
    pub package_cache: PackageCache,

    /// The directory the index cache lives in.
    pub index_cache_dir: PathBuf,

    /// The process-wide interrupt flag.
    pub cancellation: CancellationToken,

    /// The command line, recorded in the journal.
    pub command_line: String,
}

impl OpContext {
    /// Builds a context from configuration. `root_prefix` is the directory
    /// holding `pkgs/` and `envs/`.
    pub fn new(
        config: Config,
        root_prefix: &std::path::Path,
        command_line: String,
    ) -> Result<Self, OpError> {
        config.validate()?;

        let auth_store = match std::env::var("KRAIT_AUTH_FILE") {
            Ok(path) => AuthenticationStore::from_file(std::path::Path::new(&path))?,
            Err(_) => AuthenticationStore::empty(),
        };
        let client = krait_net::build_client(&config.client_options()?, Arc::new(auth_store))?;

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.clone());
        let channel_config = config.channel_config(cwd, home)?;

        let package_cache = PackageCache::new(config.package_cache_dir(root_prefix));
        let index_cache_dir = config.index_cache_dir(root_prefix);

        Ok(Self {
            config,
            channel_config,
            client,
            package_cache,
            index_cache_dir,
            cancellation: CancellationToken::new(),
            command_line,
        })
    }

    /// Resolves channel strings, falling back to the configured channel
    /// list.
    pub fn resolve_channels(&self, channels: &[String]) -> Result<Vec<Channel>, OpError> {
        let strings = if channels.is_empty() {
            &self.config.channels
        } else {
            channels
        };
        let mut resolved = Vec::new();
        for value in strings {
            resolved.extend(
                UnresolvedChannel::from_string(value)?.resolve(&self.channel_config)?,
            );
        }
        Ok(resolved)
    }

    /// The installer configured for this operation.
    pub fn installer(&self) -> Installer {
        Installer {
            package_cache: self.package_cache.clone(),
            client: self.client.clone(),
            link_options: self.config.link_options(),
            safety_checks: self.config.safety_checks,
            extra_safety_checks: self.config.extra_safety_checks,
            download_concurrency: self.config.download_threads,
            retry_policy: self.config.retry_policy(),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Loads the records of every `(channel, platform)` pair, concurrently.
    pub async fn load_channel_records(
        &self,
        channels: &[Channel],
        cache_action: CacheAction,
    ) -> Result<Vec<RepoDataRecord>, OpError> {
        let platform = self.config.target_platform();
        let mut subdirs = Vec::new();
        for channel in channels {
            let platforms = match &channel.platforms {
                Some(platforms) => platforms.clone(),
                None => vec![platform, Platform::NoArch],
            };
            for platform in platforms {
                subdirs.push(SubdirData::new(
                    channel.clone(),
                    platform,
                    self.client.clone(),
                    self.index_cache_dir.clone(),
                ));
            }
        }

        let options = FetchRepoDataOptions {
            cache_action,
            local_ttl: self.config.local_ttl(),
        };
        let loads = subdirs.iter().map(|subdir| {
            let options = options.clone();
            async move {
                match subdir.load(options).await {
                    Ok(records) => Ok(records),
                    // A channel that simply lacks one of its subdirs (a
                    // noarch-only local channel, say) is tolerated.
                    Err(LoadRepoDataError::Fetch(
                        krait_index::FetchRepoDataError::NotFound(url),
                    )) => {
                        tracing::warn!("no repodata at {}, skipping", url);
                        Ok(Vec::new())
                    }
                    Err(e) => Err(OpError::from(e)),
                }
            }
        });

        let results = tokio::select! {
            () = self.cancellation.cancelled() => return Err(OpError::Cancelled),
            results = try_join_all(loads) => results?,
        };
        Ok(results.into_iter().flatten().collect())
    }

    /// The hard pins of this operation: configured pins, the
    /// `conda-meta/pinned` file and the implicit python pin.
    fn collect_pins(
        &self,
        prefix_data: &PrefixData,
        specs: &[MatchSpec],
    ) -> Result<Vec<MatchSpec>, OpError> {
        let mut pins = Vec::new();
        for pinned in &self.config.pinned_packages {
            pins.push(
                MatchSpec::from_str(pinned)
                    .map_err(|_| OpError::InvalidSpec(pinned.clone()))?,
            );
        }

        let pinned_file = prefix_data.prefix().conda_meta_dir().join("pinned");
        if let Ok(content) = fs_err::read_to_string(&pinned_file) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                pins.push(
                    MatchSpec::from_str(line)
                        .map_err(|_| OpError::InvalidSpec(line.to_owned()))?,
                );
            }
        }

        // Python is implicitly pinned to its installed minor version unless
        // the user asked for a specific python.
        let python_requested = specs
            .iter()
            .any(|spec| spec.name.as_ref().map(|n| n.as_normalized()) == Some("python"));
        if !python_requested {
            if let Some(python) = prefix_data.get("python") {
                let version = &python.repodata_record.package_record.version;
                if let (Some(major), Some(minor)) =
                    (version.version().major(), version.version().minor())
                {
                    pins.push(
                        MatchSpec::from_str(&format!("python {major}.{minor}.*"))
                            .expect("the implicit python pin is a valid spec"),
                    );
                }
            }
        }

        Ok(pins)
    }

    /// Runs the solver, retrying once with invalidated index caches when the
    /// first attempt fails and `retry_clean_cache` is enabled.
    async fn solve_with_retry(
        &self,
        channels: &[Channel],
        prefix_data: &PrefixData,
        specs: Vec<MatchSpec>,
        locked: Vec<RepoDataRecord>,
    ) -> Result<Vec<RepoDataRecord>, OpError> {
        let pins = self.collect_pins(prefix_data, &specs)?;
        let virtual_packages =
            VirtualPackage::detect_generic(&VirtualPackageOverrides::default())?;
        let channel_order: Vec<String> =
            channels.iter().map(Channel::canonical_name).collect();

        let mut cache_action = CacheAction::CacheOrFetch;
        let mut remaining_attempts = if self.config.retry_clean_cache { 2 } else { 1 };
        loop {
            remaining_attempts -= 1;
            let available = self.load_channel_records(channels, cache_action).await?;
            let task = SolverTask {
                available_packages: available,
                channel_order: channel_order.clone(),
                channel_priority: ChannelPriority::from(self.config.channel_priority),
                locked_packages: locked.clone(),
                pinned_packages: Vec::new(),
                pins: pins.clone(),
                virtual_packages: virtual_packages.clone(),
                specs: specs.clone(),
                allow_downgrade: false,
            };
            match krait_solve::solve(&task) {
                Ok(records) => return Ok(records),
                Err(e @ SolveError::Unsolvable(_)) if remaining_attempts > 0 => {
                    tracing::warn!(
                        "solve failed ({}), refreshing the index caches and retrying",
                        e
                    );
                    cache_action = CacheAction::ForceFetch;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn request(&self, action: &str, update: &[MatchSpec], remove: &[MatchSpec]) -> RequestDescription {
        RequestDescription {
            command: self.command_line.clone(),
            action: action.to_owned(),
            update_specs: update.to_vec(),
            remove_specs: remove.to_vec(),
        }
    }
}

/// Merges the historically requested specs with newly requested ones; a new
/// spec replaces the historical request for the same name.
fn merge_requested_specs(
    historical: Vec<MatchSpec>,
    new: &[MatchSpec],
) -> Vec<MatchSpec> {
    let mut merged: Vec<MatchSpec> = historical
        .into_iter()
        .filter(|spec| {
            spec.name.as_ref().map_or(false, |name| {
                !new.iter().any(|n| n.name.as_ref() == Some(name))
            })
        })
        .collect();
    merged.extend(new.iter().cloned());
    merged
}

/// Installs the given specs into the prefix.
pub async fn install(
    ctx: &OpContext,
    prefix: &Prefix,
    channels: &[String],
    specs: Vec<MatchSpec>,
) -> Result<InstallerResult, OpError> {
    let channels = ctx.resolve_channels(channels)?;
    let prefix_data = PrefixData::from_prefix(prefix)?;

    let requested = merge_requested_specs(prefix_data.requested_specs()?, &specs);
    let locked = prefix_data.installed_repodata_records();
    let solution = ctx
        .solve_with_retry(&channels, &prefix_data, requested, locked)
        .await?;

    let transaction = Transaction::from_current_and_desired(
        prefix_data.records().cloned().collect(),
        solution,
        ctx.config.target_platform(),
    )?;

    ctx.installer()
        .execute(prefix, transaction, ctx.request("install", &specs, &[]))
        .await
        .map_err(Into::into)
}

/// Creates a prefix (which must not contain packages yet) and installs into
/// it.
pub async fn create(
    ctx: &OpContext,
    prefix_path: &std::path::Path,
    channels: &[String],
    specs: Vec<MatchSpec>,
) -> Result<InstallerResult, OpError> {
    let prefix = Prefix::create(prefix_path)?;
    install(ctx, &prefix, channels, specs).await
}

/// Updates the named packages, or every non-pinned package when `names` is
/// empty.
pub async fn update(
    ctx: &OpContext,
    prefix: &Prefix,
    channels: &[String],
    names: Vec<String>,
) -> Result<InstallerResult, OpError> {
    let channels = ctx.resolve_channels(channels)?;
    let prefix_data = PrefixData::from_prefix(prefix)?;

    // Updating a package means relaxing its historical version constraint to
    // a bare name and dropping its installed record from the locked set, so
    // the solver is free to pick something newer.
    let update_all = names.is_empty();
    let is_update_target = |name: &str| {
        update_all || names.iter().any(|n| n == name)
    };
    let requested: Vec<MatchSpec> = prefix_data
        .requested_specs()?
        .into_iter()
        .map(|spec| match &spec.name {
            Some(name) if is_update_target(name.as_normalized()) => {
                MatchSpec::from_name(name.clone())
            }
            _ => spec,
        })
        .collect();

    let locked: Vec<RepoDataRecord> = prefix_data
        .installed_repodata_records()
        .into_iter()
        .filter(|record| !is_update_target(record.package_record.name.as_normalized()))
        .collect();

    let solution = ctx
        .solve_with_retry(&channels, &prefix_data, requested.clone(), locked)
        .await?;

    let transaction = Transaction::from_current_and_desired(
        prefix_data.records().cloned().collect(),
        solution,
        ctx.config.target_platform(),
    )?;

    ctx.installer()
        .execute(prefix, transaction, ctx.request("update", &requested, &[]))
        .await
        .map_err(Into::into)
}

/// Removes the named packages (and any packages only installed to support
/// them). With `remove_all` the entire prefix is deleted.
pub async fn remove(
    ctx: &OpContext,
    prefix: &Prefix,
    channels: &[String],
    names: Vec<String>,
    remove_all: bool,
) -> Result<InstallerResult, OpError> {
    if remove_all {
        let unlinked = PrefixData::from_prefix(prefix)?
            .records()
            .cloned()
            .collect();
        fs_err::remove_dir_all(prefix.path())?;
        return Ok(InstallerResult {
            linked: Vec::new(),
            unlinked,
        });
    }

    let channels = ctx.resolve_channels(channels)?;
    let prefix_data = PrefixData::from_prefix(prefix)?;

    let remove_specs: Vec<MatchSpec> = names
        .iter()
        .map(|name| {
            MatchSpec::from_str(name).map_err(|_| OpError::InvalidSpec(name.clone()))
        })
        .collect::<Result<_, _>>()?;

    // The desired state is a fresh solve of everything the user still wants:
    // the removed packages and their orphaned dependencies fall out of it.
    let requested: Vec<MatchSpec> = prefix_data
        .requested_specs()?
        .into_iter()
        .filter(|spec| {
            !remove_specs
                .iter()
                .any(|r| r.name.as_ref() == spec.name.as_ref())
        })
        .collect();

    let locked = prefix_data.installed_repodata_records();
    let solution = ctx
        .solve_with_retry(&channels, &prefix_data, requested, locked)
        .await?;

    let transaction = Transaction::from_current_and_desired(
        prefix_data.records().cloned().collect(),
        solution,
        ctx.config.target_platform(),
    )?;

    ctx.installer()
        .execute(
            prefix,
            transaction,
            ctx.request("remove", &[], &remove_specs),
        )
        .await
        .map_err(Into::into)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_merge_requested_specs() {
        let historical = vec![
            MatchSpec::from_str("python >=3.9").unwrap(),
            MatchSpec::from_str("numpy").unwrap(),
        ];
        let new = vec![MatchSpec::from_str("python >=3.11").unwrap()];
        let merged = merge_requested_specs(historical, &new);
        assert_eq!(merged.len(), 2);
        assert!(merged
            .iter()
            .any(|s| s.to_string() == "python >=3.11"));
        assert!(merged.iter().any(|s| s.to_string() == "numpy"));
    }
}
