//! The operation configuration: the YAML `.kraitrc` keys plus their
//! environment variable overrides.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use indexmap::IndexMap;
use krait_index::LocalTtl;
use krait_net::{ClientOptions, ProxyConfig, SslVerify};
use krait_solve::ChannelPriority;
use krait_types::{ChannelConfig, Platform};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::install::LinkOptions;

/// How strictly installed files are verified during linking.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyChecks {
    /// Path-level problems abort the transaction.
    Enabled,

    /// Path-level problems are logged and the transaction proceeds.
    #[default]
    Warn,

    /// No path-level verification at all.
    Disabled,
}

/// An error produced while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The configuration file is not valid YAML.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Two options contradict each other.
    #[error("contradictory configuration: {0}")]
    Contradiction(String),

    /// A url-valued option failed to parse.
    #[error("'{1}' is not a valid url for option '{0}'")]
    InvalidUrl(String, String),
}

/// The operation configuration.
///
/// Only the keys themselves are handled here; discovering and layering
/// multiple configuration files is the job of the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The channels to search, highest priority first.
    pub channels: Vec<String>,

    /// The url that bare channel names are joined onto.
    pub channel_alias: Option<String>,

    /// Named channels with explicit base urls.
    pub custom_channels: IndexMap<String, String>,

    /// Names that expand to several channels.
    pub custom_multichannels: IndexMap<String, Vec<String>>,

    /// The channels that the `defaults` multichannel expands to.
    pub default_channels: Vec<String>,

    /// Mirrors per channel base url.
    pub mirrors: IndexMap<String, Vec<String>>,

    /// Proxy servers keyed by scheme (`http`, `https`, `all`).
    pub proxy_servers: HashMap<String, String>,

    /// TLS verification: `true`, `false` or a path to a CA bundle.
    pub ssl_verify: SslVerifyConfig,

    /// The package cache directories; the first is used for writing.
    pub pkgs_dirs: Vec<PathBuf>,

    /// Specs that are pinned in every solve.
    pub pinned_packages: Vec<String>,

    /// Link-time verification level.
    pub safety_checks: SafetyChecks,

    /// Whether to re-hash every file during extraction validation.
    pub extra_safety_checks: bool,

    /// How channel order influences the solver.
    pub channel_priority: ChannelPriorityConfig,

    /// Always create symbolic links instead of hard links.
    pub always_softlink: bool,

    /// Always copy files instead of linking.
    pub always_copy: bool,

    /// Permit the symbolic link fallback when hard links are impossible.
    pub allow_softlinks: bool,

    /// Flush the index caches and retry once when a solve fails.
    pub retry_clean_cache: bool,

    /// Index cache TTL; `0` = always refresh, `1` = respect the server.
    pub local_repodata_ttl: u64,

    /// The number of parallel downloads.
    pub download_threads: usize,

    /// The number of parallel extractions.
    pub extract_threads: usize,

    /// How often a transient download failure is retried.
    pub max_retries: u32,

    /// The base delay between retries, in seconds.
    pub retry_timeout: u64,

    /// The exponent applied to the retry delay.
    pub retry_backoff: u32,

    /// The TCP connect timeout, in seconds.
    pub connect_timeout_secs: u64,

    /// Abort a transfer when no data arrives for this long, in seconds.
    pub read_timeout_secs: u64,

    /// The platform to solve for, defaulting to the current one.
    pub platform: Option<Platform>,
}

/// TLS verification as it appears in configuration: a boolean or a CA bundle
/// path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SslVerifyConfig {
    /// `true` (system trust store) or `false` (no verification).
    Flag(bool),

    /// A path to a CA bundle.
    Path(PathBuf),
}

impl Default for SslVerifyConfig {
    fn default() -> Self {
        SslVerifyConfig::Flag(true)
    }
}

/// Channel priority as spelled in configuration files.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPriorityConfig {
    /// See [`ChannelPriority::Strict`].
    Strict,

    /// See [`ChannelPriority::Flexible`].
    #[default]
    Flexible,

    /// See [`ChannelPriority::Disabled`].
    Disabled,
}

impl From<ChannelPriorityConfig> for ChannelPriority {
    fn from(config: ChannelPriorityConfig) -> Self {
        match config {
            ChannelPriorityConfig::Strict => ChannelPriority::Strict,
            ChannelPriorityConfig::Flexible => ChannelPriority::Flexible,
            ChannelPriorityConfig::Disabled => ChannelPriority::Disabled,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            channel_alias: None,
            custom_channels: IndexMap::new(),
            custom_multichannels: IndexMap::new(),
            default_channels: Vec::new(),
            mirrors: IndexMap::new(),
            proxy_servers: HashMap::new(),
            ssl_verify: SslVerifyConfig::default(),
            pkgs_dirs: Vec::new(),
            pinned_packages: Vec::new(),
            safety_checks: SafetyChecks::default(),
            extra_safety_checks: false,
            channel_priority: ChannelPriorityConfig::default(),
            always_softlink: false,
            always_copy: false,
            allow_softlinks: true,
            retry_clean_cache: true,
            local_repodata_ttl: 1,
            download_threads: 5,
            extract_threads: 5,
            max_retries: 3,
            retry_timeout: 2,
            retry_backoff: 3,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            platform: None,
        }
    }
}

impl Config {
    /// Parses a configuration from YAML and validates it.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&fs_err::read_to_string(path)?)
    }

    /// Applies the supported environment variable overrides on top of the
    /// file values.
    pub fn apply_env_overrides(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(channels) = var("CONDA_CHANNELS") {
            self.channels = split_list(&channels);
        }
        if let Some(alias) = var("KRAIT_CHANNEL_ALIAS") {
            self.channel_alias = Some(alias);
        }
        if let Some(dirs) = var("CONDA_PKGS_DIRS") {
            self.pkgs_dirs = split_list(&dirs).into_iter().map(PathBuf::from).collect();
        }
        if let Some(defaults) = var("KRAIT_DEFAULT_CHANNELS") {
            self.default_channels = split_list(&defaults);
        }
        if let Some(pinned) = var("KRAIT_PINNED_PACKAGES") {
            self.pinned_packages = split_list(&pinned);
        }
        if let Some(value) = var("KRAIT_SSL_VERIFY") {
            self.ssl_verify = match value.as_str() {
                "true" | "<system>" => SslVerifyConfig::Flag(true),
                "false" | "<false>" => SslVerifyConfig::Flag(false),
                path => SslVerifyConfig::Path(PathBuf::from(path)),
            };
        }
        if let Some(path) = var("KRAIT_CACERT_PATH").or_else(|| var("REQUESTS_CA_BUNDLE")) {
            self.ssl_verify = SslVerifyConfig::Path(PathBuf::from(path));
        }
        if let Some(checks) = var("KRAIT_SAFETY_CHECKS") {
            self.safety_checks = match checks.as_str() {
                "enabled" => SafetyChecks::Enabled,
                "disabled" => SafetyChecks::Disabled,
                _ => SafetyChecks::Warn,
            };
        }
        if let Some(platform) = var("CONDA_SUBDIR") {
            match platform.parse() {
                Ok(platform) => self.platform = Some(platform),
                Err(_) => tracing::warn!("ignoring invalid CONDA_SUBDIR '{}'", platform),
            }
        }
    }

    /// Checks the option combinations that are rejected at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.always_copy && self.always_softlink {
            return Err(ConfigError::Contradiction(
                "always_copy and always_softlink cannot both be set".to_owned(),
            ));
        }
        if self.always_softlink && !self.allow_softlinks {
            return Err(ConfigError::Contradiction(
                "always_softlink requires allow_softlinks".to_owned(),
            ));
        }
        Ok(())
    }

    /// The platform this operation targets.
    pub fn target_platform(&self) -> Platform {
        self.platform.unwrap_or(Platform::current())
    }

    /// Builds the channel configuration used to resolve channel strings.
    pub fn channel_config(
        &self,
        root_dir: PathBuf,
        home_dir: PathBuf,
    ) -> Result<ChannelConfig, ConfigError> {
        let mut base = ChannelConfig::default_with_root_dir(root_dir).with_home_dir(home_dir);
        if let Some(alias) = &self.channel_alias {
            base.channel_alias = Some(
                Url::parse(alias)
                    .map_err(|_| ConfigError::InvalidUrl("channel_alias".into(), alias.clone()))?,
            );
        }
        for (name, url) in &self.custom_channels {
            base.custom_channels.insert(
                name.clone(),
                Url::parse(url).map_err(|_| {
                    ConfigError::InvalidUrl(format!("custom_channels.{name}"), url.clone())
                })?,
            );
        }
        base.custom_multichannels = self.custom_multichannels.clone();
        if !self.default_channels.is_empty() {
            base.custom_multichannels
                .insert("defaults".to_owned(), self.default_channels.clone());
        }
        Ok(base)
    }

    /// Builds the HTTP client options.
    pub fn client_options(&self) -> Result<ClientOptions, ConfigError> {
        let ssl_verify = match &self.ssl_verify {
            SslVerifyConfig::Flag(true) => SslVerify::System,
            SslVerifyConfig::Flag(false) => SslVerify::Insecure,
            SslVerifyConfig::Path(path) => SslVerify::CaBundle(path.clone()),
        };

        let mut proxies = ProxyConfig::default();
        for (scheme, url) in &self.proxy_servers {
            let url = Url::parse(url).map_err(|_| {
                ConfigError::InvalidUrl(format!("proxy_servers.{scheme}"), url.clone())
            })?;
            proxies.servers.insert(scheme.clone(), url);
        }

        let mut mirrors = HashMap::new();
        for (base, targets) in &self.mirrors {
            let mut urls = Vec::with_capacity(targets.len());
            for target in targets {
                urls.push(Url::parse(target).map_err(|_| {
                    ConfigError::InvalidUrl(format!("mirrors.{base}"), target.clone())
                })?);
            }
            mirrors.insert(base.clone(), urls);
        }

        Ok(ClientOptions {
            ssl_verify,
            proxies,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            mirrors,
            ..ClientOptions::default()
        })
    }

    /// The index cache TTL as an explicit policy.
    pub fn local_ttl(&self) -> LocalTtl {
        LocalTtl::from_config_value(self.local_repodata_ttl)
    }

    /// The retry policy for package downloads.
    pub fn retry_policy(&self) -> krait_net::retry::ExponentialBackoff {
        krait_net::retry::retry_policy(
            self.max_retries,
            Duration::from_secs(self.retry_timeout),
            self.retry_backoff,
        )
    }

    /// The validated link options.
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            allow_softlinks: self.allow_softlinks,
            always_copy: self.always_copy,
            always_softlink: self.always_softlink,
        }
    }

    /// The directory the package cache lives in.
    pub fn package_cache_dir(&self, root_prefix: &Path) -> PathBuf {
        self.pkgs_dirs
            .first()
            .cloned()
            .unwrap_or_else(|| root_prefix.join("pkgs"))
    }

    /// The directory the index cache lives in: `<pkgs>/cache`.
    pub fn index_cache_dir(&self, root_prefix: &Path) -> PathBuf {
        self.package_cache_dir(root_prefix).join("cache")
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_yaml_str(
            r#"
channels:
  - conda-forge
  - bioconda
channel_alias: https://repo.example.com
custom_channels:
  internal: https://intranet.example.com/conda
ssl_verify: true
channel_priority: strict
pinned_packages:
  - python 3.11.*
local_repodata_ttl: 3600
download_threads: 8
"#,
        )
        .unwrap();
        assert_eq!(config.channels, vec!["conda-forge", "bioconda"]);
        assert_eq!(config.channel_priority, ChannelPriorityConfig::Strict);
        assert_eq!(config.local_ttl(), LocalTtl::Seconds(3600));
        assert_eq!(config.download_threads, 8);
        // Unset options keep their defaults.
        assert!(config.allow_softlinks);
    }

    #[test]
    fn test_ssl_verify_variants() {
        let config = Config::from_yaml_str("ssl_verify: false").unwrap();
        assert!(matches!(config.ssl_verify, SslVerifyConfig::Flag(false)));

        let config = Config::from_yaml_str("ssl_verify: /etc/ssl/bundle.pem").unwrap();
        assert!(matches!(config.ssl_verify, SslVerifyConfig::Path(_)));
    }

    #[test]
    fn test_contradictory_link_options_are_rejected() {
        let result = Config::from_yaml_str("always_copy: true\nalways_softlink: true");
        assert!(matches!(result, Err(ConfigError::Contradiction(_))));

        let result = Config::from_yaml_str("always_softlink: true\nallow_softlinks: false");
        assert!(matches!(result, Err(ConfigError::Contradiction(_))));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(Config::from_yaml_str("no_such_option: 1").is_err());
    }

    #[test]
    fn test_ttl_overloading() {
        assert_eq!(
            Config::from_yaml_str("local_repodata_ttl: 0")
                .unwrap()
                .local_ttl(),
            LocalTtl::AlwaysUpdate
        );
        assert_eq!(
            Config::from_yaml_str("local_repodata_ttl: 1")
                .unwrap()
                .local_ttl(),
            LocalTtl::RespectHeader
        );
    }

    #[test]
    fn test_default_channels_become_multichannel() {
        let config = Config::from_yaml_str(
            "default_channels:\n  - pkgs/main\n  - pkgs/r\n",
        )
        .unwrap();
        let channel_config = config
            .channel_config(PathBuf::from("/"), PathBuf::from("/"))
            .unwrap();
        assert_eq!(
            channel_config.custom_multichannels.get("defaults"),
            Some(&vec!["pkgs/main".to_owned(), "pkgs/r".to_owned()])
        );
    }
}
