//! Channels are the sources of package information: a base url plus a set of
//! per-platform subdirectories. This module resolves the various ways a user
//! can refer to a channel (name, url, local path, direct package reference)
//! into concrete [`Channel`] values.

use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    str::FromStr,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
    utils::{path::is_path, url::parse_scheme},
    ParsePlatformError, Platform,
};

const DEFAULT_CHANNEL_ALIAS: &str = "https://conda.anaconda.org";

/// Describes properties required to turn an [`UnresolvedChannel`] into one or
/// more [`Channel`]s: the channel alias, the custom channel map and the
/// multichannel map, plus the directories against which local paths resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// The url that is prefixed to channel names that are not covered by the
    /// custom channel map. `None` means there is no alias configured, in which
    /// case unknown names fail to resolve.
    pub channel_alias: Option<Url>,

    /// Maps a channel name to a fully specified base url.
    #[serde(default)]
    pub custom_channels: IndexMap<String, Url>,

    /// Maps a name to a set of channel strings that it expands to.
    #[serde(default)]
    pub custom_multichannels: IndexMap<String, Vec<String>>,

    /// The directory against which relative local paths are resolved,
    /// usually the current working directory.
    pub root_dir: PathBuf,

    /// The directory `~` expands to.
    pub home_dir: PathBuf,
}

impl ChannelConfig {
    /// Creates a configuration with the default alias and no custom channels.
    pub fn default_with_root_dir(root_dir: PathBuf) -> Self {
        let home_dir = root_dir.clone();
        Self {
            channel_alias: Some(
                Url::parse(DEFAULT_CHANNEL_ALIAS).expect("default channel alias is a valid url"),
            ),
            custom_channels: IndexMap::new(),
            custom_multichannels: IndexMap::new(),
            root_dir,
            home_dir,
        }
    }

    /// Sets the home directory used for `~` expansion.
    pub fn with_home_dir(self, home_dir: PathBuf) -> Self {
        Self { home_dir, ..self }
    }

    /// Returns the display name for a base url: if the url extends the
    /// channel alias or one of the custom channels, the matching name plus
    /// the remaining path; otherwise the url itself.
    pub fn canonical_name(&self, base_url: &Url) -> String {
        let base = base_url.as_str().trim_end_matches('/');

        // The longest configured prefix determines the name.
        let mut best: Option<(usize, String)> = None;
        for (name, url) in &self.custom_channels {
            let prefix = url.as_str().trim_end_matches('/');
            if let Some(rest) = strip_url_prefix(base, prefix) {
                let candidate = join_name(name, rest);
                if best.as_ref().map_or(true, |(len, _)| prefix.len() > *len) {
                    best = Some((prefix.len(), candidate));
                }
            }
        }
        if let Some(alias) = &self.channel_alias {
            let prefix = alias.as_str().trim_end_matches('/');
            if let Some(rest) = strip_url_prefix(base, prefix) {
                let candidate = rest.trim_matches('/').to_owned();
                if best.as_ref().map_or(true, |(len, _)| prefix.len() > *len)
                    && !candidate.is_empty()
                {
                    best = Some((prefix.len(), candidate));
                }
            }
        }

        match best {
            Some((_, name)) => name,
            None => base.to_owned(),
        }
    }
}

/// Strips `prefix` from `url`, returning the remainder if `url` is `prefix`
/// itself or extends it with a path segment.
fn strip_url_prefix<'a>(url: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = url.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn join_name(name: &str, rest: &str) -> String {
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", name.trim_end_matches('/'), rest)
    }
}

/// The way a user referred to a channel, before resolution.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UnresolvedChannel {
    /// A bare name such as `conda-forge` or `pkgs/main`.
    Name {
        /// The channel name.
        name: String,
        /// Optional platform filter.
        platforms: Option<Vec<Platform>>,
    },

    /// A url to the channel root.
    Url {
        /// The base url.
        url: Url,
        /// Optional platform filter.
        platforms: Option<Vec<Platform>>,
    },

    /// A local directory.
    Path {
        /// The path as entered by the user.
        path: String,
        /// Optional platform filter.
        platforms: Option<Vec<Platform>>,
    },

    /// A url directly to a package archive.
    PackageUrl {
        /// The full package url.
        url: Url,
    },

    /// A local path directly to a package archive.
    PackagePath {
        /// The path as entered by the user.
        path: String,
    },
}

/// Error that can occur when parsing or resolving a channel.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ParseChannelError {
    /// The platform filter could not be parsed.
    #[error(transparent)]
    ParsePlatformError(#[from] ParsePlatformError),

    /// The url could not be parsed.
    #[error("invalid channel url '{0}'")]
    InvalidChannel(String),

    /// A name did not resolve to anything and no channel alias is configured.
    #[error("unknown channel '{0}' and no channel alias is configured")]
    UnknownChannel(String),

    /// The path could not be turned into a url.
    #[error("invalid path '{0}'")]
    InvalidPath(String),
}

/// Returns true if the location refers directly to a package archive.
fn is_package_file(location: &str) -> bool {
    location.ends_with(".conda") || location.ends_with(".tar.bz2")
}

impl UnresolvedChannel {
    /// Parses a user supplied channel string, classifying it as one of the
    /// five channel forms and splitting off a `[platform,…]` filter suffix.
    pub fn from_string(value: &str) -> Result<Self, ParseChannelError> {
        let (platforms, location) = parse_platform_filter(value.trim())?;
        let location = location.trim();

        if parse_scheme(location).is_some() {
            let url = Url::parse(location)
                .map_err(|_| ParseChannelError::InvalidChannel(location.to_owned()))?;
            if is_package_file(url.path()) {
                return Ok(UnresolvedChannel::PackageUrl { url });
            }
            return Ok(UnresolvedChannel::Url { url, platforms });
        }

        if is_path(location) {
            if is_package_file(location) {
                return Ok(UnresolvedChannel::PackagePath {
                    path: location.to_owned(),
                });
            }
            return Ok(UnresolvedChannel::Path {
                path: location.to_owned(),
                platforms,
            });
        }

        Ok(UnresolvedChannel::Name {
            name: location.trim_matches('/').to_owned(),
            platforms,
        })
    }

    /// Resolves this reference against the given configuration, producing one
    /// channel for every form except multichannel names which may expand to
    /// several.
    pub fn resolve(self, config: &ChannelConfig) -> Result<Vec<Channel>, ParseChannelError> {
        match self {
            UnresolvedChannel::Name { name, platforms } => {
                // Multichannels expand first and recursively.
                if let Some(members) = config.custom_multichannels.get(&name) {
                    let mut channels = Vec::with_capacity(members.len());
                    for member in members {
                        let unresolved = UnresolvedChannel::from_string(member)?;
                        // A multichannel member must not be a multichannel
                        // itself; resolving through `Name` again would recurse
                        // unboundedly on a self-referential configuration.
                        if let UnresolvedChannel::Name {
                            name: member_name, ..
                        } = &unresolved
                        {
                            if config.custom_multichannels.contains_key(member_name) {
                                return Err(ParseChannelError::InvalidChannel(
                                    member_name.clone(),
                                ));
                            }
                        }
                        let mut resolved = unresolved.resolve(config)?;
                        for channel in &mut resolved {
                            if channel.platforms.is_none() {
                                channel.platforms.clone_from(&platforms);
                            }
                        }
                        channels.append(&mut resolved);
                    }
                    return Ok(channels);
                }

                Ok(vec![resolve_name(&name, platforms, config)?])
            }
            UnresolvedChannel::Url { url, platforms } => {
                let mut channel = Channel::from_url(url);
                channel.name = Some(config.canonical_name(&channel.base_url));
                channel.platforms = platforms;
                Ok(vec![channel])
            }
            UnresolvedChannel::Path { path, platforms } => {
                let url = local_path_to_url(&path, config)?;
                Ok(vec![Channel {
                    platforms,
                    base_url: url,
                    name: Some(path),
                }])
            }
            UnresolvedChannel::PackageUrl { url } => Ok(vec![channel_for_package_url(url, None)]),
            UnresolvedChannel::PackagePath { path } => {
                let file_name = Path::new(&path)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| ParseChannelError::InvalidPath(path.clone()))?
                    .to_owned();
                let parent = match Path::new(&path).parent() {
                    Some(parent) => parent.to_string_lossy().into_owned(),
                    None => String::from("."),
                };
                let dir_url = local_path_to_url(&parent, config)?;
                let url = dir_url
                    .join(&file_name)
                    .map_err(|_| ParseChannelError::InvalidPath(path.clone()))?;
                Ok(vec![channel_for_package_url(url, Some(path))])
            }
        }
    }
}

/// Resolves a plain name through the custom channel map, falling back to the
/// channel alias. The longest custom channel key that prefixes the name wins.
fn resolve_name(
    name: &str,
    platforms: Option<Vec<Platform>>,
    config: &ChannelConfig,
) -> Result<Channel, ParseChannelError> {
    let mut best: Option<(&str, &Url)> = None;
    for (key, url) in &config.custom_channels {
        let key = key.trim_matches('/');
        if name == key || name.starts_with(&format!("{key}/")) {
            if best.map_or(true, |(k, _)| key.len() > k.len()) {
                best = Some((key, url));
            }
        }
    }

    let base_url = match best {
        Some((key, url)) => {
            let rest = name[key.len()..].trim_start_matches('/');
            extend_url(url, rest)
                .ok_or_else(|| ParseChannelError::InvalidChannel(name.to_owned()))?
        }
        None => {
            let alias = config
                .channel_alias
                .as_ref()
                .ok_or_else(|| ParseChannelError::UnknownChannel(name.to_owned()))?;
            extend_url(alias, name)
                .ok_or_else(|| ParseChannelError::InvalidChannel(name.to_owned()))?
        }
    };

    Ok(Channel {
        platforms,
        base_url,
        name: Some(name.to_owned()),
    })
}

/// Joins additional path segments onto a base url, keeping a trailing slash.
fn extend_url(base: &Url, rest: &str) -> Option<Url> {
    let mut url = base.clone();
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty();
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            segments.push(segment);
        }
        // Ensure the url ends in a `/` so that later joins treat it as a
        // directory.
        segments.push("");
    }
    Some(url)
}

/// Expands `~`, resolves relative paths and converts to a `file://` url.
fn local_path_to_url(path: &str, config: &ChannelConfig) -> Result<Url, ParseChannelError> {
    let expanded: PathBuf = if let Some(rest) = path.strip_prefix("~") {
        config
            .home_dir
            .join(rest.trim_start_matches(['/', '\\']))
    } else {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            config.root_dir.join(p)
        }
    };
    let normalized = normalize_path(&expanded);
    crate::utils::url::directory_path_to_url(&normalized)
        .map_err(|_| ParseChannelError::InvalidPath(path.to_owned()))
}

/// Lexically normalizes `.` and `..` components without touching the
/// filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}

/// Builds the channel that contains a direct package url: the base url is the
/// grand-parent of the archive when the parent directory is a platform
/// subdirectory.
fn channel_for_package_url(url: Url, name: Option<String>) -> Channel {
    let mut base = url.clone();
    let mut platforms = None;
    {
        if let Ok(mut segments) = base.path_segments_mut() {
            // Drop the file name.
            segments.pop();
        }
    }
    // If the directory holding the archive is a platform subdir, the channel
    // root is one level further up.
    let platform = base
        .path_segments()
        .and_then(|s| s.filter(|p| !p.is_empty()).next_back())
        .and_then(|s| Platform::from_str(s).ok());
    if let Some(platform) = platform {
        if let Ok(mut segments) = base.path_segments_mut() {
            segments.pop_if_empty();
            segments.pop();
            segments.push("");
        }
        platforms = Some(vec![platform]);
    }
    let mut channel = Channel::from_url(base);
    channel.platforms = platforms;
    if name.is_some() {
        channel.name = name;
    }
    channel
}

/// How a url relates to a channel, see [`Channel::contains`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Containment {
    /// The url is not part of the channel.
    None,

    /// The url extends the channel base url but is not inside one of the
    /// channel's platform subdirectories.
    Base,

    /// The url lies inside one of the channel's platform subdirectories.
    Full,
}

/// A resolved channel: the primary source of package information.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Channel {
    /// The platforms to query, or `None` to use the default set for the
    /// current system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<Platform>>,

    /// Base url of the channel; always ends in a `/`.
    pub base_url: Url,

    /// The display name of the channel.
    #[serde(default)]
    pub name: Option<String>,
}

impl Channel {
    /// Parses a channel from a string and a channel configuration. This is a
    /// convenience wrapper that takes the first channel produced by
    /// [`UnresolvedChannel::resolve`].
    pub fn from_str(
        value: impl AsRef<str>,
        config: &ChannelConfig,
    ) -> Result<Self, ParseChannelError> {
        let channels = UnresolvedChannel::from_string(value.as_ref())?.resolve(config)?;
        channels
            .into_iter()
            .next()
            .ok_or_else(|| ParseChannelError::InvalidChannel(value.as_ref().to_owned()))
    }

    /// Constructs a channel directly from a url, deriving the name from the
    /// url path.
    pub fn from_url(url: Url) -> Self {
        let path = url.path().trim_end_matches('/').to_owned();

        let base_url = if url.path().ends_with('/') {
            url
        } else {
            let mut url = url;
            url.set_path(&format!("{path}/"));
            url
        };

        let name = path.trim_start_matches('/');
        Self {
            platforms: None,
            name: (!name.is_empty()).then(|| name.to_owned()),
            base_url,
        }
    }

    /// Sets the explicit platforms of the channel.
    pub fn with_explicit_platforms(self, platforms: impl IntoIterator<Item = Platform>) -> Self {
        Self {
            platforms: Some(platforms.into_iter().collect()),
            ..self
        }
    }

    /// The display name of the channel.
    pub fn name(&self) -> &str {
        match self.base_url.scheme() {
            "http" | "https" => self
                .name
                .as_deref()
                .unwrap_or_else(|| self.base_url.as_str()),
            _ => self.base_url.as_str(),
        }
    }

    /// The canonical string form of the base url: no trailing slash unless
    /// the path is empty.
    pub fn canonical_name(&self) -> String {
        let s = self.base_url.as_str();
        if self.base_url.path() == "/" {
            s.to_owned()
        } else {
            s.trim_end_matches('/').to_owned()
        }
    }

    /// The url of a platform subdirectory.
    pub fn platform_url(&self, platform: Platform) -> Url {
        self.base_url
            // The trailing slash signifies a directory.
            .join(&format!("{}/", platform.as_str()))
            .expect("platform is a valid url fragment")
    }

    /// The platforms of this channel, or the defaults for the current system.
    pub fn platforms_or_default(&self) -> &[Platform] {
        match &self.platforms {
            Some(platforms) => platforms.as_slice(),
            None => default_platforms(),
        }
    }

    /// Returns whether two channels refer to the same location once
    /// credentials (userinfo and `/t/<token>/` segments) are stripped.
    pub fn equivalent(&self, other: &Channel) -> bool {
        strip_credentials(&self.base_url) == strip_credentials(&other.base_url)
    }

    /// Determines whether the given package url belongs to this channel.
    pub fn contains(&self, url: &Url) -> Containment {
        let own = strip_credentials(&self.base_url);
        let own = own.as_str().trim_end_matches('/');
        let other = strip_credentials(url);
        let Some(rest) = strip_url_prefix(other.as_str(), own) else {
            return Containment::None;
        };
        let mut segments = rest.trim_matches('/').split('/');
        match segments.next().map(Platform::from_str) {
            Some(Ok(platform)) if self.platforms_or_default().contains(&platform) => {
                Containment::Full
            }
            _ => Containment::Base,
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Removes userinfo and a `/t/<token>/` path segment from a url.
fn strip_credentials(url: &Url) -> Url {
    let mut url = url.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    if let Some(rest) = url.path().strip_prefix("/t/") {
        if let Some((_token, rest)) = rest.split_once('/') {
            let rest = rest.to_owned();
            url.set_path(&format!("/{rest}"));
        }
    }
    url
}

/// Extracts a `[platform,…]` suffix from a channel string.
fn parse_platform_filter(
    channel: &str,
) -> Result<(Option<Vec<Platform>>, &str), ParsePlatformError> {
    if channel.ends_with(']') {
        if let Some(idx) = channel.rfind('[') {
            let platforms = channel[idx + 1..channel.len() - 1]
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Platform::from_str)
                .collect::<Result<Vec<_>, _>>()?;
            let platforms = (!platforms.is_empty()).then_some(platforms);
            return Ok((platforms, &channel[..idx]));
        }
    }
    Ok((None, channel))
}

/// The default platform set: the current platform plus `noarch`.
pub(crate) const fn default_platforms() -> &'static [Platform] {
    const CURRENT: [Platform; 2] = [Platform::current(), Platform::NoArch];
    &CURRENT
}

#[cfg(test)]
mod tests;
