//! Defines [`MatchSpec`], a partial constraint over package records.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use krait_digest::{Md5Hash, Sha256Hash};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use url::Url;

use crate::{
    PackageName, PackageRecord, ParsePackageNameError, ParseVersionSpecError, VersionSpec,
};

/// Matches a string against a pattern that may contain `*` wildcards.
///
/// Build strings in specs are usually either exact (`h1234567_0`) or a glob
/// (`py38*`). A pattern without wildcards is an exact match.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct StringMatcher {
    pattern: String,
}

impl StringMatcher {
    /// Returns true if the given string matches the pattern.
    pub fn matches(&self, value: &str) -> bool {
        fn glob_match(pattern: &str, value: &str) -> bool {
            match pattern.split_once('*') {
                None => pattern == value,
                Some((prefix, rest)) => {
                    let Some(remainder) = value.strip_prefix(prefix) else {
                        return false;
                    };
                    if rest.is_empty() {
                        return true;
                    }
                    // Try every position for the segment after the `*`.
                    (0..=remainder.len()).any(|skip| {
                        remainder.is_char_boundary(skip) && glob_match(rest, &remainder[skip..])
                    })
                }
            }
        }
        glob_match(&self.pattern, value)
    }

    /// Returns the original pattern.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

impl FromStr for StringMatcher {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            pattern: s.to_owned(),
        })
    }
}

impl Display for StringMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

/// A partial constraint describing a set of acceptable package records.
///
/// String form: `[channel[/subdir]::]name[ version[ build]][[key=value,…]]`,
/// e.g. `conda-forge::python >=3.9,<3.12` or `foo=1.2=py38*` or
/// `bar[md5=d41d8cd98f00b204e9800998ecf8427e]`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Default)]
pub struct MatchSpec {
    /// The name of the package.
    pub name: Option<PackageName>,

    /// A constraint on the version.
    pub version: Option<VersionSpec>,

    /// A constraint on the build string.
    pub build: Option<StringMatcher>,

    /// A constraint on the build number.
    pub build_number: Option<u64>,

    /// The channel the record must come from.
    pub channel: Option<String>,

    /// The subdir the record must come from.
    pub subdir: Option<String>,

    /// The expected MD5 of the package archive.
    pub md5: Option<Md5Hash>,

    /// The expected SHA-256 of the package archive.
    pub sha256: Option<Sha256Hash>,

    /// The exact url of the package archive.
    pub url: Option<Url>,
}

/// An error that can occur when parsing a [`MatchSpec`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseMatchSpecError {
    /// The spec was empty.
    #[error("empty match spec")]
    Empty,

    /// The package name is invalid.
    #[error(transparent)]
    InvalidName(#[from] ParsePackageNameError),

    /// The version constraint could not be parsed.
    #[error(transparent)]
    InvalidVersionSpec(#[from] ParseVersionSpecError),

    /// A bracket section was malformed.
    #[error("malformed bracket section in '{0}'")]
    MalformedBrackets(String),

    /// A bracket value could not be parsed.
    #[error("invalid value for bracket key '{0}': '{1}'")]
    InvalidBracketValue(String, String),

    /// Too many space separated fields.
    #[error("too many fields in match spec: '{0}'")]
    TooManyFields(String),
}

impl MatchSpec {
    /// Constructs a spec that matches any record of the given name.
    pub fn from_name(name: PackageName) -> Self {
        Self {
            name: Some(name),
            ..Self::default()
        }
    }

    /// Returns whether the given record satisfies this spec.
    pub fn matches(&self, record: &PackageRecord) -> bool {
        if let Some(name) = &self.name {
            if name != &record.name {
                return false;
            }
        }
        if let Some(version) = &self.version {
            if !version.matches(record.version.version()) {
                return false;
            }
        }
        if let Some(build) = &self.build {
            if !build.matches(&record.build) {
                return false;
            }
        }
        if let Some(build_number) = self.build_number {
            if build_number != record.build_number {
                return false;
            }
        }
        if let Some(subdir) = &self.subdir {
            if subdir != &record.subdir {
                return false;
            }
        }
        if let Some(md5) = &self.md5 {
            if record.md5.as_ref() != Some(md5) {
                return false;
            }
        }
        if let Some(sha256) = &self.sha256 {
            if record.sha256.as_ref() != Some(sha256) {
                return false;
            }
        }
        true
    }

    /// Returns whether a record from the given channel (canonical name or
    /// base url) can satisfy the channel constraint of this spec.
    pub fn matches_channel(&self, channel: &str) -> bool {
        match &self.channel {
            None => true,
            Some(expected) => {
                let channel = channel.trim_end_matches('/');
                let expected = expected.trim_end_matches('/');
                channel == expected || channel.ends_with(&format!("/{expected}"))
            }
        }
    }

    /// Composes two specs by predicate intersection: the result matches only
    /// records that match both inputs. Returns `None` when the two specs
    /// plainly contradict each other (different names or conflicting exact
    /// attributes).
    pub fn intersection(self, other: MatchSpec) -> Option<MatchSpec> {
        fn merge<T: PartialEq>(a: Option<T>, b: Option<T>) -> Result<Option<T>, ()> {
            match (a, b) {
                (Some(a), Some(b)) => {
                    if a == b {
                        Ok(Some(a))
                    } else {
                        Err(())
                    }
                }
                (Some(a), None) => Ok(Some(a)),
                (None, b) => Ok(b),
            }
        }

        let name = merge(self.name, other.name).ok()?;
        let version = match (self.version, other.version) {
            (Some(a), Some(b)) => Some(a.and(b)),
            (a, b) => a.or(b),
        };
        Some(MatchSpec {
            name,
            version,
            build: merge(self.build, other.build).ok()?,
            build_number: merge(self.build_number, other.build_number).ok()?,
            channel: merge(self.channel, other.channel).ok()?,
            subdir: merge(self.subdir, other.subdir).ok()?,
            md5: merge(self.md5, other.md5).ok()?,
            sha256: merge(self.sha256, other.sha256).ok()?,
            url: merge(self.url, other.url).ok()?,
        })
    }
}

/// Splits off a trailing `[key=value,…]` section.
fn split_brackets(spec: &str) -> Result<(&str, Vec<(&str, &str)>), ParseMatchSpecError> {
    let Some(stripped) = spec.strip_suffix(']') else {
        return Ok((spec, Vec::new()));
    };
    let Some(open) = stripped.rfind('[') else {
        return Err(ParseMatchSpecError::MalformedBrackets(spec.to_owned()));
    };
    let mut entries = Vec::new();
    for part in stripped[open + 1..].split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| ParseMatchSpecError::MalformedBrackets(spec.to_owned()))?;
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        entries.push((key.trim(), value));
    }
    Ok((&stripped[..open], entries))
}

impl FromStr for MatchSpec {
    type Err = ParseMatchSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim();
        if spec.is_empty() {
            return Err(ParseMatchSpecError::Empty);
        }

        let (spec, brackets) = split_brackets(spec)?;
        let mut result = MatchSpec::default();

        // Channel and subdir prefix, e.g. `conda-forge/linux-64::python`.
        let spec = match spec.split_once("::") {
            Some((channel_part, rest)) => {
                let channel_part = channel_part.trim();
                match channel_part.rsplit_once('/') {
                    Some((channel, subdir)) if subdir.parse::<crate::Platform>().is_ok() => {
                        result.channel = Some(channel.to_owned());
                        result.subdir = Some(subdir.to_owned());
                    }
                    _ => {
                        if !channel_part.is_empty() {
                            result.channel = Some(channel_part.to_owned());
                        }
                    }
                }
                rest
            }
            None => spec,
        };

        // Find where the name ends: at whitespace or at the first operator
        // character.
        let spec = spec.trim();
        let name_end = spec
            .find(|c: char| c.is_whitespace() || matches!(c, '>' | '<' | '!' | '~' | '='))
            .unwrap_or(spec.len());
        let (name, rest) = spec.split_at(name_end);
        if !name.is_empty() {
            result.name = Some(name.parse()?);
        }

        let rest = rest.trim();
        if !rest.is_empty() {
            if let Some(equals_form) = rest.strip_prefix('=') {
                // `=version=build` is the conda "exact" string form; a single
                // `=version` is a fuzzy constraint handled by the version spec
                // parser.
                if !equals_form.starts_with('=') && equals_form.contains('=') {
                    let (version, build) = equals_form
                        .split_once('=')
                        .expect("contains is checked above");
                    result.version = Some(format!("=={version}").parse()?);
                    result.build = Some(build.parse().expect("infallible"));
                    return apply_brackets(result, brackets, s);
                }
            }

            let mut fields = rest.split_whitespace();
            let version = fields.next().expect("rest is not empty");
            result.version = Some(version.parse()?);
            if let Some(build) = fields.next() {
                result.build = Some(build.parse().expect("infallible"));
            }
            if fields.next().is_some() {
                return Err(ParseMatchSpecError::TooManyFields(s.to_owned()));
            }
        }

        apply_brackets(result, brackets, s)
    }
}

fn apply_brackets(
    mut result: MatchSpec,
    brackets: Vec<(&str, &str)>,
    source: &str,
) -> Result<MatchSpec, ParseMatchSpecError> {
    let invalid = |key: &str, value: &str| {
        ParseMatchSpecError::InvalidBracketValue(key.to_owned(), value.to_owned())
    };
    for (key, value) in brackets {
        match key {
            "version" => result.version = Some(value.parse()?),
            "build" => result.build = Some(value.parse().expect("infallible")),
            "build_number" => {
                result.build_number = Some(value.parse().map_err(|_| invalid(key, value))?);
            }
            "channel" => result.channel = Some(value.to_owned()),
            "subdir" => result.subdir = Some(value.to_owned()),
            "md5" => {
                result.md5 = Some(
                    krait_digest::parse_digest_from_hex::<krait_digest::Md5>(value)
                        .ok_or_else(|| invalid(key, value))?,
                );
            }
            "sha256" => {
                result.sha256 = Some(
                    krait_digest::parse_digest_from_hex::<krait_digest::Sha256>(value)
                        .ok_or_else(|| invalid(key, value))?,
                );
            }
            "url" => {
                result.url = Some(Url::parse(value).map_err(|_| invalid(key, value))?);
            }
            other => {
                tracing::warn!("ignoring unknown match spec attribute '{}' in '{}'", other, source);
            }
        }
    }
    Ok(result)
}

impl Display for MatchSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.channel, &self.subdir) {
            (Some(channel), Some(subdir)) => write!(f, "{channel}/{subdir}::")?,
            (Some(channel), None) => write!(f, "{channel}::")?,
            _ => {}
        }
        match &self.name {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "*")?,
        }
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
            if let Some(build) = &self.build {
                write!(f, " {build}")?;
            }
        }
        let mut attrs = Vec::new();
        if let Some(build_number) = self.build_number {
            attrs.push(format!("build_number={build_number}"));
        }
        if let Some(md5) = &self.md5 {
            attrs.push(format!("md5={md5:x}"));
        }
        if let Some(sha256) = &self.sha256 {
            attrs.push(format!("sha256={sha256:x}"));
        }
        if let Some(url) = &self.url {
            attrs.push(format!("url={url}"));
        }
        if !attrs.is_empty() {
            write!(f, "[{}]", attrs.join(","))?;
        }
        Ok(())
    }
}

impl Serialize for MatchSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MatchSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn spec(s: &str) -> MatchSpec {
        MatchSpec::from_str(s).unwrap_or_else(|e| panic!("failed to parse '{s}': {e}"))
    }

    #[test]
    fn test_string_matcher() {
        assert!(StringMatcher::from_str("py38*").unwrap().matches("py38h123_0"));
        assert!(StringMatcher::from_str("*_0").unwrap().matches("py38h123_0"));
        assert!(StringMatcher::from_str("h*_0").unwrap().matches("h123_0"));
        assert!(!StringMatcher::from_str("py39*").unwrap().matches("py38h123_0"));
        assert!(StringMatcher::from_str("exact").unwrap().matches("exact"));
        assert!(!StringMatcher::from_str("exact").unwrap().matches("exact2"));
    }

    #[test]
    fn test_parse_name_only() {
        let s = spec("python");
        assert_eq!(s.name.as_ref().unwrap().as_normalized(), "python");
        assert!(s.version.is_none());
    }

    #[test]
    fn test_parse_name_version() {
        let s = spec("python >=3.9,<3.12");
        assert_eq!(s.name.as_ref().unwrap().as_normalized(), "python");
        assert_eq!(s.version, Some(">=3.9,<3.12".parse().unwrap()));

        // No space before the operator is also accepted.
        let s = spec("python>=3.9");
        assert_eq!(s.version, Some(">=3.9".parse().unwrap()));
    }

    #[test]
    fn test_parse_exact_form() {
        let s = spec("foo=1.2=py38_0");
        assert_eq!(s.version, Some("==1.2".parse().unwrap()));
        assert_eq!(s.build.as_ref().unwrap().as_str(), "py38_0");

        // A single `=` is fuzzy.
        let s = spec("foo=1.2");
        assert_eq!(s.version, Some("1.2.*".parse().unwrap()));
    }

    #[test]
    fn test_parse_channel() {
        let s = spec("conda-forge::python");
        assert_eq!(s.channel.as_deref(), Some("conda-forge"));
        assert_eq!(s.subdir, None);

        let s = spec("conda-forge/linux-64::python >=3");
        assert_eq!(s.channel.as_deref(), Some("conda-forge"));
        assert_eq!(s.subdir.as_deref(), Some("linux-64"));

        // A label is part of the channel, not a subdir.
        let s = spec("conda-forge/label/dev::python");
        assert_eq!(s.channel.as_deref(), Some("conda-forge/label/dev"));
    }

    #[test]
    fn test_parse_brackets() {
        let s = spec("foo[md5=d41d8cd98f00b204e9800998ecf8427e, build_number=3]");
        assert_eq!(s.build_number, Some(3));
        assert_eq!(
            format!("{:x}", s.md5.unwrap()),
            "d41d8cd98f00b204e9800998ecf8427e"
        );

        assert_matches::assert_matches!(
            MatchSpec::from_str("foo[md5=nothex]"),
            Err(ParseMatchSpecError::InvalidBracketValue(_, _))
        );
    }

    #[test]
    fn test_matches() {
        let record = PackageRecord::for_test("foo", "1.2.3", "py38h123_0", 0);
        assert!(spec("foo").matches(&record));
        assert!(spec("foo >=1.2").matches(&record));
        assert!(spec("foo >=1.2 py38*").matches(&record));
        assert!(!spec("foo >=2").matches(&record));
        assert!(!spec("foo >=1.2 py39*").matches(&record));
        assert!(!spec("bar").matches(&record));
    }

    #[test]
    fn test_matches_channel() {
        let s = spec("conda-forge::foo");
        assert!(s.matches_channel("conda-forge"));
        assert!(s.matches_channel("https://conda.anaconda.org/conda-forge/"));
        assert!(!s.matches_channel("bioconda"));
    }

    #[test]
    fn test_intersection() {
        let combined = spec("foo >=1.0").intersection(spec("foo <2.0")).unwrap();
        let record = PackageRecord::for_test("foo", "1.5", "0", 0);
        assert!(combined.matches(&record));
        let too_new = PackageRecord::for_test("foo", "2.5", "0", 0);
        assert!(!combined.matches(&too_new));

        assert!(spec("foo").intersection(spec("bar")).is_none());
        assert!(spec("foo[build_number=1]")
            .intersection(spec("foo[build_number=2]"))
            .is_none());
    }

    #[test]
    fn test_display_round_trip() {
        for input in ["python >=3.9,<3.12", "conda-forge::numpy 1.24.*", "foo"] {
            let parsed = spec(input);
            assert_eq!(spec(&parsed.to_string()), parsed, "round trip of {input}");
        }
    }
}
