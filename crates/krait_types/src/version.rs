//! Conda-style version numbers and their total order.
//!
//! A version looks like `[epoch!]1.2.3ab4[+local]`. The version part is split
//! into segments on `.`, `-` and `_`; every segment is an alternating list of
//! numerals and alphabetic identifiers. Identifiers sort before numerals, the
//! literal `dev` sorts before everything and the literal `post` after
//! everything, which yields the familiar `1.0a1 < 1.0 < 1.0.post1` ordering.

use std::{
    cmp::Ordering,
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use thiserror::Error;

/// A single component of a version segment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Component {
    /// The literal `dev`. Sorts before any other component.
    Dev,

    /// An alphabetic identifier, lowercased. Sorts before numerals, e.g.
    /// `1.0alpha < 1.0`.
    Iden(Box<str>),

    /// A numeral.
    Numeral(u64),

    /// The literal `post`. Sorts after any other component.
    Post,
}

impl Component {
    fn type_rank(&self) -> u8 {
        match self {
            Component::Dev => 0,
            Component::Iden(_) => 1,
            Component::Numeral(_) => 2,
            Component::Post => 3,
        }
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Iden(a), Component::Iden(b)) => a.cmp(b),
            (Component::Numeral(a), Component::Numeral(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Component {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Dev => write!(f, "dev"),
            Component::Iden(iden) => write!(f, "{iden}"),
            Component::Numeral(n) => write!(f, "{n}"),
            Component::Post => write!(f, "post"),
        }
    }
}

type Segment = SmallVec<[Component; 2]>;

/// A conda version number.
///
/// The original string is not retained; use [`VersionWithSource`] when the
/// exact user input must survive a round-trip (e.g. in `repodata.json`).
#[derive(Debug, Clone, Eq)]
pub struct Version {
    epoch: u64,
    segments: Vec<Segment>,
    local: Vec<Segment>,
}

/// An error that occurred during parsing of a string to a [`Version`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionError {
    /// The version was empty.
    #[error("empty version")]
    Empty,

    /// The epoch was not a number.
    #[error("epoch is not a number in '{0}'")]
    InvalidEpoch(String),

    /// The version contained multiple `!`.
    #[error("duplicated epoch separator in '{0}'")]
    DuplicateEpochSeparator(String),

    /// The version contained multiple `+`.
    #[error("duplicated local version separator in '{0}'")]
    DuplicateLocalSeparator(String),

    /// The version contained a character outside of `[a-zA-Z0-9._\-+!]`.
    #[error("invalid character '{1}' in version '{0}'")]
    InvalidCharacter(String, char),

    /// A numeral was too large to be represented.
    #[error("number overflows u64 in version '{0}'")]
    NumeralOverflow(String),
}

impl Version {
    /// The major version, if the first segment starts with a numeral.
    pub fn major(&self) -> Option<u64> {
        self.segments.first().and_then(|segment| match segment.first() {
            Some(Component::Numeral(n)) => Some(*n),
            _ => None,
        })
    }

    /// The minor version, if the second segment starts with a numeral.
    pub fn minor(&self) -> Option<u64> {
        self.segments.get(1).and_then(|segment| match segment.first() {
            Some(Component::Numeral(n)) => Some(*n),
            _ => None,
        })
    }

    /// Returns the number of segments in the version.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if `self` starts with `pattern`, segment-wise. This backs
    /// the `1.2.*` style of version constraint: every segment of the pattern
    /// must equal the corresponding segment of `self`, where a missing
    /// trailing segment counts as `0`.
    pub fn starts_with(&self, pattern: &Version) -> bool {
        if self.epoch != pattern.epoch {
            return false;
        }
        static ZERO: &[Component] = &[Component::Numeral(0)];
        for (idx, pattern_segment) in pattern.segments.iter().enumerate() {
            let own: &[Component] = self.segments.get(idx).map_or(ZERO, |s| s.as_slice());
            if compare_segments(own, pattern_segment) != Ordering::Equal {
                return false;
            }
        }
        true
    }

    /// Returns true if `self` is "compatible with" `pattern` in the `~=` sense:
    /// at least `pattern`, and starting with every segment of `pattern` except
    /// the last.
    pub fn compatible_with(&self, pattern: &Version) -> bool {
        if self < pattern {
            return false;
        }
        let truncated = Version {
            epoch: pattern.epoch,
            segments: pattern.segments[..pattern.segments.len().saturating_sub(1)].to_vec(),
            local: Vec::new(),
        };
        self.starts_with(&truncated)
    }

    /// Returns a version identical to `self` but with all segments beyond
    /// `count` removed.
    pub fn with_segments(&self, count: usize) -> Version {
        Version {
            epoch: self.epoch,
            segments: self.segments.iter().take(count).cloned().collect(),
            local: Vec::new(),
        }
    }
}

fn compare_segments(a: &[Component], b: &[Component]) -> Ordering {
    let len = a.len().max(b.len());
    for idx in 0..len {
        static ZERO: Component = Component::Numeral(0);
        let a_component = a.get(idx).unwrap_or(&ZERO);
        let b_component = b.get(idx).unwrap_or(&ZERO);
        match a_component.cmp(b_component) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    Ordering::Equal
}

fn compare_segment_lists(a: &[Segment], b: &[Segment]) -> Ordering {
    static EMPTY: &[Component] = &[];
    let len = a.len().max(b.len());
    for idx in 0..len {
        let a_segment: &[Component] = a.get(idx).map_or(EMPTY, |s| s.as_slice());
        let b_segment: &[Component] = b.get(idx).map_or(EMPTY, |s| s.as_slice());
        match compare_segments(a_segment, b_segment) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    Ordering::Equal
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_segment_lists(&self.segments, &other.segments))
            .then_with(|| compare_segment_lists(&self.local, &other.local))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Versions that compare equal must hash equally, so hash the segments
        // padded to their effective form: strip trailing zero-segments.
        self.epoch.hash(state);
        hash_segments(&self.segments, state);
        hash_segments(&self.local, state);
    }
}

fn hash_segments<H: Hasher>(segments: &[Segment], state: &mut H) {
    let mut significant = segments.len();
    while significant > 0 && compare_segments(&segments[significant - 1], &[]) == Ordering::Equal {
        significant -= 1;
    }
    for segment in &segments[..significant] {
        let mut components = segment.len();
        while components > 0 && segment[components - 1] == Component::Numeral(0) {
            components -= 1;
        }
        for component in &segment[..components] {
            match component {
                Component::Dev => 0u8.hash(state),
                Component::Iden(iden) => {
                    1u8.hash(state);
                    iden.hash(state);
                }
                Component::Numeral(n) => {
                    2u8.hash(state);
                    n.hash(state);
                }
                Component::Post => 3u8.hash(state),
            }
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        format_segments(&self.segments, f)?;
        if !self.local.is_empty() {
            write!(f, "+")?;
            format_segments(&self.local, f)?;
        }
        Ok(())
    }
}

fn format_segments(segments: &[Segment], f: &mut Formatter<'_>) -> std::fmt::Result {
    for (idx, segment) in segments.iter().enumerate() {
        if idx > 0 {
            write!(f, ".")?;
        }
        for component in segment {
            write!(f, "{component}")?;
        }
    }
    Ok(())
}

fn parse_segments(part: &str, source: &str) -> Result<Vec<Segment>, ParseVersionError> {
    let mut segments = Vec::new();
    for segment_str in part.split(['.', '-', '_']) {
        let mut segment = Segment::new();
        let mut chars = segment_str.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                let mut value: u64 = 0;
                while let Some(&c) = chars.peek() {
                    let Some(digit) = c.to_digit(10) else { break };
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(u64::from(digit)))
                        .ok_or_else(|| ParseVersionError::NumeralOverflow(source.to_owned()))?;
                    chars.next();
                }
                segment.push(Component::Numeral(value));
            } else if c.is_ascii_alphabetic() {
                let mut iden = String::new();
                while let Some(&c) = chars.peek() {
                    if !c.is_ascii_alphabetic() {
                        break;
                    }
                    iden.extend(c.to_lowercase());
                    chars.next();
                }
                segment.push(match iden.as_str() {
                    "post" => Component::Post,
                    "dev" => Component::Dev,
                    _ => Component::Iden(iden.into_boxed_str()),
                });
            } else {
                return Err(ParseVersionError::InvalidCharacter(source.to_owned(), c));
            }
        }
        // A segment that starts with an identifier gets an implicit leading
        // zero so that `1.a` sorts as `1.0a`.
        if !matches!(segment.first(), Some(Component::Numeral(_))) {
            segment.insert(0, Component::Numeral(0));
        }
        segments.push(segment);
    }
    Ok(segments)
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseVersionError::Empty);
        }

        let (epoch, rest) = match s.split_once('!') {
            Some((epoch_str, rest)) => {
                if rest.contains('!') {
                    return Err(ParseVersionError::DuplicateEpochSeparator(s.to_owned()));
                }
                let epoch = epoch_str
                    .parse::<u64>()
                    .map_err(|_| ParseVersionError::InvalidEpoch(s.to_owned()))?;
                (epoch, rest)
            }
            None => (0, s),
        };

        let (version_part, local_part) = match rest.split_once('+') {
            Some((version_part, local_part)) => {
                if local_part.contains('+') {
                    return Err(ParseVersionError::DuplicateLocalSeparator(s.to_owned()));
                }
                (version_part, Some(local_part))
            }
            None => (rest, None),
        };

        if version_part.is_empty() {
            return Err(ParseVersionError::Empty);
        }

        Ok(Version {
            epoch,
            segments: parse_segments(version_part, s)?,
            local: local_part.map_or_else(|| Ok(Vec::new()), |l| parse_segments(l, s))?,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.parse().map_err(serde::de::Error::custom)
    }
}

/// A [`Version`] that also retains the string it was parsed from.
///
/// `repodata.json` round-trips must reproduce the version exactly as the
/// channel published it (`1.0` must not become `1.0.0`), so records store
/// this type rather than a bare [`Version`]. Equality and ordering delegate
/// to the parsed version.
#[derive(Debug, Clone)]
pub struct VersionWithSource {
    version: Version,
    source: Option<Box<str>>,
}

impl VersionWithSource {
    /// Constructs a new instance from a version and its original string.
    pub fn new(version: Version, source: impl Into<String>) -> Self {
        Self {
            version,
            source: Some(source.into().into_boxed_str()),
        }
    }

    /// Returns the parsed version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Returns the string representation, preferring the original source.
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        match &self.source {
            Some(source) => std::borrow::Cow::Borrowed(source),
            None => std::borrow::Cow::Owned(self.version.to_string()),
        }
    }

    /// Consumes this instance and returns the inner [`Version`].
    pub fn into_version(self) -> Version {
        self.version
    }
}

impl From<Version> for VersionWithSource {
    fn from(version: Version) -> Self {
        Self {
            version,
            source: None,
        }
    }
}

impl PartialEq for VersionWithSource {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for VersionWithSource {}

impl PartialOrd for VersionWithSource {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionWithSource {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version.cmp(&other.version)
    }
}

impl Hash for VersionWithSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.version.hash(state);
    }
}

impl Display for VersionWithSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VersionWithSource {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            version: Version::from_str(s)?,
            source: Some(s.trim().to_owned().into_boxed_str()),
        })
    }
}

impl Serialize for VersionWithSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VersionWithSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        let version = Version::from_str(&str).map_err(serde::de::Error::custom)?;
        Ok(Self {
            version,
            source: Some(str.into_boxed_str()),
        })
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn version(s: &str) -> Version {
        Version::from_str(s).unwrap_or_else(|e| panic!("failed to parse '{s}': {e}"))
    }

    #[test]
    fn test_ordering() {
        // Taken from the conda documentation on version ordering.
        let sorted = [
            "0.4", "0.4.1.rc", "0.4.1", "0.5a1", "0.5b3", "0.5C1", "0.5", "0.9.6", "0.960923",
            "1.0", "1.1dev1", "1.1a1", "1.1.0dev1", "1.1.a1", "1.1.0rc1", "1.1.0", "1.1.0post1",
            "1996.07.12", "1!0.4.1", "1!3.1.1.6", "2!0.4.1",
        ];
        for window in sorted.windows(2) {
            assert!(
                version(window[0]) < version(window[1]),
                "{} should sort before {}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn test_equality() {
        assert_eq!(version("1.0"), version("1.0.0"));
        assert_eq!(version("1.0"), version("1"));
        assert_eq!(version("0.4.1"), version("0.4.1"));
        assert_eq!(version("1.1"), version("1.1.0"));
        assert_ne!(version("1.1"), version("1.1.1"));
        assert_eq!(version("1.0_1"), version("1.0-1"));
        assert_eq!(version("1.0Alpha"), version("1.0alpha"));
    }

    #[test]
    fn test_hash_consistency() {
        use std::collections::hash_map::DefaultHasher;

        fn hash(v: &Version) -> u64 {
            let mut hasher = DefaultHasher::new();
            v.hash(&mut hasher);
            hasher.finish()
        }

        assert_eq!(hash(&version("1.0")), hash(&version("1.0.0")));
        assert_eq!(hash(&version("1.0_1")), hash(&version("1.0-1")));
        assert_ne!(hash(&version("1.0")), hash(&version("1.0.1")));
    }

    #[test]
    fn test_starts_with() {
        assert!(version("1.2.3").starts_with(&version("1.2")));
        assert!(version("1.2").starts_with(&version("1.2")));
        assert!(version("1.2").starts_with(&version("1.2.0")));
        assert!(!version("1.20").starts_with(&version("1.2")));
        assert!(!version("1.3.1").starts_with(&version("1.2")));
        assert!(!version("1!1.2.3").starts_with(&version("1.2")));
    }

    #[test]
    fn test_compatible_with() {
        assert!(version("1.2.3").compatible_with(&version("1.2.1")));
        assert!(version("1.3").compatible_with(&version("1.2.1")));
        assert!(!version("2.0").compatible_with(&version("1.2.1")));
        assert!(!version("1.2.0").compatible_with(&version("1.2.1")));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Version::from_str(""), Err(ParseVersionError::Empty));
        assert_matches::assert_matches!(
            Version::from_str("1!2!3"),
            Err(ParseVersionError::DuplicateEpochSeparator(_))
        );
        assert_matches::assert_matches!(
            Version::from_str("1+2+3"),
            Err(ParseVersionError::DuplicateLocalSeparator(_))
        );
        assert_matches::assert_matches!(
            Version::from_str("a!1.0"),
            Err(ParseVersionError::InvalidEpoch(_))
        );
        assert_matches::assert_matches!(
            Version::from_str("1.0 2"),
            Err(ParseVersionError::InvalidCharacter(_, ' '))
        );
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["1.0", "1!2.3a4", "1.0+build.2", "0.5C1", "1.1.0post1"] {
            let v = version(s);
            assert_eq!(version(&v.to_string()), v);
        }
    }

    #[test]
    fn test_version_with_source_round_trip() {
        let v = VersionWithSource::from_str("1.00.0").unwrap();
        assert_eq!(v.to_string(), "1.00.0");
        assert_eq!(v.version(), &version("1.0"));
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"1.00.0\"");
        let back: VersionWithSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), "1.00.0");
    }

    #[test]
    fn test_major_minor() {
        assert_eq!(version("3.11.2").major(), Some(3));
        assert_eq!(version("3.11.2").minor(), Some(11));
        assert_eq!(version("a.1").major(), None);
    }
}
