//! The version part of a [`crate::MatchSpec`], e.g. `>=3.4,<4.0` or
//! `1.2.*|>=2`. `,` binds tighter than `|`.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{ParseVersionError, Version};

/// An operator to compare two versions.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RangeOperator {
    Greater,
    GreaterEquals,
    Less,
    LessEquals,
}

impl RangeOperator {
    /// Returns the complement of the current operator.
    pub fn complement(self) -> Self {
        match self {
            RangeOperator::Greater => RangeOperator::LessEquals,
            RangeOperator::GreaterEquals => RangeOperator::Less,
            RangeOperator::Less => RangeOperator::GreaterEquals,
            RangeOperator::LessEquals => RangeOperator::Greater,
        }
    }
}

/// Prefix- and compatibility operators that treat the version as a pattern.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StrictRangeOperator {
    StartsWith,
    NotStartsWith,
    Compatible,
}

/// Exact comparison operators.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EqualityOperator {
    Equals,
    NotEquals,
}

/// Logical operator combining groups of constraints.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LogicalOperator {
    /// All members must match.
    And,
    /// At least one member must match.
    Or,
}

/// A version specification.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum VersionSpec {
    /// Matches any version.
    Any,

    /// A relational constraint, e.g. `>=1.2`.
    Range(RangeOperator, Version),

    /// A prefix or compatibility constraint, e.g. `1.2.*` or `~=1.2.3`.
    StrictRange(StrictRangeOperator, Version),

    /// An exact constraint, e.g. `==1.2.3`.
    Exact(EqualityOperator, Version),

    /// A group of specifications combined with a logical operator.
    Group(LogicalOperator, Vec<VersionSpec>),
}

/// An error that can occur when parsing a [`VersionSpec`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionSpecError {
    /// The version could not be parsed.
    #[error("invalid version: {0}")]
    InvalidVersion(#[from] ParseVersionError),

    /// An operator without a version, or vice versa.
    #[error("invalid version constraint: '{0}'")]
    InvalidConstraint(String),
}

impl VersionSpec {
    /// Returns whether the given version matches this spec.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionSpec::Any => true,
            VersionSpec::Range(RangeOperator::Greater, limit) => version > limit,
            VersionSpec::Range(RangeOperator::GreaterEquals, limit) => version >= limit,
            VersionSpec::Range(RangeOperator::Less, limit) => version < limit,
            VersionSpec::Range(RangeOperator::LessEquals, limit) => version <= limit,
            VersionSpec::StrictRange(StrictRangeOperator::StartsWith, pattern) => {
                version.starts_with(pattern)
            }
            VersionSpec::StrictRange(StrictRangeOperator::NotStartsWith, pattern) => {
                !version.starts_with(pattern)
            }
            VersionSpec::StrictRange(StrictRangeOperator::Compatible, pattern) => {
                version.compatible_with(pattern)
            }
            VersionSpec::Exact(EqualityOperator::Equals, other) => version == other,
            VersionSpec::Exact(EqualityOperator::NotEquals, other) => version != other,
            VersionSpec::Group(LogicalOperator::And, group) => {
                group.iter().all(|spec| spec.matches(version))
            }
            VersionSpec::Group(LogicalOperator::Or, group) => {
                group.iter().any(|spec| spec.matches(version))
            }
        }
    }

    /// Combines two specs such that a version only matches if it matches both.
    pub fn and(self, other: VersionSpec) -> VersionSpec {
        match (self, other) {
            (VersionSpec::Any, other) => other,
            (own, VersionSpec::Any) => own,
            (VersionSpec::Group(LogicalOperator::And, mut group), other) => {
                group.push(other);
                VersionSpec::Group(LogicalOperator::And, group)
            }
            (own, other) => VersionSpec::Group(LogicalOperator::And, vec![own, other]),
        }
    }
}

fn parse_constraint(constraint: &str) -> Result<VersionSpec, ParseVersionSpecError> {
    let constraint = constraint.trim();
    if constraint.is_empty() || constraint == "*" {
        return Ok(VersionSpec::Any);
    }

    fn strip_star(version: &str) -> (&str, bool) {
        if let Some(stripped) = version.strip_suffix(".*") {
            (stripped, true)
        } else if let Some(stripped) = version.strip_suffix('*') {
            (stripped.trim_end_matches('.'), true)
        } else {
            (version, false)
        }
    }

    let parse =
        |version: &str| -> Result<Version, ParseVersionSpecError> { Ok(version.trim().parse()?) };

    if let Some(rest) = constraint.strip_prefix(">=") {
        Ok(VersionSpec::Range(RangeOperator::GreaterEquals, parse(rest)?))
    } else if let Some(rest) = constraint.strip_prefix("<=") {
        Ok(VersionSpec::Range(RangeOperator::LessEquals, parse(rest)?))
    } else if let Some(rest) = constraint.strip_prefix('>') {
        Ok(VersionSpec::Range(RangeOperator::Greater, parse(rest)?))
    } else if let Some(rest) = constraint.strip_prefix('<') {
        Ok(VersionSpec::Range(RangeOperator::Less, parse(rest)?))
    } else if let Some(rest) = constraint.strip_prefix("==") {
        let (version, star) = strip_star(rest);
        if star {
            Ok(VersionSpec::StrictRange(StrictRangeOperator::StartsWith, parse(version)?))
        } else {
            Ok(VersionSpec::Exact(EqualityOperator::Equals, parse(version)?))
        }
    } else if let Some(rest) = constraint.strip_prefix("!=") {
        let (version, star) = strip_star(rest);
        if star {
            Ok(VersionSpec::StrictRange(StrictRangeOperator::NotStartsWith, parse(version)?))
        } else {
            Ok(VersionSpec::Exact(EqualityOperator::NotEquals, parse(version)?))
        }
    } else if let Some(rest) = constraint.strip_prefix("~=") {
        Ok(VersionSpec::StrictRange(StrictRangeOperator::Compatible, parse(rest)?))
    } else if let Some(rest) = constraint.strip_prefix('=') {
        // `=1.2` is the fuzzy prefix constraint, equivalent to `1.2.*`.
        let (version, _) = strip_star(rest);
        Ok(VersionSpec::StrictRange(StrictRangeOperator::StartsWith, parse(version)?))
    } else if constraint.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        let (version, star) = strip_star(constraint);
        if star {
            Ok(VersionSpec::StrictRange(StrictRangeOperator::StartsWith, parse(version)?))
        } else {
            Ok(VersionSpec::Exact(EqualityOperator::Equals, parse(version)?))
        }
    } else {
        Err(ParseVersionSpecError::InvalidConstraint(constraint.to_owned()))
    }
}

impl FromStr for VersionSpec {
    type Err = ParseVersionSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut or_group = Vec::new();
        for or_part in s.split('|') {
            let mut and_group = Vec::new();
            for constraint in or_part.split(',') {
                and_group.push(parse_constraint(constraint)?);
            }
            or_group.push(match and_group.len() {
                1 => and_group.into_iter().next().expect("group has one member"),
                _ => VersionSpec::Group(LogicalOperator::And, and_group),
            });
        }
        Ok(match or_group.len() {
            1 => or_group.into_iter().next().expect("group has one member"),
            _ => VersionSpec::Group(LogicalOperator::Or, or_group),
        })
    }
}

impl Display for VersionSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionSpec::Any => write!(f, "*"),
            VersionSpec::Range(RangeOperator::Greater, v) => write!(f, ">{v}"),
            VersionSpec::Range(RangeOperator::GreaterEquals, v) => write!(f, ">={v}"),
            VersionSpec::Range(RangeOperator::Less, v) => write!(f, "<{v}"),
            VersionSpec::Range(RangeOperator::LessEquals, v) => write!(f, "<={v}"),
            VersionSpec::StrictRange(StrictRangeOperator::StartsWith, v) => write!(f, "{v}.*"),
            VersionSpec::StrictRange(StrictRangeOperator::NotStartsWith, v) => {
                write!(f, "!={v}.*")
            }
            VersionSpec::StrictRange(StrictRangeOperator::Compatible, v) => write!(f, "~={v}"),
            VersionSpec::Exact(EqualityOperator::Equals, v) => write!(f, "=={v}"),
            VersionSpec::Exact(EqualityOperator::NotEquals, v) => write!(f, "!={v}"),
            VersionSpec::Group(op, group) => {
                let separator = match op {
                    LogicalOperator::And => ",",
                    LogicalOperator::Or => "|",
                };
                for (idx, spec) in group.iter().enumerate() {
                    if idx > 0 {
                        write!(f, "{separator}")?;
                    }
                    write!(f, "{spec}")?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for VersionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VersionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn spec(s: &str) -> VersionSpec {
        VersionSpec::from_str(s).unwrap_or_else(|e| panic!("failed to parse '{s}': {e}"))
    }

    fn version(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    #[test]
    fn test_simple_ranges() {
        assert!(spec(">=1.2").matches(&version("1.3")));
        assert!(spec(">=1.2").matches(&version("1.2")));
        assert!(!spec(">1.2").matches(&version("1.2")));
        assert!(spec("<2").matches(&version("1.9.9")));
        assert!(!spec("<2").matches(&version("2.0")));
        assert!(spec("<=2").matches(&version("2.0")));
    }

    #[test]
    fn test_and_group() {
        let s = spec(">=3.4,<4.0");
        assert!(s.matches(&version("3.4")));
        assert!(s.matches(&version("3.11")));
        assert!(!s.matches(&version("4.0")));
        assert!(!s.matches(&version("3.3")));
    }

    #[test]
    fn test_or_group() {
        let s = spec("1.0|>=2.0,<3.0");
        assert!(s.matches(&version("1.0")));
        assert!(s.matches(&version("2.5")));
        assert!(!s.matches(&version("1.5")));
        assert!(!s.matches(&version("3.0")));
    }

    #[test]
    fn test_starts_with() {
        for input in ["1.2.*", "=1.2", "1.2*"] {
            let s = spec(input);
            assert!(s.matches(&version("1.2")), "{input} should match 1.2");
            assert!(s.matches(&version("1.2.3")), "{input} should match 1.2.3");
            assert!(!s.matches(&version("1.20")), "{input} should not match 1.20");
            assert!(!s.matches(&version("1.3")), "{input} should not match 1.3");
        }
    }

    #[test]
    fn test_not_starts_with() {
        let s = spec("!=1.2.*");
        assert!(!s.matches(&version("1.2.3")));
        assert!(s.matches(&version("1.3")));
    }

    #[test]
    fn test_exact() {
        assert!(spec("==1.2").matches(&version("1.2")));
        assert!(!spec("==1.2").matches(&version("1.2.3")));
        assert!(spec("1.2.3").matches(&version("1.2.3")));
        assert!(spec("!=1.2").matches(&version("1.3")));
    }

    #[test]
    fn test_compatible() {
        let s = spec("~=1.2.3");
        assert!(s.matches(&version("1.2.3")));
        assert!(s.matches(&version("1.2.9")));
        assert!(!s.matches(&version("1.3.0")));
        assert!(!s.matches(&version("2.0")));
    }

    #[test]
    fn test_any() {
        assert!(spec("*").matches(&version("0.0.1")));
        assert!(spec("").matches(&version("12")));
    }

    #[test]
    fn test_and_composition() {
        let combined = spec(">=1.0").and(spec("<2.0"));
        assert!(combined.matches(&version("1.5")));
        assert!(!combined.matches(&version("2.5")));
        assert_eq!(spec(">=1.0").and(VersionSpec::Any), spec(">=1.0"));
    }

    #[test]
    fn test_display_round_trip() {
        for input in [">=1.2", ">=3.4,<4.0", "1.2.*", "==1.0", "~=2.1", "1.0|>=2.0"] {
            let parsed = spec(input);
            assert_eq!(spec(&parsed.to_string()), parsed, "round trip of {input}");
        }
    }
}
