//! Defines [`PackageName`].

use std::{
    borrow::Borrow,
    cmp::Ordering,
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The name of a package.
///
/// Package names are matched case-insensitively; the normalized (lowercase)
/// form is what identifies a package, while the source form is retained for
/// display and serialization.
#[derive(Debug, Clone, Eq)]
pub struct PackageName {
    normalized: Option<Box<str>>,
    source: Box<str>,
}

/// An error that occurs when a string is not a valid package name.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("'{0}' is not a valid package name")]
pub struct ParsePackageNameError(pub String);

impl PackageName {
    /// Constructs a new instance from a string that is already known to be
    /// normalized (all lowercase). Returns an error if it is not a valid name.
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self {
            normalized: None,
            source: name.into().into_boxed_str(),
        }
    }

    /// Returns the normalized (lowercase) form of the name.
    pub fn as_normalized(&self) -> &str {
        self.normalized.as_deref().unwrap_or(&self.source)
    }

    /// Returns the name exactly as it was entered.
    pub fn as_source(&self) -> &str {
        &self.source
    }
}

impl FromStr for PackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty()
            || !s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ParsePackageNameError(s.to_owned()));
        }
        let normalized = if s.chars().any(|c| c.is_ascii_uppercase()) {
            Some(s.to_ascii_lowercase().into_boxed_str())
        } else {
            None
        };
        Ok(Self {
            normalized,
            source: s.to_owned().into_boxed_str(),
        })
    }
}

impl TryFrom<String> for PackageName {
    type Error = ParsePackageNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl PartialEq for PackageName {
    fn eq(&self, other: &Self) -> bool {
        self.as_normalized() == other.as_normalized()
    }
}

impl PartialOrd for PackageName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_normalized().cmp(other.as_normalized())
    }
}

impl Hash for PackageName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_normalized().hash(state);
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        self.as_normalized()
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_source())
    }
}

impl Serialize for PackageName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_source().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PackageName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalization() {
        let name: PackageName = "Foo-Bar".parse().unwrap();
        assert_eq!(name.as_normalized(), "foo-bar");
        assert_eq!(name.as_source(), "Foo-Bar");
        assert_eq!(name, "foo-bar".parse().unwrap());
    }

    #[test]
    fn test_invalid() {
        assert!("foo bar".parse::<PackageName>().is_err());
        assert!("".parse::<PackageName>().is_err());
        assert!("foo$".parse::<PackageName>().is_err());
    }

    #[test]
    fn test_serde() {
        let name: PackageName = serde_json::from_str("\"PyTest\"").unwrap();
        assert_eq!(name.as_normalized(), "pytest");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"PyTest\"");
    }
}
