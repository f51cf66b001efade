//! Defines the [`NoArchType`] of a package.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The `noarch` field of a package record.
///
/// Historically this field has been serialized both as a boolean and as a
/// string, so deserialization accepts `true`, `"python"` and `"generic"`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct NoArchType(pub Option<RawNoArchType>);

/// The kinds of noarch packages.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RawNoArchType {
    /// A noarch package that contains only platform independent files, linked
    /// as-is.
    GenericV1,

    /// Same as `GenericV1` but serialized as the string `generic`.
    GenericV2,

    /// A noarch python package: `site-packages/` files are remapped into the
    /// python installation of the target prefix and entry points are created.
    Python,
}

impl NoArchType {
    /// A package that is not noarch.
    pub const fn none() -> Self {
        Self(None)
    }

    /// A noarch python package.
    pub const fn python() -> Self {
        Self(Some(RawNoArchType::Python))
    }

    /// A generic noarch package.
    pub const fn generic() -> Self {
        Self(Some(RawNoArchType::GenericV2))
    }

    /// Returns true if this is a noarch python package.
    pub fn is_python(&self) -> bool {
        matches!(self.0, Some(RawNoArchType::Python))
    }

    /// Returns true if this is not a noarch package at all.
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl Serialize for NoArchType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            None => serializer.serialize_none(),
            Some(RawNoArchType::GenericV1) => serializer.serialize_bool(true),
            Some(RawNoArchType::GenericV2) => serializer.serialize_str("generic"),
            Some(RawNoArchType::Python) => serializer.serialize_str("python"),
        }
    }
}

impl<'de> Deserialize<'de> for NoArchType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Str(String),
        }

        let raw = Option::<Raw>::deserialize(deserializer)?;
        Ok(match raw {
            None | Some(Raw::Bool(false)) => NoArchType(None),
            Some(Raw::Bool(true)) => NoArchType(Some(RawNoArchType::GenericV1)),
            Some(Raw::Str(s)) => match s.as_str() {
                "python" => NoArchType(Some(RawNoArchType::Python)),
                "generic" => NoArchType(Some(RawNoArchType::GenericV2)),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "unknown noarch type '{other}'"
                    )))
                }
            },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Deserialize)]
    struct Record {
        #[serde(default)]
        noarch: NoArchType,
    }

    #[test]
    fn test_deserialize_variants() {
        let record: Record = serde_json::from_str(r#"{"noarch": "python"}"#).unwrap();
        assert!(record.noarch.is_python());

        let record: Record = serde_json::from_str(r#"{"noarch": "generic"}"#).unwrap();
        assert_eq!(record.noarch, NoArchType::generic());

        let record: Record = serde_json::from_str(r#"{"noarch": true}"#).unwrap();
        assert_eq!(record.noarch.0, Some(RawNoArchType::GenericV1));

        let record: Record = serde_json::from_str(r#"{}"#).unwrap();
        assert!(record.noarch.is_none());
    }
}
