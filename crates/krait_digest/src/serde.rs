//! Serialization helpers for digests.
//!
//! Digests are stored as lowercase hex strings in every on-disk format krait
//! touches (`repodata.json`, `repodata_record.json`, `paths.json`). The
//! [`SerializableHash`] adapter plugs into `serde_with` so records can store
//! the raw digest output without an intermediate `String`.

use std::{borrow::Cow, fmt::LowerHex, marker::PhantomData, ops::Deref};

use digest::{Digest, Output};
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DeserializeAs, SerializeAs};

/// Deserialize the [`Output`] of a [`Digest`] from a hex string.
pub fn deserialize<'de, D, Dig: Digest>(deserializer: D) -> Result<Output<Dig>, D::Error>
where
    D: Deserializer<'de>,
{
    let str = Cow::<'de, str>::deserialize(deserializer)?;
    super::parse_digest_from_hex::<Dig>(str.as_ref())
        .ok_or_else(|| Error::custom("failed to parse digest"))
}

/// Serializes the [`Output`] of a [`Digest`] as a hex string.
pub fn serialize<'a, S: Serializer, Dig: Digest>(
    digest: &'a Output<Dig>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    &'a Output<Dig>: LowerHex,
{
    format!("{digest:x}").serialize(s)
}

/// Wrapper type for easily serializing a hash.
pub struct SerializableHash<T: Digest>(pub Output<T>);

impl<T: Digest> Serialize for SerializableHash<T>
where
    for<'a> &'a Output<T>: LowerHex,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize::<_, T>(&self.0, serializer)
    }
}

impl<'de, T: Digest> Deserialize<'de> for SerializableHash<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize::<_, T>(deserializer).map(SerializableHash)
    }
}

impl<T: Digest> SerializeAs<Output<T>> for SerializableHash<T>
where
    for<'a> &'a Output<T>: LowerHex,
{
    fn serialize_as<S: Serializer>(source: &Output<T>, serializer: S) -> Result<S::Ok, S::Error> {
        serialize::<_, T>(source, serializer)
    }
}

impl<'de, T: Digest> DeserializeAs<'de, Output<T>> for SerializableHash<T> {
    fn deserialize_as<D: Deserializer<'de>>(deserializer: D) -> Result<Output<T>, D::Error> {
        deserialize::<_, T>(deserializer)
    }
}

impl<T: Digest> Deref for SerializableHash<T> {
    type Target = Output<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A `serde_with` adapter like [`SerializableHash`] for `Option<Output<T>>`
/// fields that should be skipped entirely when absent.
pub struct OptionalHash<T: Digest>(PhantomData<T>);

impl<T: Digest> SerializeAs<Option<Output<T>>> for OptionalHash<T>
where
    for<'a> &'a Output<T>: LowerHex,
{
    fn serialize_as<S: Serializer>(
        source: &Option<Output<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match source {
            Some(digest) => serialize::<_, T>(digest, serializer),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Digest> DeserializeAs<'de, Option<Output<T>>> for OptionalHash<T> {
    fn deserialize_as<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Output<T>>, D::Error> {
        Option::<SerializableHash<T>>::deserialize(deserializer)
            .map(|opt| opt.map(|hash| hash.0))
    }
}

#[cfg(test)]
mod test {
    use super::SerializableHash;

    #[test]
    fn test_round_trip() {
        let hash = SerializableHash::<sha2::Sha256>(
            crate::parse_digest_from_hex::<sha2::Sha256>(
                "fe51de6107f9edc7aa4f786a70f4a883943bc9d39b3bb7307c04c41410990726",
            )
            .unwrap(),
        );
        let str = serde_json::to_string(&hash).unwrap();
        assert_eq!(
            str,
            "\"fe51de6107f9edc7aa4f786a70f4a883943bc9d39b3bb7307c04c41410990726\""
        );
        let hash: SerializableHash<sha2::Sha256> = serde_json::from_str(&str).unwrap();
        assert_eq!(serde_json::to_string(&hash).unwrap(), str);
    }
}
