//! Small helpers shared across the crate.

pub(crate) mod serde {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_with::{DeserializeAs, SerializeAs};

    /// (De)serializes a [`DateTime`] as a unix timestamp in milliseconds.
    ///
    /// Some older channels published timestamps in seconds; values that are
    /// implausibly small are interpreted as seconds.
    pub struct TimestampMilliseconds;

    impl SerializeAs<DateTime<Utc>> for TimestampMilliseconds {
        fn serialize_as<S: Serializer>(
            source: &DateTime<Utc>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            source.timestamp_millis().serialize(serializer)
        }
    }

    impl<'de> DeserializeAs<'de, DateTime<Utc>> for TimestampMilliseconds {
        fn deserialize_as<D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<DateTime<Utc>, D::Error> {
            let value = i64::deserialize(deserializer)?;
            // Anything before ~2001 in milliseconds is assumed to be seconds.
            let millis = if value < 1_000_000_000_000 {
                value * 1000
            } else {
                value
            };
            DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
        }
    }
}

pub(crate) mod path {
    /// Returns true if the given string looks like a filesystem path rather
    /// than a channel name or url.
    pub fn is_path(path: &str) -> bool {
        if path.contains("://") {
            return false;
        }
        path.starts_with('/')
            || path.starts_with("./")
            || path.starts_with("..")
            || path.starts_with("~")
            || path.starts_with(r".\")
            || path.starts_with(r"..\")
            // Windows drive letters, `C:\` or `C:/`.
            || (path.len() >= 3
                && path.as_bytes()[1] == b':'
                && (path.as_bytes()[2] == b'/' || path.as_bytes()[2] == b'\\'))
    }
}

pub(crate) mod url {
    /// Returns the scheme of a url-like string, if it has one.
    ///
    /// This is more restrictive than `Url::parse` which would also interpret
    /// `foo:bar` as a url with scheme `foo`.
    pub fn parse_scheme(url: &str) -> Option<&str> {
        let (scheme, _) = url.split_once("://")?;
        if scheme.is_empty() || scheme.len() > 12 {
            return None;
        }
        let mut chars = scheme.chars();
        let first = chars.next()?;
        if !first.is_ascii_alphabetic() {
            return None;
        }
        if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
            Some(scheme)
        } else {
            None
        }
    }

    /// Converts a directory path to a `file://` url.
    pub fn directory_path_to_url(
        path: &std::path::Path,
    ) -> Result<::url::Url, std::path::PathBuf> {
        ::url::Url::from_directory_path(path).map_err(|()| path.to_path_buf())
    }
}
