//! `list`: enumerating the installed records of a prefix.

use krait_types::PrefixRecord;

use crate::{
    ops::OpError,
    prefix::{Prefix, PrefixData},
};

/// Returns the installed records, optionally filtered by a regular
/// expression on the package name, sorted by name.
pub fn list(prefix: &Prefix, pattern: Option<&str>) -> Result<Vec<PrefixRecord>, OpError> {
    let data = PrefixData::from_prefix(prefix)?;
    let filter = pattern
        .map(regex::Regex::new)
        .transpose()
        .map_err(|e| OpError::InvalidSpec(e.to_string()))?;

    Ok(data
        .records()
        .filter(|record| {
            filter.as_ref().map_or(true, |regex| {
                regex.is_match(
                    record
                        .repodata_record
                        .package_record
                        .name
                        .as_normalized(),
                )
            })
        })
        .cloned()
        .collect())
}
