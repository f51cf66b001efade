//! Parsing of `environment.yml` files.
//!
//! The format has three top level keys: `name`, `channels` and
//! `dependencies`. Dependencies are either match spec strings, a `pip:`
//! sub-section (a list of pip requirements that krait surfaces but does not
//! install), or a `sel(<platform>): <spec>` entry that is only included when
//! the selector matches the target platform.

use std::{path::Path, str::FromStr};

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

use crate::{MatchSpec, ParseMatchSpecError, Platform};

/// The parsed contents of an `environment.yml` file, filtered for one
/// platform.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentYaml {
    /// The name of the environment.
    pub name: Option<String>,

    /// The channels to search, in priority order.
    pub channels: Vec<String>,

    /// The requested specs and sub-sections.
    pub dependencies: Vec<MatchSpecOrSubSection>,
}

/// A single dependency entry.
#[derive(Debug, Clone)]
pub enum MatchSpecOrSubSection {
    /// A regular conda match spec.
    MatchSpec(Box<MatchSpec>),

    /// A named sub-section, e.g. `pip:` with its list of requirements.
    SubSection(String, Vec<String>),
}

/// An error that can occur when parsing an environment file.
#[derive(Debug, Error)]
pub enum ParseEnvironmentYamlError {
    /// The file is not valid yaml.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// A dependency entry is not a valid match spec.
    #[error(transparent)]
    InvalidSpec(#[from] ParseMatchSpecError),

    /// A dependency map entry has an unsupported key.
    #[error("unsupported dependency entry '{0}'")]
    UnsupportedEntry(String),

    /// A selector value was not a string.
    #[error("selector '{0}' must map to a single spec string")]
    InvalidSelectorValue(String),

    /// An I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct RawEnvironmentYaml {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Spec(String),
    Map(IndexMap<String, serde_yaml::Value>),
}

/// Evaluates a `sel(...)` selector against a platform.
fn selector_matches(selector: &str, platform: Platform) -> Option<bool> {
    Some(match selector {
        "linux" => platform.is_linux(),
        "osx" => platform.is_osx(),
        "win" => platform.is_windows(),
        "unix" => platform.is_unix(),
        _ => return None,
    })
}

impl EnvironmentYaml {
    /// Parses an environment file, keeping only the entries whose selectors
    /// match the given platform.
    pub fn from_yaml_str(
        contents: &str,
        platform: Platform,
    ) -> Result<Self, ParseEnvironmentYamlError> {
        let raw: RawEnvironmentYaml = serde_yaml::from_str(contents)?;
        let mut dependencies = Vec::with_capacity(raw.dependencies.len());

        for dependency in raw.dependencies {
            match dependency {
                RawDependency::Spec(spec) => {
                    dependencies.push(MatchSpecOrSubSection::MatchSpec(Box::new(
                        MatchSpec::from_str(&spec)?,
                    )));
                }
                RawDependency::Map(map) => {
                    for (key, value) in map {
                        if let Some(selector) = key
                            .strip_prefix("sel(")
                            .and_then(|rest| rest.strip_suffix(')'))
                        {
                            let matches = selector_matches(selector, platform)
                                .ok_or_else(|| {
                                    ParseEnvironmentYamlError::UnsupportedEntry(key.clone())
                                })?;
                            if !matches {
                                continue;
                            }
                            let spec = value.as_str().ok_or_else(|| {
                                ParseEnvironmentYamlError::InvalidSelectorValue(key.clone())
                            })?;
                            dependencies.push(MatchSpecOrSubSection::MatchSpec(Box::new(
                                MatchSpec::from_str(spec)?,
                            )));
                        } else if key == "pip" {
                            let requirements: Vec<String> =
                                serde_yaml::from_value(value.clone())?;
                            dependencies
                                .push(MatchSpecOrSubSection::SubSection(key, requirements));
                        } else {
                            return Err(ParseEnvironmentYamlError::UnsupportedEntry(key));
                        }
                    }
                }
            }
        }

        Ok(Self {
            name: raw.name,
            channels: raw.channels,
            dependencies,
        })
    }

    /// Reads and parses an environment file from disk.
    pub fn from_path(
        path: &Path,
        platform: Platform,
    ) -> Result<Self, ParseEnvironmentYamlError> {
        Self::from_yaml_str(&fs_err::read_to_string(path)?, platform)
    }

    /// Returns only the conda match specs.
    pub fn match_specs(&self) -> impl Iterator<Item = &MatchSpec> + '_ {
        self.dependencies.iter().filter_map(|dep| match dep {
            MatchSpecOrSubSection::MatchSpec(spec) => Some(spec.as_ref()),
            MatchSpecOrSubSection::SubSection(..) => None,
        })
    }

    /// Returns the pip requirements, if a `pip:` sub-section is present.
    pub fn pip_requirements(&self) -> Option<&[String]> {
        self.dependencies.iter().find_map(|dep| match dep {
            MatchSpecOrSubSection::SubSection(name, reqs) if name == "pip" => {
                Some(reqs.as_slice())
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    const ENVIRONMENT: &str = r#"
name: test-env
channels:
  - conda-forge
  - bioconda
dependencies:
  - python >=3.9
  - numpy
  - sel(linux): patchelf
  - sel(win): m2w64-toolchain
  - pip:
      - requests
      - flask>=2
"#;

    #[test]
    fn test_parse_linux() {
        let env = EnvironmentYaml::from_yaml_str(ENVIRONMENT, Platform::Linux64).unwrap();
        assert_eq!(env.name.as_deref(), Some("test-env"));
        assert_eq!(env.channels, vec!["conda-forge", "bioconda"]);

        let specs: Vec<String> = env.match_specs().map(ToString::to_string).collect();
        assert!(specs.iter().any(|s| s.starts_with("patchelf")));
        assert!(!specs.iter().any(|s| s.starts_with("m2w64-toolchain")));
        assert_eq!(specs.len(), 3);

        assert_eq!(
            env.pip_requirements().unwrap(),
            &["requests".to_owned(), "flask>=2".to_owned()]
        );
    }

    #[test]
    fn test_parse_windows_selector() {
        let env = EnvironmentYaml::from_yaml_str(ENVIRONMENT, Platform::Win64).unwrap();
        let specs: Vec<String> = env.match_specs().map(ToString::to_string).collect();
        assert!(specs.iter().any(|s| s.starts_with("m2w64-toolchain")));
        assert!(!specs.iter().any(|s| s.starts_with("patchelf")));
    }

    #[test]
    fn test_unknown_subsection() {
        let yaml = "dependencies:\n  - cargo:\n      - foo\n";
        assert_matches!(
            EnvironmentYaml::from_yaml_str(yaml, Platform::Linux64),
            Err(ParseEnvironmentYamlError::UnsupportedEntry(key)) if key == "cargo"
        );
    }

    #[test]
    fn test_unknown_selector() {
        let yaml = "dependencies:\n  - sel(plan9): foo\n";
        assert_matches!(
            EnvironmentYaml::from_yaml_str(yaml, Platform::Linux64),
            Err(ParseEnvironmentYamlError::UnsupportedEntry(_))
        );
    }

    #[test]
    fn test_empty() {
        let env = EnvironmentYaml::from_yaml_str("{}", Platform::Linux64).unwrap();
        assert!(env.name.is_none());
        assert!(env.channels.is_empty());
        assert!(env.dependencies.is_empty());
    }
}
