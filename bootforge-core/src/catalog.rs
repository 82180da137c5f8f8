//! Distribution catalog: the records a front-end uses to let the user pick a
//! distribution, variant, architecture and version.
//!
//! Records are plain data. How the version list of a record is obtained is
//! decided by a [`VersionRegistry`] lookup on the record's strategy key, never
//! by behaviour attached to the record itself. Building download URLs and
//! downloading images is left to the front-end; the write pipeline only ever
//! sees the resulting image path.

use crate::config::default_config_dir;
use crate::image::ChecksumAlgorithm;
use anyhow::{Context, Result};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

const BUILTIN_CATALOG: &str = include_str!("../data/distributions.json");

/// Used when neither a strategy nor a fallback produces any version.
pub const LATEST: &str = "latest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub family: String,
    #[serde(rename = "checksum_type", alias = "checksumAlgorithm")]
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Registry key of the version strategy. Derived from the distribution
    /// name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_source: Option<String>,
    pub variants: BTreeMap<String, Variant>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Variant {
    #[serde(default)]
    pub architectures: Architectures,
}

/// Architectures are written either as a bare list of names or as a mapping
/// from name to per-architecture data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Architectures {
    List(Vec<String>),
    Map(BTreeMap<String, Architecture>),
}

impl Default for Architectures {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl Architectures {
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::List(names) => names.iter().map(String::as_str).collect(),
            Self::Map(map) => map.keys().map(String::as_str).collect(),
        }
    }

    /// Converts a list into a mapping with empty entries and returns it.
    fn entries_mut(&mut self) -> &mut BTreeMap<String, Architecture> {
        if let Self::List(names) = self {
            let map = names
                .drain(..)
                .map(|name| (name, Architecture::default()))
                .collect();
            *self = Self::Map(map);
        }
        match self {
            Self::Map(map) => map,
            Self::List(_) => unreachable!("list was converted above"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Architecture {
    #[serde(default, deserialize_with = "deserialize_versions")]
    pub versions: Vec<String>,
}

/// Versions may be a list, or a mapping whose keys are the versions (in
/// document order).
fn deserialize_versions<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct VersionsVisitor;

    impl<'de> Visitor<'de> for VersionsVisitor {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a list of versions or a map keyed by version")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
            let mut versions = Vec::new();
            while let Some(version) = seq.next_element::<String>()? {
                versions.push(version);
            }
            Ok(versions)
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut versions = Vec::new();
            while let Some((version, _)) = map.next_entry::<String, de::IgnoredAny>()? {
                versions.push(version);
            }
            Ok(versions)
        }
    }

    deserializer.deserialize_any(VersionsVisitor)
}

/// Produces version lists for strategies that look them up remotely.
pub trait VersionFetcher: Send + Sync {
    fn fetch(&self, key: &str, distribution: &Distribution) -> Result<Vec<String>>;
}

/// How a record's versions are resolved.
pub enum VersionStrategy {
    Static(Vec<String>),
    /// Ask `fetcher`, and use `fallback` when it fails or returns nothing.
    FetchThenFallback {
        fetcher: Box<dyn VersionFetcher>,
        fallback: Vec<String>,
    },
}

/// Fixed table from strategy key to [`VersionStrategy`].
pub struct VersionRegistry {
    strategies: HashMap<String, VersionStrategy>,
}

impl Default for VersionRegistry {
    fn default() -> Self {
        let table: [(&str, &[&str]); 10] = [
            ("ubuntu", &["25.10", "24.04 LTS", "23.10", "22.04 LTS", "20.04 LTS"]),
            ("debian", &["12.4.0", "11.9.0", "10.13.0"]),
            ("linuxmint", &["21.3", "21.2", "21.1", "20.3", "20.2"]),
            ("fedora", &["39", "38", "37", "36", "35"]),
            ("manjaro", &["23.1", "22.1", "21.3", "21.2", "21.1"]),
            ("opensuse", &["15.6", "15.5", "15.4", "15.3", "15.2"]),
            ("mxlinux", &["23.1", "21.3", "21.2", "21.1", "19.4"]),
            ("antix", &["23", "22", "21", "19", "17"]),
            ("puppylinux", &["9.5", "9.0", "8.0", "7.5", "6.0"]),
            ("kalilinux", &["weekly", "2023.3", "2023.2", "2023.1", "2022.4"]),
        ];
        let strategies = table
            .into_iter()
            .map(|(key, versions)| {
                let versions = versions.iter().map(|v| v.to_string()).collect();
                (key.to_string(), VersionStrategy::Static(versions))
            })
            .collect();
        Self { strategies }
    }
}

impl VersionRegistry {
    pub fn register(&mut self, key: impl Into<String>, strategy: VersionStrategy) {
        self.strategies.insert(key.into(), strategy);
    }

    /// Resolves the versions for `distribution`, never returning an empty list.
    pub fn resolve(&self, name: &str, distribution: &Distribution) -> Vec<String> {
        let key = distribution
            .version_source
            .clone()
            .unwrap_or_else(|| strategy_key(name));

        let versions = match self.strategies.get(&key) {
            Some(VersionStrategy::Static(versions)) => versions.clone(),
            Some(VersionStrategy::FetchThenFallback { fetcher, fallback }) => {
                match fetcher.fetch(&key, distribution) {
                    Ok(versions) if !versions.is_empty() => versions,
                    Ok(_) => {
                        log::warn!("No versions found for {name}, using the fallback list");
                        fallback.clone()
                    }
                    Err(e) => {
                        log::warn!("Could not fetch versions of {name}: {e:#}");
                        fallback.clone()
                    }
                }
            }
            None => Vec::new(),
        };

        if versions.is_empty() {
            vec![LATEST.to_string()]
        } else {
            versions
        }
    }
}

/// `"Linux Mint"` -> `"linuxmint"`.
pub fn strategy_key(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// All known distributions, keyed by display name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    distributions: BTreeMap<String, Distribution>,
}

impl Catalog {
    /// The catalog shipped with the library.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG).context("Built-in catalog is malformed")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Loads `path`, or the user catalog when `path` is `None`, falling back
    /// to the built-in catalog when no user catalog exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_path().filter(|p| p.exists()) {
                Some(p) => p,
                None => return Self::builtin(),
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let catalog = Self::from_json(&text)
            .with_context(|| format!("Malformed catalog {}", path.display()))?;
        log::debug!("Loaded {} distributions from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Writes the catalog as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write catalog {}", path.display()))?;
        Ok(())
    }

    /// Fills in versions for every architecture that has none yet.
    pub fn populate_versions(&mut self, registry: &VersionRegistry) {
        for (name, distribution) in &mut self.distributions {
            let versions = registry.resolve(name, distribution);
            for variant in distribution.variants.values_mut() {
                for arch in variant.architectures.entries_mut().values_mut() {
                    if arch.versions.is_empty() {
                        arch.versions = versions.clone();
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.distributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.distributions.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.distributions.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, distribution: Distribution) {
        self.distributions.insert(name.into(), distribution);
    }

    /// Versions of one distribution/variant/architecture, once populated.
    pub fn versions(&self, name: &str, variant: &str, arch: &str) -> Option<&[String]> {
        match &self.get(name)?.variants.get(variant)?.architectures {
            Architectures::Map(map) => map.get(arch).map(|a| a.versions.as_slice()),
            Architectures::List(_) => None,
        }
    }
}

/// `<config dir>/distributions.json`.
pub fn default_path() -> Option<PathBuf> {
    default_config_dir().map(|dir| dir.join("distributions.json"))
}
