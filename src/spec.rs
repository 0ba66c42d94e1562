//! Typed entity spec records and tag synthesis.
//!
//! The spec file is the per-entity descriptor committed next to each
//! version's manifest. It is validated at the parse boundary; the rest of
//! the crate only ever sees well-formed values.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::storage::StorageUri;
use crate::{Error, Result};

pub const SPEC_EXTENSION: &str = ".spec";
pub const DEFAULT_MANIFEST_FILES: &str = "MANIFEST.yaml";

/// Separator inside tags; spec components must never contain it.
pub const TAG_SEPARATOR: &str = "__";

/// The kinds of versioned artifact collections a repository manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Datasets,
    Models,
    Labels,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Datasets => "datasets",
            EntityType::Models => "models",
            EntityType::Labels => "labels",
        }
    }

    pub const ALL: [EntityType; 3] = [EntityType::Datasets, EntityType::Models, EntityType::Labels];
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "datasets" => Ok(EntityType::Datasets),
            "models" => Ok(EntityType::Models),
            "labels" => Ok(EntityType::Labels),
            other => Err(Error::Config {
                reason: format!("unknown entity type [{}]", other),
            }),
        }
    }
}

/// Per-entity policy governing whether committed files may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutability {
    /// Files are immutable once committed; re-adding changed content fails.
    Strict,
    /// Re-add permitted; the previous CID is retained in history.
    Flexible,
    /// Re-add permitted and workspace files stay directly editable.
    Mutable,
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mutability::Strict => "strict",
            Mutability::Flexible => "flexible",
            Mutability::Mutable => "mutable",
        };
        write!(f, "{}", s)
    }
}

/// `manifest:` section of a spec file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSection {
    #[serde(default = "default_manifest_files")]
    pub files: String,
    pub storage: String,
}

fn default_manifest_files() -> String {
    DEFAULT_MANIFEST_FILES.to_string()
}

/// Per-entity descriptor: categories, mutability, manifest location and
/// remote storage, name and version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySpec {
    pub categories: Vec<String>,
    pub mutability: Mutability,
    pub manifest: ManifestSection,
    pub name: String,
    pub version: usize,
}

impl EntitySpec {
    /// Loads and validates the spec for `entity_type` from a YAML file
    /// keyed by entity type at the top level.
    pub fn load(path: &Path, entity_type: EntityType) -> Result<Self> {
        let file = fs::File::open(path).map_err(|_| Error::NotFound {
            what: format!("spec file {}", path.display()),
        })?;
        let doc: BTreeMap<String, EntitySpec> = serde_yaml::from_reader(file)?;
        let spec = doc
            .into_iter()
            .find(|(key, _)| key == entity_type.as_str())
            .map(|(_, spec)| spec)
            .ok_or_else(|| Error::Config {
                reason: format!(
                    "spec file {} has no [{}] section",
                    path.display(),
                    entity_type
                ),
            })?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn save(&self, path: &Path, entity_type: EntityType) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let doc = BTreeMap::from([(entity_type.as_str().to_string(), self.clone())]);
        let file = fs::File::create(path)?;
        serde_yaml::to_writer(file, &doc)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config {
                reason: "spec name must not be empty".to_string(),
            });
        }
        if self.version < 1 {
            return Err(Error::Config {
                reason: format!("spec version must be >= 1, got {}", self.version),
            });
        }
        if self.categories.is_empty() {
            return Err(Error::Config {
                reason: "spec must declare at least one category".to_string(),
            });
        }
        for component in self.categories.iter().chain(std::iter::once(&self.name)) {
            if component.contains(TAG_SEPARATOR) {
                return Err(Error::Config {
                    reason: format!("spec component [{}] must not contain '__'", component),
                });
            }
        }
        self.storage_uri()?;
        Ok(())
    }

    pub fn storage_uri(&self) -> Result<StorageUri> {
        self.manifest.storage.parse()
    }

    /// Immutable name of this spec's version:
    /// `cat1__cat2__…__name__version`.
    pub fn tag(&self) -> String {
        let mut parts = self.categories.clone();
        parts.push(self.name.clone());
        parts.push(self.version.to_string());
        parts.join(TAG_SEPARATOR)
    }

    /// Relative directory of this entity inside the metadata tree:
    /// `<cat1>/<cat2>/…/<name>`.
    pub fn metadata_subpath(&self) -> PathBuf {
        let mut path: PathBuf = self.categories.iter().collect();
        path.push(&self.name);
        path
    }

    pub fn spec_file_name(&self) -> String {
        format!("{}{}", self.name, SPEC_EXTENSION)
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}

/// A tag split back into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRef {
    pub categories: Vec<String>,
    pub name: String,
    pub version: usize,
}

impl TagRef {
    /// Parses `cat1__…__name__version`; returns `None` for malformed tags.
    pub fn parse(tag: &str) -> Option<Self> {
        let mut parts: Vec<&str> = tag.split(TAG_SEPARATOR).collect();
        if parts.len() < 3 {
            return None;
        }
        let version = parts.pop()?.parse().ok()?;
        let name = parts.pop()?.to_string();
        Some(Self {
            categories: parts.into_iter().map(str::to_string).collect(),
            name,
            version,
        })
    }
}
