//! Configuration as a value.
//!
//! The configuration is assembled once at startup — local file, then
//! environment overrides, then the global file merged underneath — and
//! threaded through constructors. Nothing in the crate reads config state
//! ambiently.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::spec::EntityType;
use crate::{Error, Result};

pub const DEFAULT_BASE_DIR: &str = ".mlkeep";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Per-entity-type settings (currently the metadata remote).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Metadata remote for this entity type; empty means local-only.
    pub git: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub profile: String,
}

/// Options for one configured bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketOptions {
    pub region: Option<String>,
    #[serde(rename = "aws-credentials")]
    pub aws_credentials: Option<AwsCredentials>,
    #[serde(rename = "credentials-path")]
    pub credentials_path: Option<String>,
    #[serde(rename = "endpoint-url")]
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip)]
    root: PathBuf,

    /// Base directory for all repository state, relative to the root.
    pub mlkeep_path: String,

    /// Chunks per transfer batch; must be > 0.
    pub batch_size: usize,

    /// Worker pool size for per-object tasks.
    pub push_threads_count: usize,

    pub verbose: String,

    pub datasets: EntityConfig,
    pub models: EntityConfig,
    pub labels: EntityConfig,

    /// scheme -> bucket -> options.
    pub storages: BTreeMap<String, BTreeMap<String, BucketOptions>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            mlkeep_path: DEFAULT_BASE_DIR.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            push_threads_count: num_cpus::get() * 5,
            verbose: "info".to_string(),
            datasets: EntityConfig::default(),
            models: EntityConfig::default(),
            labels: EntityConfig::default(),
            storages: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Default configuration rooted at `root`, with no file or environment
    /// input. The entry point for tests and embedders.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Loads configuration for the repository at `root`: local
    /// `<root>/<base>/config.yaml`, environment overrides, then the global
    /// config merged underneath (local wins on conflict). Validates before
    /// returning.
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let local_path = root.join(DEFAULT_BASE_DIR).join(CONFIG_FILE);
        let mut config = if local_path.exists() {
            let file = fs::File::open(&local_path)?;
            serde_yaml::from_reader(file)?
        } else {
            Self::default()
        };
        config.root = root;

        config.apply_environment()?;

        if local_path.exists() {
            if let Some(global_path) = global_config_path() {
                if global_path.exists() {
                    debug!("merging global config from {}", global_path.display());
                    let file = fs::File::open(&global_path)?;
                    let global: Config = serde_yaml::from_reader(file)?;
                    config.merge_global(global);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Environment variables override scalar keys by upper-cased name.
    fn apply_environment(&mut self) -> Result<()> {
        if let Ok(value) = env::var("MLKEEP_PATH") {
            self.mlkeep_path = value;
        }
        if let Ok(value) = env::var("BATCH_SIZE") {
            self.batch_size = value.parse().map_err(|_| Error::Config {
                reason: format!("BATCH_SIZE must be a positive integer, got [{}]", value),
            })?;
        }
        if let Ok(value) = env::var("PUSH_THREADS_COUNT") {
            self.push_threads_count = value.parse().map_err(|_| Error::Config {
                reason: format!(
                    "PUSH_THREADS_COUNT must be a positive integer, got [{}]",
                    value
                ),
            })?;
        }
        if let Ok(value) = env::var("VERBOSE") {
            self.verbose = value;
        }
        Ok(())
    }

    /// Fills gaps from the global config: empty metadata remotes and
    /// buckets not configured locally.
    fn merge_global(&mut self, global: Config) {
        for entity_type in EntityType::ALL {
            if self.entity(entity_type).git.is_empty() {
                self.entity_mut(entity_type).git = global.entity(entity_type).git.clone();
            }
        }
        for (scheme, buckets) in global.storages {
            let local = self.storages.entry(scheme).or_default();
            for (bucket, options) in buckets {
                local.entry(bucket).or_insert(options);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config {
                reason: "batch_size must be greater than 0".to_string(),
            });
        }
        if self.push_threads_count == 0 {
            return Err(Error::Config {
                reason: "push_threads_count must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn entity(&self, entity_type: EntityType) -> &EntityConfig {
        match entity_type {
            EntityType::Datasets => &self.datasets,
            EntityType::Models => &self.models,
            EntityType::Labels => &self.labels,
        }
    }

    fn entity_mut(&mut self, entity_type: EntityType) -> &mut EntityConfig {
        match entity_type {
            EntityType::Datasets => &mut self.datasets,
            EntityType::Models => &mut self.models,
            EntityType::Labels => &mut self.labels,
        }
    }

    pub fn bucket_options(&self, scheme: &str, bucket: &str) -> Option<&BucketOptions> {
        self.storages.get(scheme)?.get(bucket)
    }

    pub fn set_bucket_options(&mut self, scheme: &str, bucket: &str, options: BucketOptions) {
        self.storages
            .entry(scheme.to_string())
            .or_default()
            .insert(bucket.to_string(), options);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base_path(&self) -> PathBuf {
        self.root.join(&self.mlkeep_path)
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.base_path().join(CONFIG_FILE)
    }

    /// Workspace directory for one entity.
    pub fn workspace_path(&self, entity_type: EntityType, entity: &str) -> PathBuf {
        self.root.join(entity_type.as_str()).join(entity)
    }

    pub fn index_path(&self, entity_type: EntityType) -> PathBuf {
        self.base_path().join(entity_type.as_str()).join("index")
    }

    pub fn index_metadata_path(&self, entity_type: EntityType, entity: &str) -> PathBuf {
        self.index_path(entity_type).join("metadata").join(entity)
    }

    pub fn objects_path(&self, entity_type: EntityType) -> PathBuf {
        self.base_path().join(entity_type.as_str()).join("objects")
    }

    pub fn cache_path(&self, entity_type: EntityType) -> PathBuf {
        self.base_path().join(entity_type.as_str()).join("cache")
    }

    pub fn metadata_path(&self, entity_type: EntityType) -> PathBuf {
        self.base_path().join(entity_type.as_str()).join("metadata")
    }

    pub fn refs_path(&self, entity_type: EntityType) -> PathBuf {
        self.base_path().join(entity_type.as_str()).join("refs")
    }

    /// Writes the current configuration to the local config file.
    pub fn save(&self) -> Result<()> {
        let path = self.config_file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&path)?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }
}

fn global_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_BASE_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mlkeep_path, DEFAULT_BASE_DIR);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.push_threads_count > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_path_layout() {
        let config = Config::with_root("/repo");
        assert_eq!(
            config.objects_path(EntityType::Datasets),
            PathBuf::from("/repo/.mlkeep/datasets/objects")
        );
        assert_eq!(
            config.index_metadata_path(EntityType::Datasets, "dataset-ex"),
            PathBuf::from("/repo/.mlkeep/datasets/index/metadata/dataset-ex")
        );
        assert_eq!(
            config.metadata_path(EntityType::Models),
            PathBuf::from("/repo/.mlkeep/models/metadata")
        );
        assert_eq!(
            config.workspace_path(EntityType::Datasets, "dataset-ex"),
            PathBuf::from("/repo/datasets/dataset-ex")
        );
    }

    #[test]
    fn test_load_reads_local_file() -> Result<()> {
        let temp = TempDir::new()?;
        let config_dir = temp.path().join(DEFAULT_BASE_DIR);
        fs::create_dir_all(&config_dir)?;
        fs::write(
            config_dir.join(CONFIG_FILE),
            "batch_size: 7\ndatasets:\n  git: /srv/metadata.git\nstorages:\n  s3h:\n    my-bucket:\n      region: us-east-1\n      endpoint-url: file:///tmp/buckets\n",
        )?;

        let config = Config::load(temp.path())?;
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.datasets.git, "/srv/metadata.git");
        let options = config.bucket_options("s3h", "my-bucket").unwrap();
        assert_eq!(options.region.as_deref(), Some("us-east-1"));
        assert_eq!(options.endpoint_url.as_deref(), Some("file:///tmp/buckets"));
        Ok(())
    }

    #[test]
    fn test_merge_global_fills_gaps_only() {
        let mut local = Config::default();
        local.datasets.git = "/local.git".to_string();
        local.set_bucket_options("s3h", "shared", BucketOptions {
            region: Some("local-region".to_string()),
            ..Default::default()
        });

        let mut global = Config::default();
        global.datasets.git = "/global.git".to_string();
        global.models.git = "/global-models.git".to_string();
        global.set_bucket_options("s3h", "shared", BucketOptions {
            region: Some("global-region".to_string()),
            ..Default::default()
        });
        global.set_bucket_options("s3h", "extra", BucketOptions::default());

        local.merge_global(global);

        assert_eq!(local.datasets.git, "/local.git");
        assert_eq!(local.models.git, "/global-models.git");
        assert_eq!(
            local.bucket_options("s3h", "shared").unwrap().region.as_deref(),
            Some("local-region")
        );
        assert!(local.bucket_options("s3h", "extra").is_some());
    }
}
