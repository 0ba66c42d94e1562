//! Per-entity versioned metadata: spec + manifest trees, commits, tags.
//!
//! The metadata tree holds, for every entity, its spec and the manifest of
//! each committed version, laid out as `<categories…>/<entity>/`. Commits
//! snapshot the entity subtree into a content-addressed history; tags name
//! commits and are the immutable handles fetch/checkout resolve. A
//! directory remote provides the push/fetch counterpart — any store with
//! tag semantics can stand in for it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::spec::{EntitySpec, EntityType, TagRef};
use crate::{Error, Result};

const HISTORY_DIR: &str = ".history";
const COMMITS_FILE: &str = "commits.yaml";
const TAGS_FILE: &str = "tags.yaml";
const BRANCH_FILE: &str = "BRANCH";
const DEFAULT_BRANCH: &str = "main";
const HEAD_FILE: &str = "HEAD";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: String,
    pub parent: Option<String>,
    pub subpath: String,
    pub message: String,
    pub timestamp: u64,
}

#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    refs_path: PathBuf,
    entity_type: EntityType,
    remote: Option<PathBuf>,
}

impl MetadataStore {
    pub fn new(
        path: PathBuf,
        refs_path: PathBuf,
        entity_type: EntityType,
        remote: Option<PathBuf>,
    ) -> Self {
        Self {
            path,
            refs_path,
            entity_type,
            remote,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Initializes the local metadata store, pulling from the remote when
    /// one is configured and no local history exists yet.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.history_dir())?;
        fs::create_dir_all(&self.refs_path)?;

        if !self.commits_path().exists() {
            if let Some(remote) = &self.remote {
                if remote.exists() {
                    info!("cloning metadata from [{}]", remote.display());
                    self.fetch_from_remote()?;
                }
            }
        }

        let branch_path = self.history_dir().join(BRANCH_FILE);
        if !branch_path.exists() {
            fs::write(branch_path, DEFAULT_BRANCH)?;
        }
        Ok(())
    }

    /// Clones the remote metadata into this (empty) store.
    pub fn clone_from_remote(&self) -> Result<()> {
        let remote = self.require_remote()?;
        if !remote.exists() {
            return Err(Error::NotFound {
                what: format!("metadata remote {}", remote.display()),
            });
        }
        copy_dir_all(remote, &self.path)?;
        fs::create_dir_all(&self.refs_path)?;
        Ok(())
    }

    pub fn check_exists(&self) -> bool {
        self.commits_path().exists()
    }

    pub fn default_branch(&self) -> String {
        fs::read_to_string(self.history_dir().join(BRANCH_FILE))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| DEFAULT_BRANCH.to_string())
    }

    /// Forgets the configured remote. Returns whether one was set.
    pub fn delete_remote_reference(&mut self) -> bool {
        self.remote.take().is_some()
    }

    /// Snapshots the working tree under `subpath` as a new commit and
    /// returns the commit id.
    pub fn commit(&self, subpath: &Path, message: &str) -> Result<String> {
        let tree = self.path.join(subpath);
        if !tree.exists() {
            return Err(Error::NotFound {
                what: format!("metadata subtree {}", tree.display()),
            });
        }

        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        for entry in WalkDir::new(&tree).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.path)
                .expect("walk stays under the metadata root")
                .to_string_lossy()
                .replace('\\', "/");
            files.push((rel, fs::read(entry.path())?));
        }

        let mut commits = self.commits()?;
        let parent = commits.last().map(|record| record.id.clone());
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut hasher = Sha256::new();
        if let Some(parent) = &parent {
            hasher.update(parent.as_bytes());
        }
        hasher.update(subpath.to_string_lossy().as_bytes());
        hasher.update(message.as_bytes());
        hasher.update(timestamp.to_be_bytes());
        for (rel, content) in &files {
            hasher.update(rel.as_bytes());
            hasher.update(Sha256::digest(content));
        }
        let id = hex::encode(hasher.finalize());

        let snapshot = self.history_dir().join(&id);
        for (rel, content) in &files {
            let dst = snapshot.join(rel);
            if let Some(parent_dir) = dst.parent() {
                fs::create_dir_all(parent_dir)?;
            }
            fs::write(dst, content)?;
        }

        commits.push(CommitRecord {
            id: id.clone(),
            parent,
            subpath: subpath.to_string_lossy().replace('\\', "/"),
            message: message.to_string(),
            timestamp,
        });
        save_yaml(&self.commits_path(), &commits)?;

        debug!("committed [{}] as [{}]", subpath.display(), id);
        Ok(id)
    }

    pub fn commits(&self) -> Result<Vec<CommitRecord>> {
        load_yaml(&self.commits_path())
    }

    pub fn commit_record(&self, id: &str) -> Result<Option<CommitRecord>> {
        Ok(self.commits()?.into_iter().find(|record| record.id == id))
    }

    /// Attaches `tag` to the latest commit.
    pub fn tag_add(&self, tag: &str) -> Result<()> {
        let mut tags = self.tags()?;
        if tags.contains_key(tag) {
            return Err(Error::VersionConflict {
                tag: tag.to_string(),
            });
        }
        let head = self
            .commits()?
            .last()
            .map(|record| record.id.clone())
            .ok_or_else(|| Error::NotFound {
                what: "commit to tag".to_string(),
            })?;
        tags.insert(tag.to_string(), head);
        save_yaml(&self.tags_path(), &tags)
    }

    pub fn list_tags(&self) -> Result<Vec<String>> {
        Ok(self.tags()?.into_keys().collect())
    }

    pub fn tag_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.tags()?.contains_key(tag))
    }

    pub fn tag_commit(&self, tag: &str) -> Result<String> {
        self.tags()?.remove(tag).ok_or_else(|| Error::NotFound {
            what: format!("tag {}", tag),
        })
    }

    /// Resolves the tag for `entity` at `version` (`None` = latest).
    pub fn get_tag(&self, entity: &str, version: Option<usize>) -> Result<String> {
        target_tag(&self.list_tags()?, entity, version)
    }

    /// Restores the working tree files recorded by `tag`'s commit.
    pub fn checkout_tag(&self, tag: &str) -> Result<()> {
        let commit = self.tag_commit(tag)?;
        let snapshot = self.history_dir().join(&commit);
        if !snapshot.exists() {
            return Err(Error::NotFound {
                what: format!("history snapshot for commit {}", commit),
            });
        }
        copy_dir_all(&snapshot, &self.path)?;
        Ok(())
    }

    /// History snapshot directory for `commit`.
    pub fn snapshot_path(&self, commit: &str) -> PathBuf {
        self.history_dir().join(commit)
    }

    /// Raw content of `rel_path` as recorded by `commit`.
    pub fn spec_content_from_ref(&self, commit: &str, rel_path: &str) -> Result<String> {
        let path = self.history_dir().join(commit).join(rel_path);
        fs::read_to_string(&path).map_err(|_| Error::NotFound {
            what: format!("{} at commit {}", rel_path, commit),
        })
    }

    /// Every committed version of `entity`'s spec, oldest first, for
    /// version-over-version comparisons.
    pub fn get_specs_to_compare(&self, entity: &str) -> Result<Vec<(String, EntitySpec)>> {
        let mut tags: Vec<(TagRef, String)> = self
            .list_tags()?
            .into_iter()
            .filter_map(|tag| {
                let parsed = TagRef::parse(&tag)?;
                (parsed.name == entity).then_some((parsed, tag))
            })
            .collect();
        tags.sort_by_key(|(parsed, _)| parsed.version);

        let mut specs = Vec::new();
        for (parsed, tag) in tags {
            let commit = self.tag_commit(&tag)?;
            let mut rel: PathBuf = parsed.categories.iter().collect();
            rel.push(&parsed.name);
            rel.push(format!("{}.spec", parsed.name));
            let content = self.spec_content_from_ref(&commit, &rel.to_string_lossy())?;
            let doc: BTreeMap<String, EntitySpec> = serde_yaml::from_str(&content)?;
            if let Some(spec) = doc.into_iter().find_map(|(key, spec)| {
                (key == self.entity_type.as_str()).then_some(spec)
            }) {
                specs.push((tag, spec));
            }
        }
        Ok(specs)
    }

    /// Publishes local commits and tags to the configured remote. The
    /// caller is responsible for ordering this after object uploads.
    pub fn push_to_remote(&self) -> Result<()> {
        let remote = self.require_remote()?;
        info!("pushing metadata to [{}]", remote.display());
        copy_dir_all(&self.path, remote).map_err(|err| Error::Transfer {
            reason: format!("metadata push failed: {}", err),
        })
    }

    pub fn fetch_from_remote(&self) -> Result<()> {
        let remote = self.require_remote()?;
        if !remote.exists() {
            return Err(Error::NotFound {
                what: format!("metadata remote {}", remote.display()),
            });
        }
        copy_dir_all(remote, &self.path).map_err(|err| Error::Transfer {
            reason: format!("metadata fetch failed: {}", err),
        })
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn set_head(&self, entity: &str, tag: &str) -> Result<()> {
        let dir = self.refs_path.join(entity);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(HEAD_FILE), tag)?;
        Ok(())
    }

    pub fn head(&self, entity: &str) -> Result<Option<String>> {
        let path = self.refs_path.join(entity).join(HEAD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?.trim().to_string()))
    }

    fn require_remote(&self) -> Result<&Path> {
        self.remote.as_deref().ok_or_else(|| Error::Config {
            reason: format!(
                "no metadata remote configured for [{}]",
                self.entity_type
            ),
        })
    }

    fn history_dir(&self) -> PathBuf {
        self.path.join(HISTORY_DIR)
    }

    fn commits_path(&self) -> PathBuf {
        self.history_dir().join(COMMITS_FILE)
    }

    fn tags_path(&self) -> PathBuf {
        self.history_dir().join(TAGS_FILE)
    }

    fn tags(&self) -> Result<BTreeMap<String, String>> {
        load_yaml(&self.tags_path())
    }
}

/// Resolves which tag `name`@`version` refers to.
///
/// With `version` given, exactly one candidate must carry it; with `None`,
/// the name must be unique across category paths before the highest
/// version wins.
pub fn target_tag(tags: &[String], name: &str, version: Option<usize>) -> Result<String> {
    let matches: Vec<(TagRef, &String)> = tags
        .iter()
        .filter_map(|tag| {
            let parsed = TagRef::parse(tag)?;
            (parsed.name == name).then_some((parsed, tag))
        })
        .collect();

    if matches.is_empty() {
        return Err(Error::EntityNotFound {
            name: name.to_string(),
        });
    }

    let latest = matches
        .iter()
        .map(|(parsed, _)| parsed.version)
        .max()
        .expect("matches is non-empty");

    match version {
        Some(version) => {
            let candidates: Vec<&String> = matches
                .iter()
                .filter(|(parsed, _)| parsed.version == version)
                .map(|(_, tag)| *tag)
                .collect();
            match candidates.as_slice() {
                [] => Err(Error::VersionNotFound {
                    name: name.to_string(),
                    version,
                    latest,
                }),
                [tag] => Ok((*tag).clone()),
                _ => Err(Error::AmbiguousEntity {
                    name: name.to_string(),
                    candidates: candidates.iter().map(|tag| (*tag).clone()).collect(),
                }),
            }
        }
        None => {
            let mut category_paths: Vec<&[String]> = matches
                .iter()
                .map(|(parsed, _)| parsed.categories.as_slice())
                .collect();
            category_paths.sort();
            category_paths.dedup();
            if category_paths.len() > 1 {
                return Err(Error::AmbiguousEntity {
                    name: name.to_string(),
                    candidates: matches.iter().map(|(_, tag)| (*tag).clone()).collect(),
                });
            }
            Ok(matches
                .into_iter()
                .find(|(parsed, _)| parsed.version == latest)
                .map(|(_, tag)| tag.clone())
                .expect("latest version exists"))
        }
    }
}

fn load_yaml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let file = fs::File::open(path)?;
    Ok(serde_yaml::from_reader(file)?)
}

fn save_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("yaml.tmp");
    let file = fs::File::create(&temp)?;
    serde_yaml::to_writer(file, value)?;
    fs::rename(&temp, path)?;
    Ok(())
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walk stays under src");
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ManifestSection, Mutability};
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> MetadataStore {
        MetadataStore::new(
            temp.path().join("metadata"),
            temp.path().join("refs"),
            EntityType::Datasets,
            None,
        )
    }

    fn remote_store(temp: &TempDir) -> MetadataStore {
        MetadataStore::new(
            temp.path().join("metadata"),
            temp.path().join("refs"),
            EntityType::Datasets,
            Some(temp.path().join("remote.git")),
        )
    }

    fn sample_spec(version: usize) -> EntitySpec {
        EntitySpec {
            categories: vec!["computer-vision".to_string(), "images".to_string()],
            mutability: Mutability::Strict,
            manifest: ManifestSection {
                files: "MANIFEST.yaml".to_string(),
                storage: "s3h://mlkeep-datasets".to_string(),
            },
            name: "dataset-ex".to_string(),
            version,
        }
    }

    fn write_entity(store: &MetadataStore, spec: &EntitySpec) -> PathBuf {
        let subpath = spec.metadata_subpath();
        let dir = store.path().join(&subpath);
        fs::create_dir_all(&dir).unwrap();
        spec.save(&dir.join(spec.spec_file_name()), EntityType::Datasets)
            .unwrap();
        fs::write(dir.join("MANIFEST.yaml"), "{}\n").unwrap();
        subpath
    }

    #[test]
    fn test_target_tag_resolution() {
        let tags = vec![
            "computer__images__dataset-ex__1".to_string(),
            "computer__images__dataset-ex__2".to_string(),
            "computer__videos__dataset-ex__1".to_string(),
        ];

        assert!(matches!(
            target_tag(&tags, "dataset-ex", None),
            Err(Error::AmbiguousEntity { .. })
        ));
        assert!(matches!(
            target_tag(&tags, "dataset-ex", Some(1)),
            Err(Error::AmbiguousEntity { .. })
        ));
        assert_eq!(
            target_tag(&tags, "dataset-ex", Some(2)).unwrap(),
            "computer__images__dataset-ex__2"
        );
        assert!(matches!(
            target_tag(&tags, "dataset-wrong", Some(1)),
            Err(Error::EntityNotFound { .. })
        ));
        assert!(matches!(
            target_tag(&tags, "dataset-ex", Some(9)),
            Err(Error::VersionNotFound { latest: 2, .. })
        ));
    }

    #[test]
    fn test_target_tag_latest_single_category() {
        let tags = vec![
            "computer__images__dataset-ex__1".to_string(),
            "computer__images__dataset-ex__2".to_string(),
        ];
        assert_eq!(
            target_tag(&tags, "dataset-ex", None).unwrap(),
            "computer__images__dataset-ex__2"
        );
    }

    #[test]
    fn test_commit_tag_and_head() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);
        store.init()?;

        let spec = sample_spec(1);
        let subpath = write_entity(&store, &spec);

        let commit = store.commit(&subpath, "first version")?;
        store.tag_add(&spec.tag())?;

        assert!(store.tag_exists(&spec.tag())?);
        assert_eq!(store.tag_commit(&spec.tag())?, commit);
        assert!(matches!(
            store.tag_add(&spec.tag()),
            Err(Error::VersionConflict { .. })
        ));

        store.set_head(&spec.name, &spec.tag())?;
        assert_eq!(store.head(&spec.name)?.as_deref(), Some(spec.tag().as_str()));
        assert_eq!(store.default_branch(), "main");
        Ok(())
    }

    #[test]
    fn test_spec_content_from_ref_round_trip() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);
        store.init()?;

        let spec = sample_spec(1);
        let subpath = write_entity(&store, &spec);
        let commit = store.commit(&subpath, "msg")?;

        let rel = "computer-vision/images/dataset-ex/dataset-ex.spec";
        let content = store.spec_content_from_ref(&commit, rel)?;
        let on_disk = fs::read_to_string(store.path().join(rel))?;
        assert_eq!(content, on_disk);
        Ok(())
    }

    #[test]
    fn test_checkout_tag_restores_earlier_manifest() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);
        store.init()?;

        let spec_v1 = sample_spec(1);
        let subpath = write_entity(&store, &spec_v1);
        let manifest_path = store.path().join(&subpath).join("MANIFEST.yaml");
        fs::write(&manifest_path, "version-one\n")?;
        store.commit(&subpath, "v1")?;
        store.tag_add(&spec_v1.tag())?;

        fs::write(&manifest_path, "version-two\n")?;
        store.commit(&subpath, "v2")?;
        store.tag_add(&sample_spec(2).tag())?;

        store.checkout_tag(&spec_v1.tag())?;
        assert_eq!(fs::read_to_string(&manifest_path)?, "version-one\n");
        Ok(())
    }

    #[test]
    fn test_specs_to_compare_orders_versions() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);
        store.init()?;

        for version in 1..=2 {
            let spec = sample_spec(version);
            let subpath = write_entity(&store, &spec);
            store.commit(&subpath, "msg")?;
            store.tag_add(&spec.tag())?;
        }

        let specs = store.get_specs_to_compare("dataset-ex")?;
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].1.version, 1);
        assert_eq!(specs[1].1.version, 2);
        Ok(())
    }

    #[test]
    fn test_push_and_clone_via_directory_remote() -> Result<()> {
        let temp = TempDir::new()?;
        let store = remote_store(&temp);
        store.init()?;

        let spec = sample_spec(1);
        let subpath = write_entity(&store, &spec);
        store.commit(&subpath, "msg")?;
        store.tag_add(&spec.tag())?;
        store.push_to_remote()?;

        let clone_dir = TempDir::new()?;
        let clone = MetadataStore::new(
            clone_dir.path().join("metadata"),
            clone_dir.path().join("refs"),
            EntityType::Datasets,
            Some(temp.path().join("remote.git")),
        );
        clone.init()?;
        assert!(clone.check_exists());
        assert!(clone.tag_exists(&spec.tag())?);
        Ok(())
    }

    #[test]
    fn test_delete_remote_reference() {
        let temp = TempDir::new().unwrap();
        let mut store = remote_store(&temp);
        assert!(store.has_remote());
        assert!(store.delete_remote_reference());
        assert!(!store.has_remote());
        assert!(!store.delete_remote_reference());
        assert!(matches!(
            store.push_to_remote(),
            Err(Error::Config { .. })
        ));
    }
}
