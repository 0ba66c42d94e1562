//! Staging index: tracks files between `add` and `commit`.
//!
//! Entries survive process restarts (persisted as YAML next to the staged
//! manifest) and are cleared when a commit consumes them. Workers produce
//! entries; only the orchestrator thread mutates the index itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::FileCache;
use crate::cid::Cid;
use crate::objects::ObjectStore;
use crate::spec::Mutability;
use crate::{Error, Result};

const INDEX_FILE: &str = "INDEX.yaml";

/// Per-path staging state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    #[serde(rename = "a")]
    Added,
    #[serde(rename = "d")]
    Deleted,
    #[serde(rename = "c")]
    Corrupted,
    #[serde(rename = "u")]
    Untracked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub cid: Cid,
    pub size: u64,
    pub mtime: u64,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_cid: Option<Cid>,
}

/// The staged set for one entity, keyed by workspace-relative path.
#[derive(Debug)]
pub struct StagingIndex {
    path: PathBuf,
    entries: BTreeMap<String, IndexEntry>,
}

impl StagingIndex {
    /// Loads the index stored in `dir`, or starts empty.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(INDEX_FILE);
        let entries = if path.exists() {
            let file = fs::File::open(&path)?;
            serde_yaml::from_reader(file)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = self.path.with_extension("yaml.tmp");
        let file = fs::File::create(&temp)?;
        serde_yaml::to_writer(file, &self.entries)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: IndexEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn mark_deleted(&mut self, path: impl Into<String>, previous_cid: Cid) {
        self.entries.insert(
            path.into(),
            IndexEntry {
                cid: previous_cid.clone(),
                size: 0,
                mtime: 0,
                status: FileStatus::Deleted,
                previous_cid: Some(previous_cid),
            },
        );
    }

    pub fn mark_corrupted(&mut self, path: &str) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.status = FileStatus::Corrupted;
        }
    }

    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &IndexEntry)> {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops staged additions whose workspace file disappeared again
    /// before commit.
    pub fn prune_added_without_file(&mut self, present: &BTreeSet<&str>) {
        self.entries.retain(|path, entry| {
            entry.status != FileStatus::Added || present.contains(path.as_str())
        });
    }

    /// Drops all entries (a commit consumed them) and persists the empty
    /// state.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save()
    }
}

/// Stages one workspace file: enforces mutability, chunks the content into
/// the object store, and re-points strict/flexible workspace files through
/// the cache so identical content shares an inode.
///
/// Runs on worker threads; it never touches the index itself.
pub fn stage_file(
    objects: &ObjectStore,
    cache: &FileCache,
    mutability: Mutability,
    workspace: &Path,
    rel_path: &str,
    previous_cid: Option<&Cid>,
) -> Result<IndexEntry> {
    let full_path = workspace.join(rel_path);
    let metadata = fs::metadata(&full_path)?;

    let cid = objects.put(&full_path)?;

    if mutability == Mutability::Strict {
        if let Some(previous) = previous_cid {
            if *previous != cid {
                return Err(Error::MutabilityViolation {
                    path: rel_path.to_string(),
                });
            }
        }
    }

    if mutability != Mutability::Mutable {
        cache.link(cid.as_str(), &full_path)?;
    }

    debug!("staged [{}] as [{}]", rel_path, cid);
    Ok(IndexEntry {
        cid,
        size: metadata.len(),
        mtime: metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        status: FileStatus::Added,
        previous_cid: previous_cid.cloned(),
    })
}

/// True when the workspace file is already the cache entry for `cid`
/// (same inode), meaning it cannot have diverged and needs no re-hash.
#[cfg(unix)]
pub fn linked_to_cache(cache: &FileCache, cid: &Cid, file: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let entry = cache.entry_path(cid.as_str());
    match (fs::metadata(&entry), fs::metadata(file)) {
        (Ok(cached), Ok(workspace)) => cached.ino() == workspace.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn linked_to_cache(_cache: &FileCache, _cid: &Cid, _file: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;
    use crate::objects;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        workspace: PathBuf,
        objects: ObjectStore,
        cache: FileCache,
        index_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().join("workspace");
        fs::create_dir_all(&workspace).unwrap();
        let objects = ObjectStore::new(
            temp.path().join("objects"),
            objects::DEFAULT_BLOCK_SIZE,
            objects::DEFAULT_LEVELS,
        )
        .unwrap();
        let cache = FileCache::new(temp.path().join("cache"), cache::DEFAULT_LEVELS).unwrap();
        let index_dir = temp.path().join("index");
        Fixture {
            _temp: temp,
            workspace,
            objects,
            cache,
            index_dir,
        }
    }

    #[test]
    fn test_stage_file_records_entry() -> Result<()> {
        let fx = fixture();
        fs::write(fx.workspace.join("data.bin"), "staged content")?;

        let entry = stage_file(
            &fx.objects,
            &fx.cache,
            Mutability::Strict,
            &fx.workspace,
            "data.bin",
            None,
        )?;

        assert_eq!(entry.status, FileStatus::Added);
        assert_eq!(entry.size, 14);
        assert!(fx.objects.exists(&entry.cid));
        assert!(fx.cache.exists(entry.cid.as_str()));
        assert!(linked_to_cache(&fx.cache, &entry.cid, &fx.workspace.join("data.bin")));
        Ok(())
    }

    #[test]
    fn test_strict_rejects_changed_content() -> Result<()> {
        let fx = fixture();
        let file = fx.workspace.join("data.bin");
        fs::write(&file, "original")?;

        let entry = stage_file(
            &fx.objects,
            &fx.cache,
            Mutability::Strict,
            &fx.workspace,
            "data.bin",
            None,
        )?;

        // Simulate an edit that broke the hard link.
        fs::remove_file(&file)?;
        fs::write(&file, "modified")?;

        let result = stage_file(
            &fx.objects,
            &fx.cache,
            Mutability::Strict,
            &fx.workspace,
            "data.bin",
            Some(&entry.cid),
        );
        assert!(matches!(result, Err(Error::MutabilityViolation { .. })));
        Ok(())
    }

    #[test]
    fn test_flexible_accepts_changed_content() -> Result<()> {
        let fx = fixture();
        let file = fx.workspace.join("data.bin");
        fs::write(&file, "original")?;

        let first = stage_file(
            &fx.objects,
            &fx.cache,
            Mutability::Flexible,
            &fx.workspace,
            "data.bin",
            None,
        )?;

        fs::remove_file(&file)?;
        fs::write(&file, "modified")?;

        let second = stage_file(
            &fx.objects,
            &fx.cache,
            Mutability::Flexible,
            &fx.workspace,
            "data.bin",
            Some(&first.cid),
        )?;

        assert_ne!(first.cid, second.cid);
        assert_eq!(second.previous_cid.as_ref(), Some(&first.cid));
        Ok(())
    }

    #[test]
    fn test_mutable_keeps_workspace_file_unlinked() -> Result<()> {
        let fx = fixture();
        let file = fx.workspace.join("data.bin");
        fs::write(&file, "editable")?;

        let entry = stage_file(
            &fx.objects,
            &fx.cache,
            Mutability::Mutable,
            &fx.workspace,
            "data.bin",
            None,
        )?;

        assert!(!fx.cache.exists(entry.cid.as_str()));
        Ok(())
    }

    #[test]
    fn test_index_survives_reload() -> Result<()> {
        let fx = fixture();

        let mut index = StagingIndex::load(&fx.index_dir)?;
        index.insert(
            "data/a.bin",
            IndexEntry {
                cid: Cid::from("zdj7WgHSKJkoJST5GWGgS53ARqV7oqMGYVvWzEWku3MBfnQ9u"),
                size: 3,
                mtime: 1700000000,
                status: FileStatus::Added,
                previous_cid: None,
            },
        );
        index.mark_deleted(
            "data/b.bin",
            Cid::from("zdj7WnVtg7ZgwzNxwmmDatnEoM3vbuszr3xcVuBYrcFD6XzmW"),
        );
        index.save()?;

        let reloaded = StagingIndex::load(&fx.index_dir)?;
        assert_eq!(reloaded.get("data/a.bin").unwrap().status, FileStatus::Added);
        assert_eq!(
            reloaded.get("data/b.bin").unwrap().status,
            FileStatus::Deleted
        );

        let mut reloaded = reloaded;
        reloaded.clear()?;
        assert!(StagingIndex::load(&fx.index_dir)?.is_empty());
        Ok(())
    }
}
