//! Per-version manifest mapping file CIDs to workspace paths.
//!
//! Several paths may share one CID (deduplicated content); a CID with no
//! remaining paths drops out of the mapping entirely. Saves go through a
//! temp file plus rename so a crash never leaves a truncated manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cid::Cid;
use crate::Result;

/// Outcome of comparing one manifest against its predecessor, powering the
/// per-version log statistics.
#[derive(Debug, Default, Clone)]
pub struct ManifestDiff {
    /// (cid, path) pairs present now but not before.
    pub added: Vec<(Cid, String)>,
    /// CIDs that no longer appear at any path. Content surviving under a
    /// renamed path is not a deletion.
    pub deleted: Vec<Cid>,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    entries: BTreeMap<Cid, BTreeSet<String>>,
}

impl Manifest {
    /// Empty manifest not bound to any file on disk; used as the baseline
    /// when diffing the first version.
    pub fn empty() -> Self {
        Self {
            path: PathBuf::new(),
            entries: BTreeMap::new(),
        }
    }

    /// Loads the manifest at `path`, or starts an empty one if the file
    /// does not exist yet.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let file = fs::File::open(&path)?;
            serde_yaml::from_reader(file)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    pub fn add(&mut self, cid: Cid, file: impl Into<String>) {
        self.entries.entry(cid).or_default().insert(file.into());
    }

    /// Removes one (cid, path) pair. Returns false when the pair was not
    /// present.
    pub fn rm(&mut self, cid: &Cid, file: &str) -> bool {
        let Some(files) = self.entries.get_mut(cid) else {
            return false;
        };
        if !files.remove(file) {
            return false;
        }
        if files.is_empty() {
            self.entries.remove(cid);
        }
        true
    }

    /// Removes `file` from whichever CID references it.
    pub fn rm_file(&mut self, file: &str) -> bool {
        match self.search(file).cloned() {
            Some(cid) => self.rm(&cid, file),
            None => false,
        }
    }

    /// CID referencing `file`, if any.
    pub fn search(&self, file: &str) -> Option<&Cid> {
        self.entries
            .iter()
            .find(|(_, files)| files.contains(file))
            .map(|(cid, _)| cid)
    }

    pub fn exists(&self, cid: &Cid) -> bool {
        self.entries.contains_key(cid)
    }

    pub fn exists_keyfile(&self, cid: &Cid, file: &str) -> bool {
        self.entries
            .get(cid)
            .map(|files| files.contains(file))
            .unwrap_or(false)
    }

    /// Atomic save via temp file plus rename.
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

    pub fn cids(&self) -> impl Iterator<Item = &Cid> {
        self.entries.keys()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&Cid, &str)> {
        self.entries
            .iter()
            .flat_map(|(cid, files)| files.iter().map(move |file| (cid, file.as_str())))
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.entries.values().flatten().map(String::as_str)
    }

    /// Number of (cid, path) pairs.
    pub fn file_count(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes introduced by `self` relative to `previous`.
    pub fn diff(&self, previous: &Manifest) -> ManifestDiff {
        let added = self
            .pairs()
            .filter(|(cid, file)| !previous.exists_keyfile(cid, file))
            .map(|(cid, file)| (cid.clone(), file.to_string()))
            .collect();

        let deleted = previous
            .cids()
            .filter(|cid| !self.exists(cid))
            .cloned()
            .collect();

        ManifestDiff { added, deleted }
    }
}
