//! Hash-sharded store for assembled whole files.
//!
//! Entries are keyed by an arbitrary name (in practice the file CID) and
//! sharded by the md5 of that name, so the layout scales without the name
//! itself being content-derived. Workspace files are hard-linked against
//! cache entries so identical content converges on a single inode; on
//! filesystems without hard links the store degrades to copies.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Once;

use md5::{Digest, Md5};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cid::shard_path;
use crate::{Error, Result};

pub const DEFAULT_LEVELS: usize = 2;
const MAX_LEVELS: usize = 16;
const STORE_LOG: &str = "store.log";

static HARDLINK_WARNING: Once = Once::new();

/// Hard-links `src` to `dst`, copying instead when the filesystem rejects
/// links. The degradation is reported once per session.
pub(crate) fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::CrossesDevices | io::ErrorKind::Unsupported
            ) =>
        {
            HARDLINK_WARNING.call_once(|| {
                warn!(
                    "filesystem does not support hard links, falling back to copies ({})",
                    err
                );
            });
            fs::copy(src, dst).map(|_| ())
        }
        Err(err) => Err(err),
    }
}

/// Plain hash-sharded file store.
#[derive(Debug)]
pub struct FileCache {
    root: PathBuf,
    log_path: PathBuf,
    levels: usize,
}

impl FileCache {
    /// Opens (creating if needed) a cache rooted at `<path>/hashfs`.
    pub fn new<P: AsRef<Path>>(path: P, levels: usize) -> Result<Self> {
        let root = path.as_ref().join("hashfs");
        let log_dir = root.join("log");
        fs::create_dir_all(&log_dir)?;

        Ok(Self {
            root,
            log_path: log_dir.join(STORE_LOG),
            levels: levels.clamp(1, MAX_LEVELS),
        })
    }

    /// On-disk location for `key`: `<root>/<shard(md5(key))>/<key>`.
    fn key_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Md5::digest(key.as_bytes()));
        self.root.join(shard_path(&digest, 0, self.levels)).join(key)
    }

    /// Stores `src` under its basename and returns the key. If the entry
    /// already exists the source is re-pointed at the stored inode.
    pub fn put(&self, src: &Path) -> Result<String> {
        let key = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::NotFound {
                what: format!("source file {}", src.display()),
            })?
            .to_string();

        self.link(&key, src)?;
        self.log_append(&key)?;
        Ok(key)
    }

    /// Links `file` and the cache entry for `key` to the same inode. If the
    /// entry exists, `file` is replaced by a link to it; otherwise the entry
    /// is created from `file`. Safe under concurrent callers staging
    /// identical content: whoever loses the creation race re-links against
    /// the winner's entry.
    pub fn link(&self, key: &str, file: &Path) -> Result<()> {
        let entry = self.key_path(key);

        if !entry.exists() {
            info!("creating cache entry [{}] for [{}]", key, file.display());
            if let Some(parent) = entry.parent() {
                fs::create_dir_all(parent)?;
            }
            match link_or_copy(file, &entry) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }

        debug!("cache entry [{}] already exists for [{}]", key, file.display());
        fs::remove_file(file)?;
        link_or_copy(&entry, file)?;
        Ok(())
    }

    /// Writes the entry for `key` to `dst` and returns its size.
    pub fn get(&self, key: &str, dst: &Path) -> Result<u64> {
        let entry = self.key_path(key);
        let metadata = fs::metadata(&entry).map_err(|_| Error::NotFound {
            what: format!("cache entry {}", key),
        })?;

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        if dst.exists() {
            fs::remove_file(dst)?;
        }
        link_or_copy(&entry, dst)?;
        Ok(metadata.len())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.key_path(key).exists()
    }

    /// Absolute path of the entry for `key`, whether or not it exists.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.key_path(key)
    }

    /// Lazily yields batches of stored keys, `page_size` at a time,
    /// skipping the store log.
    pub fn walk(&self, page_size: usize) -> impl Iterator<Item = Vec<String>> {
        walk_batches(&self.root, page_size)
    }

    /// Structural integrity check: every entry must be a readable regular
    /// file placed under the shard its name derives. Returns offending keys.
    pub fn fsck(&self, exclude: &[&str]) -> Result<Vec<String>> {
        let mut bad = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name == STORE_LOG || exclude.contains(&name.as_str()) {
                continue;
            }
            if entry.path() != self.key_path(&name) {
                warn!("cache entry [{}] is misplaced", name);
                bad.push(name);
                continue;
            }
            if File::open(entry.path()).is_err() {
                warn!("cache entry [{}] is unreadable", name);
                bad.push(name);
            }
        }
        Ok(bad)
    }

    pub fn reset_log(&self) -> Result<()> {
        debug!("resetting cache store log");
        if self.log_path.exists() {
            fs::remove_file(&self.log_path)?;
        }
        Ok(())
    }

    fn log_append(&self, key: &str) -> Result<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(log, "{}", key)?;
        Ok(())
    }
}

/// Shared walker for the sharded trees: batches file names, skipping the
/// store log, without materializing the whole listing first.
pub(crate) fn walk_batches(root: &Path, page_size: usize) -> impl Iterator<Item = Vec<String>> {
    let mut files = WalkDir::new(root).min_depth(1).into_iter().filter_map(|entry| {
        let entry = entry.ok()?;
        if !entry.file_type().is_file() {
            return None;
        }
        let name = entry.file_name().to_str()?.to_string();
        (name != STORE_LOG).then_some(name)
    });

    let page_size = page_size.max(1);
    std::iter::from_fn(move || {
        let batch: Vec<String> = files.by_ref().take(page_size).collect();
        (!batch.is_empty()).then_some(batch)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_put_and_get_round_trip() -> Result<()> {
        let temp = TempDir::new()?;
        let cache = FileCache::new(temp.path().join("cache"), DEFAULT_LEVELS)?;

        let src = write_file(temp.path(), "sample.bin", "some bytes");
        let key = cache.put(&src)?;
        assert_eq!(key, "sample.bin");
        assert!(cache.exists("sample.bin"));

        let dst = temp.path().join("out.bin");
        let size = cache.get("sample.bin", &dst)?;
        assert_eq!(size, 10);
        assert_eq!(fs::read_to_string(dst)?, "some bytes");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_link_converges_on_single_inode() -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        let temp = TempDir::new()?;
        let cache = FileCache::new(temp.path().join("cache"), DEFAULT_LEVELS)?;

        let first = write_file(temp.path(), "a.bin", "payload");
        cache.link("shared-key", &first)?;

        let second = write_file(temp.path(), "b.bin", "payload");
        cache.link("shared-key", &second)?;

        let entry_ino = fs::metadata(cache.entry_path("shared-key"))?.ino();
        assert_eq!(fs::metadata(&first)?.ino(), entry_ino);
        assert_eq!(fs::metadata(&second)?.ino(), entry_ino);
        Ok(())
    }

    #[test]
    fn test_get_missing_entry() {
        let temp = TempDir::new().unwrap();
        let cache = FileCache::new(temp.path().join("cache"), DEFAULT_LEVELS).unwrap();

        let result = cache.get("absent", &temp.path().join("out"));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_walk_batches_and_skips_log() -> Result<()> {
        let temp = TempDir::new()?;
        let cache = FileCache::new(temp.path().join("cache"), DEFAULT_LEVELS)?;

        for i in 0..5 {
            let src = write_file(temp.path(), &format!("file{}.bin", i), "x");
            cache.put(&src)?;
        }

        let batches: Vec<Vec<String>> = cache.walk(2).collect();
        assert_eq!(batches.len(), 3);
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 5);
        assert!(batches.iter().flatten().all(|name| name != "store.log"));
        Ok(())
    }

    #[test]
    fn test_fsck_reports_misplaced_entry() -> Result<()> {
        let temp = TempDir::new()?;
        let cache = FileCache::new(temp.path().join("cache"), DEFAULT_LEVELS)?;

        let src = write_file(temp.path(), "good.bin", "ok");
        cache.put(&src)?;
        assert!(cache.fsck(&[])?.is_empty());

        // An entry dropped outside its derived shard is structural damage.
        fs::write(cache.root.join("stray.bin"), "oops")?;
        assert_eq!(cache.fsck(&[])?, vec!["stray.bin".to_string()]);
        Ok(())
    }
}
