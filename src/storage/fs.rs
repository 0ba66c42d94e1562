//! Filesystem-backed bucket.
//!
//! Serves locally mounted gateways and doubles as the integration-test
//! backend. Remote-side failures surface as transfer errors so the shared
//! retry policy applies uniformly across transports.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::storage::{BucketStore, StoreOutcome};
use crate::{Error, Result};

#[derive(Debug)]
pub struct FsBucket {
    root: PathBuf,
}

impl FsBucket {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(transfer)?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn transfer(err: std::io::Error) -> Error {
    Error::Transfer {
        reason: err.to_string(),
    }
}

impl BucketStore for FsBucket {
    fn file_store(&self, key: &str, src: &Path) -> Result<StoreOutcome> {
        let dst = self.key_path(key);
        if dst.exists() {
            debug!("key [{}] already stored", key);
            return Ok(StoreOutcome::AlreadyExists);
        }

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(transfer)?;
        }
        let temp = dst.with_extension("part");
        fs::copy(src, &temp).map_err(transfer)?;
        fs::rename(&temp, &dst).map_err(transfer)?;
        Ok(StoreOutcome::Stored)
    }

    fn file_get(&self, key: &str, dst: &Path) -> Result<u64> {
        let src = self.key_path(key);
        if !src.exists() {
            return Err(Error::NotFound {
                what: format!("remote key {}", key),
            });
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(transfer)?;
        }
        fs::copy(&src, dst).map_err(transfer)
    }

    fn list_files_from_path(
        &self,
        prefix: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<String>> + Send + '_>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let keys = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    let key = entry
                        .path()
                        .strip_prefix(&root)
                        .ok()?
                        .to_string_lossy()
                        .to_string();
                    key.starts_with(&prefix).then_some(Ok(key))
                }
                Ok(_) => None,
                Err(err) => Some(Err(Error::Transfer {
                    reason: err.to_string(),
                })),
            });
        Ok(Box::new(keys))
    }

    fn file_exists(&self, key: &str) -> Result<bool> {
        Ok(self.key_path(key).exists())
    }

    fn delete_file(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        if !path.exists() {
            return Err(Error::NotFound {
                what: format!("remote key {}", key),
            });
        }
        fs::remove_file(path).map_err(transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_get_round_trip() -> Result<()> {
        let temp = TempDir::new()?;
        let bucket = FsBucket::new(temp.path().join("bucket"))?;

        let src = temp.path().join("src.bin");
        fs::write(&src, "remote payload")?;

        assert_eq!(bucket.file_store("key1", &src)?, StoreOutcome::Stored);
        assert_eq!(bucket.file_store("key1", &src)?, StoreOutcome::AlreadyExists);
        assert!(bucket.file_exists("key1")?);

        let dst = temp.path().join("dst.bin");
        assert_eq!(bucket.file_get("key1", &dst)?, 14);
        assert_eq!(fs::read_to_string(dst)?, "remote payload");
        Ok(())
    }

    #[test]
    fn test_get_missing_key() {
        let temp = TempDir::new().unwrap();
        let bucket = FsBucket::new(temp.path().join("bucket")).unwrap();

        let result = bucket.file_get("absent", &temp.path().join("out"));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_list_with_prefix() -> Result<()> {
        let temp = TempDir::new()?;
        let bucket = FsBucket::new(temp.path().join("bucket"))?;

        let src = temp.path().join("src.bin");
        fs::write(&src, "x")?;
        bucket.file_store("zdj7Waa", &src)?;
        bucket.file_store("zdj7Wbb", &src)?;
        bucket.file_store("other", &src)?;

        let mut keys: Vec<String> = bucket
            .list_files_from_path("zdj7W")?
            .collect::<Result<_>>()?;
        keys.sort();
        assert_eq!(keys, vec!["zdj7Waa", "zdj7Wbb"]);
        Ok(())
    }

    #[test]
    fn test_delete() -> Result<()> {
        let temp = TempDir::new()?;
        let bucket = FsBucket::new(temp.path().join("bucket"))?;

        let src = temp.path().join("src.bin");
        fs::write(&src, "x")?;
        bucket.file_store("key", &src)?;

        bucket.delete_file("key")?;
        assert!(!bucket.file_exists("key")?);
        assert!(matches!(
            bucket.delete_file("key"),
            Err(Error::NotFound { .. })
        ));
        Ok(())
    }
}
