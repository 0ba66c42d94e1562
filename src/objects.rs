//! Chunked, content-addressed object store.
//!
//! Files are split into fixed-size chunks; each chunk is stored once under
//! its own CID, and a small descriptor object enumerating the chunk CIDs in
//! byte order is stored under *its* CID, which becomes the file CID used by
//! manifests and tags. Every read verifies content against the object name,
//! so corruption is never silently returned to callers.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::cache::walk_batches;
use crate::cid::Cid;
use crate::{Error, Result};

pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;
const MIN_BLOCK_SIZE: usize = 64 * 1024;
const MAX_BLOCK_SIZE: usize = 1024 * 1024;

pub const DEFAULT_LEVELS: usize = 2;
const MAX_LEVELS: usize = 22;

const STORE_LOG: &str = "store.log";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One chunk reference inside a descriptor, in file byte order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkLink {
    #[serde(rename = "Hash")]
    pub hash: Cid,
    #[serde(rename = "Size")]
    pub size: u64,
}

/// Descriptor object enumerating the chunks of one logical file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "Links")]
    pub links: Vec<ChunkLink>,
}

impl Descriptor {
    /// Canonical byte form: stable key order, `", "`/`": "` separators,
    /// UTF-8, no trailing whitespace. The descriptor CID is computed over
    /// exactly these bytes, so the encoding must never drift.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
        self.serialize(&mut ser)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Total file size, summed over chunk links.
    pub fn size(&self) -> u64 {
        self.links.iter().map(|link| link.size).sum()
    }
}

/// JSON formatter writing a space after `,` and `:`, matching the byte
/// layout of descriptors in existing repositories.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> std::io::Result<()>
    where
        W: ?Sized + std::io::Write,
    {
        if !first {
            writer.write_all(b", ")?;
        }
        Ok(())
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> std::io::Result<()>
    where
        W: ?Sized + std::io::Write,
    {
        if !first {
            writer.write_all(b", ")?;
        }
        Ok(())
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> std::io::Result<()>
    where
        W: ?Sized + std::io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Report produced by [`ObjectStore::fsck`].
#[derive(Debug, Default)]
pub struct FsckReport {
    pub corrupted: Vec<Cid>,
    pub repaired: Vec<Cid>,
}

/// Sharded chunk and descriptor store rooted at `<path>/hashfs`.
#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
    log_path: PathBuf,
    block_size: usize,
    levels: usize,
}

impl ObjectStore {
    pub fn new<P: AsRef<Path>>(path: P, block_size: usize, levels: usize) -> Result<Self> {
        let root = path.as_ref().join("hashfs");
        let log_dir = root.join("log");
        fs::create_dir_all(&log_dir)?;

        Ok(Self {
            root,
            log_path: log_dir.join(STORE_LOG),
            block_size: block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE),
            levels: levels.clamp(1, MAX_LEVELS),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// On-disk location for an object: `<root>/<shard(cid)>/<cid>`.
    pub fn object_path(&self, cid: &Cid) -> PathBuf {
        self.root.join(cid.shard(self.levels)).join(cid.as_str())
    }

    /// Chunks `src` into the store and returns the file CID (the CID of the
    /// descriptor object). Chunk writes are idempotent, so concurrent puts
    /// of identical content are race-free.
    pub fn put(&self, src: &Path) -> Result<Cid> {
        let file = File::open(src)?;
        let mut reader = BufReader::new(file);
        let mut buf = vec![0u8; self.block_size];
        let mut links = Vec::new();

        loop {
            let n = read_window(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            let data = &buf[..n];
            let cid = Cid::digest(data);
            self.store_object(&cid, data)?;
            links.push(ChunkLink {
                hash: cid,
                size: n as u64,
            });
        }

        let descriptor = Descriptor { links };
        let bytes = descriptor.to_bytes()?;
        let cid = Cid::digest(&bytes);
        self.store_object(&cid, &bytes)?;
        self.log_append(&cid, &descriptor.links)?;
        Ok(cid)
    }

    /// Assembles the file named by `cid` into `dst`, verifying the
    /// descriptor and every chunk against their names. Returns the number
    /// of bytes written, or 0 after removing any partial output when
    /// corruption is detected.
    pub fn get(&self, cid: &Cid, dst: &Path) -> Result<u64> {
        let descriptor = match self.load_descriptor(cid)? {
            Some(descriptor) => descriptor,
            None => return Ok(0),
        };

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(dst)?);
        let mut written = 0u64;

        for link in &descriptor.links {
            let data = fs::read(self.object_path(&link.hash)).map_err(|_| Error::NotFound {
                what: format!("chunk {}", link.hash),
            })?;
            if Cid::digest(&data) != link.hash {
                error!("corruption detected for chunk [{}]", link.hash);
                drop(out);
                fs::remove_file(dst)?;
                return Ok(0);
            }
            out.write_all(&data)?;
            written += data.len() as u64;
        }

        out.flush()?;
        Ok(written)
    }

    /// Loads and verifies the descriptor object for `cid`. Returns `None`
    /// when the stored bytes do not match their name.
    pub fn load_descriptor(&self, cid: &Cid) -> Result<Option<Descriptor>> {
        let bytes = fs::read(self.object_path(cid)).map_err(|_| Error::NotFound {
            what: format!("object {}", cid),
        })?;
        if Cid::digest(&bytes) != *cid {
            error!("corruption detected for object [{}]", cid);
            return Ok(None);
        }
        Ok(Some(Descriptor::from_bytes(&bytes)?))
    }

    /// True iff the object is present *and* its bytes still hash to its
    /// name. Callers use this as a dedup short-circuit, so a corrupt object
    /// must read as absent.
    pub fn exists(&self, cid: &Cid) -> bool {
        match fs::read(self.object_path(cid)) {
            Ok(bytes) => Cid::digest(&bytes) == *cid,
            Err(_) => false,
        }
    }

    /// Imports externally fetched bytes under `cid` after verifying they
    /// hash to that name.
    pub fn import(&self, cid: &Cid, data: &[u8]) -> Result<bool> {
        if Cid::digest(data) != *cid {
            return Err(Error::Integrity {
                reason: format!("imported bytes do not hash to [{}]", cid),
            });
        }
        self.store_object(cid, data)
    }

    /// Best-effort removal of a single object.
    pub fn remove(&self, cid: &Cid) -> Result<()> {
        let path = self.object_path(cid);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Lazily yields batches of stored object names.
    pub fn walk(&self, page_size: usize) -> impl Iterator<Item = Vec<String>> {
        walk_batches(&self.root, page_size)
    }

    /// Recomputes the CID of every stored object and reports the ones whose
    /// contents no longer match their name.
    pub fn fsck(&self, exclude: &[&str]) -> Result<FsckReport> {
        info!("starting integrity check on [{}]", self.root.display());
        let mut report = FsckReport::default();

        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name == STORE_LOG || exclude.contains(&name.as_str()) {
                continue;
            }
            let bytes = fs::read(entry.path())?;
            if Cid::digest(&bytes).as_str() != name {
                error!("corruption detected for object [{}]", name);
                report.corrupted.push(Cid::from_string(name));
            }
        }

        Ok(report)
    }

    pub fn reset_log(&self) -> Result<()> {
        debug!("resetting object store log");
        if self.log_path.exists() {
            fs::remove_file(&self.log_path)?;
        }
        Ok(())
    }

    /// Writes `data` under `cid` unless already present. Uses a temp file
    /// plus rename so readers never observe partial objects.
    fn store_object(&self, cid: &Cid, data: &[u8]) -> Result<bool> {
        let path = self.object_path(cid);
        if path.exists() {
            debug!("chunk [{}]-[{}] already exists", cid, data.len());
            return Ok(false);
        }

        let parent = path.parent().expect("object path always has a shard parent");
        fs::create_dir_all(parent)?;

        let temp = parent.join(format!(
            ".{}.{}.{}",
            cid.as_str(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        ));
        {
            let mut file = File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        debug!("added chunk [{}]-[{}]", cid, data.len());
        Ok(true)
    }

    fn log_append(&self, descriptor_cid: &Cid, links: &[ChunkLink]) -> Result<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(log, "{}", descriptor_cid)?;
        for link in links {
            writeln!(log, "{}", link.hash)?;
        }
        Ok(())
    }
}

/// Reads until `buf` is full or EOF; plain `read` may return short counts
/// mid-file, which would corrupt chunk boundaries.
fn read_window<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> ObjectStore {
        ObjectStore::new(temp.path().join("objects"), DEFAULT_BLOCK_SIZE, DEFAULT_LEVELS).unwrap()
    }

    fn small_store(temp: &TempDir) -> ObjectStore {
        // Minimum block size keeps multi-chunk fixtures small.
        ObjectStore::new(temp.path().join("objects"), MIN_BLOCK_SIZE, DEFAULT_LEVELS).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);

        let src = temp.path().join("hello.txt");
        fs::write(&src, "hello world\n")?;

        let cid = store.put(&src)?;
        let dst = temp.path().join("out.txt");
        let written = store.get(&cid, &dst)?;

        assert_eq!(written, 12);
        assert_eq!(fs::read(&dst)?, b"hello world\n");
        Ok(())
    }

    #[test]
    fn test_put_is_idempotent() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);

        let src = temp.path().join("data.bin");
        fs::write(&src, "repeated content")?;

        let first = store.put(&src)?;
        let second = store.put(&src)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_identical_content_dedups() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);

        let a = temp.path().join("a.jpg");
        let b = temp.path().join("b.jpg");
        fs::write(&a, "same pixels")?;
        fs::write(&b, "same pixels")?;

        let cid_a = store.put(&a)?;
        let cid_b = store.put(&b)?;
        assert_eq!(cid_a, cid_b);

        // One descriptor plus one chunk.
        let total: usize = store.walk(100).map(|batch| batch.len()).sum();
        assert_eq!(total, 2);
        Ok(())
    }

    #[test]
    fn test_empty_file_has_empty_links() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);

        let src = temp.path().join("empty");
        fs::write(&src, "")?;

        let cid = store.put(&src)?;
        let descriptor = store.load_descriptor(&cid)?.unwrap();
        assert!(descriptor.links.is_empty());

        // Stable across runs.
        assert_eq!(store.put(&src)?, cid);
        Ok(())
    }

    #[test]
    fn test_chunk_boundaries() -> Result<()> {
        let temp = TempDir::new()?;
        let store = small_store(&temp);
        let block = store.block_size();

        let exact = temp.path().join("exact");
        fs::write(&exact, vec![7u8; block])?;
        let descriptor = store.load_descriptor(&store.put(&exact)?)?.unwrap();
        assert_eq!(descriptor.links.len(), 1);
        assert_eq!(descriptor.links[0].size, block as u64);

        let over = temp.path().join("over");
        fs::write(&over, vec![7u8; block + 1])?;
        let descriptor = store.load_descriptor(&store.put(&over)?)?.unwrap();
        assert_eq!(descriptor.links.len(), 2);
        assert_eq!(descriptor.links[0].size, block as u64);
        assert_eq!(descriptor.links[1].size, 1);
        Ok(())
    }

    #[test]
    fn test_descriptor_bytes_are_canonical() -> Result<()> {
        let descriptor = Descriptor {
            links: vec![ChunkLink {
                hash: Cid::from("zdj7WgHSKJkoJST5GWGgS53ARqV7oqMGYVvWzEWku3MBfnQ9u"),
                size: 12,
            }],
        };
        let bytes = descriptor.to_bytes()?;
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "{\"Links\": [{\"Hash\": \"zdj7WgHSKJkoJST5GWGgS53ARqV7oqMGYVvWzEWku3MBfnQ9u\", \"Size\": 12}]}"
        );

        let empty = Descriptor { links: vec![] };
        assert_eq!(String::from_utf8(empty.to_bytes()?).unwrap(), "{\"Links\": []}");
        Ok(())
    }

    #[test]
    fn test_get_detects_corrupted_chunk() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);

        let src = temp.path().join("data.bin");
        fs::write(&src, "trustworthy bytes")?;
        let cid = store.put(&src)?;

        let descriptor = store.load_descriptor(&cid)?.unwrap();
        let chunk_path = store.object_path(&descriptor.links[0].hash);
        fs::write(&chunk_path, "tampered")?;

        let dst = temp.path().join("out.bin");
        assert_eq!(store.get(&cid, &dst)?, 0);
        assert!(!dst.exists(), "partial output must be removed");

        let report = store.fsck(&[])?;
        assert_eq!(report.corrupted.len(), 1);
        assert_eq!(report.corrupted[0], descriptor.links[0].hash);
        Ok(())
    }

    #[test]
    fn test_exists_is_authoritative() -> Result<()> {
        let temp = TempDir::new()?;
        let store = store(&temp);

        let src = temp.path().join("data.bin");
        fs::write(&src, "content")?;
        let cid = store.put(&src)?;
        assert!(store.exists(&cid));

        fs::write(store.object_path(&cid), "changed under us")?;
        assert!(!store.exists(&cid));

        store.remove(&cid)?;
        assert!(!store.exists(&cid));
        Ok(())
    }
}
