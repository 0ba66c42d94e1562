//! Remote bucket capability.
//!
//! The core never talks to a cloud SDK directly: everything goes through
//! the [`BucketStore`] trait, whose only contract is at-most-once-per-key
//! semantics and byte-exact round trips. Backends are chosen once, at
//! construction, from the closed set of storage schemes.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::config::Config;
use crate::{Error, Result};

mod fs;

pub use fs::FsBucket;

/// The storage schemes a spec's `storage` URI may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScheme {
    S3,
    S3h,
    Gdriveh,
    Azureblobh,
    Sftph,
}

impl StorageScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageScheme::S3 => "s3",
            StorageScheme::S3h => "s3h",
            StorageScheme::Gdriveh => "gdriveh",
            StorageScheme::Azureblobh => "azureblobh",
            StorageScheme::Sftph => "sftph",
        }
    }

    pub const ALL: [StorageScheme; 5] = [
        StorageScheme::S3,
        StorageScheme::S3h,
        StorageScheme::Gdriveh,
        StorageScheme::Azureblobh,
        StorageScheme::Sftph,
    ];
}

impl fmt::Display for StorageScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StorageScheme::ALL
            .into_iter()
            .find(|scheme| scheme.as_str() == s)
            .ok_or_else(|| Error::Config {
                reason: format!("unknown storage scheme [{}]", s),
            })
    }
}

/// A parsed `scheme://bucket` storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    pub scheme: StorageScheme,
    pub bucket: String,
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.bucket)
    }
}

impl FromStr for StorageUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, bucket) = s.split_once("://").ok_or_else(|| Error::Config {
            reason: format!("storage URI [{}] is not of the form scheme://bucket", s),
        })?;
        if bucket.is_empty() {
            return Err(Error::Config {
                reason: format!("storage URI [{}] has an empty bucket", s),
            });
        }
        Ok(Self {
            scheme: scheme.parse()?,
            bucket: bucket.to_string(),
        })
    }
}

/// Result of storing a key that may already exist remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    AlreadyExists,
}

/// Pluggable remote object store for a single bucket.
pub trait BucketStore: Send + Sync {
    /// Uploads `src` under `key`; existing keys are left untouched.
    fn file_store(&self, key: &str, src: &Path) -> Result<StoreOutcome>;

    /// Downloads `key` into `dst` and returns its size.
    fn file_get(&self, key: &str, dst: &Path) -> Result<u64>;

    /// Lazily lists keys starting with `prefix`.
    fn list_files_from_path(&self, prefix: &str)
        -> Result<Box<dyn Iterator<Item = Result<String>> + Send + '_>>;

    fn file_exists(&self, key: &str) -> Result<bool>;

    fn delete_file(&self, key: &str) -> Result<()>;
}

/// Opens the bucket named by `uri`, dispatching on the scheme and the
/// bucket options in `config`.
///
/// The crate ships the filesystem transport (buckets whose `endpoint-url`
/// is a `file://` path, covering locally mounted gateways and tests).
/// Cloud SDK transports plug in as external [`BucketStore`]
/// implementations; a bucket that needs one fails here, before any I/O.
pub fn open_bucket(config: &Config, uri: &StorageUri) -> Result<Box<dyn BucketStore>> {
    let options = config
        .bucket_options(uri.scheme.as_str(), &uri.bucket)
        .ok_or_else(|| Error::Config {
            reason: format!("no storage configured for [{}]", uri),
        })?;

    if let Some(endpoint) = options.endpoint_url.as_deref() {
        if let Some(path) = endpoint.strip_prefix("file://") {
            let root = Path::new(path).join(&uri.bucket);
            return Ok(Box::new(FsBucket::new(root)?));
        }
    }

    Err(Error::Config {
        reason: format!(
            "no transport available for [{}]: configure a file:// endpoint-url or supply a BucketStore implementation",
            uri
        ),
    })
}

/// Retry schedule for remote operations: exponential backoff, transfer
/// errors only. Authentication failures and integrity violations are never
/// retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-call budget, enforced between attempts; transports with real
    /// cancellation also enforce it internally.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let started = std::time::Instant::now();
        let mut delay = self.base_delay;

        for attempt in 1..=self.attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(Error::Transfer { reason })
                    if attempt < self.attempts && started.elapsed() < self.timeout =>
                {
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, self.attempts, reason, delay
                    );
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::Transfer {
            reason: format!("{} exhausted {} attempts", what, self.attempts),
        })
    }
}
