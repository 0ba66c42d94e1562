//! Content identifiers with hash-derived shard paths.
//!
//! Every object in the store is named by a CIDv1 wrapping a sha2-256
//! multihash with the dag-pb codec, rendered as a base58btc string. The
//! rendered form is what appears in manifests, tags and on disk.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const CID_VERSION: u8 = 0x01;
const DAG_PB_CODEC: u8 = 0x70;
const SHA2_256_CODE: u8 = 0x12;
const SHA2_256_LEN: u8 = 0x20;
const BASE58BTC_PREFIX: char = 'z';

/// Leading characters shared by every rendered CID (multibase prefix plus
/// the constant version/codec/multihash header). Shard paths start after
/// them so directory names actually spread.
pub const CID_SHARD_START: usize = 5;

/// A content identifier in rendered form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    /// Computes the CID naming `data`.
    pub fn digest(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = Vec::with_capacity(4 + hash.len());
        bytes.push(CID_VERSION);
        bytes.push(DAG_PB_CODEC);
        bytes.push(SHA2_256_CODE);
        bytes.push(SHA2_256_LEN);
        bytes.extend_from_slice(&hash);

        let mut rendered = String::with_capacity(50);
        rendered.push(BASE58BTC_PREFIX);
        rendered.push_str(&bs58::encode(bytes).into_string());
        Self(rendered)
    }

    /// Wraps an already-rendered CID string (e.g. read from a manifest).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative shard directory for this CID: characters
    /// `[CID_SHARD_START, CID_SHARD_START + 2 * levels)` split into
    /// two-character directory levels.
    pub fn shard(&self, levels: usize) -> PathBuf {
        shard_path(&self.0, CID_SHARD_START, levels)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Cid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Splits `name[start..start + 2 * levels]` into two-character directory
/// levels. Stops early if the name runs out of characters.
pub fn shard_path(name: &str, start: usize, levels: usize) -> PathBuf {
    let mut path = PathBuf::new();
    let chars: Vec<char> = name.chars().collect();
    for level in 0..levels {
        let begin = start + 2 * level;
        if begin + 2 > chars.len() {
            break;
        }
        path.push(chars[begin..begin + 2].iter().collect::<String>());
    }
    path
}
