//! # mlkeep
//!
//! Versioning for large machine-learning artifacts (datasets, models,
//! labels). Metadata stays in a small versioned tree of specs and
//! manifests; bulk content lives in a chunked, content-addressed object
//! store, deduplicated locally and mirrored to pluggable remote buckets.
//!
//! ## Features
//!
//! - **Content-addressed chunking**: files split into fixed-size chunks
//!   named by CIDv1 identifiers, stored once, verified on every read
//! - **Staging workflow**: add/commit/push/fetch/checkout with per-entity
//!   mutability policies (strict, flexible, mutable)
//! - **Deduplicated materialization**: workspace files hard-link against a
//!   shared cache, with copy fallback
//! - **Crash-safe publication**: version tags become visible remotely only
//!   after every referenced object is durable
//! - **Pluggable buckets**: a small capability trait over S3-style remote
//!   stores

pub mod cache;
pub mod cid;
pub mod cli;
pub mod config;
pub mod error;
pub mod index;
pub mod manifest;
pub mod metadata;
pub mod objects;
pub mod repository;
pub mod spec;
pub mod storage;

pub use error::{Error, Result};
