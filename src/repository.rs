//! Orchestrates add/commit/push/fetch/checkout across the object store,
//! cache, index, manifests, metadata and the remote bucket.
//!
//! Per-object work (chunking, uploads, downloads, materialization) fans
//! out over a bounded worker pool; the index and manifests are only ever
//! mutated on the orchestrating thread, from records the workers return.
//! Metadata is published strictly after every referenced object is durable
//! remotely.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::cache::{self, FileCache};
use crate::cid::Cid;
use crate::config::Config;
use crate::index::{self, FileStatus, IndexEntry, StagingIndex};
use crate::manifest::Manifest;
use crate::metadata::MetadataStore;
use crate::objects::{self, ObjectStore};
use crate::spec::{EntitySpec, EntityType, Mutability, TagRef, SPEC_EXTENSION};
use crate::storage::{open_bucket, BucketStore, RetryPolicy};
use crate::{Error, Result};

const MANIFEST_FILE: &str = "MANIFEST.yaml";
const README_FILE: &str = "README.md";
const WALK_PAGE_SIZE: usize = 50;

/// Side channel for long transfers; operations report through it without
/// their types knowing anything about rendering.
pub trait TransferProgress: Sync {
    fn on_object_start(&self, _cid: &Cid) {}
    fn on_object_done(&self, _cid: &Cid, _bytes: u64) {}
    fn on_object_error(&self, _cid: &Cid, _error: &Error) {}
    fn on_complete(&self, _objects: usize, _bytes: u64) {}
}

/// Progress sink that discards everything.
pub struct NullProgress;

impl TransferProgress for NullProgress {}

#[derive(Debug, Default)]
pub struct AddReport {
    pub staged: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

#[derive(Debug, Default)]
pub struct PushReport {
    pub uploaded: usize,
    pub already_present: usize,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub downloaded: usize,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct CheckoutReport {
    pub files: usize,
}

#[derive(Debug, Default)]
pub struct StatusReport {
    pub staged: Vec<(String, Cid)>,
    pub deleted: Vec<String>,
    pub corrupted: Vec<String>,
    pub untracked: Vec<String>,
}

/// One version in the entity's history, with the statistics behind
/// `log --fullstat`.
#[derive(Debug)]
pub struct LogEntry {
    pub tag: String,
    pub commit: String,
    pub message: String,
    pub version: usize,
    pub added_files: Vec<String>,
    pub added: usize,
    pub deleted: usize,
    pub total_files: usize,
    pub workspace_size: u64,
}

#[derive(Debug, Default)]
pub struct FsckSummary {
    pub corrupted: Vec<Cid>,
    pub repaired: Vec<Cid>,
    pub cache_issues: Vec<String>,
}

pub struct LocalRepository {
    config: Config,
    entity_type: EntityType,
    retry: RetryPolicy,
}

impl LocalRepository {
    pub fn new(config: Config, entity_type: EntityType) -> Self {
        Self {
            config,
            entity_type,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the repository state tree for this entity type.
    pub fn init(&self) -> Result<()> {
        for dir in [
            self.config.objects_path(self.entity_type),
            self.config.cache_path(self.entity_type),
            self.config.index_path(self.entity_type),
        ] {
            fs::create_dir_all(dir)?;
        }
        self.metadata().init()
    }

    /// Creates a new entity workspace with its spec and empty data
    /// directory.
    pub fn create(
        &self,
        entity: &str,
        categories: Vec<String>,
        mutability: Mutability,
        storage: &str,
        version: usize,
    ) -> Result<PathBuf> {
        let workspace = self.config.workspace_path(self.entity_type, entity);
        if workspace.exists() {
            return Err(Error::Config {
                reason: format!("entity workspace {} already exists", workspace.display()),
            });
        }

        let spec = EntitySpec {
            categories,
            mutability,
            manifest: crate::spec::ManifestSection {
                files: MANIFEST_FILE.to_string(),
                storage: storage.to_string(),
            },
            name: entity.to_string(),
            version,
        };
        spec.validate()?;

        fs::create_dir_all(workspace.join("data"))?;
        spec.save(&workspace.join(spec.spec_file_name()), self.entity_type)?;
        info!("created entity workspace at [{}]", workspace.display());
        Ok(workspace)
    }

    /// Stages workspace changes: chunks new and modified files into the
    /// object store in parallel, records deletions, and regenerates the
    /// staged manifest. On any per-file failure the staged manifest is left
    /// untouched and a single aggregate error reports the offending files.
    pub fn add(&self, entity: &str, bump_version: bool) -> Result<AddReport> {
        let workspace = self.config.workspace_path(self.entity_type, entity);
        let spec_path = workspace.join(format!("{}{}", entity, SPEC_EXTENSION));
        let mut spec = EntitySpec::load(&spec_path, self.entity_type)?;
        if bump_version {
            spec.bump_version();
            spec.save(&spec_path, self.entity_type)?;
        }

        let objects = self.objects()?;
        let cache = self.cache()?;
        let metadata = self.metadata();

        let index_dir = self.config.index_metadata_path(self.entity_type, entity);
        let mut staging = StagingIndex::load(&index_dir)?;

        let committed = Manifest::load(
            metadata
                .path()
                .join(spec.metadata_subpath())
                .join(MANIFEST_FILE),
        )?;

        let files = self.workspace_files(&workspace, entity)?;

        let mut tasks: Vec<(String, Option<Cid>)> = Vec::new();
        let mut unchanged = 0usize;
        for rel in &files {
            let previous = committed.search(rel).cloned();
            if let Some(prev) = &previous {
                if spec.mutability != Mutability::Mutable
                    && index::linked_to_cache(&cache, prev, &workspace.join(rel))
                {
                    unchanged += 1;
                    continue;
                }
            }
            tasks.push((rel.clone(), previous));
        }

        info!("adding {} file(s) for [{}]", tasks.len(), entity);
        let pool = self.pool()?;
        let results: Vec<(String, Result<IndexEntry>)> = pool.install(|| {
            tasks
                .par_iter()
                .map(|(rel, previous)| {
                    let entry = index::stage_file(
                        &objects,
                        &cache,
                        spec.mutability,
                        &workspace,
                        rel,
                        previous.as_ref(),
                    );
                    (rel.clone(), entry)
                })
                .collect()
        });

        let mut staged: Vec<(String, IndexEntry)> = Vec::new();
        let mut failures: Vec<(String, Error)> = Vec::new();
        for (rel, result) in results {
            match result {
                Ok(entry) => staged.push((rel, entry)),
                Err(err) => {
                    warn!("failed to stage [{}]: {}", rel, err);
                    failures.push((rel, err));
                }
            }
        }
        if failures.len() == 1 {
            return Err(failures.remove(0).1);
        }
        if !failures.is_empty() {
            return Err(Error::Batch {
                operation: "add".to_string(),
                failures: failures.into_iter().map(|(rel, _)| rel).collect(),
            });
        }

        for (rel, entry) in &staged {
            staging.insert(rel.clone(), entry.clone());
        }

        let workspace_set: BTreeSet<&str> = files.iter().map(String::as_str).collect();
        let mut deleted = Vec::new();
        for (cid, path) in committed.pairs() {
            if !workspace_set.contains(path) {
                staging.mark_deleted(path, cid.clone());
                deleted.push(path.to_string());
            }
        }
        staging.prune_added_without_file(&workspace_set);
        staging.save()?;

        // Staged manifest = committed state minus deletions, overlaid with
        // the staged entries.
        let staged_manifest_path = index_dir.join(MANIFEST_FILE);
        if staged_manifest_path.exists() {
            fs::remove_file(&staged_manifest_path)?;
        }
        let mut manifest = Manifest::load(&staged_manifest_path)?;
        for (cid, path) in committed.pairs() {
            manifest.add(cid.clone(), path);
        }
        for path in &deleted {
            manifest.rm_file(path);
        }
        for (rel, entry) in &staged {
            manifest.rm_file(rel);
            manifest.add(entry.cid.clone(), rel.clone());
        }
        manifest.save()?;

        Ok(AddReport {
            staged: staged.len(),
            unchanged,
            deleted: deleted.len(),
        })
    }

    /// Commits the staged manifest and spec into the metadata tree and
    /// synthesizes the version tag. Fails before writing anything when the
    /// tag already exists.
    pub fn commit(&self, entity: &str, message: &str) -> Result<String> {
        let workspace = self.config.workspace_path(self.entity_type, entity);
        let spec_path = workspace.join(format!("{}{}", entity, SPEC_EXTENSION));
        let spec = EntitySpec::load(&spec_path, self.entity_type)?;

        let metadata = self.metadata();
        metadata.init()?;

        let tag = spec.tag();
        if metadata.tag_exists(&tag)? {
            return Err(Error::VersionConflict { tag });
        }

        let index_dir = self.config.index_metadata_path(self.entity_type, entity);
        let staged_manifest_path = index_dir.join(MANIFEST_FILE);
        if !staged_manifest_path.exists() {
            return Err(Error::NotFound {
                what: format!("staged changes for [{}]; run add first", entity),
            });
        }

        let subpath = spec.metadata_subpath();
        let target_dir = metadata.path().join(&subpath);
        fs::create_dir_all(&target_dir)?;
        fs::copy(&spec_path, target_dir.join(spec.spec_file_name()))?;
        fs::copy(&staged_manifest_path, target_dir.join(MANIFEST_FILE))?;

        let commit = metadata.commit(&subpath, message)?;
        metadata.tag_add(&tag)?;
        metadata.set_head(entity, &tag)?;

        let mut staging = StagingIndex::load(&index_dir)?;
        staging.clear()?;

        info!("committed [{}] as [{}] ({})", entity, tag, commit);
        Ok(tag)
    }

    /// Uploads every object reachable from the committed manifest that the
    /// bucket does not already hold, then publishes the metadata commit and
    /// tag. The metadata is published only after all uploads succeeded.
    pub fn push(&self, entity: &str, progress: &dyn TransferProgress) -> Result<PushReport> {
        let spec = self.workspace_spec(entity)?;
        let bucket = open_bucket(&self.config, &spec.storage_uri()?)?;
        self.push_with_bucket(&spec, bucket.as_ref(), progress)
    }

    pub fn push_with_bucket(
        &self,
        spec: &EntitySpec,
        bucket: &dyn BucketStore,
        progress: &dyn TransferProgress,
    ) -> Result<PushReport> {
        let metadata = self.metadata();
        let manifest = Manifest::load(
            metadata
                .path()
                .join(spec.metadata_subpath())
                .join(MANIFEST_FILE),
        )?;
        let objects = self.objects()?;

        let mut cids: BTreeSet<Cid> = BTreeSet::new();
        for file_cid in manifest.cids() {
            let descriptor =
                objects
                    .load_descriptor(file_cid)?
                    .ok_or_else(|| Error::Integrity {
                        reason: format!("descriptor [{}] is corrupt in the local store", file_cid),
                    })?;
            cids.insert(file_cid.clone());
            for link in descriptor.links {
                cids.insert(link.hash);
            }
        }

        let all: Vec<Cid> = cids.into_iter().collect();
        info!("pushing [{}]: {} candidate object(s)", spec.name, all.len());

        let pool = self.pool()?;
        let mut report = PushReport::default();
        let mut failures = Vec::new();

        for batch in all.chunks(self.config.batch_size) {
            let results: Vec<(Cid, Result<Option<u64>>)> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|cid| {
                        let outcome = self.upload_object(&objects, bucket, cid, progress);
                        (cid.clone(), outcome)
                    })
                    .collect()
            });

            for (cid, result) in results {
                match result {
                    Ok(None) => report.already_present += 1,
                    Ok(Some(bytes)) => {
                        report.uploaded += 1;
                        report.bytes += bytes;
                        progress.on_object_done(&cid, bytes);
                    }
                    Err(err) => {
                        progress.on_object_error(&cid, &err);
                        warn!("failed to upload [{}]: {}", cid, err);
                        failures.push(cid.to_string());
                    }
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::Batch {
                operation: "push".to_string(),
                failures,
            });
        }

        // Crash-safe ordering: the tag becomes visible remotely only after
        // every object it references is durable there.
        metadata.push_to_remote()?;
        progress.on_complete(report.uploaded, report.bytes);
        Ok(report)
    }

    fn upload_object(
        &self,
        objects: &ObjectStore,
        bucket: &dyn BucketStore,
        cid: &Cid,
        progress: &dyn TransferProgress,
    ) -> Result<Option<u64>> {
        if self
            .retry
            .run("probe", || bucket.file_exists(cid.as_str()))?
        {
            return Ok(None);
        }
        progress.on_object_start(cid);
        let path = objects.object_path(cid);
        self.retry
            .run("upload", || bucket.file_store(cid.as_str(), &path))?;
        Ok(Some(fs::metadata(&path)?.len()))
    }

    /// Synchronizes metadata at `tag` and downloads every missing object
    /// the tag's manifest references, with per-object verification.
    pub fn fetch(&self, tag: &str, progress: &dyn TransferProgress) -> Result<FetchReport> {
        let spec = self.checkout_metadata(tag)?;
        let bucket = open_bucket(&self.config, &spec.storage_uri()?)?;
        self.fetch_with_bucket(&spec, bucket.as_ref(), progress)
    }

    pub fn fetch_with_bucket(
        &self,
        spec: &EntitySpec,
        bucket: &dyn BucketStore,
        progress: &dyn TransferProgress,
    ) -> Result<FetchReport> {
        let metadata = self.metadata();
        let manifest = Manifest::load(
            metadata
                .path()
                .join(spec.metadata_subpath())
                .join(MANIFEST_FILE),
        )?;
        let objects = self.objects()?;
        let pool = self.pool()?;

        let mut report = FetchReport::default();
        let mut failures = Vec::new();

        // Descriptors first; only they know which chunks a file needs.
        let missing_descriptors: Vec<Cid> = manifest
            .cids()
            .filter(|cid| !objects.exists(cid))
            .cloned()
            .collect();
        self.download_batch(
            &pool,
            &objects,
            bucket,
            &missing_descriptors,
            progress,
            &mut report,
            &mut failures,
        );

        let mut missing_chunks: BTreeSet<Cid> = BTreeSet::new();
        for file_cid in manifest.cids() {
            if let Ok(Some(descriptor)) = objects.load_descriptor(file_cid) {
                for link in descriptor.links {
                    if !objects.exists(&link.hash) {
                        missing_chunks.insert(link.hash);
                    }
                }
            }
        }
        let missing_chunks: Vec<Cid> = missing_chunks.into_iter().collect();
        self.download_batch(
            &pool,
            &objects,
            bucket,
            &missing_chunks,
            progress,
            &mut report,
            &mut failures,
        );

        if !failures.is_empty() {
            return Err(Error::Batch {
                operation: "fetch".to_string(),
                failures,
            });
        }
        progress.on_complete(report.downloaded, report.bytes);
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn download_batch(
        &self,
        pool: &rayon::ThreadPool,
        objects: &ObjectStore,
        bucket: &dyn BucketStore,
        cids: &[Cid],
        progress: &dyn TransferProgress,
        report: &mut FetchReport,
        failures: &mut Vec<String>,
    ) {
        for batch in cids.chunks(self.config.batch_size) {
            let results: Vec<(Cid, Result<u64>)> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|cid| {
                        progress.on_object_start(cid);
                        (cid.clone(), self.download_object(objects, bucket, cid))
                    })
                    .collect()
            });

            for (cid, result) in results {
                match result {
                    Ok(bytes) => {
                        report.downloaded += 1;
                        report.bytes += bytes;
                        progress.on_object_done(&cid, bytes);
                    }
                    Err(err) => {
                        progress.on_object_error(&cid, &err);
                        warn!("failed to fetch [{}]: {}", cid, err);
                        failures.push(cid.to_string());
                    }
                }
            }
        }
    }

    /// Downloads one object with verification. A corrupt download is
    /// discarded and re-fetched once before becoming fatal.
    fn download_object(
        &self,
        objects: &ObjectStore,
        bucket: &dyn BucketStore,
        cid: &Cid,
    ) -> Result<u64> {
        let scratch = self.scratch_dir()?;
        for attempt in 0..2 {
            let temp = scratch.join(format!("{}.{}.{}", cid, std::process::id(), attempt));
            self.retry
                .run("download", || bucket.file_get(cid.as_str(), &temp))?;
            let bytes = fs::read(&temp)?;
            fs::remove_file(&temp)?;

            if Cid::digest(&bytes) == *cid {
                objects.import(cid, &bytes)?;
                return Ok(bytes.len() as u64);
            }
            warn!("downloaded object [{}] failed verification, refetching", cid);
        }
        Err(Error::Integrity {
            reason: format!("downloaded object [{}] failed verification twice", cid),
        })
    }

    /// Fetches `tag` and materializes its manifest paths in the workspace
    /// by hard-linking out of the cache (copying where links are not
    /// supported). Strict entities end up read-only.
    pub fn checkout(
        &self,
        tag: &str,
        sampling: Option<usize>,
        progress: &dyn TransferProgress,
    ) -> Result<CheckoutReport> {
        self.fetch(tag, progress)?;
        self.materialize(tag, sampling)
    }

    fn materialize(&self, tag: &str, sampling: Option<usize>) -> Result<CheckoutReport> {
        let parsed = TagRef::parse(tag).ok_or_else(|| Error::Config {
            reason: format!("malformed tag [{}]", tag),
        })?;
        let metadata = self.metadata();
        let spec = self.metadata_spec(&parsed)?;
        let manifest = Manifest::load(
            metadata
                .path()
                .join(spec.metadata_subpath())
                .join(MANIFEST_FILE),
        )?;

        let workspace = self.config.workspace_path(self.entity_type, &spec.name);
        fs::create_dir_all(&workspace)?;
        fs::copy(
            metadata
                .path()
                .join(spec.metadata_subpath())
                .join(spec.spec_file_name()),
            workspace.join(spec.spec_file_name()),
        )?;

        let objects = self.objects()?;
        let cache = self.cache()?;

        let mut pairs: Vec<(Cid, String)> = manifest
            .pairs()
            .map(|(cid, path)| (cid.clone(), path.to_string()))
            .collect();
        if let Some(limit) = sampling {
            pairs.truncate(limit);
        }

        let pool = self.pool()?;
        let results: Vec<(String, Result<()>)> = pool.install(|| {
            pairs
                .par_iter()
                .map(|(cid, rel)| {
                    let outcome =
                        materialize_file(&objects, &cache, spec.mutability, &workspace, cid, rel);
                    (rel.clone(), outcome)
                })
                .collect()
        });

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(rel, result)| match result {
                Ok(()) => None,
                Err(err) => {
                    warn!("failed to materialize [{}]: {}", rel, err);
                    Some(rel)
                }
            })
            .collect();
        if !failures.is_empty() {
            return Err(Error::Batch {
                operation: "checkout".to_string(),
                failures,
            });
        }

        metadata.set_head(&spec.name, tag)?;
        info!("checked out [{}]: {} file(s)", tag, pairs.len());
        Ok(CheckoutReport { files: pairs.len() })
    }

    /// Staged, deleted, corrupted and untracked paths for `entity`.
    pub fn status(&self, entity: &str) -> Result<StatusReport> {
        let index_dir = self.config.index_metadata_path(self.entity_type, entity);
        let staging = StagingIndex::load(&index_dir)?;
        let staged_manifest = Manifest::load(index_dir.join(MANIFEST_FILE))?;

        let mut report = StatusReport::default();
        for (path, entry) in staging.entries() {
            match entry.status {
                FileStatus::Added => report.staged.push((path.to_string(), entry.cid.clone())),
                FileStatus::Deleted => report.deleted.push(path.to_string()),
                FileStatus::Corrupted => report.corrupted.push(path.to_string()),
                FileStatus::Untracked => report.untracked.push(path.to_string()),
            }
        }

        let workspace = self.config.workspace_path(self.entity_type, entity);
        if workspace.exists() {
            for rel in self.workspace_files(&workspace, entity)? {
                if staging.get(&rel).is_none() && staged_manifest.search(&rel).is_none() {
                    report.untracked.push(rel);
                }
            }
        }
        Ok(report)
    }

    /// Version history for `entity`, newest first, with per-version file
    /// statistics computed by diffing consecutive manifests.
    pub fn log(&self, entity: &str) -> Result<Vec<LogEntry>> {
        let metadata = self.metadata();
        let objects = self.objects()?;

        let mut tags: Vec<(TagRef, String)> = metadata
            .list_tags()?
            .into_iter()
            .filter_map(|tag| {
                let parsed = TagRef::parse(&tag)?;
                (parsed.name == entity).then_some((parsed, tag))
            })
            .collect();
        if tags.is_empty() {
            return Err(Error::EntityNotFound {
                name: entity.to_string(),
            });
        }
        tags.sort_by_key(|(parsed, _)| parsed.version);

        let mut entries = Vec::new();
        let mut previous = Manifest::empty();
        for (parsed, tag) in tags {
            let commit = metadata.tag_commit(&tag)?;
            let record = metadata.commit_record(&commit)?.ok_or_else(|| Error::NotFound {
                what: format!("commit record {}", commit),
            })?;

            let mut manifest_rel: PathBuf = parsed.categories.iter().collect();
            manifest_rel.push(&parsed.name);
            manifest_rel.push(MANIFEST_FILE);
            let manifest =
                Manifest::load(metadata.snapshot_path(&commit).join(&manifest_rel))?;

            let diff = manifest.diff(&previous);
            let workspace_size = manifest
                .pairs()
                .map(|(cid, _)| {
                    objects
                        .load_descriptor(cid)
                        .ok()
                        .flatten()
                        .map(|descriptor| descriptor.size())
                        .unwrap_or(0)
                })
                .sum();

            entries.push(LogEntry {
                tag,
                commit,
                message: record.message,
                version: parsed.version,
                added_files: diff.added.iter().map(|(_, path)| path.clone()).collect(),
                added: diff.added.len(),
                deleted: diff.deleted.len(),
                total_files: manifest.file_count(),
                workspace_size,
            });
            previous = manifest;
        }

        entries.reverse();
        Ok(entries)
    }

    /// Integrity check over the object store and cache. Corrupted objects
    /// are re-fetched from the entity's bucket when one is reachable, and
    /// affected index entries are marked.
    pub fn fsck(&self, entity: &str) -> Result<FsckSummary> {
        let objects = self.objects()?;
        let cache = self.cache()?;

        let report = objects.fsck(&[])?;
        let cache_issues = cache.fsck(&[])?;

        let mut summary = FsckSummary {
            cache_issues,
            ..Default::default()
        };

        let bucket = self
            .workspace_spec(entity)
            .and_then(|spec| open_bucket(&self.config, &spec.storage_uri()?));

        for cid in report.corrupted {
            let repaired = match &bucket {
                Ok(bucket) => {
                    objects.remove(&cid)?;
                    self.download_object(&objects, bucket.as_ref(), &cid).is_ok()
                }
                Err(_) => false,
            };
            if repaired {
                info!("repaired corrupted object [{}]", cid);
                summary.repaired.push(cid);
            } else {
                summary.corrupted.push(cid);
            }
        }

        if !summary.corrupted.is_empty() {
            let index_dir = self.config.index_metadata_path(self.entity_type, entity);
            let mut staging = StagingIndex::load(&index_dir)?;
            let bad: Vec<String> = staging
                .entries()
                .filter(|(_, entry)| summary.corrupted.contains(&entry.cid))
                .map(|(path, _)| path.to_string())
                .collect();
            for path in bad {
                staging.mark_corrupted(&path);
            }
            staging.save()?;
        }

        Ok(summary)
    }

    /// Removes local objects unreachable from any committed or staged
    /// manifest. Returns the number of objects deleted.
    pub fn gc(&self) -> Result<usize> {
        let objects = self.objects()?;

        let mut reachable: BTreeSet<String> = BTreeSet::new();
        for dir in [
            self.config.metadata_path(self.entity_type),
            self.config.index_path(self.entity_type),
        ] {
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(&dir) {
                let entry = entry?;
                if !entry.file_type().is_file()
                    || entry.file_name().to_string_lossy() != MANIFEST_FILE
                {
                    continue;
                }
                let manifest = Manifest::load(entry.path())?;
                for cid in manifest.cids() {
                    reachable.insert(cid.to_string());
                    if let Ok(Some(descriptor)) = objects.load_descriptor(cid) {
                        for link in descriptor.links {
                            reachable.insert(link.hash.to_string());
                        }
                    }
                }
            }
        }

        let mut removed = 0usize;
        let batches: Vec<Vec<String>> = objects.walk(WALK_PAGE_SIZE).collect();
        for batch in batches {
            for name in batch {
                if !reachable.contains(&name) {
                    debug!("removing unreachable object [{}]", name);
                    objects.remove(&Cid::from_string(name))?;
                    removed += 1;
                }
            }
        }
        info!("garbage collection removed {} object(s)", removed);
        Ok(removed)
    }

    /// Resolves the tag for `entity` at `version` (`None` = latest).
    pub fn get_tag(&self, entity: &str, version: Option<usize>) -> Result<String> {
        self.metadata().get_tag(entity, version)
    }

    fn checkout_metadata(&self, tag: &str) -> Result<EntitySpec> {
        let metadata = self.metadata();
        metadata.init()?;
        if metadata.has_remote() {
            metadata.fetch_from_remote()?;
        }
        if !metadata.tag_exists(tag)? {
            return Err(Error::NotFound {
                what: format!("tag {}", tag),
            });
        }
        metadata.checkout_tag(tag)?;

        let parsed = TagRef::parse(tag).ok_or_else(|| Error::Config {
            reason: format!("malformed tag [{}]", tag),
        })?;
        self.metadata_spec(&parsed)
    }

    fn metadata_spec(&self, parsed: &TagRef) -> Result<EntitySpec> {
        let mut path = self.metadata().path().to_path_buf();
        for category in &parsed.categories {
            path.push(category);
        }
        path.push(&parsed.name);
        path.push(format!("{}{}", parsed.name, SPEC_EXTENSION));
        EntitySpec::load(&path, self.entity_type)
    }

    fn workspace_spec(&self, entity: &str) -> Result<EntitySpec> {
        let workspace = self.config.workspace_path(self.entity_type, entity);
        EntitySpec::load(
            &workspace.join(format!("{}{}", entity, SPEC_EXTENSION)),
            self.entity_type,
        )
    }

    fn workspace_files(&self, workspace: &Path, entity: &str) -> Result<Vec<String>> {
        if !workspace.exists() {
            return Err(Error::NotFound {
                what: format!("workspace for [{}]", entity),
            });
        }
        let spec_name = format!("{}{}", entity, SPEC_EXTENSION);
        let mut files = Vec::new();
        for entry in WalkDir::new(workspace)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry))
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name == spec_name || name == README_FILE {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(workspace)
                .expect("entries stay under the workspace root")
                .to_string_lossy()
                .replace('\\', "/");
            files.push(rel);
        }
        files.sort();
        Ok(files)
    }

    fn objects(&self) -> Result<ObjectStore> {
        ObjectStore::new(
            self.config.objects_path(self.entity_type),
            objects::DEFAULT_BLOCK_SIZE,
            objects::DEFAULT_LEVELS,
        )
    }

    fn cache(&self) -> Result<FileCache> {
        FileCache::new(
            self.config.cache_path(self.entity_type),
            cache::DEFAULT_LEVELS,
        )
    }

    fn metadata(&self) -> MetadataStore {
        let remote = self.config.entity(self.entity_type).git.clone();
        MetadataStore::new(
            self.config.metadata_path(self.entity_type),
            self.config.refs_path(self.entity_type),
            self.entity_type,
            (!remote.is_empty()).then(|| PathBuf::from(remote)),
        )
    }

    fn pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.push_threads_count)
            .build()
            .map_err(|err| Error::Config {
                reason: format!("failed to build worker pool: {}", err),
            })
    }

    fn scratch_dir(&self) -> Result<PathBuf> {
        let dir = self.config.objects_path(self.entity_type).join("tmp");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Places one manifest path into the workspace. Strict and flexible files
/// are linked out of the cache; mutable files are assembled as plain
/// copies so they stay editable in place.
fn materialize_file(
    objects: &ObjectStore,
    cache: &FileCache,
    mutability: Mutability,
    workspace: &Path,
    cid: &Cid,
    rel: &str,
) -> Result<()> {
    let target = workspace.join(rel);
    if target.exists() {
        fs::remove_file(&target)?;
    }

    if mutability == Mutability::Mutable {
        let written = objects.get(cid, &target)?;
        if written == 0 && !target.exists() {
            return Err(Error::Integrity {
                reason: format!("object [{}] failed verification during checkout", cid),
            });
        }
        return Ok(());
    }

    if cache.exists(cid.as_str()) {
        cache.get(cid.as_str(), &target)?;
    } else {
        let written = objects.get(cid, &target)?;
        if written == 0 && !target.exists() {
            return Err(Error::Integrity {
                reason: format!("object [{}] failed verification during checkout", cid),
            });
        }
        cache.link(cid.as_str(), &target)?;
    }

    if mutability == Mutability::Strict {
        let mut perms = fs::metadata(&target)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(&target, perms)?;
    }
    Ok(())
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
