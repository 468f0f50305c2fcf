#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `engine` drives one catalog update: it walks a root with [`walk`],
//! opens or creates a [`catalog_store::Store`] for every owner root the
//! walk discovers (including nested catalogs), reconciles each store's
//! records against what is actually on disk, and reports the files that
//! appear to have moved or vanished entirely.
//!
//! Four phases run in sequence for every update root:
//!
//! 1. **Gather**: walk the tree, group entries by owner, and split each
//!    owner's files into "already catalogued" and "new".
//! 2. **Ingest**: fingerprint and insert every new file.
//! 3. **Prune**: drop sub-catalog markers whose nested database has
//!    disappeared, drop records that now fall under a nested catalog's
//!    territory, and drop records whose file is gone from disk.
//! 4. **Report**: for every record pruned because its file vanished,
//!    search every store touched this run for a same-size,
//!    same-content-key match and report it as moved; otherwise report it
//!    removed.
//!
//! # Design
//!
//! Durability is scoped to phase boundaries: [`catalog_store::Store::commit`]
//! is called after ingestion, again after sub-catalog pruning, and again
//! after file pruning, so a failure partway through a phase never leaves a
//! store half-committed for that phase specifically, while still letting
//! earlier phases' work survive a later failure.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use catalog_store::{FileRecord, Store, StoreError};
use fingerprint::FingerprintError;
use logging::{Logger, Sink};
use walk::{WalkEntry, WalkError};

/// Errors produced while reconciling a catalog.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Walking the tree failed.
    #[error(transparent)]
    Walk(#[from] WalkError),
    /// A catalog store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Computing a content fingerprint failed.
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    /// Stat'ing a file on disk failed outside of fingerprinting.
    #[error("I/O error reconciling {path}: {source}")]
    Io {
        /// Path that could not be stat'd.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// Result type returned by engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Settings applied when a catalog store is created for the first time
/// during this run. Has no effect on a store that already exists: an
/// existing store's persisted config always wins.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Catalog database filename to use at every owner root.
    pub dbfilename: String,
    /// Whether newly created stores hash file content fully (`false`) or
    /// by head+tail chunk (`true`).
    pub partial_hash: bool,
    /// Chunk size, in bytes, for newly created stores running in partial mode.
    pub partial_hash_size: u64,
    /// A path to never report as a catalog entry (the in-progress sync script).
    pub skip_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dbfilename: catalog_store::DEFAULT_DB_FILENAME.to_owned(),
            partial_hash: true,
            partial_hash_size: catalog_store::DEFAULT_PARTIAL_HASH_SIZE,
            skip_path: None,
        }
    }
}

/// A record whose file could no longer be found at its recorded path,
/// together with what the engine could determine about its fate.
#[derive(Debug, Clone)]
pub enum MissingAdvisory {
    /// A same-size, same-content-key record was found elsewhere; the file
    /// most likely moved rather than disappeared.
    Moved {
        /// Store the vanished record belonged to.
        store_root: PathBuf,
        /// The vanished record's relative path.
        relpath: String,
        /// Every `(store root, relpath)` candidate that matches by content.
        candidates: Vec<(PathBuf, String)>,
    },
    /// No same-size, same-content-key record exists anywhere; the file is
    /// presumed deleted.
    Removed {
        /// Store the vanished record belonged to.
        store_root: PathBuf,
        /// The vanished record's relative path.
        relpath: String,
    },
}

/// Summary of one [`reconcile`] invocation.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Every owner root touched this run, in discovery order.
    pub stores_touched: Vec<PathBuf>,
    /// Total files present on disk across every owner touched this run.
    pub total_files: usize,
    /// How many of those files were newly catalogued.
    pub new_files: usize,
    /// Advisories for every record pruned because its file vanished.
    pub advisories: Vec<MissingAdvisory>,
}

/// Reconciles the catalog rooted at `root` (and every nested catalog the
/// walk discovers beneath it) against the current state of the
/// filesystem, per [`EngineConfig`].
pub fn reconcile<S: Sink>(
    root: &Path,
    config: &EngineConfig,
    logger: &mut Logger<S>,
) -> EngineResult<ReconcileReport> {
    logger.summary(format!("reconciling catalog at {}", root.display()));

    let entries = walk::walk(root, &config.dbfilename, config.skip_path.as_deref())?;

    let mut by_owner: BTreeMap<PathBuf, Vec<WalkEntry>> = BTreeMap::new();
    by_owner.entry(root.to_path_buf()).or_default();
    for entry in entries {
        by_owner.entry(entry.owner_root.clone()).or_default().push(entry);
    }

    let owner_roots: Vec<PathBuf> = by_owner.keys().cloned().collect();
    let mut stores: BTreeMap<PathBuf, Store> = BTreeMap::new();
    for owner in &owner_roots {
        let existed = owner.join(&config.dbfilename).is_file();
        let store = Store::open(owner, &config.dbfilename)?;
        if !existed {
            store.set_config("partial_hash", if config.partial_hash { "true" } else { "false" })?;
            store.set_config("partial_hash_size", &config.partial_hash_size.to_string())?;
            store.commit()?;
        }
        stores.insert(owner.clone(), store);
    }

    for owner in &owner_roots {
        if owner.as_path() == root {
            continue;
        }
        if let Some(parent) = nearest_ancestor(owner, &owner_roots) {
            let marker = walk::to_forward_slashes(
                owner
                    .strip_prefix(&parent)
                    .expect("nearest_ancestor only returns true ancestors"),
            );
            stores[&parent].upsert_subcatalog(&marker)?;
        }
    }
    for store in stores.values() {
        store.commit()?;
    }

    let mut report = ReconcileReport {
        stores_touched: owner_roots.clone(),
        ..Default::default()
    };

    for (owner, entries) in &by_owner {
        let store = &stores[owner];
        let partial_hash = store.partial_hash()?;
        let chunk = store.partial_hash_size()?;

        report.total_files += entries.len();

        for entry in entries {
            let relpath = entry.relpath();
            let size = stat_len(&entry.abs_path())?;

            let already_known = store
                .files_by_size(size)?
                .iter()
                .any(|record| record.relpath == relpath);
            if already_known {
                continue;
            }

            logger.trace(format!("hashing {}", entry.abs_path().display()));
            let (hash, parthash) = if partial_hash {
                (None, Some(fingerprint::partial(&entry.abs_path(), chunk)?))
            } else {
                (Some(fingerprint::full(&entry.abs_path())?), None)
            };

            store.insert(&FileRecord {
                filename: entry.basename.clone(),
                relpath,
                size,
                hash,
                parthash,
            })?;
            report.new_files += 1;
        }
        store.commit()?;
    }
    logger.summary(format!(
        "{} file(s) seen, {} newly catalogued",
        report.total_files, report.new_files
    ));

    for owner in &owner_roots {
        let store = &stores[owner];
        for marker in store.list_subcatalogs()? {
            let nested_db = owner.join(&marker).join(&config.dbfilename);
            if !nested_db.is_file() {
                logger.summary(format!(
                    "dropping stale sub-catalog marker {marker} under {}",
                    owner.display()
                ));
                store.delete_subcatalog(&marker)?;
            }
        }
    }
    for store in stores.values() {
        store.commit()?;
    }

    let mut vanished: Vec<(PathBuf, FileRecord)> = Vec::new();
    for owner in &owner_roots {
        let store = &stores[owner];
        let markers = store.list_subcatalogs()?;
        for record in store.list_files()? {
            let under_nested_catalog = markers
                .iter()
                .any(|marker| record.relpath == *marker || record.relpath.starts_with(&format!("{marker}/")));
            if under_nested_catalog {
                store.delete_by_relpath(&record.relpath)?;
                continue;
            }
            if !owner.join(&record.relpath).exists() {
                store.delete_by_relpath(&record.relpath)?;
                vanished.push((owner.clone(), record));
            }
        }
        store.commit()?;
    }

    for (store_root, record) in vanished {
        let content_key = record.content_key().map(str::to_owned);
        let mut candidates = Vec::new();
        if let Some(key) = &content_key {
            for owner in &owner_roots {
                for candidate in stores[owner].files_by_fingerprint(record.size, key)? {
                    candidates.push((owner.clone(), candidate.relpath));
                }
            }
        }

        let advisory = if candidates.is_empty() {
            logger.summary(format!(
                "removed: {}/{}",
                store_root.display(),
                record.relpath
            ));
            MissingAdvisory::Removed {
                store_root,
                relpath: record.relpath,
            }
        } else {
            logger.summary(format!(
                "moved: {}/{} -> {} candidate(s)",
                store_root.display(),
                record.relpath,
                candidates.len()
            ));
            MissingAdvisory::Moved {
                store_root,
                relpath: record.relpath,
                candidates,
            }
        };
        report.advisories.push(advisory);
    }

    Ok(report)
}

/// Among `owner_roots`, returns the nearest proper ancestor of `owner`
/// (the owner root whose path is the longest strict prefix of `owner`'s),
/// if one exists. Used to decide which store's `sub_dbs` table should
/// record a newly discovered nested catalog.
fn nearest_ancestor(owner: &Path, owner_roots: &[PathBuf]) -> Option<PathBuf> {
    owner_roots
        .iter()
        .filter(|candidate| candidate.as_path() != owner && owner.starts_with(candidate.as_path()))
        .max_by_key(|candidate| candidate.as_os_str().len())
        .cloned()
}

fn stat_len(path: &Path) -> EngineResult<u64> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|source| EngineError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// One group of catalog records sharing a full content hash, gathered
/// across every store passed to [`list_duplicates`].
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    /// The shared full-content hash (never a `parthash`; see [`list_duplicates`]).
    pub hash: String,
    /// Every `(store root, record)` sharing that hash, across all stores searched.
    pub members: Vec<(PathBuf, FileRecord)>,
}

/// Groups every record across `stores` by full content hash, returning only
/// groups with two or more members (the duplicates).
///
/// Unlike the sync planner's content-key matching, duplicate listing looks
/// at `hash` only and ignores `parthash` even when a store runs in
/// partial-hash mode: a shared partial digest does not prove two files are
/// byte-identical, only that their head and tail chunks match, so it is not
/// strong enough evidence to report as a duplicate.
pub fn list_duplicates(stores: &[(&Path, &Store)]) -> EngineResult<Vec<DuplicateGroup>> {
    let mut groups: BTreeMap<String, Vec<(PathBuf, FileRecord)>> = BTreeMap::new();
    for (root, store) in stores {
        for record in store.list_files()? {
            if let Some(hash) = &record.hash {
                groups
                    .entry(hash.clone())
                    .or_default()
                    .push((root.to_path_buf(), record));
            }
        }
    }
    Ok(groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(hash, members)| DuplicateGroup { hash, members })
        .collect())
}
