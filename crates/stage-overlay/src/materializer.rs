use chrono::{DateTime, Utc};
use serde::Serialize;
use stage_core::{file_name, parent_path, sha256_bytes};
use stage_vfs::{create_dir_all, FileKind, FsResult, LocalFs};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::fetcher::{FetchOutcome, RemoteFetcher};
use crate::resolver::ResolvedPath;

const DIRECTORY_MARKER: &str = "text/html";

/// A path written into the local tree from the content root during the
/// current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayEntry {
    pub path: String,
    pub kind: FileKind,
    pub materialized: bool,
    pub size: u64,
    pub digest: Option<String>,
    pub materialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeStatus {
    Materialized(FileKind),
    AlreadyMaterialized,
    AlreadyLocal,
    PreviouslyAbsent,
    Absent,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: BTreeMap<String, OverlayEntry>,
    absent: BTreeSet<String>,
    fetch_count: usize,
}

/// Session-scoped fetch-and-write-once state.
///
/// The ledger lock is held across the fetch and the write, so a path is
/// fetched at most once and a caller never observes a half-written file.
pub struct Materializer {
    fetcher: Box<dyn RemoteFetcher>,
    ledger: Mutex<Ledger>,
}

impl Materializer {
    pub fn new(fetcher: Box<dyn RemoteFetcher>) -> Self {
        Self {
            fetcher,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ensure(&self, fs: &dyn LocalFs, resolved: &ResolvedPath) -> MaterializeStatus {
        let mut ledger = self.lock();
        let local = resolved.local.as_str();
        if ledger.entries.contains_key(local) {
            return MaterializeStatus::AlreadyMaterialized;
        }
        if ledger.absent.contains(local) {
            return MaterializeStatus::PreviouslyAbsent;
        }
        if fs.exists(local) {
            return MaterializeStatus::AlreadyLocal;
        }

        debug!(remote = %resolved.remote, "attempting to fetch");
        ledger.fetch_count += 1;
        let outcome = self.fetcher.fetch(&resolved.remote);
        let digest = match &outcome {
            FetchOutcome::Found { bytes, .. } => Some((bytes.len() as u64, sha256_bytes(bytes))),
            _ => None,
        };
        match apply(fs, local, &outcome) {
            Ok(Some(kind)) => {
                let (size, digest) = match (kind, digest) {
                    (FileKind::File, Some((size, digest))) => (size, Some(digest)),
                    _ => (0, None),
                };
                ledger.entries.insert(
                    local.to_string(),
                    OverlayEntry {
                        path: resolved.remote.relative.clone(),
                        kind,
                        materialized: true,
                        size,
                        digest,
                        materialized_at: Utc::now(),
                    },
                );
                MaterializeStatus::Materialized(kind)
            }
            Ok(None) => {
                ledger.absent.insert(local.to_string());
                MaterializeStatus::Absent
            }
            Err(err) => {
                warn!(path = %local, error = %err, "materialization failed; leaving path absent");
                ledger.absent.insert(local.to_string());
                MaterializeStatus::Absent
            }
        }
    }

    /// Snapshot of materialized entries, ordered by local path.
    pub fn entries(&self) -> Vec<OverlayEntry> {
        self.lock().entries.values().cloned().collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetch_count
    }

    pub fn is_materialized(&self, local: &str) -> bool {
        self.lock()
            .entries
            .get(local)
            .map(|entry| entry.materialized)
            .unwrap_or(false)
    }

    /// Forgets everything fetched this session. Returns how many entries were
    /// dropped.
    pub fn purge(&self) -> usize {
        let mut ledger = self.lock();
        let dropped = ledger.entries.len();
        *ledger = Ledger::default();
        dropped
    }
}

/// HTML listing page for an extension-less name means a directory.
pub fn classify(content_type: &str, local: &str) -> FileKind {
    if content_type.contains(DIRECTORY_MARKER) && !file_name(local).contains('.') {
        FileKind::Directory
    } else {
        FileKind::File
    }
}

/// Writes a fetch outcome into `fs` at `local`. Absent outcomes leave the tree
/// untouched and return `None`.
pub fn apply(fs: &dyn LocalFs, local: &str, outcome: &FetchOutcome) -> FsResult<Option<FileKind>> {
    let (bytes, content_type) = match outcome {
        FetchOutcome::Found {
            bytes,
            content_type,
        } => (bytes, content_type),
        FetchOutcome::NotFound | FetchOutcome::TransportError(_) => return Ok(None),
    };
    match classify(content_type, local) {
        FileKind::Directory => {
            create_dir_all(fs, local)?;
            info!(path = %local, "created directory");
            Ok(Some(FileKind::Directory))
        }
        FileKind::File => {
            if let Some(parent) = parent_path(local) {
                create_dir_all(fs, parent)?;
            }
            fs.write_file(local, bytes)?;
            info!(path = %local, bytes = bytes.len(), "materialized file");
            Ok(Some(FileKind::File))
        }
    }
}
