//! Fakes shared by the cross-module tests.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
};

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::app::task_runner::{StartOutcome, TaskRunner, TaskStatus};
use crate::app::task_runner::Step;
use crate::catalog::{CatalogError, CatalogRecord, CatalogStore, CsvCatalog};
use crate::listing::{ListedItem, Listing, ListingError};
use crate::lock::CoordinationLock;
use crate::semantic::{EmbeddingError, EmbeddingProvider, Reconciler, SnapshotStore};

pub const DIMENSIONS: usize = 8;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Deterministic stand-in for an embedding: distinct inputs land on distinct
/// points.
pub fn fake_vector(bytes: &[u8]) -> Vec<f32> {
    Sha256::digest(bytes)
        .iter()
        .take(DIMENSIONS)
        .map(|b| *b as f32 / 255.0)
        .collect()
}

/// Embeds by hashing. Inputs starting with `corrupt` fail like an
/// undecodable image would.
#[derive(Default)]
pub struct FakeEmbedder {
    pub image_calls: AtomicUsize,
    pub text_calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake/model"
    }

    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        if bytes.starts_with(b"corrupt") {
            return Err(EmbeddingError::InvalidImage("corrupt".to_string()));
        }
        Ok(fake_vector(bytes))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        Ok(fake_vector(text.as_bytes()))
    }
}

struct Gate {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

/// In-memory listing: path -> (content, modified).
#[derive(Default)]
pub struct MemoryListing {
    files: Mutex<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
    gate: Mutex<Option<Gate>>,
}

impl MemoryListing {
    pub fn put(&self, path: &str, content: &[u8], modified: DateTime<Utc>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (content.to_vec(), modified));
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    /// Make the next `list` call block until released. The first channel
    /// fires once `list` has been entered, sending on the second releases it.
    pub fn block_next_list(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }
}

impl Listing for MemoryListing {
    fn list(&self) -> Result<Vec<ListedItem>, ListingError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }

        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(path, (_, modified))| ListedItem {
                path: path.clone(),
                modified: *modified,
            })
            .collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ListingError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(content, _)| content.clone())
            .ok_or_else(|| ListingError::Io {
                path: path.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }
}

/// CSV catalog whose commit can be made to fail.
pub struct FlakyCatalog {
    inner: CsvCatalog,
    pub fail_commit: AtomicBool,
}

impl FlakyCatalog {
    pub fn load(path: &Path) -> Self {
        Self {
            inner: CsvCatalog::load(path).unwrap(),
            fail_commit: AtomicBool::new(false),
        }
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn paths(&self) -> Vec<(u64, String)> {
        self.inner
            .list_all()
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.path))
            .collect()
    }
}

impl CatalogStore for FlakyCatalog {
    fn insert(&self, path: &str, timestamp: DateTime<Utc>) -> Result<u64, CatalogError> {
        self.inner.insert(path, timestamp)
    }

    fn delete_all(&self) -> Result<usize, CatalogError> {
        self.inner.delete_all()
    }

    fn list_all(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
        self.inner.list_all()
    }

    fn find_by_ids(&self, ids: &[u64]) -> Result<Vec<CatalogRecord>, CatalogError> {
        self.inner.find_by_ids(ids)
    }

    fn find_by_paths(&self, paths: &[String]) -> Result<Vec<CatalogRecord>, CatalogError> {
        self.inner.find_by_paths(paths)
    }

    fn count(&self) -> Result<usize, CatalogError> {
        self.inner.count()
    }

    fn commit(&self) -> Result<(), CatalogError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(CatalogError::Commit("disk full".to_string()));
        }
        self.inner.commit()
    }

    fn rollback(&self) -> Result<(), CatalogError> {
        self.inner.rollback()
    }
}

/// A reconciler over fakes, rooted in its own temp directory.
pub struct Fixture {
    pub reconciler: Arc<Reconciler>,
    pub listing: Arc<MemoryListing>,
    pub embedder: Arc<FakeEmbedder>,
    pub catalog: Arc<FlakyCatalog>,
    pub tmp: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let listing = Arc::new(MemoryListing::default());
        let embedder = Arc::new(FakeEmbedder::default());
        let catalog = Arc::new(FlakyCatalog::load(&tmp.path().join("catalog.csv")));
        let reconciler = Self::reconciler(&tmp, &catalog, &listing, &embedder);

        Self {
            reconciler,
            listing,
            embedder,
            catalog,
            tmp,
        }
    }

    fn reconciler(
        tmp: &tempfile::TempDir,
        catalog: &Arc<FlakyCatalog>,
        listing: &Arc<MemoryListing>,
        embedder: &Arc<FakeEmbedder>,
    ) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(
            catalog.clone(),
            listing.clone(),
            embedder.clone(),
            SnapshotStore::new(tmp.path().join("index"), "fake/model"),
        ))
    }

    /// A second reconciler over the same files, as after a restart.
    pub fn reopen(&self) -> Arc<Reconciler> {
        let catalog = Arc::new(FlakyCatalog::load(&self.tmp.path().join("catalog.csv")));
        Self::reconciler(&self.tmp, &catalog, &self.listing, &self.embedder)
    }

    /// Put `name` into the listing with content derived from the name.
    pub fn put(&self, name: &str, modified: i64) {
        self.listing.put(name, name.as_bytes(), ts(modified));
    }
}

/// Run steps to completion on a fresh task runner.
pub fn run(steps: Vec<Step>) -> TaskStatus {
    let runner = TaskRunner::new(CoordinationLock::new(), std::time::Duration::from_millis(100));
    assert_eq!(runner.start("test", steps), StartOutcome::Started);
    runner.join()
}
