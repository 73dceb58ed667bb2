//! Keeps the catalog and the vector index in step with the image listing.
//!
//! A rebuild stages all catalog changes, assembles the complete matrix, and
//! only swaps the live index once the catalog commit has succeeded. Until
//! then readers keep seeing the previous index, and a failed commit rolls
//! the catalog back so both stay consistent.
//!
//! Row `r` of the index always belongs to catalog id `r + 1`.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use anyhow::Context;
use serde::Serialize;

use crate::app::task_runner::{Flow, Step};
use crate::catalog::{CatalogError, CatalogRecord, CatalogStore};
use crate::listing::{ListedItem, Listing, ListingError};
use crate::semantic::embeddings::EmbeddingProvider;
use crate::semantic::index::{IndexError, VectorIndex};
use crate::semantic::storage::{SnapshotError, SnapshotStore};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("listing error: {0}")]
    Listing(#[from] ListingError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("no image with id {0}")]
    NotFound(u64),

    #[error("catalog assigned id {got}, expected {expected}")]
    IdOutOfOrder { expected: u64, got: u64 },

    #[error("catalog has {catalog} rows but the index has {index}")]
    RowCountMismatch { catalog: usize, index: usize },
}

/// Counts from the last completed rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Known images whose stored vector was kept.
    pub reused: usize,
    /// Known images embedded again because they changed.
    pub reembedded: usize,
    /// Images new to the catalog.
    pub added: usize,
    /// Catalog rows whose image is gone.
    pub removed: usize,
    /// Images that could not be read or embedded.
    pub rejected: usize,
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// 1-based position in the overall ranking.
    pub rank: usize,
    pub id: u64,
    pub path: String,
    pub distance: f32,
}

/// Images already in the catalog, with the vector the live index holds for
/// them (if any).
struct KnownImage {
    previous: CatalogRecord,
    listed: ListedItem,
    vector: Option<Vec<f32>>,
}

struct RefreshPlan {
    known: Vec<KnownImage>,
    new: Vec<ListedItem>,
    removed: usize,
}

pub struct Reconciler {
    catalog: Arc<dyn CatalogStore>,
    listing: Arc<dyn Listing>,
    embedder: Arc<dyn EmbeddingProvider>,
    snapshots: SnapshotStore,
    index: RwLock<Option<Arc<VectorIndex>>>,
    last_report: Mutex<Option<ReconcileReport>>,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        listing: Arc<dyn Listing>,
        embedder: Arc<dyn EmbeddingProvider>,
        snapshots: SnapshotStore,
    ) -> Self {
        Self {
            catalog,
            listing,
            embedder,
            snapshots,
            index: RwLock::new(None),
            last_report: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// The live index, if one has been built or loaded.
    pub fn index(&self) -> Option<Arc<VectorIndex>> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap_index(&self, index: Option<Arc<VectorIndex>>) {
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Load the snapshot for the current model. Returns `false` when there
    /// is no usable snapshot or it does not match the catalog, in which case
    /// the caller should rebuild.
    pub fn load_snapshot(&self) -> Result<bool, ReconcileError> {
        if !self.snapshots.exists() {
            log::warn!("no index snapshot at {}", self.snapshots.path().display());
            return Ok(false);
        }

        let index = match self.snapshots.load(&self.embedder.model_id_hash()) {
            Ok(index) => index,
            Err(SnapshotError::Io(err)) => return Err(SnapshotError::Io(err).into()),
            Err(err) => {
                log::warn!("ignoring index snapshot: {err}");
                return Ok(false);
            }
        };

        let rows = self.catalog.count()?;
        if index.len() != rows {
            log::warn!(
                "index snapshot has {} rows but the catalog has {rows}",
                index.len()
            );
            return Ok(false);
        }

        log::info!(
            "loaded index snapshot with {} rows from {}",
            index.len(),
            self.snapshots.path().display()
        );
        self.swap_index(Some(Arc::new(index)));
        Ok(true)
    }

    /// Steps that bring catalog and index in line with the listing, reusing
    /// the stored vector of every image whose timestamp did not change.
    pub fn refresh_steps(self: &Arc<Self>) -> Vec<Step> {
        let this = self.clone();
        vec![Step::deferred("Scanning images...", move || {
            let plan = this.plan_refresh()?;
            Ok(this.rebuild_steps(plan))
        })]
    }

    /// Steps that embed every listed image into an emptied catalog.
    pub fn init_steps(self: &Arc<Self>) -> Vec<Step> {
        let this = self.clone();
        vec![Step::deferred("Scanning images...", move || {
            let plan = this.plan_init()?;
            Ok(this.rebuild_steps(plan))
        })]
    }

    /// Clear everything, then initialize from scratch.
    pub fn reset_steps(self: &Arc<Self>) -> Vec<Step> {
        let mut steps = self.clear_steps();
        steps.extend(self.init_steps());
        steps
    }

    pub fn clear_steps(self: &Arc<Self>) -> Vec<Step> {
        let this = self.clone();
        vec![Step::single("Clearing catalog...", move || {
            this.clear_all()?;
            Ok(Flow::Continue)
        })]
    }

    /// Delete every catalog row, drop the index and its snapshot.
    pub fn clear_all(&self) -> Result<(), ReconcileError> {
        let removed = self.catalog.delete_all()?;
        if let Err(err) = self.catalog.commit() {
            self.rollback();
            return Err(err.into());
        }

        self.swap_index(None);
        self.snapshots.delete()?;
        log::info!("cleared {removed} catalog rows and the index");
        Ok(())
    }

    fn rollback(&self) {
        if let Err(err) = self.catalog.rollback() {
            log::error!("catalog rollback failed: {err}");
        }
    }

    fn plan_refresh(&self) -> Result<RefreshPlan, ReconcileError> {
        let listed = self.listing.list()?;
        let records = self.catalog.list_all()?;

        let catalog_paths: HashSet<&str> = records.iter().map(|r| r.path.as_str()).collect();
        let mut by_path: HashMap<String, ListedItem> = HashMap::with_capacity(listed.len());
        let mut new = Vec::new();
        for item in listed {
            if catalog_paths.contains(item.path.as_str()) {
                by_path.insert(item.path.clone(), item);
            } else {
                new.push(item);
            }
        }
        new.sort_by(|a, b| a.path.cmp(&b.path));

        let common: Vec<String> = by_path.keys().cloned().collect();
        let previous = self.catalog.find_by_paths(&common)?;

        // stored vectors are only trustworthy while the index covers the catalog
        let index = self.index().filter(|index| index.len() == records.len());
        if index.is_none() && !previous.is_empty() {
            log::warn!("live index does not match the catalog, known images will be re-embedded");
        }

        let known: Vec<KnownImage> = previous
            .into_iter()
            .filter_map(|previous| {
                let listed = by_path.remove(&previous.path)?;
                let vector = index
                    .as_ref()
                    .zip(previous.id.checked_sub(1))
                    .and_then(|(index, row)| index.row(row as usize))
                    .map(<[f32]>::to_vec);
                Some(KnownImage {
                    previous,
                    listed,
                    vector,
                })
            })
            .collect();

        let removed = records.len() - known.len();
        log::info!(
            "refresh plan: {} known, {} new, {removed} removed",
            known.len(),
            new.len()
        );

        Ok(RefreshPlan {
            known,
            new,
            removed,
        })
    }

    fn plan_init(&self) -> Result<RefreshPlan, ReconcileError> {
        let mut new = self.listing.list()?;
        new.sort_by(|a, b| a.path.cmp(&b.path));
        let removed = self.catalog.count()?;
        log::info!("init plan: {} images, {removed} rows dropped", new.len());

        Ok(RefreshPlan {
            known: Vec::new(),
            new,
            removed,
        })
    }

    fn rebuild_steps(self: &Arc<Self>, plan: RefreshPlan) -> Vec<Step> {
        let rebuild = Arc::new(Mutex::new(Rebuild::new(self.clone(), plan.removed)));

        let clear = {
            let rebuild = rebuild.clone();
            Step::single("Clearing catalog...", move || {
                lock_rebuild(&rebuild).reconciler.catalog.delete_all()?;
                Ok(Flow::Continue)
            })
        };

        let update = {
            let rebuild = rebuild.clone();
            Step::batch("Updating old images...", plan.known, move |known| {
                lock_rebuild(&rebuild).keep(known)?;
                Ok(Flow::Continue)
            })
        };

        let add = {
            let rebuild = rebuild.clone();
            Step::batch("Adding new images...", plan.new, move |item| {
                lock_rebuild(&rebuild).add(item)?;
                Ok(Flow::Continue)
            })
        };

        let finish = Step::single("Finishing up", move || {
            lock_rebuild(&rebuild).finish()?;
            Ok(Flow::Continue)
        });

        vec![clear, update, add, finish]
    }

    fn embed_item(&self, path: &str) -> anyhow::Result<Vec<f32>> {
        let bytes = self
            .listing
            .read(path)
            .with_context(|| format!("reading {path}"))?;
        self.embedder
            .embed_image(&bytes)
            .with_context(|| format!("embedding {path}"))
    }

    fn publish(&self, index: VectorIndex) {
        if let Err(err) = self
            .snapshots
            .save(&index, &self.embedder.model_id_hash())
        {
            log::error!("failed to save index snapshot: {err}");
            // a stale snapshot would no longer match the committed catalog
            if let Err(err) = self.snapshots.delete() {
                log::error!("failed to remove stale index snapshot: {err}");
            }
        }
        self.swap_index(Some(Arc::new(index)));
    }

    /// The `per_page` nearest images on 1-based `page`, nearest first.
    pub fn query(
        &self,
        target: &[f32],
        page: usize,
        per_page: usize,
    ) -> Result<Vec<SearchHit>, ReconcileError> {
        let Some(index) = self.index() else {
            log::debug!("query before the index was built");
            return Ok(Vec::new());
        };

        let page = page.max(1);
        let Some(k) = page.checked_mul(per_page) else {
            log::debug!("page {page} is past any index");
            return Ok(Vec::new());
        };
        let skip = k - per_page;
        if skip >= index.len() {
            return Ok(Vec::new());
        }
        let neighbors = index.search(target, k)?;

        let rows = self.catalog.count()? as u64;
        let ranked: Vec<(usize, u64, f32)> = neighbors
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(|(rank, n)| (rank + 1, n.row as u64 + 1, n.distance))
            .filter(|(_, id, _)| *id <= rows)
            .collect();

        let ids: Vec<u64> = ranked.iter().map(|(_, id, _)| *id).collect();
        let mut records: HashMap<u64, CatalogRecord> = self
            .catalog
            .find_by_ids(&ids)?
            .into_iter()
            .map(|record| (record.id, record))
            .collect();

        // catalog order is by id; restore the ranking
        Ok(ranked
            .into_iter()
            .filter_map(|(rank, id, distance)| {
                records.remove(&id).map(|record| SearchHit {
                    rank,
                    id,
                    path: record.path,
                    distance,
                })
            })
            .collect())
    }

    /// The stored vector of catalog entry `id`.
    pub fn vector_for_id(&self, id: u64) -> Result<Vec<f32>, ReconcileError> {
        let index = self.index().ok_or(ReconcileError::NotFound(id))?;
        id.checked_sub(1)
            .and_then(|row| index.row(row as usize))
            .map(<[f32]>::to_vec)
            .ok_or(ReconcileError::NotFound(id))
    }

    /// Images similar to catalog entry `id`, without embedding anything.
    pub fn query_id(
        &self,
        id: u64,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<SearchHit>, ReconcileError> {
        let target = self.vector_for_id(id)?;
        self.query(&target, page, per_page)
    }
}

fn lock_rebuild(rebuild: &Mutex<Rebuild>) -> std::sync::MutexGuard<'_, Rebuild> {
    rebuild.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Staged state of a running rebuild. Dropped without `finish` (error,
/// abort or panic in any step), it rolls the catalog back.
struct Rebuild {
    reconciler: Arc<Reconciler>,
    /// Row `i` is the vector of the i-th inserted record.
    vectors: Vec<Vec<f32>>,
    report: ReconcileReport,
    finished: bool,
}

impl Rebuild {
    fn new(reconciler: Arc<Reconciler>, removed: usize) -> Self {
        Self {
            reconciler,
            vectors: Vec::new(),
            report: ReconcileReport {
                removed,
                ..Default::default()
            },
            finished: false,
        }
    }

    fn keep(&mut self, known: KnownImage) -> Result<(), ReconcileError> {
        let unchanged = known.previous.timestamp == known.listed.modified;
        let (vector, timestamp) = match known.vector {
            Some(vector) if unchanged => {
                self.report.reused += 1;
                (vector, known.previous.timestamp)
            }
            _ => match self.embed(&known.listed.path) {
                Some(vector) => {
                    self.report.reembedded += 1;
                    (vector, known.listed.modified)
                }
                None => return Ok(()),
            },
        };

        self.push(&known.listed.path, timestamp, vector)
    }

    fn add(&mut self, item: ListedItem) -> Result<(), ReconcileError> {
        let Some(vector) = self.embed(&item.path) else {
            return Ok(());
        };
        self.report.added += 1;
        self.push(&item.path, item.modified, vector)
    }

    /// Embed one image; failures reject the image instead of the whole batch.
    fn embed(&mut self, path: &str) -> Option<Vec<f32>> {
        let vector = match self.reconciler.embed_item(path) {
            Ok(vector) => vector,
            Err(err) => {
                log::warn!("skipping {path}: {err:#}");
                self.report.rejected += 1;
                return None;
            }
        };

        let expected = self.vectors.first().map(Vec::len).unwrap_or(vector.len());
        if vector.is_empty() || vector.len() != expected {
            log::warn!(
                "skipping {path}: embedding has {} dimensions, expected {expected}",
                vector.len()
            );
            self.report.rejected += 1;
            return None;
        }

        Some(vector)
    }

    fn push(
        &mut self,
        path: &str,
        timestamp: chrono::DateTime<chrono::Utc>,
        vector: Vec<f32>,
    ) -> Result<(), ReconcileError> {
        let expected = self.vectors.len() as u64 + 1;
        let id = self.reconciler.catalog.insert(path, timestamp)?;
        if id != expected {
            return Err(ReconcileError::IdOutOfOrder { expected, got: id });
        }
        self.vectors.push(vector);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ReconcileError> {
        let index = VectorIndex::build(std::mem::take(&mut self.vectors))?;

        let catalog = &self.reconciler.catalog;
        let rows = catalog.count()?;
        if rows != index.len() {
            return Err(ReconcileError::RowCountMismatch {
                catalog: rows,
                index: index.len(),
            });
        }

        // on failure Drop rolls back and the previous index stays live
        catalog.commit()?;
        self.finished = true;

        self.reconciler.publish(index);
        log::info!("index rebuilt: {:?}", self.report);
        *self
            .reconciler
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(self.report.clone());
        Ok(())
    }
}

impl Drop for Rebuild {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!("rebuild did not finish, rolling back catalog changes");
            self.reconciler.rollback();
        }
    }
}
