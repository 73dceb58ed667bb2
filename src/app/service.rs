use crate::{
    app::{
        errors::AppError,
        task_runner::{StartOutcome, TaskRunner, TaskStatus},
    },
    config::Config,
    lock::{CoordinationLock, LockOptions},
    semantic::{classify, LabelScore, ReconcileReport, Reconciler, SearchHit, TagCache},
    session::SessionId,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// Result of a read that may find the index locked by a rebuild.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome<T> {
    Ready(T),
    /// The read lock could not be taken in time; try again later.
    Busy,
}

impl<T> QueryOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueryOutcome<U> {
        match self {
            QueryOutcome::Ready(value) => QueryOutcome::Ready(f(value)),
            QueryOutcome::Busy => QueryOutcome::Busy,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, QueryOutcome::Busy)
    }
}

/// An uploaded image query: the tag for later pages plus the first page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedResults {
    pub tag: String,
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub page_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tag_cache_size: usize,
    pub tag_cache_ttl: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ServiceOptions {
    fn from(config: &Config) -> Self {
        Self {
            page_size: config.query_k,
            read_timeout: Duration::from_millis(config.read_lock_timeout_ms),
            write_timeout: Duration::from_millis(config.write_lock_timeout_ms),
            tag_cache_size: config.tag_cache_size,
            tag_cache_ttl: Duration::from_secs(config.tag_cache_ttl_secs),
        }
    }
}

/// Read path and maintenance triggers over one catalog and its index.
///
/// Queries take the coordination lock for reading; maintenance runs on the
/// task runner, which holds it for writing until the task is over.
pub struct IndexService {
    reconciler: Arc<Reconciler>,
    runner: TaskRunner,
    tags: TagCache,
    options: ServiceOptions,
}

impl IndexService {
    pub fn new(reconciler: Arc<Reconciler>, options: ServiceOptions) -> Self {
        let lock = CoordinationLock::new();
        Self {
            reconciler,
            runner: TaskRunner::new(lock, options.write_timeout),
            tags: TagCache::new(options.tag_cache_size, options.tag_cache_ttl),
            options,
        }
    }

    pub fn lock(&self) -> &CoordinationLock {
        self.runner.lock()
    }

    pub fn page_size(&self) -> usize {
        self.options.page_size
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Load the stored index, or start a full rebuild when it is missing or
    /// stale. Returns whether a rebuild was started.
    pub fn open(&self) -> Result<bool, AppError> {
        if self.reconciler.load_snapshot()? {
            return Ok(false);
        }

        log::info!("index snapshot unusable, rebuilding from scratch");
        match self.start_reset() {
            StartOutcome::Started => Ok(true),
            StartOutcome::Busy => Err(anyhow::anyhow!("could not start the initial rebuild").into()),
        }
    }

    pub fn new_session(&self) -> SessionId {
        SessionId::new()
    }

    fn read<T>(
        &self,
        body: impl FnOnce() -> Result<T, AppError>,
    ) -> Result<QueryOutcome<T>, AppError> {
        let timeout = self.options.read_timeout;
        match self.lock().with_lock(LockOptions::read(Some(timeout)), body) {
            Some(result) => result.map(QueryOutcome::Ready),
            None => {
                log::debug!("read lock not acquired within {timeout:?}");
                Ok(QueryOutcome::Busy)
            }
        }
    }

    fn search(&self, target: &[f32], page: usize) -> Result<QueryOutcome<Vec<SearchHit>>, AppError> {
        self.read(|| Ok(self.reconciler.query(target, page, self.options.page_size)?))
    }

    pub fn query_text(
        &self,
        text: &str,
        page: usize,
    ) -> Result<QueryOutcome<Vec<SearchHit>>, AppError> {
        log::info!("text query {text:?} page {page}");
        // the model is not guarded by the lock
        let target = self.reconciler.embedder().embed_text(text)?;
        self.search(&target, page)
    }

    /// Embed an uploaded image, remember its vector for this session and
    /// return the first page.
    pub fn query_image(
        &self,
        bytes: &[u8],
        session_id: &str,
    ) -> Result<QueryOutcome<TaggedResults>, AppError> {
        let target = self.reconciler.embedder().embed_image(bytes)?;
        let tag = self.tags.add(target.clone(), session_id);
        log::info!("image query tagged {tag} for session {session_id}");

        Ok(self
            .search(&target, 1)?
            .map(|results| TaggedResults { tag, results }))
    }

    /// A further page of an earlier image query.
    pub fn query_tag(
        &self,
        tag: &str,
        session_id: &str,
        page: usize,
    ) -> Result<QueryOutcome<Vec<SearchHit>>, AppError> {
        let target = self.tags.get(tag, session_id)?;
        self.search(&target, page)
    }

    /// Images similar to the catalog entry `id`.
    pub fn query_id(&self, id: u64, page: usize) -> Result<QueryOutcome<Vec<SearchHit>>, AppError> {
        self.read(|| {
            Ok(self
                .reconciler
                .query_id(id, page, self.options.page_size)?)
        })
    }

    /// Zero-shot classification of an uploaded image against `labels`.
    /// Independent of the index, so it also answers during rebuilds.
    pub fn classify(&self, bytes: &[u8], labels: &[String]) -> Result<Vec<LabelScore>, AppError> {
        log::info!("classifying against {} labels", labels.len());
        Ok(classify::classify(
            self.reconciler.embedder().as_ref(),
            bytes,
            labels,
        )?)
    }

    pub fn status(&self) -> TaskStatus {
        self.runner.status()
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.reconciler.last_report()
    }

    pub fn start_refresh(&self) -> StartOutcome {
        self.runner
            .start("Refreshing index", self.reconciler.refresh_steps())
    }

    pub fn start_init(&self) -> StartOutcome {
        self.runner
            .start("Building index", self.reconciler.init_steps())
    }

    pub fn start_reset(&self) -> StartOutcome {
        self.runner
            .start("Rebuilding index", self.reconciler.reset_steps())
    }

    pub fn start_clear(&self) -> StartOutcome {
        self.runner
            .start("Clearing index", self.reconciler.clear_steps())
    }

    /// Wait for the running task, if any.
    pub fn join(&self) -> TaskStatus {
        self.runner.join()
    }
}
