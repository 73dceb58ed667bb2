//! Catalog of indexed images.
//!
//! Every record's `id` doubles as its row in the vector index (`id - 1`), so
//! stores must hand out ids in insertion order and restart from 1 once the
//! table is emptied.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: u64,
    /// Path relative to the images root, `/`-separated.
    pub path: String,
    /// Last-modified time of the file when the record was inserted.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed catalog row {row}: {reason}")]
    Malformed { row: usize, reason: String },

    #[error("path already in catalog: {0}")]
    Duplicate(String),

    #[error("commit failed: {0}")]
    Commit(String),
}

/// Transactional catalog persistence.
///
/// Mutations are staged until [`commit`](CatalogStore::commit); reads observe
/// the staged state. [`rollback`](CatalogStore::rollback) discards everything
/// since the last commit.
pub trait CatalogStore: Send + Sync {
    fn insert(&self, path: &str, timestamp: DateTime<Utc>) -> Result<u64, CatalogError>;
    fn delete_all(&self) -> Result<usize, CatalogError>;
    /// All records ordered by id.
    fn list_all(&self) -> Result<Vec<CatalogRecord>, CatalogError>;
    /// Records with the given ids, ordered by id. Unknown ids are skipped.
    fn find_by_ids(&self, ids: &[u64]) -> Result<Vec<CatalogRecord>, CatalogError>;
    /// Records with the given paths, ordered by id. Unknown paths are skipped.
    fn find_by_paths(&self, paths: &[String]) -> Result<Vec<CatalogRecord>, CatalogError>;
    fn count(&self) -> Result<usize, CatalogError>;
    fn commit(&self) -> Result<(), CatalogError>;
    fn rollback(&self) -> Result<(), CatalogError>;
}

#[derive(Debug, Default)]
struct Tables {
    committed: Vec<CatalogRecord>,
    working: Vec<CatalogRecord>,
}

/// Catalog kept in a CSV file, rewritten atomically on commit.
#[derive(Debug)]
pub struct CsvCatalog {
    tables: Mutex<Tables>,
    path: PathBuf,
}

const CSV_HEADERS: [&str; 3] = ["id", "path", "timestamp"];

impl CsvCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref().to_path_buf();

        if let Err(err) = std::fs::metadata(&path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new catalog at {}", path.display());
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut csv_wrt = csv::Writer::from_path(&path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(&path)?;

        let mut records: Vec<CatalogRecord> = vec![];
        for (row, record) in csv_reader.records().enumerate() {
            let record = record?;
            let malformed = |reason: &str| CatalogError::Malformed {
                row: row + 1,
                reason: reason.to_string(),
            };

            let id = record
                .get(0)
                .ok_or_else(|| malformed("missing id"))?
                .parse::<u64>()
                .map_err(|_| malformed("id is not an integer"))?;
            let path = record
                .get(1)
                .ok_or_else(|| malformed("missing path"))?
                .to_string();
            let timestamp = record.get(2).ok_or_else(|| malformed("missing timestamp"))?;
            let timestamp = DateTime::parse_from_rfc3339(timestamp)
                .map_err(|_| malformed("timestamp is not RFC 3339"))?
                .with_timezone(&Utc);

            if records.last().is_some_and(|last| last.id >= id) {
                return Err(malformed("ids are not strictly increasing"));
            }

            records.push(CatalogRecord {
                id,
                path,
                timestamp,
            });
        }

        log::debug!(
            "took {}ms to read catalog ({} rows)",
            now.elapsed().as_micros() as f64 / 1000.0,
            records.len()
        );

        Ok(Self {
            tables: Mutex::new(Tables {
                committed: records.clone(),
                working: records,
            }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_file(&self, records: &[CatalogRecord]) -> Result<(), CatalogError> {
        let temp_path = self.path.with_extension("csv-tmp");

        let write = || -> Result<(), CatalogError> {
            let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
            csv_wrt.write_record(CSV_HEADERS)?;
            for record in records {
                csv_wrt.write_record([
                    record.id.to_string(),
                    record.path.clone(),
                    record
                        .timestamp
                        .to_rfc3339_opts(SecondsFormat::AutoSi, true),
                ])?;
            }
            csv_wrt.flush()?;
            Ok(())
        };

        if let Err(err) = write() {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl CatalogStore for CsvCatalog {
    fn insert(&self, path: &str, timestamp: DateTime<Utc>) -> Result<u64, CatalogError> {
        let mut tables = self.tables();

        if tables.working.iter().any(|record| record.path == path) {
            return Err(CatalogError::Duplicate(path.to_string()));
        }

        let id = tables.working.last().map(|record| record.id + 1).unwrap_or(1);
        tables.working.push(CatalogRecord {
            id,
            path: path.to_string(),
            timestamp,
        });

        Ok(id)
    }

    fn delete_all(&self) -> Result<usize, CatalogError> {
        let mut tables = self.tables();
        let removed = tables.working.len();
        tables.working.clear();
        Ok(removed)
    }

    fn list_all(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
        Ok(self.tables().working.clone())
    }

    fn find_by_ids(&self, ids: &[u64]) -> Result<Vec<CatalogRecord>, CatalogError> {
        let ids: HashSet<u64> = ids.iter().copied().collect();
        Ok(self
            .tables()
            .working
            .iter()
            .filter(|record| ids.contains(&record.id))
            .cloned()
            .collect())
    }

    fn find_by_paths(&self, paths: &[String]) -> Result<Vec<CatalogRecord>, CatalogError> {
        let paths: HashSet<&str> = paths.iter().map(String::as_str).collect();
        Ok(self
            .tables()
            .working
            .iter()
            .filter(|record| paths.contains(record.path.as_str()))
            .cloned()
            .collect())
    }

    fn count(&self) -> Result<usize, CatalogError> {
        Ok(self.tables().working.len())
    }

    fn commit(&self) -> Result<(), CatalogError> {
        let mut tables = self.tables();
        self.write_file(&tables.working)?;
        tables.committed = tables.working.clone();
        log::debug!("committed catalog with {} rows", tables.committed.len());
        Ok(())
    }

    fn rollback(&self) -> Result<(), CatalogError> {
        let mut tables = self.tables();
        tables.working = tables.committed.clone();
        log::debug!("rolled back catalog to {} rows", tables.working.len());
        Ok(())
    }
}
