//! Image similarity search.
//!
//! # Architecture
//!
//! - `embeddings`: Wraps fastembed's CLIP models for image and text embeddings
//! - `classify`: Zero-shot scoring of an image against text labels
//! - `index`: Immutable in-memory index with exact Euclidean search
//! - `storage`: Binary snapshot of the index, one file per model
//! - `reconcile`: Diffs the catalog against the listing and rebuilds the index
//! - `tag_cache`: Per-session cache of uploaded query vectors

pub mod classify;
pub mod embeddings;
pub mod index;
pub mod reconcile;
pub mod storage;
pub mod tag_cache;

pub use classify::{ClassifyError, LabelScore};
pub use embeddings::{ClipEmbedder, EmbeddingError, EmbeddingProvider};
pub use index::{IndexError, Neighbor, VectorIndex};
pub use reconcile::{ReconcileError, ReconcileReport, Reconciler, SearchHit};
pub use storage::{model_slug, SnapshotError, SnapshotStore};
pub use tag_cache::{TagCache, TagCacheError};

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "clip-vit-b-32";
