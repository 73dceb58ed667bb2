use crate::{
    catalog::CatalogError,
    semantic::{ClassifyError, EmbeddingError, ReconcileError, TagCacheError},
};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("image not found: {0}")]
    NotFound(u64),

    #[error("{0}")]
    TagNotFound(#[from] TagCacheError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("classification failed: {0}")]
    Classify(ClassifyError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("reconcile error: {0}")]
    Reconcile(ReconcileError),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::NotFound(id) => AppError::NotFound(id),
            err => AppError::Reconcile(err),
        }
    }
}

impl From<ClassifyError> for AppError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::Embedding(err) => AppError::Embedding(err),
            err => AppError::Classify(err),
        }
    }
}
